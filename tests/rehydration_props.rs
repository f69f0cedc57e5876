//! Property tests for index-key rehydration.
//!
//! For any key pattern and any component values, rebuilding the document
//! from the scanned key slots must make every pattern path extractable
//! again — except paths dominated by a strictly shorter prefix in the
//! same pattern, which the shorter binding subsumes.

use proptest::prelude::*;
use slotplan::builder::StageBuilder;
use slotplan::catalog::{CollectionCatalog, IndexEntry, KeyPattern};
use slotplan::config::BuilderConfig;
use slotplan::context::{CanonicalQuery, OperationContext};
use slotplan::expr::{BuiltinFn, Expr};
use slotplan::physical::PhysOp;
use slotplan::reqs::{PlanNodeReqs, SlotName};
use slotplan::slots::SlotId;
use slotplan::solution::{
    IndexBounds, IndexScanSol, QuerySolution, ScanDirection, SolutionKind, SolutionNode,
};
use slotplan::value::Val;
use std::collections::HashMap;

const NS: &str = "test.coll";

/// Evaluate the restricted expression shape rehydration produces:
/// `newObj` calls over slot variables and nested `newObj`s.
fn eval_obj_expr(expr: &Expr, slot_values: &HashMap<SlotId, Val>) -> Val {
    match expr {
        Expr::SlotVar(slot) => slot_values
            .get(slot)
            .cloned()
            .unwrap_or(Val::Nothing),
        Expr::Constant(val) => val.clone(),
        Expr::Function {
            function: BuiltinFn::NewObj,
            args,
        } => {
            let mut doc = slotplan::value::Document::new();
            for pair in args.chunks(2) {
                let Expr::Constant(Val::String(name)) = &pair[0] else {
                    panic!("newObj field name must be a string constant");
                };
                doc.push(name.clone(), eval_obj_expr(&pair[1], slot_values));
            }
            Val::Object(doc)
        }
        other => panic!("unexpected expression in rehydration output: {other}"),
    }
}

fn path_strategy() -> impl Strategy<Value = String> {
    proptest::collection::vec(
        proptest::sample::select(vec!["a", "b", "c", "d"]),
        1..4,
    )
    .prop_map(|components| components.join("."))
}

fn pattern_strategy() -> impl Strategy<Value = Vec<String>> {
    proptest::collection::vec(path_strategy(), 1..5).prop_map(|mut paths| {
        // Distinct paths only; duplicate components across paths are
        // still allowed (and produce the interesting prefix cases).
        let mut seen = Vec::new();
        paths.retain(|path| {
            if seen.contains(path) {
                false
            } else {
                seen.push(path.clone());
                true
            }
        });
        paths
    })
}

fn is_dominated(path: &str, pattern: &[String]) -> bool {
    pattern.iter().any(|other| {
        other != path && path.starts_with(other.as_str()) && path.as_bytes()[other.len()] == b'.'
    })
}

proptest! {
    #[test]
    fn rehydrated_object_roundtrips_every_undominated_path(paths in pattern_strategy()) {
        let op_ctx = OperationContext::new();
        let query = CanonicalQuery::simple(NS);
        let spec: Vec<(&str, i32)> = paths.iter().map(|p| (p.as_str(), 1)).collect();

        let mut catalog = CollectionCatalog::new();
        catalog.register_index(NS, IndexEntry {
            name: "under_test".to_string(),
            key_pattern: KeyPattern::parse(&spec),
            fts: None,
        });

        let solution = QuerySolution::new(SolutionNode::new(
            1,
            SolutionKind::IndexScan(IndexScanSol {
                index_name: "under_test".to_string(),
                key_pattern: KeyPattern::parse(&spec),
                bounds: IndexBounds::default(),
                direction: ScanDirection::Forward,
            }),
        ));

        let builder = StageBuilder::new(&op_ctx, &query, &catalog, BuilderConfig::default())
            .expect("builder");
        let reqs = PlanNodeReqs::new().set(SlotName::Result);
        let (root, _) = builder.build_tree(&solution, &reqs).expect("lowering");

        // The root is the rehydration projection over the index scan.
        let PhysOp::Project { input, assignments } = &root.op else {
            panic!("expected rehydration projection");
        };
        let PhysOp::IxScan { key_slots, .. } = &input.op else {
            panic!("expected ixscan");
        };

        // Give each pattern component a distinct scalar.
        let slot_values: HashMap<SlotId, Val> = key_slots
            .iter()
            .map(|(pos, slot)| (*slot, Val::Int64(*pos as i64 * 10 + 1)))
            .collect();

        let rebuilt = eval_obj_expr(&assignments[0].1, &slot_values);

        for (pos, path) in paths.iter().enumerate() {
            let extracted = rebuilt.get_path(path);
            if is_dominated(path, &paths) {
                // The shorter prefix binding holds a scalar here, so
                // the longer path is no longer addressable.
                prop_assert_eq!(extracted, None, "path {} should be dominated", path);
            } else {
                prop_assert_eq!(
                    extracted,
                    Some(&Val::Int64(pos as i64 * 10 + 1)),
                    "path {} should round-trip",
                    path
                );
            }
        }
    }
}
