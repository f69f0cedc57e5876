//! Shard Filter Tests
//!
//! Covered-path optimization (shard key assembled from index key slots,
//! no fetch) and the document-based fallback with its all-components
//! check.

use slotplan::builder::StageBuilder;
use slotplan::catalog::{
    CollectionCatalog, IndexEntry, KeyPattern, KeyPatternPart,
};
use slotplan::config::BuilderConfig;
use slotplan::context::{AlwaysOwnedFilterer, CanonicalQuery, OperationContext};
use slotplan::error::BuildError;
use slotplan::physical::{PhysOp, PhysStage};
use slotplan::reqs::{IndexKeyBitset, PlanNodeReqs, SlotName};
use slotplan::solution::{
    IndexBounds, IndexScanSol, QuerySolution, ScanDirection, SolutionKind, SolutionNode,
};

const NS: &str = "test.coll";

fn catalog_with(indexes: &[(&str, &[(&str, i32)])]) -> CollectionCatalog {
    let mut catalog = CollectionCatalog::new();
    catalog.register_collection(NS);
    for (name, spec) in indexes {
        catalog.register_index(
            NS,
            IndexEntry {
                name: (*name).to_string(),
                key_pattern: KeyPattern::parse(spec),
                fts: None,
            },
        );
    }
    catalog
}

fn ixscan(id: u32, index_name: &str, spec: &[(&str, i32)]) -> SolutionNode {
    SolutionNode::new(
        id,
        SolutionKind::IndexScan(IndexScanSol {
            index_name: index_name.to_string(),
            key_pattern: KeyPattern::parse(spec),
            bounds: IndexBounds::default(),
            direction: ScanDirection::Forward,
        }),
    )
}

fn shard_filter(id: u32, child: SolutionNode, shard_key: KeyPattern) -> QuerySolution {
    QuerySolution::new(SolutionNode::new(
        id,
        SolutionKind::ShardingFilter {
            child: Box::new(child),
            shard_key,
        },
    ))
}

fn count_ops(stage: &PhysStage, name: &str) -> usize {
    let own = usize::from(stage.op_name() == name);
    own + stage
        .children()
        .iter()
        .map(|child| count_ops(child, name))
        .sum::<usize>()
}

#[test]
fn test_covered_path_scans_only_shard_key_components() {
    let op_ctx = OperationContext::new();
    let query = CanonicalQuery::simple(NS);
    let catalog = catalog_with(&[("ab", &[("a", 1), ("b", 1)])]);
    let factory = AlwaysOwnedFilterer;

    let solution = shard_filter(
        2,
        ixscan(1, "ab", &[("a", 1), ("b", 1)]),
        KeyPattern::parse(&[("a", 1)]),
    );

    let builder = StageBuilder::new(&op_ctx, &query, &catalog, BuilderConfig::default())
        .expect("builder")
        .with_shard_filterer_factory(&factory);
    let (root, data) = builder
        .build_tree(&solution, &PlanNodeReqs::new())
        .expect("lowering");

    // No fetch: the row never becomes a document.
    assert_eq!(count_ops(&root, "collscan"), 0);
    assert_eq!(count_ops(&root, "nlj"), 0);

    let PhysOp::Filter { input, predicate, .. } = &root.op else {
        panic!("expected shard filter, got:\n{}", root.explain());
    };
    assert!(predicate.to_string().starts_with("shardFilter(<shardFilterer>"));

    let PhysOp::MakeObj {
        input: scan,
        projected,
        root_slot: None,
        ..
    } = &input.op
    else {
        panic!("expected shard-key make-object");
    };
    assert_eq!(projected.len(), 1);
    assert_eq!(projected[0].0, "a");

    // Only the shard-key component was scanned.
    let PhysOp::IxScan { key_slots, .. } = &scan.op else {
        panic!("expected ixscan");
    };
    assert_eq!(key_slots.len(), 1);
    assert_eq!(key_slots[0].0, 0, "component position of 'a'");
    assert_eq!(projected[0].1, key_slots[0].1);

    // Parent asked for nothing, parent gets nothing.
    assert_eq!(data.out_slots.get(SlotName::Result), None);
    assert_eq!(data.out_slots.get(SlotName::RecordId), None);
}

#[test]
fn test_covered_path_narrows_visible_key_slots_to_parent_bitset() {
    let op_ctx = OperationContext::new();
    let query = CanonicalQuery::simple(NS);
    let catalog = catalog_with(&[("ab", &[("a", 1), ("b", 1)])]);
    let factory = AlwaysOwnedFilterer;

    let solution = shard_filter(
        2,
        ixscan(1, "ab", &[("a", 1), ("b", 1)]),
        KeyPattern::parse(&[("a", 1)]),
    );

    // Parent wants only component 1 ("b"); the shard key needs
    // component 0 ("a"); the scan must produce both, the parent must
    // see only "b".
    let reqs = PlanNodeReqs::new().with_index_key_bitset(IndexKeyBitset::new(2).set(1));
    let builder = StageBuilder::new(&op_ctx, &query, &catalog, BuilderConfig::default())
        .expect("builder")
        .with_shard_filterer_factory(&factory);
    let (root, data) = builder.build_tree(&solution, &reqs).expect("lowering");

    let mut scanned = None;
    fn find_ixscan(stage: &PhysStage) -> Option<&PhysStage> {
        if stage.op_name() == "ixscan" {
            return Some(stage);
        }
        stage.children().into_iter().find_map(find_ixscan)
    }
    if let Some(stage) = find_ixscan(&root) {
        if let PhysOp::IxScan { key_slots, .. } = &stage.op {
            scanned = Some(key_slots.clone());
        }
    }
    let scanned = scanned.expect("ixscan in tree");
    assert_eq!(scanned.len(), 2, "union of parent and shard-key bits");

    let visible = data.out_slots.index_key_slots().expect("visible key slots");
    assert_eq!(visible.len(), 1);
    // The visible slot is exactly the slot scanned for component 1.
    let slot_for_b = scanned
        .iter()
        .find(|(pos, _)| *pos == 1)
        .map(|(_, slot)| *slot)
        .expect("component 1 scanned");
    assert_eq!(visible[0], slot_for_b);
}

#[test]
fn test_covered_path_hashes_hashed_components() {
    let op_ctx = OperationContext::new();
    let query = CanonicalQuery::simple(NS);
    let catalog = catalog_with(&[("a_hashed", &[("a", 1)])]);
    let factory = AlwaysOwnedFilterer;

    let solution = shard_filter(
        2,
        ixscan(1, "a_hashed", &[("a", 1)]),
        KeyPattern::new(vec![KeyPatternPart::hashed("a")]),
    );

    let builder = StageBuilder::new(&op_ctx, &query, &catalog, BuilderConfig::default())
        .expect("builder")
        .with_shard_filterer_factory(&factory);
    let (root, _) = builder
        .build_tree(&solution, &PlanNodeReqs::new())
        .expect("lowering");

    let PhysOp::Filter { input, .. } = &root.op else {
        panic!("expected shard filter, got:\n{}", root.explain());
    };
    let PhysOp::MakeObj { input: hashed, projected, .. } = &input.op else {
        panic!("expected make-object");
    };
    let PhysOp::Project { assignments, .. } = &hashed.op else {
        panic!("expected shardHash projection");
    };
    assert!(assignments[0].1.to_string().starts_with("shardHash("));
    assert_eq!(projected[0].1, assignments[0].0);
}

#[test]
fn test_fallback_binds_components_from_the_document() {
    let op_ctx = OperationContext::new();
    let query = CanonicalQuery::simple(NS);
    let catalog = catalog_with(&[("a_1", &[("a", 1)])]);
    let factory = AlwaysOwnedFilterer;

    // The child is a fetch, not an index scan: no covered path.
    let fetch = SolutionNode::new(
        2,
        SolutionKind::Fetch {
            child: Box::new(ixscan(1, "a_1", &[("a", 1)])),
            filter: None,
        },
    );
    let solution = shard_filter(
        3,
        fetch,
        KeyPattern::parse(&[("a.b", 1), ("c", 1)]),
    );

    let reqs = PlanNodeReqs::new().set(SlotName::Result);
    let builder = StageBuilder::new(&op_ctx, &query, &catalog, BuilderConfig::default())
        .expect("builder")
        .with_shard_filterer_factory(&factory);
    let (root, data) = builder.build_tree(&solution, &reqs).expect("lowering");

    let PhysOp::Filter { input, predicate, .. } = &root.op else {
        panic!("expected shard filter, got:\n{}", root.explain());
    };
    assert!(predicate.to_string().starts_with("shardFilter(<shardFilterer>"));

    // The shard key object is guarded by the all-components-exist
    // check and collapses to Nothing otherwise.
    let PhysOp::Project { input: bindings, assignments } = &input.op else {
        panic!("expected shard-key projection");
    };
    let key_expr = assignments[0].1.to_string();
    assert!(key_expr.starts_with("if((exists("));
    assert!(key_expr.contains("newObj(\"a.b\""));
    assert!(key_expr.ends_with("Nothing)"));

    // Nested path binding guards against arrays at non-terminal
    // positions.
    let PhysOp::Project { assignments: components, .. } = &bindings.op else {
        panic!("expected component bindings");
    };
    let nested = components[0].1.to_string();
    assert!(nested.contains("isArray("));
    assert!(nested.contains("getField(l"));

    assert!(data.out_slots.get(SlotName::Result).is_some());
}

#[test]
fn test_result_requirement_disables_the_covered_path() {
    let op_ctx = OperationContext::new();
    let query = CanonicalQuery::simple(NS);
    let catalog = catalog_with(&[("a_1", &[("a", 1)])]);
    let factory = AlwaysOwnedFilterer;

    let solution = shard_filter(
        2,
        ixscan(1, "a_1", &[("a", 1)]),
        KeyPattern::parse(&[("a", 1)]),
    );

    let reqs = PlanNodeReqs::new().set(SlotName::Result);
    let builder = StageBuilder::new(&op_ctx, &query, &catalog, BuilderConfig::default())
        .expect("builder")
        .with_shard_filterer_factory(&factory);
    let (root, data) = builder.build_tree(&solution, &reqs).expect("lowering");

    // The ixscan rehydrates the document and the fallback path runs
    // over it.
    assert!(data.out_slots.get(SlotName::Result).is_some());
    let explain = root.explain();
    assert!(explain.contains("newObj"), "rehydration present:\n{explain}");
    assert!(explain.contains("shardFilter"));
}

#[test]
fn test_missing_factory_is_a_contract_violation() {
    let op_ctx = OperationContext::new();
    let query = CanonicalQuery::simple(NS);
    let catalog = catalog_with(&[("a_1", &[("a", 1)])]);

    let solution = shard_filter(
        2,
        ixscan(1, "a_1", &[("a", 1)]),
        KeyPattern::parse(&[("a", 1)]),
    );

    let builder = StageBuilder::new(&op_ctx, &query, &catalog, BuilderConfig::default())
        .expect("builder");
    let err = builder
        .build_tree(&solution, &PlanNodeReqs::new())
        .expect_err("must fail");
    assert!(matches!(err, BuildError::Contract { tag: 75_090, .. }));
}
