//! Sort Lowering Tests
//!
//! Regime selection, sort-key traversal shapes, the parallel-arrays
//! guard, collation mapping, and sort resource limits.

use slotplan::builder::StageBuilder;
use slotplan::catalog::CollectionCatalog;
use slotplan::config::BuilderConfig;
use slotplan::context::{CanonicalQuery, Collation, OperationContext};
use slotplan::error::BuildError;
use slotplan::physical::{PhysOp, PhysStage, SortDir};
use slotplan::solution::{
    CollectionScanSol, QuerySolution, SolutionKind, SolutionNode, SortPattern,
};

const NS: &str = "test.coll";

fn collscan(id: u32) -> SolutionNode {
    SolutionNode::new(
        id,
        SolutionKind::CollectionScan(CollectionScanSol::default()),
    )
}

fn sort_default(id: u32, child: SolutionNode, spec: &[(&str, i32)]) -> QuerySolution {
    QuerySolution::new(SolutionNode::new(
        id,
        SolutionKind::SortDefault {
            child: Box::new(child),
            pattern: SortPattern::parse(spec),
            limit: None,
        },
    ))
}

fn lower(query: &CanonicalQuery, solution: &QuerySolution) -> (PhysStage, slotplan::PlanStageData) {
    let op_ctx = OperationContext::new();
    let catalog = CollectionCatalog::new();
    let builder =
        StageBuilder::new(&op_ctx, query, &catalog, BuilderConfig::default()).expect("builder");
    builder.build_root(solution).expect("lowering")
}

fn find_op<'a>(stage: &'a PhysStage, name: &str) -> Option<&'a PhysStage> {
    if stage.op_name() == name {
        return Some(stage);
    }
    stage
        .children()
        .into_iter()
        .find_map(|child| find_op(child, name))
}

#[test]
fn test_two_part_sort_uses_fast_regime_with_guard() {
    let query = CanonicalQuery::simple(NS);
    let solution = sort_default(2, collscan(1), &[("a", 1), ("b", -1)]);
    let (root, _) = lower(&query, &solution);

    let PhysOp::Sort {
        order_by,
        dirs,
        limit: None,
        ..
    } = &root.op
    else {
        panic!("expected sort at the root, got:\n{}", root.explain());
    };
    assert_eq!(order_by.len(), 2);
    assert_eq!(dirs, &vec![SortDir::Asc, SortDir::Desc]);

    // The guard reads the two extracted field slots.
    let guard = find_op(&root, "filter").expect("parallel-arrays guard");
    let PhysOp::Filter { predicate, .. } = &guard.op else {
        unreachable!();
    };
    assert_eq!(
        predicate.to_string(),
        format!(
            "((!isArray({}) || !isArray({})) || fail(2, \"cannot sort with keys that are parallel arrays\"))",
            order_by[0], order_by[1]
        )
    );

    // Field extraction fills missing fields with null.
    let project = find_op(&root, "project").expect("field extraction");
    let PhysOp::Project { assignments, .. } = &project.op else {
        unreachable!();
    };
    assert!(assignments[0]
        .1
        .to_string()
        .starts_with("fillEmpty(getField("));
    assert!(assignments[0].1.to_string().ends_with(", null)"));
}

#[test]
fn test_three_part_guard_sums_arrayness() {
    let query = CanonicalQuery::simple(NS);
    let solution = sort_default(2, collscan(1), &[("a", 1), ("b", 1), ("c", 1)]);
    let (root, _) = lower(&query, &solution);

    let guard = find_op(&root, "filter").expect("guard");
    let PhysOp::Filter { predicate, .. } = &guard.op else {
        unreachable!();
    };
    let printed = predicate.to_string();
    assert!(printed.contains("<= 1"));
    assert!(printed.contains('+'));
}

#[test]
fn test_single_part_sort_has_no_guard() {
    let query = CanonicalQuery::simple(NS);
    let solution = sort_default(2, collscan(1), &[("a", 1)]);
    let (root, _) = lower(&query, &solution);

    assert!(find_op(&root, "filter").is_none());
    let PhysOp::Sort { order_by, .. } = &root.op else {
        panic!("expected sort, got:\n{}", root.explain());
    };
    assert_eq!(order_by.len(), 1);
}

#[test]
fn test_shared_prefixes_select_slow_regime() {
    let query = CanonicalQuery::simple(NS);
    let solution = sort_default(2, collscan(1), &[("a.b", 1), ("a.c", 1)]);
    let (root, _) = lower(&query, &solution);

    let PhysOp::Sort { order_by, dirs, .. } = &root.op else {
        panic!("expected sort, got:\n{}", root.explain());
    };
    // One opaque sort key carrying the whole spec.
    assert_eq!(order_by.len(), 1);
    assert_eq!(dirs, &vec![SortDir::Asc]);

    let project = find_op(&root, "project").expect("sort key projection");
    let PhysOp::Project { input, assignments } = &project.op else {
        unreachable!();
    };
    let PhysOp::CollScan { result_slot, .. } = &input.op else {
        panic!("expected collscan beneath the sort key projection");
    };
    let result_slot = result_slot.expect("result slot");
    assert_eq!(
        assignments[0].1.to_string(),
        format!("generateSortKey(<sortSpec>, {result_slot})")
    );
    assert!(find_op(&root, "traverse").is_none());
}

#[test]
fn test_distinct_top_level_prefixes_stay_fast() {
    let query = CanonicalQuery::simple(NS);
    let solution = sort_default(2, collscan(1), &[("a.b", 1), ("c", 1)]);
    let (root, _) = lower(&query, &solution);

    let PhysOp::Sort { order_by, .. } = &root.op else {
        panic!("expected sort, got:\n{}", root.explain());
    };
    assert_eq!(order_by.len(), 2, "fast regime keeps one key per part");
}

#[test]
fn test_nested_path_builds_traversal_chain() {
    let query = CanonicalQuery::simple(NS);
    let solution = sort_default(2, collscan(1), &[("a.b.c", 1)]);
    let (root, _) = lower(&query, &solution);

    // Two nested levels below the top field: two traverse stages.
    let mut count = 0;
    fn count_traverse(stage: &PhysStage, count: &mut usize) {
        if stage.op_name() == "traverse" {
            *count += 1;
        }
        for child in stage.children() {
            count_traverse(child, count);
        }
    }
    count_traverse(&root, &mut count);
    assert_eq!(count, 2);

    // The outermost traverse handles the leaf level.
    let leaf = find_op(&root, "traverse").expect("traverse");
    let PhysOp::Traverse {
        outer,
        fold,
        final_expr,
        ..
    } = &leaf.op
    else {
        unreachable!();
    };
    // Ascending fold keeps the minimum via three-way compare.
    let fold = fold.as_ref().expect("fold");
    assert!(fold.to_string().contains("<=>"));
    assert!(fold.to_string().contains("< 0"));
    // Leaf policy: empty array becomes undefined.
    assert!(final_expr
        .as_ref()
        .expect("final")
        .to_string()
        .ends_with(", undefined)"));

    // The intermediate level beneath it folds empty/missing to null.
    let PhysOp::Traverse {
        final_expr: mid_final,
        ..
    } = &outer.op
    else {
        panic!("expected the intermediate traverse level");
    };
    assert!(mid_final
        .as_ref()
        .expect("final")
        .to_string()
        .ends_with(", null)"));
}

#[test]
fn test_descending_nested_part_keeps_maximum() {
    let query = CanonicalQuery::simple(NS);
    let solution = sort_default(2, collscan(1), &[("a.b", -1)]);
    let (root, _) = lower(&query, &solution);

    let traverse = find_op(&root, "traverse").expect("traverse");
    let PhysOp::Traverse {
        fold, final_expr, ..
    } = &traverse.op
    else {
        unreachable!();
    };
    assert!(fold.as_ref().expect("fold").to_string().contains("> 0"));
    // Leaf level: an empty array sorts as undefined.
    assert!(final_expr
        .as_ref()
        .expect("final")
        .to_string()
        .ends_with(", undefined)"));
}

#[test]
fn test_collation_maps_leaf_values() {
    let mut query = CanonicalQuery::simple(NS);
    query.collation = Some(Collation {
        locale: "en_US".to_string(),
    });
    let solution = sort_default(2, collscan(1), &[("a", 1)]);
    let (root, _) = lower(&query, &solution);

    let project = find_op(&root, "project").expect("collation projection");
    let PhysOp::Project { assignments, .. } = &project.op else {
        unreachable!();
    };
    assert!(assignments
        .iter()
        .any(|(_, expr)| expr.to_string().starts_with("collComparisonKey(")));
}

#[test]
fn test_sort_limit_and_resource_caps_flow_into_the_stage() {
    let op_ctx = OperationContext::new();
    let query = CanonicalQuery::simple(NS);
    let catalog = CollectionCatalog::new();
    let mut config = BuilderConfig::default();
    config.sort.memory_limit_bytes = 1024;
    config.sort.allow_disk_use = true;

    let solution = QuerySolution::new(SolutionNode::new(
        2,
        SolutionKind::SortDefault {
            child: Box::new(collscan(1)),
            pattern: SortPattern::parse(&[("a", 1)]),
            limit: Some(5),
        },
    ));

    let builder = StageBuilder::new(&op_ctx, &query, &catalog, config).expect("builder");
    let (root, _) = builder.build_root(&solution).expect("lowering");

    let PhysOp::Sort {
        limit,
        memory_limit_bytes,
        allow_disk_use,
        ..
    } = &root.op
    else {
        panic!("expected sort, got:\n{}", root.explain());
    };
    assert_eq!(*limit, Some(5));
    assert_eq!(*memory_limit_bytes, 1024);
    assert!(*allow_disk_use);
}

#[test]
fn test_simple_sort_skips_traversal_and_guard() {
    let op_ctx = OperationContext::new();
    let query = CanonicalQuery::simple(NS);
    let catalog = CollectionCatalog::new();

    let solution = QuerySolution::new(SolutionNode::new(
        2,
        SolutionKind::SortSimple {
            child: Box::new(collscan(1)),
            pattern: SortPattern::parse(&[("a.b", 1), ("c", -1)]),
            limit: None,
        },
    ));

    let builder =
        StageBuilder::new(&op_ctx, &query, &catalog, BuilderConfig::default()).expect("builder");
    let (root, _) = builder.build_root(&solution).expect("lowering");

    assert!(find_op(&root, "traverse").is_none());
    assert!(find_op(&root, "filter").is_none());
    let PhysOp::Sort { order_by, dirs, .. } = &root.op else {
        panic!("expected sort, got:\n{}", root.explain());
    };
    assert_eq!(order_by.len(), 2);
    assert_eq!(dirs, &vec![SortDir::Asc, SortDir::Desc]);
}

#[test]
fn test_empty_sort_pattern_is_a_contract_violation() {
    let op_ctx = OperationContext::new();
    let query = CanonicalQuery::simple(NS);
    let catalog = CollectionCatalog::new();

    let solution = QuerySolution::new(SolutionNode::new(
        2,
        SolutionKind::SortDefault {
            child: Box::new(collscan(1)),
            pattern: SortPattern::new(vec![]),
            limit: None,
        },
    ));

    let builder =
        StageBuilder::new(&op_ctx, &query, &catalog, BuilderConfig::default()).expect("builder");
    let err = builder.build_root(&solution).expect_err("must fail");
    assert!(matches!(err, BuildError::Contract { tag: 75_097, .. }));
}
