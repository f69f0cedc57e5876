//! Lowering throughput benchmarks: plain scans, fetch plans, and sorts.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use slotplan::builder::StageBuilder;
use slotplan::catalog::{CollectionCatalog, IndexEntry, KeyPattern};
use slotplan::config::BuilderConfig;
use slotplan::context::{CanonicalQuery, OperationContext};
use slotplan::solution::{
    CollectionScanSol, IndexBounds, IndexScanSol, QuerySolution, ScanDirection, SolutionKind,
    SolutionNode, SortPattern,
};

const NS: &str = "bench.coll";

fn bench_catalog(components: usize) -> (CollectionCatalog, Vec<(String, i32)>) {
    let spec: Vec<(String, i32)> = (0..components).map(|i| (format!("f{i}"), 1)).collect();
    let borrowed: Vec<(&str, i32)> = spec.iter().map(|(p, d)| (p.as_str(), *d)).collect();
    let mut catalog = CollectionCatalog::new();
    catalog.register_index(
        NS,
        IndexEntry {
            name: "bench_index".to_string(),
            key_pattern: KeyPattern::parse(&borrowed),
            fts: None,
        },
    );
    (catalog, spec)
}

fn fetch_solution(spec: &[(String, i32)]) -> QuerySolution {
    let borrowed: Vec<(&str, i32)> = spec.iter().map(|(p, d)| (p.as_str(), *d)).collect();
    QuerySolution::new(SolutionNode::new(
        2,
        SolutionKind::Fetch {
            child: Box::new(SolutionNode::new(
                1,
                SolutionKind::IndexScan(IndexScanSol {
                    index_name: "bench_index".to_string(),
                    key_pattern: KeyPattern::parse(&borrowed),
                    bounds: IndexBounds::default(),
                    direction: ScanDirection::Forward,
                }),
            )),
            filter: None,
        },
    ))
}

fn bench_fetch_plans(c: &mut Criterion) {
    let mut group = c.benchmark_group("fetch_over_ixscan");
    for components in [1usize, 4, 16] {
        let (catalog, spec) = bench_catalog(components);
        let solution = fetch_solution(&spec);
        let op_ctx = OperationContext::new();
        let query = CanonicalQuery::simple(NS);

        group.bench_with_input(
            BenchmarkId::from_parameter(components),
            &components,
            |b, _| {
                b.iter(|| {
                    let builder = StageBuilder::new(
                        &op_ctx,
                        &query,
                        &catalog,
                        BuilderConfig::default(),
                    )
                    .expect("builder");
                    builder.build_root(&solution).expect("lowering")
                });
            },
        );
    }
    group.finish();
}

fn bench_sorted_collscan(c: &mut Criterion) {
    let op_ctx = OperationContext::new();
    let query = CanonicalQuery::simple(NS);
    let catalog = CollectionCatalog::new();

    let solution = QuerySolution::new(SolutionNode::new(
        2,
        SolutionKind::SortDefault {
            child: Box::new(SolutionNode::new(
                1,
                SolutionKind::CollectionScan(CollectionScanSol::default()),
            )),
            pattern: SortPattern::parse(&[("a", 1), ("b", -1), ("c.d", 1)]),
            limit: Some(100),
        },
    ));

    c.bench_function("sorted_collscan", |b| {
        b.iter(|| {
            let builder =
                StageBuilder::new(&op_ctx, &query, &catalog, BuilderConfig::default())
                    .expect("builder");
            builder.build_root(&solution).expect("lowering")
        });
    });
}

criterion_group!(benches, bench_fetch_plans, bench_sorted_collscan);
criterion_main!(benches);
