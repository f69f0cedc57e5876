//! # Query Solution Tree
//!
//! The logical input to the stage builder: one node per logical
//! operation, produced by the upstream planner. The tree is immutable
//! during lowering; every node carries a `plan_node_id` so physical
//! stages can be traced back to the logical operation that produced them.
//!
//! ```text
//! Planner output (QuerySolution) -> [Stage Builder] -> physical stage tree
//! ```

use crate::catalog::KeyPattern;
use crate::value::Val;

/// Provenance id assigned by the planner, preserved on physical stages
pub type PlanNodeId = u32;

/// Scan direction for collection and index scans
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanDirection {
    /// Natural / forward order
    #[default]
    Forward,
    /// Reverse order
    Backward,
}

/// One part of a sort pattern: a dotted path and a direction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortPatternPart {
    /// Dotted field path
    pub path: String,
    /// True for ascending
    pub ascending: bool,
}

/// An ordered sort pattern (`{a: 1, b: -1}`)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SortPattern(Vec<SortPatternPart>);

impl SortPattern {
    /// Build a pattern from parts
    pub fn new(parts: Vec<SortPatternPart>) -> Self {
        SortPattern(parts)
    }

    /// Build a pattern from `(path, direction)` pairs; any direction
    /// other than `-1` is ascending.
    pub fn parse(spec: &[(&str, i32)]) -> Self {
        SortPattern(
            spec.iter()
                .map(|(path, dir)| SortPatternPart {
                    path: (*path).to_string(),
                    ascending: *dir != -1,
                })
                .collect(),
        )
    }

    /// Parts in pattern order
    pub fn parts(&self) -> &[SortPatternPart] {
        &self.0
    }

    /// Number of parts
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True iff the pattern has no parts
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True iff any two parts share a top-level field name. Decides the
    /// sort-key regime: shared prefixes force the slow path.
    pub fn has_common_prefixes(&self) -> bool {
        for (i, part) in self.0.iter().enumerate() {
            let top = top_level_field(&part.path);
            if self.0[i + 1..]
                .iter()
                .any(|other| top_level_field(&other.path) == top)
            {
                return true;
            }
        }
        false
    }
}

/// First component of a dotted path
pub fn top_level_field(path: &str) -> &str {
    path.split('.').next().unwrap_or(path)
}

/// Residual filter predicate attached to logical nodes. Compiled against
/// a result slot by the filter expression sub-builder.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchExpr {
    /// Path equals a literal
    Eq { path: String, value: Val },
    /// Path is less than a literal
    Lt { path: String, value: Val },
    /// Path is less than or equal to a literal
    Lte { path: String, value: Val },
    /// Path is greater than a literal
    Gt { path: String, value: Val },
    /// Path is greater than or equal to a literal
    Gte { path: String, value: Val },
    /// Path exists
    Exists { path: String },
    /// Conjunction
    And(Vec<MatchExpr>),
    /// Disjunction
    Or(Vec<MatchExpr>),
}

/// Opaque seek bounds for an index scan. The builder forwards them into
/// the scan stage untouched.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct IndexBounds {
    /// Inclusive low key
    pub low: Val,
    /// Inclusive high key
    pub high: Val,
}

/// Projection spec for the default (expression-driven) projection path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectionSpec {
    /// Keep only the named fields
    Include(Vec<String>),
    /// Drop the named fields, keep everything else
    Exclude(Vec<String>),
}

/// Collection scan payload
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CollectionScanSol {
    /// Residual filter applied to each fetched document
    pub filter: Option<MatchExpr>,
    /// Scan direction
    pub direction: ScanDirection,
    /// Whether the cursor is tailable (oplog-style)
    pub tailable: bool,
    /// Track the latest oplog timestamp seen by the scan
    pub track_latest_oplog_ts: bool,
    /// Track a resume token for the scan
    pub request_resume_token: bool,
    /// Re-check read availability when the scan opens the collection
    pub check_read_allowed: bool,
}

/// Virtual scan payload: inline documents, optionally `[recordId, doc]`
/// rows, optionally simulating an index scan for covered plans.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VirtualScanSol {
    /// Documents produced by the scan, in order
    pub docs: Vec<Val>,
    /// When set, each element of `docs` is a two-element array
    /// `[recordId, doc]`
    pub has_record_id: bool,
    /// Present iff this virtual scan stands in for an index scan
    pub index_key_pattern: Option<KeyPattern>,
}

/// Index scan payload
#[derive(Debug, Clone, PartialEq)]
pub struct IndexScanSol {
    /// Name of the index in the catalog
    pub index_name: String,
    /// Key pattern of the index
    pub key_pattern: KeyPattern,
    /// Seek bounds
    pub bounds: IndexBounds,
    /// Scan direction
    pub direction: ScanDirection,
}

/// A logical node: provenance id plus kind-specific payload
#[derive(Debug, Clone, PartialEq)]
pub struct SolutionNode {
    /// Immutable planner-assigned id
    pub id: PlanNodeId,
    /// Node kind and payload
    pub kind: SolutionKind,
}

/// The closed set of logical node kinds
#[derive(Debug, Clone, PartialEq)]
pub enum SolutionKind {
    /// Full collection scan
    CollectionScan(CollectionScanSol),
    /// Scan over inline documents
    VirtualScan(VirtualScanSol),
    /// Bounded index scan
    IndexScan(IndexScanSol),
    /// Seek each child record id and materialize the document
    Fetch {
        /// Child producing record ids
        child: Box<SolutionNode>,
        /// Residual filter applied after materialization
        filter: Option<MatchExpr>,
    },
    /// Cap the number of results
    Limit {
        /// Input node
        child: Box<SolutionNode>,
        /// Maximum number of rows
        limit: u64,
    },
    /// Discard a prefix of results
    Skip {
        /// Input node
        child: Box<SolutionNode>,
        /// Number of rows to discard
        skip: u64,
    },
    /// Sort by a pattern; planner guarantees no arrays along sort paths
    SortSimple {
        /// Input node
        child: Box<SolutionNode>,
        /// Sort pattern
        pattern: SortPattern,
        /// Optional top-k limit fused into the sort
        limit: Option<u64>,
    },
    /// Sort by a pattern with full MQL array semantics
    SortDefault {
        /// Input node
        child: Box<SolutionNode>,
        /// Sort pattern
        pattern: SortPattern,
        /// Optional top-k limit fused into the sort
        limit: Option<u64>,
    },
    /// Standalone sort-key generator; not supported by this builder
    SortKeyGenerator {
        /// Input node
        child: Box<SolutionNode>,
        /// Sort pattern
        pattern: SortPattern,
    },
    /// Merge pre-sorted children on a shared sort pattern
    SortMerge {
        /// Pre-sorted inputs
        children: Vec<SolutionNode>,
        /// Merge pattern
        pattern: SortPattern,
        /// Deduplicate by record id
        dedup: bool,
    },
    /// Union of children
    Or {
        /// Branch inputs
        children: Vec<SolutionNode>,
        /// Deduplicate by record id
        dedup: bool,
        /// Residual filter over the unioned rows
        filter: Option<MatchExpr>,
    },
    /// Union of text-index branches
    TextOr {
        /// Branch inputs
        children: Vec<SolutionNode>,
        /// Residual filter over the unioned rows
        filter: Option<MatchExpr>,
    },
    /// Full-text match over fetched documents
    TextMatch {
        /// Input node (must produce documents)
        child: Box<SolutionNode>,
        /// Text index backing the match
        index_name: String,
        /// Stemmed query terms
        query_terms: Vec<String>,
    },
    /// Expose the index key used to locate each result
    ReturnKey {
        /// Input node
        child: Box<SolutionNode>,
    },
    /// Produces no rows
    Eof,
    /// Hash-intersect children on record id
    AndHash {
        /// Intersected inputs
        children: Vec<SolutionNode>,
    },
    /// Merge-intersect children sorted by record id
    AndSorted {
        /// Intersected inputs
        children: Vec<SolutionNode>,
    },
    /// Keep only the named top-level fields of the result
    ProjectionSimple {
        /// Input node
        child: Box<SolutionNode>,
        /// Fields to keep
        fields: Vec<String>,
    },
    /// Build the projection from index key slots, never materializing
    /// the document
    ProjectionCovered {
        /// Input node (an index scan)
        child: Box<SolutionNode>,
        /// Fields to reconstruct
        fields: Vec<String>,
    },
    /// General expression-driven projection
    ProjectionDefault {
        /// Input node
        child: Box<SolutionNode>,
        /// Projection spec
        spec: ProjectionSpec,
    },
    /// Drop rows not owned by this shard
    ShardingFilter {
        /// Input node
        child: Box<SolutionNode>,
        /// Shard key pattern (components may be hashed)
        shard_key: KeyPattern,
    },
}

impl SolutionNode {
    /// Construct a node
    pub fn new(id: PlanNodeId, kind: SolutionKind) -> Self {
        SolutionNode { id, kind }
    }

    /// Human-readable kind name for diagnostics
    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            SolutionKind::CollectionScan(_) => "COLLSCAN",
            SolutionKind::VirtualScan(_) => "VIRTUAL_SCAN",
            SolutionKind::IndexScan(_) => "IXSCAN",
            SolutionKind::Fetch { .. } => "FETCH",
            SolutionKind::Limit { .. } => "LIMIT",
            SolutionKind::Skip { .. } => "SKIP",
            SolutionKind::SortSimple { .. } => "SORT_SIMPLE",
            SolutionKind::SortDefault { .. } => "SORT_DEFAULT",
            SolutionKind::SortKeyGenerator { .. } => "SORT_KEY_GENERATOR",
            SolutionKind::SortMerge { .. } => "SORT_MERGE",
            SolutionKind::Or { .. } => "OR",
            SolutionKind::TextOr { .. } => "TEXT_OR",
            SolutionKind::TextMatch { .. } => "TEXT_MATCH",
            SolutionKind::ReturnKey { .. } => "RETURN_KEY",
            SolutionKind::Eof => "EOF",
            SolutionKind::AndHash { .. } => "AND_HASH",
            SolutionKind::AndSorted { .. } => "AND_SORTED",
            SolutionKind::ProjectionSimple { .. } => "PROJECTION_SIMPLE",
            SolutionKind::ProjectionCovered { .. } => "PROJECTION_COVERED",
            SolutionKind::ProjectionDefault { .. } => "PROJECTION_DEFAULT",
            SolutionKind::ShardingFilter { .. } => "SHARDING_FILTER",
        }
    }

    /// Immediate children, in order
    pub fn children(&self) -> Vec<&SolutionNode> {
        match &self.kind {
            SolutionKind::CollectionScan(_)
            | SolutionKind::VirtualScan(_)
            | SolutionKind::IndexScan(_)
            | SolutionKind::Eof => Vec::new(),
            SolutionKind::Fetch { child, .. }
            | SolutionKind::Limit { child, .. }
            | SolutionKind::Skip { child, .. }
            | SolutionKind::SortSimple { child, .. }
            | SolutionKind::SortDefault { child, .. }
            | SolutionKind::SortKeyGenerator { child, .. }
            | SolutionKind::TextMatch { child, .. }
            | SolutionKind::ReturnKey { child }
            | SolutionKind::ProjectionSimple { child, .. }
            | SolutionKind::ProjectionCovered { child, .. }
            | SolutionKind::ProjectionDefault { child, .. }
            | SolutionKind::ShardingFilter { child, .. } => vec![child],
            SolutionKind::SortMerge { children, .. }
            | SolutionKind::Or { children, .. }
            | SolutionKind::TextOr { children, .. }
            | SolutionKind::AndHash { children }
            | SolutionKind::AndSorted { children } => children.iter().collect(),
        }
    }

    /// The index scan beneath this node, looking through fetch, limit,
    /// and skip wrappers. Used by sort-merge and shard-filter lowering.
    pub fn index_scan_beneath(&self) -> Option<&IndexScanSol> {
        match &self.kind {
            SolutionKind::IndexScan(ixscan) => Some(ixscan),
            SolutionKind::Fetch { child, .. }
            | SolutionKind::Limit { child, .. }
            | SolutionKind::Skip { child, .. } => child.index_scan_beneath(),
            _ => None,
        }
    }
}

/// The planner's complete output: the logical tree plus anything the
/// caller wants carried alongside it.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySolution {
    /// Root of the logical tree
    pub root: SolutionNode,
}

/// Flags precomputed from the solution tree before lowering starts.
/// Derived from the first collection-scan or virtual-scan node found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SolutionMeta {
    /// The produced plan must surface the latest oplog timestamp
    pub should_track_latest_oplog_timestamp: bool,
    /// The produced plan must surface a resume token
    pub should_track_resume_token: bool,
    /// The produced plan contains a tailable scan
    pub should_use_tailable_scan: bool,
}

impl QuerySolution {
    /// Wrap a root node
    pub fn new(root: SolutionNode) -> Self {
        QuerySolution { root }
    }

    /// Single prelude pass locating a collection-scan or virtual-scan
    /// node and deriving the execution flags from it.
    pub fn metadata(&self) -> SolutionMeta {
        fn find_scan(node: &SolutionNode) -> Option<&SolutionNode> {
            match &node.kind {
                SolutionKind::CollectionScan(_) | SolutionKind::VirtualScan(_) => Some(node),
                _ => node.children().into_iter().find_map(find_scan),
            }
        }

        match find_scan(&self.root).map(|node| &node.kind) {
            Some(SolutionKind::CollectionScan(scan)) => SolutionMeta {
                should_track_latest_oplog_timestamp: scan.track_latest_oplog_ts,
                should_track_resume_token: scan.request_resume_token,
                should_use_tailable_scan: scan.tailable,
            },
            _ => SolutionMeta::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_prefix_detection() {
        assert!(!SortPattern::parse(&[("a", 1), ("b", -1)]).has_common_prefixes());
        assert!(SortPattern::parse(&[("a.b", 1), ("a.c", 1)]).has_common_prefixes());
        assert!(SortPattern::parse(&[("a", 1), ("a.b", 1)]).has_common_prefixes());
        assert!(!SortPattern::parse(&[("a.b", 1), ("c", 1)]).has_common_prefixes());
    }

    #[test]
    fn test_index_scan_beneath_fetch_and_limit() {
        let ixscan = SolutionNode::new(
            1,
            SolutionKind::IndexScan(IndexScanSol {
                index_name: "a_1".to_string(),
                key_pattern: crate::catalog::KeyPattern::parse(&[("a", 1)]),
                bounds: IndexBounds::default(),
                direction: ScanDirection::Forward,
            }),
        );
        let fetch = SolutionNode::new(
            2,
            SolutionKind::Fetch {
                child: Box::new(ixscan),
                filter: None,
            },
        );
        let limit = SolutionNode::new(
            3,
            SolutionKind::Limit {
                child: Box::new(fetch),
                limit: 5,
            },
        );

        let found = limit.index_scan_beneath().expect("ixscan visible");
        assert_eq!(found.index_name, "a_1");
    }

    #[test]
    fn test_metadata_from_collscan() {
        let scan = SolutionNode::new(
            1,
            SolutionKind::CollectionScan(CollectionScanSol {
                tailable: true,
                track_latest_oplog_ts: true,
                ..CollectionScanSol::default()
            }),
        );
        let root = SolutionNode::new(
            2,
            SolutionKind::Limit {
                child: Box::new(scan),
                limit: 10,
            },
        );

        let meta = QuerySolution::new(root).metadata();
        assert!(meta.should_use_tailable_scan);
        assert!(meta.should_track_latest_oplog_timestamp);
        assert!(!meta.should_track_resume_token);
    }
}
