//! # Physical Stage Tree
//!
//! The slot-based operators the builder composes. These are opaque
//! constructors: the crate builds and inspects the tree but never
//! executes it — execution belongs to the runtime this library feeds.
//!
//! Every stage carries the `plan_node_id` of the logical node it was
//! lowered from, so an execution trace can be mapped back to the
//! planner's output.

use crate::context::{LockAcquisitionCallback, YieldPolicy};
use crate::catalog::KeyPattern;
use crate::expr::Expr;
use crate::slots::SlotId;
use crate::solution::{IndexBounds, PlanNodeId, ScanDirection};
use crate::value::Val;
use std::fmt::Write as _;

/// Sort direction of one key column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDir {
    /// Ascending
    Asc,
    /// Descending
    Desc,
}

/// Field selection behavior of a make-object stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldBehavior {
    /// Keep only the listed fields of the root object
    Keep,
    /// Drop the listed fields of the root object
    Drop,
}

/// A physical stage: provenance id plus operator payload
#[derive(Debug, Clone)]
pub struct PhysStage {
    /// Logical node this stage was lowered from
    pub node_id: PlanNodeId,
    /// Operator payload
    pub op: PhysOp,
}

/// The physical operator library
#[derive(Debug, Clone)]
pub enum PhysOp {
    /// Collection scan, optionally seeking, tailing, or resuming
    CollScan {
        /// Target namespace
        namespace: String,
        /// Slot receiving each document
        result_slot: Option<SlotId>,
        /// Slot receiving each record id
        record_id_slot: Option<SlotId>,
        /// Slot receiving the latest oplog timestamp
        oplog_ts_slot: Option<SlotId>,
        /// Correlated slot to seek to (loop-join fetch inner side)
        seek_record_id_slot: Option<SlotId>,
        /// Environment slot to resume a tailable scan from
        resume_record_id_slot: Option<SlotId>,
        /// Scan direction
        direction: ScanDirection,
        /// Whether the scan is tailable
        tailable: bool,
        /// Yield policy forwarded from the caller
        yield_policy: YieldPolicy,
        /// Invoked when the scan opens the collection, when present
        lock_acquisition: Option<LockAcquisitionCallback>,
    },
    /// Bounded index scan producing record ids and selected key slots
    IxScan {
        /// Target namespace
        namespace: String,
        /// Index name
        index_name: String,
        /// Key pattern of the index
        key_pattern: KeyPattern,
        /// Seek bounds
        bounds: IndexBounds,
        /// Slot receiving each record id
        record_id_slot: Option<SlotId>,
        /// `(pattern position, slot)` pairs for requested components
        key_slots: Vec<(usize, SlotId)>,
        /// Scan direction
        direction: ScanDirection,
        /// Yield policy forwarded from the caller
        yield_policy: YieldPolicy,
    },
    /// Scan over an inline array of documents
    VirtualScan {
        /// Documents, in output order
        docs: Vec<Val>,
        /// Slot receiving each document
        result_slot: SlotId,
        /// Slot receiving each record id (when rows are `[rid, doc]`)
        record_id_slot: Option<SlotId>,
    },
    /// Single-row, zero-slot source
    CoScan,
    /// Limit and/or skip
    LimitSkip {
        /// Input stage
        input: Box<PhysStage>,
        /// Maximum rows to emit
        limit: Option<u64>,
        /// Rows to discard first
        skip: Option<u64>,
    },
    /// Evaluate expressions into fresh slots
    Project {
        /// Input stage
        input: Box<PhysStage>,
        /// `(slot, expression)` assignments, in order
        assignments: Vec<(SlotId, Expr)>,
    },
    /// Keep rows satisfying the predicate. Const filters are evaluated
    /// once when the stage opens rather than per row.
    Filter {
        /// Input stage
        input: Box<PhysStage>,
        /// Row predicate
        predicate: Expr,
        /// Open-time (constant) filter
        is_const: bool,
    },
    /// Sort by key slots
    Sort {
        /// Input stage
        input: Box<PhysStage>,
        /// Key slots, in significance order
        order_by: Vec<SlotId>,
        /// Direction per key slot
        dirs: Vec<SortDir>,
        /// Non-key slots carried through the sort
        forwarded: Vec<SlotId>,
        /// Top-k limit fused into the sort
        limit: Option<u64>,
        /// Memory cap before spilling
        memory_limit_bytes: usize,
        /// Whether spilling to disk is permitted
        allow_disk_use: bool,
    },
    /// Merge pre-sorted children
    SortedMerge {
        /// Pre-sorted inputs
        children: Vec<PhysStage>,
        /// Per-child key slots, aligned to `dirs`
        key_slots: Vec<Vec<SlotId>>,
        /// Direction per merge key
        dirs: Vec<SortDir>,
        /// Per-child value slots, aligned to `output_slots`
        input_slots: Vec<Vec<SlotId>>,
        /// Merged output slots
        output_slots: Vec<SlotId>,
    },
    /// Hash equi-join
    HashJoin {
        /// Build side
        outer: Box<PhysStage>,
        /// Probe side
        inner: Box<PhysStage>,
        /// Outer join-key slots
        outer_cond: Vec<SlotId>,
        /// Outer payload slots carried through
        outer_proj: Vec<SlotId>,
        /// Inner join-key slots
        inner_cond: Vec<SlotId>,
        /// Inner payload slots carried through
        inner_proj: Vec<SlotId>,
        /// Collator environment slot for key comparison
        collator_slot: Option<SlotId>,
    },
    /// Merge equi-join over sorted inputs
    MergeJoin {
        /// Left input
        outer: Box<PhysStage>,
        /// Right input
        inner: Box<PhysStage>,
        /// Outer join-key slots
        outer_cond: Vec<SlotId>,
        /// Outer payload slots carried through
        outer_proj: Vec<SlotId>,
        /// Inner join-key slots
        inner_cond: Vec<SlotId>,
        /// Inner payload slots carried through
        inner_proj: Vec<SlotId>,
        /// Sort direction of the join keys
        dirs: Vec<SortDir>,
    },
    /// Nested-loop join; the inner side re-opens per outer row
    LoopJoin {
        /// Outer input
        outer: Box<PhysStage>,
        /// Inner input, re-evaluated per outer row
        inner: Box<PhysStage>,
        /// Outer slots visible above the join
        outer_proj: Vec<SlotId>,
        /// Outer slots the inner side correlates on
        correlated: Vec<SlotId>,
        /// Optional join predicate
        predicate: Option<Expr>,
    },
    /// Concatenate children, remapping their slots onto shared outputs
    Union {
        /// Branch inputs
        children: Vec<PhysStage>,
        /// Per-child slot vectors, aligned to `output_slots`
        input_slots: Vec<Vec<SlotId>>,
        /// Union-wide output slots
        output_slots: Vec<SlotId>,
    },
    /// Drop rows whose key slots repeat
    Unique {
        /// Input stage
        input: Box<PhysStage>,
        /// Dedup key slots
        key_slots: Vec<SlotId>,
    },
    /// Construct an object into a slot from a root object and/or
    /// projected fields
    MakeObj {
        /// Input stage
        input: Box<PhysStage>,
        /// Slot receiving the object
        output_slot: SlotId,
        /// Object to copy fields from, if any
        root_slot: Option<SlotId>,
        /// How `fields` applies to the root
        field_behavior: FieldBehavior,
        /// Fields kept/dropped from the root
        fields: Vec<String>,
        /// Extra `(name, slot)` fields appended in order
        projected: Vec<(String, SlotId)>,
    },
    /// Per-row traversal of an array-valued slot, folding the inner
    /// stage's output
    Traverse {
        /// Outer input
        outer: Box<PhysStage>,
        /// Inner stage producing per-element values
        inner: Box<PhysStage>,
        /// Slot holding the value being traversed
        in_field_slot: SlotId,
        /// Slot receiving the folded output
        out_field_slot: SlotId,
        /// Slot the inner stage writes each element result to
        out_inner_slot: SlotId,
        /// Fold step combining `out_field_slot` with `out_inner_slot`
        fold: Option<Expr>,
        /// Applied to the folded value after traversal
        final_expr: Option<Expr>,
        /// Outer slots the inner side correlates on
        correlated: Vec<SlotId>,
    },
}

impl PhysStage {
    /// Construct a stage
    pub fn new(node_id: PlanNodeId, op: PhysOp) -> Self {
        PhysStage { node_id, op }
    }

    /// Wrap in a project stage
    pub fn project(self, node_id: PlanNodeId, assignments: Vec<(SlotId, Expr)>) -> PhysStage {
        PhysStage::new(
            node_id,
            PhysOp::Project {
                input: Box::new(self),
                assignments,
            },
        )
    }

    /// Wrap in a per-row filter
    pub fn filter(self, node_id: PlanNodeId, predicate: Expr) -> PhysStage {
        PhysStage::new(
            node_id,
            PhysOp::Filter {
                input: Box::new(self),
                predicate,
                is_const: false,
            },
        )
    }

    /// Wrap in an open-time (constant) filter
    pub fn const_filter(self, node_id: PlanNodeId, predicate: Expr) -> PhysStage {
        PhysStage::new(
            node_id,
            PhysOp::Filter {
                input: Box::new(self),
                predicate,
                is_const: true,
            },
        )
    }

    /// Wrap in a limit-skip
    pub fn limit_skip(self, node_id: PlanNodeId, limit: Option<u64>, skip: Option<u64>) -> PhysStage {
        PhysStage::new(
            node_id,
            PhysOp::LimitSkip {
                input: Box::new(self),
                limit,
                skip,
            },
        )
    }

    /// Operator name for diagnostics
    pub fn op_name(&self) -> &'static str {
        match &self.op {
            PhysOp::CollScan { .. } => "collscan",
            PhysOp::IxScan { .. } => "ixscan",
            PhysOp::VirtualScan { .. } => "virtscan",
            PhysOp::CoScan => "coscan",
            PhysOp::LimitSkip { .. } => "limitskip",
            PhysOp::Project { .. } => "project",
            PhysOp::Filter { is_const: true, .. } => "cfilter",
            PhysOp::Filter { .. } => "filter",
            PhysOp::Sort { .. } => "sort",
            PhysOp::SortedMerge { .. } => "smerge",
            PhysOp::HashJoin { .. } => "hj",
            PhysOp::MergeJoin { .. } => "mj",
            PhysOp::LoopJoin { .. } => "nlj",
            PhysOp::Union { .. } => "union",
            PhysOp::Unique { .. } => "unique",
            PhysOp::MakeObj { .. } => "mkobj",
            PhysOp::Traverse { .. } => "traverse",
        }
    }

    /// Children in evaluation order
    pub fn children(&self) -> Vec<&PhysStage> {
        match &self.op {
            PhysOp::CollScan { .. }
            | PhysOp::IxScan { .. }
            | PhysOp::VirtualScan { .. }
            | PhysOp::CoScan => Vec::new(),
            PhysOp::LimitSkip { input, .. }
            | PhysOp::Project { input, .. }
            | PhysOp::Filter { input, .. }
            | PhysOp::Sort { input, .. }
            | PhysOp::Unique { input, .. }
            | PhysOp::MakeObj { input, .. } => vec![input],
            PhysOp::HashJoin { outer, inner, .. }
            | PhysOp::MergeJoin { outer, inner, .. }
            | PhysOp::LoopJoin { outer, inner, .. }
            | PhysOp::Traverse { outer, inner, .. } => vec![outer, inner],
            PhysOp::SortedMerge { children, .. } | PhysOp::Union { children, .. } => {
                children.iter().collect()
            }
        }
    }

    /// Indented multi-line dump of the stage tree
    pub fn explain(&self) -> String {
        let mut out = String::new();
        self.explain_into(&mut out, 0);
        out
    }

    fn explain_into(&self, out: &mut String, depth: usize) {
        for _ in 0..depth {
            out.push_str("  ");
        }
        let _ = write!(out, "{} [{}]", self.op_name(), self.node_id);
        match &self.op {
            PhysOp::CollScan {
                result_slot,
                record_id_slot,
                oplog_ts_slot,
                seek_record_id_slot,
                resume_record_id_slot,
                tailable,
                ..
            } => {
                write_slot(out, " result=", *result_slot);
                write_slot(out, " recordId=", *record_id_slot);
                write_slot(out, " oplogTs=", *oplog_ts_slot);
                write_slot(out, " seek=", *seek_record_id_slot);
                write_slot(out, " resume=", *resume_record_id_slot);
                if *tailable {
                    out.push_str(" tailable");
                }
            }
            PhysOp::IxScan {
                index_name,
                record_id_slot,
                key_slots,
                ..
            } => {
                let _ = write!(out, " index={index_name}");
                write_slot(out, " recordId=", *record_id_slot);
                out.push_str(" keys=[");
                for (i, (pos, slot)) in key_slots.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    let _ = write!(out, "{pos}:{slot}");
                }
                out.push(']');
            }
            PhysOp::VirtualScan {
                docs,
                result_slot,
                record_id_slot,
            } => {
                let _ = write!(out, " docs={} result={result_slot}", docs.len());
                write_slot(out, " recordId=", *record_id_slot);
            }
            PhysOp::LimitSkip { limit, skip, .. } => {
                if let Some(limit) = limit {
                    let _ = write!(out, " limit={limit}");
                }
                if let Some(skip) = skip {
                    let _ = write!(out, " skip={skip}");
                }
            }
            PhysOp::Project { assignments, .. } => {
                for (slot, expr) in assignments {
                    let _ = write!(out, " {slot}={expr}");
                }
            }
            PhysOp::Filter { predicate, .. } => {
                let _ = write!(out, " {predicate}");
            }
            PhysOp::Sort {
                order_by,
                dirs,
                limit,
                ..
            } => {
                out.push_str(" by=[");
                for (i, (slot, dir)) in order_by.iter().zip(dirs).enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    let arrow = match dir {
                        SortDir::Asc => "asc",
                        SortDir::Desc => "desc",
                    };
                    let _ = write!(out, "{slot} {arrow}");
                }
                out.push(']');
                if let Some(limit) = limit {
                    let _ = write!(out, " limit={limit}");
                }
            }
            PhysOp::Unique { key_slots, .. } => {
                out.push_str(" on=[");
                write_slots(out, key_slots);
                out.push(']');
            }
            PhysOp::Union { output_slots, .. } | PhysOp::SortedMerge { output_slots, .. } => {
                out.push_str(" out=[");
                write_slots(out, output_slots);
                out.push(']');
            }
            PhysOp::HashJoin {
                outer_cond,
                inner_cond,
                ..
            }
            | PhysOp::MergeJoin {
                outer_cond,
                inner_cond,
                ..
            } => {
                out.push_str(" cond=[");
                write_slots(out, outer_cond);
                out.push_str("]=[");
                write_slots(out, inner_cond);
                out.push(']');
            }
            PhysOp::LoopJoin { correlated, .. } => {
                out.push_str(" correlated=[");
                write_slots(out, correlated);
                out.push(']');
            }
            PhysOp::MakeObj {
                output_slot,
                root_slot,
                fields,
                projected,
                ..
            } => {
                let _ = write!(out, " out={output_slot}");
                write_slot(out, " root=", *root_slot);
                if !fields.is_empty() {
                    let _ = write!(out, " fields={fields:?}");
                }
                for (name, slot) in projected {
                    let _ = write!(out, " {name}={slot}");
                }
            }
            PhysOp::Traverse {
                in_field_slot,
                out_field_slot,
                ..
            } => {
                let _ = write!(out, " in={in_field_slot} out={out_field_slot}");
            }
            PhysOp::CoScan => {}
        }
        out.push('\n');
        for child in self.children() {
            child.explain_into(out, depth + 1);
        }
    }
}

fn write_slot(out: &mut String, prefix: &str, slot: Option<SlotId>) {
    if let Some(slot) = slot {
        let _ = write!(out, "{prefix}{slot}");
    }
}

fn write_slots(out: &mut String, slots: &[SlotId]) {
    for (i, slot) in slots.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "{slot}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explain_indents_children() {
        let scan = PhysStage::new(
            1,
            PhysOp::VirtualScan {
                docs: Vec::new(),
                result_slot: SlotId(1),
                record_id_slot: None,
            },
        );
        let limited = scan.limit_skip(2, Some(10), None);

        let explain = limited.explain();
        let lines: Vec<&str> = explain.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("limitskip [2] limit=10"));
        assert!(lines[1].starts_with("  virtscan [1]"));
    }
}
