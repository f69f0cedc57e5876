//! Tailable-cursor union.
//!
//! A tailable scan must resume from the last record id it returned. The
//! rewrite installs a named `resumeRecordId` runtime slot (initially
//! `Nothing`) and builds the subtree twice:
//!
//! - the **anchor** branch runs while the slot is absent and keeps any
//!   limit/skip operators;
//! - the **resume** branch runs once the slot is populated, suppresses
//!   limit/skip, and is capped at one row so it cannot re-trigger
//!   itself.
//!
//! The executor's driver mutates `resumeRecordId` between iterations.

use super::{narrow_bindings, StageBuilder};
use crate::env::{resume_record_id_initial, ENV_RESUME_RECORD_ID};
use crate::error::BuildError;
use crate::expr::{make_exists, make_not};
use crate::physical::{PhysOp, PhysStage};
use crate::reqs::{PlanNodeReqs, PlanNodeSlots};
use crate::solution::SolutionNode;
use tracing::debug;

/// Wrap `node` in the anchor/resume union. Called from the dispatcher
/// for the outermost collscan/limit/skip of a tailable query; the
/// steering flags keep the recursion from diverting again.
pub(crate) fn build_tailable_union(
    builder: &mut StageBuilder<'_>,
    node: &SolutionNode,
    reqs: &PlanNodeReqs,
) -> Result<(PhysStage, PlanNodeSlots), BuildError> {
    debug!(id = node.id, "rewriting tailable scan into anchor/resume union");

    // Registration doubles as the exactly-once guard: a second rewrite
    // in the same build is a contract violation.
    let resume_slot = builder.env.register(
        ENV_RESUME_RECORD_ID,
        resume_record_id_initial(),
        &mut builder.slot_gen,
    )?;

    let mut anchor_reqs = reqs.clone();
    anchor_reqs.is_building_tailable_union = true;
    anchor_reqs.is_tailable_resume_branch = false;
    let (anchor_stage, anchor_slots) = builder.build(node, &anchor_reqs)?;
    let anchor_stage = anchor_stage.const_filter(node.id, make_not(make_exists(resume_slot)));

    let mut resume_reqs = reqs.clone();
    resume_reqs.is_building_tailable_union = true;
    resume_reqs.is_tailable_resume_branch = true;
    let (resume_stage, resume_slots) = builder.build(node, &resume_reqs)?;
    let resume_stage = resume_stage
        .const_filter(node.id, make_exists(resume_slot))
        .limit_skip(node.id, Some(1), None);

    // One output slot vector, declared once; each branch contributes its
    // own slots in the same order.
    let anchor_slots = narrow_bindings(anchor_slots, reqs);
    let resume_slots = narrow_bindings(resume_slots, reqs);
    let input_slots = vec![anchor_slots.all_slots(reqs), resume_slots.all_slots(reqs)];
    let ordered_names: Vec<_> = reqs.names().filter(|n| anchor_slots.get(*n).is_some()).collect();
    let output_slots = builder.slot_gen.generate_many(input_slots[0].len());

    let stage = PhysStage::new(
        node.id,
        PhysOp::Union {
            children: vec![anchor_stage, resume_stage],
            input_slots,
            output_slots: output_slots.clone(),
        },
    );

    let mut slots = PlanNodeSlots::new();
    for (name, slot) in ordered_names.iter().zip(&output_slots) {
        slots.set(*name, *slot);
    }

    Ok((stage, slots))
}
