//! Projection expression sub-builder for the default projection path.
//!
//! Inclusion and exclusion specs both lower to a make-object stage over
//! the child's result; the covered and simple paths have dedicated
//! translators and never reach this module.

use super::StageBuilder;
use crate::physical::{FieldBehavior, PhysOp, PhysStage};
use crate::slots::SlotId;
use crate::solution::{PlanNodeId, ProjectionSpec};

/// Apply a projection spec to `input_slot`, returning the wrapped stage
/// and the slot holding the projected document.
pub(crate) fn apply_projection(
    builder: &mut StageBuilder<'_>,
    stage: PhysStage,
    node_id: PlanNodeId,
    spec: &ProjectionSpec,
    input_slot: SlotId,
) -> (PhysStage, SlotId) {
    let output_slot = builder.next_slot();
    let (field_behavior, fields) = match spec {
        ProjectionSpec::Include(fields) => (FieldBehavior::Keep, fields.clone()),
        ProjectionSpec::Exclude(fields) => (FieldBehavior::Drop, fields.clone()),
    };

    let stage = PhysStage::new(
        node_id,
        PhysOp::MakeObj {
            input: Box::new(stage),
            output_slot,
            root_slot: Some(input_slot),
            field_behavior,
            fields,
            projected: Vec::new(),
        },
    );

    (stage, output_slot)
}
