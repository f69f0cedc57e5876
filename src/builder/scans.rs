//! Scan body generators: collection scan, index scan, virtual scan.
//!
//! These allocate the output slots a scan materializes and build the
//! leaf stage. Translators layer rehydration, filters, and returnKey
//! projection on top.

use super::StageBuilder;
use crate::env::ENV_RESUME_RECORD_ID;
use crate::error::BuildError;
use crate::physical::{PhysOp, PhysStage};
use crate::reqs::{IndexKeyBitset, PlanNodeReqs, PlanNodeSlots, SlotName};
use crate::slots::SlotId;
use crate::solution::{CollectionScanSol, IndexScanSol, PlanNodeId, VirtualScanSol};

/// Build the collection-scan leaf. Allocates `result` when the parent
/// asked for it or a residual filter needs it, `recordId` when requested
/// or the scan is tailable, and `oplogTs` when both requested and
/// tracked. The resume slot is wired in only inside the resume branch of
/// a tailable union.
pub(crate) fn generate_collection_scan(
    builder: &mut StageBuilder<'_>,
    node_id: PlanNodeId,
    scan: &CollectionScanSol,
    reqs: &PlanNodeReqs,
) -> Result<(PhysStage, PlanNodeSlots), BuildError> {
    let mut slots = PlanNodeSlots::new();

    let needs_result = reqs.has(SlotName::Result) || scan.filter.is_some();
    let result_slot = needs_result.then(|| builder.next_slot());
    if let Some(slot) = result_slot {
        slots.set(SlotName::Result, slot);
    }

    let needs_record_id = reqs.has(SlotName::RecordId) || scan.tailable;
    let record_id_slot = needs_record_id.then(|| builder.next_slot());
    if let Some(slot) = record_id_slot {
        slots.set(SlotName::RecordId, slot);
    }

    let oplog_ts_slot = (reqs.has(SlotName::OplogTs) && scan.track_latest_oplog_ts)
        .then(|| builder.next_slot());
    if let Some(slot) = oplog_ts_slot {
        slots.set(SlotName::OplogTs, slot);
    }

    let resume_record_id_slot = if reqs.is_tailable_resume_branch {
        Some(builder.env.require_slot(ENV_RESUME_RECORD_ID, 75_012)?)
    } else {
        None
    };

    let lock_acquisition = if scan.check_read_allowed {
        let callback = builder.lock_acquisition.clone();
        crate::check_contract!(
            callback.is_some(),
            75_099,
            "scan requests a read-availability check but no lock-acquisition callback was supplied"
        );
        callback
    } else {
        None
    };

    let stage = PhysStage::new(
        node_id,
        PhysOp::CollScan {
            namespace: builder.query.namespace.clone(),
            result_slot,
            record_id_slot,
            oplog_ts_slot,
            seek_record_id_slot: None,
            resume_record_id_slot,
            direction: scan.direction,
            tailable: scan.tailable,
            yield_policy: builder.yield_policy,
            lock_acquisition,
        },
    );

    Ok((stage, slots))
}

/// Build the index-scan leaf, verifying the index against the catalog.
/// Returns the stage, the named bindings, and the key slot vector
/// aligned to `scan_bits.ones()`.
pub(crate) fn generate_index_scan(
    builder: &mut StageBuilder<'_>,
    node_id: PlanNodeId,
    ixscan: &IndexScanSol,
    scan_bits: &IndexKeyBitset,
    reqs: &PlanNodeReqs,
) -> Result<(PhysStage, PlanNodeSlots, Vec<SlotId>), BuildError> {
    let entry = builder.catalog.index_entry(
        builder.op_ctx,
        &builder.query.namespace,
        &ixscan.index_name,
    )?;
    crate::check_contract!(
        entry.key_pattern == ixscan.key_pattern,
        75_011,
        "solution key pattern disagrees with catalog entry for index '{}'",
        ixscan.index_name
    );

    let mut slots = PlanNodeSlots::new();

    let record_id_slot = reqs.has(SlotName::RecordId).then(|| builder.next_slot());
    if let Some(slot) = record_id_slot {
        slots.set(SlotName::RecordId, slot);
    }

    let mut key_slots = Vec::with_capacity(scan_bits.count_ones());
    let mut key_slot_pairs = Vec::with_capacity(scan_bits.count_ones());
    for pos in scan_bits.ones() {
        let slot = builder.next_slot();
        key_slots.push(slot);
        key_slot_pairs.push((pos, slot));
    }

    let stage = PhysStage::new(
        node_id,
        PhysOp::IxScan {
            namespace: builder.query.namespace.clone(),
            index_name: ixscan.index_name.clone(),
            key_pattern: ixscan.key_pattern.clone(),
            bounds: ixscan.bounds.clone(),
            record_id_slot,
            key_slots: key_slot_pairs,
            direction: ixscan.direction,
            yield_policy: builder.yield_policy,
        },
    );

    Ok((stage, slots, key_slots))
}

/// Build the virtual-scan leaf over inline documents.
pub(crate) fn generate_virtual_scan(
    builder: &mut StageBuilder<'_>,
    node_id: PlanNodeId,
    scan: &VirtualScanSol,
) -> (PhysStage, PlanNodeSlots) {
    let mut slots = PlanNodeSlots::new();

    let result_slot = builder.next_slot();
    slots.set(SlotName::Result, result_slot);

    let record_id_slot = scan.has_record_id.then(|| builder.next_slot());
    if let Some(slot) = record_id_slot {
        slots.set(SlotName::RecordId, slot);
    }

    let stage = PhysStage::new(
        node_id,
        PhysOp::VirtualScan {
            docs: scan.docs.clone(),
            result_slot,
            record_id_slot,
        },
    );

    (stage, slots)
}
