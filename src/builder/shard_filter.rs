//! Shard-filter lowering.
//!
//! Covered path: when the child is an index scan (or a virtual scan
//! standing in for one) and the parent does not need the document, the
//! shard key is assembled from index key slots alone — the scan is asked
//! for the union of the parent's components and the shard key's
//! components, and the parent-visible slot vector is narrowed back
//! afterwards.
//!
//! Fallback path: materialize the document and bind each shard key
//! component with nested `getField` steps that treat an array at a
//! non-terminal position as indeterminate. If any component is missing
//! the shard key becomes `Nothing` and the filterer rejects the row.

use super::{index_key, narrow_bindings, StageBuilder};
use crate::catalog::{KeyPartKind, KeyPattern};
use crate::error::BuildError;
use crate::expr::{
    make_boolean_tree, make_exists, make_function, make_get_field, make_if, make_is_array,
    make_new_obj, BinaryOp, BuiltinFn, Expr, OpaqueConstant,
};
use crate::physical::{FieldBehavior, PhysOp, PhysStage};
use crate::reqs::{IndexKeyBitset, PlanNodeReqs, PlanNodeSlots, SlotName};
use crate::slots::SlotId;
use crate::solution::{SolutionKind, SolutionNode};
use std::sync::Arc;

impl StageBuilder<'_> {
    /// SHARDING_FILTER
    pub(crate) fn build_sharding_filter(
        &mut self,
        node: &SolutionNode,
        child: &SolutionNode,
        shard_key: &KeyPattern,
        reqs: &PlanNodeReqs,
    ) -> Result<(PhysStage, PlanNodeSlots), BuildError> {
        let factory = self.shard_filterer_factory.ok_or_else(|| {
            crate::contract_error!(
                75_090,
                "sharding-filter node but no shard-filterer factory was supplied"
            )
        })?;
        let filterer = factory.make_filterer();

        let covered_pattern = match &child.kind {
            SolutionKind::IndexScan(ixscan) => Some(ixscan.key_pattern.clone()),
            SolutionKind::VirtualScan(scan) => scan.index_key_pattern.clone(),
            _ => None,
        };

        if let Some(key_pattern) = covered_pattern {
            if !reqs.has(SlotName::Result) {
                return self.build_covered(node, child, shard_key, &key_pattern, filterer, reqs);
            }
        }
        self.build_fallback(node, child, shard_key, filterer, reqs)
    }

    fn build_covered(
        &mut self,
        node: &SolutionNode,
        child: &SolutionNode,
        shard_key: &KeyPattern,
        key_pattern: &KeyPattern,
        filterer: Arc<dyn crate::context::ShardFilterer>,
        reqs: &PlanNodeReqs,
    ) -> Result<(PhysStage, PlanNodeSlots), BuildError> {
        let pattern_len = key_pattern.len();
        let parent_bits = match reqs.index_key_bitset() {
            Some(bitset) => {
                crate::check_contract!(
                    bitset.len() == pattern_len,
                    75_096,
                    "index-key bitset width {} does not match key pattern of {} components",
                    bitset.len(),
                    pattern_len
                );
                *bitset
            }
            None => IndexKeyBitset::new(pattern_len),
        };

        let mut shard_bits = IndexKeyBitset::new(pattern_len);
        let mut shard_positions = Vec::with_capacity(shard_key.len());
        for part in shard_key.parts() {
            let pos = key_pattern.position_of(&part.path).ok_or_else(|| {
                crate::contract_error!(
                    75_091,
                    "shard key component '{}' not covered by the index key pattern",
                    part.path
                )
            })?;
            shard_bits = shard_bits.set(pos);
            shard_positions.push((pos, part.clone()));
        }

        let union_bits = parent_bits.union(&shard_bits);
        let child_reqs = reqs.clone().with_index_key_bitset(union_bits);
        let (mut stage, mut slots) = self.build(child, &child_reqs)?;

        let key_slots: Vec<SlotId> = slots.take_index_key_slots().unwrap_or_default();
        let union_positions: Vec<usize> = union_bits.ones().collect();

        let mut hash_assignments = Vec::new();
        let mut projected = Vec::with_capacity(shard_positions.len());
        for (pos, part) in &shard_positions {
            let index = union_positions
                .iter()
                .position(|candidate| candidate == pos)
                .ok_or_else(|| {
                    crate::contract_error!(75_101, "shard key position {pos} was not scanned")
                })?;
            let mut value_slot = key_slots[index];
            if part.kind == KeyPartKind::Hashed {
                let hashed_slot = self.next_slot();
                hash_assignments.push((
                    hashed_slot,
                    make_function(BuiltinFn::ShardHash, vec![Expr::slot(value_slot)]),
                ));
                value_slot = hashed_slot;
            }
            projected.push((part.path.clone(), value_slot));
        }
        if !hash_assignments.is_empty() {
            stage = stage.project(node.id, hash_assignments);
        }

        let shard_key_slot = self.next_slot();
        stage = PhysStage::new(
            node.id,
            PhysOp::MakeObj {
                input: Box::new(stage),
                output_slot: shard_key_slot,
                root_slot: None,
                field_behavior: FieldBehavior::Keep,
                fields: Vec::new(),
                projected,
            },
        );
        stage = stage.filter(
            node.id,
            make_function(
                BuiltinFn::ShardFilter,
                vec![
                    Expr::Opaque(OpaqueConstant::ShardFilterer(filterer)),
                    Expr::slot(shard_key_slot),
                ],
            ),
        );

        if reqs.index_key_bitset().is_some() {
            let visible = index_key::index_key_slots_matching_parent_reqs(
                &union_bits,
                &parent_bits,
                &key_slots,
            )?;
            slots.set_index_key_slots(visible);
        }

        Ok((stage, narrow_bindings(slots, reqs)))
    }

    fn build_fallback(
        &mut self,
        node: &SolutionNode,
        child: &SolutionNode,
        shard_key: &KeyPattern,
        filterer: Arc<dyn crate::context::ShardFilterer>,
        reqs: &PlanNodeReqs,
    ) -> Result<(PhysStage, PlanNodeSlots), BuildError> {
        let child_reqs = reqs.clone().set(SlotName::Result);
        let (mut stage, slots) = self.build(child, &child_reqs)?;
        let result_slot = slots.require(SlotName::Result, 75_024)?;

        let mut assignments = Vec::with_capacity(shard_key.len());
        let mut component_slots = Vec::with_capacity(shard_key.len());
        for part in shard_key.parts() {
            let mut expr = self.shard_key_binding(result_slot, &part.path);
            if part.kind == KeyPartKind::Hashed {
                expr = make_function(BuiltinFn::ShardHash, vec![expr]);
            }
            let component_slot = self.next_slot();
            assignments.push((component_slot, expr));
            component_slots.push((part.path.clone(), component_slot));
        }
        stage = stage.project(node.id, assignments);

        // All components must be present; otherwise the shard key is
        // indeterminate and the row is rejected.
        let mut exists_checks = component_slots
            .iter()
            .map(|(_, slot)| make_exists(*slot));
        let first_check = exists_checks
            .next()
            .unwrap_or(Expr::Constant(crate::value::Val::Bool(true)));
        let all_exist = make_boolean_tree(BinaryOp::And, first_check, exists_checks.collect());

        let key_object = make_new_obj(
            component_slots
                .iter()
                .map(|(path, slot)| (path.clone(), Expr::slot(*slot)))
                .collect(),
        );

        let shard_key_slot = self.next_slot();
        stage = stage.project(
            node.id,
            vec![(shard_key_slot, make_if(all_exist, key_object, Expr::nothing()))],
        );
        stage = stage.filter(
            node.id,
            make_function(
                BuiltinFn::ShardFilter,
                vec![
                    Expr::Opaque(OpaqueConstant::ShardFilterer(filterer)),
                    Expr::slot(shard_key_slot),
                ],
            ),
        );

        Ok((stage, narrow_bindings(slots, reqs)))
    }

    /// Bind one shard-key component path against the document. Each
    /// nested step guards against arrays: an array at a non-terminal
    /// position makes the component `Nothing`.
    fn shard_key_binding(&mut self, result_slot: SlotId, path: &str) -> Expr {
        let mut components = path.split('.');
        let first = components.next().unwrap_or(path);
        let mut expr = make_get_field(Expr::slot(result_slot), first);
        for component in components {
            let frame = self.frame_gen.generate();
            let local = Expr::LocalVar { frame, index: 0 };
            expr = Expr::Let {
                frame,
                binds: vec![expr],
                body: Box::new(make_if(
                    make_is_array(local.clone()),
                    Expr::nothing(),
                    make_get_field(local, component),
                )),
            };
        }
        expr
    }
}
