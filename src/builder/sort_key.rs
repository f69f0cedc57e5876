//! Sort lowering.
//!
//! Two regimes, chosen by the sort pattern's top-level field names:
//!
//! - **Fast** (no two parts share a top-level field): per-part `getField`
//!   into a fresh slot, a traversal chain for nested paths that folds
//!   array elements with a three-way compare (min for ascending, max for
//!   descending), and a runtime guard failing the query when more than
//!   one sort path evaluates to an array.
//! - **Slow** (shared prefixes): a single `generateSortKey` call carrying
//!   the sort spec as an opaque constant.
//!
//! The simple sort variant trusts the planner's no-arrays guarantee and
//! skips both the traversal chain and the guard.

use super::{narrow_bindings, StageBuilder};
use crate::env::ENV_COLLATOR;
use crate::error::{codes, BuildError};
use crate::expr::{
    make_binary, make_boolean_tree, make_fill_empty_null, make_fill_empty_undefined,
    make_function, make_get_field, make_if, make_is_array, make_not, BinaryOp, BuiltinFn, Expr,
    OpaqueConstant,
};
use crate::physical::{PhysOp, PhysStage, SortDir};
use crate::reqs::{PlanNodeReqs, PlanNodeSlots, SlotName};
use crate::slots::SlotId;
use crate::solution::{top_level_field, SolutionNode, SortPattern, SortPatternPart};
use crate::value::Val;
use std::sync::Arc;

impl StageBuilder<'_> {
    /// SORT (simple and default variants)
    pub(crate) fn build_sort(
        &mut self,
        node: &SolutionNode,
        child: &SolutionNode,
        pattern: &SortPattern,
        limit: Option<u64>,
        simple: bool,
        reqs: &PlanNodeReqs,
    ) -> Result<(PhysStage, PlanNodeSlots), BuildError> {
        crate::check_contract!(!pattern.is_empty(), 75_097, "sort with an empty pattern");

        let child_reqs = reqs.clone().set(SlotName::Result);
        let (mut stage, slots) = self.build(child, &child_reqs)?;
        let result_slot = slots.require(SlotName::Result, 75_024)?;

        let mut order_by = Vec::with_capacity(pattern.len());
        let mut dirs = Vec::with_capacity(pattern.len());

        if pattern.has_common_prefixes() {
            // Slow regime: one opaque sort key with full MQL semantics.
            let sort_key_slot = self.next_slot();
            let spec = Arc::new(pattern.clone());
            stage = stage.project(
                node.id,
                vec![(
                    sort_key_slot,
                    make_function(
                        BuiltinFn::GenerateSortKey,
                        vec![
                            Expr::Opaque(OpaqueConstant::SortSpec(spec)),
                            Expr::slot(result_slot),
                        ],
                    ),
                )],
            );
            order_by.push(sort_key_slot);
            dirs.push(SortDir::Asc);
        } else {
            // Fast regime: extract each top-level field once.
            let mut field_slots = Vec::with_capacity(pattern.len());
            let mut assignments = Vec::with_capacity(pattern.len());
            for part in pattern.parts() {
                let field_slot = self.next_slot();
                assignments.push((
                    field_slot,
                    make_fill_empty_null(make_get_field(
                        Expr::slot(result_slot),
                        top_level_field(&part.path),
                    )),
                ));
                field_slots.push(field_slot);
            }
            stage = stage.project(node.id, assignments);

            if !simple && pattern.len() >= 2 {
                stage = stage.filter(
                    node.id,
                    parallel_arrays_guard(&field_slots),
                );
            }

            for (part, field_slot) in pattern.parts().iter().zip(&field_slots) {
                let (wrapped, key_slot) = if simple {
                    self.simple_sort_key(node, part, *field_slot, stage)
                } else {
                    self.traversed_sort_key(node, part, *field_slot, stage)
                };
                stage = wrapped;
                order_by.push(key_slot);
                dirs.push(if part.ascending {
                    SortDir::Asc
                } else {
                    SortDir::Desc
                });
            }
        }

        let narrowed = narrow_bindings(slots, reqs);
        let forwarded = narrowed.all_slots(reqs);

        let stage = PhysStage::new(
            node.id,
            PhysOp::Sort {
                input: Box::new(stage),
                order_by,
                dirs,
                forwarded,
                limit,
                memory_limit_bytes: self.config.sort.memory_limit_bytes,
                allow_disk_use: self.config.sort.allow_disk_use,
            },
        );

        Ok((stage, narrowed))
    }

    /// Sort key for the simple variant: plain `getField` descent, no
    /// traversal. The planner guarantees no arrays along the path.
    fn simple_sort_key(
        &mut self,
        node: &SolutionNode,
        part: &SortPatternPart,
        field_slot: SlotId,
        stage: PhysStage,
    ) -> (PhysStage, SlotId) {
        let collator_slot = self.env.slot(ENV_COLLATOR);
        let components: Vec<&str> = part.path.split('.').collect();

        let mut expr = Expr::slot(field_slot);
        for component in &components[1..] {
            expr = make_get_field(expr, component);
        }
        if components.len() > 1 {
            expr = make_fill_empty_null(expr);
        }
        if let Some(collator) = collator_slot {
            expr = make_function(
                BuiltinFn::CollComparisonKey,
                vec![expr, Expr::slot(collator)],
            );
        }

        if expr == Expr::slot(field_slot) {
            return (stage, field_slot);
        }
        let key_slot = self.next_slot();
        let stage = stage.project(node.id, vec![(key_slot, expr)]);
        (stage, key_slot)
    }

    /// Sort key for the default variant: one traverse stage per nested
    /// level, folding leaf values with a three-way compare.
    fn traversed_sort_key(
        &mut self,
        node: &SolutionNode,
        part: &SortPatternPart,
        field_slot: SlotId,
        stage: PhysStage,
    ) -> (PhysStage, SlotId) {
        let collator_slot = self.env.slot(ENV_COLLATOR);
        let components: Vec<&str> = part.path.split('.').collect();

        if components.len() == 1 {
            // Single level: the extracted field slot is the sort key,
            // collation-mapped when a collator is installed.
            if let Some(collator) = collator_slot {
                let key_slot = self.next_slot();
                let stage = stage.project(
                    node.id,
                    vec![(
                        key_slot,
                        make_function(
                            BuiltinFn::CollComparisonKey,
                            vec![Expr::slot(field_slot), Expr::slot(collator)],
                        ),
                    )],
                );
                return (stage, key_slot);
            }
            return (stage, field_slot);
        }

        let mut stage = stage;
        let mut current = field_slot;
        let levels = components.len() - 1;
        for (level, component) in components[1..].iter().enumerate() {
            let is_leaf = level == levels - 1;
            let out_inner = self.next_slot();
            let out_field = self.next_slot();

            let mut inner_expr = make_get_field(Expr::slot(current), component);
            if is_leaf {
                if let Some(collator) = collator_slot {
                    inner_expr = make_function(
                        BuiltinFn::CollComparisonKey,
                        vec![inner_expr, Expr::slot(collator)],
                    );
                }
            }
            let inner = PhysStage::new(node.id, PhysOp::CoScan)
                .limit_skip(node.id, Some(1), None)
                .project(node.id, vec![(out_inner, inner_expr)]);

            // Three-way compare fold: ascending keeps the minimum
            // element, descending the maximum.
            let keep_op = if part.ascending {
                BinaryOp::Less
            } else {
                BinaryOp::Greater
            };
            let fold = make_if(
                make_binary(
                    keep_op,
                    make_binary(
                        BinaryOp::Cmp3w,
                        Expr::slot(out_inner),
                        Expr::slot(out_field),
                    ),
                    Expr::Constant(Val::Int32(0)),
                ),
                Expr::slot(out_inner),
                Expr::slot(out_field),
            );
            // Leaf policy: an empty array at the leaf sorts as
            // undefined; anything empty or missing above sorts as null.
            let final_expr = if is_leaf {
                make_fill_empty_undefined(Expr::slot(out_field))
            } else {
                make_fill_empty_null(Expr::slot(out_field))
            };

            stage = PhysStage::new(
                node.id,
                PhysOp::Traverse {
                    outer: Box::new(stage),
                    inner: Box::new(inner),
                    in_field_slot: current,
                    out_field_slot: out_field,
                    out_inner_slot: out_inner,
                    fold: Some(fold),
                    final_expr: Some(final_expr),
                    correlated: vec![current],
                },
            );
            current = out_field;
        }
        (stage, current)
    }
}

/// Runtime guard failing with `BadValue` when more than one sort-key
/// path evaluates to an array. Two shapes: a disjunction for exactly two
/// parts, an array-ness sum for three or more.
fn parallel_arrays_guard(field_slots: &[SlotId]) -> Expr {
    let fail = Expr::Fail {
        code: codes::BAD_VALUE,
        message: "cannot sort with keys that are parallel arrays".to_string(),
    };

    if field_slots.len() == 2 {
        return make_boolean_tree(
            BinaryOp::Or,
            make_not(make_is_array(Expr::slot(field_slots[0]))),
            vec![make_not(make_is_array(Expr::slot(field_slots[1]))), fail],
        );
    }

    let mut counts = field_slots.iter().map(|slot| {
        make_if(
            make_is_array(Expr::slot(*slot)),
            Expr::Constant(Val::Int32(1)),
            Expr::Constant(Val::Int32(0)),
        )
    });
    // field_slots.len() >= 2 is guaranteed by the caller
    let first = counts.next().unwrap_or(Expr::Constant(Val::Int32(0)));
    let sum = counts.fold(first, |acc, next| make_binary(BinaryOp::Add, acc, next));

    make_binary(
        BinaryOp::Or,
        make_binary(BinaryOp::LessEq, sum, Expr::Constant(Val::Int32(1))),
        fail,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_shape_two_parts() {
        let guard = parallel_arrays_guard(&[SlotId(4), SlotId(5)]);
        assert_eq!(
            guard.to_string(),
            "((!isArray(s4) || !isArray(s5)) || fail(2, \"cannot sort with keys that are parallel arrays\"))"
        );
    }

    #[test]
    fn test_guard_shape_three_parts_sums_arrayness() {
        let guard = parallel_arrays_guard(&[SlotId(1), SlotId(2), SlotId(3)]);
        let printed = guard.to_string();
        assert!(printed.contains("isArray(s1)"));
        assert!(printed.contains("+"));
        assert!(printed.contains("<= 1"));
        assert!(printed.ends_with("fail(2, \"cannot sort with keys that are parallel arrays\"))"));
    }
}
