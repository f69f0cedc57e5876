//! Filter expression sub-builder.
//!
//! Compiles the logical predicate language ([`MatchExpr`]) against a
//! result slot and wraps the input stage in a filter. Path access uses
//! `getField` chains bound through a local frame so each path is
//! extracted once per row.

use super::StageBuilder;
use crate::expr::{
    make_binary, make_boolean_tree, make_function, make_get_field, BinaryOp, BuiltinFn, Expr,
};
use crate::physical::PhysStage;
use crate::slots::SlotId;
use crate::solution::{MatchExpr, PlanNodeId};

/// Wrap `stage` in a filter evaluating `match_expr` over `input_slot`.
pub(crate) fn apply_filter(
    builder: &mut StageBuilder<'_>,
    stage: PhysStage,
    node_id: PlanNodeId,
    match_expr: &MatchExpr,
    input_slot: SlotId,
) -> PhysStage {
    let predicate = generate_filter_expr(builder, match_expr, input_slot);
    stage.filter(node_id, predicate)
}

/// Compile a predicate to an expression over the given slot.
pub(crate) fn generate_filter_expr(
    builder: &mut StageBuilder<'_>,
    match_expr: &MatchExpr,
    input_slot: SlotId,
) -> Expr {
    match match_expr {
        MatchExpr::Eq { path, value } => compare(builder, input_slot, path, BinaryOp::Eq, value),
        MatchExpr::Lt { path, value } => compare(builder, input_slot, path, BinaryOp::Less, value),
        MatchExpr::Lte { path, value } => {
            compare(builder, input_slot, path, BinaryOp::LessEq, value)
        }
        MatchExpr::Gt { path, value } => {
            compare(builder, input_slot, path, BinaryOp::Greater, value)
        }
        MatchExpr::Gte { path, value } => {
            compare(builder, input_slot, path, BinaryOp::GreaterEq, value)
        }
        MatchExpr::Exists { path } => make_function(
            BuiltinFn::Exists,
            vec![path_expr(Expr::slot(input_slot), path)],
        ),
        MatchExpr::And(children) => boolean(builder, children, BinaryOp::And, input_slot),
        MatchExpr::Or(children) => boolean(builder, children, BinaryOp::Or, input_slot),
    }
}

fn boolean(
    builder: &mut StageBuilder<'_>,
    children: &[MatchExpr],
    op: BinaryOp,
    input_slot: SlotId,
) -> Expr {
    let mut compiled: Vec<Expr> = children
        .iter()
        .map(|child| generate_filter_expr(builder, child, input_slot))
        .collect();
    if compiled.is_empty() {
        // An empty conjunction is vacuously true, an empty disjunction
        // vacuously false.
        return Expr::Constant(crate::value::Val::Bool(op == BinaryOp::And));
    }
    let first = compiled.remove(0);
    make_boolean_tree(op, first, compiled)
}

fn compare(
    builder: &mut StageBuilder<'_>,
    input_slot: SlotId,
    path: &str,
    op: BinaryOp,
    value: &crate::value::Val,
) -> Expr {
    // Bind the extracted value in a frame so the comparison reads it
    // once.
    let frame = builder.frame_gen.generate();
    let extracted = path_expr(Expr::slot(input_slot), path);
    Expr::Let {
        frame,
        binds: vec![extracted],
        body: Box::new(make_binary(
            op,
            Expr::LocalVar { frame, index: 0 },
            Expr::Constant(value.clone()),
        )),
    }
}

fn path_expr(input: Expr, path: &str) -> Expr {
    path.split('.')
        .fold(input, |acc, component| make_get_field(acc, component))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CollectionCatalog;
    use crate::config::BuilderConfig;
    use crate::context::{CanonicalQuery, OperationContext};
    use crate::value::Val;

    #[test]
    fn test_eq_predicate_shape() {
        let op_ctx = OperationContext::new();
        let query = CanonicalQuery::simple("test.coll");
        let catalog = CollectionCatalog::new();
        let mut builder =
            StageBuilder::new(&op_ctx, &query, &catalog, BuilderConfig::default())
                .expect("builder");

        let expr = generate_filter_expr(
            &mut builder,
            &MatchExpr::Eq {
                path: "a.b".to_string(),
                value: Val::Int32(5),
            },
            SlotId(9),
        );

        assert_eq!(
            expr.to_string(),
            "let l1 = [getField(getField(s9, \"a\"), \"b\")] in (l1.0 == 5)"
        );
    }

    #[test]
    fn test_and_folds_left() {
        let op_ctx = OperationContext::new();
        let query = CanonicalQuery::simple("test.coll");
        let catalog = CollectionCatalog::new();
        let mut builder =
            StageBuilder::new(&op_ctx, &query, &catalog, BuilderConfig::default())
                .expect("builder");

        let expr = generate_filter_expr(
            &mut builder,
            &MatchExpr::And(vec![
                MatchExpr::Exists {
                    path: "a".to_string(),
                },
                MatchExpr::Exists {
                    path: "b".to_string(),
                },
            ]),
            SlotId(3),
        );

        assert_eq!(
            expr.to_string(),
            "(exists(getField(s3, \"a\")) && exists(getField(s3, \"b\")))"
        );
    }
}
