//! The constant-expression evaluator.
//!
//! Rather than a separate interpreter, a constant expression is lowered
//! through the ordinary expression lowerer in `ExprContext::Const`, inside
//! a scratch function so no instruction can escape into the function under
//! construction. The expression
//! lowerer folds arithmetic on `IrValue::ConstInt` operands directly rather
//! than emitting an instruction; this module only has to check that the
//! *final* value came out foldable.

use crate::ast::{Expr, Node};
use crate::env::Env;
use crate::error::{LowerError, LowerResult};
use crate::expr::{lower_expr, ExprContext};
use crate::ir::{IrValue, TransUnit};
use crate::types::TypeId;

/// Lowers `expr` as a constant expression, returning its folded value and
/// C type. Errors if any sub-expression requires a runtime value (loading
/// a local variable, calling a function, ...).
pub fn eval_const_expr(
    env: &mut Env,
    tu: &mut TransUnit,
    expr: &Node<Expr>,
) -> LowerResult<(IrValue, TypeId)> {
    let (value, ty) = env.with_scratch(tu, |env, tu| lower_expr(env, tu, expr, ExprContext::Const))?;
    if !value.is_compile_time_constant() {
        return Err(LowerError::ill_formed(
            "expression is not a compile-time constant",
            expr.position.clone(),
        ));
    }
    Ok((value, ty))
}

/// Evaluates an array-bound or enumerator-initializer expression to a
/// plain integer.
pub fn eval_array_length(env: &mut Env, tu: &mut TransUnit, expr: &Node<Expr>) -> LowerResult<u64> {
    let (value, _ty) = eval_const_expr(env, tu, expr)?;
    match value {
        IrValue::ConstInt { value, .. } if value >= 0 => Ok(value as u64),
        IrValue::ConstInt { .. } => Err(LowerError::ill_formed(
            "array size must not be negative",
            expr.position.clone(),
        )),
        _ => Err(LowerError::ill_formed(
            "array size must be an integer constant",
            expr.position.clone(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{BinaryOp, IntSuffix};
    use crate::env::{Env, Options};
    use crate::error::Position;

    fn pos() -> Position {
        Position::new("<test>", 1, 1)
    }

    fn int_lit(value: i128) -> Node<Expr> {
        Node::new(
            Expr::IntLiteral {
                value,
                suffix: IntSuffix::None,
            },
            pos(),
        )
    }

    fn binary(op: BinaryOp, lhs: Node<Expr>, rhs: Node<Expr>) -> Node<Expr> {
        Node::new(
            Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            pos(),
        )
    }

    #[test]
    fn folds_arithmetic_on_literals() {
        let mut tu = TransUnit::new();
        let mut env = Env::new(&mut tu, Options::default());
        // (2 + 3) * 4 == 20
        let expr = binary(
            BinaryOp::Mul,
            binary(BinaryOp::Add, int_lit(2), int_lit(3)),
            int_lit(4),
        );
        let (value, _ty) = eval_const_expr(&mut env, &mut tu, &expr).unwrap();
        match value {
            IrValue::ConstInt { value, .. } => assert_eq!(value, 20),
            other => panic!("expected a folded constant, got {other:?}"),
        }
    }

    #[test]
    fn array_length_rejects_negative_values() {
        let mut tu = TransUnit::new();
        let mut env = Env::new(&mut tu, Options::default());
        let expr = Node::new(
            Expr::Unary {
                op: crate::ast::UnaryOp::Minus,
                operand: Box::new(int_lit(1)),
            },
            pos(),
        );
        assert!(eval_array_length(&mut env, &mut tu, &expr).is_err());
    }

    #[test]
    fn array_length_reads_off_a_positive_literal() {
        let mut tu = TransUnit::new();
        let mut env = Env::new(&mut tu, Options::default());
        let expr = int_lit(16);
        assert_eq!(eval_array_length(&mut env, &mut tu, &expr).unwrap(), 16);
    }
}
