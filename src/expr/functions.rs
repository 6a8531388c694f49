//! Builtin math functions over expressions.

use super::{Expr, IntoExpr, Node};
use shardex_kernels::{BinaryOp, KernelElem, UnaryOp};

/// A constant broadcast to every element.
pub fn constant<T: KernelElem>(value: T) -> Expr<T> {
    Expr::from_node(Node::Const(value.into_value()))
}

macro_rules! unary_fn {
    ($($(#[$doc:meta])* $name:ident => $op:expr;)*) => {
        $(
            $(#[$doc])*
            pub fn $name<T: KernelElem>(x: impl IntoExpr<T>) -> Expr<T> {
                x.into_expr().unary($op)
            }
        )*
    };
}

unary_fn! {
    sqrt => UnaryOp::Sqrt;
    abs => UnaryOp::Abs;
    exp => UnaryOp::Exp;
    /// Natural logarithm.
    log => UnaryOp::Log;
    sin => UnaryOp::Sin;
    cos => UnaryOp::Cos;
    tan => UnaryOp::Tan;
}

pub fn pow<T: KernelElem>(base: impl IntoExpr<T>, exponent: impl IntoExpr<T>) -> Expr<T> {
    base.into_expr().binary(BinaryOp::Pow, exponent.into_expr())
}

/// Element-wise minimum.
pub fn min<T: KernelElem>(a: impl IntoExpr<T>, b: impl IntoExpr<T>) -> Expr<T> {
    a.into_expr().binary(BinaryOp::Min, b.into_expr())
}

/// Element-wise maximum.
pub fn max<T: KernelElem>(a: impl IntoExpr<T>, b: impl IntoExpr<T>) -> Expr<T> {
    a.into_expr().binary(BinaryOp::Max, b.into_expr())
}
