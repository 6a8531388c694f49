//! Expression graphs over distributed vectors.
//!
//! Arithmetic on [`Vector`]s, [`Expr`]s and scalars builds an immutable
//! [`Node`] tree and does nothing else. The tree is evaluated when it is
//! assigned to a vector or handed to a [`Reductor`](crate::Reductor): it is
//! lowered to a value-free [`Shape`], the kernel for that shape is fetched
//! from the context's [`KernelCache`] (generated and compiled on first use),
//! and one launch per shard is queued with that shard's buffers bound.
//!
//! `Expr<T>` is typed by its element type, so mixing `f32` and `f64` leaves
//! does not compile. The untyped [`Node`] API checks the same rule at
//! construction time and reports [`Error::TypeMismatch`].

use crate::context::{DeviceBuffer, Layout};
use crate::spmat::SpMatData;
use crate::vector::Vector;
use crate::{Error, Result};
use shardex_kernels::{BinaryOp, KernelElem, ScalarType, ScalarValue, UnaryOp};
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Add, Div, Mul, Neg, Sub};
use std::sync::Arc;

pub mod cache;
pub mod codegen;
pub(crate) mod eval;
pub mod functions;
pub mod shape;

pub use cache::{CompiledKernel, KernelCache};
pub use codegen::KernelSource;
pub use functions::{abs, constant, cos, exp, log, max, min, pow, sin, sqrt, tan};
pub use shape::Shape;

/// Reference to the shard buffers of a vector.
#[derive(Clone)]
pub struct VectorLeaf {
    pub(crate) scalar: ScalarType,
    pub(crate) layout: Arc<Layout>,
    pub(crate) shards: Arc<[DeviceBuffer]>,
}

impl VectorLeaf {
    pub fn scalar_type(&self) -> ScalarType {
        self.scalar
    }

    pub fn len(&self) -> usize {
        self.layout.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.is_empty()
    }
}

impl fmt::Debug for VectorLeaf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vector<{}>[{}]", self.scalar.short_name(), self.len())
    }
}

/// Sparse matrix-vector product `A * x`.
#[derive(Clone)]
pub struct ProductLeaf {
    pub(crate) matrix: Arc<SpMatData>,
    pub(crate) x: VectorLeaf,
}

impl fmt::Debug for ProductLeaf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "spmat<{}>[{}] * {:?}",
            self.matrix.scalar.short_name(),
            self.matrix.layout.len(),
            self.x
        )
    }
}

/// Untyped expression node.
#[derive(Clone)]
pub enum Node {
    Vector(VectorLeaf),
    Const(ScalarValue),
    Product(ProductLeaf),
    Unary(UnaryOp, Arc<Node>),
    Binary(BinaryOp, Arc<Node>, Arc<Node>),
}

impl Node {
    pub fn constant(value: ScalarValue) -> Self {
        Node::Const(value)
    }

    pub fn unary(op: UnaryOp, operand: Node) -> Self {
        Node::Unary(op, Arc::new(operand))
    }

    /// Combines two nodes, rejecting operands of different element types.
    pub fn binary(op: BinaryOp, lhs: Node, rhs: Node) -> Result<Self> {
        let (expected, got) = (lhs.scalar_type(), rhs.scalar_type());
        if expected != got {
            return Err(Error::TypeMismatch { expected, got });
        }
        Ok(Node::Binary(op, Arc::new(lhs), Arc::new(rhs)))
    }

    /// Element type, taken from the leftmost leaf.
    pub fn scalar_type(&self) -> ScalarType {
        match self {
            Node::Vector(v) => v.scalar,
            Node::Const(c) => c.scalar_type(),
            Node::Product(p) => p.matrix.scalar,
            Node::Unary(_, a) => a.scalar_type(),
            Node::Binary(_, a, _) => a.scalar_type(),
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Vector(v) => write!(f, "{:?}", v),
            Node::Const(c) => write!(f, "{:?}", c),
            Node::Product(p) => write!(f, "({:?})", p),
            Node::Unary(op, a) => write!(f, "{}({:?})", op.name(), a),
            Node::Binary(op, a, b) => write!(f, "{}({:?}, {:?})", op.name(), a, b),
        }
    }
}

impl<T: KernelElem> From<&Vector<T>> for Node {
    fn from(v: &Vector<T>) -> Self {
        Node::Vector(v.leaf())
    }
}

/// A typed expression producing elements of type `T`.
pub struct Expr<T> {
    node: Node,
    _marker: PhantomData<T>,
}

impl<T> Clone for Expr<T> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Expr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Expr({:?})", self.node)
    }
}

impl<T: KernelElem> Expr<T> {
    /// Wraps a node already known to have element type `T`.
    pub(crate) fn from_node(node: Node) -> Self {
        Self {
            node,
            _marker: PhantomData,
        }
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn into_node(self) -> Node {
        self.node
    }

    pub(crate) fn unary(self, op: UnaryOp) -> Self {
        Self::from_node(Node::unary(op, self.node))
    }

    pub(crate) fn binary(self, op: BinaryOp, rhs: Expr<T>) -> Self {
        Self::from_node(Node::Binary(op, Arc::new(self.node), Arc::new(rhs.node)))
    }
}

impl<T: KernelElem> TryFrom<Node> for Expr<T> {
    type Error = Error;

    fn try_from(node: Node) -> Result<Self> {
        let got = node.scalar_type();
        if got != T::SCALAR {
            return Err(Error::TypeMismatch {
                expected: T::SCALAR,
                got,
            });
        }
        Ok(Self::from_node(node))
    }
}

/// Anything usable as an operand of an expression with element type `T`.
pub trait IntoExpr<T> {
    fn into_expr(self) -> Expr<T>;
}

impl<T: KernelElem> IntoExpr<T> for Expr<T> {
    fn into_expr(self) -> Expr<T> {
        self
    }
}

impl<T: KernelElem> IntoExpr<T> for &Expr<T> {
    fn into_expr(self) -> Expr<T> {
        self.clone()
    }
}

impl<T: KernelElem> IntoExpr<T> for &Vector<T> {
    fn into_expr(self) -> Expr<T> {
        Expr::from_node(Node::from(self))
    }
}

macro_rules! impl_scalar_operand {
    ($t:ty) => {
        impl IntoExpr<$t> for $t {
            fn into_expr(self) -> Expr<$t> {
                Expr::from_node(Node::Const(self.into_value()))
            }
        }
    };
}

impl_scalar_operand!(f32);
impl_scalar_operand!(f64);

macro_rules! impl_binary_ops {
    ($lhs:ty) => {
        impl_binary_ops!($lhs, Add, add, BinaryOp::Add);
        impl_binary_ops!($lhs, Sub, sub, BinaryOp::Sub);
        impl_binary_ops!($lhs, Mul, mul, BinaryOp::Mul);
        impl_binary_ops!($lhs, Div, div, BinaryOp::Div);

        impl<T: KernelElem> Neg for $lhs {
            type Output = Expr<T>;

            fn neg(self) -> Expr<T> {
                self.into_expr().unary(UnaryOp::Neg)
            }
        }
    };
    ($lhs:ty, $trait:ident, $method:ident, $op:expr) => {
        impl<T: KernelElem, R: IntoExpr<T>> $trait<R> for $lhs {
            type Output = Expr<T>;

            fn $method(self, rhs: R) -> Expr<T> {
                self.into_expr().binary($op, rhs.into_expr())
            }
        }
    };
}

impl_binary_ops!(Expr<T>);
impl_binary_ops!(&Expr<T>);
impl_binary_ops!(&Vector<T>);

// Scalars on the left: `2.0 * &x`, `1.0 - e`.
macro_rules! impl_scalar_lhs {
    ($t:ty) => {
        impl_scalar_lhs!($t, Expr<$t>);
        impl_scalar_lhs!($t, &Expr<$t>);
        impl_scalar_lhs!($t, &Vector<$t>);
    };
    ($t:ty, $rhs:ty) => {
        impl Add<$rhs> for $t {
            type Output = Expr<$t>;

            fn add(self, rhs: $rhs) -> Expr<$t> {
                self.into_expr().binary(BinaryOp::Add, rhs.into_expr())
            }
        }

        impl Sub<$rhs> for $t {
            type Output = Expr<$t>;

            fn sub(self, rhs: $rhs) -> Expr<$t> {
                self.into_expr().binary(BinaryOp::Sub, rhs.into_expr())
            }
        }

        impl Mul<$rhs> for $t {
            type Output = Expr<$t>;

            fn mul(self, rhs: $rhs) -> Expr<$t> {
                self.into_expr().binary(BinaryOp::Mul, rhs.into_expr())
            }
        }

        impl Div<$rhs> for $t {
            type Output = Expr<$t>;

            fn div(self, rhs: $rhs) -> Expr<$t> {
                self.into_expr().binary(BinaryOp::Div, rhs.into_expr())
            }
        }
    };
}

impl_scalar_lhs!(f32);
impl_scalar_lhs!(f64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_binary_checks_types() {
        let a = Node::constant(ScalarValue::F32(1.0));
        let b = Node::constant(ScalarValue::F64(2.0));
        assert!(matches!(
            Node::binary(BinaryOp::Add, a.clone(), b),
            Err(Error::TypeMismatch {
                expected: ScalarType::F32,
                got: ScalarType::F64
            })
        ));
        let ok = Node::binary(BinaryOp::Add, a.clone(), a).unwrap();
        assert_eq!(ok.scalar_type(), ScalarType::F32);
    }

    #[test]
    fn test_try_from_node() {
        let node = Node::unary(UnaryOp::Neg, Node::constant(ScalarValue::F64(3.0)));
        assert!(Expr::<f64>::try_from(node.clone()).is_ok());
        assert!(matches!(
            Expr::<f32>::try_from(node),
            Err(Error::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_scalar_operators_build_graph() {
        let e: Expr<f64> = 2.0 * (constant(1.0f64) + 3.0);
        assert_eq!(format!("{:?}", e), "Expr(mul(F64(2.0), add(F64(1.0), F64(3.0))))");
        let n = -constant(1.0f32);
        assert_eq!(format!("{:?}", n.node()), "neg(F32(1.0))");
    }
}
