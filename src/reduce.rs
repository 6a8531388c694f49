//! Reductions of expressions to host scalars.

use crate::context::Queue;
use crate::expr::{self, IntoExpr};
use crate::vector::Vector;
use crate::{Error, Result};
use shardex_kernels::{KernelElem, ReduceOp};
use std::marker::PhantomData;

/// Folds an expression to one scalar with an associative, commutative
/// operator.
///
/// Each shard reduces its part inside one kernel with a tree fold; the
/// per-shard results are then combined on the host in shard order. With a
/// non-associative operator the combination order is unspecified.
#[derive(Debug, Clone)]
pub struct Reductor<T> {
    queues: Vec<Queue>,
    op: ReduceOp,
    _marker: PhantomData<T>,
}

impl<T: KernelElem> Reductor<T> {
    pub fn new(queues: &[Queue], op: ReduceOp) -> Result<Self> {
        if queues.is_empty() {
            return Err(Error::InvalidPartition(
                "reductor needs at least one queue".into(),
            ));
        }
        Ok(Self {
            queues: queues.to_vec(),
            op,
            _marker: PhantomData,
        })
    }

    pub fn sum(queues: &[Queue]) -> Result<Self> {
        Self::new(queues, ReduceOp::Sum)
    }

    pub fn product(queues: &[Queue]) -> Result<Self> {
        Self::new(queues, ReduceOp::Product)
    }

    pub fn min(queues: &[Queue]) -> Result<Self> {
        Self::new(queues, ReduceOp::Min)
    }

    pub fn max(queues: &[Queue]) -> Result<Self> {
        Self::new(queues, ReduceOp::Max)
    }

    pub fn op(&self) -> ReduceOp {
        self.op
    }

    pub fn queues(&self) -> &[Queue] {
        &self.queues
    }

    /// Evaluates `e` and folds it. An expression over zero elements yields
    /// the operator's identity.
    ///
    /// # Errors
    ///
    /// `Error::PartitionMismatch` if the operands are not distributed over
    /// this reductor's queues, `Error::InvalidExpression` if `e` has no
    /// vector operand.
    pub fn apply(&self, e: impl IntoExpr<T>) -> Result<T> {
        expr::eval::reduce(&self.queues, e.into_expr().node(), self.op)
    }
}

/// `sum(a * b)` over the queues of `a`.
pub fn inner_product<T: KernelElem>(a: &Vector<T>, b: &Vector<T>) -> Result<T> {
    Reductor::sum(a.queues())?.apply(a * b)
}
