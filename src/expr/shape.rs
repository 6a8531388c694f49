//! Lowering of expression trees to value-free shapes.

use super::{Node, ProductLeaf, VectorLeaf};
use crate::{Error, Result};
use shardex_kernels::{Instr, Program, ReduceOp, ScalarType, ScalarValue};
use std::fmt;

/// The structural signature of an expression: element type, operator tags in
/// postfix order and the optional reduction. It is the kernel cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape {
    scalar: ScalarType,
    program: Program,
}

impl Shape {
    pub fn scalar(&self) -> ScalarType {
        self.scalar
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn reduce_op(&self) -> Option<ReduceOp> {
        self.program.reduce_op()
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.scalar.short_name(), self.program)
    }
}

/// Runtime value bound to one kernel parameter.
#[derive(Debug, Clone)]
pub enum Param {
    Vector(VectorLeaf),
    Scalar(ScalarValue),
    Product(ProductLeaf),
}

/// Lowers `node` into its shape and the parameters in binding order.
///
/// Leaves are numbered left to right. Element types are checked again here
/// since `Node` variants can be built directly.
pub fn lower(node: &Node, reduce: Option<ReduceOp>) -> Result<(Shape, Vec<Param>)> {
    let scalar = node.scalar_type();
    let mut instrs = Vec::new();
    let mut params = Vec::new();
    walk(node, scalar, &mut instrs, &mut params)?;
    let program = Program::new(instrs, reduce)?;
    Ok((Shape { scalar, program }, params))
}

fn walk(
    node: &Node,
    scalar: ScalarType,
    instrs: &mut Vec<Instr>,
    params: &mut Vec<Param>,
) -> Result<()> {
    let leaf_type = match node {
        Node::Vector(v) => Some(v.scalar),
        Node::Const(c) => Some(c.scalar_type()),
        Node::Product(p) => Some(p.matrix.scalar),
        _ => None,
    };
    if let Some(got) = leaf_type {
        if got != scalar {
            return Err(Error::TypeMismatch {
                expected: scalar,
                got,
            });
        }
    }
    match node {
        Node::Vector(v) => {
            instrs.push(Instr::Vector(params.len()));
            params.push(Param::Vector(v.clone()));
        }
        Node::Const(c) => {
            instrs.push(Instr::Scalar(params.len()));
            params.push(Param::Scalar(*c));
        }
        Node::Product(p) => {
            if p.x.scalar != scalar {
                return Err(Error::TypeMismatch {
                    expected: scalar,
                    got: p.x.scalar,
                });
            }
            instrs.push(Instr::SpMv(params.len()));
            params.push(Param::Product(p.clone()));
        }
        Node::Unary(op, a) => {
            walk(a, scalar, instrs, params)?;
            instrs.push(Instr::Unary(*op));
        }
        Node::Binary(op, a, b) => {
            walk(a, scalar, instrs, params)?;
            walk(b, scalar, instrs, params)?;
            instrs.push(Instr::Binary(*op));
        }
    }
    Ok(())
}
