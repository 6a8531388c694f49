//! Lowered expression programs.
//!
//! An expression graph is lowered to a postfix instruction list. Leaves become
//! numbered parameters in left-to-right order; operators pop their operands
//! and push the result. The instruction list (plus an optional reduction) is
//! the structural shape of the graph: two graphs that differ only in the
//! runtime values bound to their leaves lower to equal programs.
//!
//! The host evaluator runs the program over fixed-size chunks of the output,
//! one chunk per `rayon` task, keeping one temporary column per stack slot.

use crate::csr::{CsrView, spmv_rows};
use crate::{BinaryOp, KernelElem, KernelError, ReduceOp, Result, UnaryOp, tree_reduce};
use rayon::prelude::*;
use std::fmt;

const CHUNK: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Instr {
    /// Load element `idx` of vector parameter `n`.
    Vector(usize),
    /// Broadcast scalar parameter `n`.
    Scalar(usize),
    /// Row `idx` of the sparse product bound to parameter `n`.
    SpMv(usize),
    Unary(UnaryOp),
    Binary(BinaryOp),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKind {
    Vector,
    Scalar,
    SpMv,
}

impl ParamKind {
    /// Number of native kernel arguments a parameter of this kind occupies.
    ///
    /// A sparse product binds the local block (row pointers, columns, values),
    /// the remote block (same three), the shard's operand vector and the
    /// imported boundary elements.
    pub fn arity(self) -> usize {
        match self {
            ParamKind::Vector | ParamKind::Scalar => 1,
            ParamKind::SpMv => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ParamKind::Vector => "vector",
            ParamKind::Scalar => "scalar",
            ParamKind::SpMv => "sparse product",
        }
    }
}

/// Kernel argument as seen by the host evaluator.
#[derive(Debug, Clone, Copy)]
pub enum ArgView<'a, T> {
    Vector(&'a [T]),
    Scalar(T),
    SpMv {
        local: CsrView<'a, T>,
        remote: CsrView<'a, T>,
        x: &'a [T],
        imports: &'a [T],
    },
}

impl<T: KernelElem> ArgView<'_, T> {
    fn load(&self, start: usize, len: usize) -> Vec<T> {
        match self {
            ArgView::Vector(v) => v[start..start + len].to_vec(),
            ArgView::Scalar(s) => vec![*s; len],
            ArgView::SpMv {
                local,
                remote,
                x,
                imports,
            } => spmv_rows(local, x, remote, imports, start..start + len),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Program {
    instrs: Vec<Instr>,
    params: Vec<ParamKind>,
    reduce: Option<ReduceOp>,
}

impl Program {
    /// Validates stack discipline and parameter numbering.
    ///
    /// # Errors
    ///
    /// Returns `KernelError::MalformedProgram` if an operator would underflow
    /// the stack, the program does not leave exactly one value, or leaf
    /// parameters are not numbered `0, 1, 2, ...` in order of appearance.
    pub fn new(instrs: Vec<Instr>, reduce: Option<ReduceOp>) -> Result<Self> {
        let mut depth = 0usize;
        let mut params = Vec::new();
        for instr in &instrs {
            match *instr {
                Instr::Vector(p) | Instr::Scalar(p) | Instr::SpMv(p) => {
                    if p != params.len() {
                        return Err(KernelError::MalformedProgram(format!(
                            "parameter {} appears where {} was expected",
                            p,
                            params.len()
                        )));
                    }
                    params.push(match instr {
                        Instr::Vector(_) => ParamKind::Vector,
                        Instr::Scalar(_) => ParamKind::Scalar,
                        _ => ParamKind::SpMv,
                    });
                    depth += 1;
                }
                Instr::Unary(op) => {
                    if depth < 1 {
                        return Err(KernelError::MalformedProgram(format!(
                            "{} has no operand",
                            op.name()
                        )));
                    }
                }
                Instr::Binary(op) => {
                    if depth < 2 {
                        return Err(KernelError::MalformedProgram(format!(
                            "{} needs two operands",
                            op.name()
                        )));
                    }
                    depth -= 1;
                }
            }
        }
        if depth != 1 {
            return Err(KernelError::MalformedProgram(format!(
                "program leaves {} values on the stack",
                depth
            )));
        }
        Ok(Self {
            instrs,
            params,
            reduce,
        })
    }

    pub fn instrs(&self) -> &[Instr] {
        &self.instrs
    }

    pub fn params(&self) -> &[ParamKind] {
        &self.params
    }

    pub fn reduce_op(&self) -> Option<ReduceOp> {
        self.reduce
    }

    fn check_args<T: KernelElem>(&self, n: usize, args: &[ArgView<'_, T>]) -> Result<()> {
        if args.len() != self.params.len() {
            return Err(KernelError::ShapeMismatch {
                expected: vec![self.params.len()],
                got: vec![args.len()],
            });
        }
        for (index, (kind, arg)) in self.params.iter().zip(args).enumerate() {
            match (kind, arg) {
                (ParamKind::Vector, ArgView::Vector(v)) => {
                    if v.len() != n {
                        return Err(KernelError::ShapeMismatch {
                            expected: vec![n],
                            got: vec![v.len()],
                        });
                    }
                }
                (ParamKind::Scalar, ArgView::Scalar(_)) => {}
                (
                    ParamKind::SpMv,
                    ArgView::SpMv {
                        local,
                        remote,
                        x,
                        imports,
                    },
                ) => {
                    if local.rows() != n || remote.rows() != n {
                        return Err(KernelError::ShapeMismatch {
                            expected: vec![n, n],
                            got: vec![local.rows(), remote.rows()],
                        });
                    }
                    if local.cols() != x.len() || remote.cols() != imports.len() {
                        return Err(KernelError::ShapeMismatch {
                            expected: vec![local.cols(), remote.cols()],
                            got: vec![x.len(), imports.len()],
                        });
                    }
                }
                (kind, _) => {
                    return Err(KernelError::Argument {
                        index,
                        expected: kind.name(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Evaluates the program element-wise over `n` elements.
    pub fn eval<T: KernelElem>(&self, n: usize, args: &[ArgView<'_, T>]) -> Result<Vec<T>> {
        self.check_args(n, args)?;
        let mut out = vec![T::zero(); n];
        out.par_chunks_mut(CHUNK)
            .enumerate()
            .for_each(|(chunk, dst)| self.eval_chunk(chunk * CHUNK, dst, args));
        Ok(out)
    }

    /// Evaluates the program and folds the results with its reduction.
    pub fn eval_reduce<T: KernelElem>(&self, n: usize, args: &[ArgView<'_, T>]) -> Result<T> {
        let op = self.reduce.ok_or_else(|| {
            KernelError::MalformedProgram("program has no reduction".into())
        })?;
        Ok(tree_reduce(self.eval(n, args)?, op))
    }

    fn eval_chunk<T: KernelElem>(&self, start: usize, dst: &mut [T], args: &[ArgView<'_, T>]) {
        let len = dst.len();
        let mut stack: Vec<Vec<T>> = Vec::with_capacity(4);
        for instr in &self.instrs {
            match *instr {
                Instr::Vector(p) | Instr::Scalar(p) | Instr::SpMv(p) => {
                    stack.push(args[p].load(start, len));
                }
                Instr::Unary(op) => {
                    if let Some(top) = stack.last_mut() {
                        top.iter_mut().for_each(|v| *v = op.apply(*v));
                    }
                }
                Instr::Binary(op) => {
                    let rhs = stack.pop();
                    if let (Some(rhs), Some(lhs)) = (rhs, stack.last_mut()) {
                        lhs.iter_mut()
                            .zip(rhs)
                            .for_each(|(l, r)| *l = op.apply(*l, r));
                    }
                }
            }
        }
        if let Some(result) = stack.pop() {
            dst.copy_from_slice(&result);
        }
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(op) = self.reduce {
            write!(f, "reduce_{}:", op.name())?;
        } else {
            write!(f, "assign:")?;
        }
        for instr in &self.instrs {
            match instr {
                Instr::Vector(p) => write!(f, " v{}", p)?,
                Instr::Scalar(p) => write!(f, " c{}", p)?,
                Instr::SpMv(p) => write!(f, " spmv{}", p)?,
                Instr::Unary(op) => write!(f, " {}", op.name())?,
                Instr::Binary(op) => write!(f, " {}", op.name())?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn axpy() -> Program {
        // v0 * c1 + v2
        Program::new(
            vec![
                Instr::Vector(0),
                Instr::Scalar(1),
                Instr::Binary(BinaryOp::Mul),
                Instr::Vector(2),
                Instr::Binary(BinaryOp::Add),
            ],
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_eval_elementwise() {
        let x = vec![1.0f64, 2.0, 3.0];
        let y = vec![10.0f64, 20.0, 30.0];
        let args = [ArgView::Vector(&x[..]), ArgView::Scalar(2.0), ArgView::Vector(&y[..])];
        let out = axpy().eval(3, &args).unwrap();
        assert_eq!(out, vec![12.0, 24.0, 36.0]);
    }

    #[test]
    fn test_eval_spans_chunks() {
        let n = CHUNK * 3 + 17;
        let x: Vec<f64> = (0..n).map(|i| i as f64).collect();
        let program = Program::new(
            vec![Instr::Vector(0), Instr::Unary(UnaryOp::Neg)],
            None,
        )
        .unwrap();
        let out = program.eval(n, &[ArgView::Vector(&x[..])]).unwrap();
        assert!(out.iter().enumerate().all(|(i, &v)| v == -(i as f64)));
    }

    #[test]
    fn test_eval_reduce() {
        let x: Vec<f32> = (1..=9).map(|i| i as f32).collect();
        let program = Program::new(vec![Instr::Vector(0)], Some(ReduceOp::Sum)).unwrap();
        let sum = program.eval_reduce(9, &[ArgView::Vector(&x[..])]).unwrap();
        assert_eq!(sum, 45.0);

        let no_reduce = Program::new(vec![Instr::Vector(0)], None).unwrap();
        assert!(no_reduce.eval_reduce(9, &[ArgView::Vector(&x[..])]).is_err());
    }

    #[test]
    fn test_malformed_programs() {
        assert!(Program::new(vec![Instr::Binary(BinaryOp::Add)], None).is_err());
        assert!(Program::new(vec![Instr::Vector(0), Instr::Vector(1)], None).is_err());
        assert!(Program::new(vec![Instr::Vector(1)], None).is_err());
        assert!(Program::new(vec![], None).is_err());
    }

    #[test]
    fn test_argument_checks() {
        let x = vec![1.0f64, 2.0];
        let program = axpy();
        let wrong_kind = [ArgView::Scalar(1.0), ArgView::Scalar(2.0), ArgView::Vector(&x[..])];
        assert!(matches!(
            program.eval(2, &wrong_kind),
            Err(KernelError::Argument { index: 0, .. })
        ));
        let wrong_len = [ArgView::Vector(&x[..]), ArgView::Scalar(2.0), ArgView::Vector(&x[..1])];
        assert!(matches!(
            program.eval(2, &wrong_len),
            Err(KernelError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_display_is_value_free() {
        assert_eq!(axpy().to_string(), "assign: v0 c1 mul v2 add");
        let reduce = Program::new(vec![Instr::Vector(0)], Some(ReduceOp::Max)).unwrap();
        assert_eq!(reduce.to_string(), "reduce_max: v0");
    }

    #[test]
    fn test_spmv_instr() {
        // 2x2 identity, no remote part
        let row = [0usize, 1, 2];
        let col = [0usize, 1];
        let val = [1.0f64, 1.0];
        let empty_row = [0usize, 0, 0];
        let local = CsrView::new(&row, &col, &val, 2).unwrap();
        let remote = CsrView::new(&empty_row, &[], &[], 0).unwrap();
        let x = [4.0, 5.0];
        let program = Program::new(
            vec![Instr::SpMv(0), Instr::Scalar(1), Instr::Binary(BinaryOp::Add)],
            None,
        )
        .unwrap();
        let args = [
            ArgView::SpMv {
                local,
                remote,
                x: &x[..],
                imports: &[],
            },
            ArgView::Scalar(1.0),
        ];
        assert_eq!(program.eval(2, &args).unwrap(), vec![5.0, 6.0]);
    }
}
