//! Operator tags.
//!
//! Every tag is a closed enum variant; the host evaluator dispatches on the tag
//! with a `match`, and the source generator maps each tag to one fixed
//! fragment. The `name` of a tag is what appears in a graph shape.

use num_traits::Float;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Abs,
    Sqrt,
    Exp,
    Log,
    Sin,
    Cos,
    Tan,
}

impl UnaryOp {
    #[inline]
    pub fn apply<T: Float>(self, a: T) -> T {
        match self {
            UnaryOp::Neg => -a,
            UnaryOp::Abs => a.abs(),
            UnaryOp::Sqrt => a.sqrt(),
            UnaryOp::Exp => a.exp(),
            UnaryOp::Log => a.ln(),
            UnaryOp::Sin => a.sin(),
            UnaryOp::Cos => a.cos(),
            UnaryOp::Tan => a.tan(),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            UnaryOp::Neg => "neg",
            UnaryOp::Abs => "abs",
            UnaryOp::Sqrt => "sqrt",
            UnaryOp::Exp => "exp",
            UnaryOp::Log => "log",
            UnaryOp::Sin => "sin",
            UnaryOp::Cos => "cos",
            UnaryOp::Tan => "tan",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Min,
    Max,
}

impl BinaryOp {
    #[inline]
    pub fn apply<T: Float>(self, a: T, b: T) -> T {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            BinaryOp::Pow => a.powf(b),
            BinaryOp::Min => a.min(b),
            BinaryOp::Max => a.max(b),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Pow => "pow",
            BinaryOp::Min => "min",
            BinaryOp::Max => "max",
        }
    }
}

/// Folding operator of a reduction.
///
/// Must be associative and commutative. `All` and `Any` treat nonzero as true
/// and yield `1` or `0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    Sum,
    Product,
    Min,
    Max,
    All,
    Any,
}

impl ReduceOp {
    pub fn identity<T: Float>(self) -> T {
        match self {
            ReduceOp::Sum | ReduceOp::Any => T::zero(),
            ReduceOp::Product | ReduceOp::All => T::one(),
            ReduceOp::Min => T::infinity(),
            ReduceOp::Max => T::neg_infinity(),
        }
    }

    #[inline]
    pub fn combine<T: Float>(self, a: T, b: T) -> T {
        match self {
            ReduceOp::Sum => a + b,
            ReduceOp::Product => a * b,
            ReduceOp::Min => a.min(b),
            ReduceOp::Max => a.max(b),
            ReduceOp::All => truth(a != T::zero() && b != T::zero()),
            ReduceOp::Any => truth(a != T::zero() || b != T::zero()),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ReduceOp::Sum => "sum",
            ReduceOp::Product => "product",
            ReduceOp::Min => "min",
            ReduceOp::Max => "max",
            ReduceOp::All => "all",
            ReduceOp::Any => "any",
        }
    }
}

fn truth<T: Float>(b: bool) -> T {
    if b { T::one() } else { T::zero() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unary_apply() {
        assert_eq!(UnaryOp::Neg.apply(2.0f64), -2.0);
        assert_eq!(UnaryOp::Abs.apply(-3.0f32), 3.0);
        assert_eq!(UnaryOp::Sqrt.apply(16.0f64), 4.0);
        assert!((UnaryOp::Log.apply(std::f64::consts::E) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_binary_apply() {
        assert_eq!(BinaryOp::Sub.apply(5.0f64, 3.0), 2.0);
        assert_eq!(BinaryOp::Pow.apply(2.0f64, 10.0), 1024.0);
        assert_eq!(BinaryOp::Min.apply(2.0f32, -1.0), -1.0);
        assert_eq!(BinaryOp::Max.apply(2.0f32, -1.0), 2.0);
    }

    #[test]
    fn test_reduce_identity_is_neutral() {
        let ops = [
            ReduceOp::Sum,
            ReduceOp::Product,
            ReduceOp::Min,
            ReduceOp::Max,
            ReduceOp::All,
            ReduceOp::Any,
        ];
        for op in ops {
            for x in [0.0f64, 1.0, 3.5] {
                let expected = match op {
                    ReduceOp::All | ReduceOp::Any => (x != 0.0) as u8 as f64,
                    _ => x,
                };
                assert_eq!(op.combine(op.identity(), x), expected, "{:?}", op);
            }
        }
    }
}
