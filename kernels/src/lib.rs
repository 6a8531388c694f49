//! Host compute kernels for `shardex`.
//!
//! This crate holds everything that runs *inside* one shard: the element trait,
//! the closed set of operator tags, the lowered postfix [`Program`] that an
//! expression graph compiles to, CSR row products and the tree reduction.
//! It knows nothing about devices, queues or partitions.

use num_traits::{Float, FromPrimitive, ToPrimitive};
use std::fmt::Debug;
use std::ops::Range;
use thiserror::Error;

pub mod csr;
pub mod ops;
pub mod program;
pub mod reduce;

pub use csr::CsrView;
pub use ops::{BinaryOp, ReduceOp, UnaryOp};
pub use program::{ArgView, Instr, ParamKind, Program};
pub use reduce::tree_reduce;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum KernelError {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("Buffer kind mismatch: expected {expected:?}, got {got:?}")]
    KindMismatch { expected: BufferKind, got: BufferKind },
    #[error("Argument {index}: expected {expected}")]
    Argument { index: usize, expected: &'static str },
    #[error("Malformed program: {0}")]
    MalformedProgram(String),
    #[error("Column index {col} out of range for {cols} columns")]
    ColumnOutOfRange { col: usize, cols: usize },
}

pub type Result<T> = std::result::Result<T, KernelError>;

/// Element type of an expression or vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    F32,
    F64,
}

impl ScalarType {
    /// Type name used in generated kernel source.
    pub fn c_name(self) -> &'static str {
        match self {
            ScalarType::F32 => "float",
            ScalarType::F64 => "double",
        }
    }

    pub fn short_name(self) -> &'static str {
        match self {
            ScalarType::F32 => "f32",
            ScalarType::F64 => "f64",
        }
    }

    pub fn buffer_kind(self) -> BufferKind {
        match self {
            ScalarType::F32 => BufferKind::F32,
            ScalarType::F64 => BufferKind::F64,
        }
    }
}

/// A scalar value carried by a constant leaf or a kernel argument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScalarValue {
    F32(f32),
    F64(f64),
}

impl ScalarValue {
    pub fn scalar_type(&self) -> ScalarType {
        match self {
            ScalarValue::F32(_) => ScalarType::F32,
            ScalarValue::F64(_) => ScalarType::F64,
        }
    }
}

/// Kind of a device buffer. `Index` holds CSR row pointers and column indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    F32,
    F64,
    Index,
}

impl BufferKind {
    /// Bytes per element as laid out on a device (`Index` is a 64-bit `ulong`).
    pub fn size_of(self) -> usize {
        match self {
            BufferKind::F32 => 4,
            BufferKind::F64 | BufferKind::Index => 8,
        }
    }
}

/// Contents of one native buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum Buffer {
    F32(Vec<f32>),
    F64(Vec<f64>),
    Index(Vec<usize>),
}

impl Buffer {
    pub fn zeroed(kind: BufferKind, len: usize) -> Self {
        match kind {
            BufferKind::F32 => Buffer::F32(vec![0.0; len]),
            BufferKind::F64 => Buffer::F64(vec![0.0; len]),
            BufferKind::Index => Buffer::Index(vec![0; len]),
        }
    }

    pub fn kind(&self) -> BufferKind {
        match self {
            Buffer::F32(_) => BufferKind::F32,
            Buffer::F64(_) => BufferKind::F64,
            Buffer::Index(_) => BufferKind::Index,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Buffer::F32(v) => v.len(),
            Buffer::F64(v) => v.len(),
            Buffer::Index(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_index(&self) -> Option<&[usize]> {
        match self {
            Buffer::Index(v) => Some(v),
            _ => None,
        }
    }

    /// Copies `range` out into a new buffer of the same kind.
    pub fn slice(&self, range: Range<usize>) -> Result<Buffer> {
        if range.start > range.end || range.end > self.len() {
            return Err(KernelError::ShapeMismatch {
                expected: vec![self.len()],
                got: vec![range.start, range.end],
            });
        }
        Ok(match self {
            Buffer::F32(v) => Buffer::F32(v[range].to_vec()),
            Buffer::F64(v) => Buffer::F64(v[range].to_vec()),
            Buffer::Index(v) => Buffer::Index(v[range].to_vec()),
        })
    }

    /// Collects the elements at `indices`, in order.
    pub fn gather(&self, indices: &[usize]) -> Result<Buffer> {
        let len = self.len();
        if let Some(&bad) = indices.iter().find(|&&i| i >= len) {
            return Err(KernelError::ShapeMismatch {
                expected: vec![len],
                got: vec![bad],
            });
        }
        Ok(match self {
            Buffer::F32(v) => Buffer::F32(indices.iter().map(|&i| v[i]).collect()),
            Buffer::F64(v) => Buffer::F64(indices.iter().map(|&i| v[i]).collect()),
            Buffer::Index(v) => Buffer::Index(indices.iter().map(|&i| v[i]).collect()),
        })
    }

    /// Overwrites `src.len()` elements starting at `offset`.
    pub fn write_at(&mut self, offset: usize, src: &Buffer) -> Result<()> {
        if self.kind() != src.kind() {
            return Err(KernelError::KindMismatch {
                expected: self.kind(),
                got: src.kind(),
            });
        }
        let end = offset + src.len();
        if end > self.len() {
            return Err(KernelError::ShapeMismatch {
                expected: vec![self.len()],
                got: vec![end],
            });
        }
        match (self, src) {
            (Buffer::F32(dst), Buffer::F32(s)) => dst[offset..end].copy_from_slice(s),
            (Buffer::F64(dst), Buffer::F64(s)) => dst[offset..end].copy_from_slice(s),
            (Buffer::Index(dst), Buffer::Index(s)) => dst[offset..end].copy_from_slice(s),
            _ => unreachable!("kinds checked above"),
        }
        Ok(())
    }
}

/// Trait bound for elements that can be processed by kernels.
///
/// Implemented for `f32` and `f64`, the two element types device kernels are
/// generated for.
pub trait KernelElem:
    Float + FromPrimitive + ToPrimitive + Debug + Default + Send + Sync + 'static
{
    const SCALAR: ScalarType;

    fn into_buffer(data: Vec<Self>) -> Buffer;

    fn view(buffer: &Buffer) -> Option<&[Self]>;

    fn into_value(self) -> ScalarValue;

    fn from_value(value: ScalarValue) -> Option<Self>;
}

macro_rules! impl_kernel_elem {
    ($t:ty, $variant:ident) => {
        impl KernelElem for $t {
            const SCALAR: ScalarType = ScalarType::$variant;

            fn into_buffer(data: Vec<Self>) -> Buffer {
                Buffer::$variant(data)
            }

            fn view(buffer: &Buffer) -> Option<&[Self]> {
                match buffer {
                    Buffer::$variant(v) => Some(v),
                    _ => None,
                }
            }

            fn into_value(self) -> ScalarValue {
                ScalarValue::$variant(self)
            }

            fn from_value(value: ScalarValue) -> Option<Self> {
                match value {
                    ScalarValue::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

impl_kernel_elem!(f32, F32);
impl_kernel_elem!(f64, F64);
