use shardex_kernels::{KernelError, ScalarType};
use thiserror::Error;

/// Error type for selection, container and expression operations.
///
/// Every variant carries enough context (sizes, shard index, device name) to
/// diagnose the failure without re-running. No operation is retried; a failed
/// operation leaves its outputs unspecified.
#[derive(Error, Debug)]
pub enum Error {
    /// Device selection matched zero devices.
    #[error("No compute device matched filter {filter}")]
    NoDeviceFound { filter: String },

    /// Malformed partition input (e.g. zero shards).
    #[error("Invalid partition: {0}")]
    InvalidPartition(String),

    /// Operands of one evaluation do not share the target's partition.
    #[error("Partition mismatch: {0}")]
    PartitionMismatch(String),

    /// Incompatible sizes of a matrix, vector or host array.
    #[error("Dimension mismatch in {what}: expected {expected}, got {got}")]
    DimensionMismatch {
        what: String,
        expected: usize,
        got: usize,
    },

    /// Leaves of one expression have different element types.
    #[error("Type mismatch: expected {expected:?}, got {got:?}")]
    TypeMismatch {
        expected: ScalarType,
        got: ScalarType,
    },

    /// The native compiler rejected a generated kernel.
    #[error("Kernel compilation failed on device {device}: {diagnostic}\n{kernel_source}")]
    KernelCompilation {
        device: String,
        kernel_source: String,
        diagnostic: String,
    },

    /// The expression cannot be evaluated in the requested position.
    #[error("Invalid expression: {0}")]
    InvalidExpression(String),

    #[error("Index {index} out of bounds for size {size}")]
    IndexOutOfBounds { index: usize, size: usize },

    /// A command failed on one shard's queue.
    #[error("Device failure on shard {shard} ({device}): {message}")]
    Device {
        shard: usize,
        device: String,
        message: String,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Kernel(#[from] KernelError),
}

pub type Result<T> = std::result::Result<T, Error>;
