//! Boundary with the native compute runtime.
//!
//! The engine only needs a handful of primitives from a device runtime:
//! enumerate platforms and devices, create one in-order queue per device,
//! allocate buffers, compile a generated kernel for a device, and enqueue
//! transfers and launches. These are captured by the [`Backend`],
//! [`NativeQueue`] and [`NativeKernel`] traits.
//!
//! [`HostBackend`] is the reference implementation: simulated devices whose
//! queues are worker threads and whose kernels run on the host with `rayon`.

use crate::device::{DeviceDescriptor, PlatformInfo};
use crate::expr::KernelSource;
use parking_lot::Mutex;
use shardex_kernels::{Buffer, BufferKind, ScalarValue};
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

pub mod event;
pub mod host;

pub use event::{Event, Staging};
pub use host::HostBackend;

/// A native buffer. Only the queue that owns it touches its contents.
pub type BufferHandle = Arc<Mutex<Buffer>>;

/// A device runtime.
pub trait Backend: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Platforms in enumeration order.
    fn platforms(&self) -> Vec<PlatformInfo>;

    /// Devices of `platform` in enumeration order.
    fn devices(&self, platform: &PlatformInfo) -> Vec<DeviceDescriptor>;

    fn create_queue(&self, device: &DeviceDescriptor) -> Result<Arc<dyn NativeQueue>, String>;

    /// Compiles `source` for `device`.
    ///
    /// A source with a [`work_group_size`](KernelSource::work_group_size)
    /// must be launched by the returned kernel as one work-group of that
    /// size. On failure returns the compiler diagnostic.
    fn build(
        &self,
        device: &DeviceDescriptor,
        source: &KernelSource,
    ) -> Result<Arc<dyn NativeKernel>, String>;
}

/// In-order command queue of one device.
pub trait NativeQueue: Send + Sync + fmt::Debug {
    fn device(&self) -> &DeviceDescriptor;

    /// Allocates a zero-filled buffer.
    fn alloc(&self, kind: BufferKind, len: usize) -> Result<BufferHandle, String>;

    /// Appends `command` to the queue. Commands run in submission order.
    fn enqueue(&self, command: Command) -> Event;
}

/// A kernel compiled for one device.
pub trait NativeKernel: Send + Sync + fmt::Debug {
    /// Runs over `n` elements, writing into `output`.
    fn launch(&self, n: usize, args: &[KernelArg], output: &BufferHandle) -> Result<(), String>;
}

#[derive(Debug, Clone)]
pub enum KernelArg {
    Buffer(BufferHandle),
    Scalar(ScalarValue),
}

pub enum Command {
    Write {
        dst: BufferHandle,
        offset: usize,
        data: Buffer,
    },
    Read {
        src: BufferHandle,
        range: Range<usize>,
        into: Staging,
    },
    /// Reads the elements at `indices` (in order) into `into`.
    Gather {
        src: BufferHandle,
        indices: Arc<[usize]>,
        into: Staging,
    },
    /// Waits for `after`, then writes the staged block at `offset`.
    WriteStaged {
        dst: BufferHandle,
        offset: usize,
        from: Staging,
        after: Event,
    },
    Copy {
        src: BufferHandle,
        dst: BufferHandle,
    },
    /// Runs `kernel` over `n` elements. Generated reduce kernels write one
    /// value to `output[0]`.
    Launch {
        kernel: Arc<dyn NativeKernel>,
        n: usize,
        args: Vec<KernelArg>,
        output: BufferHandle,
    },
    /// Completes once every earlier command has run.
    Marker,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Write { .. } => "write",
            Command::Read { .. } => "read",
            Command::Gather { .. } => "gather",
            Command::WriteStaged { .. } => "write_staged",
            Command::Copy { .. } => "copy",
            Command::Launch { .. } => "launch",
            Command::Marker => "marker",
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Command::{}", self.name())
    }
}
