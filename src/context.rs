//! Execution contexts, queues and device buffers.
//!
//! A [`Context`] is created by one [`select`](crate::device::select) call and
//! spans exactly the matched devices. It owns the state every container built
//! over its queues shares: the kernel cache, the registry of interned
//! [`Layout`]s and the allocation tracker.

use crate::backend::{Backend, BufferHandle, Command, Event, NativeKernel, NativeQueue};
use crate::device::DeviceDescriptor;
use crate::expr::cache::build_all;
use crate::expr::{KernelCache, KernelSource};
use crate::partition::Partition;
use crate::{Error, Result};
use parking_lot::Mutex;
use shardex_kernels::BufferKind;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

static NEXT_CONTEXT: AtomicUsize = AtomicUsize::new(1);
static NEXT_QUEUE: AtomicUsize = AtomicUsize::new(1);

type LayoutKey = (usize, Vec<usize>);

#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    id: usize,
    backend: Arc<dyn Backend>,
    devices: Vec<DeviceDescriptor>,
    kernels: KernelCache,
    layouts: Mutex<HashMap<LayoutKey, Weak<Layout>>>,
    allocated: Arc<AtomicUsize>,
}

impl Context {
    pub(crate) fn new(backend: Arc<dyn Backend>, devices: Vec<DeviceDescriptor>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                id: NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed),
                backend,
                devices,
                kernels: KernelCache::new(),
                layouts: Mutex::new(HashMap::new()),
                allocated: Arc::new(AtomicUsize::new(0)),
            }),
        }
    }

    /// Process-unique identity of this context.
    pub fn id(&self) -> usize {
        self.inner.id
    }

    pub fn devices(&self) -> &[DeviceDescriptor] {
        &self.inner.devices
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.inner.backend
    }

    pub fn kernels(&self) -> &KernelCache {
        &self.inner.kernels
    }

    /// Number of kernel shapes compiled so far.
    pub fn compilations(&self) -> usize {
        self.inner.kernels.compilations()
    }

    pub fn cached_kernels(&self) -> usize {
        self.inner.kernels.len()
    }

    /// Bytes held by live device buffers allocated through this context.
    pub fn allocated_bytes(&self) -> usize {
        self.inner.allocated.load(Ordering::Relaxed)
    }

    /// Compiles a custom kernel for every device of this context.
    ///
    /// The result is indexed by [`Queue::device_index`]. Launching it is up
    /// to the caller, typically one [`Command::Launch`] per shard over
    /// [`Vector::buffer`](crate::Vector::buffer). Custom kernels bypass the
    /// kernel cache.
    ///
    /// # Errors
    ///
    /// `Error::KernelCompilation` with the diagnostic of the first device
    /// that rejects `source`.
    pub fn build(&self, source: &KernelSource) -> Result<Vec<Arc<dyn NativeKernel>>> {
        debug!(
            context = self.inner.id,
            kernel = source.name(),
            devices = self.inner.devices.len(),
            "building custom kernel"
        );
        build_all(self.inner.backend.as_ref(), &self.inner.devices, source)
    }

    pub fn same(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn create_queue(&self, device_index: usize) -> Result<Queue> {
        let device = self.inner.devices.get(device_index).ok_or(Error::IndexOutOfBounds {
            index: device_index,
            size: self.inner.devices.len(),
        })?;
        let native = self
            .inner
            .backend
            .create_queue(device)
            .map_err(|message| Error::Device {
                shard: device_index,
                device: device.to_string(),
                message,
            })?;
        Ok(Queue {
            context: self.clone(),
            native,
            device_index,
            id: NEXT_QUEUE.fetch_add(1, Ordering::Relaxed),
        })
    }

    /// The layout of `n` elements over `queues`.
    ///
    /// Containers of equal size over the same queue list share one `Layout`
    /// instance for as long as any of them is alive, which is what makes
    /// identity comparison of layouts meaningful.
    ///
    /// # Errors
    ///
    /// `Error::InvalidPartition` if `queues` is empty or spans several
    /// contexts.
    pub fn layout(&self, n: usize, queues: &[Queue]) -> Result<Arc<Layout>> {
        if let Some(q) = queues.iter().find(|q| !q.context.same(self)) {
            return Err(Error::InvalidPartition(format!(
                "queue on {} belongs to another context",
                q.device()
            )));
        }
        let partition = Partition::plan(n, queues.len())?;
        let key = (n, queues.iter().map(|q| q.id).collect::<Vec<_>>());
        let mut layouts = self.inner.layouts.lock();
        if let Some(layout) = layouts.get(&key).and_then(Weak::upgrade) {
            return Ok(layout);
        }
        layouts.retain(|_, weak| weak.strong_count() > 0);
        let layout = Arc::new(Layout {
            partition,
            queues: queues.to_vec(),
        });
        layouts.insert(key, Arc::downgrade(&layout));
        trace!(context = self.inner.id, n, shards = queues.len(), "new layout");
        Ok(layout)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("backend", &self.inner.backend.name())
            .field("devices", &self.inner.devices.len())
            .finish()
    }
}

/// In-order submission channel of one device.
///
/// Queues are cheap handles; clones refer to the same native queue.
#[derive(Clone)]
pub struct Queue {
    context: Context,
    native: Arc<dyn NativeQueue>,
    device_index: usize,
    id: usize,
}

impl Queue {
    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn device(&self) -> &DeviceDescriptor {
        self.native.device()
    }

    /// Position of this queue's device within its context.
    pub fn device_index(&self) -> usize {
        self.device_index
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn enqueue(&self, command: Command) -> Event {
        self.native.enqueue(command)
    }

    /// Allocates a zero-filled buffer on this queue's device.
    pub fn alloc(&self, kind: BufferKind, len: usize) -> std::result::Result<DeviceBuffer, String> {
        let handle = self.native.alloc(kind, len)?;
        let bytes = kind.size_of() * len;
        let tracker = self.context.inner.allocated.clone();
        tracker.fetch_add(bytes, Ordering::Relaxed);
        Ok(DeviceBuffer {
            handle,
            kind,
            len,
            tracker,
        })
    }

    /// Blocks until everything queued so far has run.
    pub fn finish(&self) -> Result<()> {
        self.enqueue(Command::Marker)
            .wait()
            .map_err(|message| self.error(self.device_index, message))
    }

    pub(crate) fn error(&self, shard: usize, message: impl Into<String>) -> Error {
        Error::Device {
            shard,
            device: self.device().to_string(),
            message: message.into(),
        }
    }
}

impl PartialEq for Queue {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Queue {}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("id", &self.id)
            .field("device", &self.device().to_string())
            .finish()
    }
}

/// A native buffer owned by one shard of a container.
pub struct DeviceBuffer {
    handle: BufferHandle,
    kind: BufferKind,
    len: usize,
    tracker: Arc<AtomicUsize>,
}

impl DeviceBuffer {
    pub fn handle(&self) -> &BufferHandle {
        &self.handle
    }

    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        self.tracker
            .fetch_sub(self.kind.size_of() * self.len, Ordering::Relaxed);
    }
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceBuffer({:?} x {})", self.kind, self.len)
    }
}

/// A partition together with the queues its shards live on.
///
/// Obtained from [`Context::layout`]; all operands of one evaluation must
/// share the same instance.
#[derive(Debug)]
pub struct Layout {
    partition: Partition,
    queues: Vec<Queue>,
}

impl Layout {
    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn queues(&self) -> &[Queue] {
        &self.queues
    }

    pub fn len(&self) -> usize {
        self.partition.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partition.is_empty()
    }

    pub fn context(&self) -> &Context {
        // A layout always has at least one queue; see `Context::layout`.
        self.queues[0].context()
    }

    /// Allocates one buffer per shard, sized to the shard.
    pub(crate) fn alloc_shards(&self, kind: BufferKind) -> Result<Vec<DeviceBuffer>> {
        self.queues
            .iter()
            .enumerate()
            .map(|(shard, q)| {
                q.alloc(kind, self.partition.part_size(shard))
                    .map_err(|m| q.error(shard, m))
            })
            .collect()
    }

    /// Waits for every `(shard, event)` pair, then reports the first failure.
    pub(crate) fn wait(&self, events: Vec<(usize, Event)>) -> Result<()> {
        wait_all(&self.queues, events)
    }
}

/// Waits for all events; the first failure (in submission order) is returned
/// only after every event has completed.
pub(crate) fn wait_all(queues: &[Queue], events: Vec<(usize, Event)>) -> Result<()> {
    let mut first = None;
    for (shard, event) in events {
        if let Err(message) = event.wait() {
            if first.is_none() {
                first = Some(queues[shard].error(shard, message));
            }
        }
    }
    match first {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HostBackend;
    use crate::config::HostConfig;
    use crate::device::{DeviceType, Filter, select};

    fn queues(k: usize) -> (Context, Vec<Queue>) {
        let backend = HostBackend::shared(&HostConfig::uniform(DeviceType::Gpu, k));
        select(&backend, &Filter::All).unwrap()
    }

    #[test]
    fn test_layouts_are_interned() {
        let (ctx, q) = queues(2);
        let a = ctx.layout(8, &q).unwrap();
        let b = ctx.layout(8, &q).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.partition().boundaries(), &[0, 4, 8]);

        let c = ctx.layout(9, &q).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        let reversed: Vec<Queue> = q.iter().rev().cloned().collect();
        let d = ctx.layout(8, &reversed).unwrap();
        assert!(!Arc::ptr_eq(&a, &d));
    }

    #[test]
    fn test_layout_rejects_foreign_queues() {
        let (ctx, q) = queues(1);
        let (_, other) = queues(1);
        let mixed = vec![q[0].clone(), other[0].clone()];
        assert!(matches!(
            ctx.layout(4, &mixed),
            Err(Error::InvalidPartition(_))
        ));
        assert!(matches!(ctx.layout(4, &[]), Err(Error::InvalidPartition(_))));
    }

    #[test]
    fn test_allocation_tracking() {
        let (ctx, q) = queues(1);
        assert_eq!(ctx.allocated_bytes(), 0);
        let buf = q[0].alloc(BufferKind::F64, 10).unwrap();
        assert_eq!(ctx.allocated_bytes(), 80);
        drop(buf);
        assert_eq!(ctx.allocated_bytes(), 0);
    }

    #[test]
    fn test_wait_all_reports_first_failure() {
        let (_, q) = queues(2);
        let events = vec![
            (0, Event::failed("first")),
            (1, Event::failed("second")),
        ];
        match wait_all(&q, events) {
            Err(Error::Device { shard, message, .. }) => {
                assert_eq!(shard, 0);
                assert_eq!(message, "first");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(q[1].finish().is_ok());
    }
}
