//! Distributed vectors.
//!
//! A [`Vector`] holds one native buffer per shard of its [`Layout`]. Every
//! operation on it, including single-element access, is queued on the owning
//! shard's queue, so a read always observes the writes queued before it.

use crate::backend::{BufferHandle, Command, Staging};
use crate::context::{DeviceBuffer, Layout, Queue};
use crate::expr::{self, Expr, IntoExpr, VectorLeaf};
use crate::partition::Partition;
use crate::{Error, Result};
use shardex_kernels::KernelElem;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

pub struct Vector<T> {
    layout: Arc<Layout>,
    shards: Arc<[DeviceBuffer]>,
    _marker: PhantomData<T>,
}

impl<T: KernelElem> Vector<T> {
    /// A zero-filled vector of `n` elements over `queues`.
    pub fn new(queues: &[Queue], n: usize) -> Result<Self> {
        let first = queues
            .first()
            .ok_or_else(|| Error::InvalidPartition("vector needs at least one queue".into()))?;
        let layout = first.context().layout(n, queues)?;
        Self::with_layout(layout)
    }

    pub(crate) fn with_layout(layout: Arc<Layout>) -> Result<Self> {
        let shards = layout.alloc_shards(T::SCALAR.buffer_kind())?;
        Ok(Self {
            layout,
            shards: shards.into(),
            _marker: PhantomData,
        })
    }

    pub fn filled(queues: &[Queue], n: usize, value: T) -> Result<Self> {
        let v = Self::new(queues, n)?;
        if value != T::zero() {
            v.fill(value)?;
        }
        Ok(v)
    }

    pub fn from_slice(queues: &[Queue], data: &[T]) -> Result<Self> {
        let v = Self::new(queues, data.len())?;
        v.copy_from(data)?;
        Ok(v)
    }

    pub fn len(&self) -> usize {
        self.layout.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.is_empty()
    }

    pub fn layout(&self) -> &Arc<Layout> {
        &self.layout
    }

    pub fn partition(&self) -> &Partition {
        self.layout.partition()
    }

    pub fn queues(&self) -> &[Queue] {
        self.layout.queues()
    }

    pub fn part_size(&self, shard: usize) -> usize {
        self.partition().part_size(shard)
    }

    pub fn part_start(&self, shard: usize) -> usize {
        self.partition().part_start(shard)
    }

    /// Native buffer of `shard`, for use with custom kernels.
    pub fn buffer(&self, shard: usize) -> &BufferHandle {
        self.shards[shard].handle()
    }

    pub(crate) fn leaf(&self) -> VectorLeaf {
        VectorLeaf {
            scalar: T::SCALAR,
            layout: self.layout.clone(),
            shards: self.shards.clone(),
        }
    }

    /// Blocking upload of `data`, split along the partition.
    pub fn copy_from(&self, data: &[T]) -> Result<()> {
        self.check_host_len(data.len())?;
        let events = self
            .queues()
            .iter()
            .enumerate()
            .map(|(shard, queue)| {
                let range = self.partition().range(shard);
                let event = queue.enqueue(Command::Write {
                    dst: self.buffer(shard).clone(),
                    offset: 0,
                    data: T::into_buffer(data[range].to_vec()),
                });
                (shard, event)
            })
            .collect();
        self.layout.wait(events)
    }

    /// Blocking download into `out`, concatenating shards in order.
    pub fn copy_to(&self, out: &mut [T]) -> Result<()> {
        self.check_host_len(out.len())?;
        let mut events = Vec::new();
        let mut staged = Vec::new();
        for (shard, queue) in self.queues().iter().enumerate() {
            let staging = Staging::new();
            let event = queue.enqueue(Command::Read {
                src: self.buffer(shard).clone(),
                range: 0..self.part_size(shard),
                into: staging.clone(),
            });
            events.push((shard, event));
            staged.push(staging);
        }
        self.layout.wait(events)?;
        for (shard, staging) in staged.into_iter().enumerate() {
            let range = self.partition().range(shard);
            let buffer = staging
                .take()
                .ok_or_else(|| self.queues()[shard].error(shard, "read returned no data"))?;
            let values = T::view(&buffer)
                .ok_or_else(|| self.queues()[shard].error(shard, "read returned wrong type"))?;
            out[range].copy_from_slice(values);
        }
        Ok(())
    }

    pub fn to_vec(&self) -> Result<Vec<T>> {
        let mut out = vec![T::zero(); self.len()];
        self.copy_to(&mut out)?;
        Ok(out)
    }

    /// Reads one element. Costs a round trip to the owning device.
    pub fn get(&self, index: usize) -> Result<T> {
        let (shard, offset) = self.partition().locate(index)?;
        let queue = &self.queues()[shard];
        let staging = Staging::new();
        queue
            .enqueue(Command::Read {
                src: self.buffer(shard).clone(),
                range: offset..offset + 1,
                into: staging.clone(),
            })
            .wait()
            .map_err(|m| queue.error(shard, m))?;
        staging
            .take()
            .and_then(|b| T::view(&b).and_then(|v| v.first().copied()))
            .ok_or_else(|| queue.error(shard, "read returned no data"))
    }

    /// Writes one element. Costs a round trip to the owning device.
    pub fn set(&self, index: usize, value: T) -> Result<()> {
        let (shard, offset) = self.partition().locate(index)?;
        let queue = &self.queues()[shard];
        queue
            .enqueue(Command::Write {
                dst: self.buffer(shard).clone(),
                offset,
                data: T::into_buffer(vec![value]),
            })
            .wait()
            .map_err(|m| queue.error(shard, m))
    }

    /// Evaluates `e` into this vector.
    ///
    /// # Errors
    ///
    /// `Error::PartitionMismatch` if an operand does not share this vector's
    /// layout, `Error::KernelCompilation` if the kernel for a new expression
    /// shape fails to build, `Error::Device` if a shard fails.
    pub fn assign(&self, e: impl IntoExpr<T>) -> Result<()> {
        expr::eval::assign(&self.leaf(), e.into_expr().node())
    }

    /// `self += e`
    pub fn assign_add(&self, e: impl IntoExpr<T>) -> Result<()> {
        self.assign(self + e)
    }

    /// `self -= e`
    pub fn assign_sub(&self, e: impl IntoExpr<T>) -> Result<()> {
        self.assign(self - e)
    }

    pub fn fill(&self, value: T) -> Result<()> {
        self.assign(expr::constant(value))
    }

    /// Changes the size to `n`, keeping the first `min(len, n)` elements.
    /// New elements are zero.
    pub fn resize(&mut self, n: usize) -> Result<()> {
        if n == self.len() {
            return Ok(());
        }
        let mut data = self.to_vec()?;
        data.resize(n, T::zero());
        let layout = self.layout.context().layout(n, self.queues())?;
        let resized = Self::with_layout(layout)?;
        resized.copy_from(&data)?;
        *self = resized;
        Ok(())
    }

    /// Exchanges the contents (and layouts) of two vectors.
    pub fn swap(&mut self, other: &mut Vector<T>) {
        std::mem::swap(self, other);
    }

    /// A copy of this vector made on the devices.
    pub fn try_clone(&self) -> Result<Self> {
        let copy = Self::with_layout(self.layout.clone())?;
        let events = self
            .queues()
            .iter()
            .enumerate()
            .map(|(shard, queue)| {
                let event = queue.enqueue(Command::Copy {
                    src: self.buffer(shard).clone(),
                    dst: copy.buffer(shard).clone(),
                });
                (shard, event)
            })
            .collect();
        self.layout.wait(events)?;
        Ok(copy)
    }

    fn check_host_len(&self, got: usize) -> Result<()> {
        if got != self.len() {
            return Err(Error::DimensionMismatch {
                what: "host array".into(),
                expected: self.len(),
                got,
            });
        }
        Ok(())
    }

    /// This vector as an expression operand.
    pub fn expr(&self) -> Expr<T> {
        self.into_expr()
    }
}

impl<T: KernelElem> fmt::Debug for Vector<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vector")
            .field("type", &T::SCALAR)
            .field("len", &self.len())
            .field("boundaries", &self.partition().boundaries())
            .finish()
    }
}
