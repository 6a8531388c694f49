//! Distributed sparse matrices.
//!
//! A square CSR matrix is split by rows along the same partition as the
//! vectors it multiplies. Within each shard the nonzeros whose column falls
//! in the shard's own row range form the *local* block, with columns rebased
//! to the shard. All other nonzeros form the *remote* block; their columns
//! are collected into the shard's sorted *import set* and renumbered as
//! positions in it.
//!
//! Before a product every shard needs the elements of `x` named by its import
//! set. Because partitions are contiguous, the imports owned by one shard form
//! one contiguous run of the import set, so the exchange is planned once, at
//! construction, as one [`Transfer`] per (importer, owner) pair: the owner
//! gathers the elements and the importer writes them into its import buffer
//! at the run's offset. The importer's kernel launch is queued after that
//! write, which is the only cross-shard ordering a product needs.

use crate::backend::{Command, Event, KernelArg, Staging};
use crate::context::{DeviceBuffer, Layout, Queue};
use crate::expr::{Expr, Node, ProductLeaf, VectorLeaf};
use crate::partition::Partition;
use crate::vector::Vector;
use crate::{Error, Result};
use shardex_kernels::{Buffer, BufferKind, KernelElem, ScalarType};
use std::fmt;
use std::marker::PhantomData;
use std::ops::Mul;
use std::sync::Arc;
use tracing::{debug, trace};

/// Elements of `x` moved from one shard to another before a product.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    /// Shard owning the elements.
    pub from: usize,
    /// Shard importing them.
    pub to: usize,
    /// Positions within the owner's shard of `x`.
    pub indices: Arc<[usize]>,
    /// Where the run starts in the importer's import buffer.
    pub offset: usize,
}

/// One CSR block on the host.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct HostBlock<T> {
    pub(crate) row_ptr: Vec<usize>,
    pub(crate) col: Vec<usize>,
    pub(crate) val: Vec<T>,
}

impl<T> HostBlock<T> {
    fn new() -> Self {
        Self {
            row_ptr: vec![0],
            col: Vec::new(),
            val: Vec::new(),
        }
    }

    fn end_row(&mut self) {
        self.row_ptr.push(self.col.len());
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct HostShard<T> {
    pub(crate) local: HostBlock<T>,
    pub(crate) remote: HostBlock<T>,
    /// Global column indices, sorted and deduplicated.
    pub(crate) imports: Vec<usize>,
}

/// Checks the CSR arrays of an `n x n` matrix.
pub(crate) fn validate<T>(n: usize, row_ptr: &[usize], col: &[usize], val: &[T]) -> Result<()> {
    if row_ptr.len() != n + 1 {
        return Err(Error::DimensionMismatch {
            what: "row pointer array".into(),
            expected: n + 1,
            got: row_ptr.len(),
        });
    }
    if row_ptr[0] != 0 || row_ptr.windows(2).any(|w| w[0] > w[1]) {
        return Err(Error::InvalidExpression(
            "row pointers must start at 0 and be non-decreasing".into(),
        ));
    }
    let nnz = row_ptr[n];
    if col.len() != nnz || val.len() != nnz {
        return Err(Error::DimensionMismatch {
            what: "column and value arrays".into(),
            expected: nnz,
            got: if col.len() != nnz { col.len() } else { val.len() },
        });
    }
    if let Some((pos, &c)) = col.iter().enumerate().find(|(_, c)| **c >= n) {
        return Err(Error::DimensionMismatch {
            what: format!("column count (column index at position {})", pos),
            expected: n,
            got: c + 1,
        });
    }
    Ok(())
}

/// Splits validated CSR arrays into per-shard local and remote blocks.
pub(crate) fn split<T: Copy>(
    partition: &Partition,
    row_ptr: &[usize],
    col: &[usize],
    val: &[T],
) -> Vec<HostShard<T>> {
    (0..partition.shard_count())
        .map(|shard| {
            let own = partition.range(shard);
            let mut local = HostBlock::new();
            let mut remote = HostBlock::new();
            for row in own.clone() {
                for j in row_ptr[row]..row_ptr[row + 1] {
                    if own.contains(&col[j]) {
                        local.col.push(col[j] - own.start);
                        local.val.push(val[j]);
                    } else {
                        remote.col.push(col[j]);
                        remote.val.push(val[j]);
                    }
                }
                local.end_row();
                remote.end_row();
            }
            let mut imports = remote.col.clone();
            imports.sort_unstable();
            imports.dedup();
            for c in remote.col.iter_mut() {
                *c = imports.binary_search(c).unwrap_or_else(|p| p);
            }
            HostShard {
                local,
                remote,
                imports,
            }
        })
        .collect()
}

/// One transfer per (importer, owner) pair with a nonempty intersection.
pub(crate) fn plan_transfers<T>(
    partition: &Partition,
    shards: &[HostShard<T>],
) -> Result<Vec<Transfer>> {
    let mut transfers = Vec::new();
    for (to, shard) in shards.iter().enumerate() {
        let mut start = 0;
        while start < shard.imports.len() {
            let (from, _) = partition.locate(shard.imports[start])?;
            let owned = partition.range(from);
            let len = shard.imports[start..]
                .iter()
                .take_while(|c| owned.contains(c))
                .count();
            let indices: Vec<usize> = shard.imports[start..start + len]
                .iter()
                .map(|c| c - owned.start)
                .collect();
            transfers.push(Transfer {
                from,
                to,
                indices: indices.into(),
                offset: start,
            });
            start += len;
        }
    }
    Ok(transfers)
}

struct DeviceBlock {
    row_ptr: DeviceBuffer,
    col: DeviceBuffer,
    val: DeviceBuffer,
    nnz: usize,
}

struct MatrixShard {
    local: DeviceBlock,
    remote: DeviceBlock,
    imports: Vec<usize>,
}

/// Device-side state shared by a matrix and the expressions referring to it.
pub(crate) struct SpMatData {
    pub(crate) scalar: ScalarType,
    pub(crate) layout: Arc<Layout>,
    shards: Vec<MatrixShard>,
    transfers: Vec<Transfer>,
}

impl SpMatData {
    /// Queues the boundary exchange for `x` and returns the per-shard import
    /// buffers. Events of every queued command are appended to `events`.
    pub(crate) fn exchange(
        &self,
        x: &VectorLeaf,
        events: &mut Vec<(usize, Event)>,
    ) -> Result<Vec<DeviceBuffer>> {
        let queues = self.layout.queues();
        let kind = self.scalar.buffer_kind();
        let imports = self
            .shards
            .iter()
            .zip(queues)
            .enumerate()
            .map(|(shard, (m, q))| {
                q.alloc(kind, m.imports.len())
                    .map_err(|e| q.error(shard, e))
            })
            .collect::<Result<Vec<_>>>()?;

        // All gathers go out before any staged write, so a staged write only
        // ever waits on a command queued earlier than itself.
        let mut staged = Vec::with_capacity(self.transfers.len());
        for t in &self.transfers {
            let staging = Staging::new();
            let gathered = queues[t.from].enqueue(Command::Gather {
                src: x.shards[t.from].handle().clone(),
                indices: t.indices.clone(),
                into: staging.clone(),
            });
            events.push((t.from, gathered.clone()));
            staged.push((t, staging, gathered));
        }
        for (t, staging, gathered) in staged {
            let written = queues[t.to].enqueue(Command::WriteStaged {
                dst: imports[t.to].handle().clone(),
                offset: t.offset,
                from: staging,
                after: gathered,
            });
            events.push((t.to, written));
        }
        trace!(transfers = self.transfers.len(), "boundary exchange queued");
        Ok(imports)
    }

    /// Kernel arguments of one shard: local block, remote block, `x`, imports.
    pub(crate) fn shard_args(
        &self,
        shard: usize,
        x: &VectorLeaf,
        imports: &DeviceBuffer,
    ) -> Vec<KernelArg> {
        let m = &self.shards[shard];
        [
            &m.local.row_ptr,
            &m.local.col,
            &m.local.val,
            &m.remote.row_ptr,
            &m.remote.col,
            &m.remote.val,
            &x.shards[shard],
            imports,
        ]
        .into_iter()
        .map(|b| KernelArg::Buffer(b.handle().clone()))
        .collect()
    }
}

/// A square sparse matrix distributed by rows.
pub struct SpMat<T> {
    data: Arc<SpMatData>,
    _marker: PhantomData<T>,
}

impl<T: KernelElem> SpMat<T> {
    /// Builds an `n x n` matrix from CSR arrays and uploads its shards.
    ///
    /// # Errors
    ///
    /// `Error::DimensionMismatch` if `row_ptr` does not have `n + 1` entries,
    /// `col` and `val` do not match the nonzero count, or a column index is
    /// not below `n`. `Error::InvalidPartition` if `queues` is empty.
    pub fn new(
        queues: &[Queue],
        n: usize,
        row_ptr: &[usize],
        col: &[usize],
        val: &[T],
    ) -> Result<Self> {
        let first = queues
            .first()
            .ok_or_else(|| Error::InvalidPartition("matrix needs at least one queue".into()))?;
        let layout = first.context().layout(n, queues)?;
        validate(n, row_ptr, col, val)?;

        let host = split(layout.partition(), row_ptr, col, val);
        let transfers = plan_transfers(layout.partition(), &host)?;
        debug!(
            rows = n,
            nnz = col.len(),
            shards = queues.len(),
            transfers = transfers.len(),
            "partitioned sparse matrix"
        );

        let mut events = Vec::new();
        let uploaded = upload(&layout, host, &mut events);
        let waited = layout.wait(events);
        let shards = uploaded.and_then(|s| waited.map(|_| s))?;

        Ok(Self {
            data: Arc::new(SpMatData {
                scalar: T::SCALAR,
                layout,
                shards,
                transfers,
            }),
            _marker: PhantomData,
        })
    }

    /// Number of rows (and columns).
    pub fn rows(&self) -> usize {
        self.data.layout.len()
    }

    pub fn nnz(&self) -> usize {
        self.data
            .shards
            .iter()
            .map(|s| s.local.nnz + s.remote.nnz)
            .sum()
    }

    pub fn layout(&self) -> &Arc<Layout> {
        &self.data.layout
    }

    pub fn partition(&self) -> &Partition {
        self.data.layout.partition()
    }

    pub fn queues(&self) -> &[Queue] {
        self.data.layout.queues()
    }

    /// Global indices of the elements of `x` that `shard` imports.
    pub fn import_set(&self, shard: usize) -> &[usize] {
        &self.data.shards[shard].imports
    }

    pub fn local_nnz(&self, shard: usize) -> usize {
        self.data.shards[shard].local.nnz
    }

    pub fn remote_nnz(&self, shard: usize) -> usize {
        self.data.shards[shard].remote.nnz
    }

    /// The exchange plan, in importer order.
    pub fn transfers(&self) -> &[Transfer] {
        &self.data.transfers
    }

    /// The product `self * x` as an expression.
    ///
    /// # Errors
    ///
    /// `Error::DimensionMismatch` if `x` does not share the matrix's row
    /// partition.
    pub fn product(&self, x: &Vector<T>) -> Result<Expr<T>> {
        if !Arc::ptr_eq(&self.data.layout, x.layout()) {
            return Err(Error::DimensionMismatch {
                what: "sparse product operand (row partition)".into(),
                expected: self.rows(),
                got: x.len(),
            });
        }
        Ok(self.product_unchecked(x))
    }

    fn product_unchecked(&self, x: &Vector<T>) -> Expr<T> {
        Expr::from_node(Node::Product(ProductLeaf {
            matrix: self.data.clone(),
            x: x.leaf(),
        }))
    }
}

fn upload<T: KernelElem>(
    layout: &Layout,
    host: Vec<HostShard<T>>,
    events: &mut Vec<(usize, Event)>,
) -> Result<Vec<MatrixShard>> {
    host.into_iter()
        .zip(layout.queues())
        .enumerate()
        .map(|(shard, (h, queue))| {
            let local = upload_block(queue, shard, h.local, events)?;
            let remote = upload_block(queue, shard, h.remote, events)?;
            Ok(MatrixShard {
                local,
                remote,
                imports: h.imports,
            })
        })
        .collect()
}

fn upload_block<T: KernelElem>(
    queue: &Queue,
    shard: usize,
    block: HostBlock<T>,
    events: &mut Vec<(usize, Event)>,
) -> Result<DeviceBlock> {
    let nnz = block.col.len();
    let mut put = |kind: BufferKind, data: Buffer| -> Result<DeviceBuffer> {
        let buffer = queue
            .alloc(kind, data.len())
            .map_err(|e| queue.error(shard, e))?;
        let event = queue.enqueue(Command::Write {
            dst: buffer.handle().clone(),
            offset: 0,
            data,
        });
        events.push((shard, event));
        Ok(buffer)
    };
    Ok(DeviceBlock {
        row_ptr: put(BufferKind::Index, Buffer::Index(block.row_ptr))?,
        col: put(BufferKind::Index, Buffer::Index(block.col))?,
        val: put(T::SCALAR.buffer_kind(), T::into_buffer(block.val))?,
        nnz,
    })
}

impl<T> Clone for SpMat<T> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: KernelElem> fmt::Debug for SpMat<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpMat")
            .field("rows", &self.rows())
            .field("nnz", &self.nnz())
            .field("shards", &self.queues().len())
            .finish()
    }
}

/// Deferred product; the partition check happens when the expression is
/// evaluated.
impl<T: KernelElem> Mul<&Vector<T>> for &SpMat<T> {
    type Output = Expr<T>;

    fn mul(self, x: &Vector<T>) -> Expr<T> {
        self.product_unchecked(x)
    }
}
