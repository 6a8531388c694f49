//! Per-shard dispatch of lowered expressions.

use super::Node;
use super::cache::CompiledKernel;
use super::shape::{Param, Shape, lower};
use crate::backend::{BufferHandle, Command, Event, KernelArg, Staging};
use crate::context::{DeviceBuffer, Layout, Queue};
use crate::expr::VectorLeaf;
use crate::{Error, Result};
use shardex_kernels::{KernelElem, ReduceOp};
use std::sync::Arc;
use tracing::trace;

/// Evaluates `node` into the shard buffers of `target`.
pub(crate) fn assign(target: &VectorLeaf, node: &Node) -> Result<()> {
    let (shape, params) = lower(node, None)?;
    let layout = &target.layout;
    check_operands(layout, &params)?;
    let kernel = compile(layout, &shape)?;

    // `x = A * x` reads x on other shards during the exchange; write through
    // scratch buffers so no shard overwrites x before every import is taken.
    let aliased = params.iter().any(|p| match p {
        Param::Product(p) => Arc::ptr_eq(&p.x.shards, &target.shards),
        _ => false,
    });

    let mut events = Vec::new();
    let mut keep = Vec::new();
    let submitted = submit_assign(target, &params, &kernel, aliased, &mut events, &mut keep);
    let waited = layout.wait(events);
    trace!(kernel = kernel.source().name(), shards = layout.queues().len(), "assigned");
    submitted.and(waited)
}

fn submit_assign(
    target: &VectorLeaf,
    params: &[Param],
    kernel: &CompiledKernel,
    aliased: bool,
    events: &mut Vec<(usize, Event)>,
    keep: &mut Vec<DeviceBuffer>,
) -> Result<()> {
    let imports = exchange(params, events)?;
    let submitted = submit_launches(target, params, kernel, aliased, &imports, events, keep);
    keep.extend(imports.into_iter().flatten());
    submitted
}

fn submit_launches(
    target: &VectorLeaf,
    params: &[Param],
    kernel: &CompiledKernel,
    aliased: bool,
    imports: &[Vec<DeviceBuffer>],
    events: &mut Vec<(usize, Event)>,
    keep: &mut Vec<DeviceBuffer>,
) -> Result<()> {
    let layout = &target.layout;
    let scratch: Option<Vec<BufferHandle>> = if aliased {
        let buffers = layout.alloc_shards(target.shards[0].kind())?;
        let handles = buffers.iter().map(|b| b.handle().clone()).collect();
        keep.extend(buffers);
        Some(handles)
    } else {
        None
    };
    for (shard, queue) in layout.queues().iter().enumerate() {
        let n = layout.partition().part_size(shard);
        if n == 0 {
            continue;
        }
        let output = match &scratch {
            Some(scratch) => scratch[shard].clone(),
            None => target.shards[shard].handle().clone(),
        };
        let event = queue.enqueue(Command::Launch {
            kernel: native(kernel, queue, shard)?,
            n,
            args: bind(params, shard, imports),
            output: output.clone(),
        });
        events.push((shard, event));
        if scratch.is_some() {
            let event = queue.enqueue(Command::Copy {
                src: output,
                dst: target.shards[shard].handle().clone(),
            });
            events.push((shard, event));
        }
    }
    Ok(())
}

/// Evaluates `node` on every shard and folds the results with `op`.
pub(crate) fn reduce<T: KernelElem>(queues: &[Queue], node: &Node, op: ReduceOp) -> Result<T> {
    let (shape, params) = lower(node, Some(op))?;
    let layout = operand_layout(&params)?;
    check_operands(&layout, &params)?;
    if layout.queues() != queues {
        return Err(Error::PartitionMismatch(
            "expression is not distributed over the reductor's queues".into(),
        ));
    }
    let kernel = compile(&layout, &shape)?;

    let mut events = Vec::new();
    let mut partials = Vec::new();
    let mut keep = Vec::new();
    let submitted = submit_reduce(&layout, &params, &kernel, &mut events, &mut partials, &mut keep);
    let waited = layout.wait(events);
    drop(keep);
    submitted.and(waited)?;

    let mut acc = op.identity::<T>();
    for staging in partials.into_iter().flatten() {
        let value = staging
            .take()
            .and_then(|buffer| T::view(&buffer).and_then(|v| v.first().copied()))
            .ok_or_else(|| Error::InvalidExpression("reduction produced no value".into()))?;
        acc = op.combine(acc, value);
    }
    Ok(acc)
}

fn submit_reduce(
    layout: &Layout,
    params: &[Param],
    kernel: &CompiledKernel,
    events: &mut Vec<(usize, Event)>,
    partials: &mut Vec<Option<Staging>>,
    keep: &mut Vec<DeviceBuffer>,
) -> Result<()> {
    let imports = exchange(params, events)?;
    let submitted = submit_partials(layout, params, kernel, &imports, events, partials, keep);
    keep.extend(imports.into_iter().flatten());
    submitted
}

fn submit_partials(
    layout: &Layout,
    params: &[Param],
    kernel: &CompiledKernel,
    imports: &[Vec<DeviceBuffer>],
    events: &mut Vec<(usize, Event)>,
    partials: &mut Vec<Option<Staging>>,
    keep: &mut Vec<DeviceBuffer>,
) -> Result<()> {
    let kind = kernel.source().scalar().buffer_kind();
    for (shard, queue) in layout.queues().iter().enumerate() {
        let n = layout.partition().part_size(shard);
        if n == 0 {
            partials.push(None);
            continue;
        }
        let partial = queue.alloc(kind, 1).map_err(|m| queue.error(shard, m))?;
        let launch = queue.enqueue(Command::Launch {
            kernel: native(kernel, queue, shard)?,
            n,
            args: bind(params, shard, imports),
            output: partial.handle().clone(),
        });
        events.push((shard, launch));
        let staging = Staging::new();
        let read = queue.enqueue(Command::Read {
            src: partial.handle().clone(),
            range: 0..1,
            into: staging.clone(),
        });
        events.push((shard, read));
        partials.push(Some(staging));
        keep.push(partial);
    }
    Ok(())
}

fn operand_layout(params: &[Param]) -> Result<Arc<Layout>> {
    params
        .iter()
        .find_map(|p| match p {
            Param::Vector(v) => Some(v.layout.clone()),
            Param::Product(p) => Some(p.matrix.layout.clone()),
            Param::Scalar(_) => None,
        })
        .ok_or_else(|| Error::InvalidExpression("expression has no vector operand".into()))
}

fn check_operands(layout: &Arc<Layout>, params: &[Param]) -> Result<()> {
    for param in params {
        match param {
            Param::Vector(v) => {
                if !Arc::ptr_eq(&v.layout, layout) {
                    return Err(Error::PartitionMismatch(format!(
                        "operand of {} elements over {} queues does not share the partition \
                         of {} elements over {} queues",
                        v.len(),
                        v.layout.queues().len(),
                        layout.len(),
                        layout.queues().len()
                    )));
                }
            }
            Param::Product(p) => {
                if !Arc::ptr_eq(&p.matrix.layout, &p.x.layout) {
                    return Err(Error::DimensionMismatch {
                        what: "sparse product operand (row partition)".into(),
                        expected: p.matrix.layout.len(),
                        got: p.x.len(),
                    });
                }
                if !Arc::ptr_eq(&p.matrix.layout, layout) {
                    return Err(Error::PartitionMismatch(format!(
                        "product of {} rows does not share the partition of {} elements",
                        p.matrix.layout.len(),
                        layout.len()
                    )));
                }
            }
            Param::Scalar(_) => {}
        }
    }
    Ok(())
}

fn compile(layout: &Layout, shape: &Shape) -> Result<Arc<CompiledKernel>> {
    let context = layout.context();
    context
        .kernels()
        .get_or_compile(context.backend().as_ref(), context.devices(), shape)
}

fn native(
    kernel: &CompiledKernel,
    queue: &Queue,
    shard: usize,
) -> Result<Arc<dyn crate::backend::NativeKernel>> {
    kernel
        .for_device(queue.device_index())
        .cloned()
        .ok_or_else(|| queue.error(shard, "kernel was not built for this device"))
}

/// Runs the boundary exchange of every product operand.
///
/// Returns the import buffers, indexed by product (in parameter order) and
/// then by shard.
fn exchange(params: &[Param], events: &mut Vec<(usize, Event)>) -> Result<Vec<Vec<DeviceBuffer>>> {
    params
        .iter()
        .filter_map(|p| match p {
            Param::Product(p) => Some(p.matrix.exchange(&p.x, events)),
            _ => None,
        })
        .collect()
}

fn bind(params: &[Param], shard: usize, imports: &[Vec<DeviceBuffer>]) -> Vec<KernelArg> {
    let mut args = Vec::new();
    let mut product = 0;
    for param in params {
        match param {
            Param::Vector(v) => args.push(KernelArg::Buffer(v.shards[shard].handle().clone())),
            Param::Scalar(c) => args.push(KernelArg::Scalar(*c)),
            Param::Product(p) => {
                args.extend(p.matrix.shard_args(shard, &p.x, &imports[product][shard]));
                product += 1;
            }
        }
    }
    args
}
