//! Host reference backend.
//!
//! Every simulated device gets a worker thread fed through a `crossbeam`
//! channel, which gives the in-order queue semantics of a real device queue.
//! Kernels are "compiled" by checking the generated source against the
//! device's capabilities and keeping the lowered program, which the worker
//! then runs with the data-parallel evaluator from `shardex-kernels`.
//!
//! Custom sources cannot be run from their text; the host executable for one
//! is registered under its entry point name with
//! [`HostBackend::register_kernel`].

use super::{Backend, BufferHandle, Command, Event, KernelArg, NativeKernel, NativeQueue};
use crate::config::HostConfig;
use crate::device::{DeviceDescriptor, PlatformInfo};
use crate::expr::KernelSource;
use crossbeam::channel::{Sender, unbounded};
use parking_lot::{Mutex, MutexGuard};
use shardex_kernels::{
    ArgView, Buffer, BufferKind, CsrView, KernelElem, ParamKind, Program, ScalarType,
};
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{trace, warn};

#[derive(Debug)]
pub struct HostBackend {
    platforms: Vec<(PlatformInfo, Vec<DeviceDescriptor>)>,
    custom: Mutex<HashMap<String, Arc<dyn NativeKernel>>>,
}

impl HostBackend {
    pub fn new(config: &HostConfig) -> Self {
        let platforms = config
            .platforms
            .iter()
            .enumerate()
            .map(|(index, p)| {
                let info = PlatformInfo {
                    index,
                    name: p.name.clone(),
                    vendor: p.vendor.clone(),
                };
                let devices = p
                    .devices
                    .iter()
                    .enumerate()
                    .map(|(i, d)| {
                        let vendor = d.vendor.clone().unwrap_or_else(|| p.vendor.clone());
                        DeviceDescriptor::new(&info, i, d.name.clone(), vendor, d.device_type)
                            .with_double_precision(d.double_precision)
                            .with_compute_units(d.compute_units)
                    })
                    .collect();
                (info, devices)
            })
            .collect();
        Self {
            platforms,
            custom: Mutex::new(HashMap::new()),
        }
    }

    /// Registers the host executable of the custom kernel `name`.
    pub fn register_kernel(&self, name: impl Into<String>, kernel: Arc<dyn NativeKernel>) {
        self.custom.lock().insert(name.into(), kernel);
    }

    /// Backend described by `SHARDEX_HOST_CONFIG`, or one host CPU.
    pub fn from_env() -> crate::Result<Self> {
        Ok(Self::new(&HostConfig::from_env()?))
    }

    /// Convenience for `Arc::new(HostBackend::new(config))` as a trait object.
    pub fn shared(config: &HostConfig) -> Arc<dyn Backend> {
        Arc::new(Self::new(config))
    }
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new(&HostConfig::default())
    }
}

impl Backend for HostBackend {
    fn name(&self) -> &str {
        "host"
    }

    fn platforms(&self) -> Vec<PlatformInfo> {
        self.platforms.iter().map(|(p, _)| p.clone()).collect()
    }

    fn devices(&self, platform: &PlatformInfo) -> Vec<DeviceDescriptor> {
        self.platforms
            .iter()
            .find(|(p, _)| p.index == platform.index)
            .map(|(_, devices)| devices.clone())
            .unwrap_or_default()
    }

    fn create_queue(&self, device: &DeviceDescriptor) -> Result<Arc<dyn NativeQueue>, String> {
        Ok(Arc::new(HostQueue::spawn(device.clone())?))
    }

    fn build(
        &self,
        device: &DeviceDescriptor,
        source: &KernelSource,
    ) -> Result<Arc<dyn NativeKernel>, String> {
        if !source.text().contains(source.name()) {
            return Err(format!("kernel {} is not defined in the source", source.name()));
        }
        if source.scalar() == ScalarType::F64 && !device.double_precision() {
            return Err(format!(
                "{}: double precision floating point is not supported by this device",
                source.name()
            ));
        }
        match source.shape() {
            Some(shape) => Ok(Arc::new(HostKernel {
                program: shape.program().clone(),
                scalar: source.scalar(),
            })),
            None => self.custom.lock().get(source.name()).cloned().ok_or_else(|| {
                format!(
                    "{}: no host implementation registered for this kernel",
                    source.name()
                )
            }),
        }
    }
}

type Job = (Command, Event);

#[derive(Debug)]
struct HostQueue {
    device: DeviceDescriptor,
    sender: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl HostQueue {
    fn spawn(device: DeviceDescriptor) -> Result<Self, String> {
        let (sender, receiver) = unbounded::<Job>();
        let name = format!("shardex-{}-{}", device.platform_index(), device.index());
        let label = device.to_string();
        let worker = thread::Builder::new()
            .name(name)
            .spawn(move || {
                trace!(device = %label, "queue worker started");
                for (command, event) in receiver {
                    let kind = command.name();
                    match catch_unwind(AssertUnwindSafe(|| execute(command))) {
                        Ok(Ok(())) => event.complete(),
                        Ok(Err(message)) => event.fail(message),
                        Err(_) => {
                            warn!(device = %label, command = kind, "command panicked");
                            event.fail(format!("{} command panicked", kind));
                        }
                    }
                }
                trace!(device = %label, "queue worker stopped");
            })
            .map_err(|e| e.to_string())?;
        Ok(Self {
            device,
            sender: Some(sender),
            worker: Some(worker),
        })
    }
}

impl NativeQueue for HostQueue {
    fn device(&self) -> &DeviceDescriptor {
        &self.device
    }

    fn alloc(&self, kind: BufferKind, len: usize) -> Result<BufferHandle, String> {
        Ok(Arc::new(Mutex::new(Buffer::zeroed(kind, len))))
    }

    fn enqueue(&self, command: Command) -> Event {
        let event = Event::new();
        match &self.sender {
            Some(sender) => {
                if sender.send((command, event.clone())).is_err() {
                    event.fail("queue worker has stopped");
                }
            }
            None => event.fail("queue is shut down"),
        }
        event
    }
}

impl Drop for HostQueue {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain what is queued and exit.
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn execute(command: Command) -> Result<(), String> {
    match command {
        Command::Write { dst, offset, data } => {
            dst.lock().write_at(offset, &data).map_err(|e| e.to_string())
        }
        Command::Read { src, range, into } => {
            let data = src.lock().slice(range).map_err(|e| e.to_string())?;
            into.put(data);
            Ok(())
        }
        Command::Gather { src, indices, into } => {
            let data = src.lock().gather(&indices).map_err(|e| e.to_string())?;
            into.put(data);
            Ok(())
        }
        Command::WriteStaged {
            dst,
            offset,
            from,
            after,
        } => {
            after
                .wait()
                .map_err(|m| format!("source of staged transfer failed: {}", m))?;
            let data = from
                .take()
                .ok_or_else(|| "staging slot is empty".to_string())?;
            dst.lock().write_at(offset, &data).map_err(|e| e.to_string())
        }
        Command::Copy { src, dst } => {
            if Arc::ptr_eq(&src, &dst) {
                return Ok(());
            }
            let data = src.lock().clone();
            let mut dst = dst.lock();
            if dst.kind() != data.kind() || dst.len() != data.len() {
                return Err(format!(
                    "copy of {} {:?} elements into {} {:?} elements",
                    data.len(),
                    data.kind(),
                    dst.len(),
                    dst.kind()
                ));
            }
            *dst = data;
            Ok(())
        }
        Command::Launch {
            kernel,
            n,
            args,
            output,
        } => kernel.launch(n, &args, &output),
        Command::Marker => Ok(()),
    }
}

#[derive(Debug)]
struct HostKernel {
    program: Program,
    scalar: ScalarType,
}

impl NativeKernel for HostKernel {
    fn launch(&self, n: usize, args: &[KernelArg], output: &BufferHandle) -> Result<(), String> {
        let result = match self.scalar {
            ScalarType::F32 => self.run::<f32>(n, args)?,
            ScalarType::F64 => self.run::<f64>(n, args)?,
        };
        // Inputs are released before the output is locked: the output may
        // also be one of the operands.
        output.lock().write_at(0, &result).map_err(|e| e.to_string())
    }
}

impl HostKernel {
    fn run<T: KernelElem>(&self, n: usize, args: &[KernelArg]) -> Result<Buffer, String> {
        // Lock each distinct buffer once; one vector may be bound several times.
        let mut unique: Vec<&BufferHandle> = Vec::new();
        let mut slots = Vec::with_capacity(args.len());
        for arg in args {
            match arg {
                KernelArg::Buffer(handle) => {
                    let slot = match unique.iter().position(|u| Arc::ptr_eq(u, handle)) {
                        Some(slot) => slot,
                        None => {
                            unique.push(handle);
                            unique.len() - 1
                        }
                    };
                    slots.push(Some(slot));
                }
                KernelArg::Scalar(_) => slots.push(None),
            }
        }
        let guards: Vec<MutexGuard<'_, Buffer>> = unique.iter().map(|h| h.lock()).collect();
        let bound = Bound {
            args,
            slots: &slots,
            guards: &guards,
        };

        let mut views = Vec::with_capacity(self.program.params().len());
        let mut next = 0;
        for &kind in self.program.params() {
            let view = match kind {
                ParamKind::Vector => ArgView::Vector(bound.values::<T>(next)?),
                ParamKind::Scalar => ArgView::Scalar(bound.scalar::<T>(next)?),
                ParamKind::SpMv => {
                    let x = bound.values::<T>(next + 6)?;
                    let imports = bound.values::<T>(next + 7)?;
                    let local = CsrView::new(
                        bound.indices(next)?,
                        bound.indices(next + 1)?,
                        bound.values::<T>(next + 2)?,
                        x.len(),
                    )
                    .map_err(|e| e.to_string())?;
                    let remote = CsrView::new(
                        bound.indices(next + 3)?,
                        bound.indices(next + 4)?,
                        bound.values::<T>(next + 5)?,
                        imports.len(),
                    )
                    .map_err(|e| e.to_string())?;
                    ArgView::SpMv {
                        local,
                        remote,
                        x,
                        imports,
                    }
                }
            };
            next += kind.arity();
            views.push(view);
        }
        if next != args.len() {
            return Err(format!("kernel takes {} arguments, got {}", next, args.len()));
        }

        let result = match self.program.reduce_op() {
            None => self.program.eval(n, &views),
            Some(_) => self.program.eval_reduce(n, &views).map(|v| vec![v]),
        };
        result.map(T::into_buffer).map_err(|e| e.to_string())
    }
}

/// Arguments of one launch with their buffers locked.
struct Bound<'a, 'g> {
    args: &'a [KernelArg],
    slots: &'a [Option<usize>],
    guards: &'a [MutexGuard<'g, Buffer>],
}

impl<'a> Bound<'a, '_> {
    fn buffer(&self, index: usize) -> Result<&'a Buffer, String> {
        let guards: &'a [MutexGuard<'_, Buffer>] = self.guards;
        match self.slots.get(index).copied().flatten() {
            Some(slot) => Ok(&**guards.get(slot).ok_or("argument slot out of range")?),
            None => Err(format!("argument {} is not a buffer", index)),
        }
    }

    fn values<T: KernelElem>(&self, index: usize) -> Result<&'a [T], String> {
        T::view(self.buffer(index)?)
            .ok_or_else(|| format!("argument {} is not a {} buffer", index, T::SCALAR.c_name()))
    }

    fn indices(&self, index: usize) -> Result<&'a [usize], String> {
        self.buffer(index)?
            .as_index()
            .ok_or_else(|| format!("argument {} is not an index buffer", index))
    }

    fn scalar<T: KernelElem>(&self, index: usize) -> Result<T, String> {
        match self.args.get(index) {
            Some(KernelArg::Scalar(value)) => T::from_value(*value)
                .ok_or_else(|| format!("argument {} is not a {}", index, T::SCALAR.c_name())),
            _ => Err(format!("argument {} is not a scalar", index)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Staging;
    use crate::device::DeviceType;

    fn queue() -> Arc<dyn NativeQueue> {
        let backend = HostBackend::new(&HostConfig::uniform(DeviceType::Cpu, 1));
        let platform = backend.platforms().remove(0);
        let device = backend.devices(&platform).remove(0);
        backend.create_queue(&device).unwrap()
    }

    #[test]
    fn test_enumeration_follows_config() {
        let cfg = HostConfig::new()
            .platform("A", "va", vec![crate::config::HostDeviceConfig::new("a0", DeviceType::Gpu)])
            .platform(
                "B",
                "vb",
                vec![
                    crate::config::HostDeviceConfig::new("b0", DeviceType::Cpu).vendor("custom"),
                    crate::config::HostDeviceConfig::new("b1", DeviceType::Gpu),
                ],
            );
        let backend = HostBackend::new(&cfg);
        let platforms = backend.platforms();
        assert_eq!(platforms.len(), 2);
        let b = backend.devices(&platforms[1]);
        assert_eq!(b.len(), 2);
        assert_eq!(b[0].vendor(), "custom");
        assert_eq!(b[1].vendor(), "vb");
        assert_eq!(b[1].platform(), "B");
        assert_eq!(b[1].index(), 1);
    }

    #[test]
    fn test_queue_is_fifo() {
        let q = queue();
        let buf = q.alloc(BufferKind::F64, 3).unwrap();
        q.enqueue(Command::Write {
            dst: buf.clone(),
            offset: 0,
            data: Buffer::F64(vec![1.0, 2.0, 3.0]),
        });
        q.enqueue(Command::Write {
            dst: buf.clone(),
            offset: 1,
            data: Buffer::F64(vec![9.0]),
        });
        let staging = Staging::new();
        let done = q.enqueue(Command::Read {
            src: buf,
            range: 0..3,
            into: staging.clone(),
        });
        done.wait().unwrap();
        assert_eq!(staging.take(), Some(Buffer::F64(vec![1.0, 9.0, 3.0])));
    }

    #[test]
    fn test_failed_command_reports() {
        let q = queue();
        let buf = q.alloc(BufferKind::F32, 2).unwrap();
        let event = q.enqueue(Command::Write {
            dst: buf,
            offset: 0,
            data: Buffer::F64(vec![1.0]),
        });
        assert!(event.wait().is_err());
        // the queue keeps working after a failure
        assert!(q.enqueue(Command::Marker).wait().is_ok());
    }

    #[test]
    fn test_gather_and_staged_write_across_queues() {
        let owner = queue();
        let importer = queue();
        let src = owner.alloc(BufferKind::F64, 4).unwrap();
        let dst = importer.alloc(BufferKind::F64, 3).unwrap();
        owner.enqueue(Command::Write {
            dst: src.clone(),
            offset: 0,
            data: Buffer::F64(vec![10.0, 11.0, 12.0, 13.0]),
        });
        let staging = Staging::new();
        let gathered = owner.enqueue(Command::Gather {
            src,
            indices: Arc::from(vec![3, 1]),
            into: staging.clone(),
        });
        importer.enqueue(Command::WriteStaged {
            dst: dst.clone(),
            offset: 1,
            from: staging,
            after: gathered,
        });
        importer.enqueue(Command::Marker).wait().unwrap();
        assert_eq!(*dst.lock(), Buffer::F64(vec![0.0, 13.0, 11.0]));
    }

    #[test]
    fn test_copy_checks_shape() {
        let q = queue();
        let a = q.alloc(BufferKind::F64, 2).unwrap();
        let b = q.alloc(BufferKind::F64, 3).unwrap();
        assert!(q.enqueue(Command::Copy { src: a.clone(), dst: b }).wait().is_err());
        let c = q.alloc(BufferKind::F64, 2).unwrap();
        assert!(q.enqueue(Command::Copy { src: a, dst: c }).wait().is_ok());
    }
}
