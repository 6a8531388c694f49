//! Per-context kernel cache with single-flight compilation.
//!
//! The map lock is only held long enough to find or create the entry for a
//! shape. Compilation then runs under the entry's own lock, so callers asking
//! for the same new shape wait for the one compiler while lookups of other
//! shapes proceed.

use super::codegen::{KernelSource, generate};
use super::Shape;
use crate::backend::{Backend, NativeKernel};
use crate::device::DeviceDescriptor;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, trace};

/// A kernel compiled for every device of a context.
pub struct CompiledKernel {
    source: KernelSource,
    kernels: Vec<Arc<dyn NativeKernel>>,
}

impl CompiledKernel {
    pub fn source(&self) -> &KernelSource {
        &self.source
    }

    /// Executable for the device at `device_index` within the context.
    pub fn for_device(&self, device_index: usize) -> Option<&Arc<dyn NativeKernel>> {
        self.kernels.get(device_index)
    }
}

impl fmt::Debug for CompiledKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledKernel")
            .field("name", &self.source.name())
            .field("devices", &self.kernels.len())
            .finish()
    }
}

type Slot = Arc<Mutex<Option<Arc<CompiledKernel>>>>;

#[derive(Default)]
pub struct KernelCache {
    entries: Mutex<HashMap<Shape, Slot>>,
    compilations: AtomicUsize,
}

impl KernelCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of shapes compiled, failed attempts included.
    pub fn compilations(&self) -> usize {
        self.compilations.load(Ordering::Relaxed)
    }

    /// Number of successfully compiled shapes.
    pub fn len(&self) -> usize {
        let slots: Vec<Slot> = self.entries.lock().values().cloned().collect();
        slots.iter().filter(|slot| slot.lock().is_some()).count()
    }

    #[cfg(test)]
    fn slots(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the kernel for `shape`, compiling it for every device on the
    /// first request.
    ///
    /// # Errors
    ///
    /// `Error::KernelCompilation` with the generated source and the compiler
    /// diagnostic of the first device that rejects it. Nothing is cached then,
    /// and a later request compiles again.
    pub fn get_or_compile(
        &self,
        backend: &dyn Backend,
        devices: &[DeviceDescriptor],
        shape: &Shape,
    ) -> Result<Arc<CompiledKernel>> {
        loop {
            let entry = {
                let mut entries = self.entries.lock();
                entries.entry(shape.clone()).or_default().clone()
            };
            let mut slot = entry.lock();
            if let Some(kernel) = slot.as_ref() {
                trace!(kernel = kernel.source.name(), "kernel cache hit");
                return Ok(kernel.clone());
            }
            // A failed compile unlinks its entry; start over from the map.
            if !self.is_current(shape, &entry) {
                continue;
            }
            return self.compile_into(backend, devices, shape, &entry, &mut slot);
        }
    }

    fn is_current(&self, shape: &Shape, entry: &Slot) -> bool {
        self.entries
            .lock()
            .get(shape)
            .is_some_and(|s| Arc::ptr_eq(s, entry))
    }

    fn compile_into(
        &self,
        backend: &dyn Backend,
        devices: &[DeviceDescriptor],
        shape: &Shape,
        entry: &Slot,
        slot: &mut Option<Arc<CompiledKernel>>,
    ) -> Result<Arc<CompiledKernel>> {
        self.compilations.fetch_add(1, Ordering::Relaxed);
        let source = generate(shape);
        debug!(kernel = source.name(), shape = %shape, devices = devices.len(), "compiling kernel");
        trace!(kernel = source.name(), "kernel source:\n{}", source.text());
        let kernels = match build_all(backend, devices, &source) {
            Ok(kernels) => kernels,
            Err(e) => {
                let mut entries = self.entries.lock();
                if entries.get(shape).is_some_and(|s| Arc::ptr_eq(s, entry)) {
                    entries.remove(shape);
                }
                return Err(e);
            }
        };
        let kernel = Arc::new(CompiledKernel { source, kernels });
        *slot = Some(kernel.clone());
        Ok(kernel)
    }
}

/// Builds `source` for every device, in device order.
///
/// # Errors
///
/// `Error::KernelCompilation` for the first device that rejects the source.
pub(crate) fn build_all(
    backend: &dyn Backend,
    devices: &[DeviceDescriptor],
    source: &KernelSource,
) -> Result<Vec<Arc<dyn NativeKernel>>> {
    devices
        .iter()
        .map(|device| {
            backend
                .build(device, source)
                .map_err(|diagnostic| Error::KernelCompilation {
                    device: device.to_string(),
                    kernel_source: source.text().to_string(),
                    diagnostic,
                })
        })
        .collect()
}

impl fmt::Debug for KernelCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelCache")
            .field("compilations", &self.compilations())
            .finish()
    }
}
