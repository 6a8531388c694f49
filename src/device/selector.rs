use super::{DeviceDescriptor, Filter};
use crate::backend::Backend;
use crate::context::{Context, Queue};
use crate::{Error, Result};
use std::sync::Arc;
use tracing::{debug, info};

/// Devices of every platform that match `filter`, in enumeration order.
///
/// Evaluation is strictly sequential, one device at a time, so `Count`
/// filters see devices in a deterministic order.
pub fn device_list(backend: &Arc<dyn Backend>, filter: &Filter) -> Vec<DeviceDescriptor> {
    let mut matcher = filter.matcher();
    let mut selected = Vec::new();
    for platform in backend.platforms() {
        for device in backend.devices(&platform) {
            if matcher.matches(&device) {
                debug!(device = %device, "device matched");
                selected.push(device);
            }
        }
    }
    selected
}

/// Creates a context spanning the devices matched by `filter` and one queue
/// per device, in enumeration order.
///
/// # Errors
///
/// `Error::NoDeviceFound` if nothing matches.
pub fn select(backend: &Arc<dyn Backend>, filter: &Filter) -> Result<(Context, Vec<Queue>)> {
    let devices = device_list(backend, filter);
    if devices.is_empty() {
        return Err(Error::NoDeviceFound {
            filter: filter.to_string(),
        });
    }
    let context = Context::new(backend.clone(), devices);
    let queues = (0..context.devices().len())
        .map(|i| context.create_queue(i))
        .collect::<Result<Vec<_>>>()?;
    info!(
        backend = backend.name(),
        context = context.id(),
        devices = queues.len(),
        "selected compute devices"
    );
    Ok((context, queues))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HostBackend;
    use crate::config::{HostConfig, HostDeviceConfig};
    use crate::device::DeviceType;

    fn backend() -> Arc<dyn Backend> {
        let cfg = HostConfig::new()
            .platform(
                "First",
                "acme",
                vec![
                    HostDeviceConfig::new("cpu a", DeviceType::Cpu),
                    HostDeviceConfig::new("gpu a", DeviceType::Gpu),
                ],
            )
            .platform(
                "Second",
                "other",
                vec![HostDeviceConfig::new("gpu b", DeviceType::Gpu)],
            );
        HostBackend::shared(&cfg)
    }

    #[test]
    fn test_platform_order_is_kept() {
        let names: Vec<String> = device_list(&backend(), &Filter::Type(DeviceType::Gpu))
            .iter()
            .map(|d| d.name().to_string())
            .collect();
        assert_eq!(names, vec!["gpu a", "gpu b"]);
    }

    #[test]
    fn test_select_builds_one_queue_per_device() {
        let (ctx, queues) = select(&backend(), &Filter::All).unwrap();
        assert_eq!(ctx.devices().len(), 3);
        assert_eq!(queues.len(), 3);
        for (i, q) in queues.iter().enumerate() {
            assert_eq!(q.device_index(), i);
            assert!(q.context().same(&ctx));
        }
    }

    #[test]
    fn test_no_device_found() {
        let err = select(&backend(), &Filter::Type(DeviceType::Accelerator)).unwrap_err();
        match err {
            Error::NoDeviceFound { filter } => assert_eq!(filter, "type == accelerator"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
