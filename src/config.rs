//! Configuration of the host reference backend.
//!
//! The host backend simulates any number of platforms and devices so that
//! multi-device code paths can run on a machine without accelerators. The
//! layout is described by a [`HostConfig`], usually read from JSON:
//!
//! ```json
//! {
//!   "platforms": [
//!     {
//!       "name": "Simulated",
//!       "vendor": "shardex",
//!       "devices": [
//!         { "name": "gpu0", "type": "gpu" },
//!         { "name": "gpu1", "type": "gpu", "double_precision": false }
//!       ]
//!     }
//!   ]
//! }
//! ```

use crate::device::DeviceType;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment variable naming a JSON [`HostConfig`] file.
pub const HOST_CONFIG_ENV: &str = "SHARDEX_HOST_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostConfig {
    pub platforms: Vec<HostPlatformConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostPlatformConfig {
    pub name: String,
    #[serde(default)]
    pub vendor: String,
    pub devices: Vec<HostDeviceConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostDeviceConfig {
    pub name: String,
    /// Defaults to the platform vendor.
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(rename = "type", default = "default_device_type")]
    pub device_type: DeviceType,
    #[serde(default = "default_true")]
    pub double_precision: bool,
    #[serde(default = "default_compute_units")]
    pub compute_units: u32,
}

fn default_device_type() -> DeviceType {
    DeviceType::Cpu
}

fn default_true() -> bool {
    true
}

fn default_compute_units() -> u32 {
    1
}

impl HostDeviceConfig {
    pub fn new(name: impl Into<String>, device_type: DeviceType) -> Self {
        Self {
            name: name.into(),
            vendor: None,
            device_type,
            double_precision: true,
            compute_units: 1,
        }
    }

    pub fn vendor(mut self, vendor: impl Into<String>) -> Self {
        self.vendor = Some(vendor.into());
        self
    }

    pub fn double_precision(mut self, supported: bool) -> Self {
        self.double_precision = supported;
        self
    }
}

impl HostConfig {
    pub fn new() -> Self {
        Self {
            platforms: Vec::new(),
        }
    }

    /// Appends a platform with the given devices.
    pub fn platform(
        mut self,
        name: impl Into<String>,
        vendor: impl Into<String>,
        devices: Vec<HostDeviceConfig>,
    ) -> Self {
        self.platforms.push(HostPlatformConfig {
            name: name.into(),
            vendor: vendor.into(),
            devices,
        });
        self
    }

    /// One platform with `count` identical devices of `device_type`.
    pub fn uniform(device_type: DeviceType, count: usize) -> Self {
        let devices = (0..count)
            .map(|i| HostDeviceConfig::new(format!("{} {}", device_type, i), device_type))
            .collect();
        Self::new().platform("Host", "shardex", devices)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    /// Reads the file named by `SHARDEX_HOST_CONFIG`, or returns the default.
    pub fn from_env() -> Result<Self> {
        match std::env::var(HOST_CONFIG_ENV) {
            Ok(path) => Self::from_file(path),
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn device_count(&self) -> usize {
        self.platforms.iter().map(|p| p.devices.len()).sum()
    }
}

impl Default for HostConfig {
    /// One host platform with a single CPU device.
    fn default() -> Self {
        let units = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        let mut cpu = HostDeviceConfig::new("Host CPU", DeviceType::Cpu);
        cpu.compute_units = units;
        Self::new().platform("Host", "shardex", vec![cpu])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_json_defaults() {
        let cfg = HostConfig::from_json(
            r#"{"platforms": [{"name": "P", "devices": [{"name": "d0"}, {"name": "d1", "type": "gpu", "double_precision": false}]}]}"#,
        )
        .unwrap();
        assert_eq!(cfg.device_count(), 2);
        let d0 = &cfg.platforms[0].devices[0];
        assert_eq!(d0.device_type, DeviceType::Cpu);
        assert!(d0.double_precision);
        assert_eq!(d0.compute_units, 1);
        let d1 = &cfg.platforms[0].devices[1];
        assert_eq!(d1.device_type, DeviceType::Gpu);
        assert!(!d1.double_precision);
    }

    #[test]
    fn test_from_json_invalid() {
        assert!(matches!(
            HostConfig::from_json("{\"platforms\": 3}"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_roundtrip_json() {
        let cfg = HostConfig::uniform(DeviceType::Gpu, 3);
        let text = serde_json::to_string(&cfg).unwrap();
        assert_eq!(HostConfig::from_json(&text).unwrap(), cfg);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host.json");
        std::fs::write(
            &path,
            r#"{"platforms": [{"name": "P", "vendor": "V", "devices": [{"name": "a", "type": "accelerator"}]}]}"#,
        )
        .unwrap();
        let cfg = HostConfig::from_file(&path).unwrap();
        assert_eq!(cfg.platforms[0].vendor, "V");
        assert_eq!(
            cfg.platforms[0].devices[0].device_type,
            DeviceType::Accelerator
        );
        assert!(HostConfig::from_file(dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_default_has_one_cpu() {
        let cfg = HostConfig::default();
        assert_eq!(cfg.device_count(), 1);
        assert_eq!(cfg.platforms[0].devices[0].device_type, DeviceType::Cpu);
    }
}
