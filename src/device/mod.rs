//! Compute devices and their selection.
//!
//! A [`DeviceDescriptor`] is an immutable snapshot of one accelerator as
//! reported by a [`Backend`](crate::backend::Backend). Devices are picked with
//! a composable [`Filter`] and turned into a shared
//! [`Context`](crate::context::Context) plus one queue per device by
//! [`select`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod filter;
pub mod selector;

pub use filter::Filter;
pub use selector::{device_list, select};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Cpu,
    Gpu,
    Accelerator,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceType::Cpu => "cpu",
            DeviceType::Gpu => "gpu",
            DeviceType::Accelerator => "accelerator",
        };
        f.write_str(name)
    }
}

impl FromStr for DeviceType {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(DeviceType::Cpu),
            "gpu" => Ok(DeviceType::Gpu),
            "accelerator" | "acc" => Ok(DeviceType::Accelerator),
            other => Err(crate::Error::Config(format!("unknown device type {:?}", other))),
        }
    }
}

/// A platform groups the devices of one vendor runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlatformInfo {
    pub index: usize,
    pub name: String,
    pub vendor: String,
}

/// Capabilities of one device. Queried, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceDescriptor {
    platform_index: usize,
    index: usize,
    name: String,
    vendor: String,
    device_type: DeviceType,
    double_precision: bool,
    platform: String,
    compute_units: u32,
}

impl DeviceDescriptor {
    pub fn new(
        platform: &PlatformInfo,
        index: usize,
        name: impl Into<String>,
        vendor: impl Into<String>,
        device_type: DeviceType,
    ) -> Self {
        Self {
            platform_index: platform.index,
            index,
            name: name.into(),
            vendor: vendor.into(),
            device_type,
            double_precision: true,
            platform: platform.name.clone(),
            compute_units: 1,
        }
    }

    pub fn with_double_precision(mut self, supported: bool) -> Self {
        self.double_precision = supported;
        self
    }

    pub fn with_compute_units(mut self, units: u32) -> Self {
        self.compute_units = units.max(1);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    pub fn double_precision(&self) -> bool {
        self.double_precision
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    pub fn platform_index(&self) -> usize {
        self.platform_index
    }

    /// Position of the device within its platform.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn compute_units(&self) -> u32 {
        self.compute_units
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, {} #{}.{})",
            self.name, self.device_type, self.platform, self.platform_index, self.index
        )
    }
}
