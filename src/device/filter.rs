//! Device filters.
//!
//! A filter is a predicate over [`DeviceDescriptor`]. Filters compose with
//! `&` (both), `|` (either) and `!` (negation); both binary forms
//! short-circuit left to right, so `Filter::Type(DeviceType::Gpu) &
//! Filter::Count(1)` only lets GPUs reach the counter.
//!
//! `Count(k)` is the one stateful filter: it lets at most `k` devices through
//! over a whole selection pass. Its counter does not live in the filter itself
//! but in the [`Matcher`] created for each pass, so every selection starts
//! from zero and reusing a filter is deterministic.

use super::{DeviceDescriptor, DeviceType};
use std::fmt;
use std::ops;
use std::sync::Arc;

pub type Predicate = dyn Fn(&DeviceDescriptor) -> bool + Send + Sync;

#[derive(Clone)]
pub enum Filter {
    /// Matches every device.
    All,
    Type(DeviceType),
    /// Device name contains the given text.
    Name(String),
    /// Device vendor contains the given text.
    Vendor(String),
    /// Platform name contains the given text.
    Platform(String),
    DoublePrecision,
    /// At most this many matches per selection pass.
    Count(usize),
    And(Box<Filter>, Box<Filter>),
    Or(Box<Filter>, Box<Filter>),
    Not(Box<Filter>),
    Custom(Arc<Predicate>),
}

impl Filter {
    pub fn name(text: impl Into<String>) -> Self {
        Filter::Name(text.into())
    }

    pub fn vendor(text: impl Into<String>) -> Self {
        Filter::Vendor(text.into())
    }

    pub fn platform(text: impl Into<String>) -> Self {
        Filter::Platform(text.into())
    }

    pub fn custom<F>(predicate: F) -> Self
    where
        F: Fn(&DeviceDescriptor) -> bool + Send + Sync + 'static,
    {
        Filter::Custom(Arc::new(predicate))
    }

    /// Builds a filter from `SHARDEX_*` environment variables.
    ///
    /// | Variable              | Filter                      |
    /// |-----------------------|-----------------------------|
    /// | `SHARDEX_PLATFORM`    | `Platform(value)`           |
    /// | `SHARDEX_DEVICE`      | `Name(value)`               |
    /// | `SHARDEX_VENDOR`      | `Vendor(value)`             |
    /// | `SHARDEX_TYPE`        | `Type(value)`               |
    /// | `SHARDEX_DOUBLE`      | `DoublePrecision` if truthy |
    /// | `SHARDEX_MAX_DEVICES` | `Count(value)`, applied last |
    ///
    /// Unset variables add nothing; with none set the result is `All`.
    pub fn from_env() -> crate::Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Same as [`Filter::from_env`] with a custom variable lookup.
    pub fn from_vars<F>(lookup: F) -> crate::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut parts = Vec::new();
        if let Some(v) = lookup("SHARDEX_PLATFORM") {
            parts.push(Filter::Platform(v));
        }
        if let Some(v) = lookup("SHARDEX_DEVICE") {
            parts.push(Filter::Name(v));
        }
        if let Some(v) = lookup("SHARDEX_VENDOR") {
            parts.push(Filter::Vendor(v));
        }
        if let Some(v) = lookup("SHARDEX_TYPE") {
            parts.push(Filter::Type(v.parse()?));
        }
        if let Some(v) = lookup("SHARDEX_DOUBLE") {
            if matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes") {
                parts.push(Filter::DoublePrecision);
            }
        }
        if let Some(v) = lookup("SHARDEX_MAX_DEVICES") {
            let limit = v.trim().parse::<usize>().map_err(|e| {
                crate::Error::Config(format!("SHARDEX_MAX_DEVICES={:?}: {}", v, e))
            })?;
            parts.push(Filter::Count(limit));
        }
        Ok(parts
            .into_iter()
            .reduce(|acc, f| acc & f)
            .unwrap_or(Filter::All))
    }

    /// Starts a selection pass with fresh `Count` state.
    pub fn matcher(&self) -> Matcher<'_> {
        Matcher {
            filter: self,
            counters: vec![0; self.count_slots()],
        }
    }

    fn count_slots(&self) -> usize {
        match self {
            Filter::Count(_) => 1,
            Filter::And(a, b) | Filter::Or(a, b) => a.count_slots() + b.count_slots(),
            Filter::Not(a) => a.count_slots(),
            _ => 0,
        }
    }
}

/// Evaluation state of one selection pass.
///
/// Devices must be fed in enumeration order, one at a time.
pub struct Matcher<'a> {
    filter: &'a Filter,
    counters: Vec<usize>,
}

impl Matcher<'_> {
    pub fn matches(&mut self, device: &DeviceDescriptor) -> bool {
        let mut slot = 0;
        eval(self.filter, device, &mut slot, &mut self.counters)
    }
}

// `slot` numbers Count nodes in pre-order; skipped subtrees still advance it.
fn eval(filter: &Filter, d: &DeviceDescriptor, slot: &mut usize, counters: &mut [usize]) -> bool {
    match filter {
        Filter::All => true,
        Filter::Type(t) => d.device_type() == *t,
        Filter::Name(s) => d.name().contains(s.as_str()),
        Filter::Vendor(s) => d.vendor().contains(s.as_str()),
        Filter::Platform(s) => d.platform().contains(s.as_str()),
        Filter::DoublePrecision => d.double_precision(),
        Filter::Count(limit) => {
            let i = *slot;
            *slot += 1;
            if counters[i] < *limit {
                counters[i] += 1;
                true
            } else {
                false
            }
        }
        Filter::And(a, b) => {
            if eval(a, d, slot, counters) {
                eval(b, d, slot, counters)
            } else {
                *slot += b.count_slots();
                false
            }
        }
        Filter::Or(a, b) => {
            if eval(a, d, slot, counters) {
                *slot += b.count_slots();
                true
            } else {
                eval(b, d, slot, counters)
            }
        }
        Filter::Not(a) => !eval(a, d, slot, counters),
        Filter::Custom(f) => f(d),
    }
}

impl ops::BitAnd for Filter {
    type Output = Filter;

    fn bitand(self, rhs: Filter) -> Filter {
        Filter::And(Box::new(self), Box::new(rhs))
    }
}

impl ops::BitOr for Filter {
    type Output = Filter;

    fn bitor(self, rhs: Filter) -> Filter {
        Filter::Or(Box::new(self), Box::new(rhs))
    }
}

impl ops::Not for Filter {
    type Output = Filter;

    fn not(self) -> Filter {
        Filter::Not(Box::new(self))
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::All => write!(f, "all"),
            Filter::Type(t) => write!(f, "type == {}", t),
            Filter::Name(s) => write!(f, "name ~ {:?}", s),
            Filter::Vendor(s) => write!(f, "vendor ~ {:?}", s),
            Filter::Platform(s) => write!(f, "platform ~ {:?}", s),
            Filter::DoublePrecision => write!(f, "double"),
            Filter::Count(k) => write!(f, "count <= {}", k),
            Filter::And(a, b) => write!(f, "({} && {})", a, b),
            Filter::Or(a, b) => write!(f, "({} || {})", a, b),
            Filter::Not(a) => write!(f, "!{}", a),
            Filter::Custom(_) => write!(f, "custom"),
        }
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Filter({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::PlatformInfo;
    use std::collections::HashMap;

    fn devices() -> Vec<DeviceDescriptor> {
        let p = PlatformInfo {
            index: 0,
            name: "Test".into(),
            vendor: "test".into(),
        };
        vec![
            DeviceDescriptor::new(&p, 0, "Xeon", "Intel", DeviceType::Cpu),
            DeviceDescriptor::new(&p, 1, "Radeon VII", "AMD", DeviceType::Gpu),
            DeviceDescriptor::new(&p, 2, "Tesla", "NVIDIA", DeviceType::Gpu)
                .with_double_precision(false),
            DeviceDescriptor::new(&p, 3, "Radeon RX", "AMD", DeviceType::Gpu),
        ]
    }

    fn select(filter: &Filter) -> Vec<String> {
        let mut m = filter.matcher();
        devices()
            .into_iter()
            .filter(|d| m.matches(d))
            .map(|d| d.name().to_string())
            .collect()
    }

    #[test]
    fn test_simple_filters() {
        assert_eq!(select(&Filter::All).len(), 4);
        assert_eq!(select(&Filter::Type(DeviceType::Cpu)), vec!["Xeon"]);
        assert_eq!(select(&Filter::name("Radeon")), vec!["Radeon VII", "Radeon RX"]);
        assert_eq!(select(&Filter::vendor("NVIDIA")), vec!["Tesla"]);
        assert_eq!(select(&Filter::platform("Nope")).len(), 0);
    }

    #[test]
    fn test_combinators() {
        let f = Filter::name("Radeon") & Filter::DoublePrecision;
        assert_eq!(select(&f), vec!["Radeon VII", "Radeon RX"]);

        let f = Filter::Type(DeviceType::Gpu) & !Filter::DoublePrecision;
        assert_eq!(select(&f), vec!["Tesla"]);

        let f = Filter::Type(DeviceType::Cpu) | Filter::vendor("NVIDIA");
        assert_eq!(select(&f), vec!["Xeon", "Tesla"]);

        let f = Filter::custom(|d| d.name().ends_with("RX"));
        assert_eq!(select(&f), vec!["Radeon RX"]);
    }

    #[test]
    fn test_count_only_sees_left_matches() {
        let f = Filter::Type(DeviceType::Gpu) & Filter::Count(2);
        assert_eq!(select(&f), vec!["Radeon VII", "Tesla"]);
    }

    #[test]
    fn test_count_is_fresh_per_pass() {
        let f = Filter::Count(1);
        assert_eq!(select(&f), vec!["Xeon"]);
        assert_eq!(select(&f), vec!["Xeon"]);
    }

    #[test]
    fn test_independent_counters() {
        // Each Count node keeps its own budget, even when a branch is skipped.
        let f = (Filter::Type(DeviceType::Cpu) & Filter::Count(1))
            | (Filter::Type(DeviceType::Gpu) & Filter::Count(1));
        assert_eq!(select(&f), vec!["Xeon", "Radeon VII"]);
    }

    #[test]
    fn test_from_vars() {
        let vars: HashMap<&str, &str> = [("SHARDEX_TYPE", "gpu"), ("SHARDEX_MAX_DEVICES", "1")]
            .into_iter()
            .collect();
        let f = Filter::from_vars(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(select(&f), vec!["Radeon VII"]);

        let f = Filter::from_vars(|_| None).unwrap();
        assert!(matches!(f, Filter::All));

        let bad = Filter::from_vars(|k| (k == "SHARDEX_MAX_DEVICES").then(|| "many".to_string()));
        assert!(matches!(bad, Err(crate::Error::Config(_))));
    }

    #[test]
    fn test_display() {
        let f = Filter::Type(DeviceType::Gpu) & Filter::Count(1);
        assert_eq!(f.to_string(), "(type == gpu && count <= 1)");
    }
}
