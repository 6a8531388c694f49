#![allow(dead_code)]

use shardex::{DeviceType, Filter, HostBackend, HostConfig, Queue, select};

/// `k` simulated GPUs on one host platform.
pub fn queues(k: usize) -> Vec<Queue> {
    let backend = HostBackend::shared(&HostConfig::uniform(DeviceType::Gpu, k));
    let (_ctx, queues) = select(&backend, &Filter::All).unwrap();
    queues
}

pub fn assert_close(got: &[f64], want: &[f64], tol: f64) {
    assert_eq!(got.len(), want.len());
    for (i, (g, w)) in got.iter().zip(want).enumerate() {
        assert!(
            (g - w).abs() <= tol * (1.0 + w.abs()),
            "element {}: got {}, want {}",
            i,
            g,
            w
        );
    }
}
