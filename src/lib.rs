//! # shardex
//!
//! `shardex` spreads numeric vectors and sparse matrices over several compute
//! devices and evaluates arithmetic on them as generated kernels, one launch
//! per device.
//!
//! Arithmetic on [`Vector`]s builds an expression graph lazily. When the graph
//! is assigned to a vector or reduced with a [`Reductor`], its structural
//! shape is looked up in the context's kernel cache; a kernel is generated and
//! compiled for every device the first time a shape is seen, and reused after
//! that with only the operand bindings changed.
//!
//! ## Modules
//!
//! - [`device`]: device descriptors, composable [`Filter`]s and [`select`].
//! - [`context`]: the execution context, per-device queues and layouts.
//! - [`partition`]: near-equal splitting of an index range into shards.
//! - [`vector`], [`expr`], [`reduce`], [`spmat`]: the containers and the
//!   expression engine.
//! - [`backend`]: the boundary with the native runtime and the host
//!   reference backend.
//!
//! ## Example
//!
//! ```rust
//! use shardex::{DeviceType, Filter, HostBackend, HostConfig, Reductor, Vector, select};
//!
//! let backend = HostBackend::shared(&HostConfig::uniform(DeviceType::Gpu, 2));
//! let (_ctx, queues) = select(&backend, &Filter::All)?;
//!
//! let x = Vector::from_slice(&queues, &[1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0])?;
//! let y = Vector::<f64>::new(&queues, 8)?;
//! y.assign(&x + 10.0)?;
//!
//! assert_eq!(y.to_vec()?, vec![11.0, 12.0, 13.0, 14.0, 15.0, 16.0, 17.0, 18.0]);
//! assert_eq!(Reductor::sum(&queues)?.apply(&x)?, 36.0);
//! # Ok::<(), shardex::Error>(())
//! ```

pub mod backend;
pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod expr;
pub mod partition;
pub mod reduce;
pub mod spmat;
pub mod vector;

pub use backend::{Backend, HostBackend};
pub use config::HostConfig;
pub use context::{Context, Layout, Queue};
pub use device::{DeviceDescriptor, DeviceType, Filter, device_list, select};
pub use error::{Error, Result};
pub use expr::{
    Expr, IntoExpr, KernelSource, Node, abs, constant, cos, exp, log, max, min, pow, sin, sqrt, tan,
};
pub use partition::Partition;
pub use reduce::{Reductor, inner_product};
pub use shardex_kernels::{BinaryOp, KernelElem, ReduceOp, ScalarType, ScalarValue, UnaryOp};
pub use spmat::{SpMat, Transfer};
pub use vector::Vector;
