//! fleet-cluster: the workload platform behind a narrow driver interface.
//!
//! [`ClusterDriver`] exposes create/delete/list/watch over pods. [`KubeDriver`]
//! talks to Kubernetes; [`MemoryDriver`] keeps pods in memory for tests.
//! Pod manifests and status decoding live in [`manifest`].

pub mod driver;
pub mod error;
pub mod kube_driver;
pub mod manifest;
pub mod memory;
pub mod types;

pub use driver::ClusterDriver;
pub use error::{DriverError, DriverResult};
pub use kube_driver::KubeDriver;
pub use memory::MemoryDriver;
pub use types::*;
