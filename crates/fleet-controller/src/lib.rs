//! fleet-controller: the reconciliation loop.
//!
//! [`FleetController`] compares declared templates with the instances the
//! registry knows about and drives creations, drains and terminations
//! through the store, the bus and the cluster driver. [`Workers`] runs it:
//! pod watch, bus subscription, leader lease, per-template ticks.

pub mod controller;
pub mod error;
pub mod metrics;
pub mod workers;

pub use controller::{Backends, FleetController, ResyncReport, TemplateSlot};
pub use error::{ControllerError, ControllerResult};
pub use metrics::{FleetMetrics, MetricsSnapshot};
pub use workers::Workers;
