//! fleet-scheduler: pure fleet sizing and expiry decisions.
//!
//! Nothing here performs I/O. Given a template and a registry snapshot:
//!
//! - [`plan`] returns how many instances to create and which to drain
//!   (lowest load, then oldest), pacing template upgrades one surge
//!   instance at a time;
//! - [`plan_removed`] drains a template that left the configuration;
//! - [`sweep`] lists instances whose readiness, heartbeat or drain
//!   deadline has passed.

pub mod scheduler;
pub mod sweep;

pub use scheduler::{
    RollingStrategy, ScalePlan, desired_count, drain_order, plan, plan_removed, plan_with,
};
pub use sweep::{Expiry, sweep};
