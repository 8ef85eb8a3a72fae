//! fleet-registry: the replica-local, versioned view of the fleet.
//!
//! The [`InstanceRegistry`] is shared by `Arc` between the watch consumer,
//! the bus subscriber and the per-template tick workers. It also derives the
//! routing projection ([`fleet_state::RoutingEntry`]) and picks instances
//! for new players.

pub mod registry;

pub use registry::{InstanceRegistry, RegistryChange, STORE_ORIGIN};
