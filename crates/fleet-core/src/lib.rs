//! fleet-core: shared building blocks for the fleetgrid crates.
//!
//! - [`config`]: `fleet.toml` parsing and validation
//! - [`retry`]: bounded exponential backoff for transient failures
//! - [`util`]: instance id generation, spec hashing, clock helpers

pub mod config;
pub mod error;
pub mod retry;
pub mod util;

pub use config::{
    BusEndpoint, FleetConfig, PolicyConfig, ResourceConfig, StoreEndpoint, TemplateConfig,
};
pub use error::{ConfigError, ConfigResult};
pub use retry::{Backoff, Transient};
