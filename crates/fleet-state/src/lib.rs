//! fleet-state: fleet domain types and durable persistence.
//!
//! Two [`FleetStore`] backends are provided:
//! - [`StateStore`] on [redb](https://docs.rs/redb), embedded, for a single
//!   replica and for tests (`open_in_memory`).
//! - [`RedisStore`] on Redis, shared by every replica, with instance writes
//!   guarded by a Lua compare-and-set on the record version.
//!
//! All domain types are JSON-serialized. Instance writes carry an expected
//! version (0 = insert); a mismatch is reported as [`StateError::Conflict`].

pub mod error;
pub mod redis_store;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use redis_store::RedisStore;
pub use store::{FleetStore, StateStore};
pub use types::*;
