//! fleet-bus: replica-to-replica fan-out of instance events.
//!
//! - [`EventBus`]: publish/subscribe of [`fleet_state::InstanceEvent`]s;
//!   [`MemoryBus`] in-process, [`RedisBus`] over Redis pub/sub
//! - [`LeaderLease`]: the lease that gates cluster side effects to one replica

pub mod bus;
pub mod error;
pub mod lease;
pub mod redis_bus;

pub use bus::{EventBus, MemoryBus, channel_name};
pub use error::{BusError, BusResult};
pub use lease::{LeaderLease, MemoryLease, RedisLease};
pub use redis_bus::RedisBus;
