//! Leader lease: exactly one replica issues cluster side effects at a time.
//!
//! The lease is a key with a TTL that the holder renews well before it
//! expires. A replica that fails to renew stops acting as leader.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::Script;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::{BusError, BusResult};

#[async_trait]
pub trait LeaderLease: Send + Sync {
    /// Acquire the lease, or renew it if already held by `replica_id`.
    /// Returns whether `replica_id` holds the lease afterwards.
    async fn try_acquire(&self, replica_id: &str, ttl: Duration) -> BusResult<bool>;

    /// Give the lease up if held by `replica_id`.
    async fn release(&self, replica_id: &str) -> BusResult<()>;
}

// ── In-process ─────────────────────────────────────────────────────

/// Lease shared through an `Arc` between replicas in one process.
#[derive(Clone, Default)]
pub struct MemoryLease {
    holder: Arc<Mutex<Option<(String, Instant)>>>,
}

impl MemoryLease {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn holder(&self) -> Option<String> {
        let guard = self.holder.lock().await;
        guard
            .as_ref()
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(id, _)| id.clone())
    }
}

#[async_trait]
impl LeaderLease for MemoryLease {
    async fn try_acquire(&self, replica_id: &str, ttl: Duration) -> BusResult<bool> {
        let mut guard = self.holder.lock().await;
        let now = Instant::now();
        let free = match guard.as_ref() {
            None => true,
            Some((id, expires)) => id == replica_id || *expires <= now,
        };
        if free {
            *guard = Some((replica_id.to_string(), now + ttl));
        }
        Ok(free)
    }

    async fn release(&self, replica_id: &str) -> BusResult<()> {
        let mut guard = self.holder.lock().await;
        if guard.as_ref().is_some_and(|(id, _)| id == replica_id) {
            *guard = None;
        }
        Ok(())
    }
}

// ── Redis ──────────────────────────────────────────────────────────

/// Lease stored at `{ns}:leader` with `SET NX PX` semantics.
pub struct RedisLease {
    client: redis::Client,
    key: String,
    acquire: Script,
    release: Script,
}

impl RedisLease {
    pub fn new(url: &str, namespace: &str) -> BusResult<Self> {
        let client = redis::Client::open(url).map_err(|e| BusError::Connect(e.to_string()))?;
        Ok(Self {
            client,
            key: format!("{namespace}:leader"),
            acquire: Script::new(include_str!("../scripts/lease_acquire.lua")),
            release: Script::new(include_str!("../scripts/lease_release.lua")),
        })
    }
}

#[async_trait]
impl LeaderLease for RedisLease {
    async fn try_acquire(&self, replica_id: &str, ttl: Duration) -> BusResult<bool> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;
        let held: i64 = self
            .acquire
            .key(&self.key)
            .arg(replica_id)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| BusError::Lease(e.to_string()))?;
        Ok(held == 1)
    }

    async fn release(&self, replica_id: &str) -> BusResult<()> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;
        self.release
            .key(&self.key)
            .arg(replica_id)
            .invoke_async::<i64>(&mut conn)
            .await
            .map_err(|e| BusError::Lease(e.to_string()))?;
        Ok(())
    }
}
