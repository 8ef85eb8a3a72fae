//! Process-wide controller counters.
//!
//! Plain relaxed atomics, bumped inline by the controller and read as a
//! [`MetricsSnapshot`] by the periodic metrics worker.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::info;

#[derive(Debug, Default)]
pub struct FleetMetrics {
    pub reconciles: AtomicU64,
    pub creates: AtomicU64,
    pub create_failures: AtomicU64,
    pub drains: AtomicU64,
    pub terminations: AtomicU64,
    pub pod_deletes: AtomicU64,
    pub orphans_deleted: AtomicU64,
    pub conflicts: AtomicU64,
    pub transient_retries: AtomicU64,
    pub events_applied: AtomicU64,
    pub events_discarded: AtomicU64,
    pub publish_failures: AtomicU64,
    pub resyncs: AtomicU64,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub reconciles: u64,
    pub creates: u64,
    pub create_failures: u64,
    pub drains: u64,
    pub terminations: u64,
    pub pod_deletes: u64,
    pub orphans_deleted: u64,
    pub conflicts: u64,
    pub transient_retries: u64,
    pub events_applied: u64,
    pub events_discarded: u64,
    pub publish_failures: u64,
    pub resyncs: u64,
}

impl FleetMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            reconciles: get(&self.reconciles),
            creates: get(&self.creates),
            create_failures: get(&self.create_failures),
            drains: get(&self.drains),
            terminations: get(&self.terminations),
            pod_deletes: get(&self.pod_deletes),
            orphans_deleted: get(&self.orphans_deleted),
            conflicts: get(&self.conflicts),
            transient_retries: get(&self.transient_retries),
            events_applied: get(&self.events_applied),
            events_discarded: get(&self.events_discarded),
            publish_failures: get(&self.publish_failures),
            resyncs: get(&self.resyncs),
        }
    }
}

impl MetricsSnapshot {
    pub fn log(&self) {
        info!(
            reconciles = self.reconciles,
            creates = self.creates,
            create_failures = self.create_failures,
            drains = self.drains,
            terminations = self.terminations,
            pod_deletes = self.pod_deletes,
            orphans_deleted = self.orphans_deleted,
            conflicts = self.conflicts,
            transient_retries = self.transient_retries,
            events_applied = self.events_applied,
            events_discarded = self.events_discarded,
            publish_failures = self.publish_failures,
            resyncs = self.resyncs,
            "fleet metrics"
        );
    }
}
