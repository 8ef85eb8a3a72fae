//! The [`EventBus`] contract and its in-process implementation.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use fleet_state::InstanceEvent;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use crate::error::{BusError, BusResult};

/// Buffer of each subscriber's delivery channel.
pub const SUBSCRIBER_CAPACITY: usize = 1024;

/// Fan-out of [`InstanceEvent`]s between replicas.
///
/// Delivery is at-least-once and best-effort ordered per template channel.
/// Consumers must tolerate duplicates and reordering.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish on the event's template channel.
    async fn publish(&self, event: &InstanceEvent) -> BusResult<()>;

    /// Subscribe to every template channel. The receiver closes when the
    /// underlying connection drops; callers resubscribe.
    async fn subscribe(&self) -> BusResult<mpsc::Receiver<InstanceEvent>>;
}

/// Channel name for a template's events.
pub fn channel_name(namespace: &str, template_id: &str) -> String {
    format!("{namespace}:events:{template_id}")
}

/// In-process bus over a tokio broadcast channel. Cloning shares the bus,
/// so several replicas in one process (tests) see each other's events.
#[derive(Clone)]
pub struct MemoryBus {
    sender: broadcast::Sender<InstanceEvent>,
    fail_publishes: Arc<AtomicU32>,
    published: Arc<AtomicU64>,
}

impl MemoryBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            fail_publishes: Arc::new(AtomicU32::new(0)),
            published: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Make the next `n` publishes fail with a transient error.
    pub fn fail_next_publishes(&self, n: u32) {
        self.fail_publishes.store(n, Ordering::SeqCst);
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    async fn publish(&self, event: &InstanceEvent) -> BusResult<()> {
        let injected = self
            .fail_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(BusError::Publish("injected failure".into()));
        }
        // No subscribers is not an error.
        let _ = self.sender.send(event.clone());
        self.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self) -> BusResult<mpsc::Receiver<InstanceEvent>> {
        let mut rx = self.sender.subscribe();
        let (tx, out) = mpsc::channel(SUBSCRIBER_CAPACITY);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "memory bus subscriber lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(out)
    }
}
