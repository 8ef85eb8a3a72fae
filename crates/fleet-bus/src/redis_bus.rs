//! Redis pub/sub [`EventBus`]. One channel per template, `{ns}:events:{templateId}`,
//! consumed with a pattern subscription.

use async_trait::async_trait;
use fleet_state::InstanceEvent;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use crate::bus::{EventBus, SUBSCRIBER_CAPACITY, channel_name};
use crate::error::{BusError, BusResult};

pub const DEFAULT_NAMESPACE: &str = "fleetgrid";

pub struct RedisBus {
    client: redis::Client,
    namespace: String,
    conn: Mutex<Option<MultiplexedConnection>>,
}

impl RedisBus {
    pub fn new(url: &str) -> BusResult<Self> {
        Self::with_namespace(url, DEFAULT_NAMESPACE)
    }

    pub fn with_namespace(url: &str, namespace: &str) -> BusResult<Self> {
        let client = redis::Client::open(url).map_err(|e| BusError::Connect(e.to_string()))?;
        Ok(Self {
            client,
            namespace: namespace.to_string(),
            conn: Mutex::new(None),
        })
    }

    fn pattern(&self) -> String {
        format!("{}:events:*", self.namespace)
    }

    /// Shared publishing connection, opened lazily.
    async fn connection(&self) -> BusResult<MultiplexedConnection> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    /// Verify the bus is reachable (startup check).
    pub async fn ping(&self) -> BusResult<()> {
        let mut conn = self.connection().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl EventBus for RedisBus {
    async fn publish(&self, event: &InstanceEvent) -> BusResult<()> {
        let payload = event.to_json().map_err(|e| BusError::Codec(e.to_string()))?;
        let channel = channel_name(&self.namespace, &event.template_id);
        let mut conn = self.connection().await?;
        let result = redis::cmd("PUBLISH")
            .arg(&channel)
            .arg(payload)
            .query_async::<i64>(&mut conn)
            .await;
        match result {
            Ok(receivers) => {
                debug!(%channel, instance = %event.instance_id, receivers, "event published");
                Ok(())
            }
            Err(e) => {
                // Force a reconnect on the next publish.
                self.conn.lock().await.take();
                Err(BusError::Publish(e.to_string()))
            }
        }
    }

    async fn subscribe(&self) -> BusResult<mpsc::Receiver<InstanceEvent>> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;
        let pattern = self.pattern();
        pubsub
            .psubscribe(&pattern)
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;
        debug!(%pattern, "subscribed to event channels");

        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let payload: Vec<u8> = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(error = %e, "unreadable bus message");
                        continue;
                    }
                };
                match InstanceEvent::from_json(&payload) {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!(channel = msg.get_channel_name(), error = %e, "dropping malformed event"),
                }
            }
            warn!("redis subscription closed");
        });
        Ok(rx)
    }
}
