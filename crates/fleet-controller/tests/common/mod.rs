//! Shared wiring for controller integration tests: in-memory store, bus,
//! lease and cluster shared between one or more replicas.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use fleet_bus::{MemoryBus, MemoryLease};
use fleet_cluster::{
    ClusterDriver, DriverResult, MemoryDriver, PodLifecycleEvent, PodObservation, PodRef,
    PodRequest,
};
use fleet_controller::{Backends, FleetController};
use fleet_core::config::FleetConfig;
use fleet_state::{
    FleetStore, FleetTemplate, InstanceEvent, InstanceState, ServerInstance, StateError,
    StateResult, StateStore, TerminationReason,
};
use tokio::sync::{Notify, mpsc};

pub const NAMESPACE: &str = "games";

/// Config with one `lobby` template and fast retries.
pub fn config(min_ready: u32, max_instances: u32) -> FleetConfig {
    config_with(min_ready, max_instances, "")
}

/// Same as [`config`], with extra lines appended to the lobby template.
pub fn config_with(min_ready: u32, max_instances: u32, extra: &str) -> FleetConfig {
    let toml = format!(
        r#"
clusterNamespace = "{NAMESPACE}"
heartbeatTimeoutSeconds = 30
readinessTimeoutSeconds = 120
eventBusEndpoint = "memory://"
storeEndpoint = "memory://"

[policy]
createMaxAttempts = 3
backoffInitialMillis = 1
backoffMaxMillis = 5
ioTimeoutSeconds = 5
drainTimeoutSeconds = 3600

[[fleetTemplates]]
id = "lobby"
image = "registry.example.net/lobby:1.4"
minReady = {min_ready}
maxInstances = {max_instances}
{extra}
"#
    );
    FleetConfig::from_toml_str(&toml).expect("test config is valid")
}

/// The shared "world" several replicas can attach to.
#[derive(Clone)]
pub struct World {
    pub store: Arc<StateStore>,
    pub bus: MemoryBus,
    pub driver: MemoryDriver,
    pub lease: MemoryLease,
}

impl World {
    pub fn new() -> Self {
        Self {
            store: Arc::new(StateStore::open_in_memory().expect("in-memory store")),
            bus: MemoryBus::new(1024),
            driver: MemoryDriver::new(NAMESPACE),
            lease: MemoryLease::new(),
        }
    }

    pub fn backends(&self) -> Backends {
        Backends {
            store: self.store.clone(),
            bus: Arc::new(self.bus.clone()),
            driver: Arc::new(self.driver.clone()),
            lease: Arc::new(self.lease.clone()),
        }
    }

    /// A replica with templates synced, not yet leader.
    pub async fn replica(&self, id: &str, config: &FleetConfig) -> Arc<FleetController> {
        let controller = Arc::new(FleetController::new(config, id, self.backends()));
        controller
            .sync_templates(config)
            .await
            .expect("templates sync");
        controller
    }

    /// A replica holding the leader lease.
    pub async fn leader(&self, id: &str, config: &FleetConfig) -> Arc<FleetController> {
        let controller = self.replica(id, config).await;
        assert!(controller.renew_leadership().await, "lease should be free");
        controller
    }

    pub async fn stored(&self, instance_id: &str) -> ServerInstance {
        self.store
            .get_instance(instance_id)
            .await
            .expect("store read")
            .expect("instance stored")
    }

    pub async fn stored_in(&self, state: InstanceState) -> Vec<ServerInstance> {
        self.store
            .list_instances("lobby")
            .await
            .expect("store read")
            .into_iter()
            .filter(|i| i.state == state)
            .collect()
    }
}

/// Feed every queued pod event to the controller.
pub async fn pump(controller: &FleetController, events: &mut mpsc::Receiver<PodLifecycleEvent>) {
    while let Ok(event) = events.try_recv() {
        controller
            .handle_pod_event(event)
            .await
            .expect("pod event handled");
    }
}

/// Wait briefly for the next bus event.
pub async fn next_event<T>(rx: &mut mpsc::Receiver<T>) -> Option<T> {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .ok()
        .flatten()
}

/// Apply bus events until the bus goes quiet.
pub async fn apply_bus(controller: &FleetController, events: &mut mpsc::Receiver<InstanceEvent>) {
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(200), events.recv()).await {
        controller
            .handle_bus_event(event)
            .await
            .expect("bus event handled");
    }
}

/// What two replicas must agree on for a template.
pub fn view(
    controller: &FleetController,
) -> Vec<(String, InstanceState, u64, u32, Option<String>, Option<TerminationReason>)> {
    controller
        .registry()
        .snapshot("lobby")
        .into_iter()
        .map(|i| (i.id, i.state, i.version, i.load, i.address, i.termination_reason))
        .collect()
}

/// A cluster whose `list_pods` takes its listing, then waits for `resume`.
pub struct PausingDriver {
    pub inner: MemoryDriver,
    pub listed: Notify,
    pub resume: Notify,
}

impl PausingDriver {
    pub fn new(inner: MemoryDriver) -> Self {
        Self {
            inner,
            listed: Notify::new(),
            resume: Notify::new(),
        }
    }
}

#[async_trait]
impl ClusterDriver for PausingDriver {
    async fn create_pod(&self, req: &PodRequest) -> DriverResult<PodRef> {
        self.inner.create_pod(req).await
    }

    async fn delete_pod(&self, pod: &PodRef) -> DriverResult<()> {
        self.inner.delete_pod(pod).await
    }

    async fn list_pods(&self) -> DriverResult<Vec<PodObservation>> {
        let pods = self.inner.list_pods().await?;
        self.listed.notify_one();
        self.resume.notified().await;
        Ok(pods)
    }

    async fn watch(&self) -> DriverResult<mpsc::Receiver<PodLifecycleEvent>> {
        self.inner.watch().await
    }
}

/// A store that rejects the next `n` writes into `state` with a version
/// conflict (`u32::MAX` = always).
pub struct ConflictingStore {
    pub inner: Arc<StateStore>,
    pub state: InstanceState,
    remaining: AtomicU32,
}

impl ConflictingStore {
    pub fn new(inner: Arc<StateStore>, state: InstanceState, n: u32) -> Self {
        Self {
            inner,
            state,
            remaining: AtomicU32::new(n),
        }
    }
}

#[async_trait]
impl FleetStore for ConflictingStore {
    async fn put_template(&self, template: &FleetTemplate) -> StateResult<()> {
        self.inner.put_template(template).await
    }

    async fn get_template(&self, id: &str) -> StateResult<Option<FleetTemplate>> {
        self.inner.get_template(id).await
    }

    async fn list_templates(&self) -> StateResult<Vec<FleetTemplate>> {
        self.inner.list_templates().await
    }

    async fn delete_template(&self, id: &str) -> StateResult<bool> {
        self.inner.delete_template(id).await
    }

    async fn get_instance(&self, id: &str) -> StateResult<Option<ServerInstance>> {
        self.inner.get_instance(id).await
    }

    async fn list_instances(&self, template_id: &str) -> StateResult<Vec<ServerInstance>> {
        self.inner.list_instances(template_id).await
    }

    async fn list_live_instances(&self) -> StateResult<Vec<ServerInstance>> {
        self.inner.list_live_instances().await
    }

    async fn write_instance(
        &self,
        instance: &ServerInstance,
        expected_version: u64,
    ) -> StateResult<()> {
        let rejected = instance.state == self.state
            && self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                    0 => None,
                    u32::MAX => Some(u32::MAX),
                    n => Some(n - 1),
                })
                .is_ok();
        if rejected {
            return Err(StateError::Conflict {
                id: instance.id.clone(),
                expected: expected_version,
                found: expected_version + 1,
            });
        }
        self.inner.write_instance(instance, expected_version).await
    }

    async fn ping(&self) -> StateResult<()> {
        self.inner.ping().await
    }
}
