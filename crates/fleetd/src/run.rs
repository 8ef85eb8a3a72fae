//! Replica wiring: pick backends from the configured endpoints, verify they
//! answer, start the workers, and stop them on Ctrl-C.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use fleet_bus::{EventBus, LeaderLease, MemoryBus, MemoryLease, RedisBus, RedisLease};
use fleet_cluster::KubeDriver;
use fleet_controller::{Backends, FleetController, Workers};
use fleet_core::config::{BusEndpoint, FleetConfig, StoreEndpoint};
use fleet_state::{FleetStore, RedisStore, StateStore};
use tracing::{info, warn};

/// Key prefix shared by the Redis store, bus and lease.
const REDIS_NAMESPACE: &str = "fleetgrid";

pub async fn run(config_path: &Path, replica_id: String) -> anyhow::Result<()> {
    let config = FleetConfig::from_file(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    info!(
        replica = %replica_id,
        namespace = %config.cluster_namespace,
        templates = config.fleet_templates.len(),
        "fleetd starting"
    );

    // ── Backends ───────────────────────────────────────────────

    let store = open_store(&config).await?;
    let (bus, lease) = open_bus(&config).await?;
    let driver = KubeDriver::connect(&config.cluster_namespace, config.policy.watch_channel_capacity)
        .await
        .context("connecting to the Kubernetes API")?;
    info!(namespace = %config.cluster_namespace, "cluster driver ready");

    let backends = Backends {
        store,
        bus,
        driver: Arc::new(driver),
        lease,
    };

    // ── Controller ─────────────────────────────────────────────

    let controller = Arc::new(FleetController::new(&config, replica_id, backends));
    controller
        .sync_templates(&config)
        .await
        .context("syncing templates")?;
    let workers = Workers::start(controller.clone()).await;

    // ── Shutdown ───────────────────────────────────────────────

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => warn!(error = %e, "signal handler failed, shutting down"),
    }

    workers.shutdown().await;
    controller.metrics().snapshot().log();
    info!("fleetd stopped");
    Ok(())
}

/// Open the configured store and check that it answers.
async fn open_store(config: &FleetConfig) -> anyhow::Result<Arc<dyn FleetStore>> {
    let store: Arc<dyn FleetStore> = match config.store()? {
        StoreEndpoint::Redis(url) => Arc::new(RedisStore::with_namespace(&url, REDIS_NAMESPACE)?),
        StoreEndpoint::Redb(path) => {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("creating {}", dir.display()))?;
            }
            Arc::new(StateStore::open(&path)?)
        }
        StoreEndpoint::Memory => {
            warn!("in-memory store: fleet state is lost on exit");
            Arc::new(StateStore::open_in_memory()?)
        }
    };
    store.ping().await.context("store unreachable")?;
    info!(endpoint = %config.store_endpoint, "store ready");
    Ok(store)
}

/// Open the configured bus (and the lease that lives next to it) and check
/// that it answers.
async fn open_bus(
    config: &FleetConfig,
) -> anyhow::Result<(Arc<dyn EventBus>, Arc<dyn LeaderLease>)> {
    let pair: (Arc<dyn EventBus>, Arc<dyn LeaderLease>) = match config.bus()? {
        BusEndpoint::Redis(url) => {
            let bus = RedisBus::with_namespace(&url, REDIS_NAMESPACE)?;
            bus.ping().await.context("event bus unreachable")?;
            let bus: Arc<dyn EventBus> = Arc::new(bus);
            let lease: Arc<dyn LeaderLease> = Arc::new(RedisLease::new(&url, REDIS_NAMESPACE)?);
            (bus, lease)
        }
        BusEndpoint::Memory => {
            warn!("in-memory bus: this replica cannot see any other");
            let bus: Arc<dyn EventBus> = Arc::new(MemoryBus::default());
            let lease: Arc<dyn LeaderLease> = Arc::new(MemoryLease::new());
            (bus, lease)
        }
    };
    info!(endpoint = %config.event_bus_endpoint, "event bus ready");
    Ok(pair)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(store: &str) -> FleetConfig {
        FleetConfig::from_toml_str(&format!(
            r#"
clusterNamespace = "games"
heartbeatTimeoutSeconds = 30
readinessTimeoutSeconds = 120
eventBusEndpoint = "memory://"
storeEndpoint = "{store}"

[[fleetTemplates]]
id = "lobby"
image = "lobby:1"
minReady = 1
maxInstances = 3
"#
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn memory_store_opens() {
        let store = open_store(&config("memory://")).await.unwrap();
        assert!(store.list_templates().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn redb_store_creates_its_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("fleet.redb");
        let store = open_store(&config(&format!("redb://{}", path.display())))
            .await
            .unwrap();
        store.ping().await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn memory_bus_and_lease() {
        let (_bus, lease) = open_bus(&config("memory://")).await.unwrap();
        assert!(lease.try_acquire("a", std::time::Duration::from_secs(5)).await.unwrap());
        assert!(!lease.try_acquire("b", std::time::Duration::from_secs(5)).await.unwrap());
    }
}
