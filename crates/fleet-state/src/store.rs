//! Fleet persistence: the [`FleetStore`] contract and its redb backend.
//!
//! Templates and instances are JSON documents keyed by id. Instance writes
//! go through an optimistic version check so that concurrent replicas
//! serialize on the store rather than on each other.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::{debug, info};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Durable source of truth for templates and instance records.
#[async_trait]
pub trait FleetStore: Send + Sync {
    async fn put_template(&self, template: &FleetTemplate) -> StateResult<()>;

    async fn get_template(&self, id: &str) -> StateResult<Option<FleetTemplate>>;

    async fn list_templates(&self) -> StateResult<Vec<FleetTemplate>>;

    /// Returns true if the template existed.
    async fn delete_template(&self, id: &str) -> StateResult<bool>;

    async fn get_instance(&self, id: &str) -> StateResult<Option<ServerInstance>>;

    /// All instances of a template, terminated ones included.
    async fn list_instances(&self, template_id: &str) -> StateResult<Vec<ServerInstance>>;

    /// Every non-TERMINATED instance across templates.
    async fn list_live_instances(&self) -> StateResult<Vec<ServerInstance>>;

    /// Write `instance` if the stored version equals `expected_version`
    /// (0 = must not exist). Fails with [`StateError::Conflict`] otherwise.
    async fn write_instance(
        &self,
        instance: &ServerInstance,
        expected_version: u64,
    ) -> StateResult<()>;

    /// Cheap liveness probe used at startup.
    async fn ping(&self) -> StateResult<()>;

    /// Store `declared` unless an identical spec is already stored.
    /// Returns the effective stored template.
    async fn sync_template(&self, declared: FleetTemplate) -> StateResult<FleetTemplate> {
        let id = declared.id.clone();
        let stored = self.get_template(&id).await?;
        match declared.supersedes(stored.as_ref()) {
            Some(next) => {
                self.put_template(&next).await?;
                info!(template = %next.id, version = next.version, "template stored");
                Ok(next)
            }
            None => match stored {
                Some(current) => Ok(current),
                None => Err(StateError::NotFound(id)),
            },
        }
    }
}

/// Thread-safe state store backed by redb. Suits a single replica.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(TEMPLATES).map_err(map_err!(Table))?;
        txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn scan_instances<F>(&self, mut keep: F) -> StateResult<Vec<ServerInstance>>
    where
        F: FnMut(&ServerInstance) -> bool,
    {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let inst: ServerInstance =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if keep(&inst) {
                results.push(inst);
            }
        }
        Ok(results)
    }
}

#[async_trait]
impl FleetStore for StateStore {
    // ── Templates ──────────────────────────────────────────────────

    async fn put_template(&self, template: &FleetTemplate) -> StateResult<()> {
        let value = serde_json::to_vec(template).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(TEMPLATES).map_err(map_err!(Table))?;
            table
                .insert(template.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(template = %template.id, version = template.version, "template written");
        Ok(())
    }

    async fn get_template(&self, id: &str) -> StateResult<Option<FleetTemplate>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TEMPLATES).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                let template: FleetTemplate =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(template))
            }
            None => Ok(None),
        }
    }

    async fn list_templates(&self) -> StateResult<Vec<FleetTemplate>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TEMPLATES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let template: FleetTemplate =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(template);
        }
        Ok(results)
    }

    async fn delete_template(&self, id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(TEMPLATES).map_err(map_err!(Table))?;
            existed = table.remove(id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(template = %id, existed, "template deleted");
        Ok(existed)
    }

    // ── Instances ──────────────────────────────────────────────────

    async fn get_instance(&self, id: &str) -> StateResult<Option<ServerInstance>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                let inst: ServerInstance =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(inst))
            }
            None => Ok(None),
        }
    }

    async fn list_instances(&self, template_id: &str) -> StateResult<Vec<ServerInstance>> {
        self.scan_instances(|i| i.template_id == template_id)
    }

    async fn list_live_instances(&self) -> StateResult<Vec<ServerInstance>> {
        self.scan_instances(ServerInstance::is_live)
    }

    async fn write_instance(
        &self,
        instance: &ServerInstance,
        expected_version: u64,
    ) -> StateResult<()> {
        let value = serde_json::to_vec(instance).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            let found = match table.get(instance.id.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    let current: ServerInstance =
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                    current.version
                }
                None => 0,
            };
            if found != expected_version {
                // Dropping the transaction without commit aborts it.
                return Err(StateError::Conflict {
                    id: instance.id.clone(),
                    expected: expected_version,
                    found,
                });
            }
            table
                .insert(instance.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            instance = %instance.id,
            state = %instance.state,
            version = instance.version,
            "instance written"
        );
        Ok(())
    }

    async fn ping(&self) -> StateResult<()> {
        self.db.begin_read().map_err(map_err!(Transaction))?;
        Ok(())
    }
}
