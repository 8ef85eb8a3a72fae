//! Redis-backed [`FleetStore`] shared by every orchestrator replica.
//!
//! Layout (with the default `fleetgrid` namespace):
//! - `fleetgrid:template:{id}` JSON string, indexed by set `fleetgrid:templates`
//! - `fleetgrid:instance:{id}` hash `{version, doc}`
//! - `fleetgrid:instances:{templateId}` set of instance ids
//! - `fleetgrid:live` set of non-terminated instance ids
//!
//! Instance writes run as a Lua script so the version check and the write
//! are atomic.

use async_trait::async_trait;
use redis::Script;
use redis::aio::MultiplexedConnection;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::store::FleetStore;
use crate::types::*;

pub const DEFAULT_NAMESPACE: &str = "fleetgrid";

#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    namespace: String,
    cas: Script,
}

impl RedisStore {
    pub fn new(url: &str) -> StateResult<Self> {
        Self::with_namespace(url, DEFAULT_NAMESPACE)
    }

    pub fn with_namespace(url: &str, namespace: &str) -> StateResult<Self> {
        let client = redis::Client::open(url).map_err(|e| StateError::Open(e.to_string()))?;
        Ok(Self {
            client,
            namespace: namespace.to_string(),
            cas: Script::new(include_str!("../scripts/instance_cas.lua")),
        })
    }

    async fn conn(&self) -> StateResult<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StateError::Unavailable(format!("redis connection failed: {e}")))
    }

    // ── Keys ───────────────────────────────────────────────────────

    fn key_template(&self, id: &str) -> String {
        format!("{}:template:{}", self.namespace, id)
    }

    fn key_templates(&self) -> String {
        format!("{}:templates", self.namespace)
    }

    fn key_instance(&self, id: &str) -> String {
        format!("{}:instance:{}", self.namespace, id)
    }

    fn key_template_instances(&self, template_id: &str) -> String {
        format!("{}:instances:{}", self.namespace, template_id)
    }

    fn key_live(&self) -> String {
        format!("{}:live", self.namespace)
    }

    async fn load_instances(
        &self,
        conn: &mut MultiplexedConnection,
        ids: &[String],
    ) -> StateResult<Vec<ServerInstance>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        for id in ids {
            pipe.cmd("HGET").arg(self.key_instance(id)).arg("doc");
        }
        let docs: Vec<Option<String>> = pipe.query_async(conn).await?;
        docs.into_iter()
            .flatten()
            .map(|doc| {
                serde_json::from_str(&doc).map_err(|e| StateError::Deserialize(e.to_string()))
            })
            .collect()
    }
}

#[async_trait]
impl FleetStore for RedisStore {
    async fn put_template(&self, template: &FleetTemplate) -> StateResult<()> {
        let doc = serde_json::to_string(template).map_err(|e| StateError::Serialize(e.to_string()))?;
        let mut conn = self.conn().await?;
        redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(self.key_template(&template.id))
            .arg(doc)
            .ignore()
            .cmd("SADD")
            .arg(self.key_templates())
            .arg(&template.id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        debug!(template = %template.id, version = template.version, "template written");
        Ok(())
    }

    async fn get_template(&self, id: &str) -> StateResult<Option<FleetTemplate>> {
        let mut conn = self.conn().await?;
        let doc: Option<String> = redis::cmd("GET")
            .arg(self.key_template(id))
            .query_async(&mut conn)
            .await?;
        doc.map(|d| serde_json::from_str(&d).map_err(|e| StateError::Deserialize(e.to_string())))
            .transpose()
    }

    async fn list_templates(&self) -> StateResult<Vec<FleetTemplate>> {
        let mut conn = self.conn().await?;
        let ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.key_templates())
            .query_async(&mut conn)
            .await?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(t) = self.get_template(&id).await? {
                out.push(t);
            }
        }
        Ok(out)
    }

    async fn delete_template(&self, id: &str) -> StateResult<bool> {
        let mut conn = self.conn().await?;
        let (deleted, _): (i64, i64) = redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(self.key_template(id))
            .cmd("SREM")
            .arg(self.key_templates())
            .arg(id)
            .query_async(&mut conn)
            .await?;
        Ok(deleted > 0)
    }

    async fn get_instance(&self, id: &str) -> StateResult<Option<ServerInstance>> {
        let mut conn = self.conn().await?;
        let mut found = self.load_instances(&mut conn, &[id.to_string()]).await?;
        Ok(found.pop())
    }

    async fn list_instances(&self, template_id: &str) -> StateResult<Vec<ServerInstance>> {
        let mut conn = self.conn().await?;
        let ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.key_template_instances(template_id))
            .query_async(&mut conn)
            .await?;
        self.load_instances(&mut conn, &ids).await
    }

    async fn list_live_instances(&self) -> StateResult<Vec<ServerInstance>> {
        let mut conn = self.conn().await?;
        let ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.key_live())
            .query_async(&mut conn)
            .await?;
        self.load_instances(&mut conn, &ids).await
    }

    async fn write_instance(
        &self,
        instance: &ServerInstance,
        expected_version: u64,
    ) -> StateResult<()> {
        let doc = serde_json::to_string(instance).map_err(|e| StateError::Serialize(e.to_string()))?;
        let mut conn = self.conn().await?;
        let (ok, found): (i64, u64) = self
            .cas
            .key(self.key_instance(&instance.id))
            .key(self.key_template_instances(&instance.template_id))
            .key(self.key_live())
            .arg(expected_version)
            .arg(instance.version)
            .arg(doc)
            .arg(&instance.id)
            .arg(if instance.is_live() { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await?;
        if ok != 1 {
            return Err(StateError::Conflict {
                id: instance.id.clone(),
                expected: expected_version,
                found,
            });
        }
        debug!(
            instance = %instance.id,
            state = %instance.state,
            version = instance.version,
            "instance written"
        );
        Ok(())
    }

    async fn ping(&self) -> StateResult<()> {
        let mut conn = self.conn().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}
