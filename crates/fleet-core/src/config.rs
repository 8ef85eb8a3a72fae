//! `fleet.toml` configuration parser.
//!
//! The recognized top-level keys are `clusterNamespace`, `fleetTemplates`,
//! `heartbeatTimeoutSeconds`, `readinessTimeoutSeconds`, `eventBusEndpoint`
//! and `storeEndpoint`. Tuning knobs live in an optional `[policy]` table.
//! A config that fails [`FleetConfig::validate`] aborts startup.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::retry::Backoff;
use crate::util::is_dns_label;

/// Longest template id that still leaves room for the instance suffix in a pod name.
pub const MAX_TEMPLATE_ID_LEN: usize = 40;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FleetConfig {
    pub cluster_namespace: String,
    pub fleet_templates: Vec<TemplateConfig>,
    pub heartbeat_timeout_seconds: u64,
    pub readiness_timeout_seconds: u64,
    pub event_bus_endpoint: String,
    pub store_endpoint: String,
    /// Secret used to pull game-server images, if the registry is private.
    #[serde(default)]
    pub image_pull_secret: Option<String>,
    #[serde(default)]
    pub policy: PolicyConfig,
}

/// A fleet template as declared in configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TemplateConfig {
    pub id: String,
    pub image: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub min_ready: u32,
    pub max_instances: u32,
    /// Load one instance can carry (e.g. player slots). Enables demand-based headroom.
    #[serde(default)]
    pub max_load: Option<u32>,
    #[serde(default)]
    pub resources: ResourceConfig,
    /// Overrides the global `readinessTimeoutSeconds`.
    #[serde(default)]
    pub readiness_timeout_seconds: Option<u64>,
    /// Overrides the global `heartbeatTimeoutSeconds`.
    #[serde(default)]
    pub heartbeat_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Kubernetes resource quantities, passed through verbatim (e.g. `"500m"`, `"1Gi"`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct ResourceConfig {
    #[serde(default)]
    pub cpu_request: Option<String>,
    #[serde(default)]
    pub memory_request: Option<String>,
    #[serde(default)]
    pub cpu_limit: Option<String>,
    #[serde(default)]
    pub memory_limit: Option<String>,
}

/// Retry, backoff and timing policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PolicyConfig {
    pub reconcile_interval_seconds: u64,
    pub create_max_attempts: u32,
    pub backoff_initial_millis: u64,
    pub backoff_max_millis: u64,
    pub io_timeout_seconds: u64,
    pub drain_timeout_seconds: u64,
    pub lease_ttl_seconds: u64,
    pub terminated_retention_seconds: u64,
    pub watch_channel_capacity: usize,
    pub metrics_log_interval_seconds: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_seconds: 2,
            create_max_attempts: 5,
            backoff_initial_millis: 200,
            backoff_max_millis: 10_000,
            io_timeout_seconds: 10,
            drain_timeout_seconds: 3600,
            lease_ttl_seconds: 5,
            terminated_retention_seconds: 600,
            watch_channel_capacity: 256,
            metrics_log_interval_seconds: 60,
        }
    }
}

impl PolicyConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_seconds)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_seconds)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_seconds)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_seconds)
    }

    pub fn terminated_retention(&self) -> Duration {
        Duration::from_secs(self.terminated_retention_seconds)
    }

    pub fn metrics_log_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_log_interval_seconds)
    }

    /// Backoff used for every external call the controller retries.
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.backoff_initial_millis),
            Duration::from_millis(self.backoff_max_millis),
            self.create_max_attempts,
        )
    }
}

/// Where durable fleet state lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEndpoint {
    /// Shared Redis document store (multi-replica).
    Redis(String),
    /// Embedded redb file (single replica).
    Redb(PathBuf),
    /// Ephemeral in-memory redb (tests, dry runs).
    Memory,
}

/// Which transport carries instance events between replicas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEndpoint {
    Redis(String),
    /// In-process bus; only meaningful with a single replica.
    Memory,
}

impl StoreEndpoint {
    pub fn parse(raw: &str) -> ConfigResult<Self> {
        let raw = raw.trim();
        if raw.starts_with("redis://") || raw.starts_with("rediss://") {
            Ok(Self::Redis(raw.to_string()))
        } else if raw == "memory://" {
            Ok(Self::Memory)
        } else if let Some(path) = raw.strip_prefix("redb://") {
            if path.is_empty() {
                return Err(ConfigError::Endpoint(raw.to_string()));
            }
            Ok(Self::Redb(PathBuf::from(path)))
        } else if !raw.is_empty() && !raw.contains("://") {
            Ok(Self::Redb(PathBuf::from(raw)))
        } else {
            Err(ConfigError::Endpoint(raw.to_string()))
        }
    }
}

impl BusEndpoint {
    pub fn parse(raw: &str) -> ConfigResult<Self> {
        let raw = raw.trim();
        if raw.starts_with("redis://") || raw.starts_with("rediss://") {
            Ok(Self::Redis(raw.to_string()))
        } else if raw == "memory://" {
            Ok(Self::Memory)
        } else {
            Err(ConfigError::Endpoint(raw.to_string()))
        }
    }
}

impl FleetConfig {
    /// Read, parse and validate a config file.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a config from a TOML string.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: FleetConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Check every field the control loop depends on.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.cluster_namespace.trim().is_empty() {
            return Err(ConfigError::Missing("clusterNamespace"));
        }
        if !is_dns_label(&self.cluster_namespace) {
            return Err(ConfigError::invalid(
                "clusterNamespace",
                "must be a lowercase DNS label",
            ));
        }
        if self.event_bus_endpoint.trim().is_empty() {
            return Err(ConfigError::Missing("eventBusEndpoint"));
        }
        if self.store_endpoint.trim().is_empty() {
            return Err(ConfigError::Missing("storeEndpoint"));
        }
        BusEndpoint::parse(&self.event_bus_endpoint)?;
        StoreEndpoint::parse(&self.store_endpoint)?;

        if self.heartbeat_timeout_seconds == 0 {
            return Err(ConfigError::invalid("heartbeatTimeoutSeconds", "must be > 0"));
        }
        if self.readiness_timeout_seconds == 0 {
            return Err(ConfigError::invalid("readinessTimeoutSeconds", "must be > 0"));
        }

        let mut seen = HashSet::new();
        for template in &self.fleet_templates {
            template.validate()?;
            if !seen.insert(template.id.as_str()) {
                return Err(ConfigError::DuplicateTemplate(template.id.clone()));
            }
        }

        let policy = &self.policy;
        if policy.reconcile_interval_seconds == 0 {
            return Err(ConfigError::invalid("policy.reconcileIntervalSeconds", "must be > 0"));
        }
        if policy.create_max_attempts == 0 {
            return Err(ConfigError::invalid("policy.createMaxAttempts", "must be > 0"));
        }
        if policy.backoff_initial_millis == 0
            || policy.backoff_initial_millis > policy.backoff_max_millis
        {
            return Err(ConfigError::invalid(
                "policy.backoffInitialMillis",
                "must be > 0 and <= backoffMaxMillis",
            ));
        }
        if policy.io_timeout_seconds == 0 {
            return Err(ConfigError::invalid("policy.ioTimeoutSeconds", "must be > 0"));
        }
        if policy.lease_ttl_seconds == 0 {
            return Err(ConfigError::invalid("policy.leaseTtlSeconds", "must be > 0"));
        }
        if policy.watch_channel_capacity == 0 {
            return Err(ConfigError::invalid("policy.watchChannelCapacity", "must be > 0"));
        }
        Ok(())
    }

    pub fn store(&self) -> ConfigResult<StoreEndpoint> {
        StoreEndpoint::parse(&self.store_endpoint)
    }

    pub fn bus(&self) -> ConfigResult<BusEndpoint> {
        BusEndpoint::parse(&self.event_bus_endpoint)
    }

    pub fn template(&self, id: &str) -> Option<&TemplateConfig> {
        self.fleet_templates.iter().find(|t| t.id == id)
    }
}

impl TemplateConfig {
    fn validate(&self) -> ConfigResult<()> {
        let field = |name: &str| format!("fleetTemplates[{}].{name}", self.id);

        if self.id.is_empty() {
            return Err(ConfigError::Missing("fleetTemplates[].id"));
        }
        if !is_dns_label(&self.id) || self.id.len() > MAX_TEMPLATE_ID_LEN {
            return Err(ConfigError::invalid(
                field("id"),
                format!("must be a lowercase DNS label of at most {MAX_TEMPLATE_ID_LEN} chars"),
            ));
        }
        if self.image.trim().is_empty() {
            return Err(ConfigError::invalid(field("image"), "must not be empty"));
        }
        if self.max_instances == 0 {
            return Err(ConfigError::invalid(field("maxInstances"), "must be > 0"));
        }
        if self.min_ready > self.max_instances {
            return Err(ConfigError::invalid(
                field("minReady"),
                format!("{} exceeds maxInstances {}", self.min_ready, self.max_instances),
            ));
        }
        if self.port == 0 {
            return Err(ConfigError::invalid(field("port"), "must be > 0"));
        }
        if self.max_load == Some(0) {
            return Err(ConfigError::invalid(field("maxLoad"), "must be > 0 when set"));
        }
        if self.readiness_timeout_seconds == Some(0) {
            return Err(ConfigError::invalid(field("readinessTimeoutSeconds"), "must be > 0"));
        }
        if self.heartbeat_timeout_seconds == Some(0) {
            return Err(ConfigError::invalid(field("heartbeatTimeoutSeconds"), "must be > 0"));
        }
        Ok(())
    }
}

fn default_port() -> u16 {
    25565
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
clusterNamespace = "games"
heartbeatTimeoutSeconds = 30
readinessTimeoutSeconds = 120
eventBusEndpoint = "redis://127.0.0.1:6379"
storeEndpoint = "redis://127.0.0.1:6379"

[[fleetTemplates]]
id = "lobby"
image = "registry.example.net/lobby:1.4"
minReady = 2
maxInstances = 5
maxLoad = 100

[fleetTemplates.resources]
cpuRequest = "500m"
memoryRequest = "1Gi"
"#;

    #[test]
    fn parse_minimal() {
        let config = FleetConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.cluster_namespace, "games");
        assert_eq!(config.fleet_templates.len(), 1);

        let lobby = config.template("lobby").unwrap();
        assert_eq!(lobby.port, 25565);
        assert_eq!(lobby.max_load, Some(100));
        assert_eq!(lobby.resources.cpu_request.as_deref(), Some("500m"));
        assert_eq!(config.policy, PolicyConfig::default());
    }

    #[test]
    fn policy_overrides() {
        let toml_str = format!(
            "{MINIMAL}\n[policy]\nreconcileIntervalSeconds = 7\ncreateMaxAttempts = 2\n"
        );
        let config = FleetConfig::from_toml_str(&toml_str).unwrap();
        assert_eq!(config.policy.reconcile_interval(), Duration::from_secs(7));
        assert_eq!(config.policy.create_max_attempts, 2);
        // Untouched knobs keep their defaults.
        assert_eq!(config.policy.lease_ttl_seconds, 5);
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let toml_str = MINIMAL.replace("storeEndpoint = \"redis://127.0.0.1:6379\"\n", "");
        assert!(matches!(
            FleetConfig::from_toml_str(&toml_str),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn min_above_max_is_rejected() {
        let toml_str = MINIMAL.replace("minReady = 2", "minReady = 9");
        let err = FleetConfig::from_toml_str(&toml_str).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field.ends_with("minReady")));
    }

    #[test]
    fn duplicate_template_is_rejected() {
        let dup = r#"
[[fleetTemplates]]
id = "lobby"
image = "registry.example.net/lobby:1.5"
minReady = 1
maxInstances = 2
"#;
        let toml_str = format!("{MINIMAL}{dup}");
        assert!(matches!(
            FleetConfig::from_toml_str(&toml_str),
            Err(ConfigError::DuplicateTemplate(id)) if id == "lobby"
        ));
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        let toml_str = MINIMAL.replace("heartbeatTimeoutSeconds = 30", "heartbeatTimeoutSeconds = 0");
        assert!(FleetConfig::from_toml_str(&toml_str).is_err());
    }

    #[test]
    fn bad_template_id_is_rejected() {
        let toml_str = MINIMAL.replace("id = \"lobby\"", "id = \"Lobby_1\"");
        assert!(FleetConfig::from_toml_str(&toml_str).is_err());
    }

    #[test]
    fn empty_image_is_rejected() {
        let toml_str = MINIMAL.replace("image = \"registry.example.net/lobby:1.4\"", "image = \"\"");
        assert!(FleetConfig::from_toml_str(&toml_str).is_err());
    }

    #[test]
    fn endpoint_parsing() {
        assert_eq!(
            StoreEndpoint::parse("redis://db:6379/0").unwrap(),
            StoreEndpoint::Redis("redis://db:6379/0".to_string())
        );
        assert_eq!(
            StoreEndpoint::parse("redb:///var/lib/fleet/state.redb").unwrap(),
            StoreEndpoint::Redb(PathBuf::from("/var/lib/fleet/state.redb"))
        );
        assert_eq!(
            StoreEndpoint::parse("./fleet.redb").unwrap(),
            StoreEndpoint::Redb(PathBuf::from("./fleet.redb"))
        );
        assert_eq!(StoreEndpoint::parse("memory://").unwrap(), StoreEndpoint::Memory);
        assert!(StoreEndpoint::parse("mongodb://db").is_err());

        assert_eq!(BusEndpoint::parse("memory://").unwrap(), BusEndpoint::Memory);
        assert!(BusEndpoint::parse("nats://bus").is_err());
    }

    #[test]
    fn from_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.toml");
        std::fs::write(&path, MINIMAL).unwrap();

        let config = FleetConfig::from_file(&path).unwrap();
        let rendered = config.to_toml_string().unwrap();
        assert_eq!(FleetConfig::from_toml_str(&rendered).unwrap(), config);
    }

    #[test]
    fn missing_file_is_read_error() {
        let err = FleetConfig::from_file(Path::new("/nonexistent/fleet.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
