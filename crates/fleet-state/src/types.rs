//! Domain types for fleet state.
//!
//! These types represent fleet templates, server instances, the events
//! exchanged between replicas, and the routing projection. All types are
//! serializable to/from JSON for storage and for the event bus.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_core::config::{FleetConfig, ResourceConfig, TemplateConfig};
use fleet_core::util::{generate_instance_id, spec_hash};
use serde::{Deserialize, Serialize};

use crate::error::{StateError, StateResult};

/// Unique identifier for a fleet template.
pub type TemplateId = String;

/// Unique identifier for a server instance (doubles as its pod name).
pub type InstanceId = String;

// ── Template ───────────────────────────────────────────────────────

/// Declared shape of a fleet: which image to run and how many of it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FleetTemplate {
    pub id: TemplateId,
    pub image: String,
    pub port: u16,
    pub resources: ResourceConfig,
    pub min_ready: u32,
    pub max_instances: u32,
    /// Per-instance capacity. `None` disables demand-based sizing.
    pub max_load: Option<u32>,
    pub readiness_timeout_seconds: u64,
    pub heartbeat_timeout_seconds: u64,
    pub env: BTreeMap<String, String>,
    /// Bumped only when `spec_hash` changes.
    pub version: u64,
    /// The version at which the pod shape (image, port, resources, env)
    /// last changed. Instances created before it are outdated.
    pub pod_version: u64,
    pub spec_hash: String,
    pub updated_at: DateTime<Utc>,
}

/// The hashed subset of a template: everything an operator declares.
#[derive(Serialize)]
struct DeclaredSpec<'a> {
    image: &'a str,
    port: u16,
    resources: &'a ResourceConfig,
    min_ready: u32,
    max_instances: u32,
    max_load: Option<u32>,
    readiness_timeout_seconds: u64,
    heartbeat_timeout_seconds: u64,
    env: &'a BTreeMap<String, String>,
}

impl FleetTemplate {
    /// Build version 1 of a template from its config entry, filling
    /// timeouts from the global defaults.
    pub fn from_config(
        template: &TemplateConfig,
        config: &FleetConfig,
        now: DateTime<Utc>,
    ) -> StateResult<Self> {
        let mut out = Self {
            id: template.id.clone(),
            image: template.image.clone(),
            port: template.port,
            resources: template.resources.clone(),
            min_ready: template.min_ready,
            max_instances: template.max_instances,
            max_load: template.max_load,
            readiness_timeout_seconds: template
                .readiness_timeout_seconds
                .unwrap_or(config.readiness_timeout_seconds),
            heartbeat_timeout_seconds: template
                .heartbeat_timeout_seconds
                .unwrap_or(config.heartbeat_timeout_seconds),
            env: template.env.clone(),
            version: 1,
            pod_version: 1,
            spec_hash: String::new(),
            updated_at: now,
        };
        out.spec_hash = out.compute_hash()?;
        Ok(out)
    }

    pub fn compute_hash(&self) -> StateResult<String> {
        let declared = DeclaredSpec {
            image: &self.image,
            port: self.port,
            resources: &self.resources,
            min_ready: self.min_ready,
            max_instances: self.max_instances,
            max_load: self.max_load,
            readiness_timeout_seconds: self.readiness_timeout_seconds,
            heartbeat_timeout_seconds: self.heartbeat_timeout_seconds,
            env: &self.env,
        };
        spec_hash(&declared).map_err(|e| StateError::Serialize(e.to_string()))
    }

    /// Reconcile a freshly declared template against the stored one.
    ///
    /// Returns `None` when nothing changed, otherwise the record to store,
    /// carrying the next version.
    pub fn supersedes(mut self, stored: Option<&FleetTemplate>) -> Option<Self> {
        match stored {
            Some(prev) if prev.spec_hash == self.spec_hash => None,
            Some(prev) => {
                self.version = prev.version + 1;
                self.pod_version = if self.same_pod_shape(prev) {
                    prev.pod_version
                } else {
                    self.version
                };
                Some(self)
            }
            None => Some(self),
        }
    }

    fn same_pod_shape(&self, other: &FleetTemplate) -> bool {
        self.image == other.image
            && self.port == other.port
            && self.resources == other.resources
            && self.env == other.env
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_seconds)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_seconds)
    }
}

// ── Instance ───────────────────────────────────────────────────────

/// Lifecycle state of a server instance. Declaration order is rank order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    Pending,
    Starting,
    Ready,
    Draining,
    Terminated,
}

impl InstanceState {
    pub fn rank(self) -> u8 {
        self as u8
    }

    /// Transitions only move forward; any non-terminal state may terminate.
    pub fn can_transition_to(self, next: InstanceState) -> bool {
        next.rank() > self.rank()
    }

    /// Counts toward the template's desired size.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Starting | Self::Ready)
    }

    /// Backed (or about to be backed) by a pod.
    pub fn is_live(self) -> bool {
        self != Self::Terminated
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Starting => "STARTING",
            Self::Ready => "READY",
            Self::Draining => "DRAINING",
            Self::Terminated => "TERMINATED",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an instance reached TERMINATED. Serialized as stable kebab-case strings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum TerminationReason {
    HeartbeatTimeout,
    ReadinessTimeout,
    CreateFailed,
    PodFailed,
    PodExited,
    PodDeleted,
    PodMissing,
    Drained,
    DrainTimeout,
    TemplateRemoved,
}

impl TerminationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HeartbeatTimeout => "heartbeat-timeout",
            Self::ReadinessTimeout => "readiness-timeout",
            Self::CreateFailed => "create-failed",
            Self::PodFailed => "pod-failed",
            Self::PodExited => "pod-exited",
            Self::PodDeleted => "pod-deleted",
            Self::PodMissing => "pod-missing",
            Self::Drained => "drained",
            Self::DrainTimeout => "drain-timeout",
            Self::TemplateRemoved => "template-removed",
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One game-server workload unit, backed by one pod.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerInstance {
    pub id: InstanceId,
    pub template_id: TemplateId,
    /// Template version the pod was created from.
    pub template_version: u64,
    pub state: InstanceState,
    pub pod_name: String,
    pub namespace: String,
    /// `host:port`, present only once READY.
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub load: u32,
    #[serde(default)]
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub termination_reason: Option<TerminationReason>,
    /// Monotonic per-instance write counter, starting at 1.
    pub version: u64,
}

impl ServerInstance {
    /// A fresh PENDING record with a generated id.
    pub fn pending(template: &FleetTemplate, namespace: &str, now: DateTime<Utc>) -> Self {
        let id = generate_instance_id(&template.id);
        Self {
            pod_name: id.clone(),
            id,
            template_id: template.id.clone(),
            template_version: template.version,
            state: InstanceState::Pending,
            namespace: namespace.to_string(),
            address: None,
            load: 0,
            last_heartbeat: None,
            created_at: now,
            updated_at: now,
            termination_reason: None,
            version: 1,
        }
    }

    /// The record that results from moving to `next`, with the version bumped.
    pub fn transitioned(
        &self,
        next: InstanceState,
        reason: Option<TerminationReason>,
        now: DateTime<Utc>,
    ) -> StateResult<Self> {
        if !self.state.can_transition_to(next) {
            return Err(StateError::InvalidTransition {
                id: self.id.clone(),
                from: self.state,
                to: next,
            });
        }
        let mut out = self.clone();
        out.state = next;
        out.version = self.version + 1;
        out.updated_at = now;
        if next < InstanceState::Ready {
            out.address = None;
        }
        if next == InstanceState::Terminated {
            out.termination_reason = reason;
        }
        Ok(out)
    }

    /// Merge observation fields. Heartbeats only move forward; load follows
    /// the newest heartbeat. Returns whether anything changed.
    pub fn merge_observation(&mut self, load: u32, heartbeat: Option<DateTime<Utc>>) -> bool {
        match (heartbeat, self.last_heartbeat) {
            (Some(hb), Some(prev)) if hb < prev => false,
            (Some(hb), prev) => {
                let changed = prev != Some(hb) || self.load != load;
                self.last_heartbeat = Some(hb);
                self.load = load;
                changed
            }
            (None, _) => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn is_live(&self) -> bool {
        self.state.is_live()
    }

    /// Whether this instance runs an older revision of its template.
    pub fn is_outdated(&self, template: &FleetTemplate) -> bool {
        self.template_version < template.pod_version
    }
}

// ── Events ─────────────────────────────────────────────────────────

/// A durably recorded instance change, fanned out to every replica.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceEvent {
    pub instance_id: InstanceId,
    pub template_id: TemplateId,
    pub old_state: Option<InstanceState>,
    pub new_state: InstanceState,
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    pub origin_replica_id: String,
    /// The record as written, so peers can materialize unseen instances.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<ServerInstance>,
}

impl InstanceEvent {
    /// Describe the write `prev -> next`.
    pub fn for_write(prev: Option<&ServerInstance>, next: &ServerInstance, origin: &str) -> Self {
        Self {
            instance_id: next.id.clone(),
            template_id: next.template_id.clone(),
            old_state: prev.map(|p| p.state),
            new_state: next.state,
            version: next.version,
            timestamp: next.updated_at,
            origin_replica_id: origin.to_string(),
            instance: Some(next.clone()),
        }
    }

    pub fn to_json(&self) -> StateResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| StateError::Serialize(e.to_string()))
    }

    pub fn from_json(bytes: &[u8]) -> StateResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| StateError::Deserialize(e.to_string()))
    }
}

// ── Routing ────────────────────────────────────────────────────────

/// A READY instance as seen by whatever routes players onto the fleet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoutingEntry {
    pub instance_id: InstanceId,
    pub template_id: TemplateId,
    pub address: String,
    pub load: u32,
    pub max_load: Option<u32>,
}

impl RoutingEntry {
    pub fn has_capacity(&self) -> bool {
        self.max_load.is_none_or(|max| self.load < max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn test_config() -> FleetConfig {
        FleetConfig::from_toml_str(
            r#"
clusterNamespace = "games"
heartbeatTimeoutSeconds = 30
readinessTimeoutSeconds = 120
eventBusEndpoint = "memory://"
storeEndpoint = "memory://"

[[fleetTemplates]]
id = "lobby"
image = "lobby:1"
minReady = 2
maxInstances = 5
heartbeatTimeoutSeconds = 10
"#,
        )
        .unwrap()
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn template_from_config_applies_defaults() {
        let config = test_config();
        let t = FleetTemplate::from_config(&config.fleet_templates[0], &config, t0()).unwrap();
        assert_eq!(t.version, 1);
        assert_eq!(t.readiness_timeout_seconds, 120);
        assert_eq!(t.heartbeat_timeout_seconds, 10);
        assert_eq!(t.spec_hash.len(), 64);
    }

    #[test]
    fn template_version_bumps_only_on_hash_change() {
        let config = test_config();
        let stored = FleetTemplate::from_config(&config.fleet_templates[0], &config, t0()).unwrap();

        let same = FleetTemplate::from_config(&config.fleet_templates[0], &config, t0()).unwrap();
        assert!(same.supersedes(Some(&stored)).is_none());

        let mut changed_cfg = config.fleet_templates[0].clone();
        changed_cfg.image = "lobby:2".into();
        let changed = FleetTemplate::from_config(&changed_cfg, &config, t0()).unwrap();
        let next = changed.supersedes(Some(&stored)).unwrap();
        assert_eq!(next.version, 2);
        assert_eq!(next.pod_version, 2);
    }

    #[test]
    fn sizing_change_keeps_pod_version() {
        let config = test_config();
        let stored = FleetTemplate::from_config(&config.fleet_templates[0], &config, t0()).unwrap();

        let mut resized = config.fleet_templates[0].clone();
        resized.max_instances += 3;
        let next = FleetTemplate::from_config(&resized, &config, t0())
            .unwrap()
            .supersedes(Some(&stored))
            .unwrap();
        assert_eq!(next.version, 2);
        assert_eq!(next.pod_version, 1);

        let mut inst = ServerInstance::pending(&stored, "games", t0());
        assert!(!inst.is_outdated(&next));
        inst.template_version = 0;
        assert!(inst.is_outdated(&next));
    }

    #[test]
    fn state_machine_is_forward_only() {
        use InstanceState::*;
        assert!(Pending.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Draining));
        assert!(Pending.can_transition_to(Terminated));
        assert!(!Ready.can_transition_to(Starting));
        assert!(!Draining.can_transition_to(Ready));
        assert!(!Terminated.can_transition_to(Terminated));
        assert!(!Ready.can_transition_to(Ready));
    }

    #[test]
    fn transition_bumps_version_and_records_reason() {
        let config = test_config();
        let t = FleetTemplate::from_config(&config.fleet_templates[0], &config, t0()).unwrap();
        let inst = ServerInstance::pending(&t, "games", t0());
        assert_eq!(inst.version, 1);
        assert_eq!(inst.pod_name, inst.id);

        let term = inst
            .transitioned(
                InstanceState::Terminated,
                Some(TerminationReason::CreateFailed),
                t0(),
            )
            .unwrap();
        assert_eq!(term.version, 2);
        assert_eq!(term.termination_reason, Some(TerminationReason::CreateFailed));

        let err = term
            .transitioned(InstanceState::Ready, None, t0())
            .unwrap_err();
        assert!(matches!(err, StateError::InvalidTransition { .. }));
    }

    #[test]
    fn observation_merge_is_monotonic() {
        let config = test_config();
        let t = FleetTemplate::from_config(&config.fleet_templates[0], &config, t0()).unwrap();
        let mut inst = ServerInstance::pending(&t, "games", t0());
        let later = t0() + chrono::Duration::seconds(5);

        assert!(inst.merge_observation(7, Some(later)));
        assert!(!inst.merge_observation(3, Some(t0())));
        assert_eq!(inst.load, 7);
        assert!(!inst.merge_observation(7, Some(later)));
    }

    #[test]
    fn event_wire_format_is_camel_case() {
        let config = test_config();
        let t = FleetTemplate::from_config(&config.fleet_templates[0], &config, t0()).unwrap();
        let inst = ServerInstance::pending(&t, "games", t0());
        let event = InstanceEvent::for_write(None, &inst, "replica-a");

        let value: serde_json::Value = serde_json::from_slice(&event.to_json().unwrap()).unwrap();
        assert_eq!(value["instanceId"], inst.id.as_str());
        assert_eq!(value["templateId"], "lobby");
        assert_eq!(value["newState"], "PENDING");
        assert!(value["oldState"].is_null());
        assert_eq!(value["originReplicaId"], "replica-a");
        assert_eq!(value["instance"]["templateVersion"], 1);

        let back = InstanceEvent::from_json(&event.to_json().unwrap()).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn termination_reasons_are_stable_strings() {
        let json = serde_json::to_string(&TerminationReason::HeartbeatTimeout).unwrap();
        assert_eq!(json, "\"heartbeat-timeout\"");
        assert_eq!(TerminationReason::DrainTimeout.to_string(), "drain-timeout");
    }
}
