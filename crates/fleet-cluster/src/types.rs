//! Driver-facing pod types, independent of the Kubernetes object model.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use fleet_core::config::ResourceConfig;
use fleet_state::{FleetTemplate, ServerInstance};
use serde::{Deserialize, Serialize};

// ── Labels and annotations ─────────────────────────────────────────

pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "fleetgrid";
pub const LABEL_TEMPLATE: &str = "fleetgrid.io/template";
pub const LABEL_INSTANCE: &str = "fleetgrid.io/instance";

/// Current load, written by the game server.
pub const ANNOTATION_LOAD: &str = "fleetgrid.io/load";
/// RFC 3339 time of the game server's last heartbeat.
pub const ANNOTATION_HEARTBEAT: &str = "fleetgrid.io/heartbeat";

/// Selector matching every pod this orchestrator manages.
pub fn managed_selector() -> String {
    format!("{LABEL_MANAGED_BY}={MANAGED_BY_VALUE}")
}

// ── Requests ───────────────────────────────────────────────────────

/// Everything needed to start one instance's pod.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodRequest {
    pub name: String,
    pub namespace: String,
    pub instance_id: String,
    pub template_id: String,
    pub image: String,
    pub port: u16,
    pub resources: ResourceConfig,
    pub env: BTreeMap<String, String>,
    pub image_pull_secret: Option<String>,
}

impl PodRequest {
    pub fn for_instance(
        template: &FleetTemplate,
        instance: &ServerInstance,
        image_pull_secret: Option<&str>,
    ) -> Self {
        Self {
            name: instance.pod_name.clone(),
            namespace: instance.namespace.clone(),
            instance_id: instance.id.clone(),
            template_id: template.id.clone(),
            image: template.image.clone(),
            port: template.port,
            resources: template.resources.clone(),
            env: template.env.clone(),
            image_pull_secret: image_pull_secret.map(str::to_string),
        }
    }
}

/// Handle to a pod the driver created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PodRef {
    pub name: String,
    pub namespace: String,
}

impl PodRef {
    pub fn of(instance: &ServerInstance) -> Self {
        Self {
            name: instance.pod_name.clone(),
            namespace: instance.namespace.clone(),
        }
    }
}

// ── Observations ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    pub fn parse(phase: Option<&str>) -> Self {
        match phase {
            Some("Pending") => Self::Pending,
            Some("Running") => Self::Running,
            Some("Succeeded") => Self::Succeeded,
            Some("Failed") => Self::Failed,
            _ => Self::Unknown,
        }
    }
}

/// What the cluster currently reports about one pod.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodObservation {
    pub name: String,
    pub namespace: String,
    /// `None` when the pod lacks the instance label.
    pub instance_id: Option<String>,
    pub template_id: Option<String>,
    pub phase: PodPhase,
    pub ready: bool,
    /// `ip:port`, once the pod has an IP.
    pub address: Option<String>,
    pub load: Option<u32>,
    pub heartbeat: Option<DateTime<Utc>>,
    /// Deletion requested but not yet finished.
    pub terminating: bool,
}

impl PodObservation {
    pub fn pod_ref(&self) -> PodRef {
        PodRef {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodEventKind {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodLifecycleEvent {
    pub kind: PodEventKind,
    pub pod: PodObservation,
}
