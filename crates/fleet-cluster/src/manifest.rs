//! Pod manifest construction and pod status decoding.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use serde_json::{Value, json};

use crate::error::{DriverError, DriverResult};
use crate::types::*;

pub const CONTAINER_NAME: &str = "server";

/// Build the pod for one instance.
///
/// The game server receives `SERVER_ID`, `FLEET_TEMPLATE` and
/// `KUBERNETES_NAMESPACE` on top of the template's own env. Pods never
/// restart in place: a dead server is replaced by a new instance.
pub fn build_pod(req: &PodRequest) -> DriverResult<Pod> {
    let mut env: Vec<Value> = req
        .env
        .iter()
        .map(|(k, v)| json!({ "name": k, "value": v }))
        .collect();
    env.push(json!({ "name": "SERVER_ID", "value": req.instance_id }));
    env.push(json!({ "name": "FLEET_TEMPLATE", "value": req.template_id }));
    env.push(json!({ "name": "KUBERNETES_NAMESPACE", "value": req.namespace }));

    let mut requests = BTreeMap::new();
    let mut limits = BTreeMap::new();
    let r = &req.resources;
    if let Some(cpu) = &r.cpu_request {
        requests.insert("cpu", cpu.as_str());
    }
    if let Some(mem) = &r.memory_request {
        requests.insert("memory", mem.as_str());
    }
    if let Some(cpu) = &r.cpu_limit {
        limits.insert("cpu", cpu.as_str());
    }
    if let Some(mem) = &r.memory_limit {
        limits.insert("memory", mem.as_str());
    }

    let mut spec = json!({
        "restartPolicy": "Never",
        "containers": [{
            "name": CONTAINER_NAME,
            "image": req.image,
            "ports": [{ "containerPort": req.port, "protocol": "TCP" }],
            "env": env,
            "resources": { "requests": requests, "limits": limits },
        }],
    });
    if let Some(secret) = &req.image_pull_secret {
        spec["imagePullSecrets"] = json!([{ "name": secret }]);
    }

    let manifest = json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": req.name,
            "namespace": req.namespace,
            "labels": {
                LABEL_MANAGED_BY: MANAGED_BY_VALUE,
                LABEL_TEMPLATE: req.template_id,
                LABEL_INSTANCE: req.instance_id,
            },
        },
        "spec": spec,
    });
    serde_json::from_value(manifest).map_err(|e| DriverError::Manifest(e.to_string()))
}

/// Decode what the driver needs from a pod object.
pub fn observe(pod: &Pod) -> PodObservation {
    let meta = &pod.metadata;
    let label = |key: &str| meta.labels.as_ref().and_then(|l| l.get(key)).cloned();
    let annotation = |key: &str| meta.annotations.as_ref().and_then(|a| a.get(key)).cloned();

    let status = pod.status.as_ref();
    let phase = PodPhase::parse(status.and_then(|s| s.phase.as_deref()));
    let ready = status
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        });

    let port = pod
        .spec
        .as_ref()
        .and_then(|s| s.containers.first())
        .and_then(|c| c.ports.as_ref())
        .and_then(|p| p.first())
        .map(|p| p.container_port);
    let address = match (status.and_then(|s| s.pod_ip.as_deref()), port) {
        (Some(ip), Some(port)) if !ip.is_empty() => Some(format!("{ip}:{port}")),
        _ => None,
    };

    PodObservation {
        name: meta.name.clone().unwrap_or_default(),
        namespace: meta.namespace.clone().unwrap_or_default(),
        instance_id: label(LABEL_INSTANCE),
        template_id: label(LABEL_TEMPLATE),
        phase,
        ready,
        address,
        load: annotation(ANNOTATION_LOAD).and_then(|v| v.trim().parse().ok()),
        heartbeat: annotation(ANNOTATION_HEARTBEAT).and_then(|v| parse_heartbeat(&v)),
        terminating: meta.deletion_timestamp.is_some(),
    }
}

fn parse_heartbeat(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
