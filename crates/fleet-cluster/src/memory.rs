//! In-process [`ClusterDriver`] for tests and dry runs.
//!
//! Pods live in a map; helper methods play the role of the kubelet and the
//! game server (mark running, report load, crash, disappear).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::debug;

use crate::driver::ClusterDriver;
use crate::error::{DriverError, DriverResult};
use crate::types::*;

#[derive(Default)]
struct Inner {
    pods: BTreeMap<String, (PodObservation, u16)>,
    watchers: Vec<mpsc::Sender<PodLifecycleEvent>>,
    created: Vec<String>,
    deleted: Vec<String>,
    next_ip: u32,
}

#[derive(Clone)]
pub struct MemoryDriver {
    inner: Arc<Mutex<Inner>>,
    namespace: String,
    capacity: usize,
    fail_creates: Arc<AtomicU32>,
}

impl MemoryDriver {
    pub fn new(namespace: &str) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            namespace: namespace.to_string(),
            capacity: 256,
            fail_creates: Arc::new(AtomicU32::new(0)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Fail the next `n` creates with a transient error (`u32::MAX` = always).
    pub fn fail_creates(&self, n: u32) {
        self.fail_creates.store(n, Ordering::SeqCst);
    }

    pub fn pods(&self) -> Vec<PodObservation> {
        self.lock().pods.values().map(|(p, _)| p.clone()).collect()
    }

    pub fn pod(&self, name: &str) -> Option<PodObservation> {
        self.lock().pods.get(name).map(|(p, _)| p.clone())
    }

    /// Names passed to successful `create_pod` calls, in order.
    pub fn created(&self) -> Vec<String> {
        self.lock().created.clone()
    }

    /// Names passed to `delete_pod` calls, in order.
    pub fn deleted(&self) -> Vec<String> {
        self.lock().deleted.clone()
    }

    /// Close every open watch, as a dropped API connection would.
    pub fn disconnect(&self) {
        self.lock().watchers.clear();
    }

    /// Pod is scheduled, running and passes its readiness probe.
    pub fn mark_ready(&self, name: &str, now: DateTime<Utc>) {
        self.modify(name, PodEventKind::Modified, |pod, port, ip| {
            pod.phase = PodPhase::Running;
            pod.ready = true;
            pod.address = Some(format!("10.0.0.{ip}:{port}"));
            pod.heartbeat = Some(now);
            pod.load = Some(0);
        });
    }

    /// The game server reports load and a heartbeat through pod annotations.
    pub fn report(&self, name: &str, load: u32, heartbeat: DateTime<Utc>) {
        self.modify(name, PodEventKind::Modified, |pod, _, _| {
            pod.load = Some(load);
            pod.heartbeat = Some(heartbeat);
        });
    }

    pub fn set_phase(&self, name: &str, phase: PodPhase) {
        self.modify(name, PodEventKind::Modified, |pod, _, _| {
            pod.phase = phase;
            if phase != PodPhase::Running {
                pod.ready = false;
            }
        });
    }

    /// The pod vanishes without the orchestrator asking.
    pub fn remove_externally(&self, name: &str) {
        let mut inner = self.lock();
        if let Some((pod, _)) = inner.pods.remove(name) {
            broadcast(&mut inner, PodEventKind::Deleted, pod);
        }
    }

    /// Add a pod behind the orchestrator's back (e.g. left over from a crash).
    pub fn insert_pod(&self, pod: PodObservation, port: u16) {
        let mut inner = self.lock();
        inner.pods.insert(pod.name.clone(), (pod.clone(), port));
        broadcast(&mut inner, PodEventKind::Added, pod);
    }

    fn modify<F>(&self, name: &str, kind: PodEventKind, f: F)
    where
        F: FnOnce(&mut PodObservation, u16, u32),
    {
        let mut inner = self.lock();
        inner.next_ip += 1;
        let ip = inner.next_ip;
        let updated = match inner.pods.get_mut(name) {
            Some((pod, port)) => {
                f(pod, *port, ip);
                pod.clone()
            }
            None => return,
        };
        broadcast(&mut inner, kind, updated);
    }
}

fn broadcast(inner: &mut Inner, kind: PodEventKind, pod: PodObservation) {
    let event = PodLifecycleEvent { kind, pod };
    // Full or closed watchers are dropped; the consumer resyncs on reconnect.
    inner.watchers.retain(|tx| tx.try_send(event.clone()).is_ok());
}

#[async_trait]
impl ClusterDriver for MemoryDriver {
    async fn create_pod(&self, req: &PodRequest) -> DriverResult<PodRef> {
        let failing = self
            .fail_creates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                u32::MAX => Some(u32::MAX),
                n => Some(n - 1),
            })
            .is_ok();
        if failing {
            return Err(DriverError::Injected(format!("create {}", req.name)));
        }

        let mut inner = self.lock();
        let pod = PodObservation {
            name: req.name.clone(),
            namespace: self.namespace.clone(),
            instance_id: Some(req.instance_id.clone()),
            template_id: Some(req.template_id.clone()),
            phase: PodPhase::Pending,
            ready: false,
            address: None,
            load: None,
            heartbeat: None,
            terminating: false,
        };
        if !inner.pods.contains_key(&req.name) {
            inner.pods.insert(req.name.clone(), (pod.clone(), req.port));
            inner.created.push(req.name.clone());
            broadcast(&mut inner, PodEventKind::Added, pod);
        }
        debug!(pod = %req.name, "memory pod created");
        Ok(PodRef {
            name: req.name.clone(),
            namespace: self.namespace.clone(),
        })
    }

    async fn delete_pod(&self, pod: &PodRef) -> DriverResult<()> {
        let mut inner = self.lock();
        inner.deleted.push(pod.name.clone());
        if let Some((obs, _)) = inner.pods.remove(&pod.name) {
            broadcast(&mut inner, PodEventKind::Deleted, obs);
        }
        Ok(())
    }

    async fn list_pods(&self) -> DriverResult<Vec<PodObservation>> {
        Ok(self.pods())
    }

    async fn watch(&self) -> DriverResult<mpsc::Receiver<PodLifecycleEvent>> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.lock().watchers.push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::config::ResourceConfig;

    fn request(name: &str) -> PodRequest {
        PodRequest {
            name: name.into(),
            namespace: "games".into(),
            instance_id: name.into(),
            template_id: "lobby".into(),
            image: "lobby:1".into(),
            port: 25565,
            resources: ResourceConfig::default(),
            env: BTreeMap::new(),
            image_pull_secret: None,
        }
    }

    #[tokio::test]
    async fn create_watch_delete() {
        let driver = MemoryDriver::new("games");
        let mut rx = driver.watch().await.unwrap();

        driver.create_pod(&request("lobby-1")).await.unwrap();
        let added = rx.recv().await.unwrap();
        assert_eq!(added.kind, PodEventKind::Added);
        assert_eq!(added.pod.instance_id.as_deref(), Some("lobby-1"));

        driver.mark_ready("lobby-1", Utc::now());
        let modified = rx.recv().await.unwrap();
        assert!(modified.pod.ready);
        assert!(modified.pod.address.unwrap().ends_with(":25565"));

        let pod = PodRef { name: "lobby-1".into(), namespace: "games".into() };
        driver.delete_pod(&pod).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().kind, PodEventKind::Deleted);

        // Deleting again is not an error.
        driver.delete_pod(&pod).await.unwrap();
        assert!(driver.list_pods().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn injected_create_failures() {
        let driver = MemoryDriver::new("games");
        driver.fail_creates(2);
        assert!(driver.create_pod(&request("a")).await.unwrap_err().is_transient());
        assert!(driver.create_pod(&request("a")).await.is_err());
        driver.create_pod(&request("a")).await.unwrap();
        assert_eq!(driver.created(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn disconnect_closes_watch() {
        let driver = MemoryDriver::new("games");
        let mut rx = driver.watch().await.unwrap();
        driver.disconnect();
        assert!(rx.recv().await.is_none());
    }
}
