//! Fleet controller: drives observed instances toward the declared templates.
//!
//! Every instance write goes to the store first (compare-and-set on the
//! record version), then to the local registry, then out on the bus.
//! Cluster commands and instance writes are issued only while this replica
//! holds the leader lease; every replica keeps its registry current from
//! the pod watch and the bus.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use fleet_bus::{EventBus, LeaderLease};
use fleet_cluster::{
    ClusterDriver, PodEventKind, PodLifecycleEvent, PodObservation, PodPhase, PodRef, PodRequest,
};
use fleet_core::config::{FleetConfig, PolicyConfig};
use fleet_core::retry::{Backoff, retry_with};
use fleet_core::util::now;
use fleet_registry::InstanceRegistry;
use fleet_scheduler::{ScalePlan, plan_removed, sweep};
use fleet_state::{
    FleetStore, FleetTemplate, InstanceEvent, InstanceId, InstanceState, ServerInstance,
    TemplateId, TerminationReason,
};
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{debug, info, instrument, warn};

use crate::error::{ControllerError, ControllerResult};
use crate::metrics::FleetMetrics;

/// The external systems a controller talks to.
#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn FleetStore>,
    pub bus: Arc<dyn EventBus>,
    pub driver: Arc<dyn ClusterDriver>,
    pub lease: Arc<dyn LeaderLease>,
}

/// A template as the controller tracks it.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateSlot {
    pub template: FleetTemplate,
    /// Gone from configuration; its instances are drained, then it is deleted.
    pub retired: bool,
}

/// Outcome of a full list-and-compare pass against the cluster.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ResyncReport {
    pub pods: usize,
    pub orphans_deleted: usize,
    pub missing: usize,
}

pub struct FleetController {
    replica_id: String,
    namespace: String,
    image_pull_secret: Option<String>,
    policy: PolicyConfig,
    backends: Backends,
    registry: Arc<InstanceRegistry>,
    metrics: Arc<FleetMetrics>,
    templates: RwLock<BTreeMap<TemplateId, TemplateSlot>>,
    /// One reconcile at a time per template.
    template_locks: DashMap<TemplateId, Arc<Mutex<()>>>,
    /// Serializes template syncs, store refreshes and retirement.
    template_sync: Mutex<()>,
    leader: AtomicBool,
}

impl FleetController {
    pub fn new(config: &FleetConfig, replica_id: impl Into<String>, backends: Backends) -> Self {
        Self {
            replica_id: replica_id.into(),
            namespace: config.cluster_namespace.clone(),
            image_pull_secret: config.image_pull_secret.clone(),
            policy: config.policy.clone(),
            backends,
            registry: Arc::new(InstanceRegistry::new()),
            metrics: Arc::new(FleetMetrics::new()),
            templates: RwLock::new(BTreeMap::new()),
            template_locks: DashMap::new(),
            template_sync: Mutex::new(()),
            leader: AtomicBool::new(false),
        }
    }

    pub fn replica_id(&self) -> &str {
        &self.replica_id
    }

    pub fn policy(&self) -> &PolicyConfig {
        &self.policy
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<FleetMetrics> {
        &self.metrics
    }

    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    pub async fn template(&self, template_id: &str) -> Option<TemplateSlot> {
        self.templates.read().await.get(template_id).cloned()
    }

    pub async fn template_ids(&self) -> Vec<TemplateId> {
        self.templates.read().await.keys().cloned().collect()
    }

    // ── External calls ─────────────────────────────────────────────

    async fn bounded<T, E, F>(&self, op: &'static str, fut: F) -> ControllerResult<T>
    where
        F: Future<Output = Result<T, E>>,
        ControllerError: From<E>,
    {
        let after = self.policy.io_timeout();
        match tokio::time::timeout(after, fut).await {
            Ok(result) => result.map_err(ControllerError::from),
            Err(_) => Err(ControllerError::Timeout { op, after }),
        }
    }

    async fn retried<T, F, Fut>(&self, op: &'static str, backoff: &Backoff, f: F) -> ControllerResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ControllerResult<T>>,
    {
        retry_with(
            backoff,
            op,
            |_, _| FleetMetrics::incr(&self.metrics.transient_retries),
            f,
        )
        .await
    }

    /// Open the pod watch stream.
    pub async fn watch_pods(&self) -> ControllerResult<mpsc::Receiver<PodLifecycleEvent>> {
        self.bounded("cluster.watch", self.backends.driver.watch())
            .await
    }

    /// Subscribe to instance events from every replica.
    pub async fn subscribe_events(&self) -> ControllerResult<mpsc::Receiver<InstanceEvent>> {
        self.bounded("bus.subscribe", self.backends.bus.subscribe())
            .await
    }

    // ── Leadership ─────────────────────────────────────────────────

    /// Take or keep the leader lease. Returns true only when this call made
    /// the replica leader, so the caller can run a resync.
    pub async fn renew_leadership(&self) -> bool {
        let held = match self
            .bounded(
                "lease.try_acquire",
                self.backends
                    .lease
                    .try_acquire(&self.replica_id, self.policy.lease_ttl()),
            )
            .await
        {
            Ok(held) => held,
            Err(e) => {
                warn!(replica = %self.replica_id, error = %e, "lease renewal failed");
                false
            }
        };
        let was = self.leader.swap(held, Ordering::SeqCst);
        match (was, held) {
            (false, true) => info!(replica = %self.replica_id, "leadership acquired"),
            (true, false) => warn!(replica = %self.replica_id, "leadership lost"),
            _ => {}
        }
        held && !was
    }

    pub async fn step_down(&self) {
        if !self.leader.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self
            .bounded("lease.release", self.backends.lease.release(&self.replica_id))
            .await
        {
            warn!(replica = %self.replica_id, error = %e, "lease release failed");
        }
        info!(replica = %self.replica_id, "stepped down");
    }

    // ── Templates ──────────────────────────────────────────────────

    /// Store the configured templates (bumping versions whose spec changed)
    /// and mark stored templates missing from the configuration as retired.
    #[instrument(skip_all, fields(replica = %self.replica_id))]
    pub async fn sync_templates(&self, config: &FleetConfig) -> ControllerResult<()> {
        let _sync = self.template_sync.lock().await;
        let now = now();
        let mut synced = Vec::with_capacity(config.fleet_templates.len());
        for entry in &config.fleet_templates {
            let declared = FleetTemplate::from_config(entry, config, now)?;
            let stored = self
                .bounded(
                    "store.sync_template",
                    self.backends.store.sync_template(declared),
                )
                .await?;
            synced.push(stored);
        }
        let declared: HashSet<&str> = synced.iter().map(|t| t.id.as_str()).collect();
        let retired: Vec<FleetTemplate> = self
            .bounded("store.list_templates", self.backends.store.list_templates())
            .await?
            .into_iter()
            .filter(|t| !declared.contains(t.id.as_str()))
            .collect();

        let mut templates = self.templates.write().await;
        templates.clear();
        for template in synced {
            self.registry.register_template(&template);
            debug!(template = %template.id, version = template.version, "template active");
            templates.insert(
                template.id.clone(),
                TemplateSlot {
                    template,
                    retired: false,
                },
            );
        }
        for template in retired {
            info!(template = %template.id, "template removed from configuration, draining");
            self.registry.register_template(&template);
            templates.insert(
                template.id.clone(),
                TemplateSlot {
                    template,
                    retired: true,
                },
            );
        }
        Ok(())
    }

    /// Pick up template changes made through the store by any replica:
    /// new templates, newer versions, and templates deleted after
    /// retirement. Returns the ids that were not known before.
    pub async fn refresh_templates(&self) -> ControllerResult<Vec<TemplateId>> {
        let _sync = self.template_sync.lock().await;
        let stored = self
            .bounded("store.list_templates", self.backends.store.list_templates())
            .await?;
        let stored_ids: HashSet<&str> = stored.iter().map(|t| t.id.as_str()).collect();

        let mut templates = self.templates.write().await;
        let gone: Vec<TemplateId> = templates
            .keys()
            .filter(|id| !stored_ids.contains(id.as_str()))
            .cloned()
            .collect();
        for template_id in gone {
            templates.remove(&template_id);
            self.registry.forget_template(&template_id);
            self.template_locks.remove(&template_id);
            info!(template = %template_id, "template deleted from the store");
        }

        let mut added = Vec::new();
        for template in stored {
            match templates.get_mut(&template.id) {
                Some(slot) if slot.template.version >= template.version => {}
                Some(slot) => {
                    info!(
                        template = %template.id,
                        from = slot.template.version,
                        to = template.version,
                        "template updated"
                    );
                    self.registry.register_template(&template);
                    slot.template = template;
                }
                None => {
                    info!(template = %template.id, version = template.version, "template added");
                    self.registry.register_template(&template);
                    added.push(template.id.clone());
                    templates.insert(
                        template.id.clone(),
                        TemplateSlot {
                            template,
                            retired: false,
                        },
                    );
                }
            }
        }
        Ok(added)
    }

    async fn retire(&self, template_id: &str) -> ControllerResult<()> {
        let _sync = self.template_sync.lock().await;
        self.bounded(
            "store.delete_template",
            self.backends.store.delete_template(template_id),
        )
        .await?;
        self.templates.write().await.remove(template_id);
        self.registry.forget_template(template_id);
        self.template_locks.remove(template_id);
        info!(template = %template_id, "retired template deleted");
        Ok(())
    }

    fn template_lock(&self, template_id: &str) -> Arc<Mutex<()>> {
        self.template_locks
            .entry(template_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    // ── Reconcile ──────────────────────────────────────────────────

    /// Compare desired and active counts for one template and act on the
    /// difference. A no-op on replicas that do not hold the lease.
    #[instrument(skip(self), fields(replica = %self.replica_id))]
    pub async fn reconcile(&self, template_id: &str) -> ControllerResult<ScalePlan> {
        if !self.is_leader() {
            return Ok(ScalePlan::default());
        }
        let lock = self.template_lock(template_id);
        let _guard = lock.lock().await;
        FleetMetrics::incr(&self.metrics.reconciles);

        let slot = self
            .template(template_id)
            .await
            .filter(|slot| !slot.retired);
        let snapshot = self.registry.snapshot(template_id);
        let plan = match &slot {
            Some(slot) => fleet_scheduler::plan(&slot.template, &snapshot, now()),
            None => plan_removed(template_id, &snapshot),
        };
        if plan.is_noop() {
            return Ok(plan);
        }

        for instance_id in &plan.drain {
            match self
                .transition(instance_id, InstanceState::Draining, None)
                .await
            {
                Ok(Some(_)) => {
                    FleetMetrics::incr(&self.metrics.drains);
                    info!(instance = %instance_id, "instance draining");
                }
                Ok(None) => {}
                Err(e) => warn!(instance = %instance_id, error = %e, "drain failed"),
            }
        }
        if let Some(slot) = &slot {
            for _ in 0..plan.create {
                if let Err(e) = self.create_instance(&slot.template).await {
                    warn!(template = %template_id, error = %e, "instance creation failed");
                }
            }
        }
        Ok(plan)
    }

    pub async fn reconcile_all(&self) {
        for template_id in self.template_ids().await {
            if let Err(e) = self.reconcile(&template_id).await {
                warn!(template = %template_id, error = %e, "reconcile failed");
            }
        }
    }

    /// Persist a PENDING record, then ask the cluster for its pod.
    ///
    /// When pod creation exhausts its retries the instance ends TERMINATED
    /// `create-failed`; the registry change that produces wakes the change
    /// listener, which reconciles again.
    async fn create_instance(&self, template: &FleetTemplate) -> ControllerResult<InstanceId> {
        let record = ServerInstance::pending(template, &self.namespace, now());
        let backoff = self.policy.backoff();
        let rec = &record;
        self.retried("store.write_instance", &backoff, move || {
            self.bounded(
                "store.write_instance",
                self.backends.store.write_instance(rec, 0),
            )
        })
        .await?;
        self.commit(None, &record).await;

        let request = PodRequest::for_instance(template, &record, self.image_pull_secret.as_deref());
        let req = &request;
        let created = self
            .retried("cluster.create_pod", &backoff, move || {
                self.bounded("cluster.create_pod", self.backends.driver.create_pod(req))
            })
            .await;
        match created {
            Ok(pod) => {
                FleetMetrics::incr(&self.metrics.creates);
                info!(instance = %record.id, pod = %pod.name, template = %template.id, "pod created");
                self.transition(&record.id, InstanceState::Starting, None)
                    .await?;
            }
            Err(e) => {
                FleetMetrics::incr(&self.metrics.create_failures);
                warn!(instance = %record.id, error = %e, "pod creation gave up");
                self.terminate(&record.id, TerminationReason::CreateFailed)
                    .await?;
            }
        }
        Ok(record.id)
    }

    // ── Transitions ────────────────────────────────────────────────

    /// Move an instance to `next`: CAS write, registry, bus.
    ///
    /// Returns `None` when the instance is already at or past `next`.
    /// A version conflict refreshes the record from the store and retries
    /// at once; further conflicts back off like transient failures until the
    /// policy's attempts run out.
    #[instrument(skip(self), fields(replica = %self.replica_id))]
    pub async fn transition(
        &self,
        instance_id: &str,
        next: InstanceState,
        reason: Option<TerminationReason>,
    ) -> ControllerResult<Option<ServerInstance>> {
        self.transition_with(instance_id, next, reason, |_| {})
            .await
    }

    async fn transition_with<F>(
        &self,
        instance_id: &str,
        next: InstanceState,
        reason: Option<TerminationReason>,
        patch: F,
    ) -> ControllerResult<Option<ServerInstance>>
    where
        F: Fn(&mut ServerInstance),
    {
        let mut current = match self.registry.get(instance_id) {
            Some(record) => record,
            None => self.load_instance(instance_id).await?,
        };
        let backoff = self.policy.backoff();
        let mut conflicts = 0u32;
        loop {
            if !current.state.can_transition_to(next) {
                debug!(
                    instance = %instance_id,
                    current = %current.state,
                    requested = %next,
                    "transition no longer applies"
                );
                return Ok(None);
            }
            let mut record = current.transitioned(next, reason, now())?;
            patch(&mut record);

            let (rec, expected) = (&record, current.version);
            let written = self
                .retried("store.write_instance", &backoff, move || {
                    self.bounded(
                        "store.write_instance",
                        self.backends.store.write_instance(rec, expected),
                    )
                })
                .await;
            match written {
                Ok(()) => {
                    debug!(
                        instance = %instance_id,
                        from = %current.state,
                        to = %next,
                        version = record.version,
                        "transition committed"
                    );
                    self.commit(Some(&current), &record).await;
                    return Ok(Some(record));
                }
                Err(e) if e.is_conflict() => {
                    FleetMetrics::incr(&self.metrics.conflicts);
                    conflicts += 1;
                    if conflicts == 1 {
                        debug!(instance = %instance_id, error = %e, "write conflict, refreshing");
                    } else {
                        let retry = conflicts - 2;
                        if retry + 1 >= backoff.max_attempts {
                            warn!(instance = %instance_id, conflicts, "write keeps conflicting, giving up");
                            return Err(ControllerError::RepeatedConflict(instance_id.to_string()));
                        }
                        FleetMetrics::incr(&self.metrics.transient_retries);
                        let delay = backoff.delay(retry);
                        debug!(
                            instance = %instance_id,
                            conflicts,
                            delay_ms = delay.as_millis() as u64,
                            "write conflicted again, backing off"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    current = self.load_instance(instance_id).await?;
                    self.registry.apply_record(&current);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Move an instance to TERMINATED and remove its pod if it may still exist.
    /// Returns whether this call terminated it.
    pub async fn terminate(
        &self,
        instance_id: &str,
        reason: TerminationReason,
    ) -> ControllerResult<bool> {
        let Some(record) = self
            .transition(instance_id, InstanceState::Terminated, Some(reason))
            .await?
        else {
            return Ok(false);
        };
        FleetMetrics::incr(&self.metrics.terminations);
        info!(instance = %instance_id, %reason, "instance terminated");
        if !pod_is_gone(reason) {
            self.delete_pod(&PodRef::of(&record)).await;
        }
        Ok(true)
    }

    /// Apply a durable write locally and fan it out.
    async fn commit(&self, prev: Option<&ServerInstance>, record: &ServerInstance) {
        let event = InstanceEvent::for_write(prev, record, &self.replica_id);
        self.registry.apply_event(&event);

        let backoff = self.policy.backoff();
        let ev = &event;
        if let Err(e) = self
            .retried("bus.publish", &backoff, move || {
                self.bounded("bus.publish", self.backends.bus.publish(ev))
            })
            .await
        {
            FleetMetrics::incr(&self.metrics.publish_failures);
            warn!(instance = %record.id, version = record.version, error = %e, "event publish failed");
        }
    }

    async fn load_instance(&self, instance_id: &str) -> ControllerResult<ServerInstance> {
        self.bounded(
            "store.get_instance",
            self.backends.store.get_instance(instance_id),
        )
        .await?
        .ok_or_else(|| ControllerError::InstanceNotFound(instance_id.to_string()))
    }

    /// Registry record, falling back to the store (and caching what it finds).
    async fn known_instance(&self, instance_id: &str) -> ControllerResult<Option<ServerInstance>> {
        if let Some(record) = self.registry.get(instance_id) {
            return Ok(Some(record));
        }
        let stored = self
            .bounded(
                "store.get_instance",
                self.backends.store.get_instance(instance_id),
            )
            .await?;
        if let Some(record) = &stored {
            self.registry.apply_record(record);
        }
        Ok(stored)
    }

    async fn delete_pod(&self, pod: &PodRef) -> bool {
        let backoff = self.policy.backoff();
        match self
            .retried("cluster.delete_pod", &backoff, move || {
                self.bounded("cluster.delete_pod", self.backends.driver.delete_pod(pod))
            })
            .await
        {
            Ok(()) => {
                FleetMetrics::incr(&self.metrics.pod_deletes);
                debug!(pod = %pod.name, "pod deleted");
                true
            }
            Err(e) => {
                warn!(pod = %pod.name, error = %e, "pod delete failed");
                false
            }
        }
    }

    async fn remove_orphan(&self, pod: &PodObservation) -> bool {
        if !self.is_leader() || pod.terminating {
            return false;
        }
        let deleted = self.delete_pod(&pod.pod_ref()).await;
        if deleted {
            FleetMetrics::incr(&self.metrics.orphans_deleted);
            info!(pod = %pod.name, instance = ?pod.instance_id, "orphan pod deleted");
        }
        deleted
    }

    // ── Periodic work ──────────────────────────────────────────────

    /// Expire timed-out instances, then reconcile.
    ///
    /// Returns false once the template is unknown or a retired template has
    /// no live instances left (its record is deleted at that point).
    #[instrument(skip(self), fields(replica = %self.replica_id))]
    pub async fn tick(&self, template_id: &str) -> ControllerResult<bool> {
        let Some(slot) = self.template(template_id).await else {
            return Ok(false);
        };
        if !self.is_leader() {
            return Ok(true);
        }

        let snapshot = self.registry.snapshot(template_id);
        for expiry in sweep(&slot.template, &snapshot, now(), self.policy.drain_timeout()) {
            let reason = match expiry.reason {
                TerminationReason::Drained | TerminationReason::DrainTimeout if slot.retired => {
                    TerminationReason::TemplateRemoved
                }
                other => other,
            };
            if let Err(e) = self.terminate(&expiry.instance_id, reason).await {
                warn!(instance = %expiry.instance_id, %reason, error = %e, "expiry failed");
            }
        }

        self.reconcile(template_id).await?;

        if slot.retired && self.registry.live_count(template_id) == 0 {
            self.retire(template_id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Drop long-terminated records from the registry.
    pub fn prune(&self) -> usize {
        self.registry
            .prune_terminated(self.policy.terminated_retention(), now())
    }

    /// Load live instances from the store into the registry, and re-read
    /// any instance the registry still considers live but the store does not.
    pub async fn refresh_from_store(&self) -> ControllerResult<usize> {
        let live = self
            .bounded(
                "store.list_live_instances",
                self.backends.store.list_live_instances(),
            )
            .await?;
        let mut applied = live
            .iter()
            .filter(|record| self.registry.apply_record(record))
            .count();

        let live_ids: HashSet<&str> = live.iter().map(|r| r.id.as_str()).collect();
        for stale in self.registry.live_instances() {
            if live_ids.contains(stale.id.as_str()) {
                continue;
            }
            if let Some(record) = self
                .bounded(
                    "store.get_instance",
                    self.backends.store.get_instance(&stale.id),
                )
                .await?
                && self.registry.apply_record(&record)
            {
                applied += 1;
            }
        }
        debug!(live = live.len(), applied, "registry refreshed from store");
        Ok(applied)
    }

    // ── Cluster events ─────────────────────────────────────────────

    /// Fold one pod lifecycle event into instance state.
    #[instrument(skip_all, fields(pod = %event.pod.name, kind = ?event.kind))]
    pub async fn handle_pod_event(&self, event: PodLifecycleEvent) -> ControllerResult<()> {
        let pod = &event.pod;
        let record = match pod.instance_id.as_deref() {
            Some(id) => self.known_instance(id).await?,
            None => None,
        };
        let Some(record) = record else {
            if event.kind != PodEventKind::Deleted {
                self.remove_orphan(pod).await;
            }
            return Ok(());
        };

        if let Some(heartbeat) = pod.heartbeat {
            self.registry
                .observe(&record.id, pod.load.unwrap_or(record.load), Some(heartbeat));
        }
        if !self.is_leader() {
            return Ok(());
        }

        if record.state == InstanceState::Terminated {
            if event.kind != PodEventKind::Deleted && !pod.terminating {
                self.delete_pod(&pod.pod_ref()).await;
            }
            return Ok(());
        }

        match lifecycle_step(event.kind, pod, record.state) {
            Some(Step::Starting) => {
                self.transition(&record.id, InstanceState::Starting, None)
                    .await?;
            }
            Some(Step::Ready(address)) => {
                let done = self
                    .transition_with(&record.id, InstanceState::Ready, None, |r| {
                        r.address = Some(address.clone());
                    })
                    .await?;
                if done.is_some() {
                    info!(instance = %record.id, %address, "instance ready");
                }
            }
            Some(Step::Terminate(reason)) => {
                self.terminate(&record.id, reason).await?;
            }
            None => {}
        }
        Ok(())
    }

    /// List pods and compare them with the store: delete orphans, fold in
    /// each pod's current status, and terminate instances whose pod vanished.
    ///
    /// Followers only fold in observations. An instance counts as missing only
    /// if it was already STARTING or later before the listing began, so
    /// instances created while the list is in flight are left alone.
    #[instrument(skip(self), fields(replica = %self.replica_id))]
    pub async fn resync(&self) -> ControllerResult<ResyncReport> {
        FleetMetrics::incr(&self.metrics.resyncs);
        self.refresh_from_store().await?;
        let mut report = ResyncReport::default();

        let expected: Vec<ServerInstance> = self
            .registry
            .live_instances()
            .into_iter()
            .filter(|inst| inst.state >= InstanceState::Starting)
            .collect();
        let pods = self
            .bounded("cluster.list_pods", self.backends.driver.list_pods())
            .await?;
        report.pods = pods.len();
        let mut seen = HashSet::with_capacity(pods.len());
        for pod in pods {
            seen.insert(pod.name.clone());
            let known = match pod.instance_id.as_deref() {
                Some(id) => self.known_instance(id).await?,
                None => None,
            };
            if known.is_none() {
                if self.remove_orphan(&pod).await {
                    report.orphans_deleted += 1;
                }
                continue;
            }
            let name = pod.name.clone();
            let event = PodLifecycleEvent {
                kind: PodEventKind::Modified,
                pod,
            };
            if let Err(e) = self.handle_pod_event(event).await {
                warn!(pod = %name, error = %e, "resync of pod failed");
            }
        }

        if self.is_leader() {
            for inst in expected {
                if seen.contains(&inst.pod_name) {
                    continue;
                }
                match self.terminate(&inst.id, TerminationReason::PodMissing).await {
                    Ok(true) => report.missing += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(instance = %inst.id, error = %e, "pod-missing termination failed")
                    }
                }
            }
        }

        info!(
            pods = report.pods,
            orphans = report.orphans_deleted,
            missing = report.missing,
            "resync complete"
        );
        Ok(report)
    }

    // ── Bus events ─────────────────────────────────────────────────

    /// Apply an event published by another replica. Own events were
    /// applied when written and are skipped.
    pub async fn handle_bus_event(&self, event: InstanceEvent) -> ControllerResult<bool> {
        if event.origin_replica_id == self.replica_id {
            return Ok(false);
        }
        let applied = if event.instance.is_none() && self.registry.get(&event.instance_id).is_none()
        {
            match self
                .bounded(
                    "store.get_instance",
                    self.backends.store.get_instance(&event.instance_id),
                )
                .await?
            {
                Some(record) => self.registry.apply_record(&record),
                None => false,
            }
        } else {
            self.registry.apply_event(&event)
        };

        if applied {
            FleetMetrics::incr(&self.metrics.events_applied);
            debug!(
                instance = %event.instance_id,
                state = %event.new_state,
                version = event.version,
                origin = %event.origin_replica_id,
                "remote event applied"
            );
        } else {
            FleetMetrics::incr(&self.metrics.events_discarded);
        }
        Ok(applied)
    }
}

/// Reasons whose pod is known to be gone, or never existed. A pod missing
/// from a listing may still show up, so it is deleted anyway.
fn pod_is_gone(reason: TerminationReason) -> bool {
    matches!(
        reason,
        TerminationReason::CreateFailed | TerminationReason::PodDeleted
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    Starting,
    Ready(String),
    Terminate(TerminationReason),
}

/// What a pod observation means for an instance currently in `state`.
fn lifecycle_step(kind: PodEventKind, pod: &PodObservation, state: InstanceState) -> Option<Step> {
    if kind == PodEventKind::Deleted {
        return Some(Step::Terminate(TerminationReason::PodDeleted));
    }
    match pod.phase {
        PodPhase::Failed => Some(Step::Terminate(TerminationReason::PodFailed)),
        PodPhase::Succeeded => Some(Step::Terminate(TerminationReason::PodExited)),
        _ if pod.terminating => None,
        PodPhase::Running if pod.ready && state < InstanceState::Ready => {
            pod.address.clone().map(Step::Ready)
        }
        PodPhase::Running if state == InstanceState::Pending => Some(Step::Starting),
        _ => None,
    }
}
