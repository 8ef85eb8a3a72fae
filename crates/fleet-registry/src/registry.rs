//! Instance registry: this replica's view of every instance.
//!
//! Mutation goes through [`InstanceRegistry::apply_event`], which enforces
//! the version rules:
//!
//! - an event older than the current record is discarded, apart from its
//!   observation fields (heartbeat, load), which merge monotonically;
//! - an event at the current version with the same state only merges
//!   observation fields;
//! - an event at the current version with a different state is discarded;
//! - a newer event replaces the record, keeping a later local heartbeat,
//!   unless the record is TERMINATED or the event would move the state
//!   backwards;
//! - events for pruned instances hit a tombstone and are discarded.
//!
//! Entries are sharded by instance id, so events for one instance serialize
//! while different instances proceed in parallel. No lock is held once a
//! method returns.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use fleet_state::{
    FleetTemplate, InstanceEvent, InstanceId, InstanceState, RoutingEntry, ServerInstance,
    TemplateId,
};
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Origin id used for events synthesized from store reads.
pub const STORE_ORIGIN: &str = "store";

/// Emitted whenever an instance enters a new state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryChange {
    pub template_id: TemplateId,
    pub instance_id: InstanceId,
    pub state: InstanceState,
}

#[derive(Debug, Clone, Copy)]
struct Tombstone {
    version: u64,
    pruned_at: DateTime<Utc>,
}

pub struct InstanceRegistry {
    instances: DashMap<InstanceId, ServerInstance>,
    tombstones: DashMap<InstanceId, Tombstone>,
    /// Per-template capacity, for the routing projection.
    capacities: DashMap<TemplateId, Option<u32>>,
    changes: broadcast::Sender<RegistryChange>,
}

impl Default for InstanceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceRegistry {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(1024);
        Self {
            instances: DashMap::new(),
            tombstones: DashMap::new(),
            capacities: DashMap::new(),
            changes,
        }
    }

    // ── Mutation ───────────────────────────────────────────────────

    /// Apply one event. Returns whether observable state changed.
    pub fn apply_event(&self, event: &InstanceEvent) -> bool {
        if let Some(tomb) = self.tombstones.get(&event.instance_id) {
            trace!(
                instance = %event.instance_id,
                version = event.version,
                tombstone = tomb.version,
                "event for pruned instance discarded"
            );
            return false;
        }

        let mut entered: Option<InstanceState> = None;
        let changed = match self.instances.entry(event.instance_id.clone()) {
            Entry::Vacant(slot) => match &event.instance {
                Some(snapshot) => {
                    let mut record = snapshot.clone();
                    record.state = event.new_state;
                    record.version = event.version;
                    slot.insert(record);
                    entered = Some(event.new_state);
                    true
                }
                // Nothing to materialize from; the store refresh fills it in.
                None => false,
            },
            Entry::Occupied(mut slot) => {
                let current = slot.get_mut();
                if event.version < current.version {
                    // The record is stale; its heartbeat may still be news.
                    match &event.instance {
                        Some(s) if current.state != InstanceState::Terminated => {
                            current.merge_observation(s.load, s.last_heartbeat)
                        }
                        _ => false,
                    }
                } else if event.version == current.version {
                    if event.new_state != current.state {
                        debug!(
                            instance = %event.instance_id,
                            version = event.version,
                            current = %current.state,
                            incoming = %event.new_state,
                            "conflicting same-version event discarded"
                        );
                        false
                    } else {
                        match &event.instance {
                            Some(s) => current.merge_observation(s.load, s.last_heartbeat),
                            None => false,
                        }
                    }
                } else if current.state == InstanceState::Terminated
                    || event.new_state < current.state
                {
                    debug!(
                        instance = %event.instance_id,
                        current = %current.state,
                        incoming = %event.new_state,
                        "backward or post-terminal event discarded"
                    );
                    false
                } else {
                    let previous = current.state;
                    match &event.instance {
                        Some(snapshot) => {
                            let (load, heartbeat) = (current.load, current.last_heartbeat);
                            *current = snapshot.clone();
                            // Terminal records are frozen as written; otherwise
                            // a later local observation outlives the write.
                            if event.new_state != InstanceState::Terminated {
                                current.merge_observation(load, heartbeat);
                            }
                        }
                        None => current.updated_at = event.timestamp,
                    }
                    current.state = event.new_state;
                    current.version = event.version;
                    if previous != event.new_state {
                        entered = Some(event.new_state);
                    }
                    true
                }
            }
        };

        if let Some(state) = entered {
            // No receivers is fine.
            let _ = self.changes.send(RegistryChange {
                template_id: event.template_id.clone(),
                instance_id: event.instance_id.clone(),
                state,
            });
        }
        changed
    }

    /// Apply a record read from the store.
    pub fn apply_record(&self, record: &ServerInstance) -> bool {
        let current = self.get(&record.id);
        let event = InstanceEvent::for_write(current.as_ref(), record, STORE_ORIGIN);
        self.apply_event(&event)
    }

    /// Merge a fresh heartbeat/load observation. Returns whether it changed anything.
    pub fn observe(&self, instance_id: &str, load: u32, heartbeat: Option<DateTime<Utc>>) -> bool {
        match self.instances.get_mut(instance_id) {
            Some(mut inst) if inst.state != InstanceState::Terminated => {
                inst.merge_observation(load, heartbeat)
            }
            _ => false,
        }
    }

    /// Drop TERMINATED records older than `retention`, leaving tombstones.
    /// Tombstones older than `retention` are dropped too. Returns records pruned.
    pub fn prune_terminated(&self, retention: Duration, now: DateTime<Utc>) -> usize {
        let retention =
            chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::days(3650));
        let cutoff = now - retention;

        let expired: Vec<(InstanceId, u64)> = self
            .instances
            .iter()
            .filter(|i| i.state == InstanceState::Terminated && i.updated_at <= cutoff)
            .map(|i| (i.id.clone(), i.version))
            .collect();

        let mut pruned = 0;
        for (id, version) in expired {
            let removed = self
                .instances
                .remove_if(&id, |_, i| i.state == InstanceState::Terminated);
            if removed.is_some() {
                self.tombstones.insert(id, Tombstone { version, pruned_at: now });
                pruned += 1;
            }
        }
        self.tombstones.retain(|_, t| t.pruned_at > cutoff);
        if pruned > 0 {
            debug!(pruned, "terminated instances pruned");
        }
        pruned
    }

    pub fn register_template(&self, template: &FleetTemplate) {
        self.capacities.insert(template.id.clone(), template.max_load);
    }

    pub fn forget_template(&self, template_id: &str) {
        self.capacities.remove(template_id);
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn get(&self, instance_id: &str) -> Option<ServerInstance> {
        self.instances.get(instance_id).map(|i| i.clone())
    }

    /// Copy of every instance of a template, oldest first.
    pub fn snapshot(&self, template_id: &str) -> Vec<ServerInstance> {
        let mut out: Vec<ServerInstance> = self
            .instances
            .iter()
            .filter(|i| i.template_id == template_id)
            .map(|i| i.clone())
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        out
    }

    /// Copy of every non-terminated instance.
    pub fn live_instances(&self) -> Vec<ServerInstance> {
        self.instances
            .iter()
            .filter(|i| i.is_live())
            .map(|i| i.clone())
            .collect()
    }

    /// Templates that are registered or still have instances.
    pub fn template_ids(&self) -> Vec<TemplateId> {
        let mut ids: Vec<TemplateId> = self.capacities.iter().map(|e| e.key().clone()).collect();
        for inst in self.instances.iter() {
            if !ids.contains(&inst.template_id) {
                ids.push(inst.template_id.clone());
            }
        }
        ids.sort();
        ids
    }

    pub fn live_count(&self, template_id: &str) -> usize {
        self.instances
            .iter()
            .filter(|i| i.template_id == template_id && i.is_live())
            .count()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn is_tombstoned(&self, instance_id: &str) -> bool {
        self.tombstones.contains_key(instance_id)
    }

    /// Notifications of instances entering a new state.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<RegistryChange> {
        self.changes.subscribe()
    }

    // ── Routing ────────────────────────────────────────────────────

    /// READY instances of a template with an address, as routing entries.
    pub fn routing_entries(&self, template_id: &str) -> Vec<RoutingEntry> {
        let max_load = self.capacities.get(template_id).and_then(|c| *c);
        let mut out: Vec<RoutingEntry> = self
            .instances
            .iter()
            .filter(|i| i.template_id == template_id && i.state == InstanceState::Ready)
            .filter_map(|i| {
                i.address.as_ref().map(|address| RoutingEntry {
                    instance_id: i.id.clone(),
                    template_id: i.template_id.clone(),
                    address: address.clone(),
                    load: i.load,
                    max_load,
                })
            })
            .collect();
        out.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        out
    }

    /// Pick where the next player goes: the most loaded READY instance that
    /// still has room, so that players pack onto few servers.
    pub fn select_instance(&self, template_id: &str) -> Option<RoutingEntry> {
        self.routing_entries(template_id)
            .into_iter()
            .filter(RoutingEntry::has_capacity)
            .max_by(|a, b| a.load.cmp(&b.load).then_with(|| b.instance_id.cmp(&a.instance_id)))
    }
}
