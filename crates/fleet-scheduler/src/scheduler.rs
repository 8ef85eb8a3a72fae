//! Sizing decisions: how many instances to create and which to drain.
//!
//! [`plan`] is a pure function of the template and a registry snapshot.
//! The controller carries out whatever it returns.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use fleet_state::{FleetTemplate, InstanceId, InstanceState, ServerInstance};
use tracing::debug;

/// What one reconcile pass should do for a template.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScalePlan {
    /// Instances to create.
    pub create: u32,
    /// Instances to move to DRAINING, in drain order.
    pub drain: Vec<InstanceId>,
    /// Target number of active instances.
    pub desired: u32,
    /// Active instances (PENDING, STARTING, READY) seen.
    pub active: u32,
}

impl ScalePlan {
    pub fn is_noop(&self) -> bool {
        self.create == 0 && self.drain.is_empty()
    }
}

/// Replacement pacing for instances running an older template version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollingStrategy {
    /// Instances allowed above the desired count.
    pub max_surge: u32,
    /// Serving instances allowed below the desired count.
    pub max_unavailable: u32,
}

impl Default for RollingStrategy {
    fn default() -> Self {
        Self {
            max_surge: 1,
            max_unavailable: 0,
        }
    }
}

impl RollingStrategy {
    /// Returns `(new_to_start, old_to_drain)`.
    pub fn calculate_actions(
        &self,
        desired: u32,
        current_ready: u32,
        current_pending: u32,
        old_ready: u32,
        old_total: u32,
    ) -> (u32, u32) {
        let total = current_ready + current_pending + old_total;

        let max_total = desired + self.max_surge;
        let can_start = max_total.saturating_sub(total);
        let need_to_start = desired.saturating_sub(current_ready + current_pending);
        let new_to_start = can_start.min(need_to_start);

        let min_available = desired.saturating_sub(self.max_unavailable);
        let available = current_ready + old_ready;
        let can_drain = available.saturating_sub(min_available);
        // Old instances that are not serving yet cost nothing to drain.
        let old_unready = old_total - old_ready;
        let old_to_drain = (can_drain + old_unready).min(old_total);

        (new_to_start, old_to_drain)
    }
}

/// Target active count for a template.
///
/// Without `max_load`: keep the current count within `[min_ready, max_instances]`.
/// With `max_load`: enough instances to carry the current load, plus
/// `min_ready` of headroom, within the same bounds.
pub fn desired_count(template: &FleetTemplate, snapshot: &[ServerInstance]) -> u32 {
    let active = snapshot.iter().filter(|i| i.is_active()).count() as u32;
    let min = template.min_ready;
    let max = template.max_instances.max(min);
    let wanted = match template.max_load {
        Some(max_load) if max_load > 0 => {
            let load: u64 = snapshot
                .iter()
                .filter(|i| i.is_active())
                .map(|i| u64::from(i.load))
                .sum();
            let needed = load.div_ceil(u64::from(max_load));
            u32::try_from(needed).unwrap_or(u32::MAX).saturating_add(min)
        }
        _ => active,
    };
    wanted.clamp(min, max)
}

/// Drain preference: lowest load, then oldest, then id.
pub fn drain_order(a: &ServerInstance, b: &ServerInstance) -> Ordering {
    a.load
        .cmp(&b.load)
        .then(a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Outdated instances that are not serving yet go before [`drain_order`].
fn rollout_order(a: &ServerInstance, b: &ServerInstance) -> Ordering {
    let serving = |i: &ServerInstance| i.state == InstanceState::Ready;
    serving(a).cmp(&serving(b)).then_with(|| drain_order(a, b))
}

/// Decide creations and drains for one template.
pub fn plan(template: &FleetTemplate, snapshot: &[ServerInstance], _now: DateTime<Utc>) -> ScalePlan {
    plan_with(template, snapshot, RollingStrategy::default())
}

pub fn plan_with(
    template: &FleetTemplate,
    snapshot: &[ServerInstance],
    strategy: RollingStrategy,
) -> ScalePlan {
    let (mut old, mut current): (Vec<&ServerInstance>, Vec<&ServerInstance>) = snapshot
        .iter()
        .filter(|i| i.is_active())
        .partition(|i| i.is_outdated(template));
    old.sort_by(|a, b| rollout_order(a, b));
    current.sort_by(|a, b| drain_order(a, b));

    let active = (old.len() + current.len()) as u32;
    let desired = match template.max_load {
        // Count-based sizing must not count the surge instance as demand.
        None if !old.is_empty() => {
            let surge = (current.len() as u32).min(strategy.max_surge);
            (active - surge).clamp(template.min_ready, template.max_instances.max(template.min_ready))
        }
        _ => desired_count(template, snapshot),
    };
    let mut out = ScalePlan {
        desired,
        active,
        ..ScalePlan::default()
    };

    if old.is_empty() {
        match active.cmp(&desired) {
            Ordering::Less => out.create = desired - active,
            Ordering::Greater => {
                let excess = (active - desired) as usize;
                out.drain = current.iter().take(excess).map(|i| i.id.clone()).collect();
            }
            Ordering::Equal => {}
        }
    } else {
        let ready = |v: &[&ServerInstance]| {
            v.iter().filter(|i| i.state == InstanceState::Ready).count() as u32
        };
        let current_ready = ready(&current);
        let current_pending = current.len() as u32 - current_ready;
        let old_ready = ready(&old);
        let (start, mut drain_old) = strategy.calculate_actions(
            desired,
            current_ready,
            current_pending,
            old_ready,
            old.len() as u32,
        );

        // Shrinking while rolling: anything beyond desired + surge goes.
        let budget = desired + strategy.max_surge;
        let excess = active.saturating_sub(budget);
        drain_old = drain_old.max(excess.min(old.len() as u32));
        let drain_current = excess.saturating_sub(drain_old) as usize;

        out.create = start;
        out.drain = old
            .iter()
            .take(drain_old as usize)
            .chain(current.iter().take(drain_current))
            .map(|i| i.id.clone())
            .collect();
    }

    if !out.is_noop() {
        debug!(
            template = %template.id,
            desired,
            active,
            outdated = old.len(),
            create = out.create,
            drain = out.drain.len(),
            "scale plan"
        );
    }
    out
}

/// A template that left the configuration: drain everything still active.
pub fn plan_removed(template_id: &str, snapshot: &[ServerInstance]) -> ScalePlan {
    let mut active: Vec<&ServerInstance> = snapshot
        .iter()
        .filter(|i| i.template_id == template_id && i.is_active())
        .collect();
    active.sort_by(|a, b| drain_order(a, b));
    ScalePlan {
        create: 0,
        drain: active.iter().map(|i| i.id.clone()).collect(),
        desired: 0,
        active: active.len() as u32,
    }
}
