//! Time-based expiry: which instances the periodic tick must terminate.

use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_state::{FleetTemplate, InstanceId, InstanceState, ServerInstance, TerminationReason};

/// An instance to terminate and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expiry {
    pub instance_id: InstanceId,
    pub reason: TerminationReason,
}

fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or_default()
}

/// Collect every instance whose time is up.
///
/// - PENDING/STARTING older than the readiness timeout: `readiness-timeout`
/// - READY/DRAINING without a heartbeat within the heartbeat timeout:
///   `heartbeat-timeout` (the READY transition counts as the first beat)
/// - DRAINING with no load left: `drained`
/// - DRAINING for longer than `drain_timeout`: `drain-timeout`
pub fn sweep(
    template: &FleetTemplate,
    snapshot: &[ServerInstance],
    now: DateTime<Utc>,
    drain_timeout: Duration,
) -> Vec<Expiry> {
    let mut out = Vec::new();
    for inst in snapshot {
        let reason = match inst.state {
            InstanceState::Pending | InstanceState::Starting => {
                (elapsed(inst.created_at, now) > template.readiness_timeout())
                    .then_some(TerminationReason::ReadinessTimeout)
            }
            InstanceState::Ready | InstanceState::Draining => {
                let last_beat = inst
                    .last_heartbeat
                    .map_or(inst.updated_at, |hb| hb.max(inst.updated_at));
                if elapsed(last_beat, now) > template.heartbeat_timeout() {
                    Some(TerminationReason::HeartbeatTimeout)
                } else if inst.state == InstanceState::Draining && inst.load == 0 {
                    Some(TerminationReason::Drained)
                } else if inst.state == InstanceState::Draining
                    && elapsed(inst.updated_at, now) > drain_timeout
                {
                    Some(TerminationReason::DrainTimeout)
                } else {
                    None
                }
            }
            InstanceState::Terminated => None,
        };
        if let Some(reason) = reason {
            out.push(Expiry {
                instance_id: inst.id.clone(),
                reason,
            });
        }
    }
    out
}
