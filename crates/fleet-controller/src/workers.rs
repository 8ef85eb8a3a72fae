//! Background workers for one replica.
//!
//! Each worker loops on `tokio::select!` between its own work and a shared
//! `watch` shutdown signal:
//! - lease: renew the leader lease; resync and reconcile on acquisition
//! - watch: consume pod lifecycle events; resubscribe and resync on close
//! - bus: apply instance events from other replicas; resubscribe on close
//! - changes: reconcile a template when one of its instances leaves the
//!   active set
//! - templates: refresh templates from the store and keep one tick loop
//!   running per template
//! - tick: expire and reconcile one template on a fixed interval
//! - metrics: log counters and prune old TERMINATED records

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use fleet_state::TemplateId;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::controller::FleetController;

/// Handles to every running worker.
pub struct Workers {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<(String, JoinHandle<()>)>,
}

impl Workers {
    /// Spawn every worker for `controller`. Templates should already be
    /// synced; later additions are picked up from the store.
    pub async fn start(controller: Arc<FleetController>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::new();

        let c = controller.clone();
        let rx = shutdown_rx.clone();
        handles.push(("lease".to_string(), tokio::spawn(run_lease_loop(c, rx))));

        let c = controller.clone();
        let rx = shutdown_rx.clone();
        handles.push(("watch".to_string(), tokio::spawn(run_watch_loop(c, rx))));

        let c = controller.clone();
        let rx = shutdown_rx.clone();
        handles.push(("bus".to_string(), tokio::spawn(run_bus_loop(c, rx))));

        let c = controller.clone();
        let rx = shutdown_rx.clone();
        handles.push(("changes".to_string(), tokio::spawn(run_change_listener(c, rx))));

        let c = controller.clone();
        let rx = shutdown_rx.clone();
        handles.push(("metrics".to_string(), tokio::spawn(run_metrics_loop(c, rx))));

        let c = controller.clone();
        let rx = shutdown_rx.clone();
        handles.push(("templates".to_string(), tokio::spawn(run_template_loop(c, rx))));

        info!(
            replica = %controller.replica_id(),
            workers = handles.len(),
            "workers started"
        );
        Self {
            shutdown_tx,
            handles,
        }
    }

    /// Signal every worker and wait for them to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for (name, handle) in self.handles {
            if let Err(e) = handle.await {
                warn!(worker = %name, error = %e, "worker ended abnormally");
            } else {
                debug!(worker = %name, "worker stopped");
            }
        }
        info!("all workers stopped");
    }
}

/// Sleep for `delay` unless shutdown comes first. Returns false on shutdown.
async fn pause(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = shutdown.changed() => false,
    }
}

async fn run_lease_loop(controller: Arc<FleetController>, mut shutdown: watch::Receiver<bool>) {
    let interval = (controller.policy().lease_ttl() / 3).max(Duration::from_millis(100));
    loop {
        if controller.renew_leadership().await {
            if let Err(e) = controller.resync().await {
                warn!(error = %e, "resync after acquiring leadership failed");
            }
            controller.reconcile_all().await;
        }
        if !pause(interval, &mut shutdown).await {
            controller.step_down().await;
            break;
        }
    }
    debug!("lease loop shutting down");
}

async fn run_watch_loop(controller: Arc<FleetController>, mut shutdown: watch::Receiver<bool>) {
    let backoff = controller.policy().backoff();
    let mut attempt = 0;
    loop {
        let mut events = match controller.watch_pods().await {
            Ok(events) => events,
            Err(e) => {
                let delay = backoff.delay(attempt);
                attempt = attempt.saturating_add(1);
                warn!(error = %e, delay_ms = delay.as_millis() as u64, "pod watch failed");
                if !pause(delay, &mut shutdown).await {
                    break;
                }
                continue;
            }
        };
        if let Err(e) = controller.resync().await {
            warn!(error = %e, "resync after watch (re)start failed");
        }

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        attempt = 0;
                        if let Err(e) = controller.handle_pod_event(event).await {
                            warn!(error = %e, "pod event handling failed");
                        }
                    }
                    None => break,
                },
                _ = shutdown.changed() => {
                    debug!("watch loop shutting down");
                    return;
                }
            }
        }

        let delay = backoff.delay(attempt);
        attempt = attempt.saturating_add(1);
        warn!(delay_ms = delay.as_millis() as u64, "pod watch closed, resubscribing");
        if !pause(delay, &mut shutdown).await {
            break;
        }
    }
    debug!("watch loop shutting down");
}

async fn run_bus_loop(controller: Arc<FleetController>, mut shutdown: watch::Receiver<bool>) {
    let backoff = controller.policy().backoff();
    let mut attempt = 0;
    loop {
        let mut events = match controller.subscribe_events().await {
            Ok(events) => events,
            Err(e) => {
                let delay = backoff.delay(attempt);
                attempt = attempt.saturating_add(1);
                warn!(error = %e, delay_ms = delay.as_millis() as u64, "bus subscribe failed");
                if !pause(delay, &mut shutdown).await {
                    break;
                }
                continue;
            }
        };
        // Anything published while unsubscribed is in the store.
        if let Err(e) = controller.refresh_from_store().await {
            warn!(error = %e, "store refresh after subscribe failed");
        }

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        attempt = 0;
                        if let Err(e) = controller.handle_bus_event(event).await {
                            warn!(error = %e, "bus event handling failed");
                        }
                    }
                    None => break,
                },
                _ = shutdown.changed() => {
                    debug!("bus loop shutting down");
                    return;
                }
            }
        }

        let delay = backoff.delay(attempt);
        attempt = attempt.saturating_add(1);
        warn!(delay_ms = delay.as_millis() as u64, "bus subscription closed, resubscribing");
        if !pause(delay, &mut shutdown).await {
            break;
        }
    }
    debug!("bus loop shutting down");
}

async fn run_change_listener(
    controller: Arc<FleetController>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut changes = controller.registry().subscribe_changes();
    loop {
        tokio::select! {
            change = changes.recv() => match change {
                Ok(change) if !change.state.is_active() => {
                    if let Err(e) = controller.reconcile(&change.template_id).await {
                        warn!(template = %change.template_id, error = %e, "on-demand reconcile failed");
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!(missed, "change listener lagged, reconciling everything");
                    controller.reconcile_all().await;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown.changed() => break,
        }
    }
    debug!("change listener shutting down");
}

async fn run_template_loop(
    controller: Arc<FleetController>,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval = controller.policy().reconcile_interval();
    let mut ticks: BTreeMap<TemplateId, JoinHandle<()>> = BTreeMap::new();
    loop {
        ticks.retain(|_, handle| !handle.is_finished());
        for template_id in controller.template_ids().await {
            if ticks.contains_key(&template_id) {
                continue;
            }
            let handle = tokio::spawn(run_tick_loop(
                controller.clone(),
                template_id.clone(),
                shutdown.clone(),
            ));
            ticks.insert(template_id, handle);
        }
        if !pause(interval, &mut shutdown).await {
            break;
        }
        if let Err(e) = controller.refresh_templates().await {
            warn!(error = %e, "template refresh failed");
        }
    }

    for (template_id, handle) in ticks {
        if let Err(e) = handle.await {
            warn!(template = %template_id, error = %e, "tick loop ended abnormally");
        }
    }
    debug!("template loop shutting down");
}

async fn run_tick_loop(
    controller: Arc<FleetController>,
    template_id: String,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval = controller.policy().reconcile_interval();
    debug!(template = %template_id, "tick loop starting");
    while pause(interval, &mut shutdown).await {
        match controller.tick(&template_id).await {
            Ok(true) => {}
            Ok(false) => {
                info!(template = %template_id, "template no longer managed, tick loop ending");
                return;
            }
            Err(e) => warn!(template = %template_id, error = %e, "tick failed"),
        }
    }
    debug!(template = %template_id, "tick loop shutting down");
}

async fn run_metrics_loop(controller: Arc<FleetController>, mut shutdown: watch::Receiver<bool>) {
    let interval = controller.policy().metrics_log_interval();
    while pause(interval, &mut shutdown).await {
        controller.metrics().snapshot().log();
        for template_id in controller.template_ids().await {
            let routable = controller.registry().routing_entries(&template_id).len();
            debug!(
                template = %template_id,
                live = controller.registry().live_count(&template_id),
                routable,
                "template status"
            );
        }
        controller.prune();
    }
    debug!("metrics loop shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn pause_returns_false_on_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { pause(Duration::from_secs(3600), &mut rx).await });
        tx.send(true).unwrap();
        assert!(!waiter.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn pause_elapses() {
        let (_tx, mut rx) = watch::channel(false);
        assert!(pause(Duration::from_millis(10), &mut rx).await);
    }
}
