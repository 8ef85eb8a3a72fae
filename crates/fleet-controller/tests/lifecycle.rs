//! Single-replica lifecycle: sizing, readiness, drains, expiry, failures.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{ConflictingStore, PausingDriver, World, config, config_with, pump};
use fleet_cluster::{PodObservation, PodPhase};
use fleet_controller::{Backends, ControllerError, FleetController};
use fleet_core::util::now;
use fleet_state::{FleetStore, InstanceState, TerminationReason};

#[tokio::test]
async fn min_ready_instances_are_created() {
    let world = World::new();
    let c = world.leader("replica-a", &config(2, 5)).await;

    let plan = c.reconcile("lobby").await.unwrap();
    assert_eq!(plan.create, 2);
    assert_eq!(world.driver.created().len(), 2);

    let starting = world.stored_in(InstanceState::Starting).await;
    assert_eq!(starting.len(), 2);
    for inst in &starting {
        assert!(inst.id.starts_with("lobby-"));
        assert_eq!(inst.version, 2);
        assert!(world.driver.pod(&inst.pod_name).is_some());
        assert_eq!(c.registry().get(&inst.id).unwrap().state, InstanceState::Starting);
    }

    assert!(c.reconcile("lobby").await.unwrap().is_noop());
    assert_eq!(c.metrics().snapshot().creates, 2);
}

#[tokio::test]
async fn ready_pods_become_routable() {
    let world = World::new();
    let c = world.leader("replica-a", &config(2, 5)).await;
    let mut pods = c.watch_pods().await.unwrap();

    c.reconcile("lobby").await.unwrap();
    pump(&c, &mut pods).await;
    for name in world.driver.created() {
        world.driver.mark_ready(&name, now());
    }
    pump(&c, &mut pods).await;

    let ready = world.stored_in(InstanceState::Ready).await;
    assert_eq!(ready.len(), 2);
    assert!(ready.iter().all(|i| i.address.is_some()));
    assert_eq!(c.registry().routing_entries("lobby").len(), 2);
    assert!(c.registry().select_instance("lobby").is_some());
}

#[tokio::test]
async fn lowering_max_drains_lowest_load_first() {
    let world = World::new();
    let c = world.leader("replica-a", &config(5, 5)).await;
    let mut pods = c.watch_pods().await.unwrap();

    c.reconcile("lobby").await.unwrap();
    let names = world.driver.created();
    assert_eq!(names.len(), 5);
    for (name, load) in names.iter().zip([4, 0, 9, 2, 6]) {
        world.driver.mark_ready(name, now());
        world.driver.report(name, load, now());
    }
    pump(&c, &mut pods).await;

    let smaller = config(1, 3);
    c.sync_templates(&smaller).await.unwrap();
    let plan = c.reconcile("lobby").await.unwrap();
    assert_eq!(plan.create, 0);
    assert_eq!(plan.drain, vec![names[1].clone(), names[3].clone()]);
    assert_eq!(world.stored(&names[1]).await.state, InstanceState::Draining);
    assert_eq!(world.stored(&names[3]).await.state, InstanceState::Draining);

    // The idle one finishes on the next tick; the other once its players leave.
    assert!(c.tick("lobby").await.unwrap());
    let idle = world.stored(&names[1]).await;
    assert_eq!(idle.state, InstanceState::Terminated);
    assert_eq!(idle.termination_reason, Some(TerminationReason::Drained));
    assert!(world.driver.deleted().contains(&names[1]));
    assert_eq!(world.stored(&names[3]).await.state, InstanceState::Draining);

    world.driver.report(&names[3], 0, now());
    pump(&c, &mut pods).await;
    c.tick("lobby").await.unwrap();
    assert_eq!(world.stored(&names[3]).await.state, InstanceState::Terminated);
    assert_eq!(world.stored_in(InstanceState::Ready).await.len(), 3);
    assert_eq!(world.driver.created().len(), 5);
}

#[tokio::test]
async fn silent_instance_times_out_and_stays_terminated() {
    let world = World::new();
    let c = world
        .leader("replica-a", &config_with(1, 1, "heartbeatTimeoutSeconds = 1"))
        .await;
    let mut pods = c.watch_pods().await.unwrap();

    c.reconcile("lobby").await.unwrap();
    let name = world.driver.created()[0].clone();
    world.driver.mark_ready(&name, now());
    pump(&c, &mut pods).await;
    assert_eq!(world.stored(&name).await.state, InstanceState::Ready);

    tokio::time::sleep(Duration::from_millis(1200)).await;
    c.tick("lobby").await.unwrap();

    let dead = world.stored(&name).await;
    assert_eq!(dead.state, InstanceState::Terminated);
    assert_eq!(dead.termination_reason, Some(TerminationReason::HeartbeatTimeout));
    assert!(world.driver.deleted().contains(&name));
    // Replacement comes from the same tick.
    assert_eq!(world.driver.created().len(), 2);

    // Nothing moves it back.
    assert!(c.transition(&name, InstanceState::Ready, None).await.unwrap().is_none());
    pump(&c, &mut pods).await;
    let after = world.stored(&name).await;
    assert_eq!(after.state, InstanceState::Terminated);
    assert_eq!(after.version, dead.version);
    assert_eq!(c.registry().get(&name).unwrap().state, InstanceState::Terminated);
}

#[tokio::test]
async fn exhausted_create_is_replaced() {
    let world = World::new();
    let c = world.leader("replica-a", &config(1, 1)).await;
    world.driver.fail_creates(3);

    let plan = c.reconcile("lobby").await.unwrap();
    assert_eq!(plan.create, 1);
    let failed = world.stored_in(InstanceState::Terminated).await;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].termination_reason, Some(TerminationReason::CreateFailed));
    assert!(world.driver.created().is_empty());
    assert!(world.driver.deleted().is_empty());

    let plan = c.reconcile("lobby").await.unwrap();
    assert_eq!(plan.create, 1);
    assert_eq!(world.stored_in(InstanceState::Starting).await.len(), 1);

    let m = c.metrics().snapshot();
    assert_eq!(m.create_failures, 1);
    assert_eq!(m.creates, 1);
    assert!(m.transient_retries >= 2);
}

#[tokio::test]
async fn conflicting_write_is_retried_after_refresh() {
    let world = World::new();
    let c = world.leader("replica-a", &config(1, 1)).await;
    c.reconcile("lobby").await.unwrap();
    let starting = world.stored_in(InstanceState::Starting).await.remove(0);

    // Another writer moves the record on behind this replica's back.
    let mut ahead = starting
        .transitioned(InstanceState::Ready, None, now())
        .unwrap();
    ahead.address = Some("10.0.0.9:25565".into());
    world
        .store
        .write_instance(&ahead, starting.version)
        .await
        .unwrap();

    let drained = c
        .transition(&starting.id, InstanceState::Draining, None)
        .await
        .unwrap()
        .expect("transition applied after refresh");
    assert_eq!(drained.version, ahead.version + 1);
    assert_eq!(drained.address.as_deref(), Some("10.0.0.9:25565"));
    assert_eq!(world.stored(&starting.id).await.state, InstanceState::Draining);
    assert_eq!(c.metrics().snapshot().conflicts, 1);
}

async fn with_conflicting_store(
    world: &World,
    conflicts: u32,
) -> (Arc<FleetController>, String) {
    let store: Arc<dyn FleetStore> = Arc::new(ConflictingStore::new(
        world.store.clone(),
        InstanceState::Draining,
        conflicts,
    ));
    let backends = Backends {
        store,
        ..world.backends()
    };
    let config = config(1, 1);
    let c = Arc::new(FleetController::new(&config, "replica-a", backends));
    c.sync_templates(&config).await.unwrap();
    assert!(c.renew_leadership().await);
    c.reconcile("lobby").await.unwrap();
    let id = world.stored_in(InstanceState::Starting).await.remove(0).id;
    (c, id)
}

#[tokio::test]
async fn repeated_conflicts_back_off_then_succeed() {
    let world = World::new();
    let (c, id) = with_conflicting_store(&world, 2).await;
    let before = c.metrics().snapshot().transient_retries;

    let drained = c
        .transition(&id, InstanceState::Draining, None)
        .await
        .unwrap()
        .expect("third write lands");
    assert_eq!(drained.state, InstanceState::Draining);
    assert_eq!(world.stored(&id).await.state, InstanceState::Draining);

    let m = c.metrics().snapshot();
    assert_eq!(m.conflicts, 2);
    assert_eq!(m.transient_retries - before, 1);
}

#[tokio::test]
async fn persistent_conflicts_surface_as_transient() {
    let world = World::new();
    let (c, id) = with_conflicting_store(&world, u32::MAX).await;
    let before = c.metrics().snapshot().transient_retries;

    let err = c
        .transition(&id, InstanceState::Draining, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::RepeatedConflict(_)));
    assert!(err.is_transient());

    // One refresh, then createMaxAttempts (3) backed-off attempts.
    let m = c.metrics().snapshot();
    assert_eq!(m.conflicts, 4);
    assert_eq!(m.transient_retries - before, 2);
    assert_eq!(world.stored(&id).await.state, InstanceState::Starting);
}

#[tokio::test]
async fn conflict_with_terminal_record_gives_up_quietly() {
    let world = World::new();
    let c = world.leader("replica-a", &config(1, 1)).await;
    c.reconcile("lobby").await.unwrap();
    let starting = world.stored_in(InstanceState::Starting).await.remove(0);

    let gone = starting
        .transitioned(
            InstanceState::Terminated,
            Some(TerminationReason::PodDeleted),
            now(),
        )
        .unwrap();
    world
        .store
        .write_instance(&gone, starting.version)
        .await
        .unwrap();

    let out = c
        .transition(&starting.id, InstanceState::Draining, None)
        .await
        .unwrap();
    assert!(out.is_none());
    assert_eq!(
        c.registry().get(&starting.id).unwrap().state,
        InstanceState::Terminated
    );
}

#[tokio::test]
async fn pod_failures_and_external_deletes_terminate() {
    let world = World::new();
    let c = world.leader("replica-a", &config(2, 2)).await;
    let mut pods = c.watch_pods().await.unwrap();

    c.reconcile("lobby").await.unwrap();
    let names = world.driver.created();
    for name in &names {
        world.driver.mark_ready(name, now());
    }
    pump(&c, &mut pods).await;

    world.driver.set_phase(&names[0], PodPhase::Failed);
    world.driver.remove_externally(&names[1]);
    pump(&c, &mut pods).await;

    let failed = world.stored(&names[0]).await;
    assert_eq!(failed.termination_reason, Some(TerminationReason::PodFailed));
    assert!(world.driver.deleted().contains(&names[0]));

    let deleted = world.stored(&names[1]).await;
    assert_eq!(deleted.termination_reason, Some(TerminationReason::PodDeleted));
    assert!(!world.driver.deleted().contains(&names[1]));
}

#[tokio::test]
async fn resync_removes_orphans_and_flags_missing_pods() {
    let world = World::new();
    let c = world.leader("replica-a", &config(1, 1)).await;

    world.driver.insert_pod(
        PodObservation {
            name: "lobby-zzzzzzzz".into(),
            namespace: common::NAMESPACE.into(),
            instance_id: Some("lobby-zzzzzzzz".into()),
            template_id: Some("lobby".into()),
            phase: PodPhase::Running,
            ready: true,
            address: Some("10.0.0.77:25565".into()),
            load: Some(3),
            heartbeat: Some(now()),
            terminating: false,
        },
        25565,
    );
    c.reconcile("lobby").await.unwrap();
    let name = world.driver.created()[0].clone();
    world.driver.remove_externally(&name);

    let report = c.resync().await.unwrap();
    assert_eq!(report.pods, 1);
    assert_eq!(report.orphans_deleted, 1);
    assert_eq!(report.missing, 1);
    assert!(world.driver.pod("lobby-zzzzzzzz").is_none());

    let missing = world.stored(&name).await;
    assert_eq!(missing.state, InstanceState::Terminated);
    assert_eq!(missing.termination_reason, Some(TerminationReason::PodMissing));
    assert_eq!(c.metrics().snapshot().orphans_deleted, 1);
    // A late pod must not outlive its record.
    assert!(world.driver.deleted().contains(&name));
}

#[tokio::test]
async fn resync_spares_instances_created_while_listing() {
    let world = World::new();
    let driver = Arc::new(PausingDriver::new(world.driver.clone()));
    let backends = Backends {
        driver: driver.clone(),
        ..world.backends()
    };
    let config = config(1, 1);
    let c = Arc::new(FleetController::new(&config, "replica-a", backends));
    c.sync_templates(&config).await.unwrap();
    assert!(c.renew_leadership().await);

    let pass = tokio::spawn({
        let c = c.clone();
        async move { c.resync().await }
    });
    driver.listed.notified().await;
    assert_eq!(c.reconcile("lobby").await.unwrap().create, 1);
    driver.resume.notify_one();

    let report = pass.await.unwrap().unwrap();
    assert_eq!(report.pods, 0);
    assert_eq!(report.missing, 0);
    let starting = world.stored_in(InstanceState::Starting).await;
    assert_eq!(starting.len(), 1);
    assert!(world.driver.pod(&starting[0].pod_name).is_some());
    assert!(world.driver.deleted().is_empty());
}

#[tokio::test]
async fn image_change_rolls_one_instance_at_a_time() {
    let world = World::new();
    let c = world.leader("replica-a", &config(2, 2)).await;
    let mut pods = c.watch_pods().await.unwrap();

    c.reconcile("lobby").await.unwrap();
    let old = world.driver.created();
    for (name, load) in old.iter().zip([5, 1]) {
        world.driver.mark_ready(name, now());
        world.driver.report(name, load, now());
    }
    pump(&c, &mut pods).await;

    let mut next = config(2, 2);
    next.fleet_templates[0].image = "registry.example.net/lobby:1.5".into();
    c.sync_templates(&next).await.unwrap();
    let slot = c.template("lobby").await.unwrap();
    assert_eq!(slot.template.pod_version, 2);

    let plan = c.reconcile("lobby").await.unwrap();
    assert_eq!(plan.create, 1);
    assert!(plan.drain.is_empty());

    let surge = world.driver.created()[2].clone();
    world.driver.mark_ready(&surge, now());
    pump(&c, &mut pods).await;

    let plan = c.reconcile("lobby").await.unwrap();
    assert_eq!(plan.create, 0);
    assert_eq!(plan.drain, vec![old[1].clone()]);
}

#[tokio::test]
async fn removed_template_is_drained_and_retired() {
    let world = World::new();
    let config = config(2, 2);
    let c = world.leader("replica-a", &config).await;
    c.reconcile("lobby").await.unwrap();

    let mut without_lobby = config.clone();
    without_lobby.fleet_templates[0].id = "arena".into();
    c.sync_templates(&without_lobby).await.unwrap();
    assert!(c.template("lobby").await.unwrap().retired);

    assert!(c.tick("lobby").await.unwrap());
    assert_eq!(world.stored_in(InstanceState::Draining).await.len(), 2);

    assert!(!c.tick("lobby").await.unwrap());
    let done = world.stored_in(InstanceState::Terminated).await;
    assert_eq!(done.len(), 2);
    assert!(
        done.iter()
            .all(|i| i.termination_reason == Some(TerminationReason::TemplateRemoved))
    );
    assert!(world.store.get_template("lobby").await.unwrap().is_none());
    assert!(c.template("lobby").await.is_none());
}
