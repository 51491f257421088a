mod common;

use common::{ACCOUNT, ProbeStore, alice, mirror_store, primary_store};
use contactmirror_blobstore::BlobStore;
use contactmirror_store::{ContactStore, MemoryContactStore};
use contactmirror_sync::{
    CycleState, OrchestratorConfig, OrchestratorHandle, SyncConfig, SyncEngine, SyncError,
    SyncEvent, TriggerPolicy, create_orchestrator,
};
use contactmirror_types::AccountId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

struct Running {
    handle: OrchestratorHandle,
    events: mpsc::Receiver<SyncEvent>,
    task: JoinHandle<()>,
}

fn spawn(engine: Arc<SyncEngine>) -> Running {
    let (handle, events, orchestrator) = create_orchestrator(engine, OrchestratorConfig::default());
    let task = tokio::spawn(orchestrator.run());
    Running {
        handle,
        events,
        task,
    }
}

fn engine_over(
    primary: Arc<MemoryContactStore>,
    mirror: Arc<dyn ContactStore>,
    config: SyncConfig,
) -> Arc<SyncEngine> {
    let blobs = Arc::new(BlobStore::open_in_memory().unwrap());
    Arc::new(SyncEngine::new(primary, mirror, blobs, config))
}

async fn next_event(events: &mut mpsc::Receiver<SyncEvent>) -> SyncEvent {
    tokio::time::timeout(Duration::from_secs(10), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream closed")
}

// ── Cycles ──────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn trigger_runs_a_cycle() {
    let primary = primary_store();
    primary.insert(alice()).unwrap();
    let mirror = mirror_store();
    let engine = engine_over(primary, mirror.clone(), SyncConfig::default());
    let mut running = spawn(engine);

    running
        .handle
        .trigger(ACCOUNT, TriggerPolicy::IfAlwaysUpToDate)
        .await
        .unwrap();
    match next_event(&mut running.events).await {
        SyncEvent::CycleCompleted { account, report } => {
            assert_eq!(account, ACCOUNT);
            assert_eq!(report.push.added, 1);
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(mirror.len().unwrap(), 1);

    running.handle.shutdown().await.unwrap();
    running.task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_cycle_is_reported() {
    let primary = primary_store();
    let mirror = mirror_store();
    mirror.set_unavailable(true);
    let engine = engine_over(primary, mirror, SyncConfig::default());
    let mut running = spawn(engine);

    running
        .handle
        .trigger(ACCOUNT, TriggerPolicy::Force)
        .await
        .unwrap();
    assert!(matches!(
        next_event(&mut running.events).await,
        SyncEvent::CycleFailed { account, .. } if account == ACCOUNT
    ));

    running.handle.shutdown().await.unwrap();
    running.task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn non_forced_trigger_is_ignored_when_not_always_up_to_date() {
    let engine = engine_over(
        primary_store(),
        mirror_store(),
        SyncConfig {
            always_up_to_date: false,
            ..SyncConfig::default()
        },
    );
    let mut running = spawn(engine);

    running
        .handle
        .trigger(ACCOUNT, TriggerPolicy::IfAlwaysUpToDate)
        .await
        .unwrap();
    assert!(matches!(
        next_event(&mut running.events).await,
        SyncEvent::TriggerIgnored { account } if account == ACCOUNT
    ));

    running
        .handle
        .trigger(ACCOUNT, TriggerPolicy::Force)
        .await
        .unwrap();
    assert!(matches!(
        next_event(&mut running.events).await,
        SyncEvent::CycleCompleted { .. }
    ));

    running.handle.shutdown().await.unwrap();
    running.task.await.unwrap();
}

// ── Coalescing ──────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn triggers_during_a_cycle_collapse_into_one_follow_up() {
    let primary = primary_store();
    primary.insert(alice()).unwrap();
    let (mirror, release) = ProbeStore::gated(mirror_store());
    let engine = engine_over(
        primary,
        Arc::new(mirror),
        SyncConfig {
            always_up_to_date: false,
            ..SyncConfig::default()
        },
    );
    let mut running = spawn(Arc::clone(&engine));

    running
        .handle
        .trigger(ACCOUNT, TriggerPolicy::Force)
        .await
        .unwrap();
    for _ in 0..500 {
        if engine.state(ACCOUNT) == CycleState::PullingMirror {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(engine.state(ACCOUNT), CycleState::PullingMirror);

    for _ in 0..2 {
        running
            .handle
            .trigger(ACCOUNT, TriggerPolicy::Force)
            .await
            .unwrap();
    }
    // Commands are handled in order, so once this one is answered the two
    // forced triggers above have been seen.
    running
        .handle
        .trigger(ACCOUNT, TriggerPolicy::IfAlwaysUpToDate)
        .await
        .unwrap();
    assert!(matches!(
        next_event(&mut running.events).await,
        SyncEvent::TriggerIgnored { .. }
    ));

    release.send(()).unwrap();
    let first = next_event(&mut running.events).await;
    let second = next_event(&mut running.events).await;
    match (first, second) {
        (
            SyncEvent::CycleCompleted { report: a, .. },
            SyncEvent::CycleCompleted { report: b, .. },
        ) => {
            assert_eq!(a.push.added, 1);
            assert!(b.is_noop());
            assert_ne!(a.cycle_id, b.cycle_id);
        }
        other => panic!("unexpected events: {other:?}"),
    }

    running.handle.shutdown().await.unwrap();
    running.task.await.unwrap();
    assert!(running.events.recv().await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn accounts_run_independently() {
    let primary = primary_store();
    primary.insert(alice()).unwrap();
    let engine = engine_over(primary, mirror_store(), SyncConfig::default());
    let mut running = spawn(engine);

    let other = AccountId::new(2);
    running
        .handle
        .trigger(ACCOUNT, TriggerPolicy::Force)
        .await
        .unwrap();
    running
        .handle
        .trigger(other, TriggerPolicy::Force)
        .await
        .unwrap();

    let mut seen = Vec::new();
    for _ in 0..2 {
        match next_event(&mut running.events).await {
            SyncEvent::CycleCompleted { account, .. } => seen.push(account),
            other => panic!("unexpected event: {other:?}"),
        }
    }
    seen.sort_by_key(AccountId::get);
    assert_eq!(seen, vec![ACCOUNT, other]);

    running.handle.shutdown().await.unwrap();
    running.task.await.unwrap();
}

// ── Shutdown ────────────────────────────────────────────────────

#[tokio::test]
async fn dropping_every_handle_stops_the_loop() {
    let engine = engine_over(primary_store(), mirror_store(), SyncConfig::default());
    let Running {
        handle,
        mut events,
        task,
    } = spawn(engine);

    drop(handle);
    task.await.unwrap();
    assert!(events.recv().await.is_none());
}

#[tokio::test]
async fn handle_reports_closed_channel() {
    let engine = engine_over(primary_store(), mirror_store(), SyncConfig::default());
    let (handle, _events, orchestrator) =
        create_orchestrator(engine, OrchestratorConfig::default());
    drop(orchestrator);

    let err = handle
        .trigger(ACCOUNT, TriggerPolicy::Force)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::ChannelClosed));
    assert!(matches!(
        handle.shutdown().await,
        Err(SyncError::ChannelClosed)
    ));
}
