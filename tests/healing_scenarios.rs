mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use autoheal_engine::metrics::Metrics;
use autoheal_engine::notify::NoopSink;
use autoheal_engine::runtime::{ContainerStatus, HealthStatus};
use autoheal_engine::scheduler::HealingScheduler;
use autoheal_engine::store::StateStore;
use chrono::Utc;
use common::{snapshot, FakeAdapter};
use tokio_util::sync::CancellationToken;

fn new_store() -> (tempfile::TempDir, Arc<StateStore>) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(StateStore::load(dir.path()));
    (dir, store)
}

fn scheduler(adapter: Arc<FakeAdapter>, store: Arc<StateStore>) -> Arc<HealingScheduler> {
    HealingScheduler::new(
        adapter,
        store,
        Arc::new(NoopSink),
        Arc::new(Metrics::new().unwrap().healing_metrics()),
        CancellationToken::new(),
    )
}

async fn settle() {
    // lets detached per-container tick workers finish before assertions.
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn quarantines_after_max_restarts_without_backoff_delay() {
    let (_dir, store) = new_store();
    store
        .update_restart(|r| {
            r.max_restarts = 2;
            r.cooldown_seconds = 0;
        })
        .unwrap();
    store.update_backoff(|b| b.enabled = false).unwrap();

    let snap = snapshot(
        "ctr-crashloop",
        "/crashloop",
        ContainerStatus::Exited,
        HealthStatus::None,
        Some(1),
        HashMap::new(),
    );
    let adapter = Arc::new(FakeAdapter::new(vec![snap]));
    let sched = scheduler(Arc::clone(&adapter), Arc::clone(&store));

    // monitor.include_all defaults to false; select explicitly.
    store.select("crashloop");

    for _ in 0..3 {
        sched.tick().await;
        settle().await;
    }

    assert!(store.is_quarantined("crashloop", &[]), "expected crashloop to be quarantined");
    assert!(adapter.restart_count("ctr-crashloop") <= 2);
}

#[tokio::test]
async fn manual_stop_with_exit_code_zero_is_never_restarted() {
    let (_dir, store) = new_store();
    store.update_backoff(|b| b.enabled = false).unwrap();

    let snap = snapshot(
        "ctr-stopped",
        "/stopped-on-purpose",
        ContainerStatus::Exited,
        HealthStatus::None,
        Some(0),
        HashMap::new(),
    );
    let adapter = Arc::new(FakeAdapter::new(vec![snap]));
    let sched = scheduler(Arc::clone(&adapter), Arc::clone(&store));
    store.select("stopped-on-purpose");

    for _ in 0..3 {
        sched.tick().await;
        settle().await;
    }

    assert_eq!(adapter.restart_count("ctr-stopped"), 0);
    assert!(!store.is_quarantined("stopped-on-purpose", &[]));
}

#[tokio::test]
async fn maintenance_suppresses_ticks_but_manual_restart_still_works() {
    let (_dir, store) = new_store();
    store.update_backoff(|b| b.enabled = false).unwrap();

    let snap = snapshot(
        "ctr-down",
        "/down",
        ContainerStatus::Exited,
        HealthStatus::None,
        Some(1),
        HashMap::new(),
    );
    let adapter = Arc::new(FakeAdapter::new(vec![snap]));
    let sched = scheduler(Arc::clone(&adapter), Arc::clone(&store));
    store.select("down");

    store.set_maintenance(true, Utc::now());
    sched.tick().await;
    settle().await;
    assert_eq!(adapter.restart_count("ctr-down"), 0, "maintenance should suppress automatic ticks");

    let result = sched.manual_restart("down").await;
    assert!(result.is_ok());
    assert_eq!(adapter.restart_count("ctr-down"), 1, "manual restart bypasses maintenance");
}

#[tokio::test]
async fn quarantine_survives_container_recreation_and_is_not_garbage_collected() {
    let (_dir, store) = new_store();
    store.update_restart(|r| r.max_restarts = 1).unwrap();
    store.update_backoff(|b| b.enabled = false).unwrap();

    let snap = snapshot(
        "ctr-old",
        "/flaky",
        ContainerStatus::Exited,
        HealthStatus::None,
        Some(1),
        HashMap::new(),
    );
    let adapter = Arc::new(FakeAdapter::new(vec![snap]));
    let sched = scheduler(Arc::clone(&adapter), Arc::clone(&store));
    store.select("flaky");

    for _ in 0..2 {
        sched.tick().await;
        settle().await;
    }
    assert!(store.is_quarantined("flaky", &[]));

    // Compose-style recreation: new ephemeral id, same stable name.
    adapter.recreate("ctr-old", "ctr-new");

    sched.tick().await;
    settle().await;

    assert!(
        store.is_quarantined("flaky", &[]),
        "quarantine must survive recreation under the same stable id"
    );
}
