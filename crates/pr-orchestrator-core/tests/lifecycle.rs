//! End-to-end lifecycle tests driving the DB worker, scheduler, actions and
//! status receiver together against a temp-file SQLite database and the
//! in-process mock executor.

use std::collections::HashMap;
use std::sync::Arc;

use pr_orchestrator_core::actions;
use pr_orchestrator_core::db::DbHandle;
use pr_orchestrator_core::hooks::DefaultPolicyHooks;
use pr_orchestrator_core::scheduler::Scheduler;
use pr_orchestrator_core::status_receiver::StatusReceiver;
use pr_orchestrator_core::types::{BuildStatusCode, BuilderConfig, PrDescriptor};
use pr_orchestrator_executor::MockExecutorAdapter;

fn temp_db() -> DbHandle {
    let path = std::env::temp_dir().join(format!(
        "pr-orchestrator-lifecycle-{}-{}.sqlite",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    ));
    DbHandle::open(path.to_str().unwrap()).expect("open temp db")
}

async fn seed_builder(db: &DbHandle, internal_name: &str, executor_name: &str) -> i64 {
    let mut cfg = HashMap::new();
    cfg.insert(
        internal_name.to_string(),
        BuilderConfig {
            internal_name: internal_name.to_string(),
            name: internal_name.to_string(),
            builders: vec![executor_name.to_string()],
            order: 0,
            is_perf: false,
        },
    );
    let builders = db.startup_reconcile(cfg).await.expect("reconcile");
    builders[0].bid
}

async fn seed_pr(db: &DbHandle, prid: i64, head_sha: &str) {
    db.insert_pr(PrDescriptor {
        id: prid,
        branch: "feature".into(),
        author: "alice".into(),
        assignee: "bob".into(),
        head_user: "alice".into(),
        head_repo: "origin/repo".into(),
        head_branch: "feature".into(),
        head_sha: head_sha.into(),
        title: "add widget".into(),
        description: "".into(),
        priority: 10,
        info: serde_json::json!({}),
    })
    .await
    .expect("insert pr");
}

/// Retrying then stopping a build leaves exactly one inactive Status and no
/// active one for the pair.
#[tokio::test]
async fn retry_then_stop_leaves_single_inactive_status() {
    let db = temp_db();
    let bid = seed_builder(&db, "swe", "swe-1").await;
    seed_pr(&db, 1, "deadbeef").await;

    let executor = Arc::new(MockExecutorAdapter::new());
    let hooks = Arc::new(DefaultPolicyHooks);
    let scheduler = Arc::new(Scheduler::new(db.clone(), executor.clone(), hooks.clone()));

    let first = actions::retry_build(&db, &scheduler, 1, bid, None)
        .await
        .expect("first retry");
    assert_eq!(first.status, BuildStatusCode::INQUEUE);
    assert!(first.active);

    let stopped = actions::stop_build(&db, &scheduler, 1, bid, first.updated_at)
        .await
        .expect("stop");
    assert!(!stopped.active);

    let statuses = db.list_active_statuses_for_pr(1).await.expect("list");
    assert!(statuses.is_empty(), "no active status should remain for the pair");
}

/// `StopBuild` with a stale `updated_at` is rejected rather than silently
/// applied, so a client acting on an out-of-date view can't cancel the wrong
/// attempt.
#[tokio::test]
async fn stop_build_rejects_stale_expected_updated_at() {
    let db = temp_db();
    let bid = seed_builder(&db, "swe", "swe-1").await;
    seed_pr(&db, 2, "cafebabe").await;

    let executor = Arc::new(MockExecutorAdapter::new());
    let hooks = Arc::new(DefaultPolicyHooks);
    let scheduler = Arc::new(Scheduler::new(db.clone(), executor.clone(), hooks.clone()));

    let status = actions::retry_build(&db, &scheduler, 2, bid, None)
        .await
        .expect("retry");

    let stale = status.updated_at - chrono::Duration::seconds(5);
    let err = actions::stop_build(&db, &scheduler, 2, bid, stale)
        .await
        .expect_err("stale updated_at must be rejected");
    assert!(matches!(err, pr_orchestrator_core::error::OrchestratorError::NeedUpdate(_)));
}

/// A queued build flows through SCHEDULING -> SCHEDULED -> BUILDING ->
/// terminal as the scheduler submits it and the status receiver relays
/// executor callbacks, never skipping a step.
#[tokio::test]
async fn full_build_flows_to_terminal_status() {
    let db = temp_db();
    let bid = seed_builder(&db, "swe", "swe-1").await;
    seed_pr(&db, 3, "f00dcafe").await;

    let executor = Arc::new(MockExecutorAdapter::new());
    let hooks = Arc::new(DefaultPolicyHooks);
    let scheduler = Arc::new(Scheduler::new(db.clone(), executor.clone(), hooks.clone()));
    let receiver = StatusReceiver::new(
        db.clone(),
        executor.clone(),
        scheduler.clone(),
        hooks.clone(),
        "pr-orchestrator".into(),
    );

    let queued = actions::retry_build(&db, &scheduler, 3, bid, None)
        .await
        .expect("retry");
    assert_eq!(queued.status, BuildStatusCode::INQUEUE);

    scheduler.try_schedule_for_builder("swe-1").await;

    let scheduling = db
        .get_active_status(3, bid)
        .await
        .expect("get")
        .expect("present");
    assert_eq!(scheduling.status, BuildStatusCode::SCHEDULING);
    assert!(scheduling.brid >= 0, "a brid must be recorded once submitted");

    receiver
        .request_submitted("pr-orchestrator", 3, bid, scheduling.brid, "f00dcafe")
        .await;
    let scheduled = db.get_active_status(3, bid).await.unwrap().unwrap();
    assert_eq!(scheduled.status, BuildStatusCode::SCHEDULED);

    receiver
        .build_started("pr-orchestrator", 3, bid, "swe-1", scheduling.brid, 42, "f00dcafe")
        .await;
    let building = db.get_active_status(3, bid).await.unwrap().unwrap();
    assert_eq!(building.status, BuildStatusCode::BUILDING);
    assert_eq!(building.build_number, 42);

    receiver
        .build_finished(
            "pr-orchestrator",
            3,
            bid,
            "swe-1",
            42,
            BuildStatusCode::SUCCESS,
            "f00dcafe",
        )
        .await;
    let finished = db.get_active_status(3, bid).await.unwrap().unwrap();
    assert_eq!(finished.status, BuildStatusCode::SUCCESS);
}
