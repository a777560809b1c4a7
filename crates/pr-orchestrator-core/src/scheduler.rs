//! Scheduler and cancellation.
//!
//! `schedulerLock` serializes every scheduling attempt across the process;
//! `allow_scheduling` blocks scheduling while the Watch Loop is reconciling.

use crate::adapters::ExecutorAdapter;
use crate::db::DbHandle;
use crate::error::OrchestratorError;
use crate::hooks::PolicyHooks;
use crate::types::{BuildStatusCode, Status};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

pub struct Scheduler {
    db: DbHandle,
    executor: Arc<dyn ExecutorAdapter>,
    hooks: Arc<dyn PolicyHooks>,
    lock: Mutex<()>,
    pub allow_scheduling: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(db: DbHandle, executor: Arc<dyn ExecutorAdapter>, hooks: Arc<dyn PolicyHooks>) -> Self {
        Self {
            db,
            executor,
            hooks,
            lock: Mutex::new(()),
            allow_scheduling: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Picks one eligible `INQUEUE` Status for `builder_name` (an *executor*
    /// builder name, e.g. as delivered by `builderChangedState` or the watch
    /// loop's `canonical_name()`) and hands it to the executor. At most one
    /// outstanding submission per builder.
    pub async fn try_schedule_for_builder(&self, builder_name: &str) {
        if !self.allow_scheduling.load(Ordering::SeqCst) {
            return;
        }
        let _guard = self.lock.lock().await;

        let builder = match self.resolve_by_executor_name(builder_name).await {
            Ok(Some(b)) => b,
            Ok(None) => {
                warn!(builder_name, "scheduler: unknown builder");
                return;
            }
            Err(e) => {
                error!(builder_name, error = %e, "scheduler: failed to load builder");
                return;
            }
        };

        let Some(canonical) = builder.canonical_name() else {
            warn!(builder_name, "scheduler: builder has no executor targets");
            return;
        };

        let state = match self.executor.get_builder_state(canonical).await {
            Ok(s) => s,
            Err(e) => {
                error!(builder_name, error = %e, "scheduler: executor unavailable");
                return;
            }
        };
        if !state.online || !state.pending_requests.is_empty() {
            return;
        }

        let next = match self.db.pick_next_for_builder(builder.bid).await {
            Ok(Some(s)) => s,
            Ok(None) => return,
            Err(e) => {
                error!(builder_name, error = %e, "scheduler: pick_next_for_builder failed");
                return;
            }
        };

        self.schedule_one(next, &builder, canonical).await;
    }

    /// Finds the logical `Builder` row whose `builders` list contains
    /// `executor_name`. Callbacks and the watch loop deal in executor
    /// builder names, which need not equal the logical `internal_name`.
    async fn resolve_by_executor_name(
        &self,
        executor_name: &str,
    ) -> Result<Option<crate::types::Builder>, OrchestratorError> {
        let builders = self.db.list_active_builders().await?;
        Ok(builders
            .into_iter()
            .find(|b| b.builders.iter().any(|name| name == executor_name)))
    }

    async fn schedule_one(
        &self,
        mut status: Status,
        builder: &crate::types::Builder,
        canonical_name: &str,
    ) {
        status.status = BuildStatusCode::SCHEDULING;
        status = match self.db.update_status(status).await {
            Ok(s) => s,
            Err(e) => {
                error!(sid = status.sid, error = %e, "scheduler: failed to mark SCHEDULING");
                return;
            }
        };

        let pr = match self.db.get_pr(status.prid).await {
            Ok(Some(pr)) => pr,
            _ => {
                self.fail_attempt(status, BuildStatusCode::EXCEPTION).await;
                return;
            }
        };

        let Some((properties, sourcestamps)) = self.hooks.get_build_properties(&pr, builder) else {
            self.fail_attempt(status, BuildStatusCode::FAILURE).await;
            return;
        };

        let reason = format!("#{} ({}) on {}", pr.prid, pr.head_sha, canonical_name);
        let external_id = format!("PR #{}", pr.prid);

        match self
            .executor
            .submit_build_set(&sourcestamps, &properties, canonical_name, &reason, &external_id)
            .await
        {
            Ok(submitted) => {
                status.brid = submitted.brid;
                if let Err(e) = self.db.update_status(status.clone()).await {
                    error!(sid = status.sid, error = %e, "scheduler: failed to record brid");
                }
                info!(prid = pr.prid, bid = builder.bid, brid = submitted.brid, "submitted build");
            }
            Err(e) => {
                error!(prid = pr.prid, bid = builder.bid, error = %e, "submit_build_set failed");
                self.fail_attempt(status, BuildStatusCode::EXCEPTION).await;
            }
        }
    }

    async fn fail_attempt(&self, mut status: Status, code: BuildStatusCode) {
        status.status = code;
        if let Err(e) = self.db.update_status(status).await {
            error!(error = %e, "scheduler: failed to persist failed attempt");
        }
    }

    /// Cancels a Status, branching on its current lifecycle state.
    pub async fn cancel_build(
        &self,
        mut status: Status,
        expected_updated_at: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<Status, OrchestratorError> {
        if let Some(expected) = expected_updated_at {
            if expected != status.updated_at {
                return Err(OrchestratorError::NeedUpdate(format!(
                    "status {} was updated at {}, expected {}",
                    status.sid, status.updated_at, expected
                )));
            }
        }

        let builder = self
            .db
            .get_builder(status.bid)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("builder {}", status.bid)))?;

        match status.status {
            BuildStatusCode::INQUEUE | BuildStatusCode::SCHEDULING => {
                status.active = false;
                status = self.db.update_status(status).await?;
            }
            BuildStatusCode::SCHEDULED => {
                status.active = false;
                status = self.db.update_status(status).await?;
                let mut matched = false;
                for name in &builder.builders {
                    if let Ok(pending) = self.executor.pending_requests(name).await {
                        for req in pending.into_iter().filter(|r| r.brid == status.brid) {
                            if self.executor.cancel_request(req.brid).await.is_ok() {
                                matched = true;
                            }
                        }
                    }
                }
                if !matched {
                    warn!(sid = status.sid, brid = status.brid, "no pending request matched on cancel");
                }
            }
            BuildStatusCode::BUILDING => {
                for name in &builder.builders {
                    if let Err(e) = self
                        .executor
                        .stop_build(name, status.build_number, "canceled by PR service")
                        .await
                    {
                        warn!(builder = name, error = %e, "stop_build failed during cancel");
                    }
                }
            }
            other if other.is_terminal() => {
                info!(sid = status.sid, "cancel_build: already terminal, no-op");
            }
            _ => {}
        }

        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::DefaultPolicyHooks;
    use crate::types::{BuildStatusCode, BuilderConfig};
    use pr_orchestrator_executor::MockExecutorAdapter;
    use std::collections::HashMap;

    fn temp_db() -> DbHandle {
        let path = std::env::temp_dir().join(format!(
            "pr-orchestrator-scheduler-{}-{}.sqlite",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        DbHandle::open(path.to_str().unwrap()).expect("open temp db")
    }

    /// Regression test: `internal_name` ("swe") differs from the canonical
    /// executor builder name ("b-swe-1"). The scheduler is invoked with the
    /// executor name (as `builderChangedState`/the watch loop would), so it
    /// must resolve the logical builder by searching `builders`, not by
    /// treating the executor name as the internal name.
    #[tokio::test]
    async fn resolves_logical_builder_by_executor_name_not_internal_name() {
        let db = temp_db();
        let mut cfg = HashMap::new();
        cfg.insert(
            "swe".to_string(),
            BuilderConfig {
                internal_name: "swe".into(),
                name: "SWE".into(),
                builders: vec!["b-swe-1".into()],
                order: 0,
                is_perf: false,
            },
        );
        let builders = db.startup_reconcile(cfg).await.expect("reconcile");
        let bid = builders[0].bid;

        db.insert_pr(crate::types::PrDescriptor {
            id: 1,
            branch: "feature".into(),
            author: "alice".into(),
            assignee: "bob".into(),
            head_user: "alice".into(),
            head_repo: "origin/repo".into(),
            head_branch: "feature".into(),
            head_sha: "deadbeef".into(),
            title: "add widget".into(),
            description: "".into(),
            priority: 10,
            info: serde_json::json!({}),
        })
        .await
        .expect("insert pr");
        db.insert_status(1, bid, "deadbeef".into(), BuildStatusCode::INQUEUE, -1)
            .await
            .expect("insert status");

        let executor = Arc::new(MockExecutorAdapter::new());
        let hooks = Arc::new(DefaultPolicyHooks);
        let scheduler = Scheduler::new(db.clone(), executor.clone(), hooks.clone());

        // Pass the executor builder name, exactly as builderChangedState/the
        // watch loop would, not the distinct internal_name "swe".
        scheduler.try_schedule_for_builder("b-swe-1").await;

        let status = db.get_active_status(1, bid).await.unwrap().unwrap();
        assert_eq!(
            status.status,
            BuildStatusCode::SCHEDULING,
            "scheduler must have found the logical builder and submitted the build"
        );
    }
}
