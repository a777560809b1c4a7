//! Watch Loop: periodic reconciliation between the host's PR list
//! and local storage.

use crate::adapters::HostAdapter;
use crate::config::Config;
use crate::db::DbHandle;
use crate::hooks::PolicyHooks;
use crate::params::extract_regression_filter;
use crate::scheduler::Scheduler;
use crate::types::{BuildStatusCode, PrDescriptor};
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

pub struct WatchLoop {
    db: DbHandle,
    host: Arc<dyn HostAdapter>,
    scheduler: Arc<Scheduler>,
    hooks: Arc<dyn PolicyHooks>,
    config: Arc<Config>,
}

impl WatchLoop {
    pub fn new(
        db: DbHandle,
        host: Arc<dyn HostAdapter>,
        scheduler: Arc<Scheduler>,
        hooks: Arc<dyn PolicyHooks>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            db,
            host,
            scheduler,
            hooks,
            config,
        }
    }

    /// Runs forever, sleeping `update_pull_requests_delay_s` between
    /// iterations regardless of the previous iteration's outcome. Overlap is
    /// prevented by the loop body running to completion before the next
    /// sleep is armed, not by locking.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(self.config.update_pull_requests_delay_s))
                    .await;
                self.run_iteration().await;
            }
        })
    }

    pub async fn run_iteration(&self) {
        self.scheduler.allow_scheduling.store(false, Ordering::SeqCst);

        let prs = match self.host.list_open_pull_requests().await {
            Ok(prs) => prs,
            Err(e) => {
                warn!(error = %e, "watch loop: host unavailable, skipping iteration");
                self.scheduler.allow_scheduling.store(true, Ordering::SeqCst);
                return;
            }
        };

        let mut processed: HashSet<i64> = HashSet::new();
        for pr in prs {
            processed.insert(pr.id);
            if let Err(e) = self.reconcile_pr(pr.clone()).await {
                error!(prid = pr.id, error = %e, "watch loop: ReconcilePR failed");
            }
        }

        match self.db.list_active_prs().await {
            Ok(active) => {
                for pr in active {
                    if !processed.contains(&pr.prid) {
                        if let Err(e) = self.close_stale_pr(pr.prid).await {
                            error!(prid = pr.prid, error = %e, "watch loop: failed to close stale PR");
                        }
                    }
                }
            }
            Err(e) => error!(error = %e, "watch loop: list_active_prs failed"),
        }

        self.scheduler.allow_scheduling.store(true, Ordering::SeqCst);

        match self.db.list_active_builders().await {
            Ok(builders) => {
                for builder in builders {
                    if let Some(name) = builder.canonical_name() {
                        self.scheduler.try_schedule_for_builder(name).await;
                    }
                }
            }
            Err(e) => error!(error = %e, "watch loop: list_active_builders failed"),
        }
    }

    async fn close_stale_pr(&self, prid: i64) -> Result<()> {
        self.db.close_pr(prid).await.context("close_pr")?;
        for status in self.db.list_active_statuses_for_pr(prid).await.context("list_active_statuses_for_pr")? {
            match self.scheduler.cancel_build(status, None).await {
                Ok(mut cancelled) => {
                    cancelled.active = false;
                    if let Err(e) = self.db.update_status(cancelled).await {
                        warn!(prid, error = %e, "failed to deactivate status on PR close");
                    }
                }
                Err(e) => warn!(prid, error = %e, "cancel_build failed while closing PR"),
            }
        }
        info!(prid, "PR closed");
        Ok(())
    }

    /// Merges the host's view of a PR into storage, then queues
    /// builders if the head SHA moved.
    async fn reconcile_pr(&self, descriptor: PrDescriptor) -> Result<()> {
        let head_sha_old = match self.db.get_pr(descriptor.id).await? {
            Some(mut row) => {
                let old_sha = row.head_sha.clone();
                if row.status < 0 {
                    row.status = 0;
                }
                let changed = row.branch != descriptor.branch
                    || row.author != descriptor.author
                    || row.assignee != descriptor.assignee
                    || row.head_user != descriptor.head_user
                    || row.head_repo != descriptor.head_repo
                    || row.head_branch != descriptor.head_branch
                    || row.head_sha != descriptor.head_sha
                    || row.title != descriptor.title
                    || row.description != descriptor.description
                    || row.priority != descriptor.priority;

                if changed {
                    let persistent = row.info.get("persistent").cloned();
                    row.branch = descriptor.branch.clone();
                    row.author = descriptor.author.clone();
                    row.assignee = descriptor.assignee.clone();
                    row.head_user = descriptor.head_user.clone();
                    row.head_repo = descriptor.head_repo.clone();
                    row.head_branch = descriptor.head_branch.clone();
                    row.head_sha = descriptor.head_sha.clone();
                    row.title = descriptor.title.clone();
                    row.description = descriptor.description.clone();
                    row.priority = descriptor.priority;

                    let mut info = descriptor.info.clone();
                    if let (Some(persistent), Some(obj)) = (persistent, info.as_object_mut()) {
                        obj.insert("persistent".to_string(), persistent);
                    }
                    row.info = info;

                    self.db.update_pr(row).await?;
                }
                Some(old_sha)
            }
            None => {
                self.db.insert_pr(descriptor.clone()).await?;
                None
            }
        };

        let sha_changed = head_sha_old.as_deref() != Some(descriptor.head_sha.as_str());
        if sha_changed {
            self.queue_builders_for_pr(&descriptor, head_sha_old).await?;
        }

        self.hooks.on_update_pull_request(descriptor.id).await;
        Ok(())
    }

    /// Queues INQUEUE statuses for every builder eligible for this PR.
    async fn queue_builders_for_pr(
        &self,
        descriptor: &PrDescriptor,
        head_sha_old: Option<String>,
    ) -> Result<()> {
        let pr_row = self
            .db
            .get_pr(descriptor.id)
            .await?
            .context("pull request vanished mid-reconcile")?;
        let builders = self.db.list_active_builders().await?;
        let auto = self.hooks.get_list_of_automatic_builders(&pr_row);
        let test_filter = extract_regression_filter(&descriptor.description);

        for builder in builders {
            if let Some(existing) = self.db.get_active_status(descriptor.id, builder.bid).await? {
                match self.scheduler.cancel_build(existing, None).await {
                    Ok(mut cancelled) => {
                        cancelled.active = false;
                        if let Err(e) = self.db.update_status(cancelled).await {
                            warn!(prid = descriptor.id, bid = builder.bid, error = %e, "failed to deactivate superseded status");
                        }
                    }
                    Err(e) => warn!(prid = descriptor.id, bid = builder.bid, error = %e, "best-effort cancel of superseded status failed"),
                }
            }

            if let Some(auto_list) = &auto {
                if !auto_list.contains(&builder.name) && !auto_list.contains(&builder.internal_name) {
                    continue;
                }
            }
            if builder.is_perf && test_filter.is_none() {
                continue;
            }
            if let (Some(trusted), Some(reviewers)) =
                (&self.config.trusted_authors, &self.config.reviewers)
            {
                let first_time = head_sha_old.is_none();
                let is_trusted = trusted.contains(&descriptor.author) && reviewers.contains(&descriptor.assignee);
                if first_time && !is_trusted {
                    continue;
                }
            }

            self.db
                .insert_status(
                    descriptor.id,
                    builder.bid,
                    descriptor.head_sha.clone(),
                    BuildStatusCode::INQUEUE,
                    -1,
                )
                .await?;
        }

        Ok(())
    }
}
