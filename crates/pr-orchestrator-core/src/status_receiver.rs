//! Status Receiver: translates executor callbacks into Status
//! transitions. Every callback first filters on the `pullrequest_service`
//! property matching this deployment's name (another PR service may share
//! the same executor), then, where a Status is found, on `head_sha` matching
//! the row's recorded value (a mismatch means the callback belongs to a
//! superseded Status).

use crate::adapters::ExecutorAdapter;
use crate::db::DbHandle;
use crate::hooks::PolicyHooks;
use crate::scheduler::Scheduler;
use crate::types::BuildStatusCode;
use std::sync::Arc;
use tracing::{debug, error, info};

pub struct StatusReceiver {
    db: DbHandle,
    executor: Arc<dyn ExecutorAdapter>,
    scheduler: Arc<Scheduler>,
    hooks: Arc<dyn PolicyHooks>,
    service_name: String,
}

impl StatusReceiver {
    pub fn new(
        db: DbHandle,
        executor: Arc<dyn ExecutorAdapter>,
        scheduler: Arc<Scheduler>,
        hooks: Arc<dyn PolicyHooks>,
        service_name: String,
    ) -> Self {
        Self {
            db,
            executor,
            scheduler,
            hooks,
            service_name,
        }
    }

    fn accepts(&self, pullrequest_service: &str) -> bool {
        if pullrequest_service != self.service_name {
            debug!(pullrequest_service, "ignoring callback for another PR service");
            return false;
        }
        true
    }

    pub async fn builder_changed_state(&self, builder_name: &str, state: &str) {
        if state == "idle" {
            self.scheduler.try_schedule_for_builder(builder_name).await;
        }
    }

    pub async fn request_submitted(
        &self,
        pullrequest_service: &str,
        prid: i64,
        bid: i64,
        brid: i64,
        head_sha: &str,
    ) {
        if !self.accepts(pullrequest_service) {
            return;
        }
        match self.db.get_status_by_request(prid, bid, brid).await {
            Ok(None) => {
                if let Err(e) = self
                    .db
                    .insert_status(prid, bid, head_sha.to_string(), BuildStatusCode::SCHEDULED, brid)
                    .await
                {
                    error!(prid, bid, brid, error = %e, "requestSubmitted: insert failed");
                }
            }
            Ok(Some(status)) if status.head_sha != head_sha => {
                debug!(prid, bid, brid, "requestSubmitted: head_sha mismatch, ignoring");
            }
            Ok(Some(mut status)) if status.active => {
                status.status = BuildStatusCode::SCHEDULED;
                if let Err(e) = self.db.update_status(status).await {
                    error!(prid, bid, brid, error = %e, "requestSubmitted: update failed");
                }
            }
            Ok(Some(status)) => {
                if let Err(e) = self.executor.cancel_request(status.brid).await {
                    error!(prid, bid, brid, error = %e, "requestSubmitted: cancel_request failed");
                }
            }
            Err(e) => error!(prid, bid, brid, error = %e, "requestSubmitted: lookup failed"),
        }
    }

    pub async fn build_started(
        &self,
        pullrequest_service: &str,
        prid: i64,
        bid: i64,
        builder_name: &str,
        request_id: i64,
        build_number: i64,
        head_sha: &str,
    ) {
        if !self.accepts(pullrequest_service) {
            return;
        }
        let status = match self.db.get_status_by_request(prid, bid, request_id).await {
            Ok(Some(s)) => s,
            Ok(None) => {
                debug!(prid, bid, request_id, "buildStarted: no matching status");
                return;
            }
            Err(e) => {
                error!(prid, bid, request_id, error = %e, "buildStarted: lookup failed");
                return;
            }
        };
        if status.head_sha != head_sha {
            debug!(prid, bid, "buildStarted: head_sha mismatch, ignoring");
            return;
        }
        let was_active = status.active;
        let mut status = status;
        status.status = BuildStatusCode::BUILDING;
        status.build_number = build_number;
        if let Err(e) = self.db.update_status(status).await {
            error!(prid, bid, error = %e, "buildStarted: update failed");
            return;
        }
        if !was_active {
            if let Err(e) = self
                .executor
                .stop_build(builder_name, build_number, "canceled by PR service (run inactive)")
                .await
            {
                error!(prid, bid, error = %e, "buildStarted: stop_build failed");
            }
        }
    }

    pub async fn build_finished(
        &self,
        pullrequest_service: &str,
        prid: i64,
        bid: i64,
        builder_name: &str,
        build_number: i64,
        result: BuildStatusCode,
        head_sha: &str,
    ) {
        if !self.accepts(pullrequest_service) {
            return;
        }
        let status = match self.db.get_status_by_build_number(prid, bid, build_number).await {
            Ok(Some(s)) => s,
            Ok(None) => {
                debug!(prid, bid, build_number, "buildFinished: no matching status");
                return;
            }
            Err(e) => {
                error!(prid, bid, build_number, error = %e, "buildFinished: lookup failed");
                return;
            }
        };
        if status.head_sha != head_sha {
            debug!(prid, bid, "buildFinished: head_sha mismatch, ignoring");
            return;
        }
        let mut status = status;
        status.status = result;
        if let Err(e) = self.db.update_status(status).await {
            error!(prid, bid, error = %e, "buildFinished: update failed");
            return;
        }
        info!(prid, bid, builder_name, ?result, "build finished");
        self.hooks
            .on_pull_request_build_finished(prid, bid, builder_name, build_number, result)
            .await;
    }

    pub async fn request_cancelled(&self, pullrequest_service: &str, prid: i64, bid: i64) {
        if !self.accepts(pullrequest_service) {
            return;
        }
        match self.db.get_active_status(prid, bid).await {
            Ok(Some(mut status)) => {
                status.status = BuildStatusCode::INQUEUE;
                status.build_number = -1;
                status.brid = -1;
                if let Err(e) = self.db.update_status(status).await {
                    error!(prid, bid, error = %e, "requestCancelled: re-queue failed");
                }
            }
            Ok(None) => debug!(prid, bid, "requestCancelled: no active status"),
            Err(e) => error!(prid, bid, error = %e, "requestCancelled: lookup failed"),
        }
    }
}
