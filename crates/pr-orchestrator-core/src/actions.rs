//! User actions: the mutating operations the JSON API exposes.

use crate::db::DbHandle;
use crate::error::OrchestratorError;
use crate::params::extract_regression_filter;
use crate::scheduler::Scheduler;
use crate::types::{BuildStatusCode, Status};
use chrono::{DateTime, Utc};

/// Cancels any existing Status for `(prid, bid)`, then enqueues a fresh
/// `INQUEUE` one. Rejects perf builders with no regression filter in the
/// current PR description.
pub async fn retry_build(
    db: &DbHandle,
    scheduler: &Scheduler,
    prid: i64,
    bid: i64,
    expected_updated_at: Option<DateTime<Utc>>,
) -> Result<Status, OrchestratorError> {
    if let Some(existing) = db.get_active_status(prid, bid).await? {
        let mut cancelled = scheduler.cancel_build(existing, expected_updated_at).await?;
        cancelled.active = false;
        db.update_status(cancelled).await?;
    }

    let pr = db
        .get_pr(prid)
        .await?
        .ok_or_else(|| OrchestratorError::NotFound(format!("pull request {prid}")))?;
    let builder = db
        .get_builder(bid)
        .await?
        .ok_or_else(|| OrchestratorError::NotFound(format!("builder {bid}")))?;

    if builder.is_perf && extract_regression_filter(&pr.description).is_none() {
        return Err(OrchestratorError::BadRequest(
            "performance builder requires a check_regression filter".into(),
        ));
    }

    db.insert_status(prid, bid, pr.head_sha, BuildStatusCode::INQUEUE, -1)
        .await
}

/// Requires `expected_updated_at`: there is no force-stop without
/// proving the caller saw the current state.
pub async fn stop_build(
    db: &DbHandle,
    scheduler: &Scheduler,
    prid: i64,
    bid: i64,
    expected_updated_at: DateTime<Utc>,
) -> Result<Status, OrchestratorError> {
    let active = db
        .get_active_status(prid, bid)
        .await?
        .ok_or_else(|| OrchestratorError::NotFound(format!("no active status for pr {prid}")))?;
    scheduler.cancel_build(active, Some(expected_updated_at)).await
}

/// Reserved hook: wired end-to-end but not
/// implemented, since no grounding exists for what "revert a bad merge"
/// should actually do beyond the action's name.
pub async fn revert_build(
    _db: &DbHandle,
    _prid: i64,
    _bid: i64,
    _expected_updated_at: DateTime<Utc>,
) -> Result<Status, OrchestratorError> {
    Err(OrchestratorError::BadRequest("revert is not supported".into()))
}
