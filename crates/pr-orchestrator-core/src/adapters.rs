//! Contracts consumed by the core. Concrete implementations live in sibling
//! crates (`pr-orchestrator-host`, `pr-orchestrator-executor`), each behind an
//! `async_trait` so the core never depends on a specific host or executor.

use crate::types::{BuildProperties, PrDescriptor, SourceStamp};
use anyhow::Result;
use async_trait::async_trait;

/// `SetCommitStatus` payload.
#[derive(Debug, Clone)]
pub struct CommitStatus {
    pub state: String,
    pub description: String,
    pub target_url: String,
    pub context: String,
}

#[async_trait]
pub trait HostAdapter: Send + Sync {
    async fn list_open_pull_requests(&self) -> Result<Vec<PrDescriptor>>;

    /// Idempotent: implementations must read existing statuses first and skip
    /// the write when `(state, description, target_url)` already match for
    /// `context`.
    async fn set_commit_status(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
        status: CommitStatus,
    ) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub brid: i64,
}

#[derive(Debug, Clone)]
pub struct BuilderState {
    pub online: bool,
    pub pending_requests: Vec<PendingRequest>,
}

#[derive(Debug, Clone)]
pub struct SubmittedBuild {
    pub buildset_id: i64,
    pub brid: i64,
}

#[async_trait]
pub trait ExecutorAdapter: Send + Sync {
    async fn get_builder_state(&self, name: &str) -> Result<BuilderState>;

    #[allow(clippy::too_many_arguments)]
    async fn submit_build_set(
        &self,
        sourcestamps: &[SourceStamp],
        properties: &BuildProperties,
        builder_name: &str,
        reason: &str,
        external_id: &str,
    ) -> Result<SubmittedBuild>;

    async fn cancel_request(&self, brid: i64) -> Result<()>;

    async fn stop_build(&self, builder_name: &str, build_number: i64, reason: &str) -> Result<()>;

    async fn pending_requests(&self, builder_name: &str) -> Result<Vec<PendingRequest>>;
}
