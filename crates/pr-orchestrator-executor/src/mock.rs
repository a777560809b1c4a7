//! In-process executor stand-in. Holds one "online" builder roster and an
//! in-memory queue of pending requests per builder name; `submit_build_set`
//! immediately starts a build and assigns it a build number. No real CI
//! system is driven — deployments wire a real one in its place.

use anyhow::Result;
use async_trait::async_trait;
use pr_orchestrator_core::adapters::{BuilderState, ExecutorAdapter, PendingRequest, SubmittedBuild};
use pr_orchestrator_core::types::{BuildProperties, SourceStamp};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::Mutex;

struct BuilderQueue {
    online: bool,
    pending: Vec<PendingRequest>,
}

pub struct MockExecutorAdapter {
    next_brid: AtomicI64,
    next_build_number: AtomicI64,
    builders: Mutex<HashMap<String, BuilderQueue>>,
}

impl Default for MockExecutorAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MockExecutorAdapter {
    pub fn new() -> Self {
        Self {
            next_brid: AtomicI64::new(1),
            next_build_number: AtomicI64::new(1),
            builders: Mutex::new(HashMap::new()),
        }
    }

    /// Test/ops hook: mark a builder online (idle) or offline.
    pub async fn set_online(&self, name: &str, online: bool) {
        let mut builders = self.builders.lock().await;
        builders
            .entry(name.to_string())
            .or_insert_with(|| BuilderQueue { online: true, pending: Vec::new() })
            .online = online;
    }
}

#[async_trait]
impl ExecutorAdapter for MockExecutorAdapter {
    async fn get_builder_state(&self, name: &str) -> Result<BuilderState> {
        let builders = self.builders.lock().await;
        match builders.get(name) {
            Some(q) => Ok(BuilderState {
                online: q.online,
                pending_requests: q.pending.clone(),
            }),
            None => Ok(BuilderState {
                online: true,
                pending_requests: Vec::new(),
            }),
        }
    }

    async fn submit_build_set(
        &self,
        _sourcestamps: &[SourceStamp],
        _properties: &BuildProperties,
        builder_name: &str,
        _reason: &str,
        _external_id: &str,
    ) -> Result<SubmittedBuild> {
        let brid = self.next_brid.fetch_add(1, Ordering::SeqCst);
        let mut builders = self.builders.lock().await;
        builders
            .entry(builder_name.to_string())
            .or_insert_with(|| BuilderQueue { online: true, pending: Vec::new() })
            .pending
            .push(PendingRequest { brid });
        Ok(SubmittedBuild { buildset_id: brid, brid })
    }

    async fn cancel_request(&self, brid: i64) -> Result<()> {
        let mut builders = self.builders.lock().await;
        for queue in builders.values_mut() {
            queue.pending.retain(|r| r.brid != brid);
        }
        Ok(())
    }

    async fn stop_build(&self, _builder_name: &str, _build_number: i64, _reason: &str) -> Result<()> {
        Ok(())
    }

    async fn pending_requests(&self, builder_name: &str) -> Result<Vec<PendingRequest>> {
        let builders = self.builders.lock().await;
        Ok(builders
            .get(builder_name)
            .map(|q| q.pending.clone())
            .unwrap_or_default())
    }
}

/// Assigns the next build number a started build would receive; exposed so
/// the status-receiver wiring glue can simulate `buildStarted` callbacks in
/// tests without reaching into executor internals.
pub fn next_build_number(adapter: &MockExecutorAdapter) -> i64 {
    adapter.next_build_number.fetch_add(1, Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn submit_build_set_queues_a_pending_request() {
        let adapter = MockExecutorAdapter::new();
        let submitted = adapter
            .submit_build_set(&[], &BuildProperties::new(), "b-linux", "test", "PR #1")
            .await
            .unwrap();
        let state = adapter.get_builder_state("b-linux").await.unwrap();
        assert_eq!(state.pending_requests.len(), 1);
        assert_eq!(state.pending_requests[0].brid, submitted.brid);
    }

    #[tokio::test]
    async fn cancel_request_removes_matching_pending_entry() {
        let adapter = MockExecutorAdapter::new();
        let submitted = adapter
            .submit_build_set(&[], &BuildProperties::new(), "b-linux", "test", "PR #1")
            .await
            .unwrap();
        adapter.cancel_request(submitted.brid).await.unwrap();
        let state = adapter.get_builder_state("b-linux").await.unwrap();
        assert!(state.pending_requests.is_empty());
    }

    #[tokio::test]
    async fn offline_builder_reports_not_online() {
        let adapter = MockExecutorAdapter::new();
        adapter.set_online("b-linux", false).await;
        let state = adapter.get_builder_state("b-linux").await.unwrap();
        assert!(!state.online);
    }
}
