//! Deployment-specific policy hooks (mirrors the original `Context`'s abstract
//! methods). The defaults make every hook a no-op / "always eligible", which
//! is the right behavior for a deployment that hasn't customized anything.

use crate::types::{Builder, BuildProperties, BuildStatusCode, PullRequest, SourceStamp};
use async_trait::async_trait;

#[async_trait]
pub trait PolicyHooks: Send + Sync {
    /// Restricts which builders auto-enqueue for a PR. `None` means "all
    /// active builders are eligible".
    fn get_list_of_automatic_builders(&self, _pr: &PullRequest) -> Option<Vec<String>> {
        None
    }

    /// Populates build properties and sourcestamps for a scheduling attempt.
    /// Returning `None` fails the attempt (Status -> FAILURE).
    fn get_build_properties(
        &self,
        pr: &PullRequest,
        _builder: &Builder,
    ) -> Option<(BuildProperties, Vec<SourceStamp>)> {
        let stamp = SourceStamp {
            repository: pr.head_repo.clone(),
            branch: pr.head_branch.clone(),
            revision: pr.head_sha.clone(),
        };
        Some((BuildProperties::new(), vec![stamp]))
    }

    /// URL of the performance-regression report for a PR that opted in via
    /// a `check_regression` filter. Only consulted once the filter is known
    /// to be present; `None` means no report link is configured.
    fn get_perf_report_url(&self, _pr: &PullRequest) -> Option<String> {
        None
    }

    async fn on_update_pull_request(&self, _prid: i64) {}

    async fn on_pull_request_build_finished(
        &self,
        _prid: i64,
        _bid: i64,
        _builder_name: &str,
        _build_number: i64,
        _result: BuildStatusCode,
    ) {
    }
}

/// No customization; every builder is automatic and every scheduling attempt
/// is approved.
pub struct DefaultPolicyHooks;

impl PolicyHooks for DefaultPolicyHooks {}
