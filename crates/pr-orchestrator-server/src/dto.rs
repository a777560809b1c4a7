//! JSON shapes served by the HTTP API. Kept separate from the domain types in
//! `pr-orchestrator-core` so storage schema changes don't leak into the wire
//! format.

use pr_orchestrator_core::hooks::PolicyHooks;
use pr_orchestrator_core::params::extract_regression_filter;
use pr_orchestrator_core::types::{Builder, PullRequest, Status};
use serde::Serialize;
use std::collections::HashMap;

#[derive(Serialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(rename = "_httpCode")]
    pub http_code: u16,
}

#[derive(Serialize)]
pub struct BuilderSummary {
    pub id: i64,
    pub name: String,
    pub short_name: String,
    pub order: i64,
    pub status: &'static str,
}

impl From<&Builder> for BuilderSummary {
    fn from(b: &Builder) -> Self {
        Self {
            id: b.bid,
            name: b.name.clone(),
            short_name: b.internal_name.clone(),
            order: b.order,
            status: if b.active { "active" } else { "inactive" },
        }
    }
}

#[derive(Serialize)]
pub struct StatusDto {
    pub status: &'static str,
    pub created_at: i64,
    pub updated_at: i64,
    pub last_update: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_number: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operations: Option<Vec<&'static str>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operations_url: Option<String>,
}

impl StatusDto {
    /// `show_operations` is false for the public per-PR status view; builds
    /// that already reached a terminal success/warnings/failure can no
    /// longer be stopped.
    pub fn new(status: &Status, show_operations: bool, operations_url: Option<String>) -> Self {
        let now = chrono::Utc::now();
        let operations = show_operations.then(|| {
            let mut ops = vec!["restart"];
            if status.status.stop_available() {
                ops.push("stop");
            }
            ops
        });
        Self {
            status: status.status.as_api_str(),
            created_at: status.created_at.timestamp(),
            updated_at: status.updated_at.timestamp(),
            last_update: (now - status.updated_at).num_seconds().max(0),
            build_number: (status.build_number >= 0).then_some(status.build_number),
            build_url: None,
            operations,
            operations_url: show_operations.then_some(operations_url).flatten(),
        }
    }
}

#[derive(Serialize)]
pub struct PrInfoDto {
    pub id: i64,
    pub branch: String,
    pub author: String,
    pub assignee: String,
    pub head_user: String,
    pub head_repo: String,
    pub head_branch: String,
    pub head_sha: String,
    pub title: String,
    pub description: String,
    pub priority: i64,
    pub status: i32,
    pub info: serde_json::Value,
    pub created_at: i64,
    pub updated_at: i64,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url_perf_report: Option<String>,
    pub buildstatus: HashMap<i64, StatusDto>,
}

impl PrInfoDto {
    pub fn new(
        pr: &PullRequest,
        urlpath: &str,
        hooks: &dyn PolicyHooks,
        buildstatus: HashMap<i64, StatusDto>,
    ) -> Self {
        let url_perf_report = extract_regression_filter(&pr.description)
            .and_then(|_| hooks.get_perf_report_url(pr));
        Self {
            id: pr.prid,
            branch: pr.branch.clone(),
            author: pr.author.clone(),
            assignee: pr.assignee.clone(),
            head_user: pr.head_user.clone(),
            head_repo: pr.head_repo.clone(),
            head_branch: pr.head_branch.clone(),
            head_sha: pr.head_sha.clone(),
            title: pr.title.clone(),
            description: pr.description.clone(),
            priority: pr.priority,
            status: pr.status,
            info: pr.info.clone(),
            created_at: pr.created_at.timestamp(),
            updated_at: pr.updated_at.timestamp(),
            url: format!("/{urlpath}/{}", pr.prid),
            url_perf_report,
            buildstatus,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pr_orchestrator_core::types::BuildStatusCode;

    fn sample_status(code: BuildStatusCode) -> Status {
        let now = chrono::Utc::now();
        Status {
            sid: 1,
            prid: 10,
            bid: 2,
            head_sha: "aaa".into(),
            brid: 5,
            build_number: 7,
            status: code,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn operations_include_stop_while_non_terminal() {
        let dto = StatusDto::new(&sample_status(BuildStatusCode::BUILDING), true, None);
        assert_eq!(dto.operations, Some(vec!["restart", "stop"]));
    }

    #[test]
    fn operations_exclude_stop_once_successful() {
        let dto = StatusDto::new(&sample_status(BuildStatusCode::SUCCESS), true, None);
        assert_eq!(dto.operations, Some(vec!["restart"]));
    }

    #[test]
    fn operations_absent_for_public_view() {
        let dto = StatusDto::new(&sample_status(BuildStatusCode::BUILDING), false, None);
        assert!(dto.operations.is_none());
    }
}
