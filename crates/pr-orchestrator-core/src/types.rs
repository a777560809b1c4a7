use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ── Build status codes ───────────────────────────────────────────────────

/// Lifecycle code for a `Status` row. Negative values are internal states;
/// non-negative values are executor-reported terminal codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BuildStatusCode(pub i32);

impl BuildStatusCode {
    pub const INQUEUE: BuildStatusCode = BuildStatusCode(-1);
    pub const SCHEDULING: BuildStatusCode = BuildStatusCode(-2);
    pub const SCHEDULED: BuildStatusCode = BuildStatusCode(-3);
    pub const BUILDING: BuildStatusCode = BuildStatusCode(-4);
    pub const SUCCESS: BuildStatusCode = BuildStatusCode(0);
    pub const WARNINGS: BuildStatusCode = BuildStatusCode(1);
    pub const FAILURE: BuildStatusCode = BuildStatusCode(2);
    pub const SKIPPED: BuildStatusCode = BuildStatusCode(3);
    pub const EXCEPTION: BuildStatusCode = BuildStatusCode(4);
    pub const RETRY: BuildStatusCode = BuildStatusCode(5);

    pub fn is_terminal(self) -> bool {
        self.0 >= 0
    }

    /// String used in the JSON API's `status` field.
    pub fn as_api_str(self) -> &'static str {
        match self {
            Self::INQUEUE => "queued",
            Self::SCHEDULING => "scheduling",
            Self::SCHEDULED => "scheduled",
            Self::BUILDING => "building",
            Self::SUCCESS => "success",
            Self::WARNINGS => "warnings",
            Self::FAILURE => "failure",
            Self::SKIPPED => "skipped",
            Self::EXCEPTION => "exception",
            Self::RETRY => "retry",
            _ => "not_queued",
        }
    }

    /// `stop` is only offered while the build hasn't settled on success/warnings/failure.
    pub fn stop_available(self) -> bool {
        !matches!(self, Self::SUCCESS | Self::WARNINGS | Self::FAILURE)
    }
}

// ── PullRequest ───────────────────────────────────────────────────────────

/// A pull request as synchronized from the code host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub prid: i64,
    pub branch: String,
    pub author: String,
    pub assignee: String,
    pub head_user: String,
    pub head_repo: String,
    pub head_branch: String,
    pub head_sha: String,
    pub title: String,
    pub description: String,
    /// Smaller sorts earlier.
    pub priority: i64,
    /// `>= 0` is open/live, `< 0` is closed.
    pub status: i32,
    /// Opaque blob; the `persistent` sub-key survives a head-sha reset.
    pub info: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PullRequest {
    pub fn is_active(&self) -> bool {
        self.status >= 0
    }
}

/// What the Host Adapter hands back for one open PR.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrDescriptor {
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
    pub info: serde_json::Value,
}

// ── Builder ───────────────────────────────────────────────────────────────

/// A logical build matrix entry, mapping to one or more executor builder names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Builder {
    pub bid: i64,
    pub internal_name: String,
    pub name: String,
    /// Executor builder names this logical builder targets; first is canonical.
    pub builders: Vec<String>,
    pub order: i64,
    pub active: bool,
    pub is_perf: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Builder {
    pub fn canonical_name(&self) -> Option<&str> {
        self.builders.first().map(String::as_str)
    }
}

/// One entry of the builder matrix as loaded from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuilderConfig {
    pub internal_name: String,
    pub name: String,
    pub builders: Vec<String>,
    pub order: i64,
    pub is_perf: bool,
}

// ── Status ────────────────────────────────────────────────────────────────

/// A single build attempt for one `(prid, bid)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Status {
    pub sid: i64,
    pub prid: i64,
    pub bid: i64,
    pub head_sha: String,
    /// Executor build-request id; -1 when none.
    pub brid: i64,
    /// Executor build number; -1 when none.
    pub build_number: i64,
    pub status: BuildStatusCode,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Status {
    pub fn is_queued(&self) -> bool {
        self.status == BuildStatusCode::INQUEUE
    }
}

// ── Context / policy ──────────────────────────────────────────────────────

/// A regression-test filter extracted from a PR description (`check_regression=...`).
pub type RegressionFilter = String;

/// Executor-side source stamp descriptor passed through `SubmitBuildSet`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceStamp {
    pub repository: String,
    pub branch: String,
    pub revision: String,
}

/// Build properties handed to `SubmitBuildSet`, keyed by property name.
pub type BuildProperties = HashMap<String, serde_json::Value>;
