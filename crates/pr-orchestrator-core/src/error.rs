use thiserror::Error;

/// Errors that cross the boundary between the core and the JSON API, where the
/// HTTP layer needs to pattern-match the variant to pick a status code.
/// Everything below this boundary (background loops, adapters) uses `anyhow`.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// Optimistic-concurrency mismatch: the caller's `updated_at` is stale.
    #[error("needs update: {0}")]
    NeedUpdate(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("host adapter unavailable: {0}")]
    HostUnavailable(String),

    #[error("executor adapter unavailable: {0}")]
    ExecutorUnavailable(String),

    #[error("transient storage error: {0}")]
    TransientDb(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl OrchestratorError {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::Forbidden(_) => 403,
            Self::Conflict(_) => 409,
            Self::NeedUpdate(_) => 410,
            Self::BadRequest(_) => 400,
            Self::HostUnavailable(_)
            | Self::ExecutorUnavailable(_)
            | Self::TransientDb(_)
            | Self::Config(_) => 500,
        }
    }
}

impl From<rusqlite::Error> for OrchestratorError {
    fn from(e: rusqlite::Error) -> Self {
        Self::TransientDb(e.to_string())
    }
}
