//! Error taxonomy shared by every Tidewatch crate.

use thiserror::Error;

/// Result alias used across the workspace.
pub type Result<T> = std::result::Result<T, TidewatchError>;

#[derive(Debug, Error)]
pub enum TidewatchError {
    /// Invalid schedule or job definition. Raised at registration.
    #[error("schedule config error: {0}")]
    ScheduleConfig(String),

    /// A job handler or check failed.
    #[error("handler error: {0}")]
    Handler(String),

    /// A job handler exceeded its deadline.
    #[error("handler timed out after {secs}s")]
    Timeout { secs: u64 },

    /// The backing store is unreachable or rejected a write.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// An external collaborator (signal source, sink, hook, HTTP check) failed.
    #[error("collaborator error: {0}")]
    Collaborator(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl TidewatchError {
    /// Stable reason code for structured logs.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::ScheduleConfig(_) => "schedule_config",
            Self::Handler(_) => "handler_error",
            Self::Timeout { .. } => "timeout",
            Self::Persistence(_) => "persistence",
            Self::Collaborator(_) => "collaborator",
            Self::Config(_) => "config",
            Self::NotFound(_) => "not_found",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
        }
    }
}
