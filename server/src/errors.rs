//! Server-wide error type. Every user-visible method resolves to either a
//! structured success payload or one of these kinds, serialised as
//! `{kind, message, details?}` by the RPC layer.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    /// Invalid or unreadable configuration; defaults are applied, non-fatal.
    #[error("configuration error: {0}")]
    Config(String),

    /// Traversal attempt, absolute path, or path outside the project root.
    #[error("invalid path: {0}")]
    Path(String),

    /// Operation attempted before `set_project`.
    #[error("project path not set — call set_project first")]
    NotConfigured,

    /// Persistent store failed to initialise; caller falls back to memory.
    #[error("storage backend unavailable: {0}")]
    BackendUnavailable(String),

    /// External search tool returned an unexpected exit code.
    #[error("search tool '{tool}' failed: {stderr}")]
    SearchFailed { tool: String, stderr: String },

    /// Child-process deadline expired; partial output is discarded.
    #[error("'{tool}' timed out after {seconds}s")]
    Timeout { tool: String, seconds: u64 },

    /// Cooperative cancel; cleanup hooks have already run.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// A refresh is already in flight for this project.
    #[error("a refresh is already running for this project")]
    AlreadyRunning,

    /// Persistence step failed; the previously persisted state is intact.
    #[error("refresh failed: {0}")]
    RefreshFailed(String),

    /// Programming error (foreign-key violation, malformed diff); not
    /// retryable.
    #[error("integrity error: {0}")]
    Integrity(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Stable machine-readable kind for RPC error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerError::Config(_) => "config_error",
            ServerError::Path(_) => "path_error",
            ServerError::NotConfigured => "not_configured",
            ServerError::BackendUnavailable(_) => "backend_unavailable",
            ServerError::SearchFailed { .. } => "search_failed",
            ServerError::Timeout { .. } => "timeout",
            ServerError::Cancelled(_) => "cancelled",
            ServerError::AlreadyRunning => "already_running",
            ServerError::RefreshFailed(_) => "refresh_failed",
            ServerError::Integrity(_) => "integrity_error",
            ServerError::Io(_) => "io_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;
