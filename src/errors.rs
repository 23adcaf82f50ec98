//! Structured error types for agenterm
//!
//! Uses thiserror for ergonomic error definitions with automatic Display
//! and Error trait implementations. Library code returns `color_eyre::Result`
//! at module boundaries; `AgentermError` is used where a caller needs to
//! match on the specific kind (orchestrator tool dispatch, the websocket
//! error frame, HTTP status mapping).

use thiserror::Error;

/// All possible errors in agenterm, one variant per error kind in the
/// external error-handling contract.
#[derive(Error, Debug)]
pub enum AgentermError {
    /// Input failed schema or constraint validation.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Referenced entity id does not resolve.
    #[error("not found: {kind} '{id}'")]
    NotFound { kind: &'static str, id: String },

    /// Invariant violation: duplicate session, already-merged worktree, etc.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A mutating tool call requires explicit approval before it may run.
    #[error("approval required: {reason}")]
    ApprovalRequired { reason: String },

    /// Tool is not in the current stage's whitelist.
    #[error("tool '{tool}' not allowed in stage '{stage}': {reason}")]
    StageToolNotAllowed {
        stage: String,
        tool: String,
        reason: String,
    },

    /// The orchestrator's global_max_parallel cap is already saturated.
    #[error("parallelism cap reached ({current}/{max})")]
    ParallelismCapReached { current: usize, max: usize },

    /// Automation refused to act because a human is attached to the session.
    #[error("session '{0}' is under human takeover")]
    HumanTakeoverBlock(String),

    /// git/tmux/PTY child process failed.
    #[error("subprocess '{command}' failed: {detail}")]
    SubprocessError { command: String, detail: String },

    /// LLM HTTP transport failed.
    #[error("transport error: {0}")]
    TransportError(String),

    /// Socket connection or I/O error.
    #[error("socket error: {0}")]
    SocketError(#[from] std::io::Error),

    /// JSON parsing/serialization error.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Persistent store error.
    #[error("store error: {0}")]
    StoreError(String),

    /// Invariant breach not otherwise classified.
    #[error("internal error: {0}")]
    InternalError(String),
}

/// Convenience Result type using AgentermError.
pub type Result<T> = std::result::Result<T, AgentermError>;

impl From<&'static str> for AgentermError {
    fn from(s: &'static str) -> Self {
        AgentermError::InternalError(s.to_string())
    }
}

impl From<rusqlite::Error> for AgentermError {
    fn from(e: rusqlite::Error) -> Self {
        AgentermError::StoreError(e.to_string())
    }
}
