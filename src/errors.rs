//! Structured error types for claw-town
//!
//! Uses thiserror for ergonomic error definitions with automatic Display
//! and Error trait implementations. Each component gets its own variant
//! family so call sites can match on error kind.

use thiserror::Error;

/// All possible errors in claw-town
#[derive(Error, Debug)]
pub enum ClawTownError {
    /// No task exists with the given T-number
    #[error("Task {0} not found")]
    TaskNotFound(String),

    /// Value failed validation; `allowed` lists the accepted values when known
    #[error("Invalid {field}: '{value}'. Expected one of: {allowed}")]
    Validation {
        field: &'static str,
        value: String,
        allowed: String,
    },

    /// Pipeline claim/release/reject attempted from the wrong stage or by the wrong role
    #[error("{0}")]
    PipelineViolation(String),

    /// Task graph has no root_task configured
    #[error("No root_task configured in tasks.json")]
    NoRootTask,

    /// An agent is not registered
    #[error("Agent '{0}' not registered")]
    AgentNotFound(String),

    /// A message on the outbox/inbox could not be parsed
    #[error("Malformed message file {path}: {reason}")]
    MalformedMessage { path: String, reason: String },

    /// Advisory lock could not be acquired within the retry budget
    #[error("Lock contention on {0}")]
    LockContention(String),

    /// Underlying filesystem/I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing/serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A subprocess (tmux, etc.) exited non-zero or timed out
    #[error("Process adapter error: {0}")]
    ProcessAdapter(String),
}

/// Convenience Result type using ClawTownError
pub type Result<T> = std::result::Result<T, ClawTownError>;
