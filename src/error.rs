//! Error types for Resumr
//!
//! Centralized error handling using thiserror. Task-level failures live in
//! [`TaskError`], which is what handlers return and what task callers see;
//! everything else is a [`ResumrError`].

use std::time::Duration;

use thiserror::Error;

/// All crate-level errors that can occur in Resumr
#[derive(Debug, Error)]
pub enum ResumrError {
    /// Task not found in the live queue
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Service id is not registered with the scheduler
    #[error("Unknown service: {0}")]
    UnknownService(String),

    /// Invalid state transition or operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Storage/persistence error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("Config error: {0}")]
    Config(String),

    /// The scheduler actor is no longer running
    #[error("Scheduler stopped")]
    SchedulerStopped,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for ResumrError {
    fn from(err: rusqlite::Error) -> Self {
        ResumrError::Storage(err.to_string())
    }
}

/// Result type alias for Resumr operations
pub type Result<T> = std::result::Result<T, ResumrError>;

/// Classified outcome of a failed task attempt.
///
/// The first three variants are what handlers return; the scheduler routes
/// them through the retry policy. `Cancelled` and `Shutdown` are only ever
/// observed by callers waiting on a [`crate::scheduler::TaskHandle`].
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TaskError {
    /// The service is out of capacity; the task itself is fine.
    #[error("Rate limited: {message}")]
    RateLimited {
        /// Epoch millis at which the provider expects capacity again
        reset_time: Option<i64>,
        message: String,
    },

    /// Network failure, 5xx, timeout - worth retrying
    #[error("Transient error: {0}")]
    Transient(String),

    /// Malformed payload, missing configuration, unsupported task type
    #[error("Fatal error: {0}")]
    Fatal(String),

    /// Task was cancelled before reaching a terminal state
    #[error("Task cancelled")]
    Cancelled,

    /// Scheduler shut down while the task was still live
    #[error("Scheduler shut down before the task finished")]
    Shutdown,
}

impl TaskError {
    /// Build a rate-limit error from a seconds-until-reset hint.
    pub fn rate_limited_for(retry_after: Option<Duration>, now: i64, message: impl Into<String>) -> Self {
        TaskError::RateLimited {
            reset_time: retry_after.map(|d| now + d.as_millis() as i64),
            message: message.into(),
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, TaskError::RateLimited { .. })
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskError::RateLimited { .. } | TaskError::Transient(_))
    }
}
