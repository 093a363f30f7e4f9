use thiserror::Error;

/// Classified failure of a task handler, switched on at the worker boundary.
///
/// Only `Transient` failures are retried; every other kind is terminal for
/// the task that produced it and differs only in how it is surfaced.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Infrastructure hiccup (DB deadlock, KV timeout, network). Retried up
    /// to the configured bound, then dropped with a fatal-failure log.
    #[error("transient failure: {0}")]
    Transient(#[from] anyhow::Error),

    /// A referenced entity no longer exists. Logged at info and dropped.
    #[error("{0}")]
    DataMissing(String),

    /// A scheduled event no longer matches current state. Dropped silently.
    #[error("stale scheduled event")]
    Stale,

    /// The failure was caused by user-supplied input (e.g. an invalid
    /// contact query). Surfaced on the owning record, never escalated.
    #[error("invalid input: {0}")]
    UserInput(String),

    /// A state that should be impossible. Logged at error and dropped
    /// without crashing the worker.
    #[error("invariant violation: {0}")]
    Invariant(String),
}

impl TaskError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskError::Transient(_))
    }
}

impl From<sqlx::Error> for TaskError {
    fn from(err: sqlx::Error) -> Self {
        TaskError::Transient(err.into())
    }
}

impl From<redis::RedisError> for TaskError {
    fn from(err: redis::RedisError) -> Self {
        TaskError::Transient(err.into())
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        TaskError::Transient(err.into())
    }
}

pub type TaskResult = Result<(), TaskError>;
