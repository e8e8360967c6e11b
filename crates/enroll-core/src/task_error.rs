//! Task execution error types
//!
//! Handlers classify their own failures: a retryable error is rescheduled by
//! the queue until the envelope's retry budget runs out, a permanent error
//! fails the task immediately regardless of remaining budget.

use std::fmt;

use crate::models::TaskOutcome;

#[derive(Debug)]
pub struct TaskError {
    inner: anyhow::Error,
    retryable: bool,
}

impl TaskError {
    /// Transient condition (storage or mail transport unavailable, timeout).
    pub fn retryable(err: impl Into<anyhow::Error>) -> Self {
        Self {
            inner: err.into(),
            retryable: true,
        }
    }

    /// Non-recoverable condition: malformed payload, unknown task type,
    /// referenced user gone, recipient rejected.
    pub fn permanent(err: impl Into<anyhow::Error>) -> Self {
        Self {
            inner: err.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// Outcome reported to the queue for this error.
    pub fn outcome(&self) -> TaskOutcome {
        let reason = format!("{:#}", self.inner);
        if self.retryable {
            TaskOutcome::Retry(reason)
        } else {
            TaskOutcome::Permanent(reason)
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.inner)
    }
}

impl std::error::Error for TaskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

impl From<anyhow::Error> for TaskError {
    /// Unclassified errors are treated as transient.
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(err)
    }
}

/// Extension trait for classifying a `Result`'s error.
pub trait TaskResultExt<T> {
    fn permanent(self) -> Result<T, TaskError>;
    fn retryable(self) -> Result<T, TaskError>;
}

impl<T, E: Into<anyhow::Error>> TaskResultExt<T> for Result<T, E> {
    fn permanent(self) -> Result<T, TaskError> {
        self.map_err(TaskError::permanent)
    }

    fn retryable(self) -> Result<T, TaskError> {
        self.map_err(TaskError::retryable)
    }
}
