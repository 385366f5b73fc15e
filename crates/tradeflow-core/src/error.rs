//! Error taxonomy shared by every Tradeflow crate.

use thiserror::Error;

/// Convenience alias used across the workspace.
pub type Result<T> = std::result::Result<T, TradeflowError>;

#[derive(Debug, Error)]
pub enum TradeflowError {
    /// Malformed cron expression or interval, raised at registration.
    #[error("Schedule error: {0}")]
    Schedule(String),

    /// A task body did not finish within its allotted time.
    #[error("Task '{task_id}' timed out after {after_ms}ms")]
    Timeout { task_id: String, after_ms: u64 },

    /// Opaque error returned (or panicked) by a task body.
    #[error("Task '{task_id}' failed: {message}")]
    Task { task_id: String, message: String },

    /// State snapshot I/O or (de)serialization failure.
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Config error: {0}")]
    Config(String),

    /// Lifecycle operation not allowed in the current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TradeflowError {
    /// Wrap a task-thrown error with the id of the task that produced it.
    pub fn task(task_id: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Task {
            task_id: task_id.into(),
            message: message.to_string(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_display() {
        let err = TradeflowError::Timeout {
            task_id: "poll".into(),
            after_ms: 250,
        };
        assert_eq!(err.to_string(), "Task 'poll' timed out after 250ms");
        assert!(err.is_timeout());
    }

    #[test]
    fn test_task_wraps_id() {
        let err = TradeflowError::task("sync-orders", "exchange unreachable");
        assert_eq!(err.to_string(), "Task 'sync-orders' failed: exchange unreachable");
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: TradeflowError = io.into();
        assert!(matches!(err, TradeflowError::Io(_)));
    }
}
