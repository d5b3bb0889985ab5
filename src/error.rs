//! Error types for Marquee.

use crate::tasks::model::TaskStatus;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<libsql::Error> for DatabaseError {
    fn from(e: libsql::Error) -> Self {
        DatabaseError::Query(e.to_string())
    }
}

/// Errors returned by the task service facade.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task {id} not found")]
    NotFound { id: i64 },

    #[error("Task {id} cannot be cancelled in state {status}")]
    NotCancellable { id: i64, status: TaskStatus },

    #[error("Scheduled task {id} not found")]
    ScheduledNotFound { id: i64 },

    #[error("Invalid task definition: {0}")]
    Invalid(String),

    #[error("Task service is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Outcome of a handler execution that did not complete normally.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The execution context was cancelled. Recorded as `aborted`, not `failed`.
    #[error("Task was cancelled")]
    Cancelled,

    #[error("Invalid task body: {0}")]
    InvalidBody(String),

    #[error("{0}")]
    Failed(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HandlerError {
    /// Whether this error is the cancellation signal.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
