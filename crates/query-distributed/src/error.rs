//! Error types for distributed execution

use thiserror::Error;

/// Errors raised while planning and scheduling distributed queries
#[derive(Error, Debug)]
pub enum DistributedError {
    /// The plan is malformed
    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    /// The query is not (or no longer) known to the executor
    #[error("Unknown query: {0}")]
    UnknownQuery(String),

    /// The worker pool is shutting down
    #[error("Worker not available: {0}")]
    WorkerUnavailable(String),

    /// Query engine error
    #[error("Query engine error: {0}")]
    QueryError(#[from] query_core::QueryError),
}

impl From<DistributedError> for query_core::QueryError {
    fn from(err: DistributedError) -> Self {
        match err {
            DistributedError::QueryError(inner) => inner,
            DistributedError::UnknownQuery(id) => query_core::QueryError::QueryNotFound(id),
            other => query_core::QueryError::ExecutionError(other.to_string()),
        }
    }
}

/// Result type for distributed operations
pub type Result<T> = std::result::Result<T, DistributedError>;
