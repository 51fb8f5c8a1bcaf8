use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Broad category of a failure, reported to clients alongside the code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorType {
    UserError,
    InsufficientResources,
    External,
    InternalError,
}

/// Stable reason codes. Numeric values are part of the client protocol and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    NotFound,
    Cancelled,
    IllegalState,
    Execution,
    ExceededMemoryLimit,
    TransientIo,
    RemoteTaskFailed,
    CheckpointFailed,
    Internal,
}

impl ErrorCode {
    /// Stable numeric code
    pub fn code(&self) -> u32 {
        match self {
            ErrorCode::NotFound => 1,
            ErrorCode::Cancelled => 2,
            ErrorCode::IllegalState => 3,
            ErrorCode::Execution => 4,
            ErrorCode::ExceededMemoryLimit => 0x0002_0000,
            ErrorCode::TransientIo => 0x0003_0000,
            ErrorCode::RemoteTaskFailed => 0x0003_0001,
            ErrorCode::CheckpointFailed => 0x0001_0001,
            ErrorCode::Internal => 0x0001_0000,
        }
    }

    /// Stable symbolic name
    pub fn name(&self) -> &'static str {
        match self {
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Cancelled => "USER_CANCELED",
            ErrorCode::IllegalState => "ILLEGAL_STATE",
            ErrorCode::Execution => "EXECUTION_ERROR",
            ErrorCode::ExceededMemoryLimit => "EXCEEDED_MEMORY_LIMIT",
            ErrorCode::TransientIo => "TRANSIENT_IO_ERROR",
            ErrorCode::RemoteTaskFailed => "REMOTE_TASK_FAILED",
            ErrorCode::CheckpointFailed => "CHECKPOINT_FAILED",
            ErrorCode::Internal => "GENERIC_INTERNAL_ERROR",
        }
    }

    pub fn error_type(&self) -> ErrorType {
        match self {
            ErrorCode::NotFound | ErrorCode::Cancelled | ErrorCode::Execution => {
                ErrorType::UserError
            }
            ErrorCode::ExceededMemoryLimit => ErrorType::InsufficientResources,
            ErrorCode::TransientIo | ErrorCode::RemoteTaskFailed => ErrorType::External,
            ErrorCode::IllegalState | ErrorCode::CheckpointFailed | ErrorCode::Internal => {
                ErrorType::InternalError
            }
        }
    }

    /// Whether a fetch that failed with this code may simply be tried again
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCode::TransientIo)
    }

    /// Whether a task failing with this code may be recovered by rolling the query back
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ErrorCode::TransientIo | ErrorCode::RemoteTaskFailed)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("Query not found: {0}")]
    QueryNotFound(String),

    #[error("Invalid result token {token} for query {query_id}")]
    InvalidToken { query_id: String, token: u64 },

    #[error("Query exceeded {context} memory limit of {limit} bytes (reserved {reserved} bytes)")]
    ExceededMemoryLimit {
        context: String,
        reserved: u64,
        limit: u64,
    },

    #[error("Transient IO error: {0}")]
    TransientIo(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Remote task failed: {0}")]
    RemoteTaskFailed(String),

    #[error("Stage {stage} does not support snapshots")]
    SnapshotUnsupported { stage: String },

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Query cancelled: {0}")]
    Cancelled(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Arrow error: {0}")]
    ArrowError(#[from] arrow::error::ArrowError),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("{message}")]
    Remote { code: ErrorCode, message: String },
}

impl QueryError {
    /// Reason code reported to clients and used for retry decisions
    pub fn error_code(&self) -> ErrorCode {
        match self {
            QueryError::QueryNotFound(_) | QueryError::InvalidToken { .. } => ErrorCode::NotFound,
            QueryError::ExceededMemoryLimit { .. } => ErrorCode::ExceededMemoryLimit,
            QueryError::TransientIo(_) | QueryError::IoError(_) => ErrorCode::TransientIo,
            QueryError::RemoteTaskFailed(_) => ErrorCode::RemoteTaskFailed,
            QueryError::SnapshotUnsupported { .. } | QueryError::Checkpoint(_) => {
                ErrorCode::CheckpointFailed
            }
            QueryError::IllegalState(_) => ErrorCode::IllegalState,
            QueryError::Cancelled(_) => ErrorCode::Cancelled,
            QueryError::ExecutionError(_) => ErrorCode::Execution,
            QueryError::ArrowError(_) | QueryError::SerializationError(_) => ErrorCode::Internal,
            QueryError::Remote { code, .. } => *code,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.error_code().is_retryable()
    }

    pub fn is_recoverable(&self) -> bool {
        self.error_code().is_recoverable()
    }

    /// Detached copy that keeps the reason code, for handing a failure to other tasks
    pub fn to_remote(&self) -> QueryError {
        QueryError::Remote {
            code: self.error_code(),
            message: self.to_string(),
        }
    }
}

impl From<serde_json::Error> for QueryError {
    fn from(err: serde_json::Error) -> Self {
        QueryError::SerializationError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, QueryError>;
