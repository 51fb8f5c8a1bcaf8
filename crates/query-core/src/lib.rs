//! Shared building blocks for the query engine: identifiers, the error
//! taxonomy with stable reason codes, and Arrow IPC batch encoding.

pub mod error;
pub mod ipc;
pub mod types;

pub use error::{ErrorCode, ErrorType, QueryError, Result};
pub use ipc::SerializedBatch;
pub use types::*;
