//! Query manager contract
//!
//! The statement resource never talks to the executor directly; everything
//! it needs about a query goes through [`QueryManager`]. Every method fails
//! with [`QueryError::QueryNotFound`] for a query the manager does not track.

use crate::session::SessionUpdate;
use query_core::{ErrorCode, QueryError, QueryId, Result};
use query_distributed::{ExecutionStats, QueryStatus, RetryPolicy, RootOutput};
use query_executor::SnapshotReporter;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Client session a query was submitted with
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Session {
    pub user: String,
    pub catalog: Option<String>,
    pub schema: Option<String>,
    pub properties: BTreeMap<String, String>,
    /// Retries of result fetches
    pub retry_policy: RetryPolicy,
}

impl Session {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            ..Self::default()
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }
}

/// Why a query failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureInfo {
    pub code: ErrorCode,
    pub message: String,
}

impl FailureInfo {
    pub fn from_error(error: &QueryError) -> Self {
        Self {
            code: error.error_code(),
            message: error.to_string(),
        }
    }
}

/// What the result protocol needs to know about a query right now
#[derive(Clone)]
pub struct QueryInfo {
    pub query_id: QueryId,
    pub state: QueryStatus,
    /// Root buffers of the current attempt; `None` before the first launch
    pub root: Option<RootOutput>,
    /// Reporter for the result sink, bound to the current attempt
    pub sink_reporter: Arc<dyn SnapshotReporter>,
    pub failure: Option<FailureInfo>,
    pub stats: ExecutionStats,
}

impl fmt::Debug for QueryInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryInfo")
            .field("query_id", &self.query_id)
            .field("state", &self.state)
            .field("epoch", &self.root.as_ref().map(|root| root.epoch))
            .field("failure", &self.failure)
            .finish()
    }
}

pub trait QueryManager: Send + Sync {
    fn query_state(&self, query_id: QueryId) -> Result<QueryStatus>;

    fn is_query_slug_valid(&self, query_id: QueryId, slug: &str) -> Result<bool>;

    fn query_session(&self, query_id: QueryId) -> Result<Session>;

    fn cancel_query(&self, query_id: QueryId) -> Result<()>;

    fn query_info(&self, query_id: QueryId) -> Result<QueryInfo>;

    /// Session updates recorded since the last call, oldest first
    fn take_session_updates(&self, query_id: QueryId) -> Result<Vec<SessionUpdate>>;
}
