//! Core types for distributed execution

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub Uuid);

impl WorkerId {
    /// Create a new random worker ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", &self.0.to_string()[..8])
    }
}

/// Status of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerStatus {
    /// Worker is accepting tasks
    Active,
    /// Worker is shutting down and refuses new tasks
    Draining,
    /// Worker has shut down
    Removed,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerStatus::Active => write!(f, "Active"),
            WorkerStatus::Draining => write!(f, "Draining"),
            WorkerStatus::Removed => write!(f, "Removed"),
        }
    }
}

/// Lifecycle of a distributed query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryStatus {
    /// Accepted, tasks not launched yet
    Queued,
    Running,
    /// A task failed and the query is being rolled back
    Recovering,
    Finished,
    Failed,
    Cancelled,
}

impl QueryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueryStatus::Finished | QueryStatus::Failed | QueryStatus::Cancelled
        )
    }
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryStatus::Queued => write!(f, "QUEUED"),
            QueryStatus::Running => write!(f, "RUNNING"),
            QueryStatus::Recovering => write!(f, "RECOVERING"),
            QueryStatus::Finished => write!(f, "FINISHED"),
            QueryStatus::Failed => write!(f, "FAILED"),
            QueryStatus::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_id_display() {
        let id = WorkerId::new();
        let shown = id.to_string();
        assert!(shown.starts_with("worker-"));
        assert_eq!(shown.len(), "worker-".len() + 8);
    }

    #[test]
    fn test_query_status() {
        assert!(!QueryStatus::Recovering.is_terminal());
        assert!(QueryStatus::Cancelled.is_terminal());
        assert_eq!(QueryStatus::Running.to_string(), "RUNNING");
        assert_eq!(
            serde_json::to_string(&QueryStatus::Recovering).unwrap(),
            "\"RECOVERING\""
        );
    }
}
