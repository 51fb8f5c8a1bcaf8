//! Identifiers shared across the engine

use crate::error::{QueryError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryId(pub Uuid);

impl QueryId {
    /// Create a new random query ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for QueryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for QueryId {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(QueryId)
            .map_err(|_| QueryError::QueryNotFound(s.to_string()))
    }
}

/// A pipeline shape that is instantiated once per partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FragmentId(pub u32);

impl fmt::Display for FragmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stage identifier, unique within a query plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StageId(pub u32);

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionId(pub u32);

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Snapshot identifier, strictly increasing per query and starting at 1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotId(pub u64);

impl SnapshotId {
    pub fn next(self) -> Self {
        SnapshotId(self.0 + 1)
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a task runs within a query: one partition of one fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskLocation {
    pub fragment: FragmentId,
    pub partition: PartitionId,
}

impl TaskLocation {
    pub fn new(fragment: FragmentId, partition: PartitionId) -> Self {
        Self {
            fragment,
            partition,
        }
    }

    /// The client-facing result consumer, which takes part in snapshots without running stages
    pub fn result_sink() -> Self {
        Self::new(FragmentId(u32::MAX), PartitionId(0))
    }

    pub fn is_result_sink(&self) -> bool {
        self.fragment.0 == u32::MAX
    }
}

impl fmt::Display for TaskLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_result_sink() {
            write!(f, "result-sink")
        } else {
            write!(f, "{}.{}", self.fragment, self.partition)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_id_round_trips_through_text() {
        let id = QueryId::new();
        let parsed: QueryId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<QueryId>().is_err());
    }

    #[test]
    fn test_task_location_display() {
        let location = TaskLocation::new(FragmentId(2), PartitionId(3));
        assert_eq!(location.to_string(), "2.3");
        assert_eq!(TaskLocation::result_sink().to_string(), "result-sink");
        assert!(!location.is_result_sink());
    }

    #[test]
    fn test_snapshot_ids_increase() {
        assert!(SnapshotId(1).next() > SnapshotId(1));
    }
}
