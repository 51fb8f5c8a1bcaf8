//! Fault tolerance for distributed execution
//!
//! Decides how a query reacts to a failed task: roll back to the latest
//! complete snapshot, restart from scratch, or give up.

use crate::checkpoint::{CheckpointCoordinator, RecoveryPlan};
use dashmap::DashMap;
use query_core::{ErrorCode, QueryError, QueryId, SnapshotId, TaskLocation};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Fault tolerance manager
pub struct FaultManager {
    /// Configuration
    config: FaultConfig,
    /// Failure history per query
    queries: DashMap<QueryId, QueryFailures>,
}

/// Configuration for fault tolerance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultConfig {
    /// Recoveries allowed per query before it fails
    pub max_recoveries_per_query: u32,
    /// Delay before the first recovery in milliseconds
    pub recovery_delay_ms: u64,
    /// Upper bound for the doubled delay in milliseconds
    pub max_recovery_delay_ms: u64,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            max_recoveries_per_query: 3,
            recovery_delay_ms: 100,
            max_recovery_delay_ms: 5000,
        }
    }
}

impl FaultConfig {
    pub fn with_max_recoveries(mut self, max: u32) -> Self {
        self.max_recoveries_per_query = max;
        self
    }

    pub fn with_recovery_delay_ms(mut self, delay_ms: u64) -> Self {
        self.recovery_delay_ms = delay_ms;
        self
    }
}

/// Information about a failed task
#[derive(Debug, Clone)]
pub struct TaskFailure {
    /// Task that failed
    pub task: TaskLocation,
    /// Reason code of the failure
    pub code: ErrorCode,
    /// Failure message
    pub reason: String,
    /// Failure time
    pub failed_at: Instant,
}

#[derive(Debug, Default)]
struct QueryFailures {
    recoveries: u32,
    history: Vec<TaskFailure>,
    last_failure: Option<Instant>,
}

/// Action to take after a task failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Relaunch every task from a complete snapshot
    Restore {
        snapshot_id: SnapshotId,
        delay: Duration,
    },
    /// Relaunch every task from the start
    Restart { delay: Duration },
    /// Fail the query permanently
    Fail { code: ErrorCode, reason: String },
}

/// Fault tolerance statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FaultStats {
    /// Queries with at least one recorded failure
    pub tracked_queries: usize,
    /// Failed tasks across all queries
    pub total_failed_tasks: usize,
    /// Recoveries started across all queries
    pub total_recoveries: u64,
}

impl FaultManager {
    /// Create a new fault manager
    pub fn new(config: FaultConfig) -> Self {
        Self {
            config,
            queries: DashMap::new(),
        }
    }

    /// Create with default configuration
    pub fn with_defaults() -> Self {
        Self::new(FaultConfig::default())
    }

    /// Handle a task failure
    pub fn handle_task_failure(
        &self,
        query_id: QueryId,
        task: TaskLocation,
        error: &QueryError,
        coordinator: &CheckpointCoordinator,
    ) -> RecoveryAction {
        let code = error.error_code();
        let mut entry = self.queries.entry(query_id).or_default();
        entry.history.push(TaskFailure {
            task,
            code,
            reason: error.to_string(),
            failed_at: Instant::now(),
        });
        entry.last_failure = Some(Instant::now());

        if !error.is_recoverable() {
            return RecoveryAction::Fail {
                code,
                reason: format!("Task {} failed: {}", task, error),
            };
        }
        if entry.recoveries >= self.config.max_recoveries_per_query {
            return RecoveryAction::Fail {
                code,
                reason: format!(
                    "Task {} failed after {} recoveries: {}",
                    task, entry.recoveries, error
                ),
            };
        }

        entry.recoveries += 1;
        let delay = self.backoff(entry.recoveries);
        match coordinator.plan_recovery(query_id) {
            RecoveryPlan::Restore(snapshot_id) => RecoveryAction::Restore { snapshot_id, delay },
            RecoveryPlan::Restart => RecoveryAction::Restart { delay },
        }
    }

    /// Delay before recovery number `recovery` (starting at 1)
    fn backoff(&self, recovery: u32) -> Duration {
        let factor = 1u64 << recovery.saturating_sub(1).min(20);
        Duration::from_millis(
            self.config
                .recovery_delay_ms
                .saturating_mul(factor)
                .min(self.config.max_recovery_delay_ms),
        )
    }

    /// Recoveries started for a query
    pub fn recoveries(&self, query_id: QueryId) -> u32 {
        self.queries.get(&query_id).map_or(0, |q| q.recoveries)
    }

    /// Failures recorded for a query, oldest first
    pub fn failure_history(&self, query_id: QueryId) -> Vec<TaskFailure> {
        self.queries
            .get(&query_id)
            .map(|q| q.history.clone())
            .unwrap_or_default()
    }

    /// Forget a query
    pub fn forget(&self, query_id: QueryId) {
        self.queries.remove(&query_id);
    }

    /// Get failure statistics
    pub fn get_stats(&self) -> FaultStats {
        FaultStats {
            tracked_queries: self.queries.len(),
            total_failed_tasks: self.queries.iter().map(|q| q.history.len()).sum(),
            total_recoveries: self.queries.iter().map(|q| u64::from(q.recoveries)).sum(),
        }
    }

    /// Clean up old failure records
    pub fn cleanup(&self, max_age: Duration) {
        let now = Instant::now();
        self.queries.retain(|_, q| {
            q.last_failure
                .is_some_and(|at| now.duration_since(at) < max_age)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointConfig;
    use crate::snapshot::InMemorySnapshotStore;
    use query_core::{FragmentId, PartitionId};
    use query_executor::{CapturedStates, Marker, MarkerInjector, SealedMarker};
    use std::sync::Arc;

    fn task() -> TaskLocation {
        TaskLocation::new(FragmentId(0), PartitionId(0))
    }

    fn coordinator(query: QueryId) -> Arc<CheckpointCoordinator> {
        let coordinator = CheckpointCoordinator::new(
            CheckpointConfig::default(),
            Arc::new(InMemorySnapshotStore::new()),
        );
        coordinator.register_query(
            query,
            vec![task()],
            vec![MarkerInjector::new(PartitionId(0))],
            true,
        );
        coordinator
    }

    #[test]
    fn test_fault_manager_creation() {
        let fm = FaultManager::with_defaults();
        assert_eq!(fm.get_stats().tracked_queries, 0);
    }

    #[test]
    fn test_restart_without_snapshot() {
        let fm = FaultManager::with_defaults();
        let query = QueryId::new();
        let coordinator = coordinator(query);

        let action = fm.handle_task_failure(
            query,
            task(),
            &QueryError::RemoteTaskFailed("worker lost".into()),
            &coordinator,
        );
        assert_eq!(
            action,
            RecoveryAction::Restart {
                delay: Duration::from_millis(100)
            }
        );
        assert_eq!(fm.recoveries(query), 1);
    }

    #[test]
    fn test_restore_from_latest_snapshot() {
        let fm = FaultManager::with_defaults();
        let query = QueryId::new();
        let coordinator = coordinator(query);
        let id = coordinator.trigger(query).unwrap();
        coordinator.reporter(query).report(SealedMarker {
            marker: Marker::new(id, PartitionId(0)),
            task: task(),
            captured: CapturedStates::Complete(Vec::new()),
        });

        let action = fm.handle_task_failure(
            query,
            task(),
            &QueryError::TransientIo("reset".into()),
            &coordinator,
        );
        assert!(matches!(action, RecoveryAction::Restore { snapshot_id, .. } if snapshot_id == id));
    }

    #[test]
    fn test_fatal_errors_fail_immediately() {
        let fm = FaultManager::with_defaults();
        let query = QueryId::new();
        let coordinator = coordinator(query);

        let action = fm.handle_task_failure(
            query,
            task(),
            &QueryError::ExceededMemoryLimit {
                context: "query".into(),
                reserved: 10,
                limit: 5,
            },
            &coordinator,
        );
        assert!(matches!(
            action,
            RecoveryAction::Fail {
                code: ErrorCode::ExceededMemoryLimit,
                ..
            }
        ));
        assert_eq!(fm.recoveries(query), 0);
    }

    #[test]
    fn test_recovery_budget_and_backoff() {
        let config = FaultConfig::default()
            .with_max_recoveries(2)
            .with_recovery_delay_ms(10);
        let fm = FaultManager::new(config);
        let query = QueryId::new();
        let coordinator = coordinator(query);
        let error = QueryError::RemoteTaskFailed("worker lost".into());

        let delays: Vec<RecoveryAction> = (0..3)
            .map(|_| fm.handle_task_failure(query, task(), &error, &coordinator))
            .collect();
        assert_eq!(
            delays[0],
            RecoveryAction::Restart {
                delay: Duration::from_millis(10)
            }
        );
        assert_eq!(
            delays[1],
            RecoveryAction::Restart {
                delay: Duration::from_millis(20)
            }
        );
        assert!(matches!(delays[2], RecoveryAction::Fail { .. }));
        assert_eq!(fm.failure_history(query).len(), 3);
        assert_eq!(fm.get_stats().total_recoveries, 2);
    }

    #[test]
    fn test_cleanup_and_forget() {
        let fm = FaultManager::with_defaults();
        let query = QueryId::new();
        let coordinator = coordinator(query);
        fm.handle_task_failure(
            query,
            task(),
            &QueryError::RemoteTaskFailed("x".into()),
            &coordinator,
        );
        fm.cleanup(Duration::from_secs(60));
        assert_eq!(fm.get_stats().tracked_queries, 1);
        fm.cleanup(Duration::ZERO);
        assert_eq!(fm.get_stats().tracked_queries, 0);

        fm.handle_task_failure(
            query,
            task(),
            &QueryError::RemoteTaskFailed("x".into()),
            &coordinator,
        );
        fm.forget(query);
        assert_eq!(fm.recoveries(query), 0);
    }
}
