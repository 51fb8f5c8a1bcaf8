//! Checkpoint coordination.
//!
//! The coordinator assigns snapshot ids, injects markers at every source
//! partition of a query, stores the states sealed markers bring back, and
//! declares a snapshot complete once every expected task has reported it.
//! On failure it picks the snapshot to restore from.
//!
//! At most one snapshot is pending per query. Reports from task attempts that
//! were superseded by a recovery are dropped. A task that finishes hands in
//! its final state once; it stands in for that task in every later snapshot.
//!
//! Store writes and deletes run on the blocking pool after the query's entry
//! is unlocked. A snapshot only completes once every task's states are
//! durable.

use crate::snapshot::{SnapshotKey, SnapshotStore};
use dashmap::DashMap;
use query_core::{PartitionId, QueryError, QueryId, Result, SnapshotId, StageId, TaskLocation};
use query_executor::{CapturedStates, MarkerInjector, SealedMarker, SnapshotReporter, StageState};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Configuration for periodic snapshots
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Take snapshots at all
    pub enabled: bool,
    /// Interval between triggers in milliseconds
    pub interval_ms: u64,
    /// A pending snapshot older than this is abandoned at the next trigger
    pub snapshot_timeout_ms: u64,
    /// Complete snapshots kept per query
    pub retained_snapshots: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 1000,
            snapshot_timeout_ms: 10_000,
            retained_snapshots: 2,
        }
    }
}

impl CheckpointConfig {
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_interval_ms(mut self, interval_ms: u64) -> Self {
        self.interval_ms = interval_ms;
        self
    }

    pub fn with_snapshot_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.snapshot_timeout_ms = timeout_ms;
        self
    }

    pub fn with_retained_snapshots(mut self, retained: usize) -> Self {
        self.retained_snapshots = retained.max(1);
        self
    }
}

/// How to bring a failed query back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPlan {
    /// Relaunch every task from this complete snapshot
    Restore(SnapshotId),
    /// Relaunch every task from the beginning
    Restart,
}

/// Checkpoint statistics for one query
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointStats {
    pub triggered: u64,
    pub completed: u64,
    pub abandoned: u64,
    pub latest_complete: Option<SnapshotId>,
    /// Why the query is no longer checkpointed
    pub excluded: Option<String>,
}

#[derive(Debug)]
struct PendingSnapshot {
    id: SnapshotId,
    started: Instant,
    /// Tasks whose states were handed to the store
    reported: HashSet<TaskLocation>,
    /// Tasks whose states are durable
    stored: HashSet<TaskLocation>,
}

#[derive(Debug)]
struct QueryCheckpoints {
    expected: HashSet<TaskLocation>,
    injectors: Vec<MarkerInjector>,
    /// Final states of tasks that finished in the current attempt
    finished: HashMap<TaskLocation, Vec<(StageId, StageState)>>,
    /// Incremented every time the tasks are relaunched
    attempt: u64,
    next_id: SnapshotId,
    pending: Option<PendingSnapshot>,
    complete: BTreeSet<SnapshotId>,
    stats: CheckpointStats,
}

/// States of one task to write under one snapshot
struct Persist {
    attempt: u64,
    snapshot_id: SnapshotId,
    task: TaskLocation,
    states: Vec<(StageId, StageState)>,
}

/// Store work decided under a query's lock and run after it is released
#[derive(Default)]
struct Deferred {
    persist: Vec<Persist>,
    discard: Vec<SnapshotId>,
}

/// Counts store operations still running on the blocking pool
#[derive(Debug, Default)]
struct Background {
    running: AtomicUsize,
    idle: Notify,
}

impl Background {
    fn start(&self) {
        self.running.fetch_add(1, Ordering::SeqCst);
    }

    fn done(&self) {
        if self.running.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    async fn settled(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.running.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

pub struct CheckpointCoordinator {
    config: CheckpointConfig,
    store: Arc<dyn SnapshotStore>,
    queries: DashMap<QueryId, QueryCheckpoints>,
    background: Arc<Background>,
}

impl CheckpointCoordinator {
    pub fn new(config: CheckpointConfig, store: Arc<dyn SnapshotStore>) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            queries: DashMap::new(),
            background: Arc::new(Background::default()),
        })
    }

    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    /// Start tracking a query.
    ///
    /// `expected` lists every task that must report a snapshot, including
    /// [`TaskLocation::result_sink`] when the result consumer takes part.
    /// A query whose stages cannot all be captured is registered as excluded.
    pub fn register_query(
        &self,
        query_id: QueryId,
        expected: Vec<TaskLocation>,
        injectors: Vec<MarkerInjector>,
        snapshot_capable: bool,
    ) {
        let mut stats = CheckpointStats::default();
        if !snapshot_capable {
            stats.excluded = Some("plan contains stages without snapshot support".to_string());
        }
        self.queries.insert(
            query_id,
            QueryCheckpoints {
                expected: expected.into_iter().collect(),
                injectors,
                finished: HashMap::new(),
                attempt: 0,
                next_id: SnapshotId(1),
                pending: None,
                complete: BTreeSet::new(),
                stats,
            },
        );
    }

    /// Swap in the injectors of relaunched tasks; reports from older attempts are dropped from now on
    pub fn reset_sources(&self, query_id: QueryId, injectors: Vec<MarkerInjector>) -> Result<()> {
        let discard = {
            let mut entry = self
                .queries
                .get_mut(&query_id)
                .ok_or_else(|| QueryError::QueryNotFound(query_id.to_string()))?;
            let query = entry.value_mut();
            let discard = Self::abandon_pending(query_id, query, "tasks relaunched");
            query.injectors = injectors;
            query.finished.clear();
            query.attempt += 1;
            discard
        };
        if let Some(snapshot_id) = discard {
            self.discard(query_id, snapshot_id);
        }
        Ok(())
    }

    /// Reporter bound to the query's current task attempt
    pub fn reporter(self: &Arc<Self>, query_id: QueryId) -> Arc<dyn SnapshotReporter> {
        let attempt = self
            .queries
            .get(&query_id)
            .map_or(0, |query| query.attempt);
        Arc::new(QueryReporter {
            coordinator: self.clone(),
            query_id,
            attempt,
        })
    }

    /// Start a new snapshot. Returns `None` when no snapshot can start now.
    ///
    /// Markers go to every source partition still producing. Tasks that
    /// already finished count with their final state.
    pub fn trigger(self: &Arc<Self>, query_id: QueryId) -> Option<SnapshotId> {
        if !self.config.enabled {
            return None;
        }
        let mut deferred = Deferred::default();
        let triggered = self.trigger_locked(query_id, &mut deferred);
        self.apply(query_id, deferred);
        triggered
    }

    fn trigger_locked(&self, query_id: QueryId, deferred: &mut Deferred) -> Option<SnapshotId> {
        let mut entry = self.queries.get_mut(&query_id)?;
        let query = entry.value_mut();
        if query.stats.excluded.is_some() {
            return None;
        }
        if let Some(pending) = &query.pending {
            let timeout = Duration::from_millis(self.config.snapshot_timeout_ms);
            if pending.started.elapsed() < timeout {
                return None;
            }
            deferred
                .discard
                .extend(Self::abandon_pending(query_id, query, "timed out"));
        }
        if query.injectors.iter().all(MarkerInjector::is_closed) {
            return None;
        }

        let id = query.next_id;
        query.next_id = id.next();
        query.pending = Some(PendingSnapshot {
            id,
            started: Instant::now(),
            reported: HashSet::new(),
            stored: HashSet::new(),
        });
        query.stats.triggered += 1;
        let injected = query
            .injectors
            .iter()
            .filter(|injector| injector.inject(id))
            .count();
        if injected == 0 {
            deferred.discard.extend(Self::abandon_pending(
                query_id,
                query,
                "every source finished during injection",
            ));
            return None;
        }

        let attempt = query.attempt;
        if let Some(pending) = query.pending.as_mut() {
            for (task, states) in &query.finished {
                pending.reported.insert(*task);
                deferred.persist.push(Persist {
                    attempt,
                    snapshot_id: id,
                    task: *task,
                    states: states.clone(),
                });
            }
        }
        tracing::debug!(
            "Triggered snapshot {} for query {} ({} sources, {} finished tasks)",
            id,
            query_id,
            injected,
            query.finished.len()
        );
        Some(id)
    }

    /// Trigger snapshots of every registered query until cancelled
    pub fn spawn_periodic(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(coordinator.config.interval_ms.max(1)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let queries: Vec<QueryId> =
                            coordinator.queries.iter().map(|entry| *entry.key()).collect();
                        for query_id in queries {
                            coordinator.trigger(query_id);
                        }
                    }
                }
            }
        })
    }

    fn report(self: &Arc<Self>, query_id: QueryId, attempt: u64, sealed: SealedMarker) {
        let mut deferred = Deferred::default();
        self.report_locked(query_id, attempt, sealed, &mut deferred);
        self.apply(query_id, deferred);
    }

    fn report_locked(
        &self,
        query_id: QueryId,
        attempt: u64,
        sealed: SealedMarker,
        deferred: &mut Deferred,
    ) {
        let Some(mut entry) = self.queries.get_mut(&query_id) else {
            return;
        };
        let query = entry.value_mut();
        let snapshot_id = sealed.marker.snapshot_id;
        if query.attempt != attempt
            || query.pending.as_ref().map(|p| p.id) != Some(snapshot_id)
        {
            tracing::debug!(
                "Ignoring stale report of snapshot {} from task {} of query {}",
                snapshot_id,
                sealed.task,
                query_id
            );
            return;
        }
        if !query.expected.contains(&sealed.task) {
            tracing::warn!(
                "Task {} is not part of query {}; report of snapshot {} dropped",
                sealed.task,
                query_id,
                snapshot_id
            );
            return;
        }

        match sealed.captured {
            CapturedStates::Unsupported { stage, reason } => {
                let why = format!("stage {} of task {} cannot be captured: {}", stage, sealed.task, reason);
                Self::exclude(query_id, query, why, deferred);
            }
            CapturedStates::Complete(states) => {
                let Some(pending) = query.pending.as_mut() else {
                    return;
                };
                if !pending.reported.insert(sealed.task) {
                    return;
                }
                deferred.persist.push(Persist {
                    attempt,
                    snapshot_id,
                    task: sealed.task,
                    states,
                });
            }
        }
    }

    fn task_finished(
        self: &Arc<Self>,
        query_id: QueryId,
        attempt: u64,
        task: TaskLocation,
        captured: CapturedStates,
    ) {
        let mut deferred = Deferred::default();
        self.task_finished_locked(query_id, attempt, task, captured, &mut deferred);
        self.apply(query_id, deferred);
    }

    fn task_finished_locked(
        &self,
        query_id: QueryId,
        attempt: u64,
        task: TaskLocation,
        captured: CapturedStates,
        deferred: &mut Deferred,
    ) {
        let Some(mut entry) = self.queries.get_mut(&query_id) else {
            return;
        };
        let query = entry.value_mut();
        if query.attempt != attempt || !query.expected.contains(&task) {
            return;
        }
        let states = match captured {
            CapturedStates::Unsupported { stage, reason } => {
                let why = format!(
                    "final state of stage {} of task {} cannot be captured: {}",
                    stage, task, reason
                );
                Self::exclude(query_id, query, why, deferred);
                return;
            }
            CapturedStates::Complete(states) => states,
        };
        tracing::debug!("Task {} of query {} finished; keeping its final state", task, query_id);
        query.finished.insert(task, states.clone());

        // counts toward the pending snapshot unless it already sealed that marker
        let Some(pending) = query.pending.as_mut() else {
            return;
        };
        if pending.reported.insert(task) {
            deferred.persist.push(Persist {
                attempt,
                snapshot_id: pending.id,
                task,
                states,
            });
        }
    }

    /// A write started by `persist` is done
    fn persisted(
        &self,
        query_id: QueryId,
        attempt: u64,
        snapshot_id: SnapshotId,
        task: TaskLocation,
        result: Result<()>,
    ) {
        let mut discard = Vec::new();
        match self.queries.get_mut(&query_id) {
            None => discard.push(snapshot_id),
            Some(mut entry) => {
                let query = entry.value_mut();
                let current = query.attempt == attempt
                    && query.pending.as_ref().map(|p| p.id) == Some(snapshot_id);
                if !current {
                    // abandoned while the write ran; its blobs may have landed after the delete
                    discard.push(snapshot_id);
                } else if let Err(err) = result {
                    let why = format!("storing states of task {} failed: {}", task, err);
                    discard.extend(Self::abandon_pending(query_id, query, &why));
                } else {
                    discard.extend(self.mark_stored(query_id, query, task));
                }
            }
        }
        for snapshot_id in discard {
            self.discard(query_id, snapshot_id);
        }
    }

    /// Record a durable task; returns snapshots pruned by a completion
    fn mark_stored(
        &self,
        query_id: QueryId,
        query: &mut QueryCheckpoints,
        task: TaskLocation,
    ) -> Vec<SnapshotId> {
        let Some(pending) = query.pending.as_mut() else {
            return Vec::new();
        };
        pending.stored.insert(task);
        if pending.stored.len() < query.expected.len() {
            return Vec::new();
        }

        let snapshot_id = pending.id;
        let elapsed = pending.started.elapsed();
        query.pending = None;
        query.complete.insert(snapshot_id);
        query.stats.completed += 1;
        query.stats.latest_complete = Some(snapshot_id);
        tracing::info!(
            "Snapshot {} of query {} complete in {:?}",
            snapshot_id,
            query_id,
            elapsed
        );

        let mut pruned = Vec::new();
        while query.complete.len() > self.config.retained_snapshots.max(1) {
            match query.complete.pop_first() {
                Some(oldest) => pruned.push(oldest),
                None => break,
            }
        }
        pruned
    }

    /// Give up on the pending snapshot, if any
    pub fn abandon(&self, query_id: QueryId, reason: &str) {
        let discard = self
            .queries
            .get_mut(&query_id)
            .and_then(|mut entry| Self::abandon_pending(query_id, entry.value_mut(), reason));
        if let Some(snapshot_id) = discard {
            self.discard(query_id, snapshot_id);
        }
    }

    /// Drop the pending snapshot; returns its id so the caller can delete its blobs once unlocked
    fn abandon_pending(
        query_id: QueryId,
        query: &mut QueryCheckpoints,
        reason: &str,
    ) -> Option<SnapshotId> {
        let pending = query.pending.take()?;
        query.stats.abandoned += 1;
        tracing::warn!(
            "Abandoned snapshot {} of query {}: {}",
            pending.id,
            query_id,
            reason
        );
        Some(pending.id)
    }

    fn exclude(query_id: QueryId, query: &mut QueryCheckpoints, why: String, deferred: &mut Deferred) {
        deferred
            .discard
            .extend(Self::abandon_pending(query_id, query, &why));
        tracing::warn!("Query {} is no longer checkpointed: {}", query_id, why);
        query.stats.excluded = Some(why);
    }

    fn apply(self: &Arc<Self>, query_id: QueryId, deferred: Deferred) {
        for snapshot_id in deferred.discard {
            self.discard(query_id, snapshot_id);
        }
        for persist in deferred.persist {
            self.persist(query_id, persist);
        }
    }

    fn persist(self: &Arc<Self>, query_id: QueryId, persist: Persist) {
        let coordinator = self.clone();
        self.run_blocking(move || {
            let Persist {
                attempt,
                snapshot_id,
                task,
                states,
            } = persist;
            let result = states.into_iter().try_for_each(|(stage_id, state)| {
                let key = SnapshotKey::new(query_id, snapshot_id, stage_id, task.partition);
                coordinator.store.put(key, state.into_bytes())
            });
            coordinator.persisted(query_id, attempt, snapshot_id, task, result);
        });
    }

    fn discard(&self, query_id: QueryId, snapshot_id: SnapshotId) {
        let store = self.store.clone();
        self.run_blocking(move || {
            if let Err(err) = store.delete_snapshot(query_id, snapshot_id) {
                tracing::warn!(
                    "Failed to delete snapshot {} of query {}: {}",
                    snapshot_id,
                    query_id,
                    err
                );
            }
        });
    }

    /// Run store I/O on the blocking pool, or inline outside a runtime
    fn run_blocking<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let background = self.background.clone();
        background.start();
        let job = move || {
            work();
            background.done();
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(job);
            }
            Err(_) => job(),
        }
    }

    /// Wait until every snapshot write and delete started so far is done
    pub async fn settled(&self) {
        self.background.settled().await;
    }

    /// Choose how to recover a failed query. Partial snapshots are discarded.
    pub fn plan_recovery(&self, query_id: QueryId) -> RecoveryPlan {
        let (plan, discard) = {
            let Some(mut entry) = self.queries.get_mut(&query_id) else {
                return RecoveryPlan::Restart;
            };
            let query = entry.value_mut();
            let discard = Self::abandon_pending(query_id, query, "query is recovering");
            let plan = match query.complete.last() {
                Some(id) if query.stats.excluded.is_none() => RecoveryPlan::Restore(*id),
                _ => RecoveryPlan::Restart,
            };
            (plan, discard)
        };
        if let Some(snapshot_id) = discard {
            self.discard(query_id, snapshot_id);
        }
        plan
    }

    /// States of `stage_ids` for one partition of a complete snapshot
    pub fn load_states(
        &self,
        query_id: QueryId,
        snapshot_id: SnapshotId,
        stage_ids: &[StageId],
        partition: PartitionId,
    ) -> Result<HashMap<StageId, StageState>> {
        let mut states = HashMap::with_capacity(stage_ids.len());
        for stage_id in stage_ids {
            let key = SnapshotKey::new(query_id, snapshot_id, *stage_id, partition);
            let blob = self.store.get(&key)?.ok_or_else(|| {
                QueryError::Checkpoint(format!(
                    "snapshot {} of query {} has no state for stage {} partition {}",
                    snapshot_id, query_id, stage_id, partition
                ))
            })?;
            states.insert(*stage_id, StageState::from_bytes(blob));
        }
        Ok(states)
    }

    pub fn stats(&self, query_id: QueryId) -> Option<CheckpointStats> {
        self.queries.get(&query_id).map(|query| query.stats.clone())
    }

    pub fn latest_complete(&self, query_id: QueryId) -> Option<SnapshotId> {
        self.queries
            .get(&query_id)
            .and_then(|query| query.complete.last().copied())
    }

    /// Stop tracking a query and drop its snapshots
    pub fn unregister_query(&self, query_id: QueryId) {
        if self.queries.remove(&query_id).is_some() {
            let store = self.store.clone();
            self.run_blocking(move || {
                if let Err(err) = store.delete_query(query_id) {
                    tracing::warn!("Failed to delete snapshots of query {}: {}", query_id, err);
                }
            });
        }
    }
}

struct QueryReporter {
    coordinator: Arc<CheckpointCoordinator>,
    query_id: QueryId,
    attempt: u64,
}

impl SnapshotReporter for QueryReporter {
    fn report(&self, sealed: SealedMarker) {
        self.coordinator.report(self.query_id, self.attempt, sealed);
    }

    fn finished(&self, task: TaskLocation, captured: CapturedStates) {
        self.coordinator
            .task_finished(self.query_id, self.attempt, task, captured);
    }
}
