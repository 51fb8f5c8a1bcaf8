//! Distributed query executor
//!
//! Launches every task of a [`QueryPlan`] on the worker, wires fragments
//! together through output buffers and exchange clients, and supervises the
//! attempt. When a task fails with a recoverable error, all tasks are torn
//! down and relaunched, restored from the latest complete snapshot if there
//! is one. This is global rollback: no task survives a recovery.

use crate::buffer::{OutputBuffer, OutputBufferConfig};
use crate::checkpoint::{CheckpointConfig, CheckpointCoordinator};
use crate::error::{DistributedError, Result};
use crate::exchange::{
    ExchangeClient, ExchangeClientConfig, ExchangeInput, LocalExchangeSource, RetryPolicy,
};
use crate::fault::{FaultConfig, FaultManager, RecoveryAction};
use crate::planner::{FragmentInput, FragmentPlan, QueryPlan};
use crate::snapshot::SnapshotStore;
use crate::types::QueryStatus;
use crate::worker::Worker;
use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::RwLock;
use query_core::{
    ErrorCode, FragmentId, PartitionId, QueryError, QueryId, SnapshotId, TaskLocation,
};
use query_executor::{
    MarkerInjector, MemoryContext, MemoryPool, Pipeline, PipelineConfig, PipelineInput,
    PipelineStats, SnapshotReporter, SourceInput, StageSpec, StageUnitRegistry,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Configuration for distributed executor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Maximum tasks running at once; launched tasks beyond it wait for a slot
    pub max_concurrent_tasks: usize,
    /// Memory ceiling shared by all tasks of one query
    pub query_memory_limit: Option<u64>,
    /// Per-task pipeline settings
    pub pipeline: PipelineConfig,
    /// Task output buffers
    pub output_buffer: OutputBufferConfig,
    /// Exchange clients between fragments
    pub exchange: ExchangeClientConfig,
    /// Retries of failed exchange fetches
    pub retry: RetryPolicy,
    /// Snapshot coordination
    pub checkpoint: CheckpointConfig,
    /// Recovery budget and backoff
    pub fault: FaultConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 64,
            query_memory_limit: None,
            pipeline: PipelineConfig::default(),
            output_buffer: OutputBufferConfig::default(),
            exchange: ExchangeClientConfig::default(),
            retry: RetryPolicy::default(),
            checkpoint: CheckpointConfig::default(),
            fault: FaultConfig::default(),
        }
    }
}

impl ExecutorConfig {
    pub fn with_max_concurrent_tasks(mut self, tasks: usize) -> Self {
        self.max_concurrent_tasks = tasks;
        self
    }

    pub fn with_query_memory_limit(mut self, limit: u64) -> Self {
        self.query_memory_limit = Some(limit);
        self
    }

    pub fn with_checkpoint(mut self, checkpoint: CheckpointConfig) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    pub fn with_fault(mut self, fault: FaultConfig) -> Self {
        self.fault = fault;
        self
    }
}

/// Per-query execution options
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecuteOptions {
    /// The result consumer takes part in snapshots as [`TaskLocation::result_sink`]
    pub result_sink: bool,
}

/// Statistics for one distributed query
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionStats {
    /// Task attempts launched, the first one included
    pub attempts: u64,
    /// Tasks launched over all attempts
    pub tasks_launched: u64,
    /// Recoveries started
    pub recoveries: u64,
    /// Rows written by the root fragment in the final attempt
    pub output_rows: u64,
    /// Batches written by the root fragment in the final attempt
    pub output_batches: u64,
    /// Wall time until the query reached a terminal state
    pub elapsed_ms: u64,
}

/// The buffers holding the root fragment's output in the current attempt
#[derive(Debug, Clone)]
pub struct RootOutput {
    /// Increases by one every time the tasks are (re)launched
    pub epoch: u64,
    /// Snapshot the current attempt was restored from
    pub restored_from: Option<SnapshotId>,
    /// One buffer per root partition, each with a single output partition
    pub buffers: Vec<Arc<OutputBuffer>>,
}

/// Tasks of the current attempt
struct Attempt {
    root: RootOutput,
    cancel: CancellationToken,
    tasks: HashMap<TaskLocation, CancellationToken>,
    killed: HashSet<TaskLocation>,
}

#[derive(Default)]
struct ExecutionState {
    epoch: u64,
    attempt: Option<Attempt>,
    failure: Option<(ErrorCode, String)>,
    stats: ExecutionStats,
}

/// Tracks execution state of a distributed query
pub struct QueryExecution {
    query_id: QueryId,
    plan: QueryPlan,
    options: ExecuteOptions,
    status: watch::Sender<QueryStatus>,
    cancel: CancellationToken,
    started: Instant,
    state: RwLock<ExecutionState>,
}

impl QueryExecution {
    fn new(query_id: QueryId, plan: QueryPlan, options: ExecuteOptions) -> Self {
        let (status, _) = watch::channel(QueryStatus::Queued);
        Self {
            query_id,
            plan,
            options,
            status,
            cancel: CancellationToken::new(),
            started: Instant::now(),
            state: RwLock::new(ExecutionState::default()),
        }
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn plan(&self) -> &QueryPlan {
        &self.plan
    }

    pub fn status(&self) -> QueryStatus {
        *self.status.borrow()
    }

    /// Receiver notified on every status change
    pub fn subscribe(&self) -> watch::Receiver<QueryStatus> {
        self.status.subscribe()
    }

    /// Root buffers of the current attempt; `None` until the first launch
    pub fn root_output(&self) -> Option<RootOutput> {
        self.state
            .read()
            .attempt
            .as_ref()
            .map(|attempt| attempt.root.clone())
    }

    /// Why the query failed, with its original reason code
    pub fn failure(&self) -> Option<QueryError> {
        self.state
            .read()
            .failure
            .as_ref()
            .map(|(code, message)| QueryError::Remote {
                code: *code,
                message: message.clone(),
            })
    }

    pub fn stats(&self) -> ExecutionStats {
        self.state.read().stats.clone()
    }

    /// Wait until the query is finished, failed or cancelled
    pub async fn wait(&self) -> QueryStatus {
        let mut status = self.status.subscribe();
        let terminal = match status.wait_for(QueryStatus::is_terminal).await {
            Ok(terminal) => *terminal,
            Err(_) => self.status(),
        };
        terminal
    }

    fn set_status(&self, status: QueryStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            tracing::debug!("Query {} is now {}", self.query_id, status);
        }
    }

    fn finish(&self, status: QueryStatus) {
        {
            let mut state = self.state.write();
            state.stats.elapsed_ms = self.started.elapsed().as_millis() as u64;
        }
        self.set_status(status);
    }

    fn fail(&self, code: ErrorCode, reason: String) {
        tracing::warn!("Query {} failed: {} ({})", self.query_id, reason, code);
        self.state.write().failure = Some((code, reason));
        self.finish(QueryStatus::Failed);
    }

    fn was_killed(&self, task: TaskLocation) -> bool {
        self.state
            .read()
            .attempt
            .as_ref()
            .is_some_and(|attempt| attempt.killed.contains(&task))
    }

    /// Stop every task of the current attempt and fail its buffers
    fn cancel_attempt(&self, reason: &str) {
        let state = self.state.read();
        if let Some(attempt) = &state.attempt {
            attempt.cancel.cancel();
            for buffer in &attempt.root.buffers {
                buffer.abort(reason);
            }
        }
    }
}

enum AttemptOutcome {
    Finished,
    Cancelled,
    Failed(TaskLocation, QueryError),
}

type TaskHandle = (TaskLocation, JoinHandle<query_core::Result<PipelineStats>>);

/// Distributed query executor
pub struct DistributedExecutor {
    /// Execution configuration
    config: ExecutorConfig,
    /// Stage factories
    registry: Arc<StageUnitRegistry>,
    /// Runs every task
    worker: Arc<Worker>,
    /// Snapshot coordination
    coordinator: Arc<CheckpointCoordinator>,
    /// Recovery decisions
    faults: FaultManager,
    /// Known queries
    queries: DashMap<QueryId, Arc<QueryExecution>>,
}

impl DistributedExecutor {
    /// Create a new distributed executor
    pub fn new(
        config: ExecutorConfig,
        registry: Arc<StageUnitRegistry>,
        store: Arc<dyn SnapshotStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            worker: Worker::new(config.max_concurrent_tasks),
            coordinator: CheckpointCoordinator::new(config.checkpoint.clone(), store),
            faults: FaultManager::new(config.fault.clone()),
            registry,
            config,
            queries: DashMap::new(),
        })
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<CheckpointCoordinator> {
        &self.coordinator
    }

    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }

    pub fn faults(&self) -> &FaultManager {
        &self.faults
    }

    /// Trigger snapshots of running queries every checkpoint interval
    pub fn start_checkpointing(&self, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        if !self.config.checkpoint.enabled {
            return None;
        }
        Some(self.coordinator.spawn_periodic(cancel))
    }

    /// Execute a distributed query in the background
    pub fn execute(
        self: &Arc<Self>,
        plan: QueryPlan,
        options: ExecuteOptions,
    ) -> Result<Arc<QueryExecution>> {
        self.execute_with_id(QueryId::new(), plan, options)
    }

    pub fn execute_with_id(
        self: &Arc<Self>,
        query_id: QueryId,
        plan: QueryPlan,
        options: ExecuteOptions,
    ) -> Result<Arc<QueryExecution>> {
        plan.validate()?;
        for spec in plan.stage_specs() {
            if self.registry.get(&spec.kind).is_none() {
                return Err(DistributedError::InvalidPlan(format!(
                    "stage {} has unknown kind '{}'",
                    spec.id, spec.kind
                )));
            }
        }

        let execution = Arc::new(QueryExecution::new(query_id, plan, options));
        match self.queries.entry(query_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(DistributedError::InvalidPlan(format!(
                    "query {} is already executing",
                    query_id
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(execution.clone());
            }
        }

        tracing::info!(
            "Executing query {} with {} fragments and {} tasks",
            query_id,
            execution.plan.fragments().len(),
            execution.plan.task_count()
        );
        tokio::spawn(self.clone().supervise(execution.clone()));
        Ok(execution)
    }

    pub fn get(&self, query_id: QueryId) -> Option<Arc<QueryExecution>> {
        self.queries.get(&query_id).map(|entry| entry.value().clone())
    }

    /// Get query execution status
    pub fn get_query_status(&self, query_id: QueryId) -> Option<QueryStatus> {
        self.get(query_id).map(|execution| execution.status())
    }

    pub fn query_ids(&self) -> Vec<QueryId> {
        self.queries.iter().map(|entry| *entry.key()).collect()
    }

    /// Get number of queries not yet in a terminal state
    pub fn active_query_count(&self) -> usize {
        self.queries
            .iter()
            .filter(|entry| !entry.status().is_terminal())
            .count()
    }

    /// Cancel a running query
    pub fn cancel_query(&self, query_id: QueryId) -> Result<()> {
        let execution = self
            .get(query_id)
            .ok_or_else(|| DistributedError::UnknownQuery(query_id.to_string()))?;
        if !execution.status().is_terminal() {
            tracing::info!("Cancelling query {}", query_id);
            execution.cancel.cancel();
        }
        Ok(())
    }

    /// Simulate the loss of one task of the current attempt
    pub fn kill_task(&self, query_id: QueryId, task: TaskLocation) -> Result<()> {
        let execution = self
            .get(query_id)
            .ok_or_else(|| DistributedError::UnknownQuery(query_id.to_string()))?;
        let mut state = execution.state.write();
        let attempt = state.attempt.as_mut().ok_or_else(|| {
            QueryError::IllegalState(format!("query {} has no running tasks", query_id))
        })?;
        let token = attempt.tasks.get(&task).cloned().ok_or_else(|| {
            QueryError::IllegalState(format!("query {} has no task {}", query_id, task))
        })?;
        tracing::warn!("Killing task {} of query {}", task, query_id);
        attempt.killed.insert(task);
        token.cancel();
        Ok(())
    }

    /// Forget a query, cancelling it first if it is still running
    pub fn remove(&self, query_id: QueryId) -> Option<Arc<QueryExecution>> {
        let (_, execution) = self.queries.remove(&query_id)?;
        execution.cancel.cancel();
        self.faults.forget(query_id);
        Some(execution)
    }

    /// Clean up queries in a terminal state
    pub fn cleanup_completed(&self) {
        self.queries.retain(|query_id, execution| {
            let keep = !execution.status().is_terminal();
            if !keep {
                self.faults.forget(*query_id);
            }
            keep
        });
    }

    /// Stop accepting tasks and wait for running ones
    pub async fn shutdown(&self) {
        for entry in self.queries.iter() {
            entry.cancel.cancel();
        }
        self.worker.shutdown().await;
        self.coordinator.settled().await;
    }

    async fn supervise(self: Arc<Self>, execution: Arc<QueryExecution>) {
        let query_id = execution.query_id;
        let mut restore: Option<SnapshotId> = None;
        loop {
            if execution.cancel.is_cancelled() {
                execution.finish(QueryStatus::Cancelled);
                break;
            }
            let handles = match self.launch(&execution, restore) {
                Ok(handles) => handles,
                Err(err) => {
                    let err = QueryError::from(err);
                    execution.cancel_attempt("query failed to launch");
                    execution.fail(err.error_code(), err.to_string());
                    break;
                }
            };
            execution.set_status(QueryStatus::Running);

            match self.await_attempt(&execution, handles).await {
                AttemptOutcome::Finished => {
                    let stats = execution.stats();
                    tracing::info!(
                        "Query {} finished: {} rows in {} attempt(s)",
                        query_id,
                        stats.output_rows,
                        stats.attempts
                    );
                    execution.finish(QueryStatus::Finished);
                    break;
                }
                AttemptOutcome::Cancelled => {
                    tracing::info!("Query {} cancelled", query_id);
                    execution.finish(QueryStatus::Cancelled);
                    break;
                }
                AttemptOutcome::Failed(task, error) => {
                    let action = self.faults.handle_task_failure(
                        query_id,
                        task,
                        &error,
                        &self.coordinator,
                    );
                    let delay = match action {
                        RecoveryAction::Restore { snapshot_id, delay } => {
                            tracing::info!(
                                "Query {} recovers from snapshot {} after task {} failed: {}",
                                query_id,
                                snapshot_id,
                                task,
                                error
                            );
                            restore = Some(snapshot_id);
                            delay
                        }
                        RecoveryAction::Restart { delay } => {
                            tracing::info!(
                                "Query {} restarts after task {} failed: {}",
                                query_id,
                                task,
                                error
                            );
                            restore = None;
                            delay
                        }
                        RecoveryAction::Fail { code, reason } => {
                            execution.fail(code, reason);
                            break;
                        }
                    };
                    execution.state.write().stats.recoveries += 1;
                    execution.set_status(QueryStatus::Recovering);
                    tokio::select! {
                        _ = execution.cancel.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        self.coordinator.unregister_query(query_id);
    }

    /// Build and spawn every task of a new attempt
    fn launch(
        &self,
        execution: &Arc<QueryExecution>,
        restore: Option<SnapshotId>,
    ) -> Result<Vec<TaskHandle>> {
        let query_id = execution.query_id;
        let plan = &execution.plan;
        let pool = MemoryPool::new(format!("query {}", query_id), self.config.query_memory_limit);
        let attempt_cancel = execution.cancel.child_token();

        let mut buffers: HashMap<FragmentId, Vec<Arc<OutputBuffer>>> = HashMap::new();
        let mut injectors = Vec::new();
        let mut pipelines = Vec::with_capacity(plan.task_count());

        for fragment in plan.fragments() {
            let consumers = plan
                .consumer_of(fragment.id)
                .map_or(1, |consumer| consumer.partitions as usize);
            let mut fragment_buffers = Vec::with_capacity(fragment.partitions as usize);
            for p in 0..fragment.partitions {
                let task = TaskLocation::new(fragment.id, PartitionId(p));
                let buffer = OutputBuffer::new(
                    task,
                    consumers,
                    fragment.output_partitioning.clone(),
                    self.config.output_buffer.clone(),
                );
                let input = self.build_input(fragment, task, &buffers, &pool, &mut injectors)?;
                let units = fragment
                    .stages
                    .iter()
                    .map(|spec| self.registry.create(spec))
                    .collect::<query_core::Result<Vec<_>>>()?;
                let memory =
                    MemoryContext::new(task.to_string(), units.len(), self.config.pipeline.memory_limit)
                        .with_pool(pool.clone());
                let cancel = attempt_cancel.child_token();
                let mut pipeline = Pipeline::new(
                    task,
                    input,
                    fragment.input.id(),
                    units,
                    Box::new(buffer.writer()),
                    self.config.pipeline.clone(),
                )?
                .with_memory(memory)
                .with_cancellation(cancel.clone());

                if let Some(snapshot_id) = restore {
                    let states = self.coordinator.load_states(
                        query_id,
                        snapshot_id,
                        &fragment.snapshot_ids(),
                        task.partition,
                    )?;
                    pipeline.restore(&states)?;
                }
                fragment_buffers.push(buffer);
                pipelines.push((task, cancel, pipeline));
            }
            buffers.insert(fragment.id, fragment_buffers);
        }

        if execution.state.read().attempt.is_none() {
            let mut expected: Vec<TaskLocation> = pipelines.iter().map(|(task, _, _)| *task).collect();
            if execution.options.result_sink {
                expected.push(TaskLocation::result_sink());
            }
            let specs: Vec<StageSpec> = plan.stage_specs().cloned().collect();
            self.coordinator.register_query(
                query_id,
                expected,
                injectors,
                self.registry.supports_snapshot(&specs),
            );
        } else {
            self.coordinator.reset_sources(query_id, injectors)?;
        }
        let reporter: Arc<dyn SnapshotReporter> = self.coordinator.reporter(query_id);

        let root = RootOutput {
            epoch: execution.state.read().epoch + 1,
            restored_from: restore,
            buffers: buffers.remove(&plan.root().id).unwrap_or_default(),
        };
        {
            let mut state = execution.state.write();
            state.epoch = root.epoch;
            state.stats.attempts += 1;
            state.stats.output_rows = 0;
            state.stats.output_batches = 0;
            state.attempt = Some(Attempt {
                root,
                cancel: attempt_cancel,
                tasks: pipelines
                    .iter()
                    .map(|(task, cancel, _)| (*task, cancel.clone()))
                    .collect(),
                killed: HashSet::new(),
            });
        }

        tracing::debug!(
            "Launching {} tasks of query {} (restored from {:?})",
            pipelines.len(),
            query_id,
            restore
        );
        let mut handles = Vec::with_capacity(pipelines.len());
        for (task, _, pipeline) in pipelines {
            let pipeline = pipeline.with_reporter(reporter.clone());
            handles.push((task, self.worker.spawn(query_id, pipeline)?));
            execution.state.write().stats.tasks_launched += 1;
        }
        Ok(handles)
    }

    fn build_input(
        &self,
        fragment: &FragmentPlan,
        task: TaskLocation,
        buffers: &HashMap<FragmentId, Vec<Arc<OutputBuffer>>>,
        pool: &Arc<MemoryPool>,
        injectors: &mut Vec<MarkerInjector>,
    ) -> Result<Box<dyn PipelineInput>> {
        match &fragment.input {
            FragmentInput::Source { provider, .. } => {
                let injector = MarkerInjector::new(task.partition);
                injectors.push(injector.clone());
                let source = provider.open(task.partition)?;
                Ok(Box::new(SourceInput::new(source, injector)))
            }
            FragmentInput::Exchange { upstream, .. } => {
                let upstream_buffers = buffers.get(upstream).ok_or_else(|| {
                    DistributedError::InvalidPlan(format!(
                        "fragment {} reads {} before it was built",
                        fragment.id, upstream
                    ))
                })?;
                let client = ExchangeClient::new(
                    format!("exchange-{}", task),
                    self.config.exchange.clone(),
                    self.config.retry.clone(),
                    Some(pool.clone()),
                )
                .with_alignment();
                for buffer in upstream_buffers {
                    client.add_source(Arc::new(LocalExchangeSource::new(
                        buffer.clone(),
                        task.partition.0 as usize,
                    )))?;
                }
                client.no_more_sources();
                Ok(Box::new(ExchangeInput::new(client)))
            }
        }
    }

    async fn await_attempt(
        &self,
        execution: &Arc<QueryExecution>,
        handles: Vec<TaskHandle>,
    ) -> AttemptOutcome {
        let root = execution.plan.root().id;
        let mut pending: FuturesUnordered<_> = handles
            .into_iter()
            .map(|(task, handle)| async move { (task, handle.await) })
            .collect();

        let outcome = loop {
            tokio::select! {
                _ = execution.cancel.cancelled() => break AttemptOutcome::Cancelled,
                next = pending.next() => match next {
                    None => break AttemptOutcome::Finished,
                    Some((task, Ok(Ok(stats)))) => {
                        if task.fragment == root {
                            let mut state = execution.state.write();
                            state.stats.output_rows += stats.output_rows;
                            state.stats.output_batches += stats.output_batches;
                        }
                    }
                    Some((task, Ok(Err(err)))) => {
                        if execution.was_killed(task) {
                            break AttemptOutcome::Failed(
                                task,
                                QueryError::RemoteTaskFailed(format!("task {} was lost", task)),
                            );
                        }
                        if execution.cancel.is_cancelled() {
                            break AttemptOutcome::Cancelled;
                        }
                        break AttemptOutcome::Failed(task, err);
                    }
                    Some((task, Err(join_err))) => {
                        break AttemptOutcome::Failed(
                            task,
                            QueryError::RemoteTaskFailed(format!(
                                "task {} stopped unexpectedly: {}",
                                task, join_err
                            )),
                        );
                    }
                },
            }
        };

        if !matches!(outcome, AttemptOutcome::Finished) {
            let reason = match &outcome {
                AttemptOutcome::Failed(task, err) => format!("task {} failed: {}", task, err),
                _ => "query cancelled".to_string(),
            };
            execution.cancel_attempt(&reason);
            // every task must be gone before the next attempt reuses the query's state
            while pending.next().await.is_some() {}
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::MemorySourceProvider;
    use crate::snapshot::InMemorySnapshotStore;
    use arrow::array::{Array, Int64Array};
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;
    use query_core::StageId;
    use query_executor::{
        Blocked, InputPoll, Readiness, StageCapabilities, StageState, StageUnit,
        StageUnitFactory,
    };
    use serde_json::json;

    fn batch(values: Vec<i64>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values))]).unwrap()
    }

    fn sum(id: u32) -> StageSpec {
        StageSpec::new(
            StageId(id),
            "aggregation",
            json!({ "aggregates": [{ "function": "sum", "column": 0, "name": "total" }] }),
        )
    }

    fn limit(id: u32, limit: u64) -> StageSpec {
        StageSpec::new(StageId(id), "limit", json!({ "limit": limit }))
    }

    fn executor(registry: StageUnitRegistry) -> Arc<DistributedExecutor> {
        executor_with(registry, FaultConfig::default().with_recovery_delay_ms(5))
    }

    fn executor_with(registry: StageUnitRegistry, fault: FaultConfig) -> Arc<DistributedExecutor> {
        let config = ExecutorConfig::default().with_fault(fault);
        DistributedExecutor::new(
            config,
            Arc::new(registry),
            Arc::new(InMemorySnapshotStore::new()),
        )
    }

    /// Read every batch of the final root output
    async fn collect(execution: &QueryExecution) -> Vec<RecordBatch> {
        let root = execution.root_output().unwrap();
        let client = ExchangeClient::new(
            "test",
            ExchangeClientConfig::default(),
            RetryPolicy::no_retries(),
            None,
        );
        for buffer in &root.buffers {
            client
                .add_source(Arc::new(LocalExchangeSource::new(buffer.clone(), 0)))
                .unwrap();
        }
        client.no_more_sources();

        let mut batches = Vec::new();
        loop {
            match client.poll_next().unwrap() {
                InputPoll::Element(query_executor::StreamElement::Batch(batch)) => {
                    batches.push(batch)
                }
                InputPoll::Element(_) => {}
                InputPoll::Pending(_) => {
                    client.wait_for_data(Duration::from_millis(100)).await;
                }
                InputPoll::Finished => return batches,
            }
        }
    }

    fn total(batches: &[RecordBatch]) -> i64 {
        batches
            .iter()
            .map(|b| {
                let column = b.column(0).as_any().downcast_ref::<Int64Array>().unwrap();
                (0..column.len()).map(|i| column.value(i)).sum::<i64>()
            })
            .sum()
    }

    fn numbers(partitions: Vec<Vec<RecordBatch>>) -> Arc<MemorySourceProvider> {
        Arc::new(MemorySourceProvider::new("numbers", partitions))
    }

    #[tokio::test]
    async fn test_two_fragment_query_completes() {
        let executor = executor(StageUnitRegistry::with_builtins());
        let plan = QueryPlan::new(vec![
            FragmentPlan::source(
                FragmentId(0),
                2,
                StageId(0),
                numbers(vec![
                    vec![batch(vec![1, 2]), batch(vec![3])],
                    vec![batch(vec![4, 5, 6])],
                ]),
            )
            .with_stage(limit(1, 100)),
            FragmentPlan::exchange(FragmentId(1), 1, StageId(2), FragmentId(0)).with_stage(sum(3)),
        ])
        .unwrap();

        let execution = executor.execute(plan, ExecuteOptions::default()).unwrap();
        assert_eq!(execution.wait().await, QueryStatus::Finished);
        assert_eq!(total(&collect(&execution).await), 21);

        let stats = execution.stats();
        assert_eq!(stats.attempts, 1);
        assert_eq!(stats.tasks_launched, 3);
        assert_eq!(stats.output_rows, 1);
        assert_eq!(execution.root_output().unwrap().epoch, 1);
        assert_eq!(executor.active_query_count(), 0);
    }

    #[tokio::test]
    async fn test_single_slot_runs_producer_and_consumer() {
        let mut config = ExecutorConfig::default().with_max_concurrent_tasks(1);
        config.output_buffer.max_buffered_bytes = 1;
        config.exchange = config
            .exchange
            .with_max_buffered_bytes(1)
            .with_max_response_bytes(1);
        let executor = DistributedExecutor::new(
            config,
            Arc::new(StageUnitRegistry::with_builtins()),
            Arc::new(InMemorySnapshotStore::new()),
        );
        let rows: Vec<RecordBatch> = (1..=40).map(|v| batch(vec![v])).collect();
        let plan = QueryPlan::new(vec![
            FragmentPlan::source(FragmentId(0), 1, StageId(0), numbers(vec![rows]))
                .with_stage(limit(1, 100)),
            FragmentPlan::exchange(FragmentId(1), 1, StageId(2), FragmentId(0)).with_stage(sum(3)),
        ])
        .unwrap();

        let execution = executor.execute(plan, ExecuteOptions::default()).unwrap();
        let status = tokio::time::timeout(Duration::from_secs(5), execution.wait())
            .await
            .unwrap();
        assert_eq!(status, QueryStatus::Finished);
        assert_eq!(total(&collect(&execution).await), (1..=40).sum::<i64>());
        assert_eq!(execution.stats().output_rows, 1);
    }

    #[tokio::test]
    async fn test_unknown_stage_kind_is_rejected() {
        let executor = executor(StageUnitRegistry::with_builtins());
        let plan = QueryPlan::new(vec![FragmentPlan::source(
            FragmentId(0),
            1,
            StageId(0),
            numbers(vec![vec![]]),
        )
        .with_stage(StageSpec::new(StageId(1), "window", json!({})))])
        .unwrap();
        assert!(matches!(
            executor.execute(plan, ExecuteOptions::default()),
            Err(DistributedError::InvalidPlan(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_limit_fails_query() {
        let config = ExecutorConfig::default().with_query_memory_limit(1);
        let executor = DistributedExecutor::new(
            config,
            Arc::new(StageUnitRegistry::with_builtins()),
            Arc::new(InMemorySnapshotStore::new()),
        );
        let plan = QueryPlan::new(vec![
            FragmentPlan::source(
                FragmentId(0),
                1,
                StageId(0),
                numbers(vec![vec![batch((0..1000).collect())]]),
            )
            .with_stage(limit(1, 10_000)),
            FragmentPlan::exchange(FragmentId(1), 1, StageId(2), FragmentId(0)).with_stage(sum(3)),
        ])
        .unwrap();

        let execution = executor.execute(plan, ExecuteOptions::default()).unwrap();
        assert_eq!(execution.wait().await, QueryStatus::Failed);
        let failure = execution.failure().unwrap();
        assert_eq!(failure.error_code(), ErrorCode::ExceededMemoryLimit);
        assert_eq!(execution.stats().recoveries, 0);
    }

    /// Passes batches through, blocking after each threshold until its gate opens
    struct GateStage {
        id: StageId,
        gates: Vec<(u64, Readiness, Readiness)>,
        passed: u64,
        pending: Option<RecordBatch>,
        finishing: bool,
    }

    impl StageUnit for GateStage {
        fn stage_id(&self) -> StageId {
            self.id
        }

        fn name(&self) -> &str {
            "gate"
        }

        fn needs_input(&self) -> bool {
            self.pending.is_none() && !self.finishing
        }

        fn add_input(&mut self, batch: RecordBatch) -> query_core::Result<()> {
            self.pending = Some(batch);
            Ok(())
        }

        fn is_blocked(&self) -> Blocked {
            for (threshold, gate, reached) in &self.gates {
                if self.passed >= *threshold && !gate.is_ready() {
                    reached.set_ready();
                    return Blocked::on(gate);
                }
            }
            Blocked::NotBlocked
        }

        fn get_output(&mut self) -> query_core::Result<Option<RecordBatch>> {
            if self.is_blocked().is_blocked() {
                return Ok(None);
            }
            let batch = self.pending.take();
            if batch.is_some() {
                self.passed += 1;
            }
            Ok(batch)
        }

        fn finish(&mut self) -> query_core::Result<()> {
            self.finishing = true;
            Ok(())
        }

        fn is_finished(&self) -> bool {
            self.finishing && self.pending.is_none()
        }

        fn capture(&self) -> query_core::Result<StageState> {
            if self.pending.is_some() {
                return Err(QueryError::SnapshotUnsupported {
                    stage: "gate".to_string(),
                });
            }
            StageState::encode(&self.passed)
        }

        fn restore(&mut self, state: &StageState) -> query_core::Result<()> {
            self.passed = state.decode()?;
            Ok(())
        }
    }

    struct GateFactory {
        gates: Vec<(u64, Readiness, Readiness)>,
    }

    impl StageUnitFactory for GateFactory {
        fn kind(&self) -> &'static str {
            "gate"
        }

        fn capabilities(&self) -> StageCapabilities {
            StageCapabilities { snapshot: true }
        }

        fn create(&self, spec: &StageSpec) -> query_core::Result<Box<dyn StageUnit>> {
            Ok(Box::new(GateStage {
                id: spec.id,
                gates: self.gates.clone(),
                passed: 0,
                pending: None,
                finishing: false,
            }))
        }
    }

    struct Gate {
        open: Readiness,
        reached: Readiness,
    }

    fn gated_executor(thresholds: &[u64]) -> (Arc<DistributedExecutor>, Vec<Gate>) {
        gated_executor_with(thresholds, FaultConfig::default().with_recovery_delay_ms(5))
    }

    fn gated_executor_with(
        thresholds: &[u64],
        fault: FaultConfig,
    ) -> (Arc<DistributedExecutor>, Vec<Gate>) {
        let gates: Vec<Gate> = thresholds
            .iter()
            .map(|_| Gate {
                open: Readiness::new("gate"),
                reached: Readiness::new("gate-reached"),
            })
            .collect();
        let mut registry = StageUnitRegistry::with_builtins();
        registry
            .register(Arc::new(GateFactory {
                gates: thresholds
                    .iter()
                    .zip(&gates)
                    .map(|(t, g)| (*t, g.open.clone(), g.reached.clone()))
                    .collect(),
            }))
            .unwrap();
        (executor_with(registry, fault), gates)
    }

    fn gated_plan() -> QueryPlan {
        QueryPlan::new(vec![
            FragmentPlan::source(
                FragmentId(0),
                1,
                StageId(0),
                numbers(vec![(1..=6).map(|v| batch(vec![v])).collect()]),
            )
            .with_stage(StageSpec::new(StageId(1), "gate", json!({}))),
            FragmentPlan::exchange(FragmentId(1), 1, StageId(2), FragmentId(0)).with_stage(sum(3)),
        ])
        .unwrap()
    }

    async fn reached(gate: &Gate) {
        tokio::time::timeout(Duration::from_secs(5), gate.reached.wait())
            .await
            .unwrap();
    }

    async fn wait_for_epoch(execution: &QueryExecution, epoch: u64) {
        for _ in 0..500 {
            if execution.root_output().is_some_and(|root| root.epoch == epoch)
                && execution.status() == QueryStatus::Running
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("query never reached epoch {}", epoch);
    }

    #[tokio::test]
    async fn test_killed_task_recovers_from_snapshot() {
        let (executor, gates) = gated_executor(&[2, 4]);
        let execution = executor
            .execute(gated_plan(), ExecuteOptions::default())
            .unwrap();
        let query = execution.query_id();

        // two batches have passed; snapshot 1 is taken right after them
        reached(&gates[0]).await;
        let snapshot = executor.coordinator().trigger(query).unwrap();
        gates[0].open.set_ready();
        reached(&gates[1]).await;
        for _ in 0..500 {
            if executor.coordinator().latest_complete(query) == Some(snapshot) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(executor.coordinator().latest_complete(query), Some(snapshot));

        executor
            .kill_task(query, TaskLocation::new(FragmentId(0), PartitionId(0)))
            .unwrap();
        wait_for_epoch(&execution, 2).await;
        assert_eq!(execution.root_output().unwrap().restored_from, Some(snapshot));

        gates[1].open.set_ready();
        assert_eq!(execution.wait().await, QueryStatus::Finished);
        // replayed batches are not counted twice
        assert_eq!(total(&collect(&execution).await), 21);
        assert_eq!(execution.stats().recoveries, 1);
        assert_eq!(execution.stats().attempts, 2);
        assert_eq!(executor.faults().recoveries(query), 1);
    }

    #[tokio::test]
    async fn test_snapshot_after_short_partition_finished() {
        let (executor, gates) = gated_executor(&[2, 4]);
        let plan = QueryPlan::new(vec![
            FragmentPlan::source(
                FragmentId(0),
                2,
                StageId(0),
                numbers(vec![
                    (1..=6).map(|v| batch(vec![v])).collect(),
                    vec![batch(vec![100])],
                ]),
            )
            .with_stage(StageSpec::new(StageId(1), "gate", json!({}))),
            FragmentPlan::exchange(FragmentId(1), 1, StageId(2), FragmentId(0)).with_stage(sum(3)),
        ])
        .unwrap();
        let execution = executor.execute(plan, ExecuteOptions::default()).unwrap();
        let query = execution.query_id();

        // partition 1 is done while partition 0 waits at its first gate
        reached(&gates[0]).await;
        for _ in 0..500 {
            if executor.worker().active_task_count() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(executor.worker().active_task_count(), 2);

        let snapshot = executor.coordinator().trigger(query).unwrap();
        gates[0].open.set_ready();
        reached(&gates[1]).await;
        for _ in 0..500 {
            if executor.coordinator().latest_complete(query) == Some(snapshot) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(executor.coordinator().latest_complete(query), Some(snapshot));

        executor
            .kill_task(query, TaskLocation::new(FragmentId(0), PartitionId(0)))
            .unwrap();
        wait_for_epoch(&execution, 2).await;
        assert_eq!(execution.root_output().unwrap().restored_from, Some(snapshot));

        gates[1].open.set_ready();
        assert_eq!(execution.wait().await, QueryStatus::Finished);
        assert_eq!(total(&collect(&execution).await), 21 + 100);
    }

    #[tokio::test]
    async fn test_killed_task_without_snapshot_restarts() {
        let (executor, gates) = gated_executor(&[3]);
        let execution = executor
            .execute(gated_plan(), ExecuteOptions::default())
            .unwrap();
        let query = execution.query_id();

        reached(&gates[0]).await;
        executor
            .kill_task(query, TaskLocation::new(FragmentId(1), PartitionId(0)))
            .unwrap();
        wait_for_epoch(&execution, 2).await;
        assert_eq!(execution.root_output().unwrap().restored_from, None);

        gates[0].open.set_ready();
        assert_eq!(execution.wait().await, QueryStatus::Finished);
        assert_eq!(total(&collect(&execution).await), 21);
    }

    #[tokio::test]
    async fn test_cancel_stops_blocked_query() {
        let (executor, gates) = gated_executor(&[1]);
        let execution = executor
            .execute(gated_plan(), ExecuteOptions::default())
            .unwrap();
        reached(&gates[0]).await;

        executor.cancel_query(execution.query_id()).unwrap();
        assert_eq!(execution.wait().await, QueryStatus::Cancelled);
        assert!(execution.failure().is_none());
        assert!(execution.root_output().unwrap().buffers[0].is_aborted());
        assert!(executor.kill_task(QueryId::new(), TaskLocation::result_sink()).is_err());

        executor.cleanup_completed();
        assert!(executor.get(execution.query_id()).is_none());
    }

    #[tokio::test]
    async fn test_recovery_budget_exhausted() {
        let (executor, gates) = gated_executor_with(
            &[1],
            FaultConfig::default()
                .with_max_recoveries(0)
                .with_recovery_delay_ms(1),
        );
        let execution = executor
            .execute(gated_plan(), ExecuteOptions::default())
            .unwrap();
        reached(&gates[0]).await;
        executor
            .kill_task(
                execution.query_id(),
                TaskLocation::new(FragmentId(0), PartitionId(0)),
            )
            .unwrap();
        assert_eq!(execution.wait().await, QueryStatus::Failed);
        assert_eq!(
            execution.failure().unwrap().error_code(),
            ErrorCode::RemoteTaskFailed
        );
    }
}
