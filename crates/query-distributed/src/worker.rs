//! Worker pool that runs pipelines

use crate::error::{DistributedError, Result};
use crate::types::{WorkerId, WorkerStatus};
use parking_lot::RwLock;
use query_core::{QueryId, TaskLocation};
use query_executor::{wait_any, Pipeline, PipelineStats, ProcessOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// Runs pipelines on the tokio runtime, at most `max_tasks` quanta at a time
pub struct Worker {
    /// Unique worker ID
    id: WorkerId,
    /// Current status
    status: RwLock<WorkerStatus>,
    /// Active task count
    active_tasks: RwLock<usize>,
    /// Maximum concurrent tasks
    max_tasks: usize,
    /// Execution slots
    permits: Semaphore,
}

impl Worker {
    /// Create a new worker
    pub fn new(max_tasks: usize) -> Arc<Self> {
        let max_tasks = max_tasks.max(1);
        Arc::new(Self {
            id: WorkerId::new(),
            status: RwLock::new(WorkerStatus::Active),
            active_tasks: RwLock::new(0),
            max_tasks,
            permits: Semaphore::new(max_tasks),
        })
    }

    /// Get worker ID
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Get current status
    pub fn status(&self) -> WorkerStatus {
        *self.status.read()
    }

    /// Get active task count, waiting tasks included
    pub fn active_task_count(&self) -> usize {
        *self.active_tasks.read()
    }

    pub fn max_tasks(&self) -> usize {
        self.max_tasks
    }

    /// Run a pipeline, one quantum per free slot
    pub fn spawn(
        self: &Arc<Self>,
        query_id: QueryId,
        pipeline: Pipeline,
    ) -> Result<JoinHandle<query_core::Result<PipelineStats>>> {
        if self.status() != WorkerStatus::Active {
            return Err(DistributedError::WorkerUnavailable(format!(
                "{} is {}",
                self.id,
                self.status()
            )));
        }
        *self.active_tasks.write() += 1;

        let worker = self.clone();
        let task: TaskLocation = pipeline.task();
        Ok(tokio::spawn(async move {
            tracing::debug!("Worker {} runs task {} of query {}", worker.id, task, query_id);
            let result = worker.drive(pipeline).await;
            {
                let mut count = worker.active_tasks.write();
                *count = count.saturating_sub(1);
            }
            match &result {
                Ok(stats) => tracing::debug!(
                    "Task {} of query {} finished: {} rows out",
                    task,
                    query_id,
                    stats.output_rows
                ),
                Err(err) => tracing::warn!("Task {} of query {} failed: {}", task, query_id, err),
            }
            result
        }))
    }

    /// Run quanta until the pipeline finishes. A slot is held only while a
    /// quantum runs; a blocked pipeline waits for its readiness without one.
    async fn drive(&self, mut pipeline: Pipeline) -> query_core::Result<PipelineStats> {
        let cancel = pipeline.cancellation();
        loop {
            let outcome = {
                let _permit = self.permits.acquire().await.map_err(|_| {
                    query_core::QueryError::Cancelled(format!(
                        "worker {} shut down while task {} waited for a slot",
                        self.id,
                        pipeline.task()
                    ))
                })?;
                pipeline.process()?
            };
            match outcome {
                ProcessOutcome::Finished => return Ok(pipeline.stats().clone()),
                ProcessOutcome::Yield => tokio::task::yield_now().await,
                ProcessOutcome::Blocked(waits) => {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = wait_any(&waits) => {}
                    }
                }
            }
        }
    }

    /// Slots not taken by a running quantum
    pub fn idle_slots(&self) -> usize {
        self.permits.available_permits()
    }

    /// Shutdown the worker
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down worker {}", self.id);
        *self.status.write() = WorkerStatus::Draining;

        // Wait for active tasks to complete
        while self.active_task_count() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        self.permits.close();
        *self.status.write() = WorkerStatus::Removed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;
    use query_core::{FragmentId, PartitionId, StageId};
    use query_executor::stages::limit::LimitStage;
    use query_executor::{CollectOutput, PipelineConfig, QueueInput};

    fn batch(v: i64) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(vec![v]))]).unwrap()
    }

    fn pipeline(partition: u32) -> (Pipeline, query_executor::QueueHandle) {
        let (input, handle) = QueueInput::new();
        let pipeline = Pipeline::new(
            TaskLocation::new(FragmentId(0), PartitionId(partition)),
            Box::new(input),
            StageId(0),
            vec![Box::new(LimitStage::new(StageId(1), 10))],
            Box::new(CollectOutput::new()),
            PipelineConfig::default(),
        )
        .unwrap();
        (pipeline, handle)
    }

    #[test]
    fn test_worker_creation() {
        let worker = Worker::new(0);
        assert_eq!(worker.status(), WorkerStatus::Active);
        assert_eq!(worker.active_task_count(), 0);
        assert_eq!(worker.max_tasks(), 1);
    }

    #[tokio::test]
    async fn test_blocked_task_gives_up_its_slot() {
        let worker = Worker::new(1);
        let query = QueryId::new();
        let (first, first_input) = pipeline(0);
        let (second, second_input) = pipeline(1);

        // the first task blocks on its empty input and must not keep the only slot
        let first = worker.spawn(query, first).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(worker.idle_slots(), 1);
        assert!(!first.is_finished());

        let second = worker.spawn(query, second).unwrap();
        assert_eq!(worker.active_task_count(), 2);
        second_input.push_batch(batch(2));
        second_input.finish();
        let stats = tokio::time::timeout(Duration::from_secs(1), second)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(stats.output_rows, 1);
        assert!(!first.is_finished());

        first_input.push_batch(batch(1));
        first_input.finish();
        assert_eq!(first.await.unwrap().unwrap().output_rows, 1);
        assert_eq!(worker.active_task_count(), 0);
        assert_eq!(worker.idle_slots(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_tasks() {
        let worker = Worker::new(2);
        worker.shutdown().await;
        assert_eq!(worker.status(), WorkerStatus::Removed);
        let (pipeline, _input) = pipeline(0);
        assert!(matches!(
            worker.spawn(QueryId::new(), pipeline),
            Err(DistributedError::WorkerUnavailable(_))
        ));
    }
}
