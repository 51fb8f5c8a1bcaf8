//! Cooperative pipeline driver.
//!
//! A [`Pipeline`] moves batches from its input through an ordered list of
//! stage units into its output. One call to [`Pipeline::process`] is one
//! scheduling quantum: it keeps moving data until nothing can progress or the
//! quantum's iteration budget is spent, then reports whether the pipeline
//! finished, wants to yield, or is blocked on a set of readiness signals.
//!
//! Snapshot markers are delivered stage by stage. A marker waiting at the
//! inbound edge of stage `i + 1` is delivered (and that stage captured) before
//! stage `i` is asked for any more output, so no post-capture output overtakes
//! the marker.

use crate::element::{CapturedStates, Marker, SealedMarker, SnapshotReporter, StageState, StreamElement};
use crate::input::{InputPoll, PipelineInput};
use crate::memory::MemoryContext;
use crate::readiness::{wait_any, Readiness};
use crate::stage::{Blocked, StageUnit};
use parking_lot::Mutex;
use query_core::{QueryError, Result, StageId, TaskLocation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Configuration for pipeline drivers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Data movement rounds per scheduling quantum before yielding
    pub max_iterations_per_quantum: usize,
    /// Per-pipeline memory ceiling in bytes
    pub memory_limit: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_iterations_per_quantum: 64,
            memory_limit: None,
        }
    }
}

impl PipelineConfig {
    pub fn with_memory_limit(mut self, limit: u64) -> Self {
        self.memory_limit = Some(limit);
        self
    }

    pub fn with_max_iterations(mut self, iterations: usize) -> Self {
        self.max_iterations_per_quantum = iterations.max(1);
        self
    }
}

/// Where a pipeline's output goes
pub trait PipelineOutput: Send {
    /// Back-pressure: blocked while the output cannot take more batches
    fn is_full(&self) -> Blocked;

    fn push(&mut self, element: StreamElement) -> Result<()>;

    fn finish(&mut self) -> Result<()>;

    /// The pipeline failed; readers should observe a failure instead of end-of-data
    fn abort(&mut self) {}
}

/// Output that collects elements in memory, optionally bounded to `capacity` batches
#[derive(Debug, Clone)]
pub struct CollectOutput {
    shared: Arc<Mutex<CollectState>>,
    capacity: Option<usize>,
}

#[derive(Debug)]
struct CollectState {
    elements: Vec<StreamElement>,
    finished: bool,
    aborted: bool,
    space: Readiness,
}

impl CollectOutput {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(CollectState {
                elements: Vec::new(),
                finished: false,
                aborted: false,
                space: Readiness::ready("collect-output"),
            })),
            capacity: None,
        }
    }

    pub fn bounded(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::new()
        }
    }

    /// Remove and return everything collected so far
    pub fn drain(&self) -> Vec<StreamElement> {
        let mut state = self.shared.lock();
        state.space.set_ready();
        std::mem::take(&mut state.elements)
    }

    pub fn batches(&self) -> Vec<arrow::record_batch::RecordBatch> {
        self.shared
            .lock()
            .elements
            .iter()
            .filter_map(|element| match element {
                StreamElement::Batch(batch) => Some(batch.clone()),
                StreamElement::Marker(_) => None,
            })
            .collect()
    }

    pub fn markers(&self) -> Vec<Marker> {
        self.shared
            .lock()
            .elements
            .iter()
            .filter_map(|element| match element {
                StreamElement::Marker(marker) => Some(*marker),
                StreamElement::Batch(_) => None,
            })
            .collect()
    }

    pub fn elements(&self) -> Vec<StreamElement> {
        self.shared.lock().elements.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.shared.lock().finished
    }

    pub fn is_aborted(&self) -> bool {
        self.shared.lock().aborted
    }
}

impl Default for CollectOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineOutput for CollectOutput {
    fn is_full(&self) -> Blocked {
        let mut state = self.shared.lock();
        match self.capacity {
            Some(capacity) if state.elements.len() >= capacity => {
                if state.space.is_ready() {
                    state.space = Readiness::new("collect-output");
                }
                Blocked::Waiting(state.space.clone())
            }
            _ => Blocked::NotBlocked,
        }
    }

    fn push(&mut self, element: StreamElement) -> Result<()> {
        self.shared.lock().elements.push(element);
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.shared.lock().finished = true;
        Ok(())
    }

    fn abort(&mut self) {
        self.shared.lock().aborted = true;
    }
}

/// Outcome of one scheduling quantum
#[derive(Debug)]
pub enum ProcessOutcome {
    Finished,
    /// Progress was made but the quantum is spent
    Yield,
    /// Nothing can move until one of these is ready
    Blocked(Vec<Readiness>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineState {
    Running,
    Finished,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineStats {
    pub input_batches: u64,
    pub input_rows: u64,
    pub output_batches: u64,
    pub output_rows: u64,
    pub markers: u64,
    pub quanta: u64,
    pub peak_memory_bytes: u64,
}

/// Marker travelling between stages, collecting captured states
#[derive(Debug)]
struct InFlightMarker {
    marker: Marker,
    captured: CapturedStates,
}

impl InFlightMarker {
    fn new(marker: Marker) -> Self {
        Self {
            marker,
            captured: CapturedStates::Complete(Vec::new()),
        }
    }

    fn attach(&mut self, stage: StageId, result: Result<StageState>) {
        if let Err(err) = &result {
            tracing::debug!(
                "Stage {} could not be captured for snapshot {}: {}",
                stage,
                self.marker.snapshot_id,
                err
            );
        }
        self.captured.push(stage, result);
    }
}

struct StageSlot {
    unit: Box<dyn StageUnit>,
    /// Marker waiting to be delivered into this unit
    inbound: Option<InFlightMarker>,
    finish_sent: bool,
}

/// An ordered chain of stage units driven by one task at a time
pub struct Pipeline {
    task: TaskLocation,
    input: Box<dyn PipelineInput>,
    input_id: StageId,
    input_finished: bool,
    stages: Vec<StageSlot>,
    output: Box<dyn PipelineOutput>,
    output_finished: bool,
    memory: MemoryContext,
    reporter: Option<Arc<dyn SnapshotReporter>>,
    cancel: CancellationToken,
    config: PipelineConfig,
    state: PipelineState,
    stats: PipelineStats,
}

impl Pipeline {
    /// Assemble a pipeline. `input_id` names the input's slot in snapshots.
    pub fn new(
        task: TaskLocation,
        input: Box<dyn PipelineInput>,
        input_id: StageId,
        units: Vec<Box<dyn StageUnit>>,
        output: Box<dyn PipelineOutput>,
        config: PipelineConfig,
    ) -> Result<Self> {
        if units.is_empty() {
            return Err(QueryError::IllegalState(format!(
                "pipeline {} has no stages",
                task
            )));
        }
        let memory = MemoryContext::new(task.to_string(), units.len(), config.memory_limit);
        Ok(Self {
            task,
            input,
            input_id,
            input_finished: false,
            stages: units
                .into_iter()
                .map(|unit| StageSlot {
                    unit,
                    inbound: None,
                    finish_sent: false,
                })
                .collect(),
            output,
            output_finished: false,
            memory,
            reporter: None,
            cancel: CancellationToken::new(),
            config,
            state: PipelineState::Running,
            stats: PipelineStats::default(),
        })
    }

    /// Replace the standalone memory context, e.g. with one charging a query pool
    pub fn with_memory(mut self, memory: MemoryContext) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn SnapshotReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn task(&self) -> TaskLocation {
        self.task
    }

    /// Token that cancels this pipeline
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn memory(&self) -> &MemoryContext {
        &self.memory
    }

    /// Ids of every snapshot slot: the input followed by each stage
    pub fn snapshot_ids(&self) -> Vec<StageId> {
        std::iter::once(self.input_id)
            .chain(self.stages.iter().map(|slot| slot.unit.stage_id()))
            .collect()
    }

    /// Load captured states before the first quantum runs
    pub fn restore(&mut self, states: &HashMap<StageId, StageState>) -> Result<()> {
        if self.state != PipelineState::Running || self.stats.quanta > 0 {
            return Err(QueryError::IllegalState(format!(
                "pipeline {} can only be restored before it runs",
                self.task
            )));
        }
        if let Some(state) = states.get(&self.input_id) {
            self.input.restore(state)?;
        }
        for (idx, slot) in self.stages.iter_mut().enumerate() {
            let id = slot.unit.stage_id();
            let state = states.get(&id).ok_or_else(|| {
                QueryError::Checkpoint(format!(
                    "snapshot has no state for stage {} of task {}",
                    id, self.task
                ))
            })?;
            slot.unit.restore(state)?;
            self.memory.set_reservation(idx, slot.unit.retained_bytes())?;
        }
        tracing::debug!("Restored pipeline {} from {} states", self.task, states.len());
        Ok(())
    }

    /// Run one scheduling quantum
    pub fn process(&mut self) -> Result<ProcessOutcome> {
        match self.state {
            PipelineState::Finished => return Ok(ProcessOutcome::Finished),
            PipelineState::Failed => {
                return Err(QueryError::IllegalState(format!(
                    "pipeline {} already failed",
                    self.task
                )))
            }
            PipelineState::Running => {}
        }
        if self.cancel.is_cancelled() {
            self.abort();
            return Err(QueryError::Cancelled(format!("task {}", self.task)));
        }
        self.stats.quanta += 1;

        match self.run_quantum() {
            Ok(outcome) => {
                self.stats.peak_memory_bytes = self.memory.peak();
                Ok(outcome)
            }
            Err(err) => {
                self.abort();
                Err(err)
            }
        }
    }

    /// Drive the pipeline to completion, suspending on readiness while blocked
    pub async fn run(mut self) -> Result<PipelineStats> {
        loop {
            match self.process()? {
                ProcessOutcome::Finished => return Ok(self.stats.clone()),
                ProcessOutcome::Yield => tokio::task::yield_now().await,
                ProcessOutcome::Blocked(waits) => {
                    let cancel = self.cancel.clone();
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = wait_any(&waits) => {}
                    }
                }
            }
        }
    }

    fn run_quantum(&mut self) -> Result<ProcessOutcome> {
        let mut waits = Vec::new();
        let mut stalled = false;
        for _ in 0..self.config.max_iterations_per_quantum {
            waits.clear();
            let mut progress = false;

            self.step_input(&mut progress, &mut waits)?;
            for idx in 0..self.stages.len() {
                self.deliver_marker(idx, &mut progress, &mut waits)?;
                self.step_edge(idx, &mut progress, &mut waits)?;
            }

            if self.is_done() {
                self.complete();
                return Ok(ProcessOutcome::Finished);
            }
            if progress {
                stalled = false;
                continue;
            }
            if !waits.is_empty() {
                return Ok(ProcessOutcome::Blocked(waits));
            }
            // get_output may have changed a unit's state (e.g. started a
            // commit) without producing anything; look once more before
            // treating the pipeline as stuck
            if stalled {
                return Err(self.stall_error());
            }
            stalled = true;
        }
        Ok(ProcessOutcome::Yield)
    }

    /// No unit moved data and none named a signal to wait on
    fn stall_error(&self) -> QueryError {
        let pending: Vec<String> = self
            .stages
            .iter()
            .filter(|slot| !slot.unit.is_finished())
            .map(|slot| format!("{} ({})", slot.unit.stage_id(), slot.unit.name()))
            .collect();
        QueryError::IllegalState(format!(
            "pipeline {} stalled: no progress and nothing to wait on; unfinished stages: [{}]",
            self.task,
            pending.join(", ")
        ))
    }

    fn step_input(&mut self, progress: &mut bool, waits: &mut Vec<Readiness>) -> Result<()> {
        let first = &mut self.stages[0];
        if first.inbound.is_some() || first.finish_sent {
            return Ok(());
        }
        if let Blocked::Waiting(readiness) = first.unit.is_blocked() {
            waits.push(readiness);
            return Ok(());
        }

        if !self.input_finished && first.unit.needs_input() {
            match self.input.poll_next()? {
                InputPoll::Element(StreamElement::Batch(batch)) => {
                    self.stats.input_batches += 1;
                    self.stats.input_rows += batch.num_rows() as u64;
                    first.unit.add_input(batch)?;
                    self.memory.set_reservation(0, first.unit.retained_bytes())?;
                    *progress = true;
                }
                InputPoll::Element(StreamElement::Marker(marker)) => {
                    let mut in_flight = InFlightMarker::new(marker);
                    match self.input.capture() {
                        Ok(Some(state)) => in_flight.attach(self.input_id, Ok(state)),
                        Ok(None) => {}
                        Err(err) => in_flight.attach(self.input_id, Err(err)),
                    }
                    first.inbound = Some(in_flight);
                    *progress = true;
                    return Ok(());
                }
                InputPoll::Pending(readiness) => waits.push(readiness),
                InputPoll::Finished => {
                    self.input_finished = true;
                    *progress = true;
                }
            }
        }

        let first = &mut self.stages[0];
        if self.input_finished && first.inbound.is_none() && !first.finish_sent {
            if !first.unit.is_finished() {
                first.unit.finish()?;
            }
            first.finish_sent = true;
            self.memory.set_reservation(0, first.unit.retained_bytes())?;
            *progress = true;
        }
        Ok(())
    }

    /// Deliver a waiting marker into stage `idx`, capture it, and pass it on
    fn deliver_marker(
        &mut self,
        idx: usize,
        progress: &mut bool,
        waits: &mut Vec<Readiness>,
    ) -> Result<()> {
        if self.stages[idx].inbound.is_none() {
            return Ok(());
        }
        let last = idx + 1 == self.stages.len();
        if !last && self.stages[idx + 1].inbound.is_some() {
            return Ok(());
        }
        let slot = &mut self.stages[idx];
        if let Blocked::Waiting(readiness) = slot.unit.is_blocked() {
            waits.push(readiness);
            return Ok(());
        }
        let Some(mut in_flight) = slot.inbound.take() else {
            return Ok(());
        };
        in_flight.attach(slot.unit.stage_id(), slot.unit.capture());

        if last {
            self.seal(in_flight)?;
        } else {
            self.stages[idx + 1].inbound = Some(in_flight);
        }
        *progress = true;
        Ok(())
    }

    /// Move one batch (or the finish signal) from stage `idx` to its downstream
    fn step_edge(&mut self, idx: usize, progress: &mut bool, waits: &mut Vec<Readiness>) -> Result<()> {
        let last = idx + 1 == self.stages.len();
        let (upstream, downstream) = self.stages.split_at_mut(idx + 1);
        let up = &mut upstream[idx];

        if up.unit.is_finished() {
            if last {
                if !self.output_finished && up.inbound.is_none() {
                    self.output.finish()?;
                    self.output_finished = true;
                    *progress = true;
                }
            } else {
                let down = &mut downstream[0];
                if !down.finish_sent && down.inbound.is_none() {
                    if let Blocked::Waiting(readiness) = down.unit.is_blocked() {
                        waits.push(readiness);
                        return Ok(());
                    }
                    if !down.unit.is_finished() {
                        down.unit.finish()?;
                    }
                    down.finish_sent = true;
                    self.memory.set_reservation(idx + 1, down.unit.retained_bytes())?;
                    *progress = true;
                }
            }
            return Ok(());
        }

        if last {
            if let Blocked::Waiting(readiness) = self.output.is_full() {
                waits.push(readiness);
                return Ok(());
            }
        } else {
            let down = &downstream[0];
            if down.inbound.is_some() || down.finish_sent {
                return Ok(());
            }
            if down.unit.is_finished() {
                // downstream completed early; drop what upstream still produces
                if let Blocked::Waiting(readiness) = up.unit.is_blocked() {
                    waits.push(readiness);
                    return Ok(());
                }
                if up.unit.get_output()?.is_some() {
                    *progress = true;
                }
                self.memory.set_reservation(idx, up.unit.retained_bytes())?;
                return Ok(());
            }
            if let Blocked::Waiting(readiness) = down.unit.is_blocked() {
                waits.push(readiness);
                return Ok(());
            }
            if !down.unit.needs_input() {
                return Ok(());
            }
        }

        if let Blocked::Waiting(readiness) = up.unit.is_blocked() {
            waits.push(readiness);
            return Ok(());
        }

        let output = up.unit.get_output()?;
        self.memory.set_reservation(idx, up.unit.retained_bytes())?;
        let Some(batch) = output else {
            return Ok(());
        };

        if last {
            self.stats.output_batches += 1;
            self.stats.output_rows += batch.num_rows() as u64;
            self.output.push(StreamElement::Batch(batch))?;
        } else {
            let down = &mut downstream[0];
            down.unit.add_input(batch)?;
            self.memory.set_reservation(idx + 1, down.unit.retained_bytes())?;
        }
        *progress = true;
        Ok(())
    }

    fn seal(&mut self, in_flight: InFlightMarker) -> Result<()> {
        let marker = in_flight.marker;
        self.stats.markers += 1;
        tracing::debug!(
            "Pipeline {} sealed marker for snapshot {} (complete: {})",
            self.task,
            marker.snapshot_id,
            in_flight.captured.is_complete()
        );
        if let Some(reporter) = &self.reporter {
            reporter.report(SealedMarker {
                marker,
                task: self.task,
                captured: in_flight.captured,
            });
        }
        self.output.push(StreamElement::Marker(marker))
    }

    fn is_done(&self) -> bool {
        self.output_finished
            && self
                .stages
                .iter()
                .all(|slot| slot.unit.is_finished() && slot.inbound.is_none())
    }

    fn complete(&mut self) {
        self.state = PipelineState::Finished;
        self.stats.peak_memory_bytes = self.memory.peak();
        if let Some(reporter) = &self.reporter {
            reporter.finished(self.task, self.capture_final());
        }
        self.teardown();
        tracing::debug!(
            "Pipeline {} finished: {} rows in, {} rows out",
            self.task,
            self.stats.input_rows,
            self.stats.output_rows
        );
    }

    /// States of the input and every stage after the pipeline finished
    fn capture_final(&self) -> CapturedStates {
        let mut captured = CapturedStates::Complete(Vec::new());
        match self.input.capture() {
            Ok(Some(state)) => captured.push(self.input_id, Ok(state)),
            Ok(None) => {}
            Err(err) => captured.push(self.input_id, Err(err)),
        }
        for slot in &self.stages {
            captured.push(slot.unit.stage_id(), slot.unit.capture());
        }
        captured
    }

    fn abort(&mut self) {
        if self.state != PipelineState::Running {
            return;
        }
        self.state = PipelineState::Failed;
        self.output.abort();
        self.teardown();
    }

    fn teardown(&mut self) {
        self.input.close();
        for slot in &mut self.stages {
            slot.unit.close();
        }
        self.memory.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::{MarkerInjector, MemoryBatchSource, QueueInput, SourceInput};
    use crate::stages::aggregation::{AggregateFunction, AggregateSpec, AggregationStage};
    use crate::stages::limit::LimitStage;
    use arrow::array::{Array, Int64Array};
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;
    use query_core::{FragmentId, PartitionId, SnapshotId};
    use std::time::Duration;

    fn batch(values: Vec<i64>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, true)]));
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values))]).unwrap()
    }

    fn location() -> TaskLocation {
        TaskLocation::new(FragmentId(0), PartitionId(0))
    }

    fn sum_stage(id: u32) -> Box<dyn StageUnit> {
        Box::new(AggregationStage::new(
            StageId(id),
            vec![AggregateSpec::new(AggregateFunction::Sum, 0, "total")],
        ))
    }

    fn single_value(batches: &[RecordBatch]) -> i64 {
        assert_eq!(batches.len(), 1);
        batches[0]
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap()
            .value(0)
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<SealedMarker>>);

    impl SnapshotReporter for Recorder {
        fn report(&self, sealed: SealedMarker) {
            self.0.lock().push(sealed);
        }
    }

    fn drive(pipeline: &mut Pipeline) {
        for _ in 0..100 {
            match pipeline.process().unwrap() {
                ProcessOutcome::Finished => return,
                ProcessOutcome::Yield => continue,
                ProcessOutcome::Blocked(_) => panic!("pipeline unexpectedly blocked"),
            }
        }
        panic!("pipeline did not finish");
    }

    #[test]
    fn test_data_flows_through_stages() {
        let source = MemoryBatchSource::new(vec![batch(vec![1, 2]), batch(vec![3]), batch(vec![4, 5])]);
        let output = CollectOutput::new();
        let mut pipeline = Pipeline::new(
            location(),
            Box::new(SourceInput::new(Box::new(source), MarkerInjector::new(PartitionId(0)))),
            StageId(0),
            vec![Box::new(LimitStage::new(StageId(1), 4)), sum_stage(2)],
            Box::new(output.clone()),
            PipelineConfig::default(),
        )
        .unwrap();

        drive(&mut pipeline);
        assert_eq!(pipeline.state(), PipelineState::Finished);
        assert!(output.is_finished());
        assert_eq!(single_value(&output.batches()), 1 + 2 + 3 + 4);
        assert_eq!(pipeline.memory().reserved(), 0);
    }

    #[test]
    fn test_blocks_on_empty_input_and_resumes() {
        let (input, handle) = QueueInput::new();
        let output = CollectOutput::new();
        let mut pipeline = Pipeline::new(
            location(),
            Box::new(input),
            StageId(0),
            vec![sum_stage(1)],
            Box::new(output.clone()),
            PipelineConfig::default(),
        )
        .unwrap();

        let waits = match pipeline.process().unwrap() {
            ProcessOutcome::Blocked(waits) => waits,
            other => panic!("expected blocked, got {:?}", other),
        };
        assert_eq!(waits.len(), 1);

        handle.push_batch(batch(vec![10]));
        assert!(waits[0].is_ready());
        handle.finish();
        drive(&mut pipeline);
        assert_eq!(single_value(&output.batches()), 10);
    }

    #[test]
    fn test_marker_is_sealed_with_every_stage_state() {
        let injector = MarkerInjector::new(PartitionId(0));
        let source = MemoryBatchSource::new(vec![batch(vec![1]), batch(vec![2])]);
        let output = CollectOutput::new();
        let recorder = Arc::new(Recorder::default());
        let mut pipeline = Pipeline::new(
            location(),
            Box::new(SourceInput::new(Box::new(source), injector.clone())),
            StageId(0),
            vec![Box::new(LimitStage::new(StageId(1), 100)), sum_stage(2)],
            Box::new(output.clone()),
            PipelineConfig::default().with_max_iterations(1),
        )
        .unwrap()
        .with_reporter(recorder.clone());

        // first quantum moves the first batch into the limit stage
        pipeline.process().unwrap();
        injector.inject(SnapshotId(1));
        drive(&mut pipeline);

        let sealed = recorder.0.lock();
        assert_eq!(sealed.len(), 1);
        assert_eq!(sealed[0].marker.snapshot_id, SnapshotId(1));
        match &sealed[0].captured {
            CapturedStates::Complete(states) => {
                let ids: Vec<StageId> = states.iter().map(|(id, _)| *id).collect();
                assert_eq!(ids, vec![StageId(0), StageId(1), StageId(2)]);
            }
            other => panic!("expected complete capture, got {:?}", other),
        }
        assert_eq!(output.markers().len(), 1);
        assert_eq!(single_value(&output.batches()), 3);
    }

    #[test]
    fn test_restore_resumes_from_sealed_states() {
        let data = Arc::new(vec![batch(vec![1]), batch(vec![2]), batch(vec![4])]);
        let injector = MarkerInjector::new(PartitionId(0));
        let recorder = Arc::new(Recorder::default());
        let mut first = Pipeline::new(
            location(),
            Box::new(SourceInput::new(
                Box::new(MemoryBatchSource::shared(data.clone())),
                injector.clone(),
            )),
            StageId(0),
            vec![sum_stage(1)],
            Box::new(CollectOutput::new()),
            PipelineConfig::default().with_max_iterations(1),
        )
        .unwrap()
        .with_reporter(recorder.clone());

        first.process().unwrap();
        injector.inject(SnapshotId(1));
        first.process().unwrap();
        first.process().unwrap();
        let states: HashMap<StageId, StageState> = match &recorder.0.lock()[0].captured {
            CapturedStates::Complete(states) => states.iter().cloned().collect(),
            other => panic!("unexpected {:?}", other),
        };
        drop(first);

        let output = CollectOutput::new();
        let mut restored = Pipeline::new(
            location(),
            Box::new(SourceInput::new(
                Box::new(MemoryBatchSource::shared(data)),
                MarkerInjector::new(PartitionId(0)),
            )),
            StageId(0),
            vec![sum_stage(1)],
            Box::new(output.clone()),
            PipelineConfig::default(),
        )
        .unwrap();
        restored.restore(&states).unwrap();
        drive(&mut restored);
        assert_eq!(single_value(&output.batches()), 7);
    }

    #[test]
    fn test_memory_ceiling_fails_task() {
        let (input, handle) = QueueInput::new();
        let mut pipeline = Pipeline::new(
            location(),
            Box::new(input),
            StageId(0),
            vec![Box::new(LimitStage::new(StageId(1), 1_000))],
            Box::new(CollectOutput::bounded(0)),
            PipelineConfig::default().with_memory_limit(16),
        )
        .unwrap();

        handle.push_batch(batch((0..64).collect()));
        let err = pipeline.process().unwrap_err();
        assert!(matches!(err, QueryError::ExceededMemoryLimit { limit: 16, .. }));
        assert_eq!(pipeline.state(), PipelineState::Failed);
        assert_eq!(pipeline.memory().reserved(), 0);
    }

    #[test]
    fn test_back_pressure_blocks_on_full_output() {
        let source = MemoryBatchSource::new(vec![batch(vec![1]), batch(vec![2]), batch(vec![3])]);
        let output = CollectOutput::bounded(1);
        let mut pipeline = Pipeline::new(
            location(),
            Box::new(SourceInput::new(Box::new(source), MarkerInjector::new(PartitionId(0)))),
            StageId(0),
            vec![Box::new(LimitStage::new(StageId(1), 10))],
            Box::new(output.clone()),
            PipelineConfig::default(),
        )
        .unwrap();

        let waits = match pipeline.process().unwrap() {
            ProcessOutcome::Blocked(waits) => waits,
            other => panic!("expected blocked, got {:?}", other),
        };
        assert_eq!(output.batches().len(), 1);
        output.drain();
        assert!(waits.iter().any(Readiness::is_ready));
    }

    #[test]
    fn test_cancellation_aborts_output() {
        let (input, _handle) = QueueInput::new();
        let output = CollectOutput::new();
        let cancel = CancellationToken::new();
        let mut pipeline = Pipeline::new(
            location(),
            Box::new(input),
            StageId(0),
            vec![sum_stage(1)],
            Box::new(output.clone()),
            PipelineConfig::default(),
        )
        .unwrap()
        .with_cancellation(cancel.clone());

        cancel.cancel();
        assert!(matches!(pipeline.process(), Err(QueryError::Cancelled(_))));
        assert!(output.is_aborted());
    }

    struct PendingCommit(Readiness);

    impl crate::stages::table_finish::TableFinisher for PendingCommit {
        fn finish_table(&self, _fragments: &[Vec<u8>], _statistics: &[RecordBatch]) -> Result<Readiness> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_commit_in_progress_blocks_instead_of_yielding() {
        use crate::stages::table_finish::TableFinishStage;

        let (input, handle) = QueueInput::new();
        let commit = Readiness::new("commit");
        let output = CollectOutput::new();
        let mut pipeline = Pipeline::new(
            location(),
            Box::new(input),
            StageId(0),
            vec![Box::new(TableFinishStage::new(
                StageId(1),
                Arc::new(PendingCommit(commit.clone())),
                vec![AggregateSpec::new(AggregateFunction::Max, 0, "max_rows")],
            ))],
            Box::new(output.clone()),
            PipelineConfig::default(),
        )
        .unwrap();

        handle.finish();
        let waits = match pipeline.process().unwrap() {
            ProcessOutcome::Blocked(waits) => waits,
            other => panic!("expected blocked on the commit, got {:?}", other),
        };
        assert!(waits.iter().any(|wait| wait.same_as(&commit)));

        commit.set_ready();
        drive(&mut pipeline);
        assert!(output.is_finished());
        assert_eq!(output.batches().len(), 1);
    }

    /// Never produces output and never says what it waits on
    struct SilentStage;

    impl StageUnit for SilentStage {
        fn stage_id(&self) -> StageId {
            StageId(9)
        }

        fn name(&self) -> &str {
            "silent"
        }

        fn needs_input(&self) -> bool {
            false
        }

        fn add_input(&mut self, _batch: RecordBatch) -> Result<()> {
            Ok(())
        }

        fn get_output(&mut self) -> Result<Option<RecordBatch>> {
            Ok(None)
        }

        fn finish(&mut self) -> Result<()> {
            Ok(())
        }

        fn is_finished(&self) -> bool {
            false
        }
    }

    #[test]
    fn test_stalled_stage_fails_instead_of_spinning() {
        let (input, _handle) = QueueInput::new();
        let output = CollectOutput::new();
        let mut pipeline = Pipeline::new(
            location(),
            Box::new(input),
            StageId(0),
            vec![Box::new(SilentStage)],
            Box::new(output.clone()),
            PipelineConfig::default(),
        )
        .unwrap();

        let err = pipeline.process().unwrap_err();
        assert!(matches!(&err, QueryError::IllegalState(message) if message.contains("stalled")));
        assert_eq!(pipeline.state(), PipelineState::Failed);
        assert!(output.is_aborted());
    }

    #[test]
    fn test_upstream_drains_after_downstream_limit_finishes() {
        let source = MemoryBatchSource::new(vec![batch(vec![1]), batch(vec![2]), batch(vec![3])]);
        let output = CollectOutput::new();
        let mut pipeline = Pipeline::new(
            location(),
            Box::new(SourceInput::new(Box::new(source), MarkerInjector::new(PartitionId(0)))),
            StageId(0),
            vec![
                Box::new(LimitStage::new(StageId(1), 10)),
                Box::new(LimitStage::new(StageId(2), 1)),
            ],
            Box::new(output.clone()),
            PipelineConfig::default(),
        )
        .unwrap();

        drive(&mut pipeline);
        assert_eq!(output.batches().len(), 1);
        assert_eq!(pipeline.stats().output_rows, 1);
    }

    #[tokio::test]
    async fn test_run_wakes_on_input() {
        let (input, handle) = QueueInput::new();
        let output = CollectOutput::new();
        let pipeline = Pipeline::new(
            location(),
            Box::new(input),
            StageId(0),
            vec![sum_stage(1)],
            Box::new(output.clone()),
            PipelineConfig::default(),
        )
        .unwrap();

        let task = tokio::spawn(pipeline.run());
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.push_batch(batch(vec![5, 6]));
        handle.finish();

        let stats = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(stats.input_rows, 2);
        let column = output.batches()[0].column(0).clone();
        assert_eq!(column.len(), 1);
        assert_eq!(single_value(&output.batches()), 11);
    }
}
