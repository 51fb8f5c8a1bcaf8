//! Pipeline inputs: where the first stage's batches and markers come from.

use crate::element::{Marker, StageState, StreamElement};
use crate::readiness::Readiness;
use arrow::record_batch::RecordBatch;
use parking_lot::Mutex;
use query_core::{PartitionId, QueryError, Result, SnapshotId};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

/// Result of polling an input
#[derive(Debug)]
pub enum InputPoll {
    Element(StreamElement),
    /// Nothing available; resume when the readiness is set
    Pending(Readiness),
    Finished,
}

pub trait PipelineInput: Send {
    fn poll_next(&mut self) -> Result<InputPoll>;

    /// Position to resume from after a restore; `None` when the input is
    /// replayed by its upstream instead
    fn capture(&self) -> Result<Option<StageState>> {
        Ok(None)
    }

    fn restore(&mut self, _state: &StageState) -> Result<()> {
        Err(QueryError::IllegalState(
            "input does not support restore".to_string(),
        ))
    }

    fn close(&mut self) {}
}

/// Connector boundary: a positioned, re-readable stream of batches for one partition
pub trait BatchSource: Send {
    fn next_batch(&mut self) -> Result<Option<RecordBatch>>;

    /// Number of batches consumed so far
    fn position(&self) -> u64;

    /// Resume reading at `position`
    fn seek(&mut self, position: u64) -> Result<()>;
}

/// In-memory connector over a fixed list of batches
#[derive(Debug, Clone)]
pub struct MemoryBatchSource {
    batches: Arc<Vec<RecordBatch>>,
    position: u64,
}

impl MemoryBatchSource {
    pub fn new(batches: Vec<RecordBatch>) -> Self {
        Self {
            batches: Arc::new(batches),
            position: 0,
        }
    }

    pub fn shared(batches: Arc<Vec<RecordBatch>>) -> Self {
        Self {
            batches,
            position: 0,
        }
    }
}

impl BatchSource for MemoryBatchSource {
    fn next_batch(&mut self) -> Result<Option<RecordBatch>> {
        let batch = self.batches.get(self.position as usize).cloned();
        if batch.is_some() {
            self.position += 1;
        }
        Ok(batch)
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn seek(&mut self, position: u64) -> Result<()> {
        if position as usize > self.batches.len() {
            return Err(QueryError::Checkpoint(format!(
                "cannot seek to batch {} of {}",
                position,
                self.batches.len()
            )));
        }
        self.position = position;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct InjectorState {
    pending: VecDeque<SnapshotId>,
    closed: bool,
}

/// Handle through which the checkpoint coordinator injects markers into a source partition
#[derive(Debug, Clone)]
pub struct MarkerInjector {
    partition: PartitionId,
    state: Arc<Mutex<InjectorState>>,
}

impl MarkerInjector {
    pub fn new(partition: PartitionId) -> Self {
        Self {
            partition,
            state: Arc::new(Mutex::new(InjectorState::default())),
        }
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Queue a marker; false if the source has already finished
    pub fn inject(&self, snapshot_id: SnapshotId) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.pending.push_back(snapshot_id);
        true
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn take(&self) -> Option<Marker> {
        self.state
            .lock()
            .pending
            .pop_front()
            .map(|id| Marker::new(id, self.partition))
    }

    /// Close unless markers are still queued; returns whether it closed
    fn close_if_drained(&self) -> bool {
        let mut state = self.state.lock();
        if state.pending.is_empty() {
            state.closed = true;
        }
        state.closed
    }

    fn close(&self) {
        self.state.lock().closed = true;
    }
}

#[derive(Serialize, Deserialize)]
struct SourcePosition {
    position: u64,
}

/// Reads a connector source, interleaving injected markers between batches
pub struct SourceInput {
    source: Box<dyn BatchSource>,
    injector: MarkerInjector,
    exhausted: bool,
}

impl SourceInput {
    pub fn new(source: Box<dyn BatchSource>, injector: MarkerInjector) -> Self {
        Self {
            source,
            injector,
            exhausted: false,
        }
    }
}

impl PipelineInput for SourceInput {
    fn poll_next(&mut self) -> Result<InputPoll> {
        if let Some(marker) = self.injector.take() {
            return Ok(InputPoll::Element(StreamElement::Marker(marker)));
        }
        if !self.exhausted {
            match self.source.next_batch()? {
                Some(batch) => return Ok(InputPoll::Element(StreamElement::Batch(batch))),
                None => self.exhausted = true,
            }
        }
        if self.injector.close_if_drained() {
            Ok(InputPoll::Finished)
        } else {
            self.poll_next()
        }
    }

    fn capture(&self) -> Result<Option<StageState>> {
        StageState::encode(&SourcePosition {
            position: self.source.position(),
        })
        .map(Some)
    }

    fn restore(&mut self, state: &StageState) -> Result<()> {
        let SourcePosition { position } = state.decode()?;
        self.source.seek(position)?;
        self.exhausted = false;
        Ok(())
    }

    fn close(&mut self) {
        self.injector.close();
    }
}

#[derive(Debug)]
struct QueueState {
    elements: VecDeque<StreamElement>,
    finished: bool,
    data_ready: Readiness,
}

/// Producer side of a [`QueueInput`]
#[derive(Debug, Clone)]
pub struct QueueHandle {
    state: Arc<Mutex<QueueState>>,
}

impl QueueHandle {
    pub fn push(&self, element: StreamElement) {
        let mut state = self.state.lock();
        state.elements.push_back(element);
        state.data_ready.set_ready();
    }

    pub fn push_batch(&self, batch: RecordBatch) {
        self.push(StreamElement::Batch(batch));
    }

    pub fn finish(&self) {
        let mut state = self.state.lock();
        state.finished = true;
        state.data_ready.set_ready();
    }
}

/// Input fed by an in-process producer through a [`QueueHandle`]
#[derive(Debug)]
pub struct QueueInput {
    state: Arc<Mutex<QueueState>>,
}

impl QueueInput {
    pub fn new() -> (Self, QueueHandle) {
        let state = Arc::new(Mutex::new(QueueState {
            elements: VecDeque::new(),
            finished: false,
            data_ready: Readiness::new("queue-input"),
        }));
        (
            Self {
                state: state.clone(),
            },
            QueueHandle { state },
        )
    }
}

impl PipelineInput for QueueInput {
    fn poll_next(&mut self) -> Result<InputPoll> {
        let mut state = self.state.lock();
        if let Some(element) = state.elements.pop_front() {
            return Ok(InputPoll::Element(element));
        }
        if state.finished {
            return Ok(InputPoll::Finished);
        }
        if state.data_ready.is_ready() {
            state.data_ready = Readiness::new("queue-input");
        }
        Ok(InputPoll::Pending(state.data_ready.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema};

    fn batch(v: i64) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(vec![v]))]).unwrap()
    }

    fn next(input: &mut dyn PipelineInput) -> InputPoll {
        input.poll_next().unwrap()
    }

    #[test]
    fn test_source_interleaves_markers_and_restores_position() {
        let injector = MarkerInjector::new(PartitionId(0));
        let mut input = SourceInput::new(
            Box::new(MemoryBatchSource::new(vec![batch(1), batch(2), batch(3)])),
            injector.clone(),
        );

        assert!(matches!(next(&mut input), InputPoll::Element(StreamElement::Batch(_))));
        assert!(injector.inject(SnapshotId(1)));
        match next(&mut input) {
            InputPoll::Element(StreamElement::Marker(marker)) => {
                assert_eq!(marker.snapshot_id, SnapshotId(1));
                assert_eq!(marker.source, PartitionId(0));
            }
            other => panic!("expected marker, got {:?}", other),
        }
        let state = input.capture().unwrap().unwrap();

        while !matches!(next(&mut input), InputPoll::Finished) {}
        assert!(injector.is_closed());
        assert!(!injector.inject(SnapshotId(2)));

        let mut replay = SourceInput::new(
            Box::new(MemoryBatchSource::new(vec![batch(1), batch(2), batch(3)])),
            MarkerInjector::new(PartitionId(0)),
        );
        replay.restore(&state).unwrap();
        match next(&mut replay) {
            InputPoll::Element(StreamElement::Batch(b)) => assert_eq!(b, batch(2)),
            other => panic!("expected batch, got {:?}", other),
        }
    }

    #[test]
    fn test_pending_marker_is_emitted_before_finish() {
        let injector = MarkerInjector::new(PartitionId(0));
        let mut input = SourceInput::new(
            Box::new(MemoryBatchSource::new(vec![])),
            injector.clone(),
        );
        injector.inject(SnapshotId(4));
        assert!(matches!(
            next(&mut input),
            InputPoll::Element(StreamElement::Marker(_))
        ));
        assert!(matches!(next(&mut input), InputPoll::Finished));
    }

    #[test]
    fn test_queue_input_pending_then_data() {
        let (mut input, handle) = QueueInput::new();
        let pending = match next(&mut input) {
            InputPoll::Pending(readiness) => readiness,
            other => panic!("expected pending, got {:?}", other),
        };
        handle.push_batch(batch(7));
        assert!(pending.is_ready());
        assert!(matches!(next(&mut input), InputPoll::Element(_)));
        handle.finish();
        assert!(matches!(next(&mut input), InputPoll::Finished));
    }
}
