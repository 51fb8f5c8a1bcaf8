//! Stream elements and snapshot markers.
//!
//! Batches and markers travel interleaved on every channel. A marker carries
//! no rows. It tells each stage it passes through to capture its state, and
//! the captured fragments accumulate on the marker until it leaves the
//! pipeline, where it is sealed and reported.

use arrow::record_batch::RecordBatch;
use query_core::{PartitionId, QueryError, Result, SnapshotId, StageId, TaskLocation};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Snapshot barrier injected at the sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Marker {
    pub snapshot_id: SnapshotId,
    /// Partition that emitted this copy of the marker
    pub source: PartitionId,
}

impl Marker {
    pub fn new(snapshot_id: SnapshotId, source: PartitionId) -> Self {
        Self {
            snapshot_id,
            source,
        }
    }
}

#[derive(Debug, Clone)]
pub enum StreamElement {
    Batch(RecordBatch),
    Marker(Marker),
}

impl StreamElement {
    /// Logical size used for buffer accounting
    pub fn memory_size(&self) -> u64 {
        match self {
            StreamElement::Batch(batch) => batch.get_array_memory_size() as u64,
            StreamElement::Marker(_) => std::mem::size_of::<Marker>() as u64,
        }
    }

    pub fn num_rows(&self) -> usize {
        match self {
            StreamElement::Batch(batch) => batch.num_rows(),
            StreamElement::Marker(_) => 0,
        }
    }
}

/// Opaque captured state of one stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageState(Vec<u8>);

impl StageState {
    pub fn encode<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self(serde_json::to_vec(value)?))
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.0).map_err(|e| {
            QueryError::Checkpoint(format!("corrupt stage state: {}", e))
        })
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

/// Stage states gathered by a marker on its way through a pipeline
#[derive(Debug, Clone)]
pub enum CapturedStates {
    Complete(Vec<(StageId, StageState)>),
    /// Some stage could not be captured; the snapshot can't be used
    Unsupported { stage: StageId, reason: String },
}

impl CapturedStates {
    pub fn is_complete(&self) -> bool {
        matches!(self, CapturedStates::Complete(_))
    }

    /// Add one stage's capture; the first failure makes the whole set unusable
    pub fn push(&mut self, stage: StageId, result: Result<StageState>) {
        let CapturedStates::Complete(states) = self else {
            return;
        };
        match result {
            Ok(state) => states.push((stage, state)),
            Err(err) => {
                *self = CapturedStates::Unsupported {
                    stage,
                    reason: err.to_string(),
                }
            }
        }
    }
}

/// A marker that left the last stage of a pipeline together with everything it captured
#[derive(Debug, Clone)]
pub struct SealedMarker {
    pub marker: Marker,
    pub task: TaskLocation,
    pub captured: CapturedStates,
}

/// Receives sealed markers; implemented by the checkpoint coordinator
pub trait SnapshotReporter: Send + Sync {
    fn report(&self, sealed: SealedMarker);

    /// `task` finished; `captured` is its final state and holds for every later snapshot
    fn finished(&self, _task: TaskLocation, _captured: CapturedStates) {}
}
