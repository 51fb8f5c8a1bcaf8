//! Task output buffers.
//!
//! Every task writes into one [`OutputBuffer`] with a queue per partition of
//! the consuming fragment. Readers address elements by token: reading at
//! token `t` acknowledges (and frees) everything before `t`, so a reader that
//! retries a failed fetch with the same token sees the same elements again.

use crate::partition::{OutputPartitioning, Partitioner};
use parking_lot::Mutex;
use query_core::{QueryError, Result, TaskLocation};
use query_executor::{Blocked, PipelineOutput, Readiness, StreamElement};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputBufferConfig {
    /// Writers block once this many bytes are buffered and unacknowledged
    pub max_buffered_bytes: u64,
}

impl Default for OutputBufferConfig {
    fn default() -> Self {
        Self {
            max_buffered_bytes: 32 * 1024 * 1024,
        }
    }
}

/// One read from a buffer partition
#[derive(Debug, Clone)]
pub struct BufferPage {
    pub token: u64,
    pub next_token: u64,
    pub elements: Vec<StreamElement>,
    /// No element will ever follow `next_token`
    pub complete: bool,
    /// Set when the page is empty and the partition may still produce data
    pub data_ready: Option<Readiness>,
}

#[derive(Debug)]
struct PartitionQueue {
    /// Token of the first queued element
    start_token: u64,
    elements: VecDeque<(StreamElement, u64)>,
    data_ready: Readiness,
}

impl PartitionQueue {
    fn new() -> Self {
        Self {
            start_token: 0,
            elements: VecDeque::new(),
            data_ready: Readiness::new("buffer-data"),
        }
    }
}

#[derive(Debug)]
struct BufferState {
    partitions: Vec<PartitionQueue>,
    partitioner: Partitioner,
    buffered_bytes: u64,
    space: Readiness,
    finished: bool,
    failure: Option<String>,
}

#[derive(Debug)]
pub struct OutputBuffer {
    location: TaskLocation,
    config: OutputBufferConfig,
    state: Mutex<BufferState>,
}

impl OutputBuffer {
    pub fn new(
        location: TaskLocation,
        partitions: usize,
        partitioning: OutputPartitioning,
        config: OutputBufferConfig,
    ) -> Arc<Self> {
        let partitions = partitions.max(1);
        Arc::new(Self {
            location,
            config,
            state: Mutex::new(BufferState {
                partitions: (0..partitions).map(|_| PartitionQueue::new()).collect(),
                partitioner: Partitioner::new(partitioning, partitions),
                buffered_bytes: 0,
                space: Readiness::ready("buffer-space"),
                finished: false,
                failure: None,
            }),
        })
    }

    pub fn location(&self) -> TaskLocation {
        self.location
    }

    pub fn partition_count(&self) -> usize {
        self.state.lock().partitions.len()
    }

    pub fn buffered_bytes(&self) -> u64 {
        self.state.lock().buffered_bytes
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    pub fn is_aborted(&self) -> bool {
        self.state.lock().failure.is_some()
    }

    /// Pipeline-facing writer
    pub fn writer(self: &Arc<Self>) -> OutputBufferWriter {
        OutputBufferWriter {
            buffer: self.clone(),
        }
    }

    /// Acknowledge everything before `token` and read from `token` on, up to roughly `max_bytes`
    pub fn get(&self, partition: usize, token: u64, max_bytes: u64) -> Result<BufferPage> {
        let mut state = self.state.lock();
        if let Some(reason) = &state.failure {
            return Err(QueryError::RemoteTaskFailed(format!(
                "task {} failed: {}",
                self.location, reason
            )));
        }
        let partition_count = state.partitions.len();
        let finished = state.finished;
        let queue = state.partitions.get_mut(partition).ok_or_else(|| {
            QueryError::IllegalState(format!(
                "task {} has {} output partitions, {} requested",
                self.location, partition_count, partition
            ))
        })?;

        let end_token = queue.start_token + queue.elements.len() as u64;
        if token < queue.start_token || token > end_token {
            return Err(QueryError::IllegalState(format!(
                "token {} outside of [{}, {}] for task {} partition {}",
                token, queue.start_token, end_token, self.location, partition
            )));
        }

        let mut released = 0;
        while queue.start_token < token {
            if let Some((_, bytes)) = queue.elements.pop_front() {
                released += bytes;
            }
            queue.start_token += 1;
        }

        let mut elements = Vec::new();
        let mut bytes = 0;
        for (element, size) in &queue.elements {
            if !elements.is_empty() && bytes + size > max_bytes {
                break;
            }
            bytes += size;
            elements.push(element.clone());
        }
        let next_token = token + elements.len() as u64;
        let complete = finished && next_token == end_token;
        let data_ready = if elements.is_empty() && !complete {
            if queue.data_ready.is_ready() {
                queue.data_ready = Readiness::new("buffer-data");
            }
            Some(queue.data_ready.clone())
        } else {
            None
        };

        state.buffered_bytes = state.buffered_bytes.saturating_sub(released);
        if state.buffered_bytes < self.config.max_buffered_bytes {
            state.space.set_ready();
        }

        Ok(BufferPage {
            token,
            next_token,
            elements,
            complete,
            data_ready,
        })
    }

    /// Fail the buffer; readers get [`QueryError::RemoteTaskFailed`] from now on
    pub fn abort(&self, reason: &str) {
        let mut state = self.state.lock();
        if state.failure.is_some() {
            return;
        }
        state.failure = Some(reason.to_string());
        state.buffered_bytes = 0;
        for queue in &mut state.partitions {
            queue.elements.clear();
            queue.data_ready.set_ready();
        }
        state.space.set_ready();
    }

    fn enqueue(state: &mut BufferState, partition: usize, element: StreamElement) {
        let size = element.memory_size();
        state.buffered_bytes += size;
        let queue = &mut state.partitions[partition];
        queue.elements.push_back((element, size));
        queue.data_ready.set_ready();
    }
}

/// [`PipelineOutput`] that writes into an [`OutputBuffer`]
pub struct OutputBufferWriter {
    buffer: Arc<OutputBuffer>,
}

impl PipelineOutput for OutputBufferWriter {
    fn is_full(&self) -> Blocked {
        let mut state = self.buffer.state.lock();
        if state.buffered_bytes < self.buffer.config.max_buffered_bytes {
            return Blocked::NotBlocked;
        }
        if state.space.is_ready() {
            state.space = Readiness::new("buffer-space");
        }
        Blocked::Waiting(state.space.clone())
    }

    fn push(&mut self, element: StreamElement) -> Result<()> {
        let mut state = self.buffer.state.lock();
        if state.failure.is_some() || state.finished {
            return Err(QueryError::IllegalState(format!(
                "output buffer of task {} no longer accepts data",
                self.buffer.location
            )));
        }
        match element {
            StreamElement::Batch(batch) => {
                for (partition, piece) in state.partitioner.split(batch)? {
                    OutputBuffer::enqueue(&mut state, partition, StreamElement::Batch(piece));
                }
            }
            StreamElement::Marker(mut marker) => {
                marker.source = self.buffer.location.partition;
                for partition in 0..state.partitions.len() {
                    OutputBuffer::enqueue(&mut state, partition, StreamElement::Marker(marker));
                }
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        let mut state = self.buffer.state.lock();
        state.finished = true;
        for queue in &mut state.partitions {
            queue.data_ready.set_ready();
        }
        Ok(())
    }

    fn abort(&mut self) {
        self.buffer.abort("task aborted");
    }
}
