//! Marker alignment for inputs fed by several upstream channels.
//!
//! When a marker arrives on one channel, everything that channel sends
//! afterwards is held back until the same marker has arrived on every other
//! live channel. The marker is then forwarded once, followed by the held-back
//! elements in channel order. A channel that has finished counts as aligned.

use query_core::SnapshotId;
use query_executor::{Marker, StreamElement};
use std::collections::VecDeque;

#[derive(Debug, Default)]
pub struct MarkerAligner {
    received: Vec<bool>,
    finished: Vec<bool>,
    buffers: Vec<VecDeque<StreamElement>>,
    pending: Option<Marker>,
    last_aligned: Option<SnapshotId>,
}

impl MarkerAligner {
    pub fn new(channels: usize) -> Self {
        let mut aligner = Self::default();
        for _ in 0..channels {
            aligner.add_channel();
        }
        aligner
    }

    /// Add a channel and return its index
    pub fn add_channel(&mut self) -> usize {
        self.received.push(false);
        self.finished.push(false);
        self.buffers.push(VecDeque::new());
        self.received.len() - 1
    }

    pub fn is_aligning(&self) -> bool {
        self.pending.is_some()
    }

    pub fn buffered(&self) -> usize {
        self.buffers.iter().map(VecDeque::len).sum()
    }

    /// Route `element` from `channel`; whatever may move downstream is appended to `out`
    pub fn process(&mut self, channel: usize, element: StreamElement, out: &mut VecDeque<StreamElement>) {
        if self.received[channel] {
            self.buffers[channel].push_back(element);
            return;
        }
        match element {
            StreamElement::Batch(_) => out.push_back(element),
            StreamElement::Marker(marker) => {
                if self
                    .last_aligned
                    .is_some_and(|last| marker.snapshot_id <= last)
                {
                    return;
                }
                match self.pending {
                    Some(pending) if marker.snapshot_id < pending.snapshot_id => return,
                    Some(pending) if marker.snapshot_id > pending.snapshot_id => {
                        // the pending snapshot was abandoned upstream
                        tracing::debug!(
                            "Marker {} supersedes unaligned marker {}",
                            marker.snapshot_id,
                            pending.snapshot_id
                        );
                        self.release(out);
                        return self.process(channel, StreamElement::Marker(marker), out);
                    }
                    _ => {}
                }
                self.pending = Some(marker);
                self.received[channel] = true;
                self.try_complete(out);
            }
        }
    }

    pub fn channel_finished(&mut self, channel: usize, out: &mut VecDeque<StreamElement>) {
        self.finished[channel] = true;
        self.try_complete(out);
    }

    /// Give up on the pending marker and release everything held back
    pub fn release(&mut self, out: &mut VecDeque<StreamElement>) {
        self.pending = None;
        self.drain(out);
    }

    fn try_complete(&mut self, out: &mut VecDeque<StreamElement>) {
        let Some(marker) = self.pending else {
            return;
        };
        let aligned = self
            .received
            .iter()
            .zip(&self.finished)
            .all(|(received, finished)| *received || *finished);
        if !aligned {
            return;
        }
        self.pending = None;
        self.last_aligned = Some(marker.snapshot_id);
        out.push_back(StreamElement::Marker(marker));
        self.drain(out);
    }

    fn drain(&mut self, out: &mut VecDeque<StreamElement>) {
        self.received.iter_mut().for_each(|r| *r = false);
        let held: Vec<VecDeque<StreamElement>> =
            self.buffers.iter_mut().map(std::mem::take).collect();
        for (channel, elements) in held.into_iter().enumerate() {
            for element in elements {
                self.process(channel, element, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;
    use query_core::PartitionId;
    use std::sync::Arc;

    fn batch(v: i64) -> StreamElement {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        StreamElement::Batch(
            RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(vec![v]))]).unwrap(),
        )
    }

    fn marker(id: u64) -> StreamElement {
        StreamElement::Marker(Marker::new(SnapshotId(id), PartitionId(0)))
    }

    fn describe(out: &VecDeque<StreamElement>) -> Vec<String> {
        out.iter()
            .map(|e| match e {
                StreamElement::Batch(b) => format!(
                    "b{}",
                    b.column(0)
                        .as_any()
                        .downcast_ref::<Int64Array>()
                        .unwrap()
                        .value(0)
                ),
                StreamElement::Marker(m) => format!("m{}", m.snapshot_id),
            })
            .collect()
    }

    #[test]
    fn test_holds_back_aligned_channel() {
        let mut aligner = MarkerAligner::new(2);
        let mut out = VecDeque::new();

        aligner.process(0, batch(1), &mut out);
        aligner.process(0, marker(1), &mut out);
        aligner.process(0, batch(2), &mut out);
        aligner.process(1, batch(10), &mut out);
        assert!(aligner.is_aligning());
        assert_eq!(describe(&out), vec!["b1", "b10"]);

        aligner.process(1, marker(1), &mut out);
        assert!(!aligner.is_aligning());
        assert_eq!(describe(&out), vec!["b1", "b10", "m1", "b2"]);
    }

    #[test]
    fn test_finished_channel_counts_as_aligned() {
        let mut aligner = MarkerAligner::new(2);
        let mut out = VecDeque::new();
        aligner.process(0, marker(1), &mut out);
        aligner.process(0, batch(5), &mut out);
        aligner.channel_finished(1, &mut out);
        assert_eq!(describe(&out), vec!["m1", "b5"]);
    }

    #[test]
    fn test_held_back_marker_is_realigned() {
        let mut aligner = MarkerAligner::new(2);
        let mut out = VecDeque::new();
        aligner.process(0, marker(1), &mut out);
        aligner.process(0, batch(1), &mut out);
        aligner.process(0, marker(2), &mut out);
        aligner.process(0, batch(2), &mut out);
        aligner.process(1, marker(1), &mut out);
        assert_eq!(describe(&out), vec!["m1", "b1"]);
        assert!(aligner.is_aligning());
        assert_eq!(aligner.buffered(), 1);

        aligner.process(1, marker(2), &mut out);
        assert_eq!(describe(&out), vec!["m1", "b1", "m2", "b2"]);
    }

    #[test]
    fn test_newer_marker_supersedes_abandoned_one() {
        let mut aligner = MarkerAligner::new(2);
        let mut out = VecDeque::new();
        aligner.process(0, marker(1), &mut out);
        aligner.process(0, batch(1), &mut out);
        aligner.process(1, marker(2), &mut out);
        // marker 1 is released unaligned; marker 2 now waits on channel 0
        assert_eq!(describe(&out), vec!["b1"]);
        aligner.process(0, marker(2), &mut out);
        assert_eq!(describe(&out), vec!["b1", "m2"]);

        // a late copy of an older marker is dropped
        aligner.process(1, marker(1), &mut out);
        assert_eq!(describe(&out), vec!["b1", "m2"]);
    }
}
