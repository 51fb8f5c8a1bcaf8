use crate::element::StageState;
use crate::stage::{ensure_accepts_input, StageUnit};
use arrow::record_batch::RecordBatch;
use query_core::{QueryError, Result, SerializedBatch, StageId};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
struct LimitSnapshot {
    remaining: u64,
    finishing: bool,
    pending: Option<SerializedBatch>,
}

/// Passes through at most `limit` rows, then finishes without waiting for the rest of its input
pub struct LimitStage {
    id: StageId,
    remaining: u64,
    pending: Option<RecordBatch>,
    finishing: bool,
}

impl LimitStage {
    pub fn new(id: StageId, limit: u64) -> Self {
        Self {
            id,
            remaining: limit,
            pending: None,
            finishing: false,
        }
    }
}

impl StageUnit for LimitStage {
    fn stage_id(&self) -> StageId {
        self.id
    }

    fn name(&self) -> &str {
        "limit"
    }

    fn needs_input(&self) -> bool {
        !self.finishing && self.pending.is_none() && self.remaining > 0
    }

    fn add_input(&mut self, batch: RecordBatch) -> Result<()> {
        ensure_accepts_input(self)?;
        let rows = (batch.num_rows() as u64).min(self.remaining);
        self.remaining -= rows;
        if rows > 0 {
            self.pending = Some(batch.slice(0, rows as usize));
        }
        Ok(())
    }

    fn get_output(&mut self) -> Result<Option<RecordBatch>> {
        Ok(self.pending.take())
    }

    fn finish(&mut self) -> Result<()> {
        if self.finishing {
            return Err(QueryError::IllegalState(format!(
                "limit stage {} finished twice",
                self.id
            )));
        }
        self.finishing = true;
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.pending.is_none() && (self.finishing || self.remaining == 0)
    }

    fn retained_bytes(&self) -> u64 {
        self.pending
            .as_ref()
            .map(|batch| batch.get_array_memory_size() as u64)
            .unwrap_or(0)
    }

    fn capture(&self) -> Result<StageState> {
        let pending = self
            .pending
            .as_ref()
            .map(SerializedBatch::from_batch)
            .transpose()?;
        StageState::encode(&LimitSnapshot {
            remaining: self.remaining,
            finishing: self.finishing,
            pending,
        })
    }

    fn restore(&mut self, state: &StageState) -> Result<()> {
        let snapshot: LimitSnapshot = state.decode()?;
        self.remaining = snapshot.remaining;
        self.finishing = snapshot.finishing;
        self.pending = snapshot
            .pending
            .as_ref()
            .map(SerializedBatch::to_batch)
            .transpose()?;
        Ok(())
    }
}
