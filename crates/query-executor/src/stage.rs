//! The stage unit contract.
//!
//! A stage unit is a push/pull state machine owned by exactly one pipeline:
//!
//! ```text
//! NeedsInput --add_input--> HasOutput --get_output--> NeedsInput
//!      \                                                  |
//!       +------------finish------> Finishing -----> Finished
//! ```
//!
//! The driver only calls `add_input` when `needs_input()` is true and the
//! unit is not blocked, and only calls `get_output` when the unit is not
//! blocked. Implementations reject contract violations with
//! [`QueryError::IllegalState`].

use crate::element::StageState;
use crate::readiness::Readiness;
use arrow::record_batch::RecordBatch;
use query_core::{QueryError, Result, StageId};
use serde::{Deserialize, Serialize};

/// Whether a unit (or input/output) can make progress right now
#[derive(Debug, Clone)]
pub enum Blocked {
    NotBlocked,
    Waiting(Readiness),
}

impl Blocked {
    /// Blocked on `readiness` unless it is already set
    pub fn on(readiness: &Readiness) -> Self {
        if readiness.is_ready() {
            Blocked::NotBlocked
        } else {
            Blocked::Waiting(readiness.clone())
        }
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, Blocked::Waiting(_))
    }
}

/// Lifecycle shared by the built-in units; also the first field of their snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageLifecycle {
    NeedsInput,
    HasOutput,
    Finishing,
    Finished,
}

pub trait StageUnit: Send {
    fn stage_id(&self) -> StageId;

    /// Kind name, used in logs and errors
    fn name(&self) -> &str;

    fn needs_input(&self) -> bool;

    fn add_input(&mut self, batch: RecordBatch) -> Result<()>;

    fn is_blocked(&self) -> Blocked {
        Blocked::NotBlocked
    }

    /// Next output batch, or `None` if nothing is ready yet
    fn get_output(&mut self) -> Result<Option<RecordBatch>>;

    /// No more input will arrive
    fn finish(&mut self) -> Result<()>;

    /// True only once all buffered output has been drained
    fn is_finished(&self) -> bool;

    /// Bytes currently retained, reported to the pipeline's memory context
    fn retained_bytes(&self) -> u64 {
        0
    }

    fn capture(&self) -> Result<StageState> {
        Err(QueryError::SnapshotUnsupported {
            stage: self.name().to_string(),
        })
    }

    fn restore(&mut self, _state: &StageState) -> Result<()> {
        Err(QueryError::SnapshotUnsupported {
            stage: self.name().to_string(),
        })
    }

    /// Release resources; called once when the pipeline is torn down
    fn close(&mut self) {}
}

/// Shared precondition check for `add_input`
pub(crate) fn ensure_accepts_input(unit: &dyn StageUnit) -> Result<()> {
    if unit.is_finished() || !unit.needs_input() {
        return Err(QueryError::IllegalState(format!(
            "stage {} ({}) does not accept input",
            unit.stage_id(),
            unit.name()
        )));
    }
    if unit.is_blocked().is_blocked() {
        return Err(QueryError::IllegalState(format!(
            "stage {} ({}) received input while blocked",
            unit.stage_id(),
            unit.name()
        )));
    }
    Ok(())
}
