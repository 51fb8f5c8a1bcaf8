use crate::element::StageState;
use crate::readiness::Readiness;
use crate::stage::{ensure_accepts_input, Blocked, StageUnit};
use crate::stages::aggregation::{AggregateSpec, AggregationStage};
use arrow::array::{Array, ArrayRef, BinaryArray, Int64Array};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use query_core::{QueryError, Result, SerializedBatch, StageId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Connector boundary that makes a written table visible
pub trait TableFinisher: Send + Sync {
    /// Start committing `fragments` with the computed `statistics`. The
    /// returned readiness is set once the commit is durable.
    fn finish_table(&self, fragments: &[Vec<u8>], statistics: &[RecordBatch]) -> Result<Readiness>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum FinishState {
    Running,
    Finishing,
    Committing,
    Finished,
}

#[derive(Serialize, Deserialize)]
struct TableFinishSnapshot {
    state: FinishState,
    row_count: i64,
    fragments: Vec<Vec<u8>>,
    statistics: Vec<u8>,
    computed_statistics: Vec<SerializedBatch>,
}

/// Final stage of a write: sums the written row counts (column 0), collects
/// the writers' commit fragments (column 1), and aggregates column
/// statistics over the remaining columns. On finish it commits through the
/// [`TableFinisher`] and emits one row holding the total row count.
pub struct TableFinishStage {
    id: StageId,
    finisher: Arc<dyn TableFinisher>,
    statistics: AggregationStage,
    state: FinishState,
    row_count: i64,
    fragments: Vec<Vec<u8>>,
    computed_statistics: Vec<RecordBatch>,
    commit: Option<Readiness>,
    schema: SchemaRef,
}

impl TableFinishStage {
    pub fn new(id: StageId, finisher: Arc<dyn TableFinisher>, statistics: Vec<AggregateSpec>) -> Self {
        Self {
            id,
            finisher,
            statistics: AggregationStage::new(id, statistics),
            state: FinishState::Running,
            row_count: 0,
            fragments: Vec::new(),
            computed_statistics: Vec::new(),
            commit: None,
            schema: Arc::new(Schema::new(vec![Field::new("rows", DataType::Int64, false)])),
        }
    }

    fn column<'a, T: 'static>(batch: &'a RecordBatch, index: usize, kind: &str) -> Result<&'a T> {
        if index >= batch.num_columns() {
            return Err(QueryError::ExecutionError(format!(
                "table finish input is missing its {} column",
                kind
            )));
        }
        batch.column(index).as_any().downcast_ref::<T>().ok_or_else(|| {
            QueryError::ExecutionError(format!(
                "table finish {} column has type {}",
                kind,
                batch.column(index).data_type()
            ))
        })
    }
}

impl StageUnit for TableFinishStage {
    fn stage_id(&self) -> StageId {
        self.id
    }

    fn name(&self) -> &str {
        "table_finish"
    }

    fn needs_input(&self) -> bool {
        self.state == FinishState::Running
    }

    fn add_input(&mut self, batch: RecordBatch) -> Result<()> {
        ensure_accepts_input(self)?;

        let rows = Self::column::<Int64Array>(&batch, 0, "row count")?;
        for value in rows.iter().flatten() {
            self.row_count = self.row_count.checked_add(value).ok_or_else(|| {
                QueryError::ExecutionError("row count overflow".to_string())
            })?;
        }

        let fragments = Self::column::<BinaryArray>(&batch, 1, "fragment")?;
        self.fragments
            .extend(fragments.iter().flatten().map(|fragment| fragment.to_vec()));

        self.statistics.add_input(batch)
    }

    fn is_blocked(&self) -> Blocked {
        match &self.commit {
            Some(commit) if self.state == FinishState::Committing => Blocked::on(commit),
            _ => Blocked::NotBlocked,
        }
    }

    fn get_output(&mut self) -> Result<Option<RecordBatch>> {
        match self.state {
            FinishState::Running | FinishState::Finished => Ok(None),
            FinishState::Finishing => {
                self.commit = Some(
                    self.finisher
                        .finish_table(&self.fragments, &self.computed_statistics)?,
                );
                self.state = FinishState::Committing;
                tracing::debug!(
                    "Table finish stage {} committing {} fragments",
                    self.id,
                    self.fragments.len()
                );
                Ok(None)
            }
            FinishState::Committing => {
                if !self.commit.as_ref().is_some_and(Readiness::is_ready) {
                    return Ok(None);
                }
                self.state = FinishState::Finished;
                let rows = Arc::new(Int64Array::from(vec![self.row_count])) as ArrayRef;
                Ok(Some(RecordBatch::try_new(self.schema.clone(), vec![rows])?))
            }
        }
    }

    fn finish(&mut self) -> Result<()> {
        if self.state != FinishState::Running {
            return Err(QueryError::IllegalState(format!(
                "table finish stage {} finished twice",
                self.id
            )));
        }
        self.statistics.finish()?;
        while let Some(batch) = self.statistics.get_output()? {
            self.computed_statistics.push(batch);
        }
        self.state = FinishState::Finishing;
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.state == FinishState::Finished
    }

    fn retained_bytes(&self) -> u64 {
        let fragments: usize = self.fragments.iter().map(Vec::len).sum();
        let statistics: usize = self
            .computed_statistics
            .iter()
            .map(RecordBatch::get_array_memory_size)
            .sum();
        (fragments + statistics) as u64 + self.statistics.retained_bytes()
    }

    fn capture(&self) -> Result<StageState> {
        if self.state == FinishState::Committing {
            return Err(QueryError::SnapshotUnsupported {
                stage: format!("{} (commit in progress)", self.name()),
            });
        }
        StageState::encode(&TableFinishSnapshot {
            state: self.state,
            row_count: self.row_count,
            fragments: self.fragments.clone(),
            statistics: self.statistics.capture()?.into_bytes(),
            computed_statistics: self
                .computed_statistics
                .iter()
                .map(SerializedBatch::from_batch)
                .collect::<Result<_>>()?,
        })
    }

    fn restore(&mut self, state: &StageState) -> Result<()> {
        let snapshot: TableFinishSnapshot = state.decode()?;
        self.statistics
            .restore(&StageState::from_bytes(snapshot.statistics))?;
        self.state = snapshot.state;
        self.row_count = snapshot.row_count;
        self.fragments = snapshot.fragments;
        self.computed_statistics = snapshot
            .computed_statistics
            .iter()
            .map(SerializedBatch::to_batch)
            .collect::<Result<_>>()?;
        self.commit = None;
        Ok(())
    }
}
