use crate::element::StageState;
use crate::stage::{ensure_accepts_input, StageLifecycle, StageUnit};
use arrow::array::{Array, ArrayRef, Int64Array};
use arrow::compute;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use query_core::{QueryError, Result, StageId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFunction {
    Count,
    Sum,
    Min,
    Max,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSpec {
    pub function: AggregateFunction,
    /// Input column index
    pub column: usize,
    /// Output column name
    pub name: String,
}

impl AggregateSpec {
    pub fn new(function: AggregateFunction, column: usize, name: impl Into<String>) -> Self {
        Self {
            function,
            column,
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Accumulator {
    function: AggregateFunction,
    value: Option<i64>,
    count: i64,
}

impl Accumulator {
    fn new(function: AggregateFunction) -> Self {
        Self {
            function,
            value: None,
            count: 0,
        }
    }

    fn update(&mut self, array: &Int64Array) -> Result<()> {
        self.count += (array.len() - array.null_count()) as i64;
        let batch_value = match self.function {
            AggregateFunction::Count => return Ok(()),
            AggregateFunction::Sum => compute::sum_checked(array)?,
            AggregateFunction::Min => compute::min(array),
            AggregateFunction::Max => compute::max(array),
        };
        let Some(batch_value) = batch_value else {
            return Ok(());
        };
        self.value = Some(match (self.function, self.value) {
            (_, None) => batch_value,
            (AggregateFunction::Sum, Some(current)) => {
                current.checked_add(batch_value).ok_or_else(|| {
                    QueryError::ExecutionError("bigint addition overflow".to_string())
                })?
            }
            (AggregateFunction::Min, Some(current)) => current.min(batch_value),
            (AggregateFunction::Max, Some(current)) => current.max(batch_value),
            (AggregateFunction::Count, Some(current)) => current,
        });
        Ok(())
    }

    fn result(&self) -> Option<i64> {
        match self.function {
            AggregateFunction::Count => Some(self.count),
            _ => self.value,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct AggregationSnapshot {
    lifecycle: StageLifecycle,
    accumulators: Vec<Accumulator>,
}

/// Global (ungrouped) aggregation over Int64 columns, producing a single row on finish
pub struct AggregationStage {
    id: StageId,
    specs: Vec<AggregateSpec>,
    accumulators: Vec<Accumulator>,
    lifecycle: StageLifecycle,
    schema: SchemaRef,
}

impl AggregationStage {
    pub fn new(id: StageId, specs: Vec<AggregateSpec>) -> Self {
        let schema = Arc::new(Schema::new(
            specs
                .iter()
                .map(|spec| Field::new(&spec.name, DataType::Int64, true))
                .collect::<Vec<_>>(),
        ));
        let accumulators = specs.iter().map(|s| Accumulator::new(s.function)).collect();
        Self {
            id,
            specs,
            accumulators,
            lifecycle: StageLifecycle::NeedsInput,
            schema,
        }
    }

    pub fn output_schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    fn build_output(&self) -> Result<RecordBatch> {
        let columns = self
            .accumulators
            .iter()
            .map(|acc| Arc::new(Int64Array::from(vec![acc.result()])) as ArrayRef)
            .collect();
        Ok(RecordBatch::try_new(self.schema.clone(), columns)?)
    }
}

impl StageUnit for AggregationStage {
    fn stage_id(&self) -> StageId {
        self.id
    }

    fn name(&self) -> &str {
        "aggregation"
    }

    fn needs_input(&self) -> bool {
        self.lifecycle == StageLifecycle::NeedsInput
    }

    fn add_input(&mut self, batch: RecordBatch) -> Result<()> {
        ensure_accepts_input(self)?;
        for (spec, acc) in self.specs.iter().zip(self.accumulators.iter_mut()) {
            if spec.column >= batch.num_columns() {
                return Err(QueryError::ExecutionError(format!(
                    "Column index {} out of bounds",
                    spec.column
                )));
            }
            let column = compute::cast(batch.column(spec.column), &DataType::Int64)?;
            let values = column
                .as_any()
                .downcast_ref::<Int64Array>()
                .ok_or_else(|| {
                    QueryError::ExecutionError(format!(
                        "{:?} requires an integer column",
                        spec.function
                    ))
                })?;
            acc.update(values)?;
        }
        Ok(())
    }

    fn get_output(&mut self) -> Result<Option<RecordBatch>> {
        if self.lifecycle != StageLifecycle::HasOutput {
            return Ok(None);
        }
        let output = self.build_output()?;
        self.lifecycle = StageLifecycle::Finished;
        Ok(Some(output))
    }

    fn finish(&mut self) -> Result<()> {
        if self.lifecycle != StageLifecycle::NeedsInput {
            return Err(QueryError::IllegalState(format!(
                "aggregation stage {} finished twice",
                self.id
            )));
        }
        self.lifecycle = StageLifecycle::HasOutput;
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.lifecycle == StageLifecycle::Finished
    }

    fn retained_bytes(&self) -> u64 {
        (self.accumulators.len() * std::mem::size_of::<Accumulator>()) as u64
    }

    fn capture(&self) -> Result<StageState> {
        StageState::encode(&AggregationSnapshot {
            lifecycle: self.lifecycle,
            accumulators: self.accumulators.clone(),
        })
    }

    fn restore(&mut self, state: &StageState) -> Result<()> {
        let snapshot: AggregationSnapshot = state.decode()?;
        if snapshot.accumulators.len() != self.specs.len()
            || snapshot
                .accumulators
                .iter()
                .zip(&self.specs)
                .any(|(acc, spec)| acc.function != spec.function)
        {
            return Err(QueryError::Checkpoint(format!(
                "aggregation state does not match stage {}",
                self.id
            )));
        }
        self.lifecycle = snapshot.lifecycle;
        self.accumulators = snapshot.accumulators;
        Ok(())
    }
}
