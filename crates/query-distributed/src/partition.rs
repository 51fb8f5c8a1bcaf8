//! Routing of a task's output rows to the partitions of the consuming fragment

use arrow::array::*;
use arrow::record_batch::RecordBatch;
use query_core::{QueryError, Result};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// How a fragment's output is spread over its consumer's partitions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputPartitioning {
    /// Everything goes to partition 0
    #[default]
    Single,
    /// Whole batches in turn
    RoundRobin,
    /// Rows by hash of the key columns
    Hash { key_columns: Vec<String> },
}

/// Stateful splitter for one output buffer
#[derive(Debug, Clone)]
pub struct Partitioner {
    partitioning: OutputPartitioning,
    num_partitions: usize,
    next: usize,
}

impl Partitioner {
    pub fn new(partitioning: OutputPartitioning, num_partitions: usize) -> Self {
        Self {
            partitioning,
            num_partitions: num_partitions.max(1),
            next: 0,
        }
    }

    pub fn num_partitions(&self) -> usize {
        self.num_partitions
    }

    /// Split `batch` into (partition, rows) pieces; empty pieces are omitted
    pub fn split(&mut self, batch: RecordBatch) -> Result<Vec<(usize, RecordBatch)>> {
        if self.num_partitions == 1 {
            return Ok(vec![(0, batch)]);
        }
        match &self.partitioning {
            OutputPartitioning::Single => Ok(vec![(0, batch)]),
            OutputPartitioning::RoundRobin => {
                let target = self.next;
                self.next = (self.next + 1) % self.num_partitions;
                Ok(vec![(target, batch)])
            }
            OutputPartitioning::Hash { key_columns } => {
                hash_split(&batch, key_columns, self.num_partitions)
            }
        }
    }
}

fn hash_split(
    batch: &RecordBatch,
    key_columns: &[String],
    num_partitions: usize,
) -> Result<Vec<(usize, RecordBatch)>> {
    let schema = batch.schema();
    let col_indices = key_columns
        .iter()
        .map(|name| {
            schema
                .fields()
                .iter()
                .position(|f| f.name() == name)
                .ok_or_else(|| {
                    QueryError::ExecutionError(format!("Key column '{}' not found", name))
                })
        })
        .collect::<Result<Vec<usize>>>()?;

    if col_indices.is_empty() {
        return Err(QueryError::ExecutionError(
            "Hash partitioning needs at least one key column".to_string(),
        ));
    }

    let mut assignments: Vec<Vec<u32>> = vec![Vec::new(); num_partitions];
    for row in 0..batch.num_rows() {
        let hash = compute_row_hash(batch, &col_indices, row);
        assignments[(hash as usize) % num_partitions].push(row as u32);
    }

    let mut pieces = Vec::new();
    for (partition, rows) in assignments.into_iter().enumerate() {
        if rows.is_empty() {
            continue;
        }
        let indices = UInt32Array::from(rows);
        let columns: Vec<ArrayRef> = batch
            .columns()
            .iter()
            .map(|col| arrow::compute::take(col.as_ref(), &indices, None))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        pieces.push((partition, RecordBatch::try_new(batch.schema(), columns)?));
    }
    Ok(pieces)
}

/// Deterministic across processes and restarts, so replayed rows land in the same partition
fn compute_row_hash(batch: &RecordBatch, col_indices: &[usize], row: usize) -> u64 {
    let mut hasher = DefaultHasher::new();

    for &col_idx in col_indices {
        let column = batch.column(col_idx);
        if column.is_null(row) {
            0u8.hash(&mut hasher);
            continue;
        }
        if let Some(arr) = column.as_any().downcast_ref::<Int64Array>() {
            arr.value(row).hash(&mut hasher);
        } else if let Some(arr) = column.as_any().downcast_ref::<Int32Array>() {
            i64::from(arr.value(row)).hash(&mut hasher);
        } else if let Some(arr) = column.as_any().downcast_ref::<StringArray>() {
            arr.value(row).hash(&mut hasher);
        } else if let Some(arr) = column.as_any().downcast_ref::<BinaryArray>() {
            arr.value(row).hash(&mut hasher);
        } else if let Some(arr) = column.as_any().downcast_ref::<BooleanArray>() {
            arr.value(row).hash(&mut hasher);
        }
    }

    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;

    fn create_test_batch(ids: Vec<i64>, names: Vec<&str>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, false),
        ]));

        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(ids)),
                Arc::new(StringArray::from(names)),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_round_robin_cycles_whole_batches() {
        let mut partitioner = Partitioner::new(OutputPartitioning::RoundRobin, 2);
        let targets: Vec<usize> = (0..4)
            .map(|i| partitioner.split(create_test_batch(vec![i], vec!["x"])).unwrap()[0].0)
            .collect();
        assert_eq!(targets, vec![0, 1, 0, 1]);
    }

    #[test]
    fn test_hash_split_keeps_every_row_once() {
        let mut partitioner = Partitioner::new(
            OutputPartitioning::Hash {
                key_columns: vec!["id".to_string()],
            },
            3,
        );
        let batch = create_test_batch(vec![1, 2, 3, 4, 5, 1], vec!["a", "b", "c", "d", "e", "a"]);
        let pieces = partitioner.split(batch).unwrap();

        let total_rows: usize = pieces.iter().map(|(_, b)| b.num_rows()).sum();
        assert_eq!(total_rows, 6);

        // equal keys land together, and again on a second pass
        let again = partitioner
            .split(create_test_batch(vec![1], vec!["z"]))
            .unwrap();
        let first_home = pieces
            .iter()
            .find(|(_, b)| {
                b.column(0)
                    .as_any()
                    .downcast_ref::<Int64Array>()
                    .unwrap()
                    .values()
                    .contains(&1)
            })
            .unwrap()
            .0;
        assert_eq!(again[0].0, first_home);
    }

    #[test]
    fn test_missing_key_column() {
        let mut partitioner = Partitioner::new(
            OutputPartitioning::Hash {
                key_columns: vec!["nope".to_string()],
            },
            2,
        );
        assert!(partitioner
            .split(create_test_batch(vec![1], vec!["a"]))
            .is_err());
    }

    #[test]
    fn test_single_partition_passes_through() {
        let mut partitioner = Partitioner::new(OutputPartitioning::RoundRobin, 1);
        let pieces = partitioner
            .split(create_test_batch(vec![1, 2], vec!["a", "b"]))
            .unwrap();
        assert_eq!(pieces.len(), 1);
        assert_eq!(pieces[0].1.num_rows(), 2);
    }
}
