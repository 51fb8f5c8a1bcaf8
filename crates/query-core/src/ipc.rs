//! Arrow IPC encoding for batches that leave process memory (snapshots, remote exchange)

use crate::error::{QueryError, Result};
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// Record batch encoded with the Arrow IPC stream format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedBatch {
    /// IPC-encoded Arrow data
    pub data: Vec<u8>,
    /// Number of rows
    pub num_rows: usize,
}

impl SerializedBatch {
    pub fn from_batch(batch: &RecordBatch) -> Result<Self> {
        let mut buffer = Vec::new();
        {
            let mut writer = StreamWriter::try_new(&mut buffer, &batch.schema())
                .map_err(|e| QueryError::SerializationError(e.to_string()))?;
            writer
                .write(batch)
                .map_err(|e| QueryError::SerializationError(e.to_string()))?;
            writer
                .finish()
                .map_err(|e| QueryError::SerializationError(e.to_string()))?;
        }

        Ok(Self {
            data: buffer,
            num_rows: batch.num_rows(),
        })
    }

    pub fn to_batch(&self) -> Result<RecordBatch> {
        let reader = StreamReader::try_new(Cursor::new(&self.data), None)
            .map_err(|e| QueryError::SerializationError(e.to_string()))?;

        let mut batches = Vec::with_capacity(1);
        for batch in reader {
            batches.push(batch.map_err(|e| QueryError::SerializationError(e.to_string()))?);
        }

        match batches.len() {
            1 => Ok(batches.remove(0)),
            n => Err(QueryError::SerializationError(format!(
                "expected exactly one batch in IPC stream, found {}",
                n
            ))),
        }
    }
}
