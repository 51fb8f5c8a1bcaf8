//! Result payloads returned to clients

use crate::session::SessionDelta;
use arrow::json::ArrayWriter;
use arrow::record_batch::RecordBatch;
use query_core::{ErrorCode, QueryId, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
}

impl Column {
    pub fn from_batch(batch: &RecordBatch) -> Vec<Column> {
        batch
            .schema()
            .fields()
            .iter()
            .map(|field| Column {
                name: field.name().clone(),
                data_type: field.data_type().to_string(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatementStats {
    pub state: String,
    /// Tasks are being relaunched after a failure
    pub recovering: bool,
    /// Rows delivered to the client so far
    pub processed_rows: u64,
    /// Batches delivered to the client so far
    pub processed_batches: u64,
    /// Attempt the delivered data comes from
    pub epoch: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryErrorInfo {
    pub message: String,
    pub error_code: u32,
    pub error_name: String,
    pub error_type: String,
}

impl QueryErrorInfo {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_code: code.code(),
            error_name: code.name().to_string(),
            error_type: format!("{:?}", code.error_type()),
        }
    }
}

/// JSON body of one result response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResults {
    pub id: String,
    /// Where to fetch the next chunk; absent once the query is done
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<Column>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<Vec<Value>>>,
    pub stats: StatementStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<QueryErrorInfo>,
}

/// A result body together with the session changes it delivers
#[derive(Debug, Clone, PartialEq)]
pub struct ResultsPage {
    pub results: QueryResults,
    pub session: SessionDelta,
}

/// `{base}/v1/statement/executing/{query}/{slug}/{token}`
pub fn next_uri(base: &Url, query_id: QueryId, slug: &str, token: u64) -> String {
    let mut uri = base.clone();
    uri.set_path(&format!(
        "/v1/statement/executing/{}/{}/{}",
        query_id, slug, token
    ));
    uri.set_query(None);
    uri.to_string()
}

/// Rows of `batches` as JSON arrays in column order; nulls become `null`
pub fn batches_to_rows(batches: &[RecordBatch]) -> Result<Vec<Vec<Value>>> {
    let mut rows = Vec::new();
    for batch in batches {
        if batch.num_rows() == 0 {
            continue;
        }
        let mut writer = ArrayWriter::new(Vec::new());
        writer.write_batches(&[batch])?;
        writer.finish()?;
        let objects: Vec<serde_json::Map<String, Value>> =
            serde_json::from_slice(&writer.into_inner())?;

        let schema = batch.schema();
        for mut object in objects {
            rows.push(
                schema
                    .fields()
                    .iter()
                    .map(|field| object.remove(field.name()).unwrap_or(Value::Null))
                    .collect(),
            );
        }
    }
    Ok(rows)
}
