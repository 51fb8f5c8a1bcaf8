//! Scripted query manager for protocol tests

use crate::manager::{FailureInfo, QueryInfo, QueryManager, Session};
use crate::session::SessionUpdate;
use arrow::array::Int64Array;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parking_lot::Mutex;
use query_core::{ErrorCode, FragmentId, PartitionId, QueryError, QueryId, Result, SnapshotId, TaskLocation};
use query_distributed::{
    ExecutionStats, OutputBuffer, OutputBufferConfig, OutputBufferWriter, OutputPartitioning,
    QueryStatus, RootOutput,
};
use query_executor::{PipelineOutput, SealedMarker, SnapshotReporter, StreamElement};
use std::sync::Arc;

pub fn batch(values: Vec<i64>) -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
    RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values))]).unwrap()
}

#[derive(Default)]
pub struct RecordingReporter {
    pub reports: Mutex<Vec<SealedMarker>>,
}

impl SnapshotReporter for RecordingReporter {
    fn report(&self, sealed: SealedMarker) {
        self.reports.lock().push(sealed);
    }
}

struct ScriptState {
    state: QueryStatus,
    root: Option<RootOutput>,
    failure: Option<FailureInfo>,
    updates: Vec<SessionUpdate>,
    cancelled: bool,
    forgotten: bool,
}

/// One query whose state the test drives by hand
pub struct ScriptedManager {
    pub query_id: QueryId,
    pub slug: String,
    pub reporter: Arc<RecordingReporter>,
    script: Mutex<ScriptState>,
}

impl ScriptedManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            query_id: QueryId::new(),
            slug: "xslug".to_string(),
            reporter: Arc::new(RecordingReporter::default()),
            script: Mutex::new(ScriptState {
                state: QueryStatus::Running,
                root: None,
                failure: None,
                updates: Vec::new(),
                cancelled: false,
                forgotten: false,
            }),
        })
    }

    /// Launch a new attempt with one root buffer; returns its writer
    pub fn launch(&self, restored_from: Option<SnapshotId>) -> OutputBufferWriter {
        let buffer = OutputBuffer::new(
            TaskLocation::new(FragmentId(0), PartitionId(0)),
            1,
            OutputPartitioning::Single,
            OutputBufferConfig::default(),
        );
        let writer = buffer.writer();
        let mut script = self.script.lock();
        let epoch = script.root.as_ref().map_or(0, |root| root.epoch) + 1;
        script.root = Some(RootOutput {
            epoch,
            restored_from,
            buffers: vec![buffer],
        });
        script.state = QueryStatus::Running;
        writer
    }

    /// Fail the current attempt's root buffers, as a lost root task would
    pub fn abort_attempt(&self) {
        if let Some(root) = &self.script.lock().root {
            for buffer in &root.buffers {
                buffer.abort("root task lost");
            }
        }
    }

    pub fn set_state(&self, state: QueryStatus) {
        self.script.lock().state = state;
    }

    pub fn fail(&self, code: ErrorCode, message: &str) {
        let mut script = self.script.lock();
        script.state = QueryStatus::Failed;
        script.failure = Some(FailureInfo {
            code,
            message: message.to_string(),
        });
    }

    pub fn add_update(&self, update: SessionUpdate) {
        self.script.lock().updates.push(update);
    }

    pub fn is_cancelled(&self) -> bool {
        self.script.lock().cancelled
    }

    /// Stop tracking the query, as the manager does after expiry
    pub fn forget(&self) {
        self.script.lock().forgotten = true;
    }

    fn check(&self, query_id: QueryId) -> Result<parking_lot::MutexGuard<'_, ScriptState>> {
        let script = self.script.lock();
        if query_id != self.query_id || script.forgotten {
            return Err(QueryError::QueryNotFound(query_id.to_string()));
        }
        Ok(script)
    }
}

pub fn push(writer: &mut OutputBufferWriter, values: Vec<i64>) {
    writer.push(StreamElement::Batch(batch(values))).unwrap();
}

impl QueryManager for ScriptedManager {
    fn query_state(&self, query_id: QueryId) -> Result<QueryStatus> {
        Ok(self.check(query_id)?.state)
    }

    fn is_query_slug_valid(&self, query_id: QueryId, slug: &str) -> Result<bool> {
        self.check(query_id)?;
        Ok(slug == self.slug)
    }

    fn query_session(&self, query_id: QueryId) -> Result<Session> {
        self.check(query_id)?;
        Ok(Session::new("test"))
    }

    fn cancel_query(&self, query_id: QueryId) -> Result<()> {
        let mut script = self.check(query_id)?;
        script.cancelled = true;
        script.state = QueryStatus::Cancelled;
        Ok(())
    }

    fn query_info(&self, query_id: QueryId) -> Result<QueryInfo> {
        let script = self.check(query_id)?;
        Ok(QueryInfo {
            query_id,
            state: script.state,
            root: script.root.clone(),
            sink_reporter: self.reporter.clone(),
            failure: script.failure.clone(),
            stats: ExecutionStats::default(),
        })
    }

    fn take_session_updates(&self, query_id: QueryId) -> Result<Vec<SessionUpdate>> {
        Ok(std::mem::take(&mut self.check(query_id)?.updates))
    }
}
