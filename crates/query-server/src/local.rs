//! In-process query manager backed by a [`DistributedExecutor`]

use crate::manager::{FailureInfo, QueryInfo, QueryManager, Session};
use crate::session::SessionUpdate;
use dashmap::DashMap;
use parking_lot::Mutex;
use query_core::{QueryError, QueryId, Result};
use query_distributed::{DistributedExecutor, ExecuteOptions, QueryExecution, QueryPlan, QueryStatus};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

struct ManagedQuery {
    slug: String,
    session: Session,
    execution: Arc<QueryExecution>,
    updates: Mutex<Vec<SessionUpdate>>,
    /// When the query was first seen in a terminal state
    terminal_since: Mutex<Option<Instant>>,
}

/// Tracks submitted queries, their slugs and session updates
pub struct LocalQueryManager {
    executor: Arc<DistributedExecutor>,
    queries: DashMap<QueryId, ManagedQuery>,
    retention: Duration,
}

impl LocalQueryManager {
    pub fn new(executor: Arc<DistributedExecutor>, retention: Duration) -> Self {
        Self {
            executor,
            queries: DashMap::new(),
            retention,
        }
    }

    pub fn executor(&self) -> &Arc<DistributedExecutor> {
        &self.executor
    }

    /// Start a query; returns its id and the slug clients must present
    pub fn submit(&self, plan: QueryPlan, session: Session) -> Result<(QueryId, String)> {
        // the statement resource reports as the result sink, so a restore never skips undelivered rows
        let options = ExecuteOptions { result_sink: true };
        let execution = self.executor.execute(plan, options)?;
        let query_id = execution.query_id();
        let slug = format!("x{}", Uuid::new_v4().simple());
        tracing::info!("Query {} submitted by '{}'", query_id, session.user);
        self.queries.insert(
            query_id,
            ManagedQuery {
                slug: slug.clone(),
                session,
                execution,
                updates: Mutex::new(Vec::new()),
                terminal_since: Mutex::new(None),
            },
        );
        Ok((query_id, slug))
    }

    /// Record a session change to be delivered with the next result payload
    pub fn add_session_update(&self, query_id: QueryId, update: SessionUpdate) -> Result<()> {
        let query = self.lookup(query_id)?;
        query.updates.lock().push(update);
        Ok(())
    }

    pub fn execution(&self, query_id: QueryId) -> Result<Arc<QueryExecution>> {
        Ok(self.lookup(query_id)?.execution.clone())
    }

    pub fn query_count(&self) -> usize {
        self.queries.len()
    }

    /// Forget queries that have been terminal for longer than the retention; returns how many
    pub fn expire(&self) -> usize {
        let now = Instant::now();
        let mut expired = Vec::new();
        for entry in self.queries.iter() {
            if !entry.execution.status().is_terminal() {
                continue;
            }
            let mut since = entry.terminal_since.lock();
            let since = *since.get_or_insert(now);
            if now.duration_since(since) >= self.retention {
                expired.push(*entry.key());
            }
        }
        for query_id in &expired {
            self.queries.remove(query_id);
            self.executor.remove(*query_id);
            tracing::debug!("Query {} expired", query_id);
        }
        expired.len()
    }

    fn lookup(
        &self,
        query_id: QueryId,
    ) -> Result<dashmap::mapref::one::Ref<'_, QueryId, ManagedQuery>> {
        self.queries
            .get(&query_id)
            .ok_or_else(|| QueryError::QueryNotFound(query_id.to_string()))
    }
}

impl QueryManager for LocalQueryManager {
    fn query_state(&self, query_id: QueryId) -> Result<QueryStatus> {
        Ok(self.lookup(query_id)?.execution.status())
    }

    fn is_query_slug_valid(&self, query_id: QueryId, slug: &str) -> Result<bool> {
        Ok(self.lookup(query_id)?.slug == slug)
    }

    fn query_session(&self, query_id: QueryId) -> Result<Session> {
        Ok(self.lookup(query_id)?.session.clone())
    }

    fn cancel_query(&self, query_id: QueryId) -> Result<()> {
        self.lookup(query_id)?;
        self.executor.cancel_query(query_id)?;
        Ok(())
    }

    fn query_info(&self, query_id: QueryId) -> Result<QueryInfo> {
        let query = self.lookup(query_id)?;
        let execution = &query.execution;
        Ok(QueryInfo {
            query_id,
            state: execution.status(),
            root: execution.root_output(),
            sink_reporter: self.executor.coordinator().reporter(query_id),
            failure: execution.failure().map(|err| FailureInfo::from_error(&err)),
            stats: execution.stats(),
        })
    }

    fn take_session_updates(&self, query_id: QueryId) -> Result<Vec<SessionUpdate>> {
        Ok(std::mem::take(&mut *self.lookup(query_id)?.updates.lock()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;
    use query_core::{FragmentId, StageId};
    use query_distributed::{ExecutorConfig, FragmentPlan, InMemorySnapshotStore, MemorySourceProvider};
    use query_executor::{StageSpec, StageUnitRegistry};
    use serde_json::json;

    fn manager(retention: Duration) -> LocalQueryManager {
        let executor = DistributedExecutor::new(
            ExecutorConfig::default(),
            Arc::new(StageUnitRegistry::with_builtins()),
            Arc::new(InMemorySnapshotStore::new()),
        );
        LocalQueryManager::new(executor, retention)
    }

    fn plan() -> QueryPlan {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        let batch =
            RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(vec![1, 2, 3]))]).unwrap();
        QueryPlan::new(vec![FragmentPlan::source(
            FragmentId(0),
            1,
            StageId(0),
            Arc::new(MemorySourceProvider::new("numbers", vec![vec![batch]])),
        )
        .with_stage(StageSpec::new(StageId(1), "limit", json!({ "limit": 2 })))])
        .unwrap()
    }

    #[tokio::test]
    async fn test_submit_and_slug() {
        let manager = manager(Duration::from_secs(60));
        let (query_id, slug) = manager.submit(plan(), Session::new("alice")).unwrap();
        assert!(manager.is_query_slug_valid(query_id, &slug).unwrap());
        assert!(!manager.is_query_slug_valid(query_id, "guess").unwrap());
        assert_eq!(manager.query_session(query_id).unwrap().user, "alice");

        let status = manager.execution(query_id).unwrap().wait().await;
        assert_eq!(status, QueryStatus::Finished);
        let info = manager.query_info(query_id).unwrap();
        assert_eq!(info.root.unwrap().epoch, 1);
        assert_eq!(info.stats.output_rows, 2);
    }

    #[tokio::test]
    async fn test_unknown_query_is_not_found() {
        let manager = manager(Duration::from_secs(60));
        let unknown = QueryId::new();
        assert!(matches!(
            manager.query_state(unknown),
            Err(QueryError::QueryNotFound(_))
        ));
        assert!(matches!(
            manager.cancel_query(unknown),
            Err(QueryError::QueryNotFound(_))
        ));
        assert!(manager
            .add_session_update(unknown, SessionUpdate::ClearTransaction)
            .is_err());
    }

    #[tokio::test]
    async fn test_session_updates_are_taken_once() {
        let manager = manager(Duration::from_secs(60));
        let (query_id, _) = manager.submit(plan(), Session::new("bob")).unwrap();
        manager
            .add_session_update(query_id, SessionUpdate::SetSchema("tpch".into()))
            .unwrap();
        assert_eq!(
            manager.take_session_updates(query_id).unwrap(),
            vec![SessionUpdate::SetSchema("tpch".into())]
        );
        assert!(manager.take_session_updates(query_id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expire_forgets_terminal_queries() {
        let manager = manager(Duration::ZERO);
        let (query_id, _) = manager.submit(plan(), Session::new("carol")).unwrap();
        manager.execution(query_id).unwrap().wait().await;

        assert_eq!(manager.expire(), 1);
        assert_eq!(manager.query_count(), 0);
        assert!(manager.query_state(query_id).is_err());
        assert!(manager.executor().get(query_id).is_none());
    }
}
