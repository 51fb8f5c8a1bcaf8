//! Registry of live result sessions
//!
//! Sessions are created lazily on the first result request for a query and
//! dropped by a background purge loop once the query manager no longer
//! knows the query.

use crate::config::ServerConfig;
use crate::manager::QueryManager;
use crate::query::Query;
use crate::results::ResultsPage;
use dashmap::DashMap;
use query_core::{QueryError, QueryId, Result};
use query_distributed::ExchangeClientSupplier;
use query_executor::MemoryPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

pub struct QueryRegistry {
    manager: Arc<dyn QueryManager>,
    supplier: Arc<dyn ExchangeClientSupplier>,
    config: ServerConfig,
    queries: DashMap<QueryId, Arc<Query>>,
    shutdown: CancellationToken,
    purger: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl QueryRegistry {
    /// Create the registry and start its purge loop. Must be called within a tokio runtime.
    pub fn new(
        manager: Arc<dyn QueryManager>,
        supplier: Arc<dyn ExchangeClientSupplier>,
        config: ServerConfig,
    ) -> Arc<Self> {
        let registry = Arc::new(Self {
            manager,
            supplier,
            config,
            queries: DashMap::new(),
            shutdown: CancellationToken::new(),
            purger: parking_lot::Mutex::new(None),
        });

        let weak = Arc::downgrade(&registry);
        let shutdown = registry.shutdown.clone();
        let interval = Duration::from_millis(registry.config.purge_interval_ms.max(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(registry) = weak.upgrade() else {
                    break;
                };
                registry.purge();
            }
            tracing::debug!("Result session purger stopped");
        });
        *registry.purger.lock() = Some(handle);
        registry
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    /// Result session for `query_id`, created on first access
    pub fn get_query(&self, query_id: QueryId, slug: &str) -> Result<Arc<Query>> {
        if let Some(query) = self.queries.get(&query_id) {
            if !query.is_slug_valid(slug) {
                return Err(QueryError::QueryNotFound(query_id.to_string()));
            }
            return Ok(query.clone());
        }

        if !self.manager.is_query_slug_valid(query_id, slug)? {
            return Err(QueryError::QueryNotFound(query_id.to_string()));
        }
        let session = self.manager.query_session(query_id)?;
        let query = self
            .queries
            .entry(query_id)
            .or_insert_with(|| {
                tracing::debug!("Opening result session for query {}", query_id);
                let pool = MemoryPool::unbounded(format!("results-{}", query_id));
                let client = self
                    .supplier
                    .get(Some(pool), session.retry_policy.clone(), query_id);
                Arc::new(Query::new(query_id, slug, self.manager.clone(), client))
            })
            .clone();
        Ok(query)
    }

    /// Wait for the page at `token`, clamping the client's wait and size hints
    pub async fn wait_for_results(
        &self,
        query_id: QueryId,
        slug: &str,
        token: u64,
        max_wait: Option<Duration>,
        target_result_size: Option<u64>,
        base_uri: &Url,
    ) -> Result<ResultsPage> {
        let query = self.get_query(query_id, slug)?;
        query
            .wait_for_results(
                token,
                self.config.clamp_wait(max_wait),
                self.config.clamp_target_size(target_result_size),
                base_uri,
            )
            .await
    }

    /// Cancel a query, whether or not a client has fetched results yet
    pub fn cancel(&self, query_id: QueryId, slug: &str) -> Result<()> {
        if let Some(query) = self.queries.get(&query_id).map(|q| q.clone()) {
            if !query.is_slug_valid(slug) {
                return Err(QueryError::QueryNotFound(query_id.to_string()));
            }
            return query.cancel();
        }
        if !self.manager.is_query_slug_valid(query_id, slug)? {
            return Err(QueryError::QueryNotFound(query_id.to_string()));
        }
        self.manager.cancel_query(query_id)
    }

    /// Drop sessions of queries the manager has forgotten; returns how many
    pub fn purge(&self) -> usize {
        let stale: Vec<QueryId> = self
            .queries
            .iter()
            .filter(|entry| self.manager.query_state(*entry.key()).is_err())
            .map(|entry| *entry.key())
            .collect();
        for query_id in &stale {
            if let Some((_, query)) = self.queries.remove(query_id) {
                query.dispose();
                tracing::debug!("Purged result session of query {}", query_id);
            }
        }
        stale.len()
    }

    /// Stop the purge loop and release every session
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handle = self.purger.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        for entry in self.queries.iter() {
            entry.dispose();
        }
        self.queries.clear();
    }
}

impl Drop for QueryRegistry {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
