//! Client-facing result session of one query
//!
//! A [`Query`] turns the root output of a possibly recovering query into a
//! sequence of token-addressed pages. Token `t` is answered once with new
//! data and then served from cache if the client asks for `t` again; the
//! next page is only produced for `t + 1`. A wait that times out without
//! anything to say returns an empty page pointing at the same token.

use crate::manager::{QueryInfo, QueryManager};
use crate::results::{batches_to_rows, next_uri, Column, QueryErrorInfo, QueryResults, ResultsPage, StatementStats};
use crate::session::SessionDelta;
use arrow::record_batch::RecordBatch;
use query_core::{ErrorCode, QueryError, QueryId, Result};
use query_distributed::{ExchangeClient, ExchangeSource, LocalExchangeSource, QueryStatus};
use query_executor::{InputPoll, StreamElement};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use url::Url;

/// Longest single sleep while waiting, so state changes are noticed promptly
const POLL_SLICE: Duration = Duration::from_millis(50);

#[derive(Default)]
struct ResultsState {
    next_token: u64,
    last: Option<(u64, ResultsPage)>,
    /// Attempt whose root buffers the client currently reads
    epoch: u64,
    columns: Option<Vec<Column>>,
    pending: SessionDelta,
    processed_rows: u64,
    processed_batches: u64,
    done: bool,
}

enum Drain {
    /// The size target was reached
    Filled,
    Pending,
    Finished,
    Failed(QueryError),
}

enum Step {
    Page(ResultsPage),
    /// Wait for more root output
    Data(Duration),
    /// Wait for the query to move on, e.g. to its next attempt
    Sleep(Duration),
}

pub struct Query {
    query_id: QueryId,
    slug: String,
    manager: Arc<dyn QueryManager>,
    client: ExchangeClient,
    disposed: AtomicBool,
    state: Mutex<ResultsState>,
}

impl Query {
    pub fn new(
        query_id: QueryId,
        slug: impl Into<String>,
        manager: Arc<dyn QueryManager>,
        client: ExchangeClient,
    ) -> Self {
        Self {
            query_id,
            slug: slug.into(),
            manager,
            client,
            disposed: AtomicBool::new(false),
            state: Mutex::new(ResultsState::default()),
        }
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn is_slug_valid(&self, slug: &str) -> bool {
        self.slug == slug
    }

    /// Answer a request for `token`, waiting at most `max_wait` for something new
    ///
    /// The session lock is held only while checking the token and moving output
    /// into the next page; waits happen without it, so a retry of the last
    /// token is answered while another request long-polls the next one.
    pub async fn wait_for_results(
        &self,
        token: u64,
        max_wait: Duration,
        target_result_size: u64,
        base_uri: &Url,
    ) -> Result<ResultsPage> {
        let deadline = Instant::now() + max_wait;
        loop {
            let step = {
                let mut state = self.state.lock().await;
                if let Some((last_token, page)) = &state.last {
                    if *last_token == token {
                        return Ok(page.clone());
                    }
                }
                if token != state.next_token || state.done {
                    return Err(QueryError::InvalidToken {
                        query_id: self.query_id.to_string(),
                        token,
                    });
                }
                self.step(&mut state, token, deadline, target_result_size.max(1), base_uri)?
            };
            match step {
                Step::Page(page) => return Ok(page),
                Step::Data(slice) => {
                    self.client.wait_for_data(slice).await;
                }
                Step::Sleep(slice) => tokio::time::sleep(slice).await,
            }
        }
    }

    /// One pass over the root output: either the page for `token` or how long to wait
    fn step(
        &self,
        state: &mut ResultsState,
        token: u64,
        deadline: Instant,
        target: u64,
        base_uri: &Url,
    ) -> Result<Step> {
        let info = self.sync(state)?;
        let mut batches = Vec::new();
        let mut bytes = 0u64;
        let drained = self.drain(&mut batches, &mut bytes, target);

        match info.state {
            QueryStatus::Failed => {
                let error = info.failure.as_ref().map_or_else(
                    || QueryErrorInfo::new(ErrorCode::Internal, "Query failed"),
                    |failure| QueryErrorInfo::new(failure.code, failure.message.clone()),
                );
                return self.advance(state, token, Vec::new(), &info, Some(error), base_uri).map(Step::Page);
            }
            QueryStatus::Cancelled => {
                let error = QueryErrorInfo::new(ErrorCode::Cancelled, "Query was canceled");
                return self.advance(state, token, Vec::new(), &info, Some(error), base_uri).map(Step::Page);
            }
            _ => {}
        }

        match &drained {
            Drain::Finished if info.state == QueryStatus::Finished => {
                return self.advance(state, token, batches, &info, None, base_uri).map(Step::Page);
            }
            Drain::Filled => {
                return self.advance(state, token, batches, &info, None, base_uri).map(Step::Page);
            }
            Drain::Failed(err) if info.state == QueryStatus::Finished => {
                let error = QueryErrorInfo::new(err.error_code(), err.to_string());
                return self.advance(state, token, Vec::new(), &info, Some(error), base_uri).map(Step::Page);
            }
            _ => {}
        }
        if !batches.is_empty() || !state.pending.is_empty() {
            return self.advance(state, token, batches, &info, None, base_uri).map(Step::Page);
        }

        let now = Instant::now();
        if now >= deadline {
            return Ok(Step::Page(self.empty_page(state, token, &info, base_uri)));
        }
        let slice = (deadline - now).min(POLL_SLICE);
        Ok(match drained {
            // a failed root task is replaced by the next attempt; wait for its epoch
            Drain::Failed(_) | Drain::Finished => Step::Sleep(slice),
            _ => Step::Data(slice),
        })
    }

    /// Cancel the query and release the session's buffers
    pub fn cancel(&self) -> Result<()> {
        tracing::info!("Cancelling query {} through its result session", self.query_id);
        let result = self.manager.cancel_query(self.query_id);
        self.dispose();
        result
    }

    /// Release buffers without touching the query
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        self.client.close();
    }

    /// Pick up session updates and follow the root output to the current attempt
    fn sync(&self, state: &mut ResultsState) -> Result<QueryInfo> {
        let info = self.manager.query_info(self.query_id)?;
        state
            .pending
            .extend(self.manager.take_session_updates(self.query_id)?);

        // a failed or cancelled query has nothing left to deliver
        let delivering = !self.disposed.load(Ordering::SeqCst)
            && !matches!(info.state, QueryStatus::Failed | QueryStatus::Cancelled);
        if let Some(root) = info.root.as_ref().filter(|_| delivering) {
            if root.epoch != state.epoch {
                let sources: Vec<Arc<dyn ExchangeSource>> = root
                    .buffers
                    .iter()
                    .map(|buffer| {
                        Arc::new(LocalExchangeSource::new(buffer.clone(), 0)) as Arc<dyn ExchangeSource>
                    })
                    .collect();
                self.client.set_recovery_reporter(info.sink_reporter.clone());
                if state.epoch == 0 {
                    for source in sources {
                        self.client.add_source(source)?;
                    }
                    self.client.no_more_sources();
                } else {
                    tracing::info!(
                        "Result session of query {} follows attempt {} (restored from {:?})",
                        self.query_id,
                        root.epoch,
                        root.restored_from
                    );
                    self.client.reset_sources(root.restored_from, sources)?;
                }
                state.epoch = root.epoch;
            }
        }
        Ok(info)
    }

    fn drain(&self, batches: &mut Vec<RecordBatch>, bytes: &mut u64, target: u64) -> Drain {
        while *bytes < target {
            match self.client.poll_next() {
                Ok(InputPoll::Element(StreamElement::Batch(batch))) => {
                    *bytes += batch.get_array_memory_size() as u64;
                    batches.push(batch);
                }
                Ok(InputPoll::Element(StreamElement::Marker(_))) => {}
                Ok(InputPoll::Pending(_)) => return Drain::Pending,
                Ok(InputPoll::Finished) => return Drain::Finished,
                Err(err) => return Drain::Failed(err),
            }
        }
        Drain::Filled
    }

    fn stats(&self, state: &ResultsState, info: &QueryInfo) -> StatementStats {
        StatementStats {
            state: info.state.to_string(),
            recovering: info.state == QueryStatus::Recovering,
            processed_rows: state.processed_rows,
            processed_batches: state.processed_batches,
            epoch: state.epoch,
        }
    }

    /// Produce the page for `token`, cache it and move the cursor past it
    fn advance(
        &self,
        state: &mut ResultsState,
        token: u64,
        batches: Vec<RecordBatch>,
        info: &QueryInfo,
        error: Option<QueryErrorInfo>,
        base_uri: &Url,
    ) -> Result<ResultsPage> {
        let done = error.is_some() || (info.state.is_terminal() && self.client.is_finished());
        if let Some(first) = batches.first() {
            if state.columns.is_none() {
                state.columns = Some(Column::from_batch(first));
            }
        }
        let rows = batches_to_rows(&batches)?;
        state.processed_rows += rows.len() as u64;
        state.processed_batches += batches.len() as u64;

        let results = QueryResults {
            id: self.query_id.to_string(),
            next_uri: (!done).then(|| next_uri(base_uri, self.query_id, &self.slug, token + 1)),
            columns: state.columns.clone(),
            data: (!rows.is_empty()).then_some(rows),
            stats: self.stats(state, info),
            error,
        };
        let page = ResultsPage {
            results,
            session: state.pending.take(),
        };
        state.next_token = token + 1;
        state.last = Some((token, page.clone()));
        if done {
            state.done = true;
            self.client.close();
            tracing::debug!("Result session of query {} delivered its last page", self.query_id);
        }
        Ok(page)
    }

    /// Nothing new before the deadline: ask the client to come back with the same token
    fn empty_page(&self, state: &ResultsState, token: u64, info: &QueryInfo, base_uri: &Url) -> ResultsPage {
        ResultsPage {
            results: QueryResults {
                id: self.query_id.to_string(),
                next_uri: Some(next_uri(base_uri, self.query_id, &self.slug, token)),
                columns: state.columns.clone(),
                data: None,
                stats: self.stats(state, info),
                error: None,
            },
            session: SessionDelta::default(),
        }
    }
}
