//! Exchange client: pulls pages from upstream output buffers.
//!
//! One fetch task runs per upstream channel and feeds a shared, bounded
//! buffer. The consumer is either a pipeline (through [`ExchangeInput`]) or the
//! client-facing result session.
//!
//! With alignment enabled, markers are aligned across channels and forwarded
//! to the consumer. Without it, markers are consumed by the client itself. It
//! records how many batches each channel had delivered at every marker, which
//! makes it possible to rewind onto restored upstream tasks and skip the
//! batches they replay. When attached to a [`SnapshotReporter`] the client
//! reports itself as the result sink once a marker has arrived from every
//! channel.

use crate::alignment::MarkerAligner;
use crate::buffer::{BufferPage, OutputBuffer};
use async_trait::async_trait;
use parking_lot::Mutex;
use query_core::{
    ErrorCode, QueryError, QueryId, Result, SnapshotId, TaskLocation,
};
use query_executor::{
    CapturedStates, InputPoll, MemoryPool, PipelineInput, Readiness, SealedMarker,
    SnapshotReporter, StreamElement,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Configuration for exchange clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeClientConfig {
    /// Fetchers pause once this many bytes wait for the consumer
    pub max_buffered_bytes: u64,
    /// Size hint for a single fetch
    pub max_response_bytes: u64,
    /// Long-poll duration of a single fetch
    pub max_fetch_wait_ms: u64,
}

impl Default for ExchangeClientConfig {
    fn default() -> Self {
        Self {
            max_buffered_bytes: 32 * 1024 * 1024,
            max_response_bytes: 1024 * 1024,
            max_fetch_wait_ms: 200,
        }
    }
}

impl ExchangeClientConfig {
    pub fn with_max_buffered_bytes(mut self, bytes: u64) -> Self {
        self.max_buffered_bytes = bytes;
        self
    }

    pub fn with_max_response_bytes(mut self, bytes: u64) -> Self {
        self.max_response_bytes = bytes;
        self
    }

    pub fn with_max_fetch_wait_ms(mut self, ms: u64) -> Self {
        self.max_fetch_wait_ms = ms;
        self
    }
}

/// Retry policy for transient fetch failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts per fetch, including the first one
    pub max_attempts: u32,
    /// Backoff after the first failure in milliseconds
    pub initial_backoff_ms: u64,
    /// Upper bound for the doubled backoff in milliseconds
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 10,
            max_backoff_ms: 1000,
        }
    }
}

impl RetryPolicy {
    /// Fail on the first error
    pub fn no_retries() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (starting at 1)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(20);
        Duration::from_millis(
            self.initial_backoff_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }
}

/// One upstream channel that can be read by token
#[async_trait]
pub trait ExchangeSource: Send + Sync {
    fn location(&self) -> TaskLocation;

    /// Read from `token` on, waiting up to `max_wait` for data to appear
    async fn fetch(&self, token: u64, max_bytes: u64, max_wait: Duration) -> Result<BufferPage>;
}

/// Reads one partition of an in-process [`OutputBuffer`]
pub struct LocalExchangeSource {
    buffer: Arc<OutputBuffer>,
    partition: usize,
}

impl LocalExchangeSource {
    pub fn new(buffer: Arc<OutputBuffer>, partition: usize) -> Self {
        Self { buffer, partition }
    }
}

#[async_trait]
impl ExchangeSource for LocalExchangeSource {
    fn location(&self) -> TaskLocation {
        self.buffer.location()
    }

    async fn fetch(&self, token: u64, max_bytes: u64, max_wait: Duration) -> Result<BufferPage> {
        let page = self.buffer.get(self.partition, token, max_bytes)?;
        match &page.data_ready {
            Some(ready) => {
                let _ = tokio::time::timeout(max_wait, ready.wait()).await;
                self.buffer.get(self.partition, token, max_bytes)
            }
            None => Ok(page),
        }
    }
}

#[derive(Debug, Default)]
struct Channel {
    finished: bool,
    /// Batches received from this channel, replayed ones included
    received: u64,
    /// Batches up to this count were already received before a rewind
    replayed_until: u64,
    /// Batch count at each marker
    marker_counts: BTreeMap<SnapshotId, u64>,
}

struct ClientState {
    sources: Vec<Arc<dyn ExchangeSource>>,
    channels: Vec<Channel>,
    no_more_sources: bool,
    aligner: Option<MarkerAligner>,
    ready: VecDeque<(StreamElement, u64)>,
    buffered_bytes: u64,
    data_ready: Readiness,
    space: Readiness,
    failure: Option<(ErrorCode, String)>,
    closed: bool,
    generation: u64,
    cancel: CancellationToken,
    reporter: Option<Arc<dyn SnapshotReporter>>,
    last_reported: Option<SnapshotId>,
    skipped_batches: u64,
}

struct ClientInner {
    label: String,
    config: ExchangeClientConfig,
    retry: RetryPolicy,
    pool: Option<Arc<MemoryPool>>,
    state: Mutex<ClientState>,
}

/// Handle to an exchange client; clones share the same buffer
#[derive(Clone)]
pub struct ExchangeClient {
    inner: Arc<ClientInner>,
}

impl ExchangeClient {
    pub fn new(
        label: impl Into<String>,
        config: ExchangeClientConfig,
        retry: RetryPolicy,
        pool: Option<Arc<MemoryPool>>,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                label: label.into(),
                config,
                retry,
                pool,
                state: Mutex::new(ClientState {
                    sources: Vec::new(),
                    channels: Vec::new(),
                    no_more_sources: false,
                    aligner: None,
                    ready: VecDeque::new(),
                    buffered_bytes: 0,
                    data_ready: Readiness::new("exchange-data"),
                    space: Readiness::ready("exchange-space"),
                    failure: None,
                    closed: false,
                    generation: 0,
                    cancel: CancellationToken::new(),
                    reporter: None,
                    last_reported: None,
                    skipped_batches: 0,
                }),
            }),
        }
    }

    /// Align markers across channels and forward them to the consumer
    pub fn with_alignment(self) -> Self {
        {
            let mut state = self.inner.state.lock();
            state.aligner = Some(MarkerAligner::new(state.channels.len()));
        }
        self
    }

    /// Report as the result sink of every snapshot whose marker reached all channels
    pub fn set_recovery_reporter(&self, reporter: Arc<dyn SnapshotReporter>) {
        self.inner.state.lock().reporter = Some(reporter);
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Start reading from another upstream channel. Must be called within a tokio runtime.
    pub fn add_source(&self, source: Arc<dyn ExchangeSource>) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.closed || state.no_more_sources {
            return Err(QueryError::IllegalState(format!(
                "exchange client {} no longer accepts sources",
                self.inner.label
            )));
        }
        let channel = state.channels.len();
        state.channels.push(Channel::default());
        state.sources.push(source.clone());
        if let Some(aligner) = &mut state.aligner {
            aligner.add_channel();
        }
        let generation = state.generation;
        let cancel = state.cancel.child_token();
        drop(state);
        spawn_fetcher(self.inner.clone(), channel, generation, source, cancel);
        Ok(())
    }

    /// No channels will be added; the client finishes once every channel has
    pub fn no_more_sources(&self) {
        let mut state = self.inner.state.lock();
        state.no_more_sources = true;
        state.data_ready.set_ready();
    }

    /// Rewind onto a new set of upstream channels after a recovery.
    ///
    /// `restored` names the snapshot the upstream tasks were restored from,
    /// or `None` when they restarted from scratch. Batches the client already
    /// received are skipped when the new upstreams replay them. The sources
    /// must be given in the same channel order as before.
    pub fn reset_sources(
        &self,
        restored: Option<SnapshotId>,
        sources: Vec<Arc<dyn ExchangeSource>>,
    ) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(QueryError::IllegalState(format!(
                "exchange client {} is closed",
                self.inner.label
            )));
        }
        if sources.len() != state.channels.len() {
            return Err(QueryError::IllegalState(format!(
                "exchange client {} has {} channels, got {} sources",
                self.inner.label,
                state.channels.len(),
                sources.len()
            )));
        }

        state.cancel.cancel();
        state.cancel = CancellationToken::new();
        state.generation += 1;
        state.failure = None;
        for channel in &mut state.channels {
            let base = restored
                .and_then(|id| channel.marker_counts.get(&id).copied())
                .unwrap_or(0);
            channel.replayed_until = channel.replayed_until.max(channel.received);
            channel.received = base;
            channel.finished = false;
            match restored {
                Some(id) => channel.marker_counts.retain(|marker, _| *marker <= id),
                None => channel.marker_counts.clear(),
            }
        }
        if state.aligner.is_some() {
            state.aligner = Some(MarkerAligner::new(sources.len()));
        }
        if restored.is_none() {
            state.last_reported = None;
        }
        tracing::info!(
            "Exchange client {} rewinds to {} over {} channels",
            self.inner.label,
            restored.map_or_else(|| "the start".to_string(), |id| format!("snapshot {}", id)),
            sources.len()
        );
        state.sources = sources.clone();
        let generation = state.generation;
        let cancel = state.cancel.clone();
        drop(state);

        for (channel, source) in sources.into_iter().enumerate() {
            spawn_fetcher(
                self.inner.clone(),
                channel,
                generation,
                source,
                cancel.child_token(),
            );
        }
        Ok(())
    }

    /// Next element for the consumer
    pub fn poll_next(&self) -> Result<InputPoll> {
        let mut state = self.inner.state.lock();
        if let Some((element, bytes)) = state.ready.pop_front() {
            self.inner.release(&mut state, bytes);
            return Ok(InputPoll::Element(element));
        }
        if let Some((code, message)) = &state.failure {
            return Err(QueryError::Remote {
                code: *code,
                message: message.clone(),
            });
        }
        if state.closed || Self::all_finished(&state) {
            return Ok(InputPoll::Finished);
        }
        if state.data_ready.is_ready() {
            state.data_ready = Readiness::new("exchange-data");
        }
        Ok(InputPoll::Pending(state.data_ready.clone()))
    }

    /// Wait until data, completion or a failure is available, or `timeout` elapses.
    /// Returns whether the client has something to report.
    pub async fn wait_for_data(&self, timeout: Duration) -> bool {
        let pending = {
            let mut state = self.inner.state.lock();
            if !state.ready.is_empty()
                || state.failure.is_some()
                || state.closed
                || Self::all_finished(&state)
            {
                return true;
            }
            if state.data_ready.is_ready() {
                state.data_ready = Readiness::new("exchange-data");
            }
            state.data_ready.clone()
        };
        tokio::time::timeout(timeout, pending.wait()).await.is_ok()
    }

    pub fn is_finished(&self) -> bool {
        let state = self.inner.state.lock();
        state.ready.is_empty() && (state.closed || Self::all_finished(&state))
    }

    /// Failure reported by an upstream channel, if any
    pub fn failure(&self) -> Option<QueryError> {
        self.inner
            .state
            .lock()
            .failure
            .as_ref()
            .map(|(code, message)| QueryError::Remote {
                code: *code,
                message: message.clone(),
            })
    }

    pub fn buffered_bytes(&self) -> u64 {
        self.inner.state.lock().buffered_bytes
    }

    /// Batches dropped because an upstream replayed them after a rewind
    pub fn skipped_batches(&self) -> u64 {
        self.inner.state.lock().skipped_batches
    }

    /// Stop every fetcher and release buffered data
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        state.cancel.cancel();
        let bytes = state.buffered_bytes;
        state.ready.clear();
        self.inner.release(&mut state, bytes);
        state.data_ready.set_ready();
        tracing::debug!("Closed exchange client {}", self.inner.label);
    }

    fn all_finished(state: &ClientState) -> bool {
        state.no_more_sources && state.channels.iter().all(|c| c.finished)
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        state.cancel.cancel();
        if let Some(pool) = &self.pool {
            pool.release(state.buffered_bytes);
        }
    }
}

impl ClientInner {
    fn release(&self, state: &mut ClientState, bytes: u64) {
        state.buffered_bytes = state.buffered_bytes.saturating_sub(bytes);
        if let Some(pool) = &self.pool {
            pool.release(bytes);
        }
        if state.buffered_bytes < self.config.max_buffered_bytes {
            state.space.set_ready();
        }
    }

    /// Readiness to wait on when the buffer is full, for fetchers of `generation`
    fn space_for(&self, generation: u64) -> Option<Option<Readiness>> {
        let mut state = self.state.lock();
        if state.closed || state.generation != generation {
            return None;
        }
        if state.buffered_bytes < self.config.max_buffered_bytes {
            return Some(None);
        }
        if state.space.is_ready() {
            state.space = Readiness::new("exchange-space");
        }
        Some(Some(state.space.clone()))
    }

    /// Take in a fetched page; false once the fetcher is stale
    fn accept(&self, channel: usize, generation: u64, page: BufferPage) -> bool {
        let mut reports = Vec::new();
        let accepted = {
            let mut state = self.state.lock();
            if state.closed || state.generation != generation {
                false
            } else {
                for element in page.elements {
                    if let Err(err) = self.receive(&mut state, channel, element, &mut reports) {
                        self.fail_locked(&mut state, &err);
                        break;
                    }
                }
                if page.complete && state.failure.is_none() {
                    self.channel_finished(&mut state, channel, &mut reports);
                }
                state.data_ready.set_ready();
                true
            }
        };
        self.deliver_reports(reports);
        accepted
    }

    fn receive(
        &self,
        state: &mut ClientState,
        channel: usize,
        element: StreamElement,
        reports: &mut Vec<(Arc<dyn SnapshotReporter>, SealedMarker)>,
    ) -> Result<()> {
        match &element {
            StreamElement::Batch(_) => {
                let ch = &mut state.channels[channel];
                ch.received += 1;
                if ch.received <= ch.replayed_until {
                    state.skipped_batches += 1;
                    return Ok(());
                }
            }
            StreamElement::Marker(marker) => {
                let ch = &mut state.channels[channel];
                ch.marker_counts.insert(marker.snapshot_id, ch.received);
                self.check_sink(state, reports);
            }
        }

        let mut out = VecDeque::new();
        match &mut state.aligner {
            Some(aligner) => aligner.process(channel, element, &mut out),
            None => {
                if let StreamElement::Batch(_) = element {
                    out.push_back(element);
                }
            }
        }
        self.enqueue(state, out)
    }

    fn channel_finished(
        &self,
        state: &mut ClientState,
        channel: usize,
        reports: &mut Vec<(Arc<dyn SnapshotReporter>, SealedMarker)>,
    ) {
        state.channels[channel].finished = true;
        let mut out = VecDeque::new();
        if let Some(aligner) = &mut state.aligner {
            aligner.channel_finished(channel, &mut out);
        }
        if let Err(err) = self.enqueue(state, out) {
            self.fail_locked(state, &err);
        }
        self.check_sink(state, reports);
    }

    fn enqueue(&self, state: &mut ClientState, elements: VecDeque<StreamElement>) -> Result<()> {
        for element in elements {
            let bytes = element.memory_size();
            if let Some(pool) = &self.pool {
                pool.try_reserve(bytes)?;
            }
            state.buffered_bytes += bytes;
            state.ready.push_back((element, bytes));
        }
        Ok(())
    }

    /// Queue a result-sink report for every snapshot whose marker reached all channels
    fn check_sink(
        &self,
        state: &mut ClientState,
        reports: &mut Vec<(Arc<dyn SnapshotReporter>, SealedMarker)>,
    ) {
        let Some(reporter) = state.reporter.clone() else {
            return;
        };
        let candidates: Vec<SnapshotId> = state
            .channels
            .iter()
            .flat_map(|c| c.marker_counts.keys().copied())
            .filter(|id| state.last_reported.map_or(true, |last| *id > last))
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        for snapshot_id in candidates {
            let complete = state.channels.iter().all(|c| {
                c.marker_counts.contains_key(&snapshot_id) || c.finished
            });
            if !complete || state.channels.is_empty() {
                break;
            }
            for channel in &mut state.channels {
                let received = channel.received;
                channel.marker_counts.entry(snapshot_id).or_insert(received);
            }
            state.last_reported = Some(snapshot_id);
            reports.push((
                reporter.clone(),
                SealedMarker {
                    marker: query_executor::Marker::new(
                        snapshot_id,
                        TaskLocation::result_sink().partition,
                    ),
                    task: TaskLocation::result_sink(),
                    captured: CapturedStates::Complete(Vec::new()),
                },
            ));
        }
    }

    fn deliver_reports(&self, reports: Vec<(Arc<dyn SnapshotReporter>, SealedMarker)>) {
        for (reporter, sealed) in reports {
            tracing::debug!(
                "Exchange client {} aligned on snapshot {}",
                self.label,
                sealed.marker.snapshot_id
            );
            reporter.report(sealed);
        }
    }

    fn fail(&self, generation: u64, err: &QueryError) {
        let mut state = self.state.lock();
        if state.generation == generation && !state.closed {
            self.fail_locked(&mut state, err);
        }
    }

    fn fail_locked(&self, state: &mut ClientState, err: &QueryError) {
        if state.failure.is_none() {
            tracing::warn!("Exchange client {} failed: {}", self.label, err);
            state.failure = Some((err.error_code(), err.to_string()));
        }
        state.data_ready.set_ready();
    }
}

fn spawn_fetcher(
    inner: Arc<ClientInner>,
    channel: usize,
    generation: u64,
    source: Arc<dyn ExchangeSource>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = fetch_loop(&inner, channel, generation, source.as_ref()) => {}
        }
    });
}

async fn fetch_loop(
    inner: &ClientInner,
    channel: usize,
    generation: u64,
    source: &dyn ExchangeSource,
) {
    let max_wait = Duration::from_millis(inner.config.max_fetch_wait_ms);
    let mut token = 0;
    let mut attempt = 0;
    loop {
        match inner.space_for(generation) {
            None => return,
            Some(Some(space)) => {
                space.wait().await;
                continue;
            }
            Some(None) => {}
        }

        match source
            .fetch(token, inner.config.max_response_bytes, max_wait)
            .await
        {
            Ok(page) => {
                attempt = 0;
                token = page.next_token;
                let complete = page.complete;
                if !inner.accept(channel, generation, page) || complete {
                    return;
                }
            }
            Err(err) if err.is_retryable() && attempt + 1 < inner.retry.max_attempts => {
                attempt += 1;
                let delay = inner.retry.backoff(attempt);
                tracing::warn!(
                    "Fetch from {} for {} failed (attempt {}), retrying in {:?}: {}",
                    source.location(),
                    inner.label,
                    attempt,
                    delay,
                    err
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                inner.fail(generation, &err);
                return;
            }
        }
    }
}

/// Pipeline input reading from an [`ExchangeClient`]
pub struct ExchangeInput {
    client: ExchangeClient,
}

impl ExchangeInput {
    pub fn new(client: ExchangeClient) -> Self {
        Self { client }
    }
}

impl PipelineInput for ExchangeInput {
    fn poll_next(&mut self) -> Result<InputPoll> {
        self.client.poll_next()
    }

    fn close(&mut self) {
        self.client.close();
    }
}

/// Builds exchange clients for result sessions
pub trait ExchangeClientSupplier: Send + Sync {
    fn get(
        &self,
        pool: Option<Arc<MemoryPool>>,
        retry: RetryPolicy,
        query_id: QueryId,
    ) -> ExchangeClient;
}

#[derive(Debug, Clone, Default)]
pub struct DefaultExchangeClientSupplier {
    config: ExchangeClientConfig,
}

impl DefaultExchangeClientSupplier {
    pub fn new(config: ExchangeClientConfig) -> Self {
        Self { config }
    }
}

impl ExchangeClientSupplier for DefaultExchangeClientSupplier {
    fn get(
        &self,
        pool: Option<Arc<MemoryPool>>,
        retry: RetryPolicy,
        query_id: QueryId,
    ) -> ExchangeClient {
        ExchangeClient::new(
            format!("results-{}", query_id),
            self.config.clone(),
            retry,
            pool,
        )
    }
}
