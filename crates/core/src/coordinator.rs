//! Synchronization coordination.
//!
//! One job per event stream, each owning its watermark. A parent tick fans
//! out child tasks; a per-stream keyed lock guarantees at most one active
//! child per stream. Far behind head a stream backfills with paged
//! `eth_getLogs`; near head it drains the websocket ingestion queue. A
//! batch either appends and routes in full or not at all, and the watermark
//! (held by the store) moves only on success.
//!
//! Failures back off exponentially; after `max_retries` consecutive
//! failures the stream is marked degraded and its children are suppressed
//! until an operator acknowledges it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, B256};
use alloy::rpc::types::{Filter, Log};
use anyhow::Result;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant};
use tracing::{debug, error, info, warn};

use sentinel_chain::{
    decode_log, DecodeError, EventListener, EventPayload, HeadObservation, LogEvent,
    ProviderManager, ReorgTracker, StreamId, SubscriptionSpec,
};

use crate::balances::ScaledBalanceAggregator;
use crate::config::config;
use crate::error::ErrorClass;
use crate::indices::LiquidityIndexTracker;
use crate::oracle::PriceComposer;
use crate::projection::ConfigProjection;
use crate::store::EventLogStore;

/// Initial retry backoff.
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
/// Retry backoff cap.
const BACKOFF_MAX: Duration = Duration::from_secs(60);

/// How a stream synchronizes this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Paged historical `eth_getLogs`
    Backfill,
    /// Drain the websocket ingestion queue
    Streaming,
}

/// Choose the sync mode from the distance to head.
pub fn sync_mode(head: u64, watermark_block: u64, streaming_threshold: u64) -> SyncMode {
    if head.saturating_sub(watermark_block) > streaming_threshold {
        SyncMode::Backfill
    } else {
        SyncMode::Streaming
    }
}

/// Exponential backoff delay after `failures` consecutive failures.
pub fn backoff_delay(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(6);
    (BACKOFF_INITIAL * 2u32.pow(exp)).min(BACKOFF_MAX)
}

/// Declaration of one synchronized stream.
#[derive(Debug, Clone)]
pub struct StreamSpec {
    pub id: StreamId,
    /// Contracts the filter watches (usually just the stream's contract)
    pub addresses: Vec<Address>,
    /// Topic-0 set for the filter
    pub topics: Vec<B256>,
}

impl StreamSpec {
    pub fn new(id: StreamId) -> Self {
        Self {
            addresses: vec![id.contract],
            topics: vec![id.kind.signature()],
            id,
        }
    }
}

/// Routes appended events to the aggregators that fold them.
pub struct EventRouter {
    pub balances: Arc<ScaledBalanceAggregator>,
    pub indices: Arc<LiquidityIndexTracker>,
    pub projection: Arc<ConfigProjection>,
    pub composer: Arc<PriceComposer>,
}

impl EventRouter {
    /// Dispatch one appended event to its materialization.
    pub fn route(&self, event: &LogEvent) {
        match &event.payload {
            EventPayload::ReserveDataUpdated { .. } => {
                self.indices.apply(event);
                // Fresh indices may unblock parked transfers.
                let drained = self.balances.retry_deferred();
                if drained > 0 {
                    debug!(drained, "Index arrival drained deferred transfers");
                }
            }
            EventPayload::Mint { .. }
            | EventPayload::Burn { .. }
            | EventPayload::BalanceTransfer { .. }
            | EventPayload::CollateralToggle { .. } => {
                if let Err(e) = self.balances.apply(event) {
                    match e.class() {
                        ErrorClass::Transient => {
                            debug!(error = %e, "Balance event deferred");
                        }
                        _ => {
                            error!(error = %e, version = event.version(), "Balance event failed");
                        }
                    }
                }
            }
            EventPayload::ReserveInitialized { .. }
            | EventPayload::CollateralConfigurationChanged { .. }
            | EventPayload::EModeAssetCategoryChanged { .. }
            | EventPayload::EModeCategoryAdded { .. }
            | EventPayload::AssetSourceUpdated { .. }
            | EventPayload::UserEModeSet { .. } => {
                self.projection.apply(event);
            }
            EventPayload::NewTransmission { .. }
            | EventPayload::AnswerUpdated { .. }
            | EventPayload::PriceCapUpdated { .. }
            | EventPayload::CapParametersUpdated { .. } => {
                self.composer.apply_event(event);
            }
        }
    }

    /// Route a batch, republishing the configuration snapshot when any
    /// configuration event was present.
    pub fn route_batch(&self, events: &[LogEvent]) {
        let mut config_changed = false;
        for event in events {
            if matches!(
                event.payload,
                EventPayload::ReserveInitialized { .. }
                    | EventPayload::CollateralConfigurationChanged { .. }
                    | EventPayload::EModeAssetCategoryChanged { .. }
                    | EventPayload::EModeCategoryAdded { .. }
                    | EventPayload::AssetSourceUpdated { .. }
            ) {
                config_changed = true;
            }
            self.route(event);
        }
        if config_changed {
            self.projection.publish();
        }
    }
}

struct JobState {
    consecutive_failures: u32,
    degraded: bool,
    next_attempt_at: Instant,
}

impl Default for JobState {
    fn default() -> Self {
        Self {
            consecutive_failures: 0,
            degraded: false,
            next_attempt_at: Instant::now(),
        }
    }
}

type LogQueue = (mpsc::Sender<Log>, tokio::sync::Mutex<mpsc::Receiver<Log>>);

/// Orchestrates backfill and streaming for every event stream.
pub struct SyncCoordinator {
    provider: Arc<ProviderManager>,
    listener: Arc<EventListener>,
    store: Arc<EventLogStore>,
    router: Arc<EventRouter>,
    reorg: Arc<ReorgTracker>,
    specs: Vec<StreamSpec>,
    jobs: DashMap<StreamId, JobState>,
    locks: DashMap<StreamId, Arc<tokio::sync::Mutex<()>>>,
    queues: DashMap<StreamId, Arc<LogQueue>>,
    head: AtomicU64,
}

impl SyncCoordinator {
    pub fn new(
        provider: Arc<ProviderManager>,
        listener: Arc<EventListener>,
        store: Arc<EventLogStore>,
        router: Arc<EventRouter>,
        specs: Vec<StreamSpec>,
    ) -> Self {
        let cfg = config();
        let queues = DashMap::new();
        for spec in &specs {
            let (tx, rx) = mpsc::channel(cfg.ingest_queue_size);
            queues.insert(spec.id, Arc::new((tx, tokio::sync::Mutex::new(rx))));
        }

        Self {
            provider,
            listener,
            store,
            router,
            reorg: Arc::new(ReorgTracker::new(cfg.reorg_depth)),
            specs,
            jobs: DashMap::new(),
            locks: DashMap::new(),
            queues,
            head: AtomicU64::new(0),
        }
    }

    /// Latest head block observed.
    pub fn head(&self) -> u64 {
        self.head.load(Ordering::Acquire)
    }

    /// Streams currently marked degraded.
    pub fn degraded_streams(&self) -> Vec<StreamId> {
        self.jobs
            .iter()
            .filter(|e| e.value().degraded)
            .map(|e| *e.key())
            .collect()
    }

    /// Operator acknowledgement: resume a degraded stream.
    pub fn acknowledge(&self, stream: StreamId) -> bool {
        if let Some(mut job) = self.jobs.get_mut(&stream) {
            if job.degraded {
                info!(stream = %stream, "Degraded stream acknowledged, resuming");
                job.degraded = false;
                job.consecutive_failures = 0;
                job.next_attempt_at = Instant::now();
                return true;
            }
        }
        false
    }

    /// Run forever: head watcher + websocket pump + parent tick loop.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let head = self.provider.block_number().await?;
        self.head.store(head, Ordering::Release);
        info!(head, streams = self.specs.len(), "Coordinator starting");

        let head_task = tokio::spawn(self.clone().watch_heads());
        let pump_task = tokio::spawn(self.clone().pump_logs());

        let mut tick = interval(config().tick_interval());
        loop {
            tick.tick().await;
            self.fan_out();
        }
        // Unreachable; the tasks live as long as the loop.
        #[allow(unreachable_code)]
        {
            head_task.abort();
            pump_task.abort();
            Ok(())
        }
    }

    /// Spawn one child per runnable stream.
    fn fan_out(self: &Arc<Self>) {
        let now = Instant::now();
        for spec in &self.specs {
            {
                let job = self.jobs.entry(spec.id).or_default();
                if job.degraded || job.next_attempt_at > now {
                    continue;
                }
            }

            let lock = self
                .locks
                .entry(spec.id)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone();
            let Ok(guard) = lock.clone().try_lock_owned() else {
                // A child for this stream is still running.
                continue;
            };

            let coordinator = self.clone();
            let spec = spec.clone();
            tokio::spawn(async move {
                let _guard = guard;
                let stream = spec.id;
                match coordinator.sync_stream(&spec).await {
                    Ok(appended) => {
                        if appended > 0 {
                            debug!(stream = %stream, appended, "Stream advanced");
                        }
                        coordinator.record_success(stream);
                    }
                    Err(e) => coordinator.record_failure(stream, e),
                }
            });
        }
    }

    /// Advance one stream by one batch. Returns how many events appended.
    async fn sync_stream(&self, spec: &StreamSpec) -> Result<usize> {
        let cfg = config();
        let head = self.head();
        let watermark_block = (self.store.watermark(spec.id) / 1_000_000_000) as u64;

        let logs = match sync_mode(head, watermark_block, cfg.streaming_threshold_blocks) {
            SyncMode::Backfill => {
                let from = watermark_block + 1;
                let to = (from + cfg.backfill_page_blocks - 1).min(head);
                if from > to {
                    return Ok(0);
                }
                let filter = Filter::new()
                    .address(spec.addresses.clone())
                    .event_signature(spec.topics.clone());
                let use_archive = head.saturating_sub(to) > cfg.streaming_threshold_blocks;
                self.provider
                    .get_logs_paged(&filter, from, to, cfg.backfill_page_blocks, use_archive)
                    .await?
            }
            SyncMode::Streaming => self.drain_queue(spec.id).await,
        };

        if logs.is_empty() {
            return Ok(0);
        }

        // Decode; unknown tokens are configuration noise, not batch failures.
        let mut events = Vec::with_capacity(logs.len());
        for log in &logs {
            match decode_log(log, self.router.projection.as_ref()) {
                Ok(event) => events.push(event),
                Err(DecodeError::UnknownToken(token)) => {
                    debug!(token = %token, "Skipping log from unbound token");
                }
                Err(e) => {
                    warn!(stream = %spec.id, error = %e, "Undecodable log skipped");
                }
            }
        }
        events.sort_by_key(|e| e.version());

        let appended = self.store.append_batch(spec.id, events)?;
        self.router.route_batch(&appended);
        Ok(appended.len())
    }

    /// Pull everything currently queued for a stream.
    async fn drain_queue(&self, stream: StreamId) -> Vec<Log> {
        let Some(queue) = self.queues.get(&stream).map(|q| q.clone()) else {
            return Vec::new();
        };
        let mut receiver = queue.1.lock().await;
        let mut logs = Vec::new();
        while let Ok(log) = receiver.try_recv() {
            logs.push(log);
        }
        logs
    }

    /// Websocket pump: one subscription covering every stream, fanned into
    /// per-stream bounded queues. A full queue blocks the pump, which is
    /// the backpressure onto the socket.
    async fn pump_logs(self: Arc<Self>) {
        let mut addresses: Vec<Address> = self.specs.iter().flat_map(|s| s.addresses.clone()).collect();
        let mut topics: Vec<B256> = self.specs.iter().flat_map(|s| s.topics.clone()).collect();
        addresses.sort();
        addresses.dedup();
        topics.sort();
        topics.dedup();

        let sub = SubscriptionSpec { addresses, topics };
        let mut stream = match self.listener.subscribe_logs(sub).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(error = %e, "Log pump failed to start");
                return;
            }
        };

        while let Some(log) = stream.next().await {
            let Some(topic0) = log.topics().first().copied() else {
                continue;
            };
            let contract = log.address();
            let target = self
                .specs
                .iter()
                .find(|s| s.topics.contains(&topic0) && s.addresses.contains(&contract));
            let Some(spec) = target else {
                continue;
            };
            if let Some(queue) = self.queues.get(&spec.id).map(|q| q.clone()) {
                if queue.0.send(log).await.is_err() {
                    error!(stream = %spec.id, "Ingestion queue closed");
                    return;
                }
            }
        }
    }

    /// Head watcher: keeps the head height fresh and absorbs shallow
    /// reorganizations by truncating affected streams.
    async fn watch_heads(self: Arc<Self>) {
        let mut heads = match self.listener.subscribe_new_heads().await {
            Ok(stream) => stream,
            Err(e) => {
                error!(error = %e, "Head watcher failed to start");
                return;
            }
        };

        while let Some(head) = heads.next().await {
            self.head.store(head.number, Ordering::Release);

            match self.reorg.observe(head.number, head.hash, head.parent_hash) {
                Ok(HeadObservation::Extends) => {}
                Ok(HeadObservation::RewindTo(block)) => {
                    let version = sentinel_chain::version(block, 0, 0);
                    for spec in &self.specs {
                        self.store.truncate_above(spec.id, version.saturating_sub(1));
                    }
                    warn!(block, "Rewound streams after reorganization");
                }
                Err(e) => {
                    // Deeper than the absorbable depth: fatal by design.
                    error!(error = %e, "Unrecoverable chain reorganization");
                    std::process::abort();
                }
            }
        }
    }

    fn record_success(&self, stream: StreamId) {
        if let Some(mut job) = self.jobs.get_mut(&stream) {
            job.consecutive_failures = 0;
            job.next_attempt_at = Instant::now();
        }
    }

    fn record_failure(&self, stream: StreamId, error: anyhow::Error) {
        let cfg = config();
        let mut job = self.jobs.entry(stream).or_default();
        job.consecutive_failures += 1;
        let delay = backoff_delay(job.consecutive_failures);
        job.next_attempt_at = Instant::now() + delay;

        if job.consecutive_failures >= cfg.max_retries {
            job.degraded = true;
            error!(
                stream = %stream,
                failures = job.consecutive_failures,
                error = %error,
                "Stream degraded, awaiting operator acknowledgement"
            );
        } else {
            warn!(
                stream = %stream,
                failures = job.consecutive_failures,
                retry_in = ?delay,
                error = %error,
                "Stream sync failed, backing off"
            );
        }
    }
}
