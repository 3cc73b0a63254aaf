//! Generic event watcher: live subscription, historical catch-up and
//! reconnect handling for one [`EventDomain`].
//!
//! Lifecycle:
//! ```text
//! NotStarted → CatchingUp → Live ⇄ Reconnecting
//!                    └──────────────┴──→ Stopped
//! ```
//!
//! The live listener and the catch-up pass feed every log through the same
//! handler, so overlap between them is harmless: entity writes advance only
//! forward and counters are bumped once per `(tx_hash, log_index)`.

pub mod dedupe;

pub use dedupe::SeenSet;

use crate::chain::{ChainClient, ChainConnection, ChainError};
use crate::config::WatcherConfig;
use crate::store::CheckpointStore;

use alloy::primitives::{Address, B256};
use alloy::rpc::types::{Filter, Log};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::StreamExt;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Per-log context handed to [`EventDomain::apply`].
pub struct EventContext {
    pub block: u64,
    pub tx_hash: Option<B256>,
    pub log_index: Option<u64>,
    pub address: Address,
    client: Arc<dyn ChainClient>,
    timestamp: OnceCell<u64>,
}

impl EventContext {
    pub fn new(log: &Log, client: Arc<dyn ChainClient>) -> Self {
        let timestamp = match log.block_timestamp {
            Some(ts) => OnceCell::new_with(Some(ts)),
            None => OnceCell::new(),
        };
        Self {
            block: log.block_number.unwrap_or(0),
            tx_hash: log.transaction_hash,
            log_index: log.log_index,
            address: log.address(),
            client,
            timestamp,
        }
    }

    /// Block timestamp in unix seconds, fetched at most once.
    pub async fn block_timestamp(&self) -> Result<u64, ChainError> {
        self.timestamp
            .get_or_try_init(|| self.client.block_timestamp(self.block))
            .await
            .copied()
    }

    pub async fn block_time(&self) -> anyhow::Result<DateTime<Utc>> {
        let ts = self.block_timestamp().await?;
        DateTime::from_timestamp(ts as i64, 0)
            .ok_or_else(|| anyhow::anyhow!("block {} has out-of-range timestamp {}", self.block, ts))
    }

    pub fn client(&self) -> &Arc<dyn ChainClient> {
        &self.client
    }
}

/// One family of contract events mirrored into the store.
#[async_trait]
pub trait EventDomain: Send + Sync + 'static {
    type Event: Send + Sync + std::fmt::Debug;

    fn name(&self) -> &'static str;

    /// Check contract addresses and dependencies. An error soft-disables
    /// the watcher instead of failing startup.
    async fn validate(&self) -> anyhow::Result<()>;

    fn addresses(&self) -> Vec<Address>;

    /// topic0 of every handled event; catch-up issues one query per topic.
    fn topics(&self) -> Vec<B256>;

    /// `Ok(None)` for logs this domain does not handle.
    fn decode(&self, log: &Log) -> anyhow::Result<Option<Self::Event>>;

    /// Apply one event. Must be idempotent. Returns the counters to bump
    /// when this log has not been counted before.
    async fn apply(&self, event: &Self::Event, ctx: &EventContext) -> anyhow::Result<&'static [&'static str]>;

    /// Row counts of the tables this domain writes.
    async fn entity_counts(&self) -> anyhow::Result<BTreeMap<String, u64>> {
        Ok(BTreeMap::new())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WatcherStatus {
    NotStarted,
    CatchingUp,
    Live,
    Reconnecting,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct WatcherStats {
    pub name: &'static str,
    pub running: bool,
    pub status: WatcherStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub last_block: u64,
    pub last_error: Option<String>,
    pub events_processed: u64,
    pub errors: u64,
    pub counters: BTreeMap<String, u64>,
}

/// Object-safe handle so heterogeneous watchers can be managed together.
#[async_trait]
pub trait ManagedWatcher: Send + Sync {
    fn name(&self) -> &'static str;
    async fn start(&self) -> anyhow::Result<()>;
    async fn stop(&self);
    fn stats(&self) -> WatcherStats;
    async fn entity_counts(&self) -> anyhow::Result<BTreeMap<String, u64>>;
}

struct Status {
    status: WatcherStatus,
    started_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

struct Inner<D: EventDomain> {
    domain: D,
    connection: ChainConnection,
    checkpoints: Arc<dyn CheckpointStore>,
    config: WatcherConfig,
    status: Mutex<Status>,
    running: AtomicBool,
    catching_up: AtomicBool,
    /// First block a failed catch-up left unfetched. While set, live events
    /// do not move the checkpoint past it.
    unfetched_from: Mutex<Option<u64>>,
    cancel: Mutex<Option<CancellationToken>>,
    live: Mutex<Option<CancellationToken>>,
    seen: tokio::sync::Mutex<SeenSet>,
    counters: DashMap<&'static str, u64>,
    events_processed: AtomicU64,
    errors: AtomicU64,
    last_block: AtomicU64,
}

/// Watcher for one domain. Cheap to clone; clones share state.
pub struct Watcher<D: EventDomain> {
    inner: Arc<Inner<D>>,
}

impl<D: EventDomain> Clone for Watcher<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Resets the catch-up flag when a pass ends, including on early return.
struct CatchUpGuard<'a>(&'a AtomicBool);

impl Drop for CatchUpGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl<D: EventDomain> Watcher<D> {
    pub fn new(
        domain: D,
        connection: ChainConnection,
        checkpoints: Arc<dyn CheckpointStore>,
        config: WatcherConfig,
    ) -> Self {
        let seen = SeenSet::new(config.dedupe_capacity);
        Self {
            inner: Arc::new(Inner {
                domain,
                connection,
                checkpoints,
                config,
                status: Mutex::new(Status {
                    status: WatcherStatus::NotStarted,
                    started_at: None,
                    last_error: None,
                }),
                running: AtomicBool::new(false),
                catching_up: AtomicBool::new(false),
                unfetched_from: Mutex::new(None),
                cancel: Mutex::new(None),
                live: Mutex::new(None),
                seen: tokio::sync::Mutex::new(seen),
                counters: DashMap::new(),
                events_processed: AtomicU64::new(0),
                errors: AtomicU64::new(0),
                last_block: AtomicU64::new(0),
            }),
        }
    }

    pub fn domain(&self) -> &D {
        &self.inner.domain
    }

    pub fn name(&self) -> &'static str {
        self.inner.domain.name()
    }

    /// Validate, attach the live listener, arm reconnect handling, then catch up.
    ///
    /// Validation failures soft-disable the watcher: they are logged and
    /// recorded in `last_error`, and `Ok(())` is returned.
    pub async fn start(&self) -> anyhow::Result<()> {
        let name = self.name();
        if lock(&self.inner.status).status == WatcherStatus::Stopped {
            warn!(watcher = name, "start called on stopped watcher");
            return Ok(());
        }
        if self.inner.running.swap(true, Ordering::SeqCst) {
            debug!(watcher = name, "watcher already running");
            return Ok(());
        }

        if let Err(e) = self.inner.domain.validate().await {
            warn!(watcher = name, error = %e, "watcher disabled: validation failed");
            self.inner.running.store(false, Ordering::SeqCst);
            lock(&self.inner.status).last_error = Some(format!("{e:#}"));
            return Ok(());
        }

        let token = CancellationToken::new();
        *lock(&self.inner.cancel) = Some(token.clone());
        {
            let mut status = lock(&self.inner.status);
            status.started_at = Some(Utc::now());
            status.status = WatcherStatus::Live;
        }

        self.spawn_live(&token);
        self.spawn_reconnect_listener(token.clone());

        let lookback = self.inner.config.startup_block_lookback;
        if lookback > 0 {
            match self.current_block().await {
                Ok(current) => {
                    let from = current.saturating_sub(lookback);
                    self.run_catch_up(from, current).await;
                }
                Err(e) => self.record_error(&format!("catch-up skipped: {e}")),
            }
        }

        info!(watcher = name, lookback = lookback, "watcher started");
        Ok(())
    }

    /// Cancel the listener and reconnect tasks. An in-flight handler
    /// finishes first. Idempotent.
    pub async fn stop(&self) {
        if let Some(token) = lock(&self.inner.cancel).take() {
            token.cancel();
        }
        if let Some(live) = lock(&self.inner.live).take() {
            live.cancel();
        }
        let was_running = self.inner.running.swap(false, Ordering::SeqCst);
        lock(&self.inner.status).status = WatcherStatus::Stopped;
        if was_running {
            info!(watcher = self.name(), "watcher stopped");
        }
    }

    pub fn stats(&self) -> WatcherStats {
        let status = lock(&self.inner.status);
        WatcherStats {
            name: self.name(),
            running: self.inner.running.load(Ordering::SeqCst),
            status: status.status,
            started_at: status.started_at,
            last_block: self.inner.last_block.load(Ordering::SeqCst),
            last_error: status.last_error.clone(),
            events_processed: self.inner.events_processed.load(Ordering::SeqCst),
            errors: self.inner.errors.load(Ordering::SeqCst),
            counters: self
                .inner
                .counters
                .iter()
                .map(|e| (e.key().to_string(), *e.value()))
                .collect(),
        }
    }

    /// Replay `[from, to]` through the handler in `chunk_size` block ranges,
    /// one query per event topic. At most one pass runs at a time; a
    /// concurrent call returns immediately with 0.
    ///
    /// A failed chunk ends that topic's walk. The checkpoint only advances to
    /// the last block every topic fetched without a gap, so the rest is
    /// fetched again by the next gap recovery.
    pub async fn catch_up(&self, from: u64, to: u64) -> anyhow::Result<u64> {
        let name = self.name();
        if self.inner.catching_up.swap(true, Ordering::SeqCst) {
            info!(watcher = name, "catch-up already in progress");
            return Ok(0);
        }
        let _guard = CatchUpGuard(&self.inner.catching_up);
        if from > to {
            return Ok(0);
        }

        let (client, _) = self.inner.connection.get_with_generation().await?;
        let chunk = self.inner.config.chunk_size.max(1);
        let addresses = self.inner.domain.addresses();
        let cancel = lock(&self.inner.cancel).clone();
        let mut handled = 0u64;

        info!(watcher = name, from = from, to = to, chunk = chunk, "catch-up started");
        // Highest block every topic has fetched without a gap; None when some
        // topic failed on its first chunk.
        let mut covered = Some(to);
        for topic in self.inner.domain.topics() {
            let base = Filter::new().address(addresses.clone()).event_signature(topic);
            let mut start = from;
            while start <= to {
                if cancel.as_ref().map_or(false, |t| t.is_cancelled()) {
                    info!(watcher = name, "catch-up interrupted by stop");
                    return Ok(handled);
                }
                let end = start.saturating_add(chunk - 1).min(to);
                let filter = base.clone().from_block(start).to_block(end);
                match client.get_logs(&filter).await {
                    Ok(mut logs) => {
                        logs.sort_by_key(|l| (l.block_number, l.log_index));
                        for log in &logs {
                            self.handle_log(log, &client).await;
                        }
                        handled += logs.len() as u64;
                    }
                    Err(e) => {
                        self.record_error(&format!("get_logs {start}..={end}: {e}"));
                        covered = covered
                            .zip(start.checked_sub(1).filter(|&b| b >= from))
                            .map(|(c, b)| c.min(b));
                        break;
                    }
                }
                if end == u64::MAX {
                    break;
                }
                start = end + 1;
            }
        }

        {
            let mut unfetched = lock(&self.inner.unfetched_from);
            if covered == Some(to) {
                if unfetched.map_or(false, |block| block >= from) {
                    *unfetched = None;
                }
            } else {
                let first_missing = covered.map_or(from, |block| block + 1);
                *unfetched = Some(unfetched.map_or(first_missing, |block| block.min(first_missing)));
            }
        }
        match covered {
            Some(block) => {
                if let Err(e) = self.inner.checkpoints.advance(name, block).await {
                    warn!(watcher = name, error = %e, "checkpoint update failed");
                }
            }
            None => warn!(watcher = name, from = from, "catch-up made no gap-free progress, checkpoint kept"),
        }
        if covered == Some(to) {
            info!(watcher = name, from = from, to = to, logs = handled, "catch-up complete");
        } else {
            warn!(
                watcher = name,
                from = from,
                to = to,
                covered = ?covered,
                logs = handled,
                "catch-up incomplete, remaining range retried on next pass"
            );
        }
        Ok(handled)
    }

    async fn current_block(&self) -> Result<u64, ChainError> {
        let client = self.inner.connection.get().await?;
        client.block_number().await
    }

    async fn run_catch_up(&self, from: u64, to: u64) {
        self.set_status(WatcherStatus::CatchingUp);
        if let Err(e) = self.catch_up(from, to).await {
            self.record_error(&format!("catch-up failed: {e:#}"));
        }
        self.set_status(WatcherStatus::Live);
    }

    fn set_status(&self, next: WatcherStatus) {
        let mut status = lock(&self.inner.status);
        if status.status != WatcherStatus::Stopped {
            status.status = next;
        }
    }

    fn record_error(&self, message: &str) {
        self.inner.errors.fetch_add(1, Ordering::SeqCst);
        warn!(watcher = self.name(), error = message, "watcher error");
        lock(&self.inner.status).last_error = Some(message.to_string());
    }

    /// Decode, apply and account for one log. Errors stay inside.
    async fn handle_log(&self, log: &Log, client: &Arc<dyn ChainClient>) {
        let event = match self.inner.domain.decode(log) {
            Ok(Some(event)) => event,
            Ok(None) => return,
            Err(e) => {
                self.record_error(&format!("decode failed: {e:#}"));
                return;
            }
        };

        let ctx = EventContext::new(log, client.clone());
        match self.inner.domain.apply(&event, &ctx).await {
            Ok(counters) => {
                self.inner.events_processed.fetch_add(1, Ordering::SeqCst);
                let first_sighting = match (log.transaction_hash, log.log_index) {
                    (Some(tx), Some(index)) => self.inner.seen.lock().await.insert((tx, index)),
                    _ => true,
                };
                if first_sighting {
                    for counter in counters {
                        *self.inner.counters.entry(counter).or_insert(0) += 1;
                    }
                }
                self.inner.last_block.fetch_max(ctx.block, Ordering::SeqCst);
                debug!(watcher = self.name(), block = ctx.block, event = ?event, "event applied");
            }
            Err(e) => {
                self.record_error(&format!("block {}: {e:#}", ctx.block));
            }
        }
    }

    /// (Re)attach the live listener, cancelling any previous one.
    fn spawn_live(&self, parent: &CancellationToken) {
        let token = parent.child_token();
        if let Some(old) = lock(&self.inner.live).replace(token.clone()) {
            old.cancel();
        }
        let this = self.clone();
        tokio::spawn(async move {
            this.live_loop(token).await;
        });
    }

    async fn live_loop(&self, token: CancellationToken) {
        let name = self.name();
        let (client, generation) = match self.inner.connection.get_with_generation().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(watcher = name, error = %e, "no connection for live listener, waiting for reconnect");
                self.set_status(WatcherStatus::Reconnecting);
                return;
            }
        };

        let filter = Filter::new()
            .address(self.inner.domain.addresses())
            .event_signature(self.inner.domain.topics());
        let mut stream = match client.subscribe_logs(&filter).await {
            Ok(stream) => stream,
            Err(e) => {
                self.record_error(&format!("subscribe failed: {e}"));
                self.set_status(WatcherStatus::Reconnecting);
                self.inner.connection.report_closed(generation, "subscribe failed").await;
                return;
            }
        };
        info!(watcher = name, generation = generation, "live listener attached");

        loop {
            let next = tokio::select! {
                _ = token.cancelled() => return,
                next = stream.next() => next,
            };
            match next {
                Some(log) => {
                    self.handle_log(&log, &client).await;
                    let hole = lock(&self.inner.unfetched_from).is_some();
                    if let (Some(block), false) = (log.block_number, hole) {
                        if let Err(e) = self.inner.checkpoints.advance(name, block).await {
                            debug!(watcher = name, error = %e, "checkpoint update failed");
                        }
                    }
                }
                None => {
                    if token.is_cancelled() {
                        return;
                    }
                    warn!(watcher = name, generation = generation, "live log stream ended");
                    self.set_status(WatcherStatus::Reconnecting);
                    self.inner.connection.report_closed(generation, "log stream ended").await;
                    return;
                }
            }
        }
    }

    fn spawn_reconnect_listener(&self, token: CancellationToken) {
        let mut rx = self.inner.connection.subscribe_reconnects();
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = token.cancelled() => return,
                    msg = rx.recv() => msg,
                };
                match msg {
                    Ok(reconnected) => {
                        info!(watcher = this.name(), generation = reconnected.generation, "re-arming after reconnect");
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(watcher = this.name(), skipped = skipped, "missed reconnect notifications");
                    }
                    Err(RecvError::Closed) => return,
                }
                this.on_reconnected(&token).await;
            }
        });
    }

    async fn on_reconnected(&self, token: &CancellationToken) {
        if token.is_cancelled() {
            return;
        }
        self.set_status(WatcherStatus::Live);
        self.spawn_live(token);

        if !self.inner.config.recover_gap_on_reconnect {
            return;
        }
        let name = self.name();
        let unfetched = *lock(&self.inner.unfetched_from);
        let checkpoint = match self.inner.checkpoints.load(name).await {
            Ok(stored) => match (stored, unfetched) {
                (Some(a), Some(b)) => a.min(b),
                (Some(block), None) | (None, Some(block)) => block,
                (None, None) => return,
            },
            Err(e) => {
                error!(watcher = name, error = %e, "checkpoint unavailable, skipping gap recovery");
                return;
            }
        };
        match self.current_block().await {
            Ok(current) if current > checkpoint => {
                info!(watcher = name, from = checkpoint, to = current, "recovering reconnect gap");
                self.run_catch_up(checkpoint, current).await;
            }
            Ok(_) => {}
            Err(e) => self.record_error(&format!("gap recovery skipped: {e}")),
        }
    }
}

#[async_trait]
impl<D: EventDomain> ManagedWatcher for Watcher<D> {
    fn name(&self) -> &'static str {
        Watcher::name(self)
    }

    async fn start(&self) -> anyhow::Result<()> {
        Watcher::start(self).await
    }

    async fn stop(&self) {
        Watcher::stop(self).await
    }

    fn stats(&self) -> WatcherStats {
        Watcher::stats(self)
    }

    async fn entity_counts(&self) -> anyhow::Result<BTreeMap<String, u64>> {
        self.inner.domain.entity_counts().await
    }
}
