//! Debounced batch queue.
//!
//! Bursts of events for the same key collapse into one unit of work: every
//! `enqueue` overwrites the key's pending entry and restarts that key's own
//! timer. When a timer fires the entry becomes due and a run is triggered.
//!
//! Only one run is in flight at a time. A run keeps draining due entries
//! (at most `max_batch` per pass) until none are left, then rechecks after
//! releasing the flag, so an entry that became due while the last pass was
//! finishing is never stranded.

use crate::config::VotePowerConfig;

use alloy::primitives::B256;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// Latest observation for a key.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEntry {
    pub key: String,
    pub block: u64,
    pub tx_hash: Option<B256>,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Updated,
    Unchanged,
    Skipped,
}

#[async_trait]
pub trait BatchProcessor: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn process(&self, entry: &PendingEntry) -> anyhow::Result<ProcessOutcome>;
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub name: &'static str,
    pub pending: usize,
    pub due: usize,
    pub processing: bool,
    pub runs: u64,
    pub processed: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub skipped: u64,
    pub errors: u64,
    pub last_error: Option<String>,
}

struct Pending {
    entry: PendingEntry,
    due: bool,
    generation: u64,
    timer: Option<AbortHandle>,
}

#[derive(Default)]
struct Counters {
    runs: AtomicU64,
    processed: AtomicU64,
    updated: AtomicU64,
    unchanged: AtomicU64,
    skipped: AtomicU64,
    errors: AtomicU64,
}

struct Inner<P: BatchProcessor> {
    processor: P,
    debounce: Duration,
    max_batch: usize,
    pending: DashMap<String, Pending>,
    next_generation: AtomicU64,
    processing: AtomicBool,
    counters: Counters,
    last_error: Mutex<Option<String>>,
}

pub struct DebouncedQueue<P: BatchProcessor> {
    inner: Arc<Inner<P>>,
}

impl<P: BatchProcessor> Clone for DebouncedQueue<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P: BatchProcessor> DebouncedQueue<P> {
    pub fn new(processor: P, debounce: Duration, max_batch: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                processor,
                debounce,
                max_batch: max_batch.max(1),
                pending: DashMap::new(),
                next_generation: AtomicU64::new(0),
                processing: AtomicBool::new(false),
                counters: Counters::default(),
                last_error: Mutex::new(None),
            }),
        }
    }

    pub fn from_config(processor: P, config: &VotePowerConfig) -> Self {
        Self::new(processor, config.debounce(), config.max_batch)
    }

    pub fn processor(&self) -> &P {
        &self.inner.processor
    }

    /// Record the latest observation for `key` and restart its timer.
    pub fn enqueue(&self, key: impl Into<String>, block: u64, tx_hash: Option<B256>) {
        let key = key.into();
        let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let entry = PendingEntry {
            key: key.clone(),
            block,
            tx_hash,
            enqueued_at: Utc::now(),
        };
        let previous = self.inner.pending.insert(
            key.clone(),
            Pending {
                entry,
                due: false,
                generation,
                timer: None,
            },
        );
        if let Some(timer) = previous.and_then(|p| p.timer) {
            timer.abort();
        }

        let this = self.clone();
        let timer_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(this.inner.debounce).await;
            if this.mark_due(&timer_key, generation) {
                this.run().await;
            }
        });
        if let Some(mut pending) = self.inner.pending.get_mut(&key) {
            if pending.generation == generation {
                pending.timer = Some(handle.abort_handle());
            }
        }
        debug!(queue = self.inner.processor.name(), key = %key, block = block, "enqueued");
    }

    fn mark_due(&self, key: &str, generation: u64) -> bool {
        match self.inner.pending.get_mut(key) {
            Some(mut pending) if pending.generation == generation => {
                pending.due = true;
                pending.timer = None;
                true
            }
            _ => false,
        }
    }

    /// Cancel every timer, mark everything due and run now. If a run is
    /// already in flight it picks the entries up before releasing.
    pub async fn force_flush(&self) {
        for mut pending in self.inner.pending.iter_mut() {
            if let Some(timer) = pending.timer.take() {
                timer.abort();
            }
            pending.due = true;
        }
        info!(queue = self.inner.processor.name(), pending = self.inner.pending.len(), "force flush");
        self.run().await;
    }

    /// Remove and return up to `max_batch` due entries, oldest first.
    fn take_due(&self) -> Vec<PendingEntry> {
        let mut due: Vec<(DateTime<Utc>, String)> = self
            .inner
            .pending
            .iter()
            .filter(|p| p.due)
            .map(|p| (p.entry.enqueued_at, p.key().clone()))
            .collect();
        due.sort();
        due.truncate(self.inner.max_batch);

        due.into_iter()
            .filter_map(|(_, key)| self.inner.pending.remove_if(&key, |_, p| p.due))
            .map(|(_, p)| p.entry)
            .collect()
    }

    fn has_due(&self) -> bool {
        self.inner.pending.iter().any(|p| p.due)
    }

    async fn run(&self) {
        if self.inner.processing.swap(true, Ordering::SeqCst) {
            return;
        }
        loop {
            let batch = self.take_due();
            if batch.is_empty() {
                self.inner.processing.store(false, Ordering::SeqCst);
                if self.has_due() && !self.inner.processing.swap(true, Ordering::SeqCst) {
                    continue;
                }
                return;
            }
            self.process_batch(batch).await;
        }
    }

    async fn process_batch(&self, batch: Vec<PendingEntry>) {
        let name = self.inner.processor.name();
        let counters = &self.inner.counters;
        counters.runs.fetch_add(1, Ordering::SeqCst);
        let size = batch.len();

        for entry in &batch {
            match self.inner.processor.process(entry).await {
                Ok(outcome) => {
                    let counter = match outcome {
                        ProcessOutcome::Updated => &counters.updated,
                        ProcessOutcome::Unchanged => &counters.unchanged,
                        ProcessOutcome::Skipped => &counters.skipped,
                    };
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                Err(e) => {
                    counters.errors.fetch_add(1, Ordering::SeqCst);
                    warn!(queue = name, key = %entry.key, error = %e, "batch entry failed");
                    if let Ok(mut last) = self.inner.last_error.lock() {
                        *last = Some(format!("{}: {e:#}", entry.key));
                    }
                }
            }
            counters.processed.fetch_add(1, Ordering::SeqCst);
        }
        info!(queue = name, size = size, "batch processed");
    }

    pub fn stats(&self) -> QueueStats {
        let c = &self.inner.counters;
        QueueStats {
            name: self.inner.processor.name(),
            pending: self.inner.pending.len(),
            due: self.inner.pending.iter().filter(|p| p.due).count(),
            processing: self.inner.processing.load(Ordering::SeqCst),
            runs: c.runs.load(Ordering::SeqCst),
            processed: c.processed.load(Ordering::SeqCst),
            updated: c.updated.load(Ordering::SeqCst),
            unchanged: c.unchanged.load(Ordering::SeqCst),
            skipped: c.skipped.load(Ordering::SeqCst),
            errors: c.errors.load(Ordering::SeqCst),
            last_error: self.inner.last_error.lock().ok().and_then(|l| l.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<PendingEntry>>,
    }

    #[async_trait]
    impl BatchProcessor for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        async fn process(&self, entry: &PendingEntry) -> anyhow::Result<ProcessOutcome> {
            self.seen.lock().unwrap().push(entry.clone());
            anyhow::ensure!(entry.key != "bad", "cannot process {}", entry.key);
            Ok(ProcessOutcome::Updated)
        }
    }

    impl Recorder {
        fn keys(&self) -> Vec<String> {
            self.seen.lock().unwrap().iter().map(|e| e.key.clone()).collect()
        }
    }

    const DEBOUNCE: Duration = Duration::from_secs(30);

    #[tokio::test(start_paused = true)]
    async fn test_burst_coalesces_to_latest() {
        let queue = DebouncedQueue::new(Recorder::default(), DEBOUNCE, 50);
        queue.enqueue("0xa", 10, None);
        tokio::time::sleep(Duration::from_secs(10)).await;
        queue.enqueue("0xa", 11, None);
        tokio::time::sleep(Duration::from_secs(10)).await;
        queue.enqueue("0xa", 12, None);

        // 29s after the last enqueue nothing has fired yet.
        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(queue.processor().keys().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        let seen = queue.processor().seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].block, 12);
        assert_eq!(queue.stats().pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timers_are_per_key() {
        let queue = DebouncedQueue::new(Recorder::default(), DEBOUNCE, 50);
        queue.enqueue("0xa", 1, None);
        tokio::time::sleep(Duration::from_secs(20)).await;
        queue.enqueue("0xb", 2, None);

        // A enqueueing B did not push A's deadline back.
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(queue.processor().keys(), vec!["0xa"]);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(queue.processor().keys(), vec!["0xa", "0xb"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drains_in_max_batch_passes() {
        let queue = DebouncedQueue::new(Recorder::default(), DEBOUNCE, 2);
        for i in 0..5 {
            queue.enqueue(format!("0x{i}"), i, None);
        }
        queue.force_flush().await;

        let stats = queue.stats();
        assert_eq!(stats.processed, 5);
        assert_eq!(stats.runs, 3);
        assert_eq!(stats.pending, 0);
        assert!(!stats.processing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_isolated() {
        let queue = DebouncedQueue::new(Recorder::default(), DEBOUNCE, 50);
        queue.enqueue("0xa", 1, None);
        queue.enqueue("bad", 1, None);
        queue.enqueue("0xc", 1, None);
        queue.force_flush().await;

        let stats = queue.stats();
        assert_eq!(stats.processed, 3);
        assert_eq!(stats.updated, 2);
        assert_eq!(stats.errors, 1);
        assert!(stats.last_error.unwrap().contains("bad"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_flush_cancels_timers() {
        let queue = DebouncedQueue::new(Recorder::default(), DEBOUNCE, 50);
        queue.enqueue("0xa", 1, None);
        queue.force_flush().await;
        assert_eq!(queue.processor().keys(), vec!["0xa"]);

        // The aborted timer never produces a second run.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(queue.stats().runs, 1);
    }
}
