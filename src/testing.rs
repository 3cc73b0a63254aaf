//! In-process chain doubles for unit tests.

use crate::chain::{ChainClient, ChainError, Connector, LogStream};

use alloy::primitives::{keccak256, Address, Bytes, B256};
use alloy::rpc::types::{Filter, Log};
use alloy::sol_types::{SolCall, SolEvent};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

pub const GENESIS_TIMESTAMP: u64 = 1_700_000_000;

/// Scripted chain: a block height, a log history, live subscribers and canned `eth_call`s.
pub struct MockChain {
    block: AtomicU64,
    history: Mutex<Vec<Log>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Log>>>,
    calls: Mutex<HashMap<(Address, Bytes), Bytes>>,
    get_logs_calls: AtomicU32,
    subscriptions: AtomicU32,
    failing_ranges: Mutex<Vec<u64>>,
}

impl MockChain {
    pub fn new(block: u64) -> Arc<Self> {
        Arc::new(Self {
            block: AtomicU64::new(block),
            history: Mutex::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
            calls: Mutex::new(HashMap::new()),
            get_logs_calls: AtomicU32::new(0),
            subscriptions: AtomicU32::new(0),
            failing_ranges: Mutex::new(Vec::new()),
        })
    }

    pub fn set_block(&self, block: u64) {
        self.block.store(block, Ordering::SeqCst);
    }

    /// Add a log to the history returned by `get_logs`.
    pub fn push_history(&self, log: Log) {
        self.history.lock().unwrap().push(log);
    }

    /// Deliver a log to every live subscription.
    pub fn emit(&self, log: Log) {
        let subs = self.subscribers.lock().unwrap();
        for tx in subs.iter() {
            let _ = tx.send(log.clone());
        }
    }

    /// End every live stream, as a dropped socket would.
    pub fn close_streams(&self) {
        self.subscribers.lock().unwrap().clear();
    }

    pub fn set_call<C: SolCall>(&self, to: Address, call: &C, ret: &C::Return) {
        let data = Bytes::from(call.abi_encode());
        let out = Bytes::from(C::abi_encode_returns(ret));
        self.calls.lock().unwrap().insert((to, data), out);
    }

    /// Make `get_logs` time out for any range starting at `from_block`.
    pub fn fail_get_logs_from(&self, from_block: u64) {
        self.failing_ranges.lock().unwrap().push(from_block);
    }

    pub fn heal_get_logs(&self) {
        self.failing_ranges.lock().unwrap().clear();
    }

    pub fn get_logs_calls(&self) -> u32 {
        self.get_logs_calls.load(Ordering::SeqCst)
    }

    pub fn subscriptions(&self) -> u32 {
        self.subscriptions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn block_number(&self) -> Result<u64, ChainError> {
        Ok(self.block.load(Ordering::SeqCst))
    }

    async fn block_timestamp(&self, block: u64) -> Result<u64, ChainError> {
        Ok(GENESIS_TIMESTAMP + block * 2)
    }

    async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>, ChainError> {
        self.get_logs_calls.fetch_add(1, Ordering::SeqCst);
        let from = filter.get_from_block().unwrap_or(0);
        let to = filter.get_to_block().unwrap_or(u64::MAX);
        if self.failing_ranges.lock().unwrap().contains(&from) {
            return Err(ChainError::Other("rpc timeout".to_string()));
        }
        let history = self.history.lock().unwrap();
        Ok(history
            .iter()
            .filter(|log| {
                let block = log.block_number.unwrap_or(0);
                let topic_ok = log
                    .topic0()
                    .map(|t| filter.topics[0].matches(t))
                    .unwrap_or(false);
                block >= from && block <= to && topic_ok && filter.address.matches(&log.address())
            })
            .cloned()
            .collect())
    }

    async fn subscribe_logs(&self, _filter: &Filter) -> Result<LogStream, ChainError> {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|log| (log, rx))
        });
        Ok(stream.boxed())
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, ChainError> {
        self.calls
            .lock()
            .unwrap()
            .get(&(to, data))
            .cloned()
            .ok_or_else(|| ChainError::Other("no mock response for call".to_string()))
    }

    async fn closed(&self) {
        std::future::pending::<()>().await
    }
}

/// Hands out the same [`MockChain`], optionally failing the first `n` connects.
pub struct MockConnector {
    chain: Arc<MockChain>,
    remaining_failures: AtomicU32,
    connects: AtomicU32,
}

impl MockConnector {
    pub fn new(chain: Arc<MockChain>) -> Self {
        Self::failing(chain, 0)
    }

    pub fn failing(chain: Arc<MockChain>, failures: u32) -> Self {
        Self {
            chain,
            remaining_failures: AtomicU32::new(failures),
            connects: AtomicU32::new(0),
        }
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _url: &str) -> Result<Arc<dyn ChainClient>, ChainError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ChainError::Other("connection refused".to_string()));
        }
        Ok(self.chain.clone())
    }
}

/// Build an RPC log for `event` emitted by `address`.
pub fn log_for<E: SolEvent>(address: Address, event: &E, block: u64, log_index: u64) -> Log {
    Log {
        inner: alloy::primitives::Log {
            address,
            data: event.encode_log_data(),
        },
        block_hash: Some(B256::ZERO),
        block_number: Some(block),
        block_timestamp: Some(GENESIS_TIMESTAMP + block * 2),
        transaction_hash: Some(keccak256(format!("tx:{block}:{log_index}"))),
        transaction_index: Some(0),
        log_index: Some(log_index),
        removed: false,
    }
}

/// Poll `cond` every 10ms until it holds, panicking after two seconds.
pub async fn eventually<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// A [`ChainConnection`] over `chain` with near-zero backoff.
pub fn connection_to(chain: Arc<MockChain>) -> crate::chain::ChainConnection {
    let connector: Arc<dyn Connector> = Arc::new(MockConnector::new(chain));
    let policy = crate::chain::BackoffPolicy {
        base: std::time::Duration::from_millis(1),
        max: std::time::Duration::from_millis(1),
        max_attempts: 1,
        stabilize: std::time::Duration::ZERO,
    };
    crate::chain::ChainConnection::new("ws://mock", connector, policy)
}
