//! The single shared chain connection.
//!
//! One subscription-capable client is shared by every watcher. When the
//! socket dies (a watcher's log stream ends, or the client's own liveness
//! probe fails) the handle is discarded and a reconnect loop runs with
//! exponential backoff, capped in both delay and attempt count. Exhausting
//! the attempts is fatal for this connection until the process restarts.
//!
//! Subscriptions do not survive a socket replacement, so every successful
//! reconnect is published on a broadcast channel; each watcher holds its own
//! receiver and re-arms independently, which keeps one watcher's failure from
//! blocking the others.

use crate::chain::{ChainClient, ChainError, Connector};
use crate::config::ReconnectConfig;

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const RECONNECT_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Published after every successful reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconnected {
    pub generation: u64,
}

/// Reconnect schedule: `min(base * 2^(attempt-1), max)`, at most `max_attempts` tries.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub max_attempts: u32,
    /// Pause between a successful reconnect and notifying subscribers.
    pub stabilize: Duration,
}

impl BackoffPolicy {
    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self {
            base: config.base_delay(),
            max: config.max_delay(),
            max_attempts: config.max_attempts,
            stabilize: config.stabilize(),
        }
    }

    /// Delay before the 1-based `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

/// Point-in-time view of the connection for stats endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub gave_up: bool,
    pub generation: u64,
}

struct Slot {
    state: ConnectionState,
    client: Option<Arc<dyn ChainClient>>,
    attempts: u32,
    last_error: Option<String>,
    gave_up: bool,
    reconnecting: bool,
    /// Bumped every time a new client is installed.
    generation: u64,
}

struct Inner {
    url: String,
    connector: Arc<dyn Connector>,
    policy: BackoffPolicy,
    slot: Mutex<Slot>,
    connecting: Mutex<()>,
    reconnect_tx: broadcast::Sender<Reconnected>,
    shutdown: CancellationToken,
}

/// Shared handle to the chain connection. Cheap to clone.
#[derive(Clone)]
pub struct ChainConnection {
    inner: Arc<Inner>,
}

impl ChainConnection {
    pub fn new(url: impl Into<String>, connector: Arc<dyn Connector>, policy: BackoffPolicy) -> Self {
        let (reconnect_tx, _) = broadcast::channel(RECONNECT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                url: url.into(),
                connector,
                policy,
                slot: Mutex::new(Slot {
                    state: ConnectionState::Disconnected,
                    client: None,
                    attempts: 0,
                    last_error: None,
                    gave_up: false,
                    reconnecting: false,
                    generation: 0,
                }),
                connecting: Mutex::new(()),
                reconnect_tx,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Return the live client, connecting lazily if there is none.
    ///
    /// A failed lazy connect hands over to the background reconnect loop, so
    /// callers that subscribed to reconnects get notified once it recovers.
    pub async fn get(&self) -> Result<Arc<dyn ChainClient>, ChainError> {
        self.get_with_generation().await.map(|(client, _)| client)
    }

    /// Like [`get`](Self::get), also returning the client's generation for
    /// a later [`report_closed`](Self::report_closed).
    pub async fn get_with_generation(&self) -> Result<(Arc<dyn ChainClient>, u64), ChainError> {
        if let Some(ready) = self.ready_or_refused().await {
            return ready;
        }

        // Serializes lazy connects without holding the slot across the RPC.
        let _connecting = self.inner.connecting.lock().await;
        {
            let mut slot = self.inner.slot.lock().await;
            if let Some(ready) = self.check_slot(&slot) {
                return ready;
            }
            slot.state = ConnectionState::Connecting;
        }

        let connected = self.inner.connector.connect(&self.inner.url).await;

        let mut slot = self.inner.slot.lock().await;
        if self.inner.shutdown.is_cancelled() {
            slot.state = ConnectionState::Disconnected;
            return Err(ChainError::NotConnected);
        }
        match connected {
            Ok(client) => {
                let generation = Self::install(&mut slot, client.clone());
                drop(slot);
                self.spawn_close_watch(client.clone(), generation);
                Ok((client, generation))
            }
            Err(e) => {
                warn!(error = %e, "initial chain connection failed");
                slot.state = ConnectionState::Disconnected;
                slot.last_error = Some(e.to_string());
                slot.reconnecting = true;
                drop(slot);
                self.spawn_reconnect();
                Err(e)
            }
        }
    }

    async fn ready_or_refused(&self) -> Option<Result<(Arc<dyn ChainClient>, u64), ChainError>> {
        let slot = self.inner.slot.lock().await;
        self.check_slot(&slot)
    }

    /// The installed client, or the reason no connect should be attempted.
    /// `None` means the caller may connect.
    fn check_slot(&self, slot: &Slot) -> Option<Result<(Arc<dyn ChainClient>, u64), ChainError>> {
        if let Some(client) = &slot.client {
            return Some(Ok((client.clone(), slot.generation)));
        }
        if slot.gave_up {
            return Some(Err(ChainError::GaveUp {
                attempts: slot.attempts,
            }));
        }
        if slot.reconnecting || self.inner.shutdown.is_cancelled() {
            return Some(Err(ChainError::NotConnected));
        }
        None
    }

    /// Generation of the currently installed client (0 before the first connect).
    pub async fn generation(&self) -> u64 {
        self.inner.slot.lock().await.generation
    }

    /// Register for reconnect notifications. Dropping the receiver unregisters.
    pub fn subscribe_reconnects(&self) -> broadcast::Receiver<Reconnected> {
        self.inner.reconnect_tx.subscribe()
    }

    /// Report that the client of `generation` is dead.
    ///
    /// Reports about an already replaced client are ignored, so several
    /// watchers noticing the same close schedule one reconnect.
    pub async fn report_closed(&self, generation: u64, reason: &str) {
        let mut slot = self.inner.slot.lock().await;
        if slot.generation != generation || slot.client.is_none() {
            return;
        }
        slot.client = None;
        slot.state = ConnectionState::Disconnected;
        slot.last_error = Some(reason.to_string());
        if slot.reconnecting || slot.gave_up || self.inner.shutdown.is_cancelled() {
            return;
        }
        slot.reconnecting = true;
        drop(slot);

        warn!(generation = generation, reason = reason, "chain connection closed, scheduling reconnect");
        self.spawn_reconnect();
    }

    pub async fn snapshot(&self) -> ConnectionSnapshot {
        let slot = self.inner.slot.lock().await;
        ConnectionSnapshot {
            state: slot.state,
            attempts: slot.attempts,
            last_error: slot.last_error.clone(),
            gave_up: slot.gave_up,
            generation: slot.generation,
        }
    }

    /// Drop the client and stop all reconnect activity.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let mut slot = self.inner.slot.lock().await;
        slot.client = None;
        slot.state = ConnectionState::Disconnected;
        info!("chain connection shut down");
    }

    fn install(slot: &mut Slot, client: Arc<dyn ChainClient>) -> u64 {
        slot.client = Some(client);
        slot.state = ConnectionState::Connected;
        slot.attempts = 0;
        slot.reconnecting = false;
        slot.generation += 1;
        slot.generation
    }

    fn spawn_close_watch(&self, client: Arc<dyn ChainClient>, generation: u64) {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = this.inner.shutdown.cancelled() => {}
                _ = client.closed() => {
                    this.report_closed(generation, "liveness probe failed").await;
                }
            }
        });
    }

    fn spawn_reconnect(&self) {
        let this = self.clone();
        tokio::spawn(async move {
            this.reconnect_loop().await;
        });
    }

    async fn reconnect_loop(&self) {
        let policy = &self.inner.policy;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            if attempt > policy.max_attempts {
                let mut slot = self.inner.slot.lock().await;
                slot.gave_up = true;
                slot.reconnecting = false;
                slot.state = ConnectionState::Disconnected;
                error!(
                    attempts = policy.max_attempts,
                    last_error = ?slot.last_error,
                    "chain reconnect attempts exhausted, giving up until restart"
                );
                return;
            }

            let delay = policy.delay(attempt);
            {
                let mut slot = self.inner.slot.lock().await;
                slot.attempts = attempt;
            }
            info!(
                attempt = attempt,
                max_attempts = policy.max_attempts,
                backoff_ms = delay.as_millis() as u64,
                "reconnecting to chain WebSocket"
            );

            tokio::select! {
                _ = self.inner.shutdown.cancelled() => {
                    self.inner.slot.lock().await.reconnecting = false;
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            self.inner.slot.lock().await.state = ConnectionState::Connecting;
            match self.inner.connector.connect(&self.inner.url).await {
                Ok(client) => {
                    let generation = {
                        let mut slot = self.inner.slot.lock().await;
                        Self::install(&mut slot, client.clone())
                    };
                    self.spawn_close_watch(client, generation);

                    tokio::select! {
                        _ = self.inner.shutdown.cancelled() => return,
                        _ = tokio::time::sleep(policy.stabilize) => {}
                    }

                    let subscribers = self
                        .inner
                        .reconnect_tx
                        .send(Reconnected { generation })
                        .unwrap_or(0);
                    info!(
                        generation = generation,
                        attempt = attempt,
                        subscribers = subscribers,
                        "chain reconnected, notifying subscribers"
                    );
                    return;
                }
                Err(e) => {
                    warn!(attempt = attempt, error = %e, "chain reconnect failed");
                    let mut slot = self.inner.slot.lock().await;
                    slot.state = ConnectionState::Disconnected;
                    slot.last_error = Some(e.to_string());
                }
            }
        }
    }
}
