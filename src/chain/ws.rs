//! alloy WebSocket implementation of [`ChainClient`].

use crate::chain::{ChainClient, ChainError, Connector, LogStream};

use alloy::eips::BlockNumberOrTag;
use alloy::primitives::{Address, Bytes};
use alloy::providers::{DynProvider, Provider, ProviderBuilder, WsConnect};
use alloy::rpc::types::{Filter, Log, TransactionInput, TransactionRequest};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A connected WebSocket provider.
pub struct AlloyClient {
    provider: DynProvider,
    heartbeat: Duration,
}

impl AlloyClient {
    pub fn new(provider: DynProvider, heartbeat: Duration) -> Self {
        Self {
            provider,
            heartbeat,
        }
    }
}

#[async_trait]
impl ChainClient for AlloyClient {
    async fn block_number(&self) -> Result<u64, ChainError> {
        Ok(self.provider.get_block_number().await?)
    }

    async fn block_timestamp(&self, block: u64) -> Result<u64, ChainError> {
        let header = self
            .provider
            .get_block_by_number(BlockNumberOrTag::Number(block))
            .await?
            .ok_or(ChainError::BlockNotFound(block))?;
        Ok(header.header.timestamp)
    }

    async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>, ChainError> {
        Ok(self.provider.get_logs(filter).await?)
    }

    async fn subscribe_logs(&self, filter: &Filter) -> Result<LogStream, ChainError> {
        let sub = self.provider.subscribe_logs(filter).await?;
        Ok(sub.into_stream().boxed())
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, ChainError> {
        let tx = TransactionRequest::default()
            .to(to)
            .input(TransactionInput::new(data));
        Ok(self.provider.call(tx).await?)
    }

    /// Liveness probe: a failed or hung `eth_blockNumber` marks the socket dead.
    async fn closed(&self) {
        loop {
            tokio::time::sleep(self.heartbeat).await;
            match tokio::time::timeout(self.heartbeat, self.provider.get_block_number()).await {
                Ok(Ok(block)) => {
                    debug!(block = block, "chain heartbeat");
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "chain heartbeat failed");
                    return;
                }
                Err(_) => {
                    warn!(timeout_secs = self.heartbeat.as_secs(), "chain heartbeat timed out");
                    return;
                }
            }
        }
    }
}

/// Opens [`AlloyClient`]s over `ws://` / `wss://`.
pub struct WsConnector {
    heartbeat: Duration,
}

impl WsConnector {
    /// `heartbeat` below one second is raised to one second.
    pub fn new(heartbeat: Duration) -> Self {
        Self {
            heartbeat: heartbeat.max(Duration::from_secs(1)),
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Arc<dyn ChainClient>, ChainError> {
        let ws = WsConnect::new(url);
        let provider = ProviderBuilder::new().connect_ws(ws).await?;
        let block = provider.get_block_number().await?;
        info!(block = block, "chain WebSocket connected");
        Ok(Arc::new(AlloyClient::new(provider.erased(), self.heartbeat)))
    }
}
