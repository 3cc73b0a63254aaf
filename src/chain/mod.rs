//! Chain access for the mirror and the approval signer.
//!
//! Architecture:
//! - [`ChainClient`]: the read surface every component needs (block height,
//!   historical logs, live log subscription, `eth_call`), implemented over an
//!   alloy WebSocket provider in [`ws`]
//! - [`Connector`]: opens a fresh client; the connection manager calls it on
//!   startup and on every reconnect
//! - [`ChainConnection`]: owns the single shared client, reconnects with
//!   capped exponential backoff and broadcasts [`Reconnected`] so watchers can
//!   re-arm their subscriptions
//! - [`abi`]: `sol!` bindings for the protocol contracts

pub mod abi;
pub mod connection;
pub mod ws;

pub use connection::{BackoffPolicy, ChainConnection, ConnectionSnapshot, ConnectionState, Reconnected};
pub use ws::{AlloyClient, WsConnector};

use alloy::primitives::{Address, Bytes};
use alloy::rpc::types::{Filter, Log};
use alloy::sol_types::SolCall;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("rpc transport error: {0}")]
    Transport(#[from] alloy::transports::TransportError),
    #[error("abi decode error: {0}")]
    Abi(#[from] alloy::sol_types::Error),
    #[error("no chain connection available")]
    NotConnected,
    #[error("chain connection gave up after {attempts} attempts")]
    GaveUp { attempts: u32 },
    #[error("block {0} not found")]
    BlockNotFound(u64),
    #[error("{0}")]
    Other(String),
}

/// Live log stream. Ends when the underlying socket goes away.
pub type LogStream = BoxStream<'static, Log>;

/// Read-only chain access shared by watchers, processors and the allocation engine.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn block_number(&self) -> Result<u64, ChainError>;

    /// Unix timestamp (seconds) of `block`.
    async fn block_timestamp(&self, block: u64) -> Result<u64, ChainError>;

    async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>, ChainError>;

    async fn subscribe_logs(&self, filter: &Filter) -> Result<LogStream, ChainError>;

    /// Raw `eth_call` against `to` with ABI-encoded `data`.
    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, ChainError>;

    /// Resolves once the transport is known to be dead.
    async fn closed(&self);
}

/// Opens new [`ChainClient`]s against an endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Arc<dyn ChainClient>, ChainError>;
}

/// Typed `eth_call` through any [`ChainClient`].
pub async fn call_contract<C: SolCall + Send + Sync>(
    client: &dyn ChainClient,
    to: Address,
    call: &C,
) -> Result<C::Return, ChainError> {
    let output = client.call(to, Bytes::from(call.abi_encode())).await?;
    Ok(C::abi_decode_returns(&output)?)
}
