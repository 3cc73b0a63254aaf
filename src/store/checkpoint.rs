//! Per-watcher block checkpoints.
//!
//! Data model (Valkey):
//!   checkpoint:{domain}   → highest fully processed block (only ever grows)
//!
//! Checkpoints drive gap recovery after a reconnect; losing them only widens
//! the replay window, because every entity write is idempotent.

use crate::store::StoreError;

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script};
use tracing::{debug, info};

/// Set the key to max(current, ARGV[1]) and return the stored value.
const ADVANCE_SCRIPT: &str = r#"
local cur = tonumber(redis.call('GET', KEYS[1]) or '0')
local new = tonumber(ARGV[1])
if new > cur then
  redis.call('SET', KEYS[1], ARGV[1])
  return new
end
return cur
"#;

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, domain: &str) -> Result<Option<u64>, StoreError>;

    /// Raise the checkpoint to `block` if higher; returns the stored value.
    async fn advance(&self, domain: &str, block: u64) -> Result<u64, StoreError>;
}

/// Valkey-backed checkpoints, namespaced under a prefix so several
/// deployments can share one instance.
#[derive(Clone)]
pub struct ValkeyCheckpoints {
    conn: MultiplexedConnection,
    prefix: String,
}

impl ValkeyCheckpoints {
    pub async fn connect(url: &str, prefix: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!(prefix = prefix, "connected to Valkey");
        Ok(Self {
            conn,
            prefix: prefix.to_string(),
        })
    }

    fn key(&self, domain: &str) -> String {
        format!("{}:checkpoint:{}", self.prefix, domain)
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        debug!(response = %pong, "Valkey ping");
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for ValkeyCheckpoints {
    async fn load(&self, domain: &str) -> Result<Option<u64>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<u64> = conn.get(self.key(domain)).await?;
        Ok(value)
    }

    async fn advance(&self, domain: &str, block: u64) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let stored: u64 = Script::new(ADVANCE_SCRIPT)
            .key(self.key(domain))
            .arg(block)
            .invoke_async(&mut conn)
            .await?;
        Ok(stored)
    }
}

/// Process-local checkpoints, used when no Valkey URL is configured.
#[derive(Default)]
pub struct MemoryCheckpoints {
    blocks: DashMap<String, u64>,
}

impl MemoryCheckpoints {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpoints {
    async fn load(&self, domain: &str) -> Result<Option<u64>, StoreError> {
        Ok(self.blocks.get(domain).map(|b| *b))
    }

    async fn advance(&self, domain: &str, block: u64) -> Result<u64, StoreError> {
        let mut entry = self.blocks.entry(domain.to_string()).or_insert(block);
        if block > *entry {
            *entry = block;
        }
        Ok(*entry)
    }
}
