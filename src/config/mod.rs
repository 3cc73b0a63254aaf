use alloy::primitives::{Address, U256};
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing required env var: {0}")]
    MissingEnv(String),
    #[error("invalid value for {key}: {value}")]
    Invalid { key: String, value: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub contracts: ContractsConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub valkey: ValkeyConfig,
    #[serde(default)]
    pub watchers: WatcherConfig,
    #[serde(default)]
    pub vote_power: VotePowerConfig,
    #[serde(default)]
    pub drift: DriftConfig,
    #[serde(default)]
    pub signer: SignerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    /// WebSocket RPC endpoint shared by every watcher.
    #[serde(default)]
    pub ws_url: String,
    /// Chain id used when signing typed data.
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,
    /// Chain ids accepted when verifying typed-data signatures, tried in order.
    #[serde(default)]
    pub allowed_chain_ids: Vec<u64>,
    /// Interval of the liveness probe on an open socket, at least 1s.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Pause after a successful reconnect before subscribers are notified.
    #[serde(default = "default_stabilize_ms")]
    pub stabilize_ms: u64,
}

/// Contract addresses. A missing address soft-disables the watchers that need it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContractsConfig {
    #[serde(default)]
    pub task_market: Option<Address>,
    #[serde(default)]
    pub governor: Option<Address>,
    #[serde(default)]
    pub vote_power: Option<Address>,
    #[serde(default)]
    pub dispute_resolver: Option<Address>,
    #[serde(default)]
    pub treasury: Option<Address>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Postgres URL - loaded from env DATABASE_URL
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValkeyConfig {
    /// Empty disables persistent checkpoints (kept in memory only).
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_valkey_prefix")]
    pub prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatcherConfig {
    /// Blocks replayed at startup. 0 disables catch-up.
    #[serde(default)]
    pub startup_block_lookback: u64,
    /// Block span of each eth_getLogs request during catch-up.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// Replay from the last checkpoint after every reconnect.
    #[serde(default = "default_true")]
    pub recover_gap_on_reconnect: bool,
    /// Number of (tx, log index) pairs remembered for counter dedupe.
    #[serde(default = "default_dedupe_capacity")]
    pub dedupe_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VotePowerConfig {
    #[serde(default = "default_debounce_secs")]
    pub debounce_secs: u64,
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
    /// Minimum absolute change (in wei) before the cached power is rewritten.
    #[serde(default = "default_min_power_diff")]
    pub min_power_diff: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DriftConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_drift_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_drift_batch")]
    pub batch_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignerConfig {
    /// Hex secp256k1 key - loaded from env SIGNER_PRIVATE_KEY
    #[serde(default)]
    pub private_key: String,
    #[serde(default = "default_eip712_name")]
    pub eip712_name: String,
    #[serde(default = "default_eip712_version")]
    pub eip712_version: String,
    /// Maximum age of a client-supplied timestamp.
    #[serde(default = "default_timestamp_ttl_secs")]
    pub timestamp_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_chain_id() -> u64 {
    8453
}
const MIN_HEARTBEAT_SECS: u64 = 1;

fn default_heartbeat_secs() -> u64 {
    30
}
fn default_base_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    60_000
}
fn default_max_attempts() -> u32 {
    10
}
fn default_stabilize_ms() -> u64 {
    2_000
}
fn default_max_connections() -> u32 {
    10
}
fn default_valkey_prefix() -> String {
    "chainmirror".to_string()
}
fn default_chunk_size() -> u64 {
    10_000
}
fn default_dedupe_capacity() -> usize {
    100_000
}
fn default_debounce_secs() -> u64 {
    30
}
fn default_max_batch() -> usize {
    50
}
fn default_min_power_diff() -> String {
    "0".to_string()
}
fn default_drift_interval_secs() -> u64 {
    300
}
fn default_drift_batch() -> usize {
    100
}
fn default_eip712_name() -> String {
    "ChainMirror".to_string()
}
fn default_eip712_version() -> String {
    "1".to_string()
}
fn default_timestamp_ttl_secs() -> u64 {
    300
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            ws_url: String::new(),
            chain_id: default_chain_id(),
            allowed_chain_ids: Vec::new(),
            heartbeat_secs: default_heartbeat_secs(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
            stabilize_ms: default_stabilize_ms(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for ValkeyConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            prefix: default_valkey_prefix(),
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            startup_block_lookback: 0,
            chunk_size: default_chunk_size(),
            recover_gap_on_reconnect: true,
            dedupe_capacity: default_dedupe_capacity(),
        }
    }
}

impl Default for VotePowerConfig {
    fn default() -> Self {
        Self {
            debounce_secs: default_debounce_secs(),
            max_batch: default_max_batch(),
            min_power_diff: default_min_power_diff(),
        }
    }
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_drift_interval_secs(),
            batch_size: default_drift_batch(),
        }
    }
}

impl Default for SignerConfig {
    fn default() -> Self {
        Self {
            private_key: String::new(),
            eip712_name: default_eip712_name(),
            eip712_version: default_eip712_version(),
            timestamp_ttl_secs: default_timestamp_ttl_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl ReconnectConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn stabilize(&self) -> Duration {
        Duration::from_millis(self.stabilize_ms)
    }
}

impl VotePowerConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_secs(self.debounce_secs)
    }

    pub fn min_power_diff(&self) -> Result<U256, ConfigError> {
        U256::from_str(&self.min_power_diff).map_err(|_| ConfigError::Invalid {
            key: "vote_power.min_power_diff".to_string(),
            value: self.min_power_diff.clone(),
        })
    }
}

impl ChainConfig {
    /// Verification allow-list; falls back to the signing chain id.
    pub fn verification_chain_ids(&self) -> Vec<u64> {
        if self.allowed_chain_ids.is_empty() {
            vec![self.chain_id]
        } else {
            self.allowed_chain_ids.clone()
        }
    }
}

impl Config {
    /// Load config from a TOML file, then overlay environment variables for secrets.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.apply_env()?;
        config.normalize();
        Ok(config)
    }

    /// Load a default config with env-only settings (no file needed).
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config {
            chain: ChainConfig::default(),
            contracts: ContractsConfig::default(),
            database: DatabaseConfig::default(),
            valkey: ValkeyConfig::default(),
            watchers: WatcherConfig::default(),
            vote_power: VotePowerConfig::default(),
            drift: DriftConfig::default(),
            signer: SignerConfig::default(),
            logging: LoggingConfig::default(),
        };
        config.apply_env()?;
        config.normalize();
        Ok(config)
    }

    /// Secrets and endpoints are never required in the file.
    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(url) = std::env::var("CHAIN_WS_URL") {
            self.chain.ws_url = url;
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.database.url = url;
        }
        if let Ok(url) = std::env::var("VALKEY_URL") {
            self.valkey.url = url;
        }
        if let Ok(key) = std::env::var("SIGNER_PRIVATE_KEY") {
            self.signer.private_key = key;
        }

        let overrides = [
            ("TASK_MARKET_ADDRESS", &mut self.contracts.task_market),
            ("GOVERNOR_ADDRESS", &mut self.contracts.governor),
            ("VOTE_POWER_ADDRESS", &mut self.contracts.vote_power),
            ("DISPUTE_RESOLVER_ADDRESS", &mut self.contracts.dispute_resolver),
            ("TREASURY_ADDRESS", &mut self.contracts.treasury),
        ];
        for (var, slot) in overrides {
            if let Ok(value) = std::env::var(var) {
                if value.is_empty() {
                    continue;
                }
                let addr = Address::from_str(&value).map_err(|_| ConfigError::Invalid {
                    key: var.to_string(),
                    value: value.clone(),
                })?;
                *slot = Some(addr);
            }
        }
        Ok(())
    }

    /// Clamp intervals that would spin at zero.
    fn normalize(&mut self) {
        self.chain.heartbeat_secs = self.chain.heartbeat_secs.max(MIN_HEARTBEAT_SECS);
    }

    pub fn has_signer(&self) -> bool {
        !self.signer.private_key.is_empty()
    }

    pub fn require_database(&self) -> Result<&str, ConfigError> {
        if self.database.url.is_empty() {
            return Err(ConfigError::MissingEnv("DATABASE_URL".to_string()));
        }
        Ok(&self.database.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_minimal_toml() {
        let config: Config = toml::from_str(
            r#"
            [chain]
            ws_url = "wss://rpc.example"

            [contracts]
            task_market = "0x00000000000000000000000000000000000000aa"
            "#,
        )
        .unwrap();

        assert_eq!(config.chain.reconnect.max_attempts, 10);
        assert_eq!(config.watchers.chunk_size, 10_000);
        assert_eq!(config.watchers.startup_block_lookback, 0);
        assert_eq!(config.signer.timestamp_ttl_secs, 300);
        assert!(config.contracts.task_market.is_some());
        assert!(config.contracts.governor.is_none());
        assert_eq!(config.chain.verification_chain_ids(), vec![8453]);
    }

    #[test]
    fn test_zero_heartbeat_clamped() {
        let path = std::env::temp_dir().join(format!("chainmirror-heartbeat-{}.toml", std::process::id()));
        std::fs::write(&path, "[chain]\nheartbeat_secs = 0\n").unwrap();
        let config = Config::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.chain.heartbeat_secs, 1);
    }

    #[test]
    fn test_min_power_diff_parse() {
        let mut vp = VotePowerConfig::default();
        vp.min_power_diff = "1000000000000000000".to_string();
        assert_eq!(
            vp.min_power_diff().unwrap(),
            U256::from(1_000_000_000_000_000_000u128)
        );
        vp.min_power_diff = "lots".to_string();
        assert!(vp.min_power_diff().is_err());
    }
}
