use chainmirror::allocation::{AllocationEngine, ChainDelegationSource};
use chainmirror::chain::{BackoffPolicy, ChainConnection, WsConnector};
use chainmirror::clock::{Clock, SystemClock};
use chainmirror::config::Config;
use chainmirror::delegation::DelegationService;
use chainmirror::domains::{AnalyticsDomain, DisputeDomain, TreasuryDomain, VotePowerDomain, VotePowerProcessor};
use chainmirror::queue::DebouncedQueue;
use chainmirror::reconcile::{DriftReconciler, ProposalDriftSource, TaskDriftSource};
use chainmirror::service::ApprovalService;
use chainmirror::signer::ApprovalSigner;
use chainmirror::store::{CheckpointStore, MemoryCheckpoints, MirrorStore, PostgresStore, ValkeyCheckpoints};
use chainmirror::watcher::{ManagedWatcher, Watcher};

use alloy::primitives::Address;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const STATS_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // alloy's WebSocket transport needs a process-wide rustls provider.
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    // Load .env if present
    let _ = dotenvy::dotenv();

    let config_path = std::env::var("CHAINMIRROR_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("chainmirror.toml"));
    let config = if Path::new(&config_path).exists() {
        Config::load(&config_path)?
    } else {
        Config::from_env()?
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    if config.logging.json {
        tracing_subscriber::fmt().json().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    info!("chainmirror v{} starting", env!("CARGO_PKG_VERSION"));
    if !config_path.exists() {
        info!(path = %config_path.display(), "no config file found, using env-only config");
    }

    // --- Mirror store ---
    config.require_database()?;
    let store: Arc<dyn MirrorStore> = Arc::new(PostgresStore::connect(&config.database).await?);

    // --- Checkpoints ---
    let checkpoints: Arc<dyn CheckpointStore> = if config.valkey.url.is_empty() {
        warn!("no VALKEY_URL configured, checkpoints kept in memory");
        Arc::new(MemoryCheckpoints::new())
    } else {
        match ValkeyCheckpoints::connect(&config.valkey.url, &config.valkey.prefix).await {
            Ok(v) => match v.ping().await {
                Ok(()) => Arc::new(v),
                Err(e) => {
                    error!(error = %e, "Valkey ping failed, checkpoints kept in memory");
                    Arc::new(MemoryCheckpoints::new())
                }
            },
            Err(e) => {
                warn!(error = %e, "failed to connect to Valkey, checkpoints kept in memory");
                Arc::new(MemoryCheckpoints::new())
            }
        }
    };

    // --- Chain connection ---
    if config.chain.ws_url.is_empty() {
        anyhow::bail!("CHAIN_WS_URL is not configured");
    }
    let connection = ChainConnection::new(
        config.chain.ws_url.clone(),
        Arc::new(WsConnector::new(Duration::from_secs(config.chain.heartbeat_secs))),
        BackoffPolicy::from_config(&config.chain.reconnect),
    );

    // --- Approvals ---
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let signer = Arc::new(ApprovalSigner::from_config(&config.signer, &config.chain, clock.clone())?);
    if signer.address().is_none() {
        warn!("no SIGNER_PRIVATE_KEY configured, approvals disabled (verification still works)");
    }
    let contracts = &config.contracts;
    let vote_power_address = contracts.vote_power.unwrap_or(Address::ZERO);
    let approvals = ApprovalService::new(
        AllocationEngine::new(Arc::new(ChainDelegationSource::new(connection.clone(), vote_power_address))),
        signer.clone(),
        DelegationService::new(store.clone(), signer.clone(), clock.clone()),
    );
    info!(
        signer = ?approvals.signer().address(),
        chain_id = config.chain.chain_id,
        verify_chain_ids = ?config.chain.verification_chain_ids(),
        "approval service ready"
    );

    // --- Watchers ---
    let vote_power_queue = DebouncedQueue::from_config(
        VotePowerProcessor::new(
            connection.clone(),
            vote_power_address,
            store.clone(),
            config.vote_power.min_power_diff()?,
        ),
        &config.vote_power,
    );
    let watchers: Vec<Arc<dyn ManagedWatcher>> = vec![
        Arc::new(Watcher::new(
            AnalyticsDomain::new(store.clone(), contracts.task_market, contracts.governor),
            connection.clone(),
            checkpoints.clone(),
            config.watchers.clone(),
        )),
        Arc::new(Watcher::new(
            DisputeDomain::new(store.clone(), contracts.dispute_resolver),
            connection.clone(),
            checkpoints.clone(),
            config.watchers.clone(),
        )),
        Arc::new(Watcher::new(
            VotePowerDomain::new(store.clone(), contracts.vote_power, vote_power_queue.clone()),
            connection.clone(),
            checkpoints.clone(),
            config.watchers.clone(),
        )),
        Arc::new(Watcher::new(
            TreasuryDomain::new(store.clone(), contracts.treasury),
            connection.clone(),
            checkpoints.clone(),
            config.watchers.clone(),
        )),
    ];
    for watcher in &watchers {
        if let Err(e) = watcher.start().await {
            error!(watcher = watcher.name(), error = %e, "watcher failed to start");
        }
    }

    let shutdown = CancellationToken::new();

    // --- Drift reconciler ---
    if config.drift.enabled {
        let mut reconciler = DriftReconciler::new(connection.clone(), store.clone(), config.drift.batch_size);
        if let Some(addr) = contracts.task_market {
            reconciler = reconciler.with_source(TaskDriftSource::new(addr));
        }
        if let Some(addr) = contracts.governor {
            reconciler = reconciler.with_source(ProposalDriftSource::new(addr));
        }
        let interval = Duration::from_secs(config.drift.interval_secs.max(1));
        let cancel = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; give catch-up a head start.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = reconciler.run_once().await {
                            warn!(error = %e, "drift pass failed");
                        }
                    }
                }
            }
        });
        info!(interval_secs = interval.as_secs(), "drift reconciler scheduled");
    }

    // --- Periodic status ---
    let mut stats_ticker = tokio::time::interval(STATS_INTERVAL);
    stats_ticker.tick().await;
    loop {
        tokio::select! {
            _ = stats_ticker.tick() => {
                for watcher in &watchers {
                    let stats = watcher.stats();
                    info!(
                        watcher = stats.name,
                        status = ?stats.status,
                        last_block = stats.last_block,
                        events = stats.events_processed,
                        errors = stats.errors,
                        last_error = ?stats.last_error,
                        "watcher status"
                    );
                }
                let q = vote_power_queue.stats();
                info!(
                    pending = q.pending,
                    runs = q.runs,
                    updated = q.updated,
                    unchanged = q.unchanged,
                    errors = q.errors,
                    "vote-power queue"
                );
                let conn = connection.snapshot().await;
                info!(connection = ?conn, "chain connection");
            }

            _ = tokio::signal::ctrl_c() => {
                info!("shutting down...");
                break;
            }
        }
    }

    shutdown.cancel();
    for watcher in &watchers {
        watcher.stop().await;
    }
    vote_power_queue.force_flush().await;
    connection.shutdown().await;
    info!("shutdown complete");
    Ok(())
}
