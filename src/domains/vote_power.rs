//! Staking and reputation events, feeding the debounced vote-power refresh.
//!
//! Events only record activity; the authoritative power value is read from
//! `VotePower.votingPower` once a user's burst of events has settled.

use crate::chain::abi::IVotePower;
use crate::chain::{call_contract, ChainConnection};
use crate::domains::{count_kinds, decode_event, require_address};
use crate::queue::{BatchProcessor, DebouncedQueue, PendingEntry, ProcessOutcome};
use crate::store::{address_text, field, EntityKind, EntityWrite, MirrorStore};
use crate::watcher::{EventContext, EventDomain};

use alloy::primitives::{Address, B256, U256};
use alloy::rpc::types::Log;
use alloy::sol_types::SolEvent;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub enum VotePowerEvent {
    Staked(IVotePower::Staked),
    Unstaked(IVotePower::Unstaked),
    ReputationUpdated(IVotePower::ReputationUpdated),
}

impl VotePowerEvent {
    pub fn user(&self) -> Address {
        match self {
            VotePowerEvent::Staked(e) => e.user,
            VotePowerEvent::Unstaked(e) => e.user,
            VotePowerEvent::ReputationUpdated(e) => e.user,
        }
    }
}

/// Refreshes `stakers.cached_power` for one address.
pub struct VotePowerProcessor {
    connection: ChainConnection,
    vote_power: Address,
    store: Arc<dyn MirrorStore>,
    min_diff: U256,
}

impl VotePowerProcessor {
    pub fn new(connection: ChainConnection, vote_power: Address, store: Arc<dyn MirrorStore>, min_diff: U256) -> Self {
        Self {
            connection,
            vote_power,
            store,
            min_diff,
        }
    }
}

#[async_trait]
impl BatchProcessor for VotePowerProcessor {
    fn name(&self) -> &'static str {
        "vote_power"
    }

    async fn process(&self, entry: &PendingEntry) -> anyhow::Result<ProcessOutcome> {
        let Ok(user) = Address::from_str(&entry.key) else {
            warn!(key = %entry.key, "vote-power key is not an address");
            return Ok(ProcessOutcome::Skipped);
        };
        let client = self.connection.get().await?;
        let power = call_contract(client.as_ref(), self.vote_power, &IVotePower::votingPowerCall { user }).await?;

        let row = self.store.get(EntityKind::Staker, &entry.key).await?;
        let cached = row
            .as_ref()
            .and_then(|r| r.get("cached_power"))
            .and_then(|v| U256::from_str(v).ok());
        if let Some(cached) = cached {
            let diff = if power > cached { power - cached } else { cached - power };
            if diff <= self.min_diff {
                debug!(user = %entry.key, power = %power, "vote power within threshold");
                return Ok(ProcessOutcome::Unchanged);
            }
        }

        let now = Utc::now();
        if row.is_some() {
            let fields = [field("cached_power", power), field("power_updated_at", now)];
            self.store.update_fields(EntityKind::Staker, &entry.key, &fields).await?;
        } else {
            let write = EntityWrite::new(EntityKind::Staker, entry.key.clone(), entry.block)
                .set("cached_power", power)
                .set("power_updated_at", now);
            self.store.upsert(&write).await?;
        }
        debug!(user = %entry.key, old = ?cached, new = %power, "vote power refreshed");
        Ok(ProcessOutcome::Updated)
    }
}

pub struct VotePowerDomain {
    store: Arc<dyn MirrorStore>,
    vote_power: Option<Address>,
    queue: DebouncedQueue<VotePowerProcessor>,
}

impl VotePowerDomain {
    pub fn new(
        store: Arc<dyn MirrorStore>,
        vote_power: Option<Address>,
        queue: DebouncedQueue<VotePowerProcessor>,
    ) -> Self {
        Self {
            store,
            vote_power,
            queue,
        }
    }

    pub fn queue(&self) -> &DebouncedQueue<VotePowerProcessor> {
        &self.queue
    }
}

#[async_trait]
impl EventDomain for VotePowerDomain {
    type Event = VotePowerEvent;

    fn name(&self) -> &'static str {
        "vote_power"
    }

    async fn validate(&self) -> anyhow::Result<()> {
        require_address(self.vote_power, "VotePower")?;
        self.store.ping().await?;
        Ok(())
    }

    fn addresses(&self) -> Vec<Address> {
        self.vote_power.into_iter().collect()
    }

    fn topics(&self) -> Vec<B256> {
        vec![
            IVotePower::Staked::SIGNATURE_HASH,
            IVotePower::Unstaked::SIGNATURE_HASH,
            IVotePower::ReputationUpdated::SIGNATURE_HASH,
        ]
    }

    fn decode(&self, log: &Log) -> anyhow::Result<Option<VotePowerEvent>> {
        let event = match log.topic0() {
            Some(t) if *t == IVotePower::Staked::SIGNATURE_HASH => VotePowerEvent::Staked(decode_event(log)?),
            Some(t) if *t == IVotePower::Unstaked::SIGNATURE_HASH => VotePowerEvent::Unstaked(decode_event(log)?),
            Some(t) if *t == IVotePower::ReputationUpdated::SIGNATURE_HASH => {
                VotePowerEvent::ReputationUpdated(decode_event(log)?)
            }
            _ => return Ok(None),
        };
        Ok(Some(event))
    }

    async fn apply(&self, event: &VotePowerEvent, ctx: &EventContext) -> anyhow::Result<&'static [&'static str]> {
        let key = address_text(&event.user());
        let mut write =
            EntityWrite::new(EntityKind::Staker, key.clone(), ctx.block).set("last_activity_at", ctx.block_time().await?);
        let counters: &'static [&'static str] = match event {
            VotePowerEvent::Staked(_) => &["stakes"],
            VotePowerEvent::Unstaked(_) => &["unstakes"],
            VotePowerEvent::ReputationUpdated(e) => {
                write = write.set("reputation", e.newScore);
                &["reputation_updates"]
            }
        };
        self.store.upsert(&write).await?;
        self.queue.enqueue(key, ctx.block, ctx.tx_hash);
        Ok(counters)
    }

    async fn entity_counts(&self) -> anyhow::Result<BTreeMap<String, u64>> {
        count_kinds(self.store.as_ref(), &[EntityKind::Staker]).await
    }
}
