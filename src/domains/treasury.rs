//! Treasury deposits and redemption requests.

use crate::chain::abi::ITreasury;
use crate::domains::{count_kinds, decode_event, require_address};
use crate::store::{EntityKind, EntityWrite, MirrorStore};
use crate::watcher::{EventContext, EventDomain};

use alloy::primitives::{Address, B256};
use alloy::rpc::types::Log;
use alloy::sol_types::SolEvent;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub enum TreasuryEvent {
    Deposited(ITreasury::Deposited),
    RedemptionRequested(ITreasury::RedemptionRequested),
    RedemptionFulfilled(ITreasury::RedemptionFulfilled),
    RedemptionCancelled(ITreasury::RedemptionCancelled),
}

pub struct TreasuryDomain {
    store: Arc<dyn MirrorStore>,
    treasury: Option<Address>,
}

impl TreasuryDomain {
    pub fn new(store: Arc<dyn MirrorStore>, treasury: Option<Address>) -> Self {
        Self { store, treasury }
    }
}

#[async_trait]
impl EventDomain for TreasuryDomain {
    type Event = TreasuryEvent;

    fn name(&self) -> &'static str {
        "treasury"
    }

    async fn validate(&self) -> anyhow::Result<()> {
        require_address(self.treasury, "Treasury")?;
        self.store.ping().await?;
        Ok(())
    }

    fn addresses(&self) -> Vec<Address> {
        self.treasury.into_iter().collect()
    }

    fn topics(&self) -> Vec<B256> {
        vec![
            ITreasury::Deposited::SIGNATURE_HASH,
            ITreasury::RedemptionRequested::SIGNATURE_HASH,
            ITreasury::RedemptionFulfilled::SIGNATURE_HASH,
            ITreasury::RedemptionCancelled::SIGNATURE_HASH,
        ]
    }

    fn decode(&self, log: &Log) -> anyhow::Result<Option<TreasuryEvent>> {
        let Some(topic) = log.topic0() else {
            return Ok(None);
        };
        let event = if *topic == ITreasury::Deposited::SIGNATURE_HASH {
            TreasuryEvent::Deposited(decode_event(log)?)
        } else if *topic == ITreasury::RedemptionRequested::SIGNATURE_HASH {
            TreasuryEvent::RedemptionRequested(decode_event(log)?)
        } else if *topic == ITreasury::RedemptionFulfilled::SIGNATURE_HASH {
            TreasuryEvent::RedemptionFulfilled(decode_event(log)?)
        } else if *topic == ITreasury::RedemptionCancelled::SIGNATURE_HASH {
            TreasuryEvent::RedemptionCancelled(decode_event(log)?)
        } else {
            return Ok(None);
        };
        Ok(Some(event))
    }

    async fn apply(&self, event: &TreasuryEvent, ctx: &EventContext) -> anyhow::Result<&'static [&'static str]> {
        let block = ctx.block;
        let (write, counters): (EntityWrite, &'static [&'static str]) = match event {
            TreasuryEvent::Deposited(e) => {
                // Deposits have no chain id of their own; the log position is unique.
                let tx = ctx
                    .tx_hash
                    .ok_or_else(|| anyhow::anyhow!("deposit log at block {block} has no transaction hash"))?;
                let id = format!("{}:{}", tx, ctx.log_index.unwrap_or(0));
                (
                    EntityWrite::new(EntityKind::Deposit, id, block)
                        .set("account", e.account)
                        .set("assets", e.assets)
                        .set("shares", e.shares)
                        .set("deposited_at", ctx.block_time().await?),
                    &["deposits"],
                )
            }
            TreasuryEvent::RedemptionRequested(e) => (
                EntityWrite::new(EntityKind::Redemption, e.requestId.to_string(), block)
                    .set("account", e.account)
                    .set("shares", e.shares)
                    .set("status", "Pending")
                    .set("requested_at", ctx.block_time().await?),
                &["redemptions_requested"],
            ),
            TreasuryEvent::RedemptionFulfilled(e) => (
                EntityWrite::new(EntityKind::Redemption, e.requestId.to_string(), block)
                    .set("assets", e.assets)
                    .set("status", "Fulfilled")
                    .set("settled_at", ctx.block_time().await?),
                &["redemptions_fulfilled"],
            ),
            TreasuryEvent::RedemptionCancelled(e) => (
                EntityWrite::new(EntityKind::Redemption, e.requestId.to_string(), block)
                    .set("status", "Cancelled")
                    .set("settled_at", ctx.block_time().await?),
                &["redemptions_cancelled"],
            ),
        };
        self.store.upsert(&write).await?;
        Ok(counters)
    }

    async fn entity_counts(&self) -> anyhow::Result<BTreeMap<String, u64>> {
        count_kinds(self.store.as_ref(), &[EntityKind::Deposit, EntityKind::Redemption]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::{log_for, MockChain};
    use alloy::primitives::U256;

    const TREASURY: Address = Address::repeat_byte(0x0e);

    async fn feed(domain: &TreasuryDomain, log: &Log) {
        let decoded = domain.decode(log).unwrap().unwrap();
        let ctx = EventContext::new(log, MockChain::new(500));
        domain.apply(&decoded, &ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_deposits_keyed_by_log_position() {
        let store = Arc::new(MemoryStore::new());
        let domain = TreasuryDomain::new(store.clone(), Some(TREASURY));
        let deposit = ITreasury::Deposited {
            account: Address::repeat_byte(0x31),
            assets: U256::from(1_000u64),
            shares: U256::from(990u64),
        };
        let first = log_for(TREASURY, &deposit, 40, 0);
        let second = log_for(TREASURY, &deposit, 40, 1);
        feed(&domain, &first).await;
        feed(&domain, &second).await;
        // Redelivery is a no-op.
        feed(&domain, &first).await;

        assert_eq!(store.count(EntityKind::Deposit, None).await.unwrap(), 2);
        let id = format!("{}:0", first.transaction_hash.unwrap());
        let row = store.get(EntityKind::Deposit, &id).await.unwrap().unwrap();
        assert_eq!(row.get("shares"), Some("990"));
    }

    #[tokio::test]
    async fn test_redemption_reaches_terminal_status() {
        let store = Arc::new(MemoryStore::new());
        let domain = TreasuryDomain::new(store.clone(), Some(TREASURY));
        let requested = ITreasury::RedemptionRequested {
            requestId: U256::from(12u64),
            account: Address::repeat_byte(0x32),
            shares: U256::from(500u64),
        };
        let fulfilled = ITreasury::RedemptionFulfilled {
            requestId: U256::from(12u64),
            assets: U256::from(505u64),
        };
        feed(&domain, &log_for(TREASURY, &requested, 41, 0)).await;
        feed(&domain, &log_for(TREASURY, &fulfilled, 45, 0)).await;

        assert_eq!(store.count(EntityKind::Redemption, Some("Fulfilled")).await.unwrap(), 1);
        let row = store.get(EntityKind::Redemption, "12").await.unwrap().unwrap();
        assert_eq!(row.get("assets"), Some("505"));
        assert_eq!(row.get("shares"), Some("500"));
    }
}
