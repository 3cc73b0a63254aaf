//! Task and governance mirror.

use crate::chain::abi::{IGovernor, ITaskMarket};
use crate::domains::{count_kinds, decode_event, require_address};
use crate::store::{pair_id, EntityKind, EntityWrite, MirrorStore};
use crate::watcher::{EventContext, EventDomain};

use alloy::primitives::{Address, B256};
use alloy::rpc::types::Log;
use alloy::sol_types::SolEvent;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub enum AnalyticsEvent {
    TaskCreated(ITaskMarket::TaskCreated),
    TaskAssigned(ITaskMarket::TaskAssigned),
    TaskSubmitted(ITaskMarket::TaskSubmitted),
    TaskCompleted(ITaskMarket::TaskCompleted),
    TaskCancelled(ITaskMarket::TaskCancelled),
    ProposalCreated(IGovernor::ProposalCreated),
    VoteCast(IGovernor::VoteCast),
    DelegatedVoteCast(IGovernor::DelegatedVoteCast),
    ProposalExecuted(IGovernor::ProposalExecuted),
    ProposalCancelled(IGovernor::ProposalCancelled),
}

pub struct AnalyticsDomain {
    store: Arc<dyn MirrorStore>,
    task_market: Option<Address>,
    governor: Option<Address>,
}

impl AnalyticsDomain {
    pub fn new(store: Arc<dyn MirrorStore>, task_market: Option<Address>, governor: Option<Address>) -> Self {
        Self {
            store,
            task_market,
            governor,
        }
    }

    fn task(id: impl ToString, block: u64) -> EntityWrite {
        EntityWrite::new(EntityKind::Task, id.to_string(), block)
    }

    fn proposal(id: impl ToString, block: u64) -> EntityWrite {
        EntityWrite::new(EntityKind::Proposal, id.to_string(), block)
    }
}

#[async_trait]
impl EventDomain for AnalyticsDomain {
    type Event = AnalyticsEvent;

    fn name(&self) -> &'static str {
        "analytics"
    }

    async fn validate(&self) -> anyhow::Result<()> {
        require_address(self.task_market, "TaskMarket")?;
        require_address(self.governor, "Governor")?;
        self.store.ping().await?;
        Ok(())
    }

    fn addresses(&self) -> Vec<Address> {
        [self.task_market, self.governor].into_iter().flatten().collect()
    }

    fn topics(&self) -> Vec<B256> {
        vec![
            ITaskMarket::TaskCreated::SIGNATURE_HASH,
            ITaskMarket::TaskAssigned::SIGNATURE_HASH,
            ITaskMarket::TaskSubmitted::SIGNATURE_HASH,
            ITaskMarket::TaskCompleted::SIGNATURE_HASH,
            ITaskMarket::TaskCancelled::SIGNATURE_HASH,
            IGovernor::ProposalCreated::SIGNATURE_HASH,
            IGovernor::VoteCast::SIGNATURE_HASH,
            IGovernor::DelegatedVoteCast::SIGNATURE_HASH,
            IGovernor::ProposalExecuted::SIGNATURE_HASH,
            IGovernor::ProposalCancelled::SIGNATURE_HASH,
        ]
    }

    fn decode(&self, log: &Log) -> anyhow::Result<Option<AnalyticsEvent>> {
        let Some(topic) = log.topic0().copied() else {
            return Ok(None);
        };
        let event = match topic {
            t if t == ITaskMarket::TaskCreated::SIGNATURE_HASH => AnalyticsEvent::TaskCreated(decode_event(log)?),
            t if t == ITaskMarket::TaskAssigned::SIGNATURE_HASH => AnalyticsEvent::TaskAssigned(decode_event(log)?),
            t if t == ITaskMarket::TaskSubmitted::SIGNATURE_HASH => AnalyticsEvent::TaskSubmitted(decode_event(log)?),
            t if t == ITaskMarket::TaskCompleted::SIGNATURE_HASH => AnalyticsEvent::TaskCompleted(decode_event(log)?),
            t if t == ITaskMarket::TaskCancelled::SIGNATURE_HASH => AnalyticsEvent::TaskCancelled(decode_event(log)?),
            t if t == IGovernor::ProposalCreated::SIGNATURE_HASH => AnalyticsEvent::ProposalCreated(decode_event(log)?),
            t if t == IGovernor::VoteCast::SIGNATURE_HASH => AnalyticsEvent::VoteCast(decode_event(log)?),
            t if t == IGovernor::DelegatedVoteCast::SIGNATURE_HASH => {
                AnalyticsEvent::DelegatedVoteCast(decode_event(log)?)
            }
            t if t == IGovernor::ProposalExecuted::SIGNATURE_HASH => {
                AnalyticsEvent::ProposalExecuted(decode_event(log)?)
            }
            t if t == IGovernor::ProposalCancelled::SIGNATURE_HASH => {
                AnalyticsEvent::ProposalCancelled(decode_event(log)?)
            }
            _ => return Ok(None),
        };
        Ok(Some(event))
    }

    async fn apply(&self, event: &AnalyticsEvent, ctx: &EventContext) -> anyhow::Result<&'static [&'static str]> {
        let block = ctx.block;
        let (write, counters): (EntityWrite, &'static [&'static str]) = match event {
            AnalyticsEvent::TaskCreated(e) => (
                Self::task(e.taskId, block)
                    .set("creator", e.creator)
                    .set("reward", e.reward)
                    .set("deadline", e.deadline)
                    .set("status", "Open")
                    .set("created_at", ctx.block_time().await?),
                &["tasks_created"],
            ),
            AnalyticsEvent::TaskAssigned(e) => (
                Self::task(e.taskId, block)
                    .set("worker", e.worker)
                    .set("status", "Assigned"),
                &["tasks_assigned"],
            ),
            AnalyticsEvent::TaskSubmitted(e) => (
                Self::task(e.taskId, block)
                    .set("worker", e.worker)
                    .set("status", "Submitted"),
                &["tasks_submitted"],
            ),
            AnalyticsEvent::TaskCompleted(e) => (
                Self::task(e.taskId, block)
                    .set("worker", e.worker)
                    .set("payout", e.payout)
                    .set("status", "Completed")
                    .set("completed_at", ctx.block_time().await?),
                &["tasks_completed"],
            ),
            AnalyticsEvent::TaskCancelled(e) => (
                Self::task(e.taskId, block).set("status", "Cancelled"),
                &["tasks_cancelled"],
            ),
            AnalyticsEvent::ProposalCreated(e) => {
                let created = ctx.block_time().await?;
                let status = if (created.timestamp() as u64) < e.startTime {
                    "Pending"
                } else {
                    "Active"
                };
                (
                    Self::proposal(e.proposalId, block)
                        .set("proposer", e.proposer)
                        .set("start_time", e.startTime)
                        .set("end_time", e.endTime)
                        .set("status", status)
                        .set("created_at", created),
                    &["proposals_created"],
                )
            }
            AnalyticsEvent::VoteCast(e) => (
                EntityWrite::new(EntityKind::Vote, pair_id(e.proposalId, &e.voter), block)
                    .set("proposal_id", e.proposalId)
                    .set("voter", e.voter)
                    .set("support", e.support as u64)
                    .set("weight", e.weight)
                    .set("delegated", false)
                    .set("cast_at", ctx.block_time().await?),
                &["votes_cast"],
            ),
            AnalyticsEvent::DelegatedVoteCast(e) => (
                EntityWrite::new(EntityKind::Vote, pair_id(e.proposalId, &e.delegate), block)
                    .set("proposal_id", e.proposalId)
                    .set("voter", e.delegate)
                    .set("support", e.support as u64)
                    .set("weight", e.amount)
                    .set("delegated", true)
                    .set("allocations_hash", e.allocationsHash)
                    .set("cast_at", ctx.block_time().await?),
                &["votes_cast", "delegated_votes_cast"],
            ),
            AnalyticsEvent::ProposalExecuted(e) => (
                Self::proposal(e.proposalId, block).set("status", "Executed"),
                &["proposals_executed"],
            ),
            AnalyticsEvent::ProposalCancelled(e) => (
                Self::proposal(e.proposalId, block).set("status", "Cancelled"),
                &["proposals_cancelled"],
            ),
        };
        self.store.upsert(&write).await?;
        Ok(counters)
    }

    async fn entity_counts(&self) -> anyhow::Result<BTreeMap<String, u64>> {
        count_kinds(
            self.store.as_ref(),
            &[EntityKind::Task, EntityKind::Proposal, EntityKind::Vote],
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{address_text, MemoryStore};
    use crate::testing::{log_for, MockChain, GENESIS_TIMESTAMP};
    use alloy::primitives::U256;

    const MARKET: Address = Address::repeat_byte(0x0a);
    const GOVERNOR: Address = Address::repeat_byte(0x0b);

    fn domain() -> (AnalyticsDomain, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (AnalyticsDomain::new(store.clone(), Some(MARKET), Some(GOVERNOR)), store)
    }

    async fn feed(domain: &AnalyticsDomain, log: Log) {
        let chain = MockChain::new(1_000);
        let event = domain.decode(&log).unwrap().unwrap();
        let ctx = EventContext::new(&log, chain);
        domain.apply(&event, &ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_task_lifecycle_out_of_order() {
        let (domain, store) = domain();
        let worker = Address::repeat_byte(0x33);
        let completed = ITaskMarket::TaskCompleted {
            taskId: U256::from(5u64),
            worker,
            payout: U256::from(90u64),
        };
        let created = ITaskMarket::TaskCreated {
            taskId: U256::from(5u64),
            creator: Address::repeat_byte(0x22),
            reward: U256::from(100u64),
            deadline: 1_800_000_000,
        };

        // Completion arrives live before catch-up replays creation.
        feed(&domain, log_for(MARKET, &completed, 20, 0)).await;
        feed(&domain, log_for(MARKET, &created, 10, 0)).await;

        let row = store.get(EntityKind::Task, "5").await.unwrap().unwrap();
        assert_eq!(row.get("status"), Some("Completed"));
        assert_eq!(row.get("payout"), Some("90"));
        assert_eq!(row.last_event_block, 20);
        assert_eq!(row.get("completed_at"), Some((GENESIS_TIMESTAMP + 40).to_string().as_str()));
        assert_eq!(row.get("reward"), Some("100"));
        assert_eq!(row.get("creator"), Some(address_text(&Address::repeat_byte(0x22)).as_str()));

        // Same final state as in-order delivery.
        let (ordered, ordered_store) = self::domain();
        feed(&ordered, log_for(MARKET, &created, 10, 0)).await;
        feed(&ordered, log_for(MARKET, &completed, 20, 0)).await;
        let expected = ordered_store.get(EntityKind::Task, "5").await.unwrap().unwrap();
        assert_eq!(row, expected);
    }

    #[tokio::test]
    async fn test_delegated_vote_recorded() {
        let (domain, store) = domain();
        let delegate = Address::repeat_byte(0x44);
        let event = IGovernor::DelegatedVoteCast {
            proposalId: U256::from(2u64),
            delegate,
            support: 1,
            amount: U256::from(250u64),
            allocationsHash: B256::repeat_byte(0xab),
        };
        let log = log_for(GOVERNOR, &event, 30, 1);
        let decoded = domain.decode(&log).unwrap().unwrap();
        let ctx = EventContext::new(&log, MockChain::new(30));
        let counters = domain.apply(&decoded, &ctx).await.unwrap();
        assert_eq!(counters, &["votes_cast", "delegated_votes_cast"]);

        let row = store.get(EntityKind::Vote, &pair_id(2, &delegate)).await.unwrap().unwrap();
        assert_eq!(row.get("delegated"), Some("true"));
        assert_eq!(row.get("weight"), Some("250"));
        assert_eq!(row.get("allocations_hash"), Some(B256::repeat_byte(0xab).to_string().as_str()));
    }

    #[tokio::test]
    async fn test_validate_requires_addresses() {
        let store = Arc::new(MemoryStore::new());
        let missing = AnalyticsDomain::new(store, Some(MARKET), None);
        let err = missing.validate().await.unwrap_err();
        assert!(err.to_string().contains("Governor"));
    }

    #[test]
    fn test_unknown_topic_ignored() {
        let (domain, _) = domain();
        let other = crate::chain::abi::ITreasury::RedemptionCancelled {
            requestId: U256::from(1u64),
        };
        assert!(domain.decode(&log_for(MARKET, &other, 1, 0)).unwrap().is_none());
    }
}
