//! Dispute resolution mirror.

use crate::chain::abi::IDisputeResolver;
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
pub enum DisputeEvent {
    Opened(IDisputeResolver::DisputeOpened),
    Voted(IDisputeResolver::DisputeVoted),
    Resolved(IDisputeResolver::DisputeResolved),
}

pub struct DisputeDomain {
    store: Arc<dyn MirrorStore>,
    resolver: Option<Address>,
}

impl DisputeDomain {
    pub fn new(store: Arc<dyn MirrorStore>, resolver: Option<Address>) -> Self {
        Self { store, resolver }
    }

    /// Moves the disputed task to the status its resolution implies. The
    /// winner is whichever side raised or answered the dispute: a creator
    /// who wins gets the task cancelled, a worker who wins gets it completed.
    /// Left `Disputed` (and so still visible to drift checks) when the
    /// dispute or task row is not mirrored yet.
    async fn settle_task(&self, dispute_id: &str, initiator_won: bool, block: u64) -> anyhow::Result<()> {
        let Some(dispute) = self.store.get(EntityKind::Dispute, dispute_id).await? else {
            return Ok(());
        };
        let (Some(task_id), Some(initiator)) = (dispute.get("task_id"), dispute.get("initiator")) else {
            return Ok(());
        };
        let Some(task) = self.store.get(EntityKind::Task, task_id).await? else {
            return Ok(());
        };
        if task.get("status") != Some("Disputed") {
            return Ok(());
        }
        let Some(creator) = task.get("creator") else {
            return Ok(());
        };
        let creator_won = (initiator == creator) == initiator_won;
        let status = if creator_won { "Cancelled" } else { "Completed" };
        let write = EntityWrite::new(EntityKind::Task, task_id, block).set("status", status);
        self.store.upsert(&write).await?;
        Ok(())
    }
}

#[async_trait]
impl EventDomain for DisputeDomain {
    type Event = DisputeEvent;

    fn name(&self) -> &'static str {
        "dispute"
    }

    async fn validate(&self) -> anyhow::Result<()> {
        require_address(self.resolver, "DisputeResolver")?;
        self.store.ping().await?;
        Ok(())
    }

    fn addresses(&self) -> Vec<Address> {
        self.resolver.into_iter().collect()
    }

    fn topics(&self) -> Vec<B256> {
        vec![
            IDisputeResolver::DisputeOpened::SIGNATURE_HASH,
            IDisputeResolver::DisputeVoted::SIGNATURE_HASH,
            IDisputeResolver::DisputeResolved::SIGNATURE_HASH,
        ]
    }

    fn decode(&self, log: &Log) -> anyhow::Result<Option<DisputeEvent>> {
        let event = match log.topic0() {
            Some(t) if *t == IDisputeResolver::DisputeOpened::SIGNATURE_HASH => DisputeEvent::Opened(decode_event(log)?),
            Some(t) if *t == IDisputeResolver::DisputeVoted::SIGNATURE_HASH => DisputeEvent::Voted(decode_event(log)?),
            Some(t) if *t == IDisputeResolver::DisputeResolved::SIGNATURE_HASH => {
                DisputeEvent::Resolved(decode_event(log)?)
            }
            _ => return Ok(None),
        };
        Ok(Some(event))
    }

    async fn apply(&self, event: &DisputeEvent, ctx: &EventContext) -> anyhow::Result<&'static [&'static str]> {
        let block = ctx.block;
        match event {
            DisputeEvent::Opened(e) => {
                let opened = EntityWrite::new(EntityKind::Dispute, e.disputeId.to_string(), block)
                    .set("task_id", e.taskId)
                    .set("initiator", e.initiator)
                    .set("reason", e.reason.clone())
                    .set("status", "Open")
                    .set("opened_at", ctx.block_time().await?);
                self.store.upsert(&opened).await?;
                let task = EntityWrite::new(EntityKind::Task, e.taskId.to_string(), block).set("status", "Disputed");
                self.store.upsert(&task).await?;
                Ok(&["disputes_opened"])
            }
            DisputeEvent::Voted(e) => {
                let vote = EntityWrite::new(EntityKind::DisputeVote, pair_id(e.disputeId, &e.juror), block)
                    .set("dispute_id", e.disputeId)
                    .set("juror", e.juror)
                    .set("supports_initiator", e.supportsInitiator)
                    .set("weight", e.weight);
                self.store.upsert(&vote).await?;
                Ok(&["dispute_votes"])
            }
            DisputeEvent::Resolved(e) => {
                let status = if e.initiatorWon {
                    "ResolvedForInitiator"
                } else {
                    "ResolvedAgainstInitiator"
                };
                let resolved = EntityWrite::new(EntityKind::Dispute, e.disputeId.to_string(), block)
                    .set("status", status)
                    .set("resolved_at", ctx.block_time().await?);
                self.store.upsert(&resolved).await?;
                self.settle_task(&e.disputeId.to_string(), e.initiatorWon, block).await?;
                Ok(&["disputes_resolved"])
            }
        }
    }

    async fn entity_counts(&self) -> anyhow::Result<BTreeMap<String, u64>> {
        count_kinds(self.store.as_ref(), &[EntityKind::Dispute, EntityKind::DisputeVote]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::{log_for, MockChain};
    use alloy::primitives::U256;

    const RESOLVER: Address = Address::repeat_byte(0x0d);

    async fn feed<E: SolEvent>(domain: &DisputeDomain, event: &E, block: u64) -> &'static [&'static str] {
        let log = log_for(RESOLVER, event, block, 0);
        let decoded = domain.decode(&log).unwrap().unwrap();
        let ctx = EventContext::new(&log, MockChain::new(block));
        domain.apply(&decoded, &ctx).await.unwrap()
    }

    #[tokio::test]
    async fn test_open_marks_task_disputed() {
        let store = Arc::new(MemoryStore::new());
        let domain = DisputeDomain::new(store.clone(), Some(RESOLVER));
        let opened = IDisputeResolver::DisputeOpened {
            disputeId: U256::from(1u64),
            taskId: U256::from(7u64),
            initiator: Address::repeat_byte(0x11),
            reason: "late delivery".to_string(),
        };
        assert_eq!(feed(&domain, &opened, 50).await, &["disputes_opened"]);

        let dispute = store.get(EntityKind::Dispute, "1").await.unwrap().unwrap();
        assert_eq!(dispute.get("reason"), Some("late delivery"));
        assert_eq!(dispute.get("status"), Some("Open"));
        let task = store.get(EntityKind::Task, "7").await.unwrap().unwrap();
        assert_eq!(task.get("status"), Some("Disputed"));

        let resolved = IDisputeResolver::DisputeResolved {
            disputeId: U256::from(1u64),
            initiatorWon: false,
        };
        feed(&domain, &resolved, 60).await;
        let dispute = store.get(EntityKind::Dispute, "1").await.unwrap().unwrap();
        assert_eq!(dispute.get("status"), Some("ResolvedAgainstInitiator"));
        assert_eq!(dispute.get("task_id"), Some("7"));
        // Creator row not mirrored yet, so the task waits for drift checks.
        let task = store.get(EntityKind::Task, "7").await.unwrap().unwrap();
        assert_eq!(task.get("status"), Some("Disputed"));
    }

    #[tokio::test]
    async fn test_resolution_settles_task() {
        let store = Arc::new(MemoryStore::new());
        let domain = DisputeDomain::new(store.clone(), Some(RESOLVER));
        let creator = Address::repeat_byte(0x11);
        let worker = Address::repeat_byte(0x12);
        for (task, initiator) in [(7u64, creator), (8u64, worker)] {
            let created = EntityWrite::new(EntityKind::Task, task.to_string(), 40)
                .set("creator", creator)
                .set("worker", worker)
                .set("status", "Submitted");
            store.upsert(&created).await.unwrap();
            let opened = IDisputeResolver::DisputeOpened {
                disputeId: U256::from(task),
                taskId: U256::from(task),
                initiator,
                reason: "quality".to_string(),
            };
            feed(&domain, &opened, 50).await;
        }

        // Creator wins on 7, worker wins on 8.
        for (dispute, won) in [(7u64, true), (8u64, true)] {
            let resolved = IDisputeResolver::DisputeResolved {
                disputeId: U256::from(dispute),
                initiatorWon: won,
            };
            feed(&domain, &resolved, 60).await;
        }

        for (id, status) in [("7", "Cancelled"), ("8", "Completed")] {
            let task = store.get(EntityKind::Task, id).await.unwrap().unwrap();
            assert_eq!(task.get("status"), Some(status));
            assert_eq!(task.last_event_block, 60);
        }
    }

    #[tokio::test]
    async fn test_creation_replayed_after_dispute_keeps_fields() {
        let store = Arc::new(MemoryStore::new());
        let domain = DisputeDomain::new(store.clone(), Some(RESOLVER));
        let opened = IDisputeResolver::DisputeOpened {
            disputeId: U256::from(2u64),
            taskId: U256::from(9u64),
            initiator: Address::repeat_byte(0x11),
            reason: "no show".to_string(),
        };
        feed(&domain, &opened, 50).await;

        // Catch-up replays the task's creation afterwards.
        let created = EntityWrite::new(EntityKind::Task, "9", 10)
            .set("creator", Address::repeat_byte(0x11))
            .set("reward", U256::from(100u64))
            .set("status", "Open");
        store.upsert(&created).await.unwrap();

        let task = store.get(EntityKind::Task, "9").await.unwrap().unwrap();
        assert_eq!(task.get("status"), Some("Disputed"));
        assert_eq!(task.get("reward"), Some("100"));
        assert_eq!(task.last_event_block, 50);
    }

    #[tokio::test]
    async fn test_juror_votes_keyed_per_juror() {
        let store = Arc::new(MemoryStore::new());
        let domain = DisputeDomain::new(store.clone(), Some(RESOLVER));
        for (i, juror) in [0x21u8, 0x22].into_iter().enumerate() {
            let vote = IDisputeResolver::DisputeVoted {
                disputeId: U256::from(3u64),
                juror: Address::repeat_byte(juror),
                supportsInitiator: i == 0,
                weight: U256::from(10u64),
            };
            feed(&domain, &vote, 70 + i as u64).await;
        }
        let counts = domain.entity_counts().await.unwrap();
        assert_eq!(counts.get("dispute_votes"), Some(&2));
        assert_eq!(counts.get("disputes"), Some(&0));
    }
}
