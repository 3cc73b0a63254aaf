//! Periodic drift correction between mirrored rows and contract views.
//!
//! Events can be missed (gaps longer than the lookback, handler errors), so
//! non-terminal rows are re-read from the chain in pages. Only columns whose
//! canonical value differs are written.

use crate::chain::abi::{proposal_state_name, task_status_name, IGovernor, ITaskMarket};
use crate::chain::{call_contract, ChainClient, ChainConnection};
use crate::store::{field, EntityKind, Field, MirrorStore};

use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// An entity kind whose rows can be checked against a contract view.
#[async_trait]
pub trait DriftSource: Send + Sync {
    fn kind(&self) -> EntityKind;

    /// Statuses that can still change on chain.
    fn active_statuses(&self) -> &'static [&'static str];

    /// Canonical column values for `id`, read from the chain.
    async fn canonical(&self, client: &dyn ChainClient, id: &str) -> anyhow::Result<Vec<Field>>;
}

fn parse_id(id: &str) -> anyhow::Result<U256> {
    U256::from_str(id).map_err(|e| anyhow::anyhow!("bad numeric id {id}: {e}"))
}

pub struct TaskDriftSource {
    task_market: Address,
}

impl TaskDriftSource {
    pub fn new(task_market: Address) -> Self {
        Self { task_market }
    }
}

#[async_trait]
impl DriftSource for TaskDriftSource {
    fn kind(&self) -> EntityKind {
        EntityKind::Task
    }

    fn active_statuses(&self) -> &'static [&'static str] {
        &["Open", "Assigned", "Submitted", "Disputed"]
    }

    async fn canonical(&self, client: &dyn ChainClient, id: &str) -> anyhow::Result<Vec<Field>> {
        let task = call_contract(client, self.task_market, &ITaskMarket::getTaskCall { taskId: parse_id(id)? }).await?;
        let mut fields = vec![
            field("creator", task.creator),
            field("reward", task.reward),
            field("deadline", task.deadline),
            field("status", task_status_name(task.status)),
        ];
        if task.worker != Address::ZERO {
            fields.push(field("worker", task.worker));
        }
        Ok(fields)
    }
}

pub struct ProposalDriftSource {
    governor: Address,
}

impl ProposalDriftSource {
    pub fn new(governor: Address) -> Self {
        Self { governor }
    }
}

#[async_trait]
impl DriftSource for ProposalDriftSource {
    fn kind(&self) -> EntityKind {
        EntityKind::Proposal
    }

    fn active_statuses(&self) -> &'static [&'static str] {
        &["Pending", "Active", "Succeeded"]
    }

    async fn canonical(&self, client: &dyn ChainClient, id: &str) -> anyhow::Result<Vec<Field>> {
        let p = call_contract(
            client,
            self.governor,
            &IGovernor::getProposalCall {
                proposalId: parse_id(id)?,
            },
        )
        .await?;
        Ok(vec![
            field("proposer", p.proposer),
            field("start_time", p.startTime),
            field("end_time", p.endTime),
            field("for_votes", p.forVotes),
            field("against_votes", p.againstVotes),
            field("abstain_votes", p.abstainVotes),
            field("status", proposal_state_name(p.state)),
        ])
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DriftReport {
    pub checked: u64,
    pub drifted: u64,
    pub failed: u64,
}

pub struct DriftReconciler {
    connection: ChainConnection,
    store: Arc<dyn MirrorStore>,
    sources: Vec<Box<dyn DriftSource>>,
    batch_size: usize,
    cursors: Mutex<HashMap<EntityKind, Option<String>>>,
}

impl DriftReconciler {
    pub fn new(connection: ChainConnection, store: Arc<dyn MirrorStore>, batch_size: usize) -> Self {
        Self {
            connection,
            store,
            sources: Vec::new(),
            batch_size: batch_size.max(1),
            cursors: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_source(mut self, source: impl DriftSource + 'static) -> Self {
        self.sources.push(Box::new(source));
        self
    }

    /// Check one page per source, resuming after the previous page and
    /// wrapping to the start once a source is exhausted.
    pub async fn run_once(&self) -> anyhow::Result<DriftReport> {
        let client = self.connection.get().await?;
        let mut report = DriftReport::default();

        for source in &self.sources {
            let kind = source.kind();
            let after = self.cursors.lock().await.get(&kind).cloned().flatten();
            let ids = self
                .store
                .active_ids(kind, source.active_statuses(), after.as_deref(), self.batch_size)
                .await?;

            let next = if ids.len() < self.batch_size {
                None
            } else {
                ids.last().cloned()
            };
            self.cursors.lock().await.insert(kind, next);

            for id in &ids {
                report.checked += 1;
                match self.check(source.as_ref(), client.as_ref(), id).await {
                    Ok(true) => report.drifted += 1,
                    Ok(false) => {}
                    Err(e) => {
                        report.failed += 1;
                        warn!(kind = %kind, id = %id, error = %e, "drift check failed");
                    }
                }
            }
        }

        info!(
            checked = report.checked,
            drifted = report.drifted,
            failed = report.failed,
            "drift pass complete"
        );
        Ok(report)
    }

    /// Returns whether anything was corrected.
    async fn check(&self, source: &dyn DriftSource, client: &dyn ChainClient, id: &str) -> anyhow::Result<bool> {
        let kind = source.kind();
        let canonical = source.canonical(client, id).await?;
        let Some(row) = self.store.get(kind, id).await? else {
            return Ok(false);
        };

        let changed: Vec<Field> = canonical
            .into_iter()
            .filter(|f| row.get(f.column) != Some(f.value.canonical().as_str()))
            .collect();
        if changed.is_empty() {
            debug!(kind = %kind, id = %id, "no drift");
            return Ok(false);
        }

        let columns: Vec<&str> = changed.iter().map(|f| f.column).collect();
        warn!(kind = %kind, id = %id, columns = ?columns, "drift corrected");
        self.store.update_fields(kind, id, &changed).await?;
        Ok(true)
    }
}
