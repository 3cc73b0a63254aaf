//! Relational mirror of on-chain state, plus delegation records.
//!
//! Data model (one table per entity kind, keyed by the chain-defined id):
//!   tasks            id = taskId
//!   proposals        id = proposalId
//!   votes            id = "{proposalId}:{voter}"
//!   disputes         id = disputeId
//!   dispute_votes    id = "{disputeId}:{juror}"
//!   stakers          id = address
//!   deposits         id = "{txHash}:{logIndex}"
//!   redemptions      id = requestId
//!   delegations_v2   unique (delegator, nonce)
//!
//! Every mirrored row carries `last_event_block`. Event writes go through
//! [`MirrorStore::upsert`], which applies fields only when the event block is
//! not older than the row, so redelivered or reordered events never regress
//! state. Rows are never deleted; status columns move to terminal values.

pub mod checkpoint;
pub mod memory;
pub mod postgres;

pub use checkpoint::{CheckpointStore, MemoryCheckpoints, ValkeyCheckpoints};
pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use crate::allocation::Allocation;

use alloy::primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("valkey error: {0}")]
    Valkey(#[from] redis::RedisError),
    #[error("nonce {nonce} already used by {delegator}")]
    NonceConflict { delegator: Address, nonce: u64 },
    #[error("column {column} is not defined for {kind}")]
    UnknownColumn { kind: EntityKind, column: String },
    #[error("invalid stored value: {0}")]
    Invalid(String),
}

/// Mirrored entity kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Task,
    Proposal,
    Vote,
    Dispute,
    DisputeVote,
    Staker,
    Deposit,
    Redemption,
}

/// SQL type of a mirrored column; decides bind casts and text rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Numeric,
    BigInt,
    Bool,
    Timestamp,
}

use ColumnType::{BigInt, Bool, Numeric, Text, Timestamp};

impl EntityKind {
    pub const ALL: [EntityKind; 8] = [
        EntityKind::Task,
        EntityKind::Proposal,
        EntityKind::Vote,
        EntityKind::Dispute,
        EntityKind::DisputeVote,
        EntityKind::Staker,
        EntityKind::Deposit,
        EntityKind::Redemption,
    ];

    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Task => "tasks",
            EntityKind::Proposal => "proposals",
            EntityKind::Vote => "votes",
            EntityKind::Dispute => "disputes",
            EntityKind::DisputeVote => "dispute_votes",
            EntityKind::Staker => "stakers",
            EntityKind::Deposit => "deposits",
            EntityKind::Redemption => "redemptions",
        }
    }

    pub fn id_type(&self) -> ColumnType {
        match self {
            EntityKind::Task | EntityKind::Proposal | EntityKind::Dispute | EntityKind::Redemption => {
                Numeric
            }
            _ => Text,
        }
    }

    /// Column allowlist. Dynamic SQL only ever uses these identifiers.
    pub fn columns(&self) -> &'static [(&'static str, ColumnType)] {
        match self {
            EntityKind::Task => &[
                ("creator", Text),
                ("worker", Text),
                ("reward", Numeric),
                ("deadline", BigInt),
                ("status", Text),
                ("payout", Numeric),
                ("created_at", Timestamp),
                ("completed_at", Timestamp),
            ],
            EntityKind::Proposal => &[
                ("proposer", Text),
                ("start_time", BigInt),
                ("end_time", BigInt),
                ("for_votes", Numeric),
                ("against_votes", Numeric),
                ("abstain_votes", Numeric),
                ("status", Text),
                ("created_at", Timestamp),
            ],
            EntityKind::Vote => &[
                ("proposal_id", Numeric),
                ("voter", Text),
                ("support", BigInt),
                ("weight", Numeric),
                ("delegated", Bool),
                ("allocations_hash", Text),
                ("cast_at", Timestamp),
            ],
            EntityKind::Dispute => &[
                ("task_id", Numeric),
                ("initiator", Text),
                ("reason", Text),
                ("status", Text),
                ("opened_at", Timestamp),
                ("resolved_at", Timestamp),
            ],
            EntityKind::DisputeVote => &[
                ("dispute_id", Numeric),
                ("juror", Text),
                ("supports_initiator", Bool),
                ("weight", Numeric),
            ],
            EntityKind::Staker => &[
                ("reputation", Numeric),
                ("cached_power", Numeric),
                ("power_updated_at", Timestamp),
                ("last_activity_at", Timestamp),
            ],
            EntityKind::Deposit => &[
                ("account", Text),
                ("assets", Numeric),
                ("shares", Numeric),
                ("deposited_at", Timestamp),
            ],
            EntityKind::Redemption => &[
                ("account", Text),
                ("shares", Numeric),
                ("assets", Numeric),
                ("status", Text),
                ("requested_at", Timestamp),
                ("settled_at", Timestamp),
            ],
        }
    }

    pub fn column_type(&self, column: &str) -> Option<ColumnType> {
        self.columns()
            .iter()
            .find(|(name, _)| *name == column)
            .map(|(_, ty)| *ty)
    }

    pub fn has_status(&self) -> bool {
        self.column_type("status").is_some()
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.table())
    }
}

/// A typed column value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Uint(U256),
    Int(i64),
    Bool(bool),
    Address(Address),
    Timestamp(DateTime<Utc>),
}

impl FieldValue {
    /// Text rendering shared by every store, used for drift comparison.
    /// Timestamps render as unix seconds.
    pub fn canonical(&self) -> String {
        match self {
            FieldValue::Text(s) => s.clone(),
            FieldValue::Uint(v) => v.to_string(),
            FieldValue::Int(v) => v.to_string(),
            FieldValue::Bool(v) => v.to_string(),
            FieldValue::Address(a) => address_text(a),
            FieldValue::Timestamp(t) => t.timestamp().to_string(),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Text(v)
    }
}

impl From<U256> for FieldValue {
    fn from(v: U256) -> Self {
        FieldValue::Uint(v)
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        FieldValue::Int(v as i64)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<Address> for FieldValue {
    fn from(v: Address) -> Self {
        FieldValue::Address(v)
    }
}

impl From<B256> for FieldValue {
    fn from(v: B256) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(v: DateTime<Utc>) -> Self {
        FieldValue::Timestamp(v)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub column: &'static str,
    pub value: FieldValue,
}

pub fn field(column: &'static str, value: impl Into<FieldValue>) -> Field {
    Field {
        column,
        value: value.into(),
    }
}

/// One event's reconciliation write.
#[derive(Debug, Clone)]
pub struct EntityWrite {
    pub kind: EntityKind,
    pub id: String,
    pub block: u64,
    pub fields: Vec<Field>,
}

impl EntityWrite {
    pub fn new(kind: EntityKind, id: impl Into<String>, block: u64) -> Self {
        Self {
            kind,
            id: id.into(),
            block,
            fields: Vec::new(),
        }
    }

    pub fn set(mut self, column: &'static str, value: impl Into<FieldValue>) -> Self {
        self.fields.push(field(column, value));
        self
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        validate_fields(self.kind, &self.fields)
    }
}

pub(crate) fn validate_fields(kind: EntityKind, fields: &[Field]) -> Result<(), StoreError> {
    for f in fields {
        if kind.column_type(f.column).is_none() {
            return Err(StoreError::UnknownColumn {
                kind,
                column: f.column.to_string(),
            });
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// The row already reflects a later block; only columns it was
    /// missing were filled.
    Stale,
}

/// A mirrored row with every column rendered canonically.
#[derive(Debug, Clone, PartialEq)]
pub struct MirrorRow {
    pub kind: EntityKind,
    pub id: String,
    pub last_event_block: u64,
    pub fields: BTreeMap<String, String>,
}

impl MirrorRow {
    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields.get(column).map(String::as_str)
    }
}

/// A signed off-chain delegation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DelegationRecord {
    pub delegator: Address,
    pub delegate: Address,
    /// 0 means full delegation.
    pub vp_amount: U256,
    pub nonce: u64,
    pub expiry: u64,
    pub signature: Bytes,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl DelegationRecord {
    pub fn is_full(&self) -> bool {
        self.vp_amount.is_zero()
    }

    pub fn is_active(&self, now: u64) -> bool {
        self.revoked_at.is_none() && self.expiry > now
    }
}

/// Allocation set persisted once the delegate's vote transaction is known.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DelegatedVoteRecord {
    pub proposal_id: U256,
    pub delegate: Address,
    pub support: u8,
    pub amount: U256,
    pub allocations_hash: B256,
    pub allocations: Vec<Allocation>,
    pub tx_hash: Option<B256>,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait MirrorStore: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;

    /// Insert-or-update advancing `last_event_block` only forward. A write
    /// older than the row never overwrites a column, but fills empty ones.
    async fn upsert(&self, write: &EntityWrite) -> Result<UpsertOutcome, StoreError>;

    async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<MirrorRow>, StoreError>;

    /// Ids whose status is in `statuses`, ordered by id, strictly after `after`.
    async fn active_ids(
        &self,
        kind: EntityKind,
        statuses: &[&str],
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>, StoreError>;

    /// Unconditional column update (drift corrections, derived values).
    async fn update_fields(&self, kind: EntityKind, id: &str, fields: &[Field]) -> Result<(), StoreError>;

    async fn count(&self, kind: EntityKind, status: Option<&str>) -> Result<u64, StoreError>;

    async fn is_delegate_opted_in(&self, delegate: Address) -> Result<bool, StoreError>;

    async fn set_delegate_opt_in(&self, delegate: Address, opted_in: bool) -> Result<(), StoreError>;

    async fn max_delegation_nonce(&self, delegator: Address) -> Result<Option<u64>, StoreError>;

    /// Insert a delegation. A full delegation revokes the delegator's other
    /// active full delegations in the same transaction. A duplicate
    /// `(delegator, nonce)` fails with [`StoreError::NonceConflict`].
    async fn insert_delegation(&self, record: &DelegationRecord, now: u64) -> Result<(), StoreError>;

    /// Revoke active delegations from `delegator` (to `delegate`, or all when `None`).
    async fn revoke_delegations(
        &self,
        delegator: Address,
        delegate: Option<Address>,
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    async fn active_delegations(&self, delegator: Address, now: u64) -> Result<Vec<DelegationRecord>, StoreError>;

    /// Idempotent on `(proposal_id, delegate, allocations_hash)`.
    async fn insert_delegated_vote(&self, record: &DelegatedVoteRecord) -> Result<(), StoreError>;
}

/// Lowercase 0x-prefixed address, the stored form.
pub fn address_text(addr: &Address) -> String {
    addr.to_string().to_lowercase()
}

/// Compound id for per-voter rows.
pub fn pair_id(left: impl std::fmt::Display, right: &Address) -> String {
    format!("{}:{}", left, address_text(right))
}

/// Sort key matching SQL ordering of the id column.
pub(crate) fn id_sort_key(kind: EntityKind, id: &str) -> (usize, String) {
    match kind.id_type() {
        ColumnType::Numeric => (id.len(), id.to_string()),
        _ => (0, id.to_string()),
    }
}
