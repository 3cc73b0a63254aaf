//! In-memory [`MirrorStore`] with the same merge semantics as Postgres.

use crate::store::{
    id_sort_key, validate_fields, DelegatedVoteRecord, DelegationRecord, EntityKind,
    EntityWrite, Field, MirrorRow, MirrorStore, StoreError, UpsertOutcome,
};

use alloy::primitives::{Address, B256, U256};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

#[derive(Default)]
struct State {
    rows: HashMap<(EntityKind, String), MirrorRow>,
    delegations: Vec<DelegationRecord>,
    opt_ins: HashMap<Address, bool>,
    delegated_votes: HashMap<(U256, Address, B256), DelegatedVoteRecord>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Invalid("memory store lock poisoned".to_string()))
    }

    pub fn delegated_votes(&self) -> Vec<DelegatedVoteRecord> {
        self.lock()
            .map(|s| s.delegated_votes.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl MirrorStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn upsert(&self, write: &EntityWrite) -> Result<UpsertOutcome, StoreError> {
        write.validate()?;
        let mut state = self.lock()?;
        let key = (write.kind, write.id.clone());
        match state.rows.get_mut(&key) {
            None => {
                let fields: BTreeMap<String, String> = write
                    .fields
                    .iter()
                    .map(|f| (f.column.to_string(), f.value.canonical()))
                    .collect();
                state.rows.insert(
                    key,
                    MirrorRow {
                        kind: write.kind,
                        id: write.id.clone(),
                        last_event_block: write.block,
                        fields,
                    },
                );
                Ok(UpsertOutcome::Inserted)
            }
            Some(row) if row.last_event_block > write.block => {
                for f in &write.fields {
                    row.fields
                        .entry(f.column.to_string())
                        .or_insert_with(|| f.value.canonical());
                }
                Ok(UpsertOutcome::Stale)
            }
            Some(row) => {
                for f in &write.fields {
                    row.fields.insert(f.column.to_string(), f.value.canonical());
                }
                row.last_event_block = write.block;
                Ok(UpsertOutcome::Updated)
            }
        }
    }

    async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<MirrorRow>, StoreError> {
        Ok(self.lock()?.rows.get(&(kind, id.to_string())).cloned())
    }

    async fn active_ids(
        &self,
        kind: EntityKind,
        statuses: &[&str],
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let state = self.lock()?;
        let after_key = after.map(|a| id_sort_key(kind, a));
        let mut ids: Vec<&MirrorRow> = state
            .rows
            .values()
            .filter(|row| row.kind == kind)
            .filter(|row| row.get("status").map_or(false, |s| statuses.contains(&s)))
            .filter(|row| match &after_key {
                Some(a) => id_sort_key(kind, &row.id) > *a,
                None => true,
            })
            .collect();
        ids.sort_by_key(|row| id_sort_key(kind, &row.id));
        Ok(ids.into_iter().take(limit).map(|row| row.id.clone()).collect())
    }

    async fn update_fields(&self, kind: EntityKind, id: &str, fields: &[Field]) -> Result<(), StoreError> {
        validate_fields(kind, fields)?;
        let mut state = self.lock()?;
        if let Some(row) = state.rows.get_mut(&(kind, id.to_string())) {
            for f in fields {
                row.fields.insert(f.column.to_string(), f.value.canonical());
            }
        }
        Ok(())
    }

    async fn count(&self, kind: EntityKind, status: Option<&str>) -> Result<u64, StoreError> {
        if status.is_some() && !kind.has_status() {
            return Err(StoreError::UnknownColumn {
                kind,
                column: "status".to_string(),
            });
        }
        let state = self.lock()?;
        Ok(state
            .rows
            .values()
            .filter(|row| row.kind == kind)
            .filter(|row| status.map_or(true, |s| row.get("status") == Some(s)))
            .count() as u64)
    }

    async fn is_delegate_opted_in(&self, delegate: Address) -> Result<bool, StoreError> {
        Ok(self.lock()?.opt_ins.get(&delegate).copied().unwrap_or(false))
    }

    async fn set_delegate_opt_in(&self, delegate: Address, opted_in: bool) -> Result<(), StoreError> {
        self.lock()?.opt_ins.insert(delegate, opted_in);
        Ok(())
    }

    async fn max_delegation_nonce(&self, delegator: Address) -> Result<Option<u64>, StoreError> {
        Ok(self
            .lock()?
            .delegations
            .iter()
            .filter(|d| d.delegator == delegator)
            .map(|d| d.nonce)
            .max())
    }

    async fn insert_delegation(&self, record: &DelegationRecord, now: u64) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if state
            .delegations
            .iter()
            .any(|d| d.delegator == record.delegator && d.nonce == record.nonce)
        {
            return Err(StoreError::NonceConflict {
                delegator: record.delegator,
                nonce: record.nonce,
            });
        }
        if record.is_full() {
            let revoked_at = record.created_at;
            for d in state.delegations.iter_mut() {
                if d.delegator == record.delegator && d.is_full() && d.is_active(now) {
                    d.revoked_at = Some(revoked_at);
                }
            }
        }
        state.delegations.push(record.clone());
        Ok(())
    }

    async fn revoke_delegations(
        &self,
        delegator: Address,
        delegate: Option<Address>,
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut state = self.lock()?;
        let mut revoked = 0;
        for d in state.delegations.iter_mut() {
            if d.delegator == delegator
                && d.revoked_at.is_none()
                && delegate.map_or(true, |target| d.delegate == target)
            {
                d.revoked_at = Some(at);
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    async fn active_delegations(&self, delegator: Address, now: u64) -> Result<Vec<DelegationRecord>, StoreError> {
        let state = self.lock()?;
        let mut active: Vec<DelegationRecord> = state
            .delegations
            .iter()
            .filter(|d| d.delegator == delegator && d.is_active(now))
            .cloned()
            .collect();
        active.sort_by_key(|d| d.nonce);
        Ok(active)
    }

    async fn insert_delegated_vote(&self, record: &DelegatedVoteRecord) -> Result<(), StoreError> {
        let key = (record.proposal_id, record.delegate, record.allocations_hash);
        self.lock()?
            .delegated_votes
            .entry(key)
            .or_insert_with(|| record.clone());
        Ok(())
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rows = self.lock().map(|s| s.rows.len()).unwrap_or(0);
        write!(f, "MemoryStore(rows={rows})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EntityWrite;

    #[tokio::test]
    async fn test_upsert_never_regresses() {
        let store = MemoryStore::new();
        let created = EntityWrite::new(EntityKind::Task, "7", 100).set("status", "Open");
        let completed = EntityWrite::new(EntityKind::Task, "7", 120).set("status", "Completed");

        assert_eq!(store.upsert(&created).await.unwrap(), UpsertOutcome::Inserted);
        assert_eq!(store.upsert(&completed).await.unwrap(), UpsertOutcome::Updated);
        // Redelivered older event does not roll the status back.
        assert_eq!(store.upsert(&created).await.unwrap(), UpsertOutcome::Stale);

        let row = store.get(EntityKind::Task, "7").await.unwrap().unwrap();
        assert_eq!(row.get("status"), Some("Completed"));
        assert_eq!(row.last_event_block, 120);
    }

    #[tokio::test]
    async fn test_older_write_fills_missing_columns() {
        let store = MemoryStore::new();
        let completed = EntityWrite::new(EntityKind::Task, "9", 20)
            .set("status", "Completed")
            .set("payout", U256::from(90u64));
        let created = EntityWrite::new(EntityKind::Task, "9", 10)
            .set("status", "Open")
            .set("creator", Address::repeat_byte(0x11))
            .set("reward", U256::from(100u64));

        store.upsert(&completed).await.unwrap();
        assert_eq!(store.upsert(&created).await.unwrap(), UpsertOutcome::Stale);

        let row = store.get(EntityKind::Task, "9").await.unwrap().unwrap();
        assert_eq!(row.get("status"), Some("Completed"));
        assert_eq!(row.get("reward"), Some("100"));
        assert!(row.get("creator").is_some());
        assert_eq!(row.last_event_block, 20);
    }

    #[tokio::test]
    async fn test_unknown_column_rejected() {
        let store = MemoryStore::new();
        let bad = EntityWrite::new(EntityKind::Staker, "0xabc", 1).set("status", "Open");
        assert!(matches!(
            store.upsert(&bad).await,
            Err(StoreError::UnknownColumn { .. })
        ));
    }

    #[tokio::test]
    async fn test_active_ids_numeric_order_and_cursor() {
        let store = MemoryStore::new();
        for id in ["10", "2", "33", "4"] {
            let w = EntityWrite::new(EntityKind::Task, id, 1).set("status", "Open");
            store.upsert(&w).await.unwrap();
        }
        let done = EntityWrite::new(EntityKind::Task, "5", 1).set("status", "Completed");
        store.upsert(&done).await.unwrap();

        let first = store
            .active_ids(EntityKind::Task, &["Open"], None, 3)
            .await
            .unwrap();
        assert_eq!(first, vec!["2", "4", "10"]);
        let rest = store
            .active_ids(EntityKind::Task, &["Open"], Some("10"), 3)
            .await
            .unwrap();
        assert_eq!(rest, vec!["33"]);
    }
}
