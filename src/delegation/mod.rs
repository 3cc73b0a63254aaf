//! Off-chain vote-power delegations.
//!
//! A delegation is an EIP-712 `Delegation` signed by the delegator. Nonces
//! are strictly increasing per delegator; the store's unique
//! `(delegator, nonce)` constraint settles concurrent submissions, and the
//! loser is told which nonce to use next.

use crate::allocation::AllocationResult;
use crate::clock::Clock;
use crate::signer::{ApprovalSigner, Delegation};
use crate::store::{DelegatedVoteRecord, DelegationRecord, MirrorStore, StoreError};

use alloy::primitives::{Address, Bytes, B256, U256};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum DelegationError {
    #[error("delegation expired at {expiry} (now {now})")]
    Expired { expiry: u64, now: u64 },
    #[error("invalid delegation signature")]
    InvalidSignature,
    #[error("delegate {0} has not opted in")]
    DelegateNotOptedIn(Address),
    #[error("invalid nonce, expected at least {expected}")]
    InvalidNonce { expected: u64 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A delegation as submitted by a client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegationInput {
    pub delegator: Address,
    pub delegate: Address,
    /// 0 delegates everything.
    pub vp_amount: U256,
    pub nonce: u64,
    pub expiry: u64,
    pub signature: Bytes,
}

impl DelegationInput {
    pub fn message(&self) -> Delegation {
        Delegation {
            delegator: self.delegator,
            delegate: self.delegate,
            vpAmount: self.vp_amount,
            nonce: U256::from(self.nonce),
            expiry: U256::from(self.expiry),
        }
    }
}

pub struct DelegationService {
    store: Arc<dyn MirrorStore>,
    signer: Arc<ApprovalSigner>,
    clock: Arc<dyn Clock>,
}

fn unix_to_datetime(secs: u64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs as i64, 0).unwrap_or_else(Utc::now)
}

impl DelegationService {
    pub fn new(store: Arc<dyn MirrorStore>, signer: Arc<ApprovalSigner>, clock: Arc<dyn Clock>) -> Self {
        Self { store, signer, clock }
    }

    async fn expected_nonce(&self, delegator: Address) -> Result<u64, StoreError> {
        Ok(self
            .store
            .max_delegation_nonce(delegator)
            .await?
            .map_or(0, |max| max.saturating_add(1)))
    }

    /// Validate and persist a signed delegation. Returns the chain id the
    /// signature verified under.
    pub async fn store_delegation(&self, input: &DelegationInput) -> Result<u64, DelegationError> {
        let now = self.clock.now();
        if now > input.expiry {
            return Err(DelegationError::Expired {
                expiry: input.expiry,
                now,
            });
        }

        let chain_id = self
            .signer
            .verify_typed(&input.message(), &input.signature, input.delegator)
            .ok_or(DelegationError::InvalidSignature)?;

        if !self.store.is_delegate_opted_in(input.delegate).await? {
            return Err(DelegationError::DelegateNotOptedIn(input.delegate));
        }

        let expected = self.expected_nonce(input.delegator).await?;
        if input.nonce < expected {
            return Err(DelegationError::InvalidNonce { expected });
        }

        let record = DelegationRecord {
            delegator: input.delegator,
            delegate: input.delegate,
            vp_amount: input.vp_amount,
            nonce: input.nonce,
            expiry: input.expiry,
            signature: input.signature.clone(),
            created_at: unix_to_datetime(now),
            revoked_at: None,
        };
        match self.store.insert_delegation(&record, now).await {
            Ok(()) => {}
            Err(StoreError::NonceConflict { delegator, nonce }) => {
                let expected = self.expected_nonce(delegator).await?;
                warn!(delegator = %delegator, nonce = nonce, expected = expected, "delegation nonce raced");
                return Err(DelegationError::InvalidNonce { expected });
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            delegator = %input.delegator,
            delegate = %input.delegate,
            amount = %input.vp_amount,
            nonce = input.nonce,
            chain_id = chain_id,
            full = record.is_full(),
            "delegation stored"
        );
        Ok(chain_id)
    }

    /// Revoke the delegator's active delegations to `delegate`, or all of
    /// them when `None`. Returns how many were revoked.
    pub async fn revoke_delegation(
        &self,
        delegator: Address,
        delegate: Option<Address>,
        timestamp: u64,
        signature: &[u8],
    ) -> Result<u64, DelegationError> {
        if !self
            .signer
            .verify_revocation_signature(delegator, delegate, timestamp, signature)
        {
            return Err(DelegationError::InvalidSignature);
        }
        let at = unix_to_datetime(self.clock.now());
        let revoked = self.store.revoke_delegations(delegator, delegate, at).await?;
        info!(delegator = %delegator, delegate = ?delegate, revoked = revoked, "delegations revoked");
        Ok(revoked)
    }

    pub async fn active_delegations(&self, delegator: Address) -> Result<Vec<DelegationRecord>, DelegationError> {
        Ok(self.store.active_delegations(delegator, self.clock.now()).await?)
    }

    /// Persist the allocation set behind a delegated vote once the caller's
    /// transaction is known. Repeating the same allocation set is a no-op.
    pub async fn confirm_delegated_vote(
        &self,
        result: &AllocationResult,
        support: u8,
        tx_hash: Option<B256>,
    ) -> Result<(), DelegationError> {
        let record = DelegatedVoteRecord {
            proposal_id: result.proposal_id,
            delegate: result.delegate,
            support,
            amount: result.amount,
            allocations_hash: result.allocations_hash,
            allocations: result.allocations.clone(),
            tx_hash,
            created_at: unix_to_datetime(self.clock.now()),
        };
        self.store.insert_delegated_vote(&record).await?;
        Ok(())
    }

    pub async fn set_delegate_opt_in(&self, delegate: Address, opted_in: bool) -> Result<(), DelegationError> {
        self.store.set_delegate_opt_in(delegate, opted_in).await?;
        info!(delegate = %delegate, opted_in = opted_in, "delegate opt-in updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::{allocations_hash, Allocation};
    use crate::clock::FixedClock;
    use crate::config::ChainConfig;
    use crate::signer::packed::revocation_hash;
    use crate::signer::typed::signing_hash;
    use crate::store::MemoryStore;
    use alloy::signers::local::PrivateKeySigner;
    use alloy::signers::SignerSync;

    const NOW: u64 = 1_700_000_000;

    struct Fixture {
        service: DelegationService,
        store: Arc<MemoryStore>,
        key: PrivateKeySigner,
        clock: Arc<FixedClock>,
    }

    async fn fixture() -> Fixture {
        let clock = Arc::new(FixedClock::new(NOW));
        let store = Arc::new(MemoryStore::new());
        let signer = Arc::new(ApprovalSigner::verifier(&ChainConfig::default(), clock.clone()));
        let service = DelegationService::new(store.clone(), signer, clock.clone());
        for d in [0xd1u8, 0xd2] {
            service.set_delegate_opt_in(Address::repeat_byte(d), true).await.unwrap();
        }
        Fixture {
            service,
            store,
            key: PrivateKeySigner::random(),
            clock,
        }
    }

    fn signed(key: &PrivateKeySigner, delegate: Address, vp_amount: u64, nonce: u64) -> DelegationInput {
        let mut input = DelegationInput {
            delegator: key.address(),
            delegate,
            vp_amount: U256::from(vp_amount),
            nonce,
            expiry: NOW + 3_600,
            signature: Bytes::new(),
        };
        let hash = signing_hash(&input.message(), "ChainMirror", "1", 8453);
        let sig = key.sign_hash_sync(&hash).unwrap();
        input.signature = Bytes::from(sig.as_bytes().to_vec());
        input
    }

    #[tokio::test]
    async fn test_nonce_must_increase() {
        let f = fixture().await;
        let delegate = Address::repeat_byte(0xd1);
        assert_eq!(f.service.store_delegation(&signed(&f.key, delegate, 10, 1)).await.unwrap(), 8453);

        let replay = f.service.store_delegation(&signed(&f.key, delegate, 10, 1)).await;
        assert!(matches!(replay, Err(DelegationError::InvalidNonce { expected: 2 })));
        f.service.store_delegation(&signed(&f.key, delegate, 10, 5)).await.unwrap();
    }

    /// Holds every `insert_delegation` until `parties` callers have reached
    /// it, so concurrent submissions all pass the nonce pre-check first.
    struct GatedStore {
        inner: MemoryStore,
        gate: tokio::sync::Barrier,
    }

    #[async_trait::async_trait]
    impl MirrorStore for GatedStore {
        async fn ping(&self) -> Result<(), StoreError> {
            self.inner.ping().await
        }

        async fn upsert(&self, write: &crate::store::EntityWrite) -> Result<crate::store::UpsertOutcome, StoreError> {
            self.inner.upsert(write).await
        }

        async fn get(&self, kind: crate::store::EntityKind, id: &str) -> Result<Option<crate::store::MirrorRow>, StoreError> {
            self.inner.get(kind, id).await
        }

        async fn active_ids(
            &self,
            kind: crate::store::EntityKind,
            statuses: &[&str],
            after: Option<&str>,
            limit: usize,
        ) -> Result<Vec<String>, StoreError> {
            self.inner.active_ids(kind, statuses, after, limit).await
        }

        async fn update_fields(
            &self,
            kind: crate::store::EntityKind,
            id: &str,
            fields: &[crate::store::Field],
        ) -> Result<(), StoreError> {
            self.inner.update_fields(kind, id, fields).await
        }

        async fn count(&self, kind: crate::store::EntityKind, status: Option<&str>) -> Result<u64, StoreError> {
            self.inner.count(kind, status).await
        }

        async fn is_delegate_opted_in(&self, delegate: Address) -> Result<bool, StoreError> {
            self.inner.is_delegate_opted_in(delegate).await
        }

        async fn set_delegate_opt_in(&self, delegate: Address, opted_in: bool) -> Result<(), StoreError> {
            self.inner.set_delegate_opt_in(delegate, opted_in).await
        }

        async fn max_delegation_nonce(&self, delegator: Address) -> Result<Option<u64>, StoreError> {
            self.inner.max_delegation_nonce(delegator).await
        }

        async fn insert_delegation(&self, record: &DelegationRecord, now: u64) -> Result<(), StoreError> {
            self.gate.wait().await;
            self.inner.insert_delegation(record, now).await
        }

        async fn revoke_delegations(
            &self,
            delegator: Address,
            delegate: Option<Address>,
            at: DateTime<Utc>,
        ) -> Result<u64, StoreError> {
            self.inner.revoke_delegations(delegator, delegate, at).await
        }

        async fn active_delegations(&self, delegator: Address, now: u64) -> Result<Vec<DelegationRecord>, StoreError> {
            self.inner.active_delegations(delegator, now).await
        }

        async fn insert_delegated_vote(&self, record: &crate::store::DelegatedVoteRecord) -> Result<(), StoreError> {
            self.inner.insert_delegated_vote(record).await
        }
    }

    #[tokio::test]
    async fn test_concurrent_same_nonce_single_winner() {
        let clock = Arc::new(FixedClock::new(NOW));
        let store = Arc::new(GatedStore {
            inner: MemoryStore::new(),
            gate: tokio::sync::Barrier::new(2),
        });
        let signer = Arc::new(ApprovalSigner::verifier(&ChainConfig::default(), clock.clone()));
        let service = DelegationService::new(store.clone(), signer, clock);
        for d in [0xd1u8, 0xd2] {
            service.set_delegate_opt_in(Address::repeat_byte(d), true).await.unwrap();
        }
        let key = PrivateKeySigner::random();
        let first = signed(&key, Address::repeat_byte(0xd1), 10, 1);
        let second = signed(&key, Address::repeat_byte(0xd2), 20, 1);

        // Both pass the pre-check with expected nonce 0; the store decides.
        let (a, b) = tokio::join!(service.store_delegation(&first), service.store_delegation(&second));

        let results = [a, b];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(DelegationError::InvalidNonce { expected: 2 }))));
        assert_eq!(store.inner.max_delegation_nonce(key.address()).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_full_delegation_replaces_previous_full() {
        let f = fixture().await;
        let (d1, d2) = (Address::repeat_byte(0xd1), Address::repeat_byte(0xd2));
        f.service.store_delegation(&signed(&f.key, d1, 0, 1)).await.unwrap();
        f.service.store_delegation(&signed(&f.key, d2, 50, 2)).await.unwrap();
        f.service.store_delegation(&signed(&f.key, d2, 0, 3)).await.unwrap();

        let active = f.service.active_delegations(f.key.address()).await.unwrap();
        let summary: Vec<(Address, u64)> = active.iter().map(|d| (d.delegate, d.nonce)).collect();
        // The partial delegation survives; only the earlier full one is revoked.
        assert_eq!(summary, vec![(d2, 2), (d2, 3)]);
    }

    #[tokio::test]
    async fn test_rejections_in_order() {
        let f = fixture().await;
        let delegate = Address::repeat_byte(0xd1);

        let mut expired = signed(&f.key, delegate, 10, 1);
        expired.expiry = NOW - 1;
        assert!(matches!(
            f.service.store_delegation(&expired).await,
            Err(DelegationError::Expired { .. })
        ));

        let mut forged = signed(&f.key, delegate, 10, 1);
        forged.vp_amount = U256::from(11u64);
        assert!(matches!(
            f.service.store_delegation(&forged).await,
            Err(DelegationError::InvalidSignature)
        ));

        let stranger = Address::repeat_byte(0xee);
        assert!(matches!(
            f.service.store_delegation(&signed(&f.key, stranger, 10, 1)).await,
            Err(DelegationError::DelegateNotOptedIn(a)) if a == stranger
        ));
    }

    #[tokio::test]
    async fn test_revocation_checks_signature_and_window() {
        let f = fixture().await;
        let delegate = Address::repeat_byte(0xd1);
        f.service.store_delegation(&signed(&f.key, delegate, 10, 1)).await.unwrap();

        let ts = NOW - 10;
        let sig = f
            .key
            .sign_message_sync(revocation_hash(f.key.address(), None, ts).as_slice())
            .unwrap();
        let other = PrivateKeySigner::random()
            .sign_message_sync(revocation_hash(f.key.address(), None, ts).as_slice())
            .unwrap();
        assert!(matches!(
            f.service.revoke_delegation(f.key.address(), None, ts, &other.as_bytes()).await,
            Err(DelegationError::InvalidSignature)
        ));

        f.clock.advance(400);
        assert!(f
            .service
            .revoke_delegation(f.key.address(), None, ts, &sig.as_bytes())
            .await
            .is_err());

        f.clock.set(NOW);
        assert_eq!(
            f.service.revoke_delegation(f.key.address(), None, ts, &sig.as_bytes()).await.unwrap(),
            1
        );
        assert!(f.service.active_delegations(f.key.address()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_confirm_delegated_vote_idempotent() {
        let f = fixture().await;
        let delegate = Address::repeat_byte(0xd1);
        let allocations = vec![Allocation {
            delegator: f.key.address(),
            power_used: U256::from(40u64),
        }];
        let result = AllocationResult {
            proposal_id: U256::from(4u64),
            delegate,
            amount: U256::from(40u64),
            allocations_hash: allocations_hash(U256::from(4u64), delegate, &allocations),
            allocations,
        };
        f.service.confirm_delegated_vote(&result, 1, None).await.unwrap();
        f.service.confirm_delegated_vote(&result, 1, Some(B256::repeat_byte(1))).await.unwrap();

        let votes = f.store.delegated_votes();
        assert_eq!(votes.len(), 1);
        assert_eq!(votes[0].tx_hash, None);
    }
}
