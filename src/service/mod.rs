//! Approval surface handed to the route layer.

use crate::allocation::{AllocationEngine, AllocationError, AllocationResult};
use crate::delegation::{DelegationError, DelegationInput, DelegationService};
use crate::signer::{
    ApprovalSigner, DelegatedVoteMessage, ProfileUpdate, RewardClaim, SignedApproval, SignerError,
};

use alloy::primitives::{Address, B256, U256};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error(transparent)]
    Signer(#[from] SignerError),
    #[error(transparent)]
    Delegation(#[from] DelegationError),
}

pub struct ApprovalService {
    engine: AllocationEngine,
    signer: Arc<ApprovalSigner>,
    delegations: DelegationService,
}

impl ApprovalService {
    pub fn new(engine: AllocationEngine, signer: Arc<ApprovalSigner>, delegations: DelegationService) -> Self {
        Self {
            engine,
            signer,
            delegations,
        }
    }

    pub fn signer(&self) -> &ApprovalSigner {
        &self.signer
    }

    pub fn delegations(&self) -> &DelegationService {
        &self.delegations
    }

    pub async fn compute_allocations(
        &self,
        delegate: Address,
        proposal_id: U256,
        amount: U256,
    ) -> Result<AllocationResult, ServiceError> {
        Ok(self.engine.compute(delegate, proposal_id, amount).await?)
    }

    pub fn sign_approval(&self, subject: Address, action: &str, expiry: u64) -> Result<SignedApproval, ServiceError> {
        Ok(self.signer.sign_approval(subject, action, expiry)?)
    }

    pub fn sign_delegated_vote(&self, msg: &DelegatedVoteMessage) -> Result<SignedApproval, ServiceError> {
        Ok(self.signer.sign_delegated_vote(msg)?)
    }

    /// Allocate `amount` across the delegate's delegators and sign a vote
    /// authorization committing to that allocation set.
    pub async fn authorize_delegated_vote(
        &self,
        delegate: Address,
        proposal_id: U256,
        amount: U256,
        support: u8,
        nonce: U256,
        expiry: u64,
    ) -> Result<(AllocationResult, SignedApproval), ServiceError> {
        self.signer.check_expiry(expiry)?;
        let allocation = self.engine.compute(delegate, proposal_id, amount).await?;
        let approval = self.signer.sign_delegated_vote(&DelegatedVoteMessage {
            delegate,
            proposal_id,
            amount,
            support,
            allocations_hash: allocation.allocations_hash,
            nonce,
            expiry,
        })?;
        Ok((allocation, approval))
    }

    pub fn sign_claim_approval(
        &self,
        user: Address,
        claims: &[RewardClaim],
        expiry: u64,
    ) -> Result<SignedApproval, ServiceError> {
        Ok(self.signer.sign_claim_approval(user, claims, expiry)?)
    }

    pub fn sign_auction_settlement(
        &self,
        auction_id: U256,
        winner: Address,
        amount: U256,
        expiry: u64,
    ) -> Result<SignedApproval, ServiceError> {
        Ok(self.signer.sign_auction_settlement(auction_id, winner, amount, expiry)?)
    }

    pub fn verify_revocation_signature(
        &self,
        delegator: Address,
        delegate: Option<Address>,
        timestamp: u64,
        signature: &[u8],
    ) -> bool {
        self.signer
            .verify_revocation_signature(delegator, delegate, timestamp, signature)
    }

    pub fn verify_profile_update(&self, update: &ProfileUpdate, signature: &[u8]) -> Result<u64, ServiceError> {
        Ok(self.signer.verify_profile_update(update, signature)?)
    }

    pub async fn store_delegation(&self, input: &DelegationInput) -> Result<u64, ServiceError> {
        Ok(self.delegations.store_delegation(input).await?)
    }

    pub async fn revoke_delegation(
        &self,
        delegator: Address,
        delegate: Option<Address>,
        timestamp: u64,
        signature: &[u8],
    ) -> Result<u64, ServiceError> {
        Ok(self
            .delegations
            .revoke_delegation(delegator, delegate, timestamp, signature)
            .await?)
    }

    pub async fn confirm_delegated_vote(
        &self,
        result: &AllocationResult,
        support: u8,
        tx_hash: Option<B256>,
    ) -> Result<(), ServiceError> {
        Ok(self.delegations.confirm_delegated_vote(result, support, tx_hash).await?)
    }

    pub fn eip712_config(&self, chain_id: Option<u64>) -> serde_json::Value {
        self.signer.eip712_config(chain_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::{DelegationSnapshot, DelegationSource, DelegatorPower};
    use crate::clock::FixedClock;
    use crate::config::{ChainConfig, SignerConfig};
    use crate::signer::packed::delegated_vote_hash;
    use crate::signer::recover_personal;
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    const NOW: u64 = 1_700_000_000;
    const KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    struct StaticSource(DelegationSnapshot);

    #[async_trait]
    impl DelegationSource for StaticSource {
        async fn snapshot(&self, _delegate: Address, _proposal_id: U256) -> Result<DelegationSnapshot, AllocationError> {
            Ok(self.0.clone())
        }
    }

    fn service() -> ApprovalService {
        let clock = Arc::new(FixedClock::new(NOW));
        let signer_config = SignerConfig {
            private_key: KEY.to_string(),
            ..SignerConfig::default()
        };
        let signer = Arc::new(ApprovalSigner::from_config(&signer_config, &ChainConfig::default(), clock.clone()).unwrap());
        let snapshot = DelegationSnapshot {
            delegators: vec![
                DelegatorPower {
                    delegator: Address::repeat_byte(0xaa),
                    power: U256::from(100u64),
                    used: U256::ZERO,
                },
                DelegatorPower {
                    delegator: Address::repeat_byte(0xbb),
                    power: U256::from(300u64),
                    used: U256::ZERO,
                },
            ],
            total_power: U256::from(400u64),
            already_used: U256::ZERO,
        };
        let store = Arc::new(MemoryStore::new());
        ApprovalService::new(
            AllocationEngine::new(Arc::new(StaticSource(snapshot))),
            signer.clone(),
            DelegationService::new(store, signer, clock),
        )
    }

    #[tokio::test]
    async fn test_authorized_vote_commits_to_allocations() {
        let svc = service();
        let delegate = Address::repeat_byte(0x99);
        let (allocation, approval) = svc
            .authorize_delegated_vote(delegate, U256::from(3u64), U256::from(250u64), 1, U256::from(1u64), NOW + 600)
            .await
            .unwrap();

        let expected = delegated_vote_hash(&DelegatedVoteMessage {
            delegate,
            proposal_id: U256::from(3u64),
            amount: U256::from(250u64),
            support: 1,
            allocations_hash: allocation.allocations_hash,
            nonce: U256::from(1u64),
            expiry: NOW + 600,
        });
        assert_eq!(approval.hash, expected);
        assert_eq!(recover_personal(approval.hash, &approval.signature), svc.signer().address());
    }

    #[tokio::test]
    async fn test_errors_surface_by_kind() {
        let svc = service();
        let too_much = svc
            .compute_allocations(Address::repeat_byte(0x99), U256::from(3u64), U256::from(401u64))
            .await;
        assert!(matches!(
            too_much,
            Err(ServiceError::Allocation(AllocationError::InsufficientPower { .. }))
        ));

        let expired = svc.sign_approval(Address::repeat_byte(1), "stake", NOW - 1);
        assert!(matches!(expired, Err(ServiceError::Signer(SignerError::Expired { .. }))));
    }

    #[test]
    fn test_eip712_config_uses_requested_chain() {
        let svc = service();
        assert_eq!(svc.eip712_config(None)["domain"]["chainId"], 8453);
        assert_eq!(svc.eip712_config(Some(84532))["domain"]["chainId"], 84532);
    }
}
