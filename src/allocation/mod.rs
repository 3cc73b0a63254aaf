//! Proportional vote-power allocation for delegated votes.
//!
//! When a delegate casts `amount` of delegated power on a proposal, the
//! contract splits it across the delegate's delegators in proportion to their
//! power, capped by what each has not yet spent on that proposal. The same
//! split is computed here so its commitment hash can be signed up front and
//! checked on-chain.
//!
//! Pass 1 gives each delegator `floor(amount * power / total)`, clamped to
//! its remaining power and to the amount still unallocated. Pass 2 walks the
//! list again and hands out the truncation remainder up to each delegator's
//! remaining capacity. The result is sorted by delegator address and hashed
//! as `keccak256(abi.encode(proposalId, delegate, (address,uint256)[]))`.

use crate::chain::abi::IVotePower;
use crate::chain::{call_contract, ChainConnection, ChainError};

use alloy::primitives::{keccak256, Address, B256, U256};
use alloy::sol;
use alloy::sol_types::SolValue;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

sol! {
    /// ABI shape of one allocation inside the commitment hash.
    struct AllocationEntry {
        address delegator;
        uint256 powerUsed;
    }
}

#[derive(Error, Debug)]
pub enum AllocationError {
    #[error("amount must be greater than zero")]
    ZeroAmount,
    #[error("delegate has no delegators")]
    NoDelegators,
    #[error("delegate has no delegated power")]
    NoPower,
    #[error("insufficient power: requested {requested}, available {available}")]
    InsufficientPower { requested: U256, available: U256 },
    #[error("arithmetic overflow computing shares")]
    Overflow,
    #[error(transparent)]
    Chain(#[from] ChainError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub delegator: Address,
    pub power_used: U256,
}

/// One delegator's standing for a proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegatorPower {
    pub delegator: Address,
    pub power: U256,
    /// Already spent by this delegator on the proposal.
    pub used: U256,
}

impl DelegatorPower {
    pub fn available(&self) -> U256 {
        self.power.saturating_sub(self.used)
    }
}

/// Everything the algorithm reads, fetched in one go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegationSnapshot {
    /// In the contract's list order.
    pub delegators: Vec<DelegatorPower>,
    pub total_power: U256,
    /// Delegated power the delegate already cast on the proposal.
    pub already_used: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllocationResult {
    pub proposal_id: U256,
    pub delegate: Address,
    pub amount: U256,
    pub allocations: Vec<Allocation>,
    pub allocations_hash: B256,
}

/// Split `amount` across the snapshot's delegators.
///
/// Zero allocations are dropped; the rest are sorted by address.
pub fn allocate(snapshot: &DelegationSnapshot, amount: U256) -> Result<Vec<Allocation>, AllocationError> {
    if amount.is_zero() {
        return Err(AllocationError::ZeroAmount);
    }
    if snapshot.delegators.is_empty() {
        return Err(AllocationError::NoDelegators);
    }
    if snapshot.total_power.is_zero() {
        return Err(AllocationError::NoPower);
    }
    let available = snapshot.total_power.saturating_sub(snapshot.already_used);
    if amount > available {
        return Err(AllocationError::InsufficientPower {
            requested: amount,
            available,
        });
    }

    let mut shares = vec![U256::ZERO; snapshot.delegators.len()];
    let mut remaining = amount;

    for (share, d) in shares.iter_mut().zip(&snapshot.delegators) {
        if remaining.is_zero() {
            break;
        }
        let proportional = amount
            .checked_mul(d.power)
            .ok_or(AllocationError::Overflow)?
            / snapshot.total_power;
        let take = proportional.min(d.available()).min(remaining);
        *share = take;
        remaining -= take;
    }

    for (share, d) in shares.iter_mut().zip(&snapshot.delegators) {
        if remaining.is_zero() {
            break;
        }
        let capacity = d.available().saturating_sub(*share);
        let take = capacity.min(remaining);
        *share += take;
        remaining -= take;
    }

    if !remaining.is_zero() {
        return Err(AllocationError::InsufficientPower {
            requested: amount,
            available: amount - remaining,
        });
    }

    let mut allocations: Vec<Allocation> = snapshot
        .delegators
        .iter()
        .zip(shares)
        .filter(|(_, share)| !share.is_zero())
        .map(|(d, share)| Allocation {
            delegator: d.delegator,
            power_used: share,
        })
        .collect();
    allocations.sort_by(|a, b| a.delegator.cmp(&b.delegator));
    Ok(allocations)
}

/// Commitment hash the contract recomputes from the submitted allocations.
pub fn allocations_hash(proposal_id: U256, delegate: Address, allocations: &[Allocation]) -> B256 {
    let entries: Vec<AllocationEntry> = allocations
        .iter()
        .map(|a| AllocationEntry {
            delegator: a.delegator,
            powerUsed: a.power_used,
        })
        .collect();
    keccak256((proposal_id, delegate, entries).abi_encode_params())
}

/// Where delegation state comes from.
#[async_trait]
pub trait DelegationSource: Send + Sync {
    async fn snapshot(&self, delegate: Address, proposal_id: U256) -> Result<DelegationSnapshot, AllocationError>;
}

/// Reads delegation state from the VotePower contract.
pub struct ChainDelegationSource {
    connection: ChainConnection,
    vote_power: Address,
}

impl ChainDelegationSource {
    pub fn new(connection: ChainConnection, vote_power: Address) -> Self {
        Self {
            connection,
            vote_power,
        }
    }
}

#[async_trait]
impl DelegationSource for ChainDelegationSource {
    async fn snapshot(&self, delegate: Address, proposal_id: U256) -> Result<DelegationSnapshot, AllocationError> {
        let client = self.connection.get().await?;
        let client = client.as_ref();
        let to = self.vote_power;

        let list = call_contract(client, to, &IVotePower::getDelegatorsCall { delegate }).await?;
        let total_power =
            call_contract(client, to, &IVotePower::totalDelegatedPowerCall { delegate }).await?;
        let already_used = call_contract(
            client,
            to,
            &IVotePower::proposalPowerUsedCall {
                proposalId: proposal_id,
                delegate,
            },
        )
        .await?;

        let mut delegators = Vec::with_capacity(list.len());
        for delegator in list {
            let power = call_contract(client, to, &IVotePower::delegatedPowerCall { delegator }).await?;
            let used = call_contract(
                client,
                to,
                &IVotePower::delegatorPowerUsedCall {
                    proposalId: proposal_id,
                    delegator,
                },
            )
            .await?;
            delegators.push(DelegatorPower {
                delegator,
                power,
                used,
            });
        }
        debug!(delegate = %delegate, delegators = delegators.len(), total = %total_power, "delegation snapshot");

        Ok(DelegationSnapshot {
            delegators,
            total_power,
            already_used,
        })
    }
}

pub struct AllocationEngine {
    source: Arc<dyn DelegationSource>,
}

impl AllocationEngine {
    pub fn new(source: Arc<dyn DelegationSource>) -> Self {
        Self { source }
    }

    pub async fn compute(
        &self,
        delegate: Address,
        proposal_id: U256,
        amount: U256,
    ) -> Result<AllocationResult, AllocationError> {
        if amount.is_zero() {
            return Err(AllocationError::ZeroAmount);
        }
        let snapshot = self.source.snapshot(delegate, proposal_id).await?;
        let allocations = allocate(&snapshot, amount)?;
        let hash = allocations_hash(proposal_id, delegate, &allocations);
        info!(
            delegate = %delegate,
            proposal = %proposal_id,
            amount = %amount,
            delegators = allocations.len(),
            hash = %hash,
            "allocations computed"
        );
        Ok(AllocationResult {
            proposal_id,
            delegate,
            amount,
            allocations,
            allocations_hash: hash,
        })
    }
}
