//! Packed-hash messages: `keccak256(abi.encodePacked(...))`, signed with the
//! EIP-191 personal-message prefix. Field order and widths must match the
//! verifying contracts byte for byte.

use alloy::primitives::{keccak256, Address, B256, U256};
use alloy::sol;
use alloy::sol_types::SolValue;
use serde::{Deserialize, Serialize};

pub const CLAIM_TAG: &str = "claimVoterRewards";
pub const REVOKE_TAG: &str = "REVOKE_DELEGATION";
pub const AUCTION_TAG: &str = "settleAuction";

sol! {
    /// One voter-reward claim line.
    #[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
    struct RewardClaim {
        uint256 proposalId;
        uint256 amount;
    }
}

/// Fields of a delegated-vote authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegatedVoteMessage {
    pub delegate: Address,
    pub proposal_id: U256,
    pub amount: U256,
    pub support: u8,
    pub allocations_hash: B256,
    pub nonce: U256,
    pub expiry: u64,
}

/// `(subject, action, expiry)`
pub fn threshold_approval_hash(subject: Address, action: &str, expiry: u64) -> B256 {
    keccak256((subject, action.to_string(), U256::from(expiry)).abi_encode_packed())
}

/// `(delegate, proposalId, amount, support, allocationsHash, nonce, expiry)`
///
/// `support` is a `uint8` and packs to a single byte.
pub fn delegated_vote_hash(msg: &DelegatedVoteMessage) -> B256 {
    let mut packed = Vec::with_capacity(20 + 32 * 5 + 1);
    packed.extend_from_slice(msg.delegate.as_slice());
    packed.extend_from_slice(&msg.proposal_id.to_be_bytes::<32>());
    packed.extend_from_slice(&msg.amount.to_be_bytes::<32>());
    packed.push(msg.support);
    packed.extend_from_slice(msg.allocations_hash.as_slice());
    packed.extend_from_slice(&msg.nonce.to_be_bytes::<32>());
    packed.extend_from_slice(&U256::from(msg.expiry).to_be_bytes::<32>());
    keccak256(packed)
}

/// `("claimVoterRewards", user, abi.encode(claims), expiry)`
pub fn claim_hash(user: Address, claims: &[RewardClaim], expiry: u64) -> B256 {
    let encoded_claims = claims.to_vec().abi_encode();
    let mut packed = (CLAIM_TAG.to_string(), user).abi_encode_packed();
    packed.extend_from_slice(&encoded_claims);
    packed.extend_from_slice(&U256::from(expiry).to_be_bytes::<32>());
    keccak256(packed)
}

/// `("REVOKE_DELEGATION", delegator, delegateOrZero, timestamp)`
pub fn revocation_hash(delegator: Address, delegate: Option<Address>, timestamp: u64) -> B256 {
    keccak256(
        (
            REVOKE_TAG.to_string(),
            delegator,
            delegate.unwrap_or(Address::ZERO),
            U256::from(timestamp),
        )
            .abi_encode_packed(),
    )
}

/// `("settleAuction", auctionId, winner, amount, expiry)`
pub fn auction_settlement_hash(auction_id: U256, winner: Address, amount: U256, expiry: u64) -> B256 {
    keccak256((AUCTION_TAG.to_string(), auction_id, winner, amount, U256::from(expiry)).abi_encode_packed())
}
