//! Approval signing for privileged on-chain actions.
//!
//! Two schemes:
//! - packed hash ([`packed`]): `keccak256(abi.encodePacked(...))` ending in an
//!   expiry, signed with the EIP-191 personal prefix
//! - typed data ([`typed`]): EIP-712 structs under a `{name, version, chainId}`
//!   domain, used for delegation and profile attestations
//!
//! Freshness rules:
//! - expiry-based messages are refused once `now > expiry`
//! - client timestamps may be at most 60s ahead and no older than the TTL
//! - revocations use a fixed 300s window

pub mod packed;
pub mod typed;

pub use packed::{DelegatedVoteMessage, RewardClaim};
pub use typed::{Delegation, ProfileUpdate};

use crate::clock::Clock;
use crate::config::{ChainConfig, SignerConfig};

use alloy::primitives::{Address, Bytes, Signature, B256, U256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use alloy::sol_types::SolStruct;
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// How far a client timestamp may run ahead of our clock.
pub const MAX_FUTURE_SKEW_SECS: u64 = 60;
/// Fixed acceptance window for revocation timestamps.
pub const REVOCATION_WINDOW_SECS: u64 = 300;

#[derive(Error, Debug)]
pub enum SignerError {
    #[error("no signing key configured")]
    MissingKey,
    #[error("invalid signing key: {0}")]
    InvalidKey(String),
    #[error("signing failed: {0}")]
    Signing(#[from] alloy::signers::Error),
    #[error("expired at {expiry} (now {now})")]
    Expired { expiry: u64, now: u64 },
    #[error("timestamp {timestamp} is in the future (now {now})")]
    TimestampInFuture { timestamp: u64, now: u64 },
    #[error("timestamp {timestamp} is older than {max_age_secs}s (now {now})")]
    TimestampStale { timestamp: u64, now: u64, max_age_secs: u64 },
    #[error("signature does not match")]
    InvalidSignature,
}

/// A signed packed-hash approval, ready to hand to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignedApproval {
    pub hash: B256,
    pub signature: Bytes,
    pub signer: Address,
    pub expiry: u64,
}

pub struct ApprovalSigner {
    key: Option<PrivateKeySigner>,
    clock: Arc<dyn Clock>,
    eip712_name: String,
    eip712_version: String,
    chain_id: u64,
    verification_chain_ids: Vec<u64>,
    timestamp_ttl_secs: u64,
}

impl ApprovalSigner {
    pub fn from_config(signer: &SignerConfig, chain: &ChainConfig, clock: Arc<dyn Clock>) -> Result<Self, SignerError> {
        let key = if signer.private_key.is_empty() {
            None
        } else {
            let key = PrivateKeySigner::from_str(signer.private_key.trim())
                .map_err(|e| SignerError::InvalidKey(e.to_string()))?;
            info!(address = %key.address(), "approval signer loaded");
            Some(key)
        };
        Ok(Self {
            key,
            clock,
            eip712_name: signer.eip712_name.clone(),
            eip712_version: signer.eip712_version.clone(),
            chain_id: chain.chain_id,
            verification_chain_ids: chain.verification_chain_ids(),
            timestamp_ttl_secs: signer.timestamp_ttl_secs,
        })
    }

    /// A verify-only signer.
    pub fn verifier(chain: &ChainConfig, clock: Arc<dyn Clock>) -> Self {
        let defaults = SignerConfig::default();
        Self {
            key: None,
            clock,
            eip712_name: defaults.eip712_name,
            eip712_version: defaults.eip712_version,
            chain_id: chain.chain_id,
            verification_chain_ids: chain.verification_chain_ids(),
            timestamp_ttl_secs: defaults.timestamp_ttl_secs,
        }
    }

    pub fn address(&self) -> Option<Address> {
        self.key.as_ref().map(|k| k.address())
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    fn key(&self) -> Result<&PrivateKeySigner, SignerError> {
        self.key.as_ref().ok_or(SignerError::MissingKey)
    }

    pub fn check_expiry(&self, expiry: u64) -> Result<(), SignerError> {
        let now = self.clock.now();
        if now > expiry {
            return Err(SignerError::Expired { expiry, now });
        }
        Ok(())
    }

    /// Reject timestamps more than 60s ahead or older than `max_age_secs`.
    pub fn check_timestamp(&self, timestamp: u64, max_age_secs: u64) -> Result<(), SignerError> {
        let now = self.clock.now();
        if timestamp > now.saturating_add(MAX_FUTURE_SKEW_SECS) {
            return Err(SignerError::TimestampInFuture { timestamp, now });
        }
        if now.saturating_sub(timestamp) > max_age_secs {
            return Err(SignerError::TimestampStale {
                timestamp,
                now,
                max_age_secs,
            });
        }
        Ok(())
    }

    /// EIP-191 signature over a 32-byte message hash.
    fn sign_packed(&self, hash: B256, expiry: u64) -> Result<SignedApproval, SignerError> {
        self.check_expiry(expiry)?;
        let key = self.key()?;
        let signature = key.sign_message_sync(hash.as_slice())?;
        debug!(hash = %hash, expiry = expiry, "signed packed approval");
        Ok(SignedApproval {
            hash,
            signature: Bytes::from(signature.as_bytes().to_vec()),
            signer: key.address(),
            expiry,
        })
    }

    pub fn sign_approval(&self, subject: Address, action: &str, expiry: u64) -> Result<SignedApproval, SignerError> {
        self.sign_packed(packed::threshold_approval_hash(subject, action, expiry), expiry)
    }

    pub fn sign_delegated_vote(&self, msg: &DelegatedVoteMessage) -> Result<SignedApproval, SignerError> {
        self.sign_packed(packed::delegated_vote_hash(msg), msg.expiry)
    }

    pub fn sign_claim_approval(
        &self,
        user: Address,
        claims: &[RewardClaim],
        expiry: u64,
    ) -> Result<SignedApproval, SignerError> {
        self.sign_packed(packed::claim_hash(user, claims, expiry), expiry)
    }

    pub fn sign_auction_settlement(
        &self,
        auction_id: U256,
        winner: Address,
        amount: U256,
        expiry: u64,
    ) -> Result<SignedApproval, SignerError> {
        self.sign_packed(packed::auction_settlement_hash(auction_id, winner, amount, expiry), expiry)
    }

    /// Check a delegator's revocation: signature over the packed revocation
    /// message, and a timestamp inside the revocation window.
    pub fn verify_revocation_signature(
        &self,
        delegator: Address,
        delegate: Option<Address>,
        timestamp: u64,
        signature: &[u8],
    ) -> bool {
        if self.check_timestamp(timestamp, REVOCATION_WINDOW_SECS).is_err() {
            return false;
        }
        recover_personal(packed::revocation_hash(delegator, delegate, timestamp), signature)
            .map_or(false, |signer| signer == delegator)
    }

    /// Sign typed data under `chain_id` (the configured one when `None`).
    pub fn sign_typed<T: SolStruct>(&self, message: &T, chain_id: Option<u64>) -> Result<Bytes, SignerError> {
        let chain_id = chain_id.unwrap_or(self.chain_id);
        let hash = typed::signing_hash(message, &self.eip712_name, &self.eip712_version, chain_id);
        let signature = self.key()?.sign_hash_sync(&hash)?;
        Ok(Bytes::from(signature.as_bytes().to_vec()))
    }

    /// First allow-listed chain id under which `expected` signed `message`.
    pub fn verify_typed<T: SolStruct>(&self, message: &T, signature: &[u8], expected: Address) -> Option<u64> {
        typed::verify(
            message,
            signature,
            expected,
            &self.eip712_name,
            &self.eip712_version,
            &self.verification_chain_ids,
        )
    }

    pub fn verify_typed_for_chain<T: SolStruct>(
        &self,
        message: &T,
        signature: &[u8],
        expected: Address,
        chain_id: u64,
    ) -> bool {
        typed::verify_for_chain(
            message,
            signature,
            expected,
            &self.eip712_name,
            &self.eip712_version,
            chain_id,
        )
    }

    /// Verify a profile update: fresh timestamp, then a signature by `wallet`.
    pub fn verify_profile_update(&self, update: &ProfileUpdate, signature: &[u8]) -> Result<u64, SignerError> {
        let timestamp: u64 = update.timestamp.try_into().unwrap_or(u64::MAX);
        self.check_timestamp(timestamp, self.timestamp_ttl_secs)?;
        self.verify_typed(update, signature, update.wallet)
            .ok_or(SignerError::InvalidSignature)
    }

    pub fn eip712_config(&self, chain_id: Option<u64>) -> serde_json::Value {
        typed::config_json(
            &self.eip712_name,
            &self.eip712_version,
            chain_id.unwrap_or(self.chain_id),
        )
    }
}

/// Recover the EIP-191 signer of a 32-byte message hash.
pub fn recover_personal(hash: B256, signature: &[u8]) -> Option<Address> {
    let sig = Signature::try_from(signature).ok()?;
    sig.recover_address_from_msg(hash.as_slice()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;

    const NOW: u64 = 1_700_000_000;
    const KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    fn chain(ids: Vec<u64>) -> ChainConfig {
        ChainConfig {
            chain_id: 8453,
            allowed_chain_ids: ids,
            ..ChainConfig::default()
        }
    }

    fn signer_with(clock: Arc<FixedClock>, ids: Vec<u64>) -> ApprovalSigner {
        let cfg = SignerConfig {
            private_key: KEY.to_string(),
            ..SignerConfig::default()
        };
        ApprovalSigner::from_config(&cfg, &chain(ids), clock).unwrap()
    }

    fn signer() -> (ApprovalSigner, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(NOW));
        (signer_with(clock.clone(), vec![]), clock)
    }

    #[test]
    fn test_approval_recovers_to_signer() {
        let (signer, _) = signer();
        let subject = Address::repeat_byte(0x11);
        let approval = signer.sign_approval(subject, "stake", NOW + 300).unwrap();

        assert_eq!(approval.hash, packed::threshold_approval_hash(subject, "stake", NOW + 300));
        assert_eq!(approval.signature.len(), 65);
        assert_eq!(recover_personal(approval.hash, &approval.signature), signer.address());
    }

    #[test]
    fn test_expiry_boundary() {
        let (signer, clock) = signer();
        let subject = Address::repeat_byte(0x11);

        // now == expiry is still valid
        assert!(signer.sign_approval(subject, "claim", NOW).is_ok());
        clock.advance(1);
        assert!(matches!(
            signer.sign_approval(subject, "claim", NOW),
            Err(SignerError::Expired { .. })
        ));
    }

    #[test]
    fn test_missing_key() {
        let signer = ApprovalSigner::verifier(&chain(vec![]), Arc::new(FixedClock::new(NOW)));
        assert!(matches!(
            signer.sign_approval(Address::ZERO, "stake", NOW + 1),
            Err(SignerError::MissingKey)
        ));
    }

    #[test]
    fn test_timestamp_window() {
        let (signer, _) = signer();
        assert!(signer.check_timestamp(NOW + 60, 300).is_ok());
        assert!(matches!(
            signer.check_timestamp(NOW + 61, 300),
            Err(SignerError::TimestampInFuture { .. })
        ));
        assert!(signer.check_timestamp(NOW - 300, 300).is_ok());
        assert!(matches!(
            signer.check_timestamp(NOW - 301, 300),
            Err(SignerError::TimestampStale { .. })
        ));
    }

    #[test]
    fn test_revocation_window() {
        let (signer, _) = signer();
        let delegator_key = PrivateKeySigner::random();
        let delegator = delegator_key.address();
        let sign = |ts: u64| {
            let hash = packed::revocation_hash(delegator, None, ts);
            delegator_key.sign_message_sync(hash.as_slice()).unwrap().as_bytes().to_vec()
        };

        assert!(signer.verify_revocation_signature(delegator, None, NOW - 100, &sign(NOW - 100)));
        assert!(!signer.verify_revocation_signature(delegator, None, NOW - 400, &sign(NOW - 400)));
        // Signature for a different timestamp does not verify.
        assert!(!signer.verify_revocation_signature(delegator, None, NOW - 50, &sign(NOW - 100)));
        // Signed by someone else.
        assert!(!signer.verify_revocation_signature(Address::repeat_byte(9), None, NOW - 100, &sign(NOW - 100)));
    }

    #[test]
    fn test_typed_verify_returns_first_matching_chain() {
        let clock = Arc::new(FixedClock::new(NOW));
        let signer = signer_with(clock, vec![84532, 8453]);
        let wallet = PrivateKeySigner::random();
        let msg = Delegation {
            delegator: wallet.address(),
            delegate: Address::repeat_byte(2),
            vpAmount: U256::ZERO,
            nonce: U256::from(1u64),
            expiry: U256::from(NOW + 3600),
        };
        let hash = typed::signing_hash(&msg, "ChainMirror", "1", 8453);
        let sig = wallet.sign_hash_sync(&hash).unwrap().as_bytes();

        assert_eq!(signer.verify_typed(&msg, &sig, wallet.address()), Some(8453));
        assert!(signer.verify_typed_for_chain(&msg, &sig, wallet.address(), 8453));
        assert!(!signer.verify_typed_for_chain(&msg, &sig, wallet.address(), 84532));
        assert_eq!(signer.verify_typed(&msg, &sig, Address::repeat_byte(7)), None);
    }

    #[test]
    fn test_profile_update_requires_fresh_timestamp() {
        let (signer, clock) = signer();
        let wallet = PrivateKeySigner::random();
        let update = ProfileUpdate {
            wallet: wallet.address(),
            displayName: "ada".to_string(),
            avatarUri: "ipfs://avatar".to_string(),
            timestamp: U256::from(NOW),
        };
        let hash = typed::signing_hash(&update, "ChainMirror", "1", 8453);
        let sig = wallet.sign_hash_sync(&hash).unwrap().as_bytes();

        assert_eq!(signer.verify_profile_update(&update, &sig).unwrap(), 8453);
        clock.advance(301);
        assert!(matches!(
            signer.verify_profile_update(&update, &sig),
            Err(SignerError::TimestampStale { .. })
        ));
    }
}
