//! EIP-712 typed-data attestations.
//!
//! The domain carries `{name, version, chainId}` only. Verification walks an
//! allow-list of chain ids and accepts the first one under which the
//! recovered signer matches, so a signature made for any listed network is
//! accepted on all of them. [`verify_for_chain`] is the strict form.

use alloy::primitives::{Address, Signature, B256, U256};
use alloy::sol;
use alloy::sol_types::{Eip712Domain, SolStruct};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::borrow::Cow;

sol! {
    /// Off-chain delegation of voting power. `vpAmount == 0` delegates everything.
    #[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
    struct Delegation {
        address delegator;
        address delegate;
        uint256 vpAmount;
        uint256 nonce;
        uint256 expiry;
    }

    #[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
    struct ProfileUpdate {
        address wallet;
        string displayName;
        string avatarUri;
        uint256 timestamp;
    }
}

pub fn domain(name: &str, version: &str, chain_id: u64) -> Eip712Domain {
    Eip712Domain::new(
        Some(Cow::Owned(name.to_string())),
        Some(Cow::Owned(version.to_string())),
        Some(U256::from(chain_id)),
        None,
        None,
    )
}

pub fn signing_hash<T: SolStruct>(message: &T, name: &str, version: &str, chain_id: u64) -> B256 {
    message.eip712_signing_hash(&domain(name, version, chain_id))
}

/// Strict check against a single chain id.
pub fn verify_for_chain<T: SolStruct>(
    message: &T,
    signature: &[u8],
    expected: Address,
    name: &str,
    version: &str,
    chain_id: u64,
) -> bool {
    let Ok(sig) = Signature::try_from(signature) else {
        return false;
    };
    let hash = signing_hash(message, name, version, chain_id);
    matches!(sig.recover_address_from_prehash(&hash), Ok(signer) if signer == expected)
}

/// First chain id in `chain_ids` under which `expected` signed `message`.
pub fn verify<T: SolStruct>(
    message: &T,
    signature: &[u8],
    expected: Address,
    name: &str,
    version: &str,
    chain_ids: &[u64],
) -> Option<u64> {
    chain_ids
        .iter()
        .copied()
        .find(|chain_id| verify_for_chain(message, signature, expected, name, version, *chain_id))
}

/// `[{name, type}, ...]` parsed from the struct's EIP-712 root type.
fn type_fields<T: SolStruct>() -> Value {
    let root = T::eip712_root_type();
    let inner = root
        .split_once('(')
        .and_then(|(_, rest)| rest.strip_suffix(')'))
        .unwrap_or("");
    let fields: Vec<Value> = inner
        .split(',')
        .filter(|f| !f.is_empty())
        .filter_map(|f| f.split_once(' '))
        .map(|(ty, name)| json!({ "name": name, "type": ty }))
        .collect();
    Value::Array(fields)
}

/// Client-side signing configuration: domain, types and primary types.
pub fn config_json(name: &str, version: &str, chain_id: u64) -> Value {
    json!({
        "domain": {
            "name": name,
            "version": version,
            "chainId": chain_id,
        },
        "types": {
            "EIP712Domain": [
                { "name": "name", "type": "string" },
                { "name": "version", "type": "string" },
                { "name": "chainId", "type": "uint256" },
            ],
            "Delegation": type_fields::<Delegation>(),
            "ProfileUpdate": type_fields::<ProfileUpdate>(),
        },
        "primaryTypes": {
            "delegation": "Delegation",
            "profileUpdate": "ProfileUpdate",
        },
    })
}
