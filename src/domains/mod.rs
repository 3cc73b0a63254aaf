//! Concrete watcher domains.
//!
//! | Domain       | Contract(s)            | Writes                     |
//! |--------------|------------------------|----------------------------|
//! | `analytics`  | TaskMarket, Governor   | tasks, proposals, votes    |
//! | `dispute`    | DisputeResolver        | disputes, dispute_votes    |
//! | `vote_power` | VotePower              | stakers (+ debounced queue)|
//! | `treasury`   | Treasury               | deposits, redemptions      |

pub mod analytics;
pub mod dispute;
pub mod treasury;
pub mod vote_power;

pub use analytics::{AnalyticsDomain, AnalyticsEvent};
pub use dispute::{DisputeDomain, DisputeEvent};
pub use treasury::{TreasuryDomain, TreasuryEvent};
pub use vote_power::{VotePowerDomain, VotePowerEvent, VotePowerProcessor};

use crate::store::{EntityKind, MirrorStore};

use alloy::primitives::Address;
use alloy::rpc::types::Log;
use alloy::sol_types::SolEvent;
use std::collections::BTreeMap;

/// Resolve a configured contract address or fail validation.
pub(crate) fn require_address(address: Option<Address>, what: &str) -> anyhow::Result<Address> {
    match address {
        Some(a) if a != Address::ZERO => Ok(a),
        _ => anyhow::bail!("{what} address not configured"),
    }
}

pub(crate) fn decode_event<E: SolEvent>(log: &Log) -> anyhow::Result<E> {
    Ok(E::decode_log_data(log.data())?)
}

pub(crate) async fn count_kinds(
    store: &dyn MirrorStore,
    kinds: &[EntityKind],
) -> anyhow::Result<BTreeMap<String, u64>> {
    let mut counts = BTreeMap::new();
    for kind in kinds {
        counts.insert(kind.table().to_string(), store.count(*kind, None).await?);
    }
    Ok(counts)
}
