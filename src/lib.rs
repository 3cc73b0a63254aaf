//! chainmirror: a relational mirror of protocol contract state plus the
//! approval signer that authorizes privileged on-chain actions.
//!
//! The daemon in `main.rs` wires these modules together; the route layer
//! talks to [`service::ApprovalService`].

pub mod allocation;
pub mod chain;
pub mod clock;
pub mod config;
pub mod delegation;
pub mod domains;
pub mod queue;
pub mod reconcile;
pub mod service;
pub mod signer;
pub mod store;
pub mod watcher;

#[cfg(test)]
mod testing;
