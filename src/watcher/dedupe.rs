//! Bounded set of already-counted log positions.

use alloy::primitives::B256;
use std::collections::{HashSet, VecDeque};

/// `(tx_hash, log_index)` uniquely identifies a log on a canonical chain.
pub type LogKey = (B256, u64);

/// FIFO-evicting seen-set. Redeliveries within the last `capacity`
/// distinct logs are recognised; older ones are forgotten.
#[derive(Debug)]
pub struct SeenSet {
    capacity: usize,
    seen: HashSet<LogKey>,
    order: VecDeque<LogKey>,
}

impl SeenSet {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            seen: HashSet::with_capacity(capacity.min(1 << 16)),
            order: VecDeque::with_capacity(capacity.min(1 << 16)),
        }
    }

    /// Returns `true` the first time `key` is inserted.
    pub fn insert(&mut self, key: LogKey) -> bool {
        if !self.seen.insert(key) {
            return false;
        }
        self.order.push_back(key);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
