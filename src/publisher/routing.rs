//! Message routing to partitions.
//!
//! Keyed routing must agree across independent client instances, including
//! clients written in other languages, so the keyed path is a fixed function
//! of the key bytes and the partition count: SHA-256 of the key, read as a
//! big-endian integer, reduced modulo the partition count.
//!
//! The reduction folds one byte at a time with
//! `acc = (acc * 256 + byte) % n`, which never overflows and equals the full
//! 256-bit integer modulo `n` because `(a * b) mod m = ((a mod m) * (b mod m)) mod m`.

use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::Partition;

/// Chooses a partition for each message.
///
/// `partition_count` must be greater than zero.
pub trait RoutingPolicy: Send + Sync {
    /// Route an unkeyed message.
    fn route(&self, partition_count: u32) -> Partition;

    /// Route a keyed message. Must be a pure function of its arguments.
    fn route_key(&self, key: &[u8], partition_count: u32) -> Partition;
}

/// Round-robin for unkeyed messages, SHA-256 hashing for keyed ones.
#[derive(Debug)]
pub struct DefaultRoutingPolicy {
    counter: AtomicU64,
}

impl DefaultRoutingPolicy {
    /// Create a policy whose round-robin starts at a random position, so
    /// independent publishers don't all begin on partition 0.
    pub fn new() -> Self {
        Self::with_counter(fastrand::u64(..))
    }

    /// Create a policy whose round-robin starts at `start`.
    pub fn with_counter(start: u64) -> Self {
        Self {
            counter: AtomicU64::new(start),
        }
    }
}

impl Default for DefaultRoutingPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingPolicy for DefaultRoutingPolicy {
    fn route(&self, partition_count: u32) -> Partition {
        debug_assert!(partition_count > 0, "partition count must be positive");
        let next = self.counter.fetch_add(1, Ordering::Relaxed);
        Partition((next % u64::from(partition_count)) as u32)
    }

    fn route_key(&self, key: &[u8], partition_count: u32) -> Partition {
        debug_assert!(partition_count > 0, "partition count must be positive");
        let digest = Sha256::digest(key);
        let n = u64::from(partition_count);
        let partition = digest
            .iter()
            .fold(0u64, |acc, byte| (acc * 256 + u64::from(*byte)) % n);
        Partition(partition as u32)
    }
}
