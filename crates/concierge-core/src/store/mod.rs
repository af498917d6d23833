//! Shared counter store used by the distributed admission tier.
//!
//! The store is external and not exclusively ours: callers only rely on
//! "add if absent" and "increment existing" primitives, each atomic on its
//! own but not as a pair.

use std::time::Duration;

use async_trait::async_trait;

use crate::Result;

pub mod memory;
pub mod valkey;

pub use memory::MemoryCounterStore;
pub use valkey::ValkeyCounterStore;

/// Result of `create_if_absent`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Store `value` under `key` with `ttl` unless the key already exists.
    async fn create_if_absent(&self, key: &str, value: u64, ttl: Duration)
        -> Result<CreateOutcome>;

    /// Add `delta` to an existing counter. `None` when the key is missing.
    async fn increment(&self, key: &str, delta: u64) -> Result<Option<u64>>;
}

/// Stores speak whole seconds; anything shorter still lives one second.
pub(crate) fn ttl_secs(ttl: Duration) -> u64 {
    let secs = ttl.as_secs();
    if ttl.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs.max(1)
    }
}
