//! Per-request deduplication: single-flight plus a trailing time window.

use async_trait::async_trait;

pub mod memory;
#[cfg(feature = "redis-backend")]
pub mod kv;

pub use memory::MemoryDedupStore;
#[cfg(feature = "redis-backend")]
pub use kv::RedisDedupStore;

/// `Register`/`Finish` contract shared by both backings. A fingerprint is a
/// duplicate iff it was registered within the configured window and hasn't
/// expired; `has_in_flight` is true iff a concurrent registration for the
/// same fingerprint is outstanding right now.
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Registers a sighting of `fingerprint`. Returns `(is_duplicate,
    /// has_in_flight)`. On a non-duplicate, the in-flight counter is
    /// incremented.
    async fn register(&self, fingerprint: &str) -> (bool, bool);

    /// Decrements the in-flight counter (never below zero) and refreshes
    /// last-seen. Must be called on every exit path of a registered request.
    async fn finish(&self, fingerprint: &str);
}
