//! In-memory dedup backing: a sharded map plus a caller-owned cleaner.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::cleaner::AsyncCleaner;
use crate::sharded_map::ShardedMap;

use super::DedupStore;

#[derive(Debug, Clone, Copy)]
struct Record {
    last_seen: Instant,
    in_flight: i64,
}

/// Sharded-map backed [`DedupStore`]. Eviction is driven by a separate
/// [`AsyncCleaner`] the caller spawns with [`MemoryDedupStore::spawn_cleaner`]
/// — the store itself only ever does point lookups and computes.
pub struct MemoryDedupStore {
    map: ShardedMap<String, Record>,
    window: Duration,
}

impl MemoryDedupStore {
    pub fn new(window: Duration) -> Arc<Self> {
        Arc::new(Self {
            map: ShardedMap::new(),
            window,
        })
    }

    /// Spawns a periodic cleaner that evicts entries with zero in-flight
    /// whose last-seen is older than the dedup window. The caller owns the
    /// returned cleaner's lifecycle (it must be stopped on shutdown).
    pub fn spawn_cleaner(self: &Arc<Self>, tick: Duration) -> AsyncCleaner {
        let store = Arc::clone(self);
        let mut cleaner = AsyncCleaner::new(tick);
        cleaner.start(move || {
            let store = Arc::clone(&store);
            async move {
                store.cleanup_once();
            }
        });
        cleaner
    }

    fn cleanup_once(&self) {
        let window = self.window;
        let now = Instant::now();
        self.map
            .range_delete(|_, rec| rec.in_flight <= 0 && now.duration_since(rec.last_seen) > window);
    }
}

#[async_trait]
impl DedupStore for MemoryDedupStore {
    async fn register(&self, fingerprint: &str) -> (bool, bool) {
        let now = Instant::now();
        let window = self.window;
        let (previous, existed) = self.map.compute(fingerprint.to_string(), move |cur| match cur {
            Some(rec) if now.duration_since(rec.last_seen) <= window => (
                Record {
                    last_seen: now,
                    in_flight: rec.in_flight + 1,
                },
                true,
            ),
            _ => (
                Record {
                    last_seen: now,
                    in_flight: 1,
                },
                true,
            ),
        });
        match previous {
            Some(rec) if existed && now.duration_since(rec.last_seen) <= window => (true, rec.in_flight > 0),
            _ => (false, false),
        }
    }

    async fn finish(&self, fingerprint: &str) {
        let now = Instant::now();
        self.map.compute(fingerprint.to_string(), move |cur| match cur {
            Some(rec) => (
                Record {
                    last_seen: now,
                    in_flight: (rec.in_flight - 1).max(0),
                },
                true,
            ),
            None => (
                Record {
                    last_seen: now,
                    in_flight: 0,
                },
                true,
            ),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_registration_is_not_duplicate() {
        let store = MemoryDedupStore::new(Duration::from_secs(5));
        let (dup, in_flight) = store.register("fp1").await;
        assert!(!dup);
        assert!(!in_flight);
    }

    #[tokio::test]
    async fn second_registration_within_window_is_duplicate_with_inflight() {
        let store = MemoryDedupStore::new(Duration::from_secs(5));
        store.register("fp1").await;
        let (dup, in_flight) = store.register("fp1").await;
        assert!(dup);
        assert!(in_flight);
    }

    #[tokio::test]
    async fn finish_decrements_and_never_goes_negative() {
        let store = MemoryDedupStore::new(Duration::from_secs(5));
        store.register("fp1").await;
        store.finish("fp1").await;
        store.finish("fp1").await;
        // A third registration after in-flight dropped to zero is still a
        // duplicate (window hasn't elapsed) but no longer reports in-flight.
        let (dup, in_flight) = store.register("fp1").await;
        assert!(dup);
        assert!(!in_flight);
    }

    #[tokio::test]
    async fn exactly_one_concurrent_register_sees_non_duplicate() {
        let store = MemoryDedupStore::new(Duration::from_secs(5));
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            tasks.push(tokio::spawn(async move { store.register("fp-concurrent").await }));
        }
        let mut non_duplicates = 0;
        let mut duplicates_with_inflight = 0;
        for t in tasks {
            let (dup, in_flight) = t.await.unwrap();
            if !dup {
                non_duplicates += 1;
            } else if in_flight {
                duplicates_with_inflight += 1;
            }
        }
        assert_eq!(non_duplicates, 1);
        assert_eq!(duplicates_with_inflight, 15);
    }
}
