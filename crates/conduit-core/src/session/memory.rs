//! In-memory session backing: a sharded map plus TTL-based `Cleanup`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::cleaner::AsyncCleaner;
use crate::sharded_map::ShardedMap;

use super::SessionStore;

#[derive(Debug, Clone, Default)]
struct Record {
    workdir: Option<String>,
    conv_id: Option<String>,
    last_access: Option<Instant>,
}

impl Record {
    fn touched(mut self, now: Instant) -> Self {
        self.last_access = Some(now);
        self
    }
}

pub struct MemorySessionStore {
    map: ShardedMap<String, Record>,
    ttl: Duration,
}

impl MemorySessionStore {
    pub fn new(ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            map: ShardedMap::new(),
            ttl,
        })
    }

    /// Spawns a periodic cleaner evicting entries past TTL. The caller owns
    /// the returned cleaner's lifecycle.
    pub fn spawn_cleaner(self: &Arc<Self>, tick: Duration) -> AsyncCleaner {
        let store = Arc::clone(self);
        let mut cleaner = AsyncCleaner::new(tick);
        cleaner.start(move || {
            let store = Arc::clone(&store);
            async move {
                store.cleanup().await;
            }
        });
        cleaner
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get_workdir(&self, key: &str) -> Option<String> {
        self.map.get(&key.to_string()).and_then(|r| r.workdir)
    }

    async fn set_workdir(&self, key: &str, workdir: &str) {
        let now = Instant::now();
        let workdir = workdir.to_string();
        self.map.compute(key.to_string(), move |cur| {
            let mut rec = cur.cloned().unwrap_or_default();
            rec.workdir = Some(workdir);
            (rec.touched(now), true)
        });
    }

    async fn get_conv_id(&self, key: &str) -> Option<String> {
        self.map.get(&key.to_string()).and_then(|r| r.conv_id)
    }

    async fn set_conv_id(&self, key: &str, conv_id: &str) {
        let now = Instant::now();
        let conv_id = conv_id.to_string();
        self.map.compute(key.to_string(), move |cur| {
            let mut rec = cur.cloned().unwrap_or_default();
            rec.conv_id = Some(conv_id);
            (rec.touched(now), true)
        });
    }

    async fn delete_session(&self, key: &str) {
        self.map.delete(&key.to_string());
    }

    async fn touch(&self, key: &str) {
        let now = Instant::now();
        self.map.compute(key.to_string(), move |cur| {
            let rec = cur.cloned().unwrap_or_default();
            (rec.touched(now), true)
        });
    }

    async fn cleanup(&self) {
        let ttl = self.ttl;
        let now = Instant::now();
        self.map.range_delete(|_, rec| match rec.last_access {
            Some(last) => now.duration_since(last) > ttl,
            None => true,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_workdir_implicitly_touches_and_is_retrievable() {
        let store = MemorySessionStore::new(Duration::from_secs(60));
        assert_eq!(store.get_workdir("k").await, None);
        store.set_workdir("k", "/home/work").await;
        assert_eq!(store.get_workdir("k").await, Some("/home/work".to_string()));
    }

    #[tokio::test]
    async fn workdir_and_conv_id_are_independent_fields() {
        let store = MemorySessionStore::new(Duration::from_secs(60));
        store.set_workdir("k", "/a").await;
        store.set_conv_id("k", "conv-1").await;
        assert_eq!(store.get_workdir("k").await, Some("/a".to_string()));
        assert_eq!(store.get_conv_id("k").await, Some("conv-1".to_string()));
    }

    #[tokio::test]
    async fn delete_session_removes_all_fields() {
        let store = MemorySessionStore::new(Duration::from_secs(60));
        store.set_workdir("k", "/a").await;
        store.delete_session("k").await;
        assert_eq!(store.get_workdir("k").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_evicts_only_expired_entries() {
        let store = MemorySessionStore::new(Duration::from_millis(50));
        store.set_workdir("stale", "/a").await;
        tokio::time::advance(Duration::from_millis(80)).await;
        store.set_workdir("fresh", "/b").await;
        store.cleanup().await;
        assert_eq!(store.get_workdir("stale").await, None);
        assert_eq!(store.get_workdir("fresh").await, Some("/b".to_string()));
    }
}
