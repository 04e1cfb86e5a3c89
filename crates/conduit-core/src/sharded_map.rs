//! A fixed-shard concurrent map used as the storage layer for the dedup and
//! session stores. Each shard owns its own `RwLock<HashMap>`, so operations
//! on disjoint shards never contend with each other.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::RwLock;

use siphasher::sip::SipHasher13;
use std::hash::{Hash as _, Hasher};

const SHARD_COUNT: usize = 16;

fn shard_index<K: Hash>(key: &K) -> usize {
    let mut hasher = SipHasher13::new_with_keys(0, 0);
    key.hash(&mut hasher);
    (hasher.finish() as usize) % SHARD_COUNT
}

struct Shard<K, V> {
    entries: RwLock<HashMap<K, V>>,
}

impl<K, V> Default for Shard<K, V> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

/// A generic concurrent key-value map with per-shard locks.
///
/// `Range`/`RangeDelete` only ever take the lock of the shard being visited,
/// so a long-running visitor on one shard never blocks writers on another.
pub struct ShardedMap<K, V> {
    shards: Vec<Shard<K, V>>,
}

impl<K, V> Default for ShardedMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> ShardedMap<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        let mut shards = Vec::with_capacity(SHARD_COUNT);
        shards.resize_with(SHARD_COUNT, Shard::default);
        Self { shards }
    }

    fn shard(&self, key: &K) -> &Shard<K, V> {
        &self.shards[shard_index(key)]
    }

    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        let shard = self.shard(key);
        let guard = shard.entries.read().expect("sharded map lock poisoned");
        guard.get(key).cloned()
    }

    pub fn set(&self, key: K, value: V) {
        let shard = self.shard(&key);
        let mut guard = shard.entries.write().expect("sharded map lock poisoned");
        guard.insert(key, value);
    }

    pub fn delete(&self, key: &K) -> Option<V> {
        let shard = self.shard(key);
        let mut guard = shard.entries.write().expect("sharded map lock poisoned");
        guard.remove(key)
    }

    /// Read-locked traversal of every entry. The visitor may abort the whole
    /// traversal early by returning `false`; each shard is locked and
    /// unlocked independently as the traversal proceeds.
    pub fn range<F>(&self, mut visitor: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        for shard in &self.shards {
            let guard = shard.entries.read().expect("sharded map lock poisoned");
            for (k, v) in guard.iter() {
                if !visitor(k, v) {
                    return;
                }
            }
        }
    }

    /// Write-locked bulk delete: entries for which `predicate` returns `true`
    /// are removed. Each shard is locked once for its own pass.
    pub fn range_delete<F>(&self, mut predicate: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        for shard in &self.shards {
            let mut guard = shard.entries.write().expect("sharded map lock poisoned");
            guard.retain(|k, v| !predicate(k, v));
        }
    }

    /// Atomically read-modify-write a single key under the shard's write
    /// lock. `f` receives the current value (if any) and returns the new
    /// value plus whether to keep it; returns the previous value and whether
    /// the key existed before the call.
    pub fn compute<F>(&self, key: K, f: F) -> (Option<V>, bool)
    where
        F: FnOnce(Option<&V>) -> (V, bool),
        V: Clone,
    {
        let shard = self.shard(&key);
        let mut guard = shard.entries.write().expect("sharded map lock poisoned");
        let existed = guard.contains_key(&key);
        let previous = guard.get(&key).cloned();
        let (new_value, keep) = f(previous.as_ref());
        if keep {
            guard.insert(key, new_value);
        } else {
            guard.remove(&key);
        }
        (previous, existed)
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.entries.read().expect("sharded map lock poisoned").len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn get_set_delete_roundtrip() {
        let map: ShardedMap<String, i32> = ShardedMap::new();
        map.set("a".to_string(), 1);
        assert_eq!(map.get(&"a".to_string()), Some(1));
        assert_eq!(map.delete(&"a".to_string()), Some(1));
        assert_eq!(map.get(&"a".to_string()), None);
    }

    #[test]
    fn range_delete_removes_matching() {
        let map: ShardedMap<i32, i32> = ShardedMap::new();
        for i in 0..100 {
            map.set(i, i * 2);
        }
        map.range_delete(|_, v| *v % 4 == 0);
        let mut remaining = 0;
        map.range(|_, _| {
            remaining += 1;
            true
        });
        assert_eq!(remaining, 50);
    }

    #[test]
    fn compute_reports_previous_and_existence() {
        let map: ShardedMap<String, i32> = ShardedMap::new();
        let (prev, existed) = map.compute("k".to_string(), |cur| (cur.copied().unwrap_or(0) + 1, true));
        assert_eq!(prev, None);
        assert!(!existed);
        let (prev, existed) = map.compute("k".to_string(), |cur| (cur.copied().unwrap_or(0) + 1, true));
        assert_eq!(prev, Some(1));
        assert!(existed);
        assert_eq!(map.get(&"k".to_string()), Some(2));
    }

    #[test]
    fn compute_is_linearizable_under_concurrency() {
        let map: Arc<ShardedMap<String, i64>> = Arc::new(ShardedMap::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let map = Arc::clone(&map);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    map.compute("counter".to_string(), |cur| (cur.copied().unwrap_or(0) + 1, true));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(map.get(&"counter".to_string()), Some(8000));
    }

    #[test]
    fn concurrent_range_and_set_on_disjoint_shards_do_not_deadlock() {
        let map: Arc<ShardedMap<i32, i32>> = Arc::new(ShardedMap::new());
        for i in 0..100 {
            map.set(i, i);
        }
        let reader = {
            let map = Arc::clone(&map);
            thread::spawn(move || {
                for _ in 0..50 {
                    map.range(|_, _| true);
                }
            })
        };
        let writer = {
            let map = Arc::clone(&map);
            thread::spawn(move || {
                for i in 100..200 {
                    map.set(i, i);
                }
            })
        };
        reader.join().unwrap();
        writer.join().unwrap();
        assert_eq!(map.len(), 200);
    }
}
