//! The router's two caches: a bounded LRU for collection name -> cluster id,
//! and an unbounded map for cluster id -> host-list snapshot.
//!
//! Entries are immutable snapshots -- a cache is updated by replacing an
//! entry wholesale, never mutated in place, so a reader that doesn't hold
//! the DB mutex can still safely read a stale-but-coherent value.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::model::ClusterHosts;

struct NegativeCacheable<T> {
    value: Option<T>,
    cached_at: Instant,
}

/// `collection name -> cluster_id` cache. Caches a negative result (`None`)
/// for unknown collections so pathological clients asking for bogus names
/// don't flood the database; an optional TTL ages that negative result back
/// out.
pub struct CollectionCache {
    inner: Mutex<LruCache<String, NegativeCacheable<i64>>>,
    negative_ttl: Option<Duration>,
}

impl CollectionCache {
    pub fn new(capacity: usize, negative_ttl: Option<Duration>) -> Self {
        let capacity = std::num::NonZeroUsize::new(capacity.max(1)).expect("capacity > 0");
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            negative_ttl,
        }
    }

    /// Best-effort, lock-free-at-the-cache-level read -- used both as a
    /// direct cache check and as the "cache check closure" passed into the
    /// supervised DB interaction so a thundering herd of misses collapses
    /// onto a single query.
    pub fn get(&self, collection: &str) -> Option<Option<i64>> {
        let mut guard = self.inner.lock().unwrap();
        let entry = guard.get(collection)?;
        if entry.value.is_none() {
            if let Some(ttl) = self.negative_ttl {
                if entry.cached_at.elapsed() >= ttl {
                    return None;
                }
            }
        }
        Some(entry.value)
    }

    pub fn put(&self, collection: String, cluster_id: Option<i64>) {
        self.inner.lock().unwrap().put(
            collection,
            NegativeCacheable {
                value: cluster_id,
                cached_at: Instant::now(),
            },
        );
    }
}

/// `cluster_id -> host list` cache. Unbounded: the number of
/// clusters in a deployment is small and fixed relative to collections.
pub struct ClusterCache {
    inner: Mutex<HashMap<i64, ClusterHosts>>,
}

impl Default for ClusterCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, cluster_id: i64) -> Option<ClusterHosts> {
        self.inner.lock().unwrap().get(&cluster_id).cloned()
    }

    pub fn put(&self, hosts: ClusterHosts) {
        self.inner.lock().unwrap().insert(hosts.cluster_id, hosts);
    }
}
