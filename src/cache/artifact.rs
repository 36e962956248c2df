//! Two-tier content-addressable artifact cache.
//!
//! L1 is an in-memory LRU bounded by entry count and total value bytes.
//! L2 is the durable store. Reads check L1 first and promote L2 hits.
//! Entries expire lazily on TTL or when the executor version moves on;
//! content changes need no invalidation at all — they hash to new keys.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use tracing::debug;

use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::store::EnrichmentStore;

use super::CacheEntry;

struct L1State {
    map: HashMap<String, CacheEntry>,
    /// Access order, least-recent first.
    order: VecDeque<String>,
    total_bytes: usize,
}

/// Aggregate cache counters (backend diagnostics only).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub misses: u64,
    pub l1_entries: usize,
    pub l1_bytes: usize,
}

/// Two-tier artifact cache keyed by content hash.
pub struct ArtifactCache {
    store: Arc<dyn EnrichmentStore>,
    l1: Mutex<L1State>,
    config: CacheConfig,
    executor_version: String,
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    misses: AtomicU64,
}

impl ArtifactCache {
    pub fn new(
        store: Arc<dyn EnrichmentStore>,
        config: CacheConfig,
        executor_version: impl Into<String>,
    ) -> Self {
        Self {
            store,
            l1: Mutex::new(L1State {
                map: HashMap::new(),
                order: VecDeque::new(),
                total_bytes: 0,
            }),
            config,
            executor_version: executor_version.into(),
            l1_hits: AtomicU64::new(0),
            l2_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn is_fresh(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        entry.expires_at > now && entry.executor_version == self.executor_version
    }

    /// Look up an artifact. Checks L1, then L2 (promoting a hit into L1).
    /// Expired or version-stale entries are treated as missing and removed.
    pub async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        let now = Utc::now();

        // L1 pass. The lock is never held across an await.
        {
            let mut l1 = self.l1.lock().expect("artifact cache mutex poisoned");
            if let Some(entry) = l1.map.get_mut(key) {
                if entry.expires_at > now && entry.executor_version == self.executor_version {
                    entry.access_count += 1;
                    entry.last_accessed_at = now;
                    let value = entry.value.clone();
                    l1.order.retain(|k| k != key);
                    l1.order.push_back(key.to_string());
                    self.l1_hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(Some(value));
                }
                // Stale in L1 — drop it and fall through to L2.
                Self::remove_from_l1(&mut l1, key);
            }
        }

        // L2 pass.
        match self.store.get_cache_entry(key).await? {
            Some(entry) if self.is_fresh(&entry, now) => {
                self.store.touch_cache_entry(key, now).await?;
                let value = entry.value.clone();
                self.promote(entry);
                self.l2_hits.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "Artifact promoted from durable cache");
                Ok(Some(value))
            }
            Some(_) => {
                // Stale in L2 — lazy removal.
                self.store.delete_cache_entry(key).await?;
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    /// Store an artifact in both tiers.
    pub async fn set(&self, key: &str, value: Value) -> Result<(), CacheError> {
        let now = Utc::now();
        let size_bytes = serde_json::to_vec(&value)
            .map_err(|e| CacheError::Serialization(e.to_string()))?
            .len();
        let ttl = ChronoDuration::from_std(self.config.ttl)
            .unwrap_or_else(|_| ChronoDuration::days(30));

        let entry = CacheEntry {
            key: key.to_string(),
            value,
            cached_at: now,
            expires_at: now + ttl,
            executor_version: self.executor_version.clone(),
            size_bytes: size_bytes as u64,
            access_count: 0,
            last_accessed_at: now,
        };

        self.store.put_cache_entry(&entry).await?;
        self.promote(entry);
        Ok(())
    }

    /// Remove entries whose key contains `pattern` from both tiers.
    /// Returns the number of durable entries removed.
    pub async fn invalidate(&self, pattern: &str) -> Result<usize, CacheError> {
        {
            let mut l1 = self.l1.lock().expect("artifact cache mutex poisoned");
            let matching: Vec<String> = l1
                .map
                .keys()
                .filter(|k| k.contains(pattern))
                .cloned()
                .collect();
            for key in &matching {
                Self::remove_from_l1(&mut l1, key);
            }
        }

        let removed = self.store.invalidate_cache_entries(pattern).await?;
        debug!(pattern = %pattern, removed, "Invalidated cached artifacts");
        Ok(removed)
    }

    pub fn stats(&self) -> CacheStats {
        let l1 = self.l1.lock().expect("artifact cache mutex poisoned");
        CacheStats {
            l1_hits: self.l1_hits.load(Ordering::Relaxed),
            l2_hits: self.l2_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            l1_entries: l1.map.len(),
            l1_bytes: l1.total_bytes,
        }
    }

    pub fn executor_version(&self) -> &str {
        &self.executor_version
    }

    /// Insert an entry into L1, evicting least-recently-used entries until
    /// both the count and byte bounds hold.
    fn promote(&self, entry: CacheEntry) {
        let mut l1 = self.l1.lock().expect("artifact cache mutex poisoned");
        let key = entry.key.clone();

        if l1.map.contains_key(&key) {
            Self::remove_from_l1(&mut l1, &key);
        }

        l1.total_bytes += entry.size_bytes as usize;
        l1.order.push_back(key.clone());
        l1.map.insert(key, entry);

        while l1.map.len() > self.config.l1_max_entries
            || (l1.total_bytes > self.config.l1_max_bytes && l1.map.len() > 1)
        {
            let Some(oldest) = l1.order.front().cloned() else {
                break;
            };
            Self::remove_from_l1(&mut l1, &oldest);
        }
    }

    fn remove_from_l1(l1: &mut L1State, key: &str) {
        if let Some(entry) = l1.map.remove(key) {
            l1.total_bytes = l1.total_bytes.saturating_sub(entry.size_bytes as usize);
        }
        l1.order.retain(|k| k != key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlStore;
    use serde_json::json;

    async fn test_cache(config: CacheConfig) -> ArtifactCache {
        let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
        ArtifactCache::new(store, config, "exec-v1")
    }

    #[tokio::test]
    async fn set_then_get_hits_l1() {
        let cache = test_cache(CacheConfig::default()).await;
        cache.set("k1", json!({"summary": "ok"})).await.unwrap();

        let hit = cache.get("k1").await.unwrap();
        assert_eq!(hit, Some(json!({"summary": "ok"})));
        assert_eq!(cache.stats().l1_hits, 1);
    }

    #[tokio::test]
    async fn l2_hit_is_promoted() {
        let store: Arc<dyn EnrichmentStore> =
            Arc::new(LibSqlStore::new_memory().await.unwrap());
        let writer = ArtifactCache::new(Arc::clone(&store), CacheConfig::default(), "exec-v1");
        writer.set("k1", json!(42)).await.unwrap();

        // Fresh cache instance: empty L1, shared L2.
        let reader = ArtifactCache::new(store, CacheConfig::default(), "exec-v1");
        assert_eq!(reader.get("k1").await.unwrap(), Some(json!(42)));
        assert_eq!(reader.stats().l2_hits, 1);

        // Second read comes from L1.
        assert_eq!(reader.get("k1").await.unwrap(), Some(json!(42)));
        assert_eq!(reader.stats().l1_hits, 1);
    }

    #[tokio::test]
    async fn executor_version_bump_invalidates() {
        let store: Arc<dyn EnrichmentStore> =
            Arc::new(LibSqlStore::new_memory().await.unwrap());
        let v1 = ArtifactCache::new(Arc::clone(&store), CacheConfig::default(), "exec-v1");
        v1.set("k1", json!(1)).await.unwrap();

        let v2 = ArtifactCache::new(store, CacheConfig::default(), "exec-v2");
        assert_eq!(v2.get("k1").await.unwrap(), None);
        assert_eq!(v2.stats().misses, 1);
    }

    #[tokio::test]
    async fn count_bound_evicts_lru() {
        let config = CacheConfig {
            l1_max_entries: 2,
            ..Default::default()
        };
        let cache = test_cache(config).await;
        cache.set("a", json!(1)).await.unwrap();
        cache.set("b", json!(2)).await.unwrap();
        cache.get("a").await.unwrap();
        cache.set("c", json!(3)).await.unwrap();

        let stats = cache.stats();
        assert_eq!(stats.l1_entries, 2);
        // "b" was least recently used; it fell out of L1 but survives in L2.
        assert_eq!(cache.get("b").await.unwrap(), Some(json!(2)));
        assert!(cache.stats().l2_hits >= 1);
    }

    #[tokio::test]
    async fn invalidate_removes_from_both_tiers() {
        let cache = test_cache(CacheConfig::default()).await;
        cache.set("session-a-result", json!(1)).await.unwrap();
        cache.set("session-b-result", json!(2)).await.unwrap();

        let removed = cache.invalidate("session-a").await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(cache.get("session-a-result").await.unwrap(), None);
        assert_eq!(cache.get("session-b-result").await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn byte_bound_evicts() {
        let config = CacheConfig {
            l1_max_entries: 100,
            l1_max_bytes: 64,
            ..Default::default()
        };
        let cache = test_cache(config).await;
        cache.set("a", json!("x".repeat(40))).await.unwrap();
        cache.set("b", json!("y".repeat(40))).await.unwrap();

        // Both together exceed 64 bytes, so the older entry is evicted.
        assert_eq!(cache.stats().l1_entries, 1);
    }
}
