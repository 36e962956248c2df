//! Generic memoization cache for fine-grained sub-computations.
//!
//! Separate from the artifact cache: the executor uses this to skip repeated
//! per-item work (e.g. re-analyzing an unchanged screenshot). Bounded LRU
//! with TTL. Hit/miss statistics are backend-only diagnostics.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde_json::Value;

struct MemoEntry {
    value: Value,
    inserted_at: Instant,
}

struct MemoInner {
    map: HashMap<String, MemoEntry>,
    /// Access order, least-recent first.
    order: VecDeque<String>,
}

/// Hit/miss counters for the memoizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Bounded LRU + TTL memoization cache.
pub struct MemoCache {
    inner: Mutex<MemoInner>,
    max_entries: usize,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(MemoInner {
                map: HashMap::new(),
                order: VecDeque::new(),
            }),
            max_entries: max_entries.max(1),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up a memoized value. Expired entries count as misses and are
    /// dropped on the spot.
    pub fn get(&self, key: &str) -> Option<Value> {
        let mut inner = self.inner.lock().expect("memo cache mutex poisoned");

        let expired = match inner.map.get(key) {
            Some(entry) => entry.inserted_at.elapsed() > self.ttl,
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if expired {
            inner.map.remove(key);
            inner.order.retain(|k| k != key);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        // Refresh LRU position
        inner.order.retain(|k| k != key);
        inner.order.push_back(key.to_string());

        self.hits.fetch_add(1, Ordering::Relaxed);
        inner.map.get(key).map(|e| e.value.clone())
    }

    /// Insert a value, evicting the least-recently-used entry if full.
    pub fn insert(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        let mut inner = self.inner.lock().expect("memo cache mutex poisoned");

        if inner.map.contains_key(&key) {
            inner.order.retain(|k| k != &key);
        } else if inner.map.len() >= self.max_entries {
            if let Some(oldest) = inner.order.pop_front() {
                inner.map.remove(&oldest);
            }
        }

        inner.order.push_back(key.clone());
        inner.map.insert(
            key,
            MemoEntry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Compute-if-absent convenience wrapper.
    pub fn get_or_insert_with(&self, key: &str, compute: impl FnOnce() -> Value) -> Value {
        if let Some(hit) = self.get(key) {
            return hit;
        }
        let value = compute();
        self.insert(key, value.clone());
        value
    }

    pub fn stats(&self) -> MemoStats {
        let inner = self.inner.lock().expect("memo cache mutex poisoned");
        MemoStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: inner.map.len(),
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("memo cache mutex poisoned");
        inner.map.clear();
        inner.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hit_and_miss_counting() {
        let cache = MemoCache::new(10, Duration::from_secs(60));
        assert!(cache.get("a").is_none());
        cache.insert("a", json!(1));
        assert_eq!(cache.get("a"), Some(json!(1)));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn lru_eviction_drops_least_recent() {
        let cache = MemoCache::new(2, Duration::from_secs(60));
        cache.insert("a", json!(1));
        cache.insert("b", json!(2));
        // Touch "a" so "b" becomes least recent
        cache.get("a");
        cache.insert("c", json!(3));

        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn expired_entries_are_misses() {
        let cache = MemoCache::new(10, Duration::ZERO);
        cache.insert("a", json!(1));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("a").is_none());
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn get_or_insert_with_computes_once() {
        let cache = MemoCache::new(10, Duration::from_secs(60));
        let mut calls = 0;
        let v = cache.get_or_insert_with("k", || {
            calls += 1;
            json!("computed")
        });
        assert_eq!(v, json!("computed"));
        let v2 = cache.get_or_insert_with("k", || {
            calls += 1;
            json!("recomputed")
        });
        assert_eq!(v2, json!("computed"));
        assert_eq!(calls, 1);
    }

    #[test]
    fn reinsert_updates_value() {
        let cache = MemoCache::new(2, Duration::from_secs(60));
        cache.insert("a", json!(1));
        cache.insert("a", json!(2));
        assert_eq!(cache.get("a"), Some(json!(2)));
        assert_eq!(cache.stats().entries, 1);
    }
}
