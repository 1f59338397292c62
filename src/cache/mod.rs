//! Model Cache: a size-bounded, TTL-bounded, LRU-evicting store of model
//! artifacts.
//!
//! Recency order is tracked with the `lru` crate the same way the original
//! multi-tier edge cache did (an `LruCache` sized far above any real entry
//! count, with eviction driven by a tracked byte budget rather than entry
//! count): `pop_lru()` is called manually whenever the byte budget would be
//! exceeded.

mod persistence;

pub use persistence::CacheSnapshot;

use crate::error::{Error, Result};
use lru::LruCache;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

/// A single cached artifact plus its accounting metadata.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub data: Vec<u8>,
    pub size_bytes: u64,
    pub created_at: SystemTime,
    pub last_accessed: SystemTime,
    pub access_count: u64,
    pub ttl: Option<Duration>,
    pub metadata: Option<Value>,
}

impl CacheEntry {
    fn is_expired(&self, now: SystemTime) -> bool {
        match self.ttl {
            Some(ttl) => now.duration_since(self.created_at).unwrap_or_default() > ttl,
            None => false,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    total_requests: AtomicU64,
}

/// Snapshot of cache counters, returned by `stats()`.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub current_size_bytes: u64,
    pub max_size_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub total_requests: u64,
}

pub struct ModelCacheConfig {
    pub max_size_bytes: u64,
    pub default_ttl: Option<Duration>,
    pub persistence_path: Option<PathBuf>,
}

/// Size-bounded, TTL-bounded, LRU-evicting artifact store.
pub struct ModelCache {
    entries: RwLock<LruCache<String, CacheEntry>>,
    current_size: AtomicU64,
    max_size_bytes: u64,
    default_ttl: Option<Duration>,
    counters: Counters,
    persistence_path: Option<PathBuf>,
}

impl ModelCache {
    pub fn new(config: ModelCacheConfig) -> Self {
        Self {
            entries: RwLock::new(LruCache::new(NonZeroUsize::new(usize::MAX).unwrap())),
            current_size: AtomicU64::new(0),
            max_size_bytes: config.max_size_bytes,
            default_ttl: config.default_ttl,
            counters: Counters::default(),
            persistence_path: config.persistence_path,
        }
    }

    /// Insert an artifact under `key`. `data` has already been serialized by
    /// the caller; `size_bytes` is computed from its length.
    pub fn put(&self, key: &str, data: Vec<u8>, ttl: Option<Duration>, metadata: Option<Value>) -> Result<()> {
        let size_bytes = data.len() as u64;
        if size_bytes > self.max_size_bytes {
            return Err(Error::TooLarge {
                size_bytes,
                max_bytes: self.max_size_bytes,
            });
        }

        let now = SystemTime::now();
        let mut entries = self.entries.write();

        if let Some(old) = entries.pop(key) {
            self.current_size.fetch_sub(old.size_bytes, Ordering::SeqCst);
        }

        while self.current_size.load(Ordering::SeqCst) + size_bytes > self.max_size_bytes {
            match entries.pop_lru() {
                Some((_, evicted)) => {
                    self.current_size.fetch_sub(evicted.size_bytes, Ordering::SeqCst);
                    self.counters.evictions.fetch_add(1, Ordering::SeqCst);
                }
                None => break,
            }
        }

        let entry = CacheEntry {
            key: key.to_string(),
            data,
            size_bytes,
            created_at: now,
            last_accessed: now,
            access_count: 0,
            ttl: ttl.or(self.default_ttl),
            metadata,
        };
        entries.put(key.to_string(), entry);
        self.current_size.fetch_add(size_bytes, Ordering::SeqCst);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.counters.total_requests.fetch_add(1, Ordering::SeqCst);
        let now = SystemTime::now();
        let mut entries = self.entries.write();

        let expired = match entries.peek(key) {
            Some(entry) => entry.is_expired(now),
            None => {
                self.counters.misses.fetch_add(1, Ordering::SeqCst);
                return None;
            }
        };

        if expired {
            if let Some(entry) = entries.pop(key) {
                self.current_size.fetch_sub(entry.size_bytes, Ordering::SeqCst);
            }
            self.counters.misses.fetch_add(1, Ordering::SeqCst);
            return None;
        }

        let entry = entries.get_mut(key).expect("checked present above");
        entry.last_accessed = now;
        entry.access_count += 1;
        self.counters.hits.fetch_add(1, Ordering::SeqCst);
        Some(entry.data.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        let now = SystemTime::now();
        let entries = self.entries.read();
        match entries.peek(key) {
            Some(entry) => !entry.is_expired(now),
            None => false,
        }
    }

    pub fn remove(&self, key: &str) -> bool {
        let mut entries = self.entries.write();
        match entries.pop(key) {
            Some(entry) => {
                self.current_size.fetch_sub(entry.size_bytes, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        let mut entries = self.entries.write();
        entries.clear();
        self.current_size.store(0, Ordering::SeqCst);
    }

    /// Scan all entries and remove any whose TTL has elapsed. Returns the count removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = SystemTime::now();
        let mut entries = self.entries.write();
        let expired_keys: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();

        for key in &expired_keys {
            if let Some(entry) = entries.pop(key) {
                self.current_size.fetch_sub(entry.size_bytes, Ordering::SeqCst);
            }
        }
        expired_keys.len()
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.read();
        CacheStats {
            entries: entries.len(),
            current_size_bytes: self.current_size.load(Ordering::SeqCst),
            max_size_bytes: self.max_size_bytes,
            hits: self.counters.hits.load(Ordering::SeqCst),
            misses: self.counters.misses.load(Ordering::SeqCst),
            evictions: self.counters.evictions.load(Ordering::SeqCst),
            total_requests: self.counters.total_requests.load(Ordering::SeqCst),
        }
    }

    // --- Model-indexing helpers -------------------------------------------------

    fn model_key(model_id: &str, version: &str) -> String {
        format!("model:{model_id}:{version}")
    }

    pub fn cache_model(
        &self,
        model_id: &str,
        weights: &HashMap<String, Vec<f64>>,
        version: &str,
        metadata: Option<Value>,
    ) -> Result<()> {
        let data = bincode::serialize(weights)
            .map_err(|e| Error::SerializationError(e.to_string()))?;
        self.put(&Self::model_key(model_id, version), data, None, metadata)
    }

    pub fn get_model(&self, model_id: &str, version: &str) -> Option<HashMap<String, Vec<f64>>> {
        let bytes = self.get(&Self::model_key(model_id, version))?;
        bincode::deserialize(&bytes).ok()
    }

    /// Find the entry with the greatest `created_at` among `model:{model_id}:*`,
    /// ties broken by version string descending, then re-fetch through `get_model`
    /// so TTL is re-applied.
    pub fn get_latest_model(&self, model_id: &str) -> Option<HashMap<String, Vec<f64>>> {
        let prefix = format!("model:{model_id}:");
        let best_version = {
            let entries = self.entries.read();
            entries
                .iter()
                .filter(|(k, _)| k.starts_with(&prefix))
                .max_by(|(ka, va), (kb, vb)| {
                    va.created_at
                        .cmp(&vb.created_at)
                        .then_with(|| ka[prefix.len()..].cmp(&kb[prefix.len()..]))
                })
                .map(|(k, _)| k[prefix.len()..].to_string())
        }?;
        self.get_model(model_id, &best_version)
    }

    pub fn cache_aggregation_result(
        &self,
        round_id: u64,
        weights: &HashMap<String, Vec<f64>>,
        metadata: Option<Value>,
    ) -> Result<()> {
        let data = bincode::serialize(weights)
            .map_err(|e| Error::SerializationError(e.to_string()))?;
        self.put(&format!("aggregation:{round_id}"), data, None, metadata)
    }

    // --- Persistence --------------------------------------------------------

    /// Dump `{entries, lru_order, counters}` atomically to `persistence_path`, if set.
    pub fn dump(&self) -> Result<()> {
        let Some(path) = &self.persistence_path else {
            return Ok(());
        };
        let snapshot = {
            let entries = self.entries.read();
            CacheSnapshot::from_cache(&entries, &self.counters)
        };
        snapshot.write_atomic(path)
    }

    /// Load a prior dump, then immediately run `cleanup_expired`. Any load
    /// failure (missing file, version mismatch, corrupt structure) is
    /// non-fatal: the cache simply starts empty.
    pub fn load(&self) -> usize {
        let Some(path) = &self.persistence_path else {
            return 0;
        };
        match CacheSnapshot::read(path) {
            Ok(snapshot) => {
                let mut entries = self.entries.write();
                let mut size = 0u64;
                for entry in snapshot.entries {
                    size += entry.size_bytes;
                    entries.put(entry.key.clone(), entry);
                }
                self.current_size.store(size, Ordering::SeqCst);
                self.counters.hits.store(snapshot.hits, Ordering::SeqCst);
                self.counters.misses.store(snapshot.misses, Ordering::SeqCst);
                self.counters.evictions.store(snapshot.evictions, Ordering::SeqCst);
                self.counters
                    .total_requests
                    .store(snapshot.total_requests, Ordering::SeqCst);
                drop(entries);
                self.cleanup_expired()
            }
            Err(e) => {
                tracing::warn!("cache persistence load failed, starting empty: {e}");
                0
            }
        }
    }
}

impl Counters {
    fn snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.hits.load(Ordering::SeqCst),
            self.misses.load(Ordering::SeqCst),
            self.evictions.load(Ordering::SeqCst),
            self.total_requests.load(Ordering::SeqCst),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(max: u64) -> ModelCache {
        ModelCache::new(ModelCacheConfig {
            max_size_bytes: max,
            default_ttl: None,
            persistence_path: None,
        })
    }

    #[test]
    fn put_rejects_oversized_entries() {
        let c = cache(100);
        let err = c.put("a", vec![0u8; 200], None, None).unwrap_err();
        assert!(matches!(err, Error::TooLarge { .. }));
    }

    #[test]
    fn idempotent_put_accounts_bytes_once() {
        let c = cache(1000);
        c.put("k", vec![1u8; 100], None, None).unwrap();
        c.put("k", vec![1u8; 100], None, None).unwrap();
        assert_eq!(c.stats().current_size_bytes, 100);
        assert_eq!(c.stats().entries, 1);
    }

    #[test]
    fn eviction_under_pressure_is_lru() {
        // put("a", 600B); put("b", 300B); get("a"); put("c", 500B)
        let c = cache(1000);
        c.put("a", vec![0u8; 600], None, None).unwrap();
        c.put("b", vec![0u8; 300], None, None).unwrap();
        assert!(c.get("a").is_some());
        c.put("c", vec![0u8; 500], None, None).unwrap();

        assert!(c.contains("a"));
        assert!(!c.contains("b"));
        assert!(c.contains("c"));
        assert_eq!(c.stats().evictions, 1);
    }

    #[test]
    fn expired_get_is_a_miss_and_removes_entry() {
        let c = cache(1000);
        c.put("k", vec![0u8; 10], Some(Duration::from_millis(0)), None)
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(c.get("k").is_none());
        assert!(!c.contains("k"));
    }

    #[test]
    fn latest_model_picks_greatest_created_at() {
        let c = cache(10_000);
        let w1: HashMap<String, Vec<f64>> = [("w".to_string(), vec![1.0])].into();
        let w2: HashMap<String, Vec<f64>> = [("w".to_string(), vec![2.0])].into();
        c.cache_model("m1", &w1, "v1", None).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        c.cache_model("m1", &w2, "v2", None).unwrap();

        let latest = c.get_latest_model("m1").unwrap();
        assert_eq!(latest["w"], vec![2.0]);
    }
}
