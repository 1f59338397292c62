//! Explicit, versioned on-disk schema for the cache.
//!
//! Deliberately NOT a dump of live language objects: a self-describing
//! `{version, entries[...], lru_order, counters}` document that a
//! version-mismatched or corrupt file fails to parse cleanly rather than
//! partially loading.

use super::{CacheEntry, Counters};
use crate::error::{Error, Result};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotEntry {
    key: String,
    payload_bytes: Vec<u8>,
    size_bytes: u64,
    created_at_epoch_secs: f64,
    last_accessed_epoch_secs: f64,
    access_count: u64,
    ttl_seconds: Option<f64>,
    metadata: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OnDiskSnapshot {
    version: u32,
    entries: Vec<SnapshotEntry>,
    /// Oldest (LRU) to newest (MRU).
    lru_order: Vec<String>,
    hits: u64,
    misses: u64,
    evictions: u64,
    total_requests: u64,
}

/// In-memory form used to rebuild a `ModelCache` after `load`.
pub struct CacheSnapshot {
    pub entries: Vec<CacheEntry>,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub total_requests: u64,
}

fn to_epoch_secs(t: SystemTime) -> f64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

fn from_epoch_secs(secs: f64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs_f64(secs.max(0.0))
}

impl CacheSnapshot {
    pub(super) fn from_cache(lru: &LruCache<String, CacheEntry>, counters: &Counters) -> Self {
        // `iter()` yields most-recently-used first; reverse to store oldest-first
        // so re-inserting in order reconstructs the same recency order.
        let ordered: Vec<(&String, &CacheEntry)> = lru.iter().collect();
        let entries: Vec<CacheEntry> = ordered.iter().rev().map(|(_, e)| (*e).clone()).collect();
        let (hits, misses, evictions, total_requests) = counters.snapshot();

        CacheSnapshot {
            entries,
            hits,
            misses,
            evictions,
            total_requests,
        }
    }

    pub(super) fn write_atomic(&self, path: &Path) -> Result<()> {
        let on_disk = OnDiskSnapshot {
            version: SNAPSHOT_VERSION,
            entries: self
                .entries
                .iter()
                .map(|e| SnapshotEntry {
                    key: e.key.clone(),
                    payload_bytes: e.data.clone(),
                    size_bytes: e.size_bytes,
                    created_at_epoch_secs: to_epoch_secs(e.created_at),
                    last_accessed_epoch_secs: to_epoch_secs(e.last_accessed),
                    access_count: e.access_count,
                    ttl_seconds: e.ttl.map(|d| d.as_secs_f64()),
                    metadata: e.metadata.clone(),
                })
                .collect(),
            lru_order: self.entries.iter().map(|e| e.key.clone()).collect(),
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            total_requests: self.total_requests,
        };

        let bytes = bincode::serialize(&on_disk)?;
        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, &bytes)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    pub(super) fn read(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let on_disk: OnDiskSnapshot = bincode::deserialize(&bytes)?;
        if on_disk.version != SNAPSHOT_VERSION {
            return Err(Error::SerializationError(format!(
                "cache snapshot version mismatch: expected {SNAPSHOT_VERSION}, found {}",
                on_disk.version
            )));
        }

        let mut by_key: std::collections::HashMap<String, SnapshotEntry> = on_disk
            .entries
            .into_iter()
            .map(|e| (e.key.clone(), e))
            .collect();

        let mut entries = Vec::new();
        for key in on_disk.lru_order {
            if let Some(raw) = by_key.remove(&key) {
                entries.push(CacheEntry {
                    key: raw.key,
                    data: raw.payload_bytes,
                    size_bytes: raw.size_bytes,
                    created_at: from_epoch_secs(raw.created_at_epoch_secs),
                    last_accessed: from_epoch_secs(raw.last_accessed_epoch_secs),
                    access_count: raw.access_count,
                    ttl: raw.ttl_seconds.map(Duration::from_secs_f64),
                    metadata: raw.metadata,
                });
            }
        }

        Ok(CacheSnapshot {
            entries,
            hits: on_disk.hits,
            misses: on_disk.misses,
            evictions: on_disk.evictions,
            total_requests: on_disk.total_requests,
        })
    }
}
