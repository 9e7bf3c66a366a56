//! Disk Cache (C3): content-addressed storage of `(text, dims) -> embedding`
//! with an LRU in-memory front tier. Three independent locks — memory tier,
//! disk tier, index — are never held simultaneously; see [`DiskCache::get`]
//! and [`DiskCache::put`] for the exact hand-off order.

mod disk;
mod index;
mod memory;

use std::path::PathBuf;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::Result;
use crate::stats::Stats;

use disk::DiskTier;
use index::IndexStore;
use memory::MemoryTier;

const MEMORY_TIER_CAPACITY: usize = 100;
const KEY_HEX_LEN: usize = 16;

/// SHA-256 of `text ":" dims`, truncated to 16 hex characters.
pub fn cache_key(text: &str, dims: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hasher.update(b":");
    hasher.update(dims.to_string().as_bytes());
    let digest = hasher.finalize();
    format!("{digest:x}")[..KEY_HEX_LEN].to_string()
}

/// Whether `(text, dims)` is eligible for caching at all.
fn bypasses_cache(text: &str, dims: i64) -> bool {
    text.trim().is_empty() || dims <= 0
}

pub struct DiskCache {
    memory: MemoryTier,
    disk: DiskTier,
    index: IndexStore,
    stats: Arc<Stats>,
}

impl DiskCache {
    pub fn new(root: PathBuf, max_bytes: u64, stats: Arc<Stats>) -> Result<Self> {
        let disk = DiskTier::new(root.clone())?;
        let index = IndexStore::load_or_empty(root.join("index.json"), max_bytes);
        Ok(DiskCache {
            memory: MemoryTier::new(MEMORY_TIER_CAPACITY),
            disk,
            index,
            stats,
        })
    }

    /// Returns a copy of the cached embedding for `(text, dims)`, or `None`
    /// on a miss. Never blocks on eviction.
    pub fn get(&self, text: &str, dims: i64) -> Option<Vec<f32>> {
        if bypasses_cache(text, dims) {
            return None;
        }
        let key = cache_key(text, dims);

        if let Some(v) = self.memory.get(&key) {
            self.stats.record_cache_hit();
            return Some(v);
        }

        match self.disk.read(&key, dims as usize) {
            Ok(Some(v)) => {
                self.index.touch(&key);
                self.memory.put(key, v.clone());
                self.stats.record_cache_hit();
                Some(v)
            }
            Ok(None) => {
                self.stats.record_cache_miss();
                None
            }
            Err(e) => {
                warn!(error = %e, "cache disk read failed, treating as miss");
                self.stats.record_cache_miss();
                None
            }
        }
    }

    /// Stores `embedding` for `(text, dims)`, evicting on-disk data down to
    /// 0.8 * max_bytes if this write pushes total bytes over budget.
    pub fn put(&self, text: &str, dims: i64, embedding: &[f32]) {
        if bypasses_cache(text, dims) {
            return;
        }
        let key = cache_key(text, dims);

        let bytes = match self.disk.write(&key, embedding) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "cache disk write failed");
                return;
            }
        };

        let evicted = self.index.record_write(key.clone(), dims as u64, bytes);
        for evicted_key in evicted {
            if let Err(e) = self.disk.remove(&evicted_key) {
                warn!(error = %e, key = %evicted_key, "failed to remove evicted cache file");
            }
        }

        self.memory.put(key, embedding.to_vec());
    }

    /// Flushes the index to disk; called on shutdown.
    pub fn flush(&self) {
        self.index.persist();
    }

    /// `(entry count, total bytes)`, for the `health` control message.
    pub fn usage(&self) -> (u64, u64) {
        self.index.usage()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn cache() -> (DiskCache, tempfile::TempDir) {
        let dir = tempdir().expect("tempdir");
        let cache = DiskCache::new(dir.path().to_path_buf(), 10 * 1024 * 1024, Arc::new(Stats::default()))
            .expect("cache construction");
        (cache, dir)
    }

    #[test]
    fn empty_text_bypasses_cache() {
        let (cache, _dir) = cache();
        cache.put("", 8, &[1.0; 8]);
        assert!(cache.get("", 8).is_none());
    }

    #[test]
    fn non_positive_dims_bypass_cache() {
        let (cache, _dir) = cache();
        cache.put("hello", 0, &[1.0]);
        assert!(cache.get("hello", 0).is_none());
    }

    #[test]
    fn round_trip_hits_memory_tier() {
        let (cache, _dir) = cache();
        let v = vec![0.1_f32, 0.2, 0.3];
        cache.put("hello", 3, &v);
        let got = cache.get("hello", 3).expect("cache hit");
        assert_eq!(got, v);
    }

    #[test]
    fn dimension_mismatch_is_treated_as_miss() {
        let (cache, _dir) = cache();
        cache.put("hello", 3, &[0.1, 0.2, 0.3]);
        // same text, different dims => different key entirely, must miss.
        assert!(cache.get("hello", 4).is_none());
    }

    #[test]
    fn distinct_keys_round_trip_independently_after_eviction_from_memory() {
        let (cache, _dir) = cache();
        cache.put("a", 2, &[1.0, 2.0]);
        cache.put("b", 2, &[3.0, 4.0]);
        assert_eq!(cache.get("a", 2), Some(vec![1.0, 2.0]));
        assert_eq!(cache.get("b", 2), Some(vec![3.0, 4.0]));
    }
}
