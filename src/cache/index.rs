//! Single JSON index recording `{dims, bytes, created_at, accessed_at}` per
//! cache key. Persisted every 100th write and on shutdown via temp-file +
//! rename; rebuilt as empty (non-fatal) on any read failure. Also owns the
//! on-disk capacity bound: once total bytes exceed `max_bytes`, the caller
//! is told which keys to evict down to `0.8 * max_bytes`.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

const PERSIST_EVERY_N_WRITES: u64 = 100;
const EVICT_TO_FRACTION: f64 = 0.8;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub dims: u64,
    pub bytes: u64,
    pub created_at: i64,
    pub accessed_at: i64,
}

struct Inner {
    entries: HashMap<String, IndexEntry>,
    total_bytes: u64,
    writes_since_persist: u64,
}

pub struct IndexStore {
    path: PathBuf,
    max_bytes: u64,
    inner: Mutex<Inner>,
}

impl IndexStore {
    pub fn load_or_empty(path: PathBuf, max_bytes: u64) -> Self {
        let entries = fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str::<HashMap<String, IndexEntry>>(&raw).ok())
            .unwrap_or_else(|| {
                if path.exists() {
                    warn!(path = %path.display(), "cache index unreadable, rebuilding empty");
                }
                HashMap::new()
            });
        let total_bytes = entries.values().map(|e| e.bytes).sum();
        IndexStore {
            path,
            max_bytes,
            inner: Mutex::new(Inner {
                entries,
                total_bytes,
                writes_since_persist: 0,
            }),
        }
    }

    pub fn touch(&self, key: &str) {
        let mut inner = self.inner.lock();
        if let Some(e) = inner.entries.get_mut(key) {
            e.accessed_at = Utc::now().timestamp_millis();
        }
    }

    /// Records a write, persists every 100th write, and returns the keys
    /// that must be evicted from disk to respect the byte budget. The
    /// caller removes those files *after* this call returns, once the
    /// index lock has been released.
    pub fn record_write(&self, key: String, dims: u64, bytes: u64) -> Vec<String> {
        let mut evicted = Vec::new();
        let should_persist;
        {
            let mut inner = self.inner.lock();
            let now = Utc::now().timestamp_millis();
            if let Some(old) = inner.entries.get(&key) {
                inner.total_bytes = inner.total_bytes.saturating_sub(old.bytes);
            }
            inner.total_bytes += bytes;
            inner.entries.insert(
                key,
                IndexEntry {
                    dims,
                    bytes,
                    created_at: now,
                    accessed_at: now,
                },
            );
            inner.writes_since_persist += 1;
            should_persist = inner.writes_since_persist >= PERSIST_EVERY_N_WRITES;

            if inner.total_bytes > self.max_bytes {
                let target = (self.max_bytes as f64 * EVICT_TO_FRACTION) as u64;
                let mut by_age: Vec<(String, i64)> = inner
                    .entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.accessed_at))
                    .collect();
                by_age.sort_by_key(|(_, accessed_at)| *accessed_at);
                for (k, _) in by_age {
                    if inner.total_bytes <= target {
                        break;
                    }
                    if let Some(e) = inner.entries.remove(&k) {
                        inner.total_bytes = inner.total_bytes.saturating_sub(e.bytes);
                        evicted.push(k);
                    }
                }
            }

            if should_persist {
                inner.writes_since_persist = 0;
            }
        }

        if should_persist {
            self.persist();
        }

        evicted
    }

    /// `(entry count, total bytes)`, used for the `health` control message.
    pub fn usage(&self) -> (u64, u64) {
        let inner = self.inner.lock();
        (inner.entries.len() as u64, inner.total_bytes)
    }

    pub fn persist(&self) {
        let snapshot = {
            let inner = self.inner.lock();
            inner.entries.clone()
        };
        if let Some(parent) = self.path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                warn!(error = %e, "failed to create cache index directory");
                return;
            }
        }
        let body = match serde_json::to_vec_pretty(&snapshot) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "failed to serialize cache index");
                return;
            }
        };
        let tmp_path = self
            .path
            .parent()
            .unwrap_or_else(|| std::path::Path::new("."))
            .join(format!(".tmp-index-{}", Uuid::new_v4()));
        let write_result = (|| -> std::io::Result<()> {
            let mut f = fs::File::create(&tmp_path)?;
            f.write_all(&body)?;
            f.sync_all()?;
            fs::rename(&tmp_path, &self.path)?;
            Ok(())
        })();
        if let Err(e) = write_result {
            warn!(error = %e, "failed to persist cache index");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn record_write_tracks_total_bytes() {
        let dir = tempdir().expect("tempdir");
        let store = IndexStore::load_or_empty(dir.path().join("index.json"), 1_000_000);
        let evicted = store.record_write("k1".into(), 4, 16);
        assert!(evicted.is_empty());
    }

    #[test]
    fn eviction_respects_budget() {
        let dir = tempdir().expect("tempdir");
        let store = IndexStore::load_or_empty(dir.path().join("index.json"), 100);
        store.record_write("k1".into(), 4, 40);
        store.record_write("k2".into(), 4, 40);
        let evicted = store.record_write("k3".into(), 4, 40);
        // total would be 120 > 100, evict oldest (k1) to get to <= 80
        assert_eq!(evicted, vec!["k1".to_string()]);
    }

    #[test]
    fn persist_then_reload_round_trips() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("index.json");
        let store = IndexStore::load_or_empty(path.clone(), 1_000_000);
        store.record_write("k1".into(), 4, 16);
        store.persist();

        let reloaded = IndexStore::load_or_empty(path, 1_000_000);
        let inner = reloaded.inner.lock();
        assert!(inner.entries.contains_key("k1"));
    }
}
