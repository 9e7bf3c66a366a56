//! In-memory LRU front tier (R=100 entries). Backed by a real intrusive
//! LRU structure (the `lru` crate) rather than an insertion-order map scan,
//! per the redesign note against ad hoc LRU-via-insertion-order.

use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

pub struct MemoryTier {
    inner: Mutex<LruCache<String, Vec<f32>>>,
}

impl MemoryTier {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        MemoryTier {
            inner: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Returns a copy on hit and promotes the entry to most-recently-used.
    pub fn get(&self, key: &str) -> Option<Vec<f32>> {
        self.inner.lock().get(key).cloned()
    }

    /// Inserts a copy of `value`, evicting the least-recently-used entry
    /// if the tier is at capacity.
    pub fn put(&self, key: String, value: Vec<f32>) {
        self.inner.lock().put(key, value);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn overflow_evicts_least_recently_used() {
        let tier = MemoryTier::new(2);
        tier.put("a".into(), vec![1.0]);
        tier.put("b".into(), vec![2.0]);
        // touch "a" so "b" becomes the LRU entry
        assert!(tier.get("a").is_some());
        tier.put("c".into(), vec![3.0]);
        assert!(tier.get("b").is_none());
        assert!(tier.get("a").is_some());
        assert!(tier.get("c").is_some());
    }
}
