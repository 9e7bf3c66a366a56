//! Monotone counters and running averages, exposed only through the
//! `stats`/`health` control messages (§6) — never as a network-facing
//! scrape endpoint. Counters are `Relaxed` atomics: the spec already treats
//! them as approximate and eventually consistent, so there is no need to
//! pay for stronger ordering on the hot path.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Default)]
pub struct Stats {
    pub total_embeddings: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub expansions: AtomicU64,
    pub compressions: AtomicU64,
    pub native_passthrough: AtomicU64,
    pub throttle_events: AtomicU64,
    pub total_retries: AtomicU64,
    pub total_processed: AtomicU64,

    /// Running mean latency in microseconds, maintained as an
    /// exponentially-weighted moving average so the history stays O(1).
    latency_ewma_micros: AtomicU64,
    cpu_ewma_millipercent: AtomicU64,
}

const EWMA_ALPHA_PERCENT: u64 = 20; // new sample weight, out of 100

impl Stats {
    pub fn record_embedding(&self) {
        self.total_embeddings.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_expansion(&self) {
        self.expansions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_compression(&self) {
        self.compressions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_native(&self) {
        self.native_passthrough.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_throttle_event(&self) {
        self.throttle_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.total_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_processed(&self) {
        self.total_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_latency(&self, micros: u64) {
        ewma_update(&self.latency_ewma_micros, micros);
    }

    pub fn record_cpu(&self, percent: f32) {
        ewma_update(&self.cpu_ewma_millipercent, (percent * 1000.0) as u64);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_embeddings: self.total_embeddings.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            expansions: self.expansions.load(Ordering::Relaxed),
            compressions: self.compressions.load(Ordering::Relaxed),
            native_passthrough: self.native_passthrough.load(Ordering::Relaxed),
            throttle_events: self.throttle_events.load(Ordering::Relaxed),
            total_retries: self.total_retries.load(Ordering::Relaxed),
            total_processed: self.total_processed.load(Ordering::Relaxed),
            avg_latency_micros: self.latency_ewma_micros.load(Ordering::Relaxed),
            avg_cpu_percent: self.cpu_ewma_millipercent.load(Ordering::Relaxed) as f32 / 1000.0,
        }
    }
}

fn ewma_update(cell: &AtomicU64, sample: u64) {
    let _ = cell.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |prev| {
        Some(if prev == 0 {
            sample
        } else {
            (prev * (100 - EWMA_ALPHA_PERCENT) + sample * EWMA_ALPHA_PERCENT) / 100
        })
    });
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub total_embeddings: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub expansions: u64,
    pub compressions: u64,
    pub native_passthrough: u64,
    pub throttle_events: u64,
    pub total_retries: u64,
    pub total_processed: u64,
    pub avg_latency_micros: u64,
    pub avg_cpu_percent: f32,
}

/// Composed response for the `health` control message: `StatsSnapshot`
/// plus the lifecycle, dimension, and cache facts that only the server
/// (which owns all the components) can assemble.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub loaded: bool,
    pub healthy: bool,
    pub native_dims: Option<usize>,
    pub target_dims: i64,
    pub artifact_tier: Option<String>,
    pub capabilities: Vec<&'static str>,
    pub cache_entries: u64,
    pub cache_bytes: u64,
    pub queue_len: usize,
    pub stats: StatsSnapshot,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = Stats::default();
        stats.record_cache_hit();
        stats.record_cache_hit();
        stats.record_cache_miss();
        let snap = stats.snapshot();
        assert_eq!(snap.cache_hits, 2);
        assert_eq!(snap.cache_misses, 1);
    }

    #[test]
    fn latency_ewma_converges_toward_repeated_sample() {
        let stats = Stats::default();
        for _ in 0..50 {
            stats.record_latency(1000);
        }
        let snap = stats.snapshot();
        assert!((snap.avg_latency_micros as i64 - 1000).abs() < 5);
    }
}
