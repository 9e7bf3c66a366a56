//! CPU Monitor (C4): samples system CPU utilisation over a short trailing
//! window. Grounded in the same `sysinfo::System` + `parking_lot::Mutex`
//! shape the teacher corpus uses for its own resource guardrails, reduced
//! to exactly what the dimension-adapter-free scheduler needs: an
//! instantaneous reading and a trailing mean.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sysinfo::System;

const TRAILING_WINDOW: usize = 10;
const MIN_SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

struct Inner {
    system: System,
    samples: VecDeque<f32>,
    last_sample_at: Option<Instant>,
    last_value: f32,
}

/// Sampled CPU utilisation, degrading gracefully (returns the last known
/// value) on platforms where the cumulative CPU-time counter is
/// unavailable or hasn't had time to produce a second reading yet.
pub struct CpuMonitor {
    inner: Mutex<Inner>,
}

impl CpuMonitor {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_all();
        CpuMonitor {
            inner: Mutex::new(Inner {
                system,
                samples: VecDeque::with_capacity(TRAILING_WINDOW),
                last_sample_at: None,
                last_value: 0.0,
            }),
        }
    }

    /// Refreshes the reading if at least [`MIN_SAMPLE_INTERVAL`] has
    /// elapsed since the last refresh; otherwise returns the cached value.
    /// Called from the scheduler's hot path, so cheap repeated calls must
    /// not re-touch the OS counter every time.
    pub fn sample(&self) -> f32 {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let should_refresh = match inner.last_sample_at {
            None => true,
            Some(last) => now.duration_since(last) >= MIN_SAMPLE_INTERVAL,
        };

        if should_refresh {
            inner.system.refresh_cpu_all();
            let value = inner.system.global_cpu_usage();
            inner.last_value = value;
            inner.last_sample_at = Some(now);
            if inner.samples.len() == TRAILING_WINDOW {
                inner.samples.pop_front();
            }
            inner.samples.push_back(value);
        }

        inner.last_value
    }

    /// Mean of the last [`TRAILING_WINDOW`] samples (or fewer, if the
    /// monitor has not been running long).
    pub fn trailing_mean(&self) -> f32 {
        let inner = self.inner.lock();
        if inner.samples.is_empty() {
            return inner.last_value;
        }
        inner.samples.iter().sum::<f32>() / inner.samples.len() as f32
    }
}

impl Default for CpuMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn sample_returns_a_finite_percentage() {
        let monitor = CpuMonitor::new();
        let v = monitor.sample();
        assert!(v.is_finite());
        assert!((0.0..=100.0).contains(&v) || v == 0.0);
    }

    #[test]
    fn trailing_mean_before_any_sample_is_zero() {
        let monitor = CpuMonitor::new();
        assert_eq!(monitor.trailing_mean(), 0.0);
    }
}
