//! Lightweight throttler mode (default): token-bucket rate limiting with
//! priority and CPU-adaptive delay multipliers, plus periodic dynamic
//! thread-count scaling.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::priority::Priority;

#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    pub base_delay: Duration,
    pub max_rps: f64,
    pub burst: f64,
    pub batch_delay: Duration,
    pub batch_cooldown: Duration,
    pub batch_cooldown_threshold: usize,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        ThrottleConfig {
            base_delay: Duration::from_millis(10),
            max_rps: 50.0,
            burst: 20.0,
            batch_delay: Duration::from_millis(20),
            batch_cooldown: Duration::from_millis(200),
            batch_cooldown_threshold: 32,
        }
    }
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
    window_start: Instant,
    window_count: u32,
}

/// CPU utilisation bands and the request-delay multiplier each applies.
fn cpu_multiplier(cpu_percent: f64) -> f64 {
    if cpu_percent >= 85.0 {
        10.0
    } else if cpu_percent >= 70.0 {
        4.0
    } else if cpu_percent >= 50.0 {
        2.0
    } else if cpu_percent >= 30.0 {
        1.5
    } else {
        1.0
    }
}

pub struct TokenBucketThrottler {
    config: ThrottleConfig,
    state: Mutex<BucketState>,
    thread_count: AtomicUsize,
}

impl TokenBucketThrottler {
    pub fn new(config: ThrottleConfig, initial_threads: usize) -> Self {
        let now = Instant::now();
        TokenBucketThrottler {
            state: Mutex::new(BucketState {
                tokens: config.burst,
                last_refill: now,
                window_start: now,
                window_count: 0,
            }),
            config,
            thread_count: AtomicUsize::new(initial_threads),
        }
    }

    /// Computes the delay for one request at `priority` under `cpu_percent`
    /// load, refilling and consuming from the token bucket, and sleeps for
    /// it. Returns the delay actually applied (useful for tests/stats).
    pub async fn acquire(&self, priority: Priority, cpu_percent: f64) -> Duration {
        let delay = self.compute_delay(priority, cpu_percent);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        delay
    }

    fn compute_delay(&self, priority: Priority, cpu_percent: f64) -> Duration {
        let mut state = self.state.lock();
        let now = Instant::now();

        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.config.max_rps).min(self.config.burst);
        state.last_refill = now;

        if now.duration_since(state.window_start) >= Duration::from_secs(1) {
            state.window_start = now;
            state.window_count = 0;
        }
        state.window_count += 1;

        let base = self.config.base_delay.as_secs_f64()
            * priority.delay_multiplier()
            * cpu_multiplier(cpu_percent);

        let mut delay_secs = base;
        if state.tokens < 1.0 {
            delay_secs += (1.0 - state.tokens) / self.config.max_rps;
            state.tokens = 0.0;
        } else {
            state.tokens -= 1.0;
        }

        if state.window_count as f64 > self.config.burst {
            delay_secs += self.config.batch_cooldown.as_secs_f64();
        }

        Duration::from_secs_f64(delay_secs.max(0.0))
    }

    /// Extra per-batch cooldown, on top of one `acquire` call, proportional
    /// to batch size.
    pub fn batch_cooldown_for(&self, batch_len: usize) -> Duration {
        if batch_len >= self.config.batch_cooldown_threshold {
            self.config.batch_cooldown
        } else {
            self.config.batch_delay
        }
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count.load(Ordering::Relaxed)
    }

    /// Recomputes the encoder thread budget from the current CPU reading,
    /// called every 5 s by the scheduler's maintenance task.
    pub fn rescale_threads(&self, cpu_percent: f64, thread_min: usize, thread_max: usize) -> usize {
        let current = self.thread_count.load(Ordering::Relaxed);
        let next = if cpu_percent >= 85.0 {
            thread_min
        } else if cpu_percent >= 70.0 {
            current.saturating_sub(1).max(thread_min)
        } else if cpu_percent <= 30.0 {
            (current + 1).min(thread_max)
        } else {
            current
        };
        self.thread_count.store(next, Ordering::Relaxed);
        next
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn cpu_multiplier_bands() {
        assert_eq!(cpu_multiplier(10.0), 1.0);
        assert_eq!(cpu_multiplier(40.0), 1.5);
        assert_eq!(cpu_multiplier(60.0), 2.0);
        assert_eq!(cpu_multiplier(75.0), 4.0);
        assert_eq!(cpu_multiplier(90.0), 10.0);
    }

    #[test]
    fn rescale_moves_toward_bounds() {
        let throttler = TokenBucketThrottler::new(ThrottleConfig::default(), 4);
        assert_eq!(throttler.rescale_threads(90.0, 1, 8), 1);
        let throttler = TokenBucketThrottler::new(ThrottleConfig::default(), 4);
        assert_eq!(throttler.rescale_threads(10.0, 1, 8), 5);
    }

    #[tokio::test]
    async fn acquire_does_not_panic_and_consumes_tokens() {
        let throttler = TokenBucketThrottler::new(ThrottleConfig::default(), 1);
        let delay = throttler.acquire(Priority::Critical, 10.0).await;
        assert!(delay.as_secs_f64() >= 0.0);
    }
}
