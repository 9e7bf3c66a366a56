//! Scheduler (C5): admission control in front of one of two queueing
//! disciplines — a lightweight token-bucket throttler (default) or a
//! strict FIFO + ACK queue with retries and a dead-letter queue.

mod fifo;
mod priority;
mod throttle;

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tracing::warn;
use uuid::Uuid;

pub use fifo::{DlqEntry, FifoAckConfig, FifoAckQueue, ItemStatus, QueueItem};
pub use priority::Priority;
pub use throttle::{ThrottleConfig, TokenBucketThrottler};

use crate::monitor::CpuMonitor;
use crate::stats::Stats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerMode {
    Throttle,
    FifoAck,
}

#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    pub reject_cpu_percent: f64,
    pub queue_cpu_percent: f64,
    pub max_queue: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        AdmissionConfig {
            reject_cpu_percent: 90.0,
            queue_cpu_percent: 70.0,
            max_queue: 1000,
        }
    }
}

pub enum Admission {
    /// Proceed with in-process scheduling.
    Proceed,
    /// Queue saturated or CPU hot; caller should hand the item to the
    /// overflow queue instead of processing it now.
    Spill,
    /// No overflow available and the system is over the reject threshold;
    /// surface an error to the client immediately.
    Reject,
}

pub struct Scheduler {
    mode: SchedulerMode,
    admission: AdmissionConfig,
    throttler: TokenBucketThrottler,
    /// Always present, independent of `mode`: the overflow drain needs this
    /// as its landing spot for reclaimed work even when direct requests are
    /// scheduled through the throttler.
    fifo: FifoAckQueue,
    monitor: Arc<CpuMonitor>,
    overflow_available: bool,
    thread_min: usize,
    thread_max: usize,
    stats: Arc<Stats>,
}

impl Scheduler {
    pub fn new(
        mode: SchedulerMode,
        admission: AdmissionConfig,
        throttle_config: ThrottleConfig,
        fifo_config: FifoAckConfig,
        monitor: Arc<CpuMonitor>,
        overflow_available: bool,
        thread_min: usize,
        thread_max: usize,
        stats: Arc<Stats>,
    ) -> Self {
        Scheduler {
            throttler: TokenBucketThrottler::new(throttle_config, thread_max),
            fifo: FifoAckQueue::new(fifo_config),
            mode,
            admission,
            monitor,
            overflow_available,
            thread_min,
            thread_max,
            stats,
        }
    }

    pub fn mode(&self) -> SchedulerMode {
        self.mode
    }

    pub fn queue_len(&self) -> usize {
        self.fifo.len()
    }

    /// Gate for the overflow drain task: only claim rows from the durable
    /// queue while there is CPU headroom to actually process them.
    pub fn cpu_below_queue_threshold(&self) -> bool {
        (self.monitor.trailing_mean() as f64) < self.admission.queue_cpu_percent
    }

    /// Decides whether a unit of work proceeds, spills to overflow, or is
    /// rejected outright, per §4.5's admission-control rules.
    pub fn admit(&self) -> Admission {
        let cpu = self.monitor.trailing_mean() as f64;

        if cpu > self.admission.reject_cpu_percent && !self.overflow_available {
            return Admission::Reject;
        }
        if cpu > self.admission.queue_cpu_percent && self.overflow_available {
            return Admission::Spill;
        }
        if self.queue_len() >= self.admission.max_queue {
            return if self.overflow_available {
                Admission::Spill
            } else {
                Admission::Reject
            };
        }
        Admission::Proceed
    }

    /// Throttler-mode gate: sleeps the caller for the computed delay before
    /// it is allowed to proceed with a single-item encode.
    pub async fn acquire(&self, priority: Priority) {
        let cpu = self.monitor.trailing_mean() as f64;
        self.throttler.acquire(priority, cpu).await;
        self.stats.record_throttle_event();
    }

    /// Throttler-mode gate for a batch: one `acquire` call plus a cooldown
    /// proportional to batch size.
    pub async fn acquire_batch(&self, priority: Priority, batch_len: usize) {
        self.acquire(priority).await;
        let cooldown = self.throttler.batch_cooldown_for(batch_len);
        if !cooldown.is_zero() {
            tokio::time::sleep(cooldown).await;
        }
    }

    pub fn throttle_events(&self) -> u64 {
        self.stats.throttle_events.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn fifo(&self) -> &FifoAckQueue {
        &self.fifo
    }

    pub fn enqueue(&self, payload: JsonValue, priority: Priority) -> Uuid {
        self.fifo.enqueue(payload, priority)
    }

    /// Periodic maintenance: rescales the encoder thread budget from the
    /// current CPU reading, and reclaims expired leases / ages pending
    /// priorities in the FIFO queue (populated by the overflow drain and,
    /// in FIFO+ACK mode, by direct requests). Intended to be called from a
    /// 5 s ticker.
    pub fn run_maintenance(&self) -> usize {
        let cpu = self.monitor.trailing_mean() as f64;
        self.throttler.rescale_threads(cpu, self.thread_min, self.thread_max);
        let reclaimed = self.fifo.run_maintenance();
        if reclaimed > 0 {
            warn!(reclaimed, "reclaimed expired leases");
        }
        reclaimed
    }

    /// Runs `run_maintenance` on a fixed interval until cancelled.
    pub async fn run_maintenance_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        loop {
            ticker.tick().await;
            self.run_maintenance();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::monitor::CpuMonitor;

    fn scheduler(mode: SchedulerMode, overflow_available: bool) -> Scheduler {
        Scheduler::new(
            mode,
            AdmissionConfig::default(),
            ThrottleConfig::default(),
            FifoAckConfig::default(),
            Arc::new(CpuMonitor::new()),
            overflow_available,
            1,
            4,
            Arc::new(Stats::default()),
        )
    }

    #[test]
    fn admit_proceeds_under_normal_load() {
        let scheduler = scheduler(SchedulerMode::Throttle, false);
        assert!(matches!(scheduler.admit(), Admission::Proceed));
    }

    #[test]
    fn enqueue_is_available_regardless_of_mode() {
        let scheduler = scheduler(SchedulerMode::Throttle, false);
        scheduler.enqueue(serde_json::json!({}), Priority::Low);
        assert_eq!(scheduler.queue_len(), 1);
    }

    #[tokio::test]
    async fn acquire_increments_throttle_events() {
        let scheduler = scheduler(SchedulerMode::Throttle, false);
        scheduler.acquire(Priority::Critical).await;
        assert_eq!(scheduler.throttle_events(), 1);
    }
}
