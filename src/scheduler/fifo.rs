//! FIFO + ACK queue mode (optional alternative to the throttler): strict
//! per-priority FIFO with explicit ACK/NACK, lease timeouts, priority aging
//! and a bounded dead-letter queue.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use super::priority::Priority;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    Pending,
    Processing,
}

#[derive(Debug, Clone)]
pub struct QueueItem {
    pub id: Uuid,
    pub priority: Priority,
    pub priority_original: Priority,
    pub payload: JsonValue,
    pub enqueued_at: Instant,
    pub status: ItemStatus,
    pub retry_count: u32,
    pub next_retry_at: Instant,
    pub started_at: Option<Instant>,
    pub lease_expires_at: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct DlqEntry {
    pub item: QueueItem,
    pub last_error: String,
    pub failed_at: Instant,
}

#[derive(Debug, Clone)]
pub struct FifoAckConfig {
    pub lease_timeout: Duration,
    pub max_retries: u32,
    pub base_retry: Duration,
    pub max_retry: Duration,
    pub age_promotion: Duration,
    pub dlq_capacity: usize,
    pub dlq_ttl: Duration,
}

impl Default for FifoAckConfig {
    fn default() -> Self {
        FifoAckConfig {
            lease_timeout: Duration::from_secs(60),
            max_retries: 3,
            base_retry: Duration::from_secs(1),
            max_retry: Duration::from_secs(30),
            age_promotion: Duration::from_secs(30),
            dlq_capacity: 500,
            dlq_ttl: Duration::from_secs(3600),
        }
    }
}

struct Inner {
    deques: [VecDeque<QueueItem>; 5],
    processing: HashMap<Uuid, QueueItem>,
    dlq: VecDeque<DlqEntry>,
}

/// One lock guards the five priority deques and the processing map
/// together, matching the single-lock discipline for this subsystem.
pub struct FifoAckQueue {
    config: FifoAckConfig,
    inner: Mutex<Inner>,
}

impl FifoAckQueue {
    pub fn new(config: FifoAckConfig) -> Self {
        FifoAckQueue {
            config,
            inner: Mutex::new(Inner {
                deques: Default::default(),
                processing: HashMap::new(),
                dlq: VecDeque::new(),
            }),
        }
    }

    pub fn enqueue(&self, payload: JsonValue, priority: Priority) -> Uuid {
        self.enqueue_with_id(Uuid::new_v4(), payload, priority)
    }

    /// Same as [`Self::enqueue`] but with a caller-supplied id, so a item
    /// reclaimed from the overflow queue keeps the same identity across
    /// both stores instead of being re-keyed on arrival.
    pub fn enqueue_with_id(&self, id: Uuid, payload: JsonValue, priority: Priority) -> Uuid {
        let now = Instant::now();
        let item = QueueItem {
            id,
            priority,
            priority_original: priority,
            payload,
            enqueued_at: now,
            status: ItemStatus::Pending,
            retry_count: 0,
            next_retry_at: now,
            started_at: None,
            lease_expires_at: None,
        };
        let mut inner = self.inner.lock();
        inner.deques[priority.index()].push_back(item);
        id
    }

    /// Total pending + processing items, used for admission control.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.deques.iter().map(VecDeque::len).sum::<usize>() + inner.processing.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Picks the highest non-empty priority and returns the oldest pending
    /// item whose `next_retry_at` has passed, marking it `processing` with
    /// a fresh lease.
    pub fn dequeue(&self) -> Option<QueueItem> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        for priority in Priority::ALL {
            let deque = &mut inner.deques[priority.index()];
            if let Some(pos) = deque.iter().position(|item| item.next_retry_at <= now) {
                let mut item = deque.remove(pos)?;
                item.status = ItemStatus::Processing;
                item.started_at = Some(now);
                item.lease_expires_at = Some(now + self.config.lease_timeout);
                inner.processing.insert(item.id, item.clone());
                return Some(item);
            }
        }
        None
    }

    pub fn ack(&self, id: Uuid) -> bool {
        self.inner.lock().processing.remove(&id).is_some()
    }

    /// Increments `retry_count`; moves to DLQ at `max_retries`, otherwise
    /// reschedules with exponential backoff back onto its priority's tail.
    /// Returns `true` if this call moved the item to the DLQ.
    pub fn nack(&self, id: Uuid, error: &str) -> bool {
        let mut inner = self.inner.lock();
        let Some(mut item) = inner.processing.remove(&id) else {
            return false;
        };
        item.status = ItemStatus::Pending;
        item.started_at = None;
        item.lease_expires_at = None;
        item.retry_count += 1;

        if item.retry_count >= self.config.max_retries {
            push_dlq(&mut inner.dlq, self.config.dlq_capacity, item, error);
            return true;
        }

        let backoff = self.config.base_retry * 2u32.pow(item.retry_count.saturating_sub(1));
        item.next_retry_at = Instant::now() + backoff.min(self.config.max_retry);
        let priority = item.priority;
        inner.deques[priority.index()].push_back(item);
        false
    }

    /// Drain-cycle maintenance: reclaims items past their lease and
    /// promotes pending items aged past `age_promotion`. Returns the
    /// number of leases reclaimed.
    pub fn run_maintenance(&self) -> usize {
        let reclaimed = self.reclaim_expired_leases();
        self.age_promote_pending();
        reclaimed
    }

    fn reclaim_expired_leases(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<Uuid> = {
            let inner = self.inner.lock();
            inner
                .processing
                .values()
                .filter(|item| item.lease_expires_at.is_some_and(|exp| now > exp))
                .map(|item| item.id)
                .collect()
        };
        for id in &expired {
            self.nack(*id, "lease timeout");
        }
        expired.len()
    }

    fn age_promote_pending(&self) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let age_promotion = self.config.age_promotion;
        for priority in Priority::ALL {
            if priority == Priority::Critical {
                continue;
            }
            let idx = priority.index();
            let mut i = 0;
            while i < inner.deques[idx].len() {
                let aged = now.duration_since(inner.deques[idx][i].enqueued_at) > age_promotion;
                if aged {
                    let Some(mut item) = inner.deques[idx].remove(i) else {
                        continue;
                    };
                    item.priority = item.priority.promote();
                    let new_idx = item.priority.index();
                    inner.deques[new_idx].push_back(item);
                } else {
                    i += 1;
                }
            }
        }
    }

    pub fn dlq_snapshot(&self) -> Vec<DlqEntry> {
        self.inner.lock().dlq.iter().cloned().collect()
    }
}

fn push_dlq(dlq: &mut VecDeque<DlqEntry>, capacity: usize, item: QueueItem, error: &str) {
    let now = Instant::now();
    while dlq.front().is_some_and(|e| now.duration_since(e.failed_at) > Duration::from_secs(3600)) {
        dlq.pop_front();
    }
    if dlq.len() >= capacity {
        dlq.pop_front();
    }
    dlq.push_back(DlqEntry {
        item,
        last_error: error.to_string(),
        failed_at: now,
    });
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dequeue_respects_priority_order() {
        let queue = FifoAckQueue::new(FifoAckConfig::default());
        queue.enqueue(json!({"text": "low"}), Priority::Low);
        queue.enqueue(json!({"text": "critical"}), Priority::Critical);
        let first = queue.dequeue().expect("item");
        assert_eq!(first.priority, Priority::Critical);
    }

    #[test]
    fn nack_to_dlq_after_max_retries() {
        let config = FifoAckConfig {
            max_retries: 2,
            ..FifoAckConfig::default()
        };
        let queue = FifoAckQueue::new(config);
        let id = queue.enqueue(json!({"text": "x"}), Priority::Medium);
        queue.dequeue();
        assert!(!queue.nack(id, "boom"));
        assert_eq!(queue.dlq_snapshot().len(), 0);

        queue.dequeue();
        assert!(queue.nack(id, "boom again"));
        assert_eq!(queue.dlq_snapshot().len(), 1);
    }

    #[test]
    fn ack_removes_in_flight_item() {
        let queue = FifoAckQueue::new(FifoAckConfig::default());
        let id = queue.enqueue(json!({"text": "x"}), Priority::Medium);
        queue.dequeue();
        assert!(queue.ack(id));
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn enqueue_with_id_preserves_caller_supplied_identity() {
        let queue = FifoAckQueue::new(FifoAckConfig::default());
        let id = Uuid::new_v4();
        let returned = queue.enqueue_with_id(id, json!({"text": "reclaimed"}), Priority::High);
        assert_eq!(returned, id);
        let item = queue.dequeue().expect("item");
        assert_eq!(item.id, id);
    }
}
