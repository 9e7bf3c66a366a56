//! Request priority levels, ordered lowest-index-first so `Priority::Critical`
//! sorts ahead of `Priority::Trivial` in the FIFO-ACK deque array.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
    Trivial,
}

impl Priority {
    pub const ALL: [Priority; 5] = [
        Priority::Critical,
        Priority::High,
        Priority::Medium,
        Priority::Low,
        Priority::Trivial,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Promotes one level toward `Critical`; a no-op already at `Critical`.
    pub fn promote(self) -> Priority {
        match self {
            Priority::Critical => Priority::Critical,
            Priority::High => Priority::Critical,
            Priority::Medium => Priority::High,
            Priority::Low => Priority::Medium,
            Priority::Trivial => Priority::Low,
        }
    }

    pub fn delay_multiplier(self) -> f64 {
        match self {
            Priority::Critical => 0.1,
            Priority::High => 0.5,
            Priority::Medium => 1.0,
            Priority::Low => 2.0,
            Priority::Trivial => 4.0,
        }
    }

    pub fn default_single() -> Priority {
        Priority::Medium
    }

    pub fn default_batch() -> Priority {
        Priority::Low
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn ordering_ranks_critical_first() {
        assert!(Priority::Critical < Priority::Trivial);
    }

    #[test]
    fn promote_saturates_at_critical() {
        assert_eq!(Priority::Critical.promote(), Priority::Critical);
        assert_eq!(Priority::High.promote(), Priority::Critical);
    }
}
