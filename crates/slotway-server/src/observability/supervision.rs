//! Task Supervision
//!
//! Restart bookkeeping for migration tasks. A task that fails is restarted
//! after an exponentially growing backoff until it has failed `max_restarts`
//! times within `window`; after that the failure is final and the task's
//! progress is marked FAILED.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Restarts allowed within `window`
    pub max_restarts: u32,
    pub window: Duration,
    /// Backoff before the first restart; doubles per consecutive failure
    pub backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            window: Duration::from_secs(60),
            backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RestartPolicy {
    /// Quick retries for tests and in-process deployments.
    pub fn fast() -> Self {
        Self {
            max_restarts: 10,
            window: Duration::from_secs(30),
            backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(200),
        }
    }

    /// Backoff for the `attempt`-th consecutive restart (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        self.backoff
            .checked_mul(1u32 << shift)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Restart history of one supervised task.
#[derive(Debug)]
pub struct RestartTracker {
    policy: RestartPolicy,
    restarts: VecDeque<Instant>,
    consecutive: u32,
}

impl RestartTracker {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            restarts: VecDeque::new(),
            consecutive: 0,
        }
    }

    /// Record a failure. Returns the backoff to wait before restarting, or
    /// `None` when the policy is exhausted.
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.record_failure_at(Instant::now())
    }

    fn record_failure_at(&mut self, now: Instant) -> Option<Duration> {
        while let Some(oldest) = self.restarts.front() {
            if now.duration_since(*oldest) > self.policy.window {
                self.restarts.pop_front();
            } else {
                break;
            }
        }
        if self.restarts.len() >= self.policy.max_restarts as usize {
            return None;
        }
        self.restarts.push_back(now);
        self.consecutive += 1;
        Some(self.policy.backoff_for(self.consecutive))
    }

    /// Clear the consecutive failure streak after a successful run.
    pub fn reset(&mut self) {
        self.consecutive = 0;
    }

    pub fn restart_count(&self) -> usize {
        self.restarts.len()
    }

    pub fn policy(&self) -> &RestartPolicy {
        &self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RestartPolicy {
            max_restarts: 10,
            window: Duration::from_secs(60),
            backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
        };
        assert_eq!(policy.backoff_for(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(400));
        assert_eq!(policy.backoff_for(4), Duration::from_millis(500));
        assert_eq!(policy.backoff_for(40), Duration::from_millis(500));
    }

    #[test]
    fn test_exhaustion_within_window() {
        let mut tracker = RestartTracker::new(RestartPolicy {
            max_restarts: 2,
            window: Duration::from_secs(10),
            backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(10),
        });
        let start = Instant::now();
        assert!(tracker.record_failure_at(start).is_some());
        assert!(tracker.record_failure_at(start + Duration::from_secs(1)).is_some());
        assert!(tracker.record_failure_at(start + Duration::from_secs(2)).is_none());

        // Failures older than the window no longer count.
        assert!(tracker.record_failure_at(start + Duration::from_secs(12)).is_some());
        assert_eq!(tracker.restart_count(), 1);
    }

    #[test]
    fn test_reset_restarts_backoff_sequence() {
        let mut tracker = RestartTracker::new(RestartPolicy::default());
        tracker.record_failure();
        let second = tracker.record_failure();
        tracker.reset();
        let after_reset = tracker.record_failure();
        assert!(after_reset < second);
        assert_eq!(after_reset, Some(tracker.policy().backoff));
    }
}
