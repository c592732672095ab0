//! Requeue policy for failed reconciliations
//!
//! Each error is mapped to a [`RetryPolicy`]. Exponential backoff is tracked
//! per Cat UID so that one flapping Cat does not slow the others down.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use kube::runtime::controller::Action;
use tracing::{debug, warn};

/// First delay of the exponential backoff
const BASE_DELAY: Duration = Duration::from_secs(5);

/// Upper bound of the exponential backoff
const MAX_DELAY: Duration = Duration::from_secs(300);

/// How to requeue after a failed reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Exponential backoff driven by the attempt counter
    Backoff,
    /// Always wait the same amount of time
    Fixed(Duration),
    /// Do not retry until the object changes
    AwaitChange,
}

/// Attempt counters keyed by object UID
#[derive(Debug, Default)]
pub struct RetryTracker {
    attempts: Mutex<HashMap<String, u32>>,
}

impl RetryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one more failure and return the attempt number, starting at 1
    pub fn increment(&self, uid: &str) -> u32 {
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        let count = attempts.entry(uid.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    /// Forget failures after a successful reconciliation
    pub fn reset(&self, uid: &str) {
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        attempts.remove(uid);
    }

    pub fn get(&self, uid: &str) -> u32 {
        let attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        attempts.get(uid).copied().unwrap_or(0)
    }
}

/// Delay for the given attempt: 5s, 10s, 20s, ... capped at 5 minutes
pub fn backoff_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    BASE_DELAY
        .saturating_mul(2u32.saturating_pow(exponent))
        .min(MAX_DELAY)
}

/// Turn a policy and attempt count into a controller action
pub fn compute_backoff(attempt: u32, policy: RetryPolicy) -> Action {
    match policy {
        RetryPolicy::Backoff => {
            let delay = backoff_delay(attempt);
            debug!(attempt, delay_secs = delay.as_secs(), "Scheduling retry with backoff");
            Action::requeue(delay)
        }
        RetryPolicy::Fixed(delay) => {
            debug!(attempt, delay_secs = delay.as_secs(), "Scheduling retry after fixed delay");
            Action::requeue(delay)
        }
        RetryPolicy::AwaitChange => {
            warn!(attempt, "Error will not clear by itself, waiting for resource change");
            Action::await_change()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_counts_per_uid() {
        let tracker = RetryTracker::new();

        assert_eq!(tracker.get("uid-tom"), 0);
        assert_eq!(tracker.increment("uid-tom"), 1);
        assert_eq!(tracker.increment("uid-tom"), 2);
        assert_eq!(tracker.increment("uid-felix"), 1);
        assert_eq!(tracker.get("uid-tom"), 2);
    }

    #[test]
    fn test_tracker_reset() {
        let tracker = RetryTracker::new();
        tracker.increment("uid-tom");
        tracker.increment("uid-tom");

        tracker.reset("uid-tom");
        assert_eq!(tracker.get("uid-tom"), 0);
        assert_eq!(tracker.increment("uid-tom"), 1);
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        assert_eq!(backoff_delay(1), Duration::from_secs(5));
        assert_eq!(backoff_delay(2), Duration::from_secs(10));
        assert_eq!(backoff_delay(3), Duration::from_secs(20));
        assert_eq!(backoff_delay(6), Duration::from_secs(160));
        assert_eq!(backoff_delay(7), Duration::from_secs(300));
        assert_eq!(backoff_delay(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn test_backoff_attempt_zero_uses_base_delay() {
        assert_eq!(backoff_delay(0), Duration::from_secs(5));
    }

    #[test]
    fn test_compute_backoff_actions() {
        assert_eq!(
            compute_backoff(3, RetryPolicy::Backoff),
            Action::requeue(Duration::from_secs(20))
        );
        assert_eq!(
            compute_backoff(8, RetryPolicy::Fixed(Duration::from_secs(10))),
            Action::requeue(Duration::from_secs(10))
        );
        assert_eq!(
            compute_backoff(1, RetryPolicy::AwaitChange),
            Action::await_change()
        );
    }
}
