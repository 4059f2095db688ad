//! Optimistic concurrency and retry policy.
//!
//! A command may declare the aggregate sequence it was decided against. Push
//! compares it with the sequence it reads inside its transaction and refuses
//! the batch with a [`ConcurrencyConflict`] when another writer got there
//! first. Storage-level transaction aborts are retried according to a
//! [`RetryPolicy`].
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//!
//! use keel_core::concurrency::RetryPolicy;
//!
//! let policy = RetryPolicy::default().with_max_attempts(5);
//! assert_eq!(policy.backoff(1), Duration::from_millis(10));
//! assert_eq!(policy.backoff(2), Duration::from_millis(20));
//! ```

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Error indicating that an aggregate moved on since the caller loaded it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", format_conflict(self))]
pub struct ConcurrencyConflict {
    pub aggregate_type: String,
    pub aggregate_id: String,
    /// The sequence the command was decided against. `None` means a new
    /// aggregate was expected.
    pub expected: Option<u64>,
    /// The sequence found in the store. `None` means no events exist.
    pub actual: Option<u64>,
}

fn format_conflict(conflict: &ConcurrencyConflict) -> String {
    let stream = format!("{}/{}", conflict.aggregate_type, conflict.aggregate_id);
    match (conflict.expected, conflict.actual) {
        (None, Some(actual)) => format!(
            "concurrency conflict on {stream}: expected new aggregate, found sequence {actual} \
             (hint: another writer created this aggregate; reload and retry)"
        ),
        (Some(expected), Some(actual)) => format!(
            "concurrency conflict on {stream}: expected sequence {expected}, found {actual} \
             (hint: aggregate was modified; reload and retry)"
        ),
        (Some(expected), None) => format!(
            "concurrency conflict on {stream}: expected sequence {expected}, found no events"
        ),
        (None, None) => format!("concurrency conflict on {stream}: unexpected empty state"),
    }
}

/// Exponential backoff for transactions the store aborted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub const fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub const fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Delay before the retry following failed attempt number `attempt`
    /// (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1_u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |delay| delay.min(self.max_backoff))
    }

    /// Whether another attempt is allowed after `attempt` attempts failed.
    #[must_use]
    pub const fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conflict(expected: Option<u64>, actual: Option<u64>) -> ConcurrencyConflict {
        ConcurrencyConflict {
            aggregate_type: "org".to_owned(),
            aggregate_id: "o1".to_owned(),
            expected,
            actual,
        }
    }

    #[test]
    fn conflict_expected_new_aggregate_mentions_hint() {
        let msg = conflict(None, Some(4)).to_string();
        assert!(msg.contains("org/o1"));
        assert!(msg.contains("expected new aggregate"));
        assert!(msg.contains("reload and retry"));
    }

    #[test]
    fn conflict_expected_sequence_includes_both_sequences() {
        let msg = conflict(Some(5), Some(10)).to_string();
        assert!(msg.contains("expected sequence 5"));
        assert!(msg.contains("found 10"));
    }

    #[test]
    fn conflict_without_events_formats() {
        assert!(conflict(Some(2), None).to_string().contains("found no events"));
        assert!(conflict(None, None).to_string().contains("unexpected empty state"));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default()
            .with_backoff(Duration::from_millis(10), Duration::from_millis(35));

        assert_eq!(policy.backoff(1), Duration::from_millis(10));
        assert_eq!(policy.backoff(2), Duration::from_millis(20));
        assert_eq!(policy.backoff(3), Duration::from_millis(35));
        assert_eq!(policy.backoff(64), Duration::from_millis(35));
    }

    #[test]
    fn no_retry_allows_a_single_attempt() {
        let policy = RetryPolicy::no_retry();
        assert!(!policy.should_retry(1));
        assert!(RetryPolicy::default().should_retry(1));
    }

    #[test]
    fn policy_deserializes_with_defaults() {
        let policy: RetryPolicy = serde_json::from_str(r#"{"max_attempts": 3}"#).unwrap();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_backoff, RetryPolicy::default().initial_backoff);
    }
}
