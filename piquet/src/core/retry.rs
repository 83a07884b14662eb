//! Retry/backoff configuration and the error policy applied after exhaustion.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the delay between retry attempts evolves after each failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackoffStrategy {
    /// The delay stays at the configured retry interval.
    #[default]
    None,
    /// `min(current * 2, max_interval)`
    Exponential,
    /// `current + retry_interval`
    Linear,
}

impl BackoffStrategy {
    /// Compute the delay that follows `current` after a failed attempt.
    pub fn next_interval(
        &self,
        current: Duration,
        retry_interval: Duration,
        max_interval: Duration,
    ) -> Duration {
        match self {
            BackoffStrategy::Exponential => std::cmp::min(current * 2, max_interval),
            BackoffStrategy::Linear => current + retry_interval,
            BackoffStrategy::None => current,
        }
    }
}

/// Retry configuration for a scheduled job.
///
/// Retries only apply when `max_attempts > 0` and the base retry interval does
/// not exceed the job's own firing interval; a retry must never bleed past the
/// next scheduled firing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts after the initial invocation.
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
    /// Base delay before the first retry.
    pub retry_interval: Duration,
    /// Ceiling for exponential growth.
    pub max_interval: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, retry_interval: Duration) -> Self {
        Self {
            max_attempts,
            backoff: BackoffStrategy::None,
            retry_interval,
            max_interval: retry_interval,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy, max_interval: Duration) -> Self {
        self.backoff = backoff;
        self.max_interval = max_interval;
        self
    }

    /// Whether this policy applies to a job firing every `firing_interval`.
    pub fn applies_to(&self, firing_interval: Duration) -> bool {
        self.max_attempts > 0 && self.retry_interval <= firing_interval
    }

    /// The planned sleep before each retry attempt, in order.
    ///
    /// Lazy: delays are computed one at a time, so an effectively unbounded
    /// `max_attempts` costs nothing up front. The plan is cut short as soon as
    /// the next computed delay would exceed `firing_interval`, and never
    /// exceeds `max_attempts` entries.
    pub fn delays(&self, firing_interval: Duration) -> impl Iterator<Item = Duration> + '_ {
        let mut remaining = if self.applies_to(firing_interval) {
            self.max_attempts
        } else {
            0
        };
        let mut current = self.retry_interval;
        let mut cut_off = false;
        std::iter::from_fn(move || {
            if remaining == 0 || cut_off {
                return None;
            }
            remaining -= 1;
            let delay = current;
            current = self
                .backoff
                .next_interval(current, self.retry_interval, self.max_interval);
            if current > firing_interval {
                cut_off = true;
            }
            Some(delay)
        })
    }
}

/// What to do with a job that is still failing once retries are exhausted.
///
/// The `Log*` policies report the failure and leave the job scheduled; the
/// terminating policies additionally cancel the job's future firings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorPolicy {
    #[default]
    LogAndContinue,
    LogAndIgnore,
    LogAndTerminate,
    Terminate,
}

impl ErrorPolicy {
    /// Whether the final failure is reported through the log.
    pub fn is_logged(&self) -> bool {
        !matches!(self, ErrorPolicy::Terminate)
    }

    /// Whether the job's future firings are cancelled.
    pub fn is_terminating(&self) -> bool {
        matches!(self, ErrorPolicy::LogAndTerminate | ErrorPolicy::Terminate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_exponential_backoff_caps_at_max() {
        let strategy = BackoffStrategy::Exponential;
        assert_eq!(strategy.next_interval(secs(1), secs(1), secs(8)), secs(2));
        assert_eq!(strategy.next_interval(secs(4), secs(1), secs(8)), secs(8));
        assert_eq!(strategy.next_interval(secs(8), secs(1), secs(8)), secs(8));
    }

    #[test]
    fn test_linear_backoff_adds_base_interval() {
        let strategy = BackoffStrategy::Linear;
        assert_eq!(strategy.next_interval(secs(3), secs(3), secs(60)), secs(6));
        assert_eq!(strategy.next_interval(secs(6), secs(3), secs(60)), secs(9));
    }

    #[test]
    fn test_no_backoff_keeps_interval() {
        let strategy = BackoffStrategy::None;
        assert_eq!(strategy.next_interval(secs(3), secs(3), secs(60)), secs(3));
    }

    #[test]
    fn test_exponential_delay_sequence() {
        // base=1s, max=8s, plenty of headroom before the next firing:
        // 1, 2, 4, 8, 8, 8...
        let policy =
            RetryPolicy::new(6, secs(1)).with_backoff(BackoffStrategy::Exponential, secs(8));
        assert_eq!(
            policy.delays(secs(100)).collect::<Vec<_>>(),
            vec![secs(1), secs(2), secs(4), secs(8), secs(8), secs(8)]
        );
    }

    #[test]
    fn test_delays_stop_before_next_firing() {
        // Same policy, but the job fires every 5s: the plan stops once the
        // next delay (8s) would bleed past the next firing.
        let policy =
            RetryPolicy::new(6, secs(1)).with_backoff(BackoffStrategy::Exponential, secs(8));
        assert_eq!(
            policy.delays(secs(5)).collect::<Vec<_>>(),
            vec![secs(1), secs(2), secs(4)]
        );
    }

    #[test]
    fn test_delays_bounded_by_max_attempts() {
        let policy = RetryPolicy::new(3, secs(2));
        assert_eq!(
            policy.delays(secs(60)).collect::<Vec<_>>(),
            vec![secs(2), secs(2), secs(2)]
        );
    }

    #[test]
    fn test_no_delays_when_base_exceeds_firing_interval() {
        let policy = RetryPolicy::new(3, secs(10));
        assert!(!policy.applies_to(secs(5)));
        assert_eq!(policy.delays(secs(5)).count(), 0);
    }

    #[test]
    fn test_no_delays_when_zero_attempts() {
        let policy = RetryPolicy::new(0, secs(1));
        assert_eq!(policy.delays(secs(60)).count(), 0);
    }

    #[test]
    fn test_linear_delay_sequence() {
        let policy = RetryPolicy::new(4, secs(2)).with_backoff(BackoffStrategy::Linear, secs(60));
        assert_eq!(
            policy.delays(secs(30)).collect::<Vec<_>>(),
            vec![secs(2), secs(4), secs(6), secs(8)]
        );
    }

    #[test]
    fn test_huge_attempt_budget_is_lazy() {
        // The plan must not materialize max_attempts entries up front.
        let policy = RetryPolicy::new(u32::MAX, secs(1));
        let mut delays = policy.delays(secs(60));
        assert_eq!(delays.next(), Some(secs(1)));
        assert_eq!(delays.next(), Some(secs(1)));
    }

    #[test]
    fn test_error_policy_logging() {
        assert!(ErrorPolicy::LogAndContinue.is_logged());
        assert!(ErrorPolicy::LogAndIgnore.is_logged());
        assert!(ErrorPolicy::LogAndTerminate.is_logged());
        assert!(!ErrorPolicy::Terminate.is_logged());
    }

    #[test]
    fn test_error_policy_termination() {
        assert!(!ErrorPolicy::LogAndContinue.is_terminating());
        assert!(!ErrorPolicy::LogAndIgnore.is_terminating());
        assert!(ErrorPolicy::LogAndTerminate.is_terminating());
        assert!(ErrorPolicy::Terminate.is_terminating());
    }

    #[test]
    fn test_policy_serde_names() {
        assert_eq!(
            serde_json::to_string(&ErrorPolicy::LogAndTerminate).unwrap(),
            "\"LOG_AND_TERMINATE\""
        );
        assert_eq!(
            serde_json::to_string(&BackoffStrategy::Exponential).unwrap(),
            "\"EXPONENTIAL\""
        );
        let policy: ErrorPolicy = serde_json::from_str("\"TERMINATE\"").unwrap();
        assert_eq!(policy, ErrorPolicy::Terminate);
    }
}
