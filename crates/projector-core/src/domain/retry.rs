//! Retry policy: backoff delays and the retry budget.

use std::time::Duration;

/// Exponential backoff with a hard cap.
///
/// `delay(n) = min(cap, base * 2^min(n - 1, max_exponent))` for `n < saturate_at`,
/// and `cap` from `saturate_at` on.
///
/// With the defaults:
/// - retry 1: 1s
/// - retry 2: 2s
/// - retry 3: 4s
/// - retry 7: 64s
/// - retry 8+: 120s
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max_exponent: u32,
    pub cap: Duration,

    /// Retry count from which the cap applies regardless of the exponent.
    pub saturate_at: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max_exponent: 6,
            cap: Duration::from_secs(120),
            saturate_at: 8,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the attempt that follows failure number `retry_count`.
    ///
    /// `retry_count` is 1-indexed; 0 is treated as 1.
    pub fn delay(&self, retry_count: u32) -> Duration {
        if retry_count >= self.saturate_at {
            return self.cap;
        }
        let exponent = retry_count.saturating_sub(1).min(self.max_exponent);
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    pub fn delay_seconds(&self, retry_count: u32) -> u64 {
        self.delay(retry_count).as_secs()
    }
}

/// Backoff plus the retry budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub backoff: BackoffPolicy,

    /// A task whose retry count reaches this value is dead-lettered.
    pub max_retry: u32,

    /// Bound on the stored `last_error`, in characters.
    pub error_max_chars: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            max_retry: 8,
            error_max_chars: super::task::MAX_ERROR_CHARS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(1, 1)]
    #[case(2, 2)]
    #[case(3, 4)]
    #[case(4, 8)]
    #[case(5, 16)]
    #[case(6, 32)]
    #[case(7, 64)]
    #[case(8, 120)]
    #[case(30, 120)]
    fn default_backoff_table(#[case] retry_count: u32, #[case] seconds: u64) {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_seconds(retry_count), seconds);
    }

    #[test]
    fn zero_is_treated_as_first_retry() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_secs(1));
    }

    #[test]
    fn cap_wins_over_exponent() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(10),
            max_exponent: 6,
            cap: Duration::from_secs(30),
            saturate_at: 100,
        };
        assert_eq!(policy.delay(2), Duration::from_secs(20));
        assert_eq!(policy.delay(3), Duration::from_secs(30));
        assert_eq!(policy.delay(50), Duration::from_secs(30));
    }

    #[test]
    fn default_budget_matches_queue_contract() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retry, 8);
        assert_eq!(policy.error_max_chars, 2000);
    }
}
