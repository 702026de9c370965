//! Retry policy: decides backoff delays.

use std::time::Duration;

/// Backoff schedule for failed tasks.
///
/// delay(n) = base_delay * multiplier^(n - 1), capped at `max_delay`,
/// where n is the 1-indexed retry number.
///
/// Example with base_delay=2s, multiplier=2.0:
/// - retry 1: 2s
/// - retry 2: 4s
/// - retry 3: 8s
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Backoff multiplier. 1.0 gives a fixed delay.
    pub multiplier: f64,

    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            base_delay,
            multiplier,
            max_delay,
        }
    }

    /// Delay before retry number `retry` (1-indexed; 0 is treated as 1).
    pub fn next_delay(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let delay_secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 2)]
    #[case(1, 2)]
    #[case(2, 4)]
    #[case(3, 8)]
    #[case(4, 16)]
    fn exponential_backoff(#[case] retry: u32, #[case] expected_secs: u64) {
        let policy = RetryPolicy::new(Duration::from_secs(2), 2.0, Duration::from_secs(60));
        assert_eq!(policy.next_delay(retry), Duration::from_secs(expected_secs));
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy::new(Duration::from_secs(2), 2.0, Duration::from_secs(10));
        assert_eq!(policy.next_delay(3), Duration::from_secs(8));
        assert_eq!(policy.next_delay(4), Duration::from_secs(10));
        assert_eq!(policy.next_delay(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn unit_multiplier_never_grows() {
        let delay = Duration::from_millis(250);
        let policy = RetryPolicy::new(delay, 1.0, delay);
        for retry in 1..10 {
            assert_eq!(policy.next_delay(retry), Duration::from_millis(250));
        }
    }
}
