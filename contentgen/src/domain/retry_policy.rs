//! Backoff policy for transient stage failures.

use std::time::Duration;

/// How a stage is retried after a transient failure.
///
/// `max_retries` counts retries, so a stage runs at most `max_retries + 1` times.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Add up to 25% random jitter on top of each delay.
    pub use_jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay: max_delay.max(initial_delay),
            ..Default::default()
        }
    }

    /// Fail on the first transient error.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Deterministic variant for tests and tight loops.
    pub fn without_jitter(mut self) -> Self {
        self.use_jitter = false;
        self
    }

    /// Total number of runs a stage may get.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Whether a stage that has failed `failures` times may run again.
    pub fn should_retry(&self, failures: u32) -> bool {
        failures <= self.max_retries
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(32) as i32;
        let base_ms = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped_ms = base_ms.min(self.max_delay.as_millis() as f64) as u64;

        if self.use_jitter {
            let jitter = (capped_ms as f64 * 0.25 * rand::random::<f64>()) as u64;
            Duration::from_millis(capped_ms + jitter)
        } else {
            Duration::from_millis(capped_ms)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.max_attempts(), 4);
        assert!(policy.use_jitter);
    }

    #[test]
    fn test_should_retry_counts_failures() {
        let policy = RetryPolicy::new(2, Duration::from_millis(10), Duration::from_millis(100));
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!RetryPolicy::no_retry().should_retry(1));
    }

    #[test]
    fn test_exponential_delays_without_jitter() {
        let policy =
            RetryPolicy::new(5, Duration::from_millis(1000), Duration::from_millis(30_000))
                .without_jitter();

        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_retry(10), Duration::from_millis(30_000));
    }

    #[test]
    fn test_jitter_stays_within_a_quarter() {
        let policy = RetryPolicy::new(3, Duration::from_millis(400), Duration::from_millis(400));
        for _ in 0..50 {
            let delay = policy.delay_for_retry(1);
            assert!(delay >= Duration::from_millis(400));
            assert!(delay <= Duration::from_millis(500));
        }
    }

    #[test]
    fn test_max_delay_never_below_initial() {
        let policy = RetryPolicy::new(1, Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(5));
    }
}
