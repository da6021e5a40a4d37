use std::time::Duration;
use tracing::info;

/// Bounded retry configuration for device-level operations
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts before giving up
    pub max_attempts: u32,
    /// Base delay for exponential backoff
    pub base_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Whether to use exponential backoff
    pub exponential_backoff: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            exponential_backoff: true,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given zero-based failed attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if !self.exponential_backoff {
            return self.base_delay;
        }

        let delay_ms = self
            .base_delay
            .as_millis()
            .saturating_mul(1u128 << attempt.min(16)) as u64;
        let delay = Duration::from_millis(delay_ms);

        if delay > self.max_delay {
            self.max_delay
        } else {
            delay
        }
    }
}

/// Tracks consecutive failures for the capture loop's escalation policy
#[derive(Debug)]
pub struct FailureCounter {
    consecutive: u32,
    total: u32,
    limit: u32,
}

impl FailureCounter {
    pub fn new(limit: u32) -> Self {
        Self {
            consecutive: 0,
            total: 0,
            limit,
        }
    }

    /// Record one failed cycle. Returns true once the consecutive-failure
    /// limit has been reached.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive += 1;
        self.total += 1;
        self.consecutive >= self.limit
    }

    /// Record a successful cycle, resetting the consecutive counter
    pub fn record_success(&mut self) {
        if self.consecutive > 0 {
            info!(
                "Recovered after {} consecutive failed cycle(s)",
                self.consecutive
            );
        }
        self.consecutive = 0;
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn total(&self) -> u32 {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_is_capped() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(10), Duration::from_secs(30));
    }

    #[test]
    fn test_fixed_delay_without_backoff() {
        let policy = RetryPolicy {
            exponential_backoff: false,
            ..RetryPolicy::default()
        };

        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(4), Duration::from_secs(1));
    }

    #[test]
    fn test_failure_counter_limit_and_reset() {
        let mut counter = FailureCounter::new(3);

        assert!(!counter.record_failure());
        assert!(!counter.record_failure());
        counter.record_success();
        assert_eq!(counter.consecutive(), 0);

        assert!(!counter.record_failure());
        assert!(!counter.record_failure());
        assert!(counter.record_failure());
        assert_eq!(counter.total(), 5);
    }
}
