//! Reconnect policy
//!
//! Capped exponential backoff with a bounded number of consecutive failures.

use std::time::Duration;

/// Largest exponent applied to the base delay
const MAX_BACKOFF_EXPONENT: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Cap on any single delay
    pub max_delay: Duration,
    /// Consecutive failed attempts tolerated before giving up
    pub max_attempts: u32,
    /// Bound on the connection handshake, independent of the backoff
    pub handshake_timeout: Duration,
}

impl ReconnectPolicy {
    /// Delay to wait after the given number of consecutive failures (1-based)
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
        self.base_delay
            .saturating_mul(2u32.pow(exponent))
            .min(self.max_delay)
    }

    /// Whether another attempt is allowed after `failures` consecutive failures
    pub fn should_retry(&self, failures: u32) -> bool {
        failures < self.max_attempts
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 10,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_until_capped() {
        let policy = ReconnectPolicy {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            ..Default::default()
        };

        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(4), Duration::from_millis(4000));
        assert_eq!(policy.delay_for(5), Duration::from_secs(5));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_attempts_are_bounded() {
        let policy = ReconnectPolicy {
            max_attempts: 3,
            ..Default::default()
        };
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }
}
