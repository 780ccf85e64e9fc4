//! Exponential backoff for SSH dialing.
//!
//! Only the dial is retried; commands are never re-run by this crate.

use std::time::Duration;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for each subsequent delay.
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay to sleep after failed attempt `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.delay_after(1), Duration::from_millis(500));
        assert_eq!(config.delay_after(2), Duration::from_millis(1000));
        assert_eq!(config.delay_after(3), Duration::from_millis(2000));
    }

    #[test]
    fn test_delay_is_capped() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_after(10), Duration::from_secs(5));
    }
}
