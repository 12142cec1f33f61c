//! Exponential backoff for storage commit retries
//!
//! Jittered so that several writers restarting together do not retry in
//! lock-step. Attempts are bounded; running out is the caller's cue to
//! escalate.

use crate::config::RetryConfig;
use rand::Rng;
use std::time::Duration;

/// Configuration for exponential backoff
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Cap on any single delay
    pub max_delay: Duration,
    /// Growth per attempt (typically 2.0)
    pub multiplier: f64,
    /// Retries allowed after the first failure
    pub max_retries: u32,
    /// Randomization (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for BackoffConfig {
    fn from(config: &RetryConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier,
            max_retries: config.max_retries,
            jitter_factor: config.jitter_factor,
        }
    }
}

impl BackoffConfig {
    /// Millisecond delays and no jitter, for tests
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
            max_retries,
            jitter_factor: 0.0,
        }
    }
}

/// Delay schedule for one failing operation
///
/// Delay `n` is `initial_delay * multiplier^n`, capped at `max_delay`, then
/// spread by up to `±jitter_factor / 2`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    attempts: u32,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempts: 0 }
    }

    /// Delay before the next retry, or `None` when the budget is spent
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.exhausted() {
            return None;
        }
        let base = self.base_delay(self.attempts);
        self.attempts += 1;
        Some(self.spread(base))
    }

    /// Retries handed out so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn exhausted(&self) -> bool {
        self.attempts >= self.config.max_retries
    }

    fn base_delay(&self, attempt: u32) -> Duration {
        let cap = self.config.max_delay.as_secs_f64();
        let grown = self.config.initial_delay.as_secs_f64()
            * self.config.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        Duration::from_secs_f64(if grown.is_finite() { grown.min(cap) } else { cap })
    }

    fn spread(&self, delay: Duration) -> Duration {
        let half = self.config.jitter_factor / 2.0;
        if half <= 0.0 {
            return delay;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-half..=half);
        delay.mul_f64(factor).min(self.config.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(max_retries: u32) -> BackoffConfig {
        BackoffConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
            multiplier: 2.0,
            max_retries,
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn test_from_retry_config() {
        let config = BackoffConfig::from(&RetryConfig::default());
        assert_eq!(config.initial_delay, Duration::from_millis(50));
        assert_eq!(config.max_delay, Duration::from_secs(5));
        assert_eq!(config.max_retries, 8);
    }

    #[test]
    fn test_exponential_growth_capped() {
        let mut backoff = ExponentialBackoff::new(no_jitter(6));
        let delays: Vec<u128> = std::iter::from_fn(|| backoff.next_delay())
            .map(|d| d.as_millis())
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
    }

    #[test]
    fn test_bounded_attempts() {
        let mut backoff = ExponentialBackoff::new(no_jitter(2));
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
        assert!(backoff.exhausted());
        assert_eq!(backoff.attempts(), 2);
    }

    #[test]
    fn test_jitter_stays_within_band() {
        let config = BackoffConfig {
            jitter_factor: 0.2,
            ..no_jitter(1)
        };
        for _ in 0..50 {
            let delay = ExponentialBackoff::new(config.clone()).next_delay().unwrap();
            assert!(delay >= Duration::from_millis(90) && delay <= Duration::from_millis(110));
        }
    }
}
