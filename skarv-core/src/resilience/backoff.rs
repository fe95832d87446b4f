//! Exponential backoff for reconnect and retry ladders.
//!
//! Delays grow as `base * 2^(n-1)` plus a uniform additive jitter, capped at
//! `max_delay`. Jitter keeps a fleet of consumers from reconnecting in
//! lockstep after a shared outage.

use rand::Rng;
use std::time::Duration;

/// Configuration for an exponential backoff ladder.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Hard cap on any single delay.
    pub max_delay: Duration,
    /// Maximum number of attempts (`None` = unlimited).
    pub max_retries: Option<u32>,
    /// Upper bound of the uniform additive jitter.
    pub jitter: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: Some(5),
            jitter: Duration::from_secs(1),
        }
    }
}

impl BackoffConfig {
    /// The transport reconnect ladder: 1s base, 30s cap, 5 attempts,
    /// up to 1s of jitter.
    pub fn transport() -> Self {
        Self::default()
    }

    /// Linear retry ladder used by the snapshot fetcher: fixed delay,
    /// no jitter.
    pub fn linear(delay: Duration, max_retries: u32) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            max_retries: Some(max_retries),
            jitter: Duration::ZERO,
        }
    }
}

/// Exponential backoff state machine.
pub struct ExponentialBackoff {
    config: BackoffConfig,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Next delay, advancing the attempt counter.
    ///
    /// Returns `None` once the retry budget is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.can_retry() {
            return None;
        }
        self.attempt += 1;

        // base * 2^(n-1), saturating well below Duration overflow
        let exp = self.attempt.saturating_sub(1).min(16);
        let raw = self.config.base_delay.saturating_mul(1u32 << exp);
        let jittered = raw + self.jitter_amount();

        Some(jittered.min(self.config.max_delay))
    }

    fn jitter_amount(&self) -> Duration {
        if self.config.jitter.is_zero() {
            return Duration::ZERO;
        }
        let bound = self.config.jitter.as_secs_f64();
        Duration::from_secs_f64(rand::thread_rng().gen::<f64>() * bound)
    }

    /// Attempts consumed so far.
    pub fn attempt_number(&self) -> u32 {
        self.attempt
    }

    /// Whether another attempt is allowed.
    pub fn can_retry(&self) -> bool {
        match self.config.max_retries {
            Some(max) => self.attempt < max,
            None => true,
        }
    }

    /// Reset to the initial state (after a successful connect).
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(max_retries: Option<u32>) -> ExponentialBackoff {
        ExponentialBackoff::new(BackoffConfig {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries,
            jitter: Duration::ZERO,
        })
    }

    #[test]
    fn delays_double_from_base() {
        let mut backoff = no_jitter(Some(5));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(2)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(4)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(8)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(16)));
    }

    #[test]
    fn ladder_exhausts_after_max_retries() {
        let mut backoff = no_jitter(Some(5));
        for _ in 0..5 {
            assert!(backoff.next_delay().is_some());
        }
        assert_eq!(backoff.next_delay(), None);
        assert!(!backoff.can_retry());
    }

    #[test]
    fn delay_is_capped_at_max() {
        let mut backoff = ExponentialBackoff::new(BackoffConfig {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: Some(10),
            jitter: Duration::ZERO,
        });
        let mut last = Duration::ZERO;
        for _ in 0..10 {
            last = backoff.next_delay().unwrap();
            assert!(last <= Duration::from_secs(30));
        }
        assert_eq!(last, Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let mut backoff = ExponentialBackoff::new(BackoffConfig {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_retries: Some(100),
            jitter: Duration::from_secs(1),
        });
        // First attempt: 1s base + [0, 1s) jitter.
        for _ in 0..20 {
            let d = backoff.next_delay().unwrap();
            backoff.reset();
            assert!(d >= Duration::from_secs(1));
            assert!(d < Duration::from_secs(2));
        }
    }

    #[test]
    fn reset_restores_full_budget() {
        let mut backoff = no_jitter(Some(2));
        backoff.next_delay();
        backoff.next_delay();
        assert!(!backoff.can_retry());
        backoff.reset();
        assert!(backoff.can_retry());
        assert_eq!(backoff.attempt_number(), 0);
    }

    #[test]
    fn linear_config_produces_constant_delays() {
        let mut backoff =
            ExponentialBackoff::new(BackoffConfig::linear(Duration::from_secs(2), 3));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(2)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(2)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(2)));
        assert_eq!(backoff.next_delay(), None);
    }
}
