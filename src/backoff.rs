//! Exponential backoff schedule for retry delays.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Fraction of the delay that jitter may add or remove.
pub const JITTER_FRACTION: f64 = 0.25;

/// Exponential backoff with configurable base, cap and multiplier.
///
/// The delay before attempt `n` (1-based, counting the first retry as attempt 2)
/// is `min(base * multiplier^(n-1), max)` before jitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    multiplier: f64,
    jitter: bool,
}

impl ExponentialBackoff {
    /// Creates a doubling backoff from `base`, capped at `max`.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            multiplier: 2.0,
            jitter: false,
        }
    }

    /// Sets the growth multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Enables ±25% jitter on [`jittered`](Self::jittered) delays.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Returns the pre-jitter delay for the given 1-based attempt number.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Applies jitter to a delay, if enabled.
    pub fn jittered(&self, delay: Duration) -> Duration {
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let factor = rand::thread_rng().gen_range((1.0 - JITTER_FRACTION)..=(1.0 + JITTER_FRACTION));
        delay.mul_f64(factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn delay_for_attempt_follows_multiplier() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(10))
            .with_multiplier(3.0);
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(300));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_millis(900));
    }

    #[test]
    fn delay_for_attempt_is_capped() {
        let backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(5));
        assert_eq!(backoff.delay_for_attempt(10), Duration::from_secs(5));
        assert_eq!(backoff.delay_for_attempt(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn jitter_stays_within_quarter() {
        let backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60))
            .with_jitter(true);
        for _ in 0..200 {
            let d = backoff.jittered(Duration::from_secs(4));
            assert!(d >= Duration::from_millis(2_999), "{d:?} below lower bound");
            assert!(d <= Duration::from_millis(5_001), "{d:?} above upper bound");
        }
    }

    #[test]
    fn jitter_disabled_returns_delay_unchanged() {
        let backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60));
        assert_eq!(backoff.jittered(Duration::from_secs(4)), Duration::from_secs(4));
    }
}
