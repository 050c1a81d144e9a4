//! Bounded retries with exponential backoff.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::backoff::ExponentialBackoff;
use crate::error::{Error, ErrorKind, Result};

pub use crate::config::RetryConfig;

/// Result of running an operation under a [`RetryPolicy`].
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// Final result: the first success or the last error.
    pub result: Result<T>,
    /// Number of attempts made (at least 1).
    pub attempts: u32,
    /// Delays slept between attempts, after jitter.
    pub delays: Vec<Duration>,
    /// Errors of the attempts that were followed by a retry.
    pub retried_errors: Vec<AttemptError>,
}

/// A failed attempt that the policy retried.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptError {
    pub attempt: u32,
    pub kind: ErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl AttemptError {
    fn new(attempt: u32, err: &Error) -> Self {
        Self {
            attempt,
            kind: err.kind(),
            message: err.to_string(),
            at: Utc::now(),
        }
    }
}

/// Retries classified failures with exponential backoff.
///
/// After failed attempt `n` the policy sleeps `min(base * multiplier^(n-1), max)`,
/// perturbed by up to ±25% when jitter is on. Errors outside the retryable set
/// are returned immediately.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    backoff: ExponentialBackoff,
}

impl RetryPolicy {
    /// Creates a policy from configuration.
    pub fn new(config: RetryConfig) -> Self {
        let backoff = ExponentialBackoff::new(config.base_delay(), config.max_delay())
            .with_multiplier(config.multiplier)
            .with_jitter(config.jitter);
        Self { config, backoff }
    }

    /// Returns the policy configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Returns true if `err` should be retried.
    pub fn is_retryable(&self, err: &Error) -> bool {
        err.is_server_fault() || self.config.retryable.contains(&err.kind())
    }

    /// Pre-jitter delay slept after failed attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff.delay_for_attempt(attempt)
    }

    /// Runs `op` until it succeeds, fails fatally, or attempts run out.
    ///
    /// `op` receives the 1-based attempt number. Each attempt is raced against
    /// the configured per-attempt timeout, which surfaces as [`Error::Timeout`].
    pub async fn execute<T, F, Fut>(&self, mut op: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut delays = Vec::new();
        let mut retried_errors = Vec::new();
        let mut attempt = 1;

        loop {
            let result = match self.config.attempt_timeout() {
                Some(limit) => match tokio::time::timeout(limit, op(attempt)).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout(limit)),
                },
                None => op(attempt).await,
            };

            let err = match result {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!(attempt, "operation succeeded after retry");
                    }
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                        delays,
                        retried_errors,
                    };
                }
                Err(err) => err,
            };

            if !self.is_retryable(&err) || attempt >= max_attempts {
                if self.is_retryable(&err) {
                    tracing::warn!(attempts = attempt, error = %err, "retries exhausted");
                }
                return RetryOutcome {
                    result: Err(err),
                    attempts: attempt,
                    delays,
                    retried_errors,
                };
            }

            let mut delay = self.backoff.jittered(self.delay_for_attempt(attempt));
            if let Some(hint) = err.retry_after() {
                delay = delay.max(hint);
            }
            tracing::warn!(
                attempt,
                max_attempts,
                delay = ?delay,
                error = %err,
                "attempt failed, retrying"
            );
            retried_errors.push(AttemptError::new(attempt, &err));
            tokio::time::sleep(delay).await;
            delays.push(delay);
            attempt += 1;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
