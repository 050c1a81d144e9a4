//! Resilient client: cache, rate limiter, circuit breaker and retry around one
//! external capability.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use super::cache::{CacheManager, CacheStats};
use super::circuit_breaker::{CircuitBreaker, CircuitSnapshot, CircuitState};
use super::rate_limiter::{KeyedRateLimiter, RateLimitStats};
use super::retry::{AttemptError, RetryPolicy};
use crate::config::ResilienceConfig;
use crate::error::{Error, ErrorKind, Result};

/// Uniform result of a protected call.
#[derive(Debug)]
pub struct CallOutcome<T> {
    /// The value, or the final classified error.
    pub result: Result<T>,
    /// Attempts made against the collaborator. Zero when served from cache or
    /// rejected before the call.
    pub attempts: u32,
    /// Errors from earlier attempts that were retried.
    pub retried_errors: Vec<AttemptError>,
    /// True if the value came from the cache.
    pub from_cache: bool,
    /// Wall time spent in [`ResilientClient::execute`].
    pub latency: Duration,
}

impl<T> CallOutcome<T> {
    /// Returns true if the call produced a value.
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Failure counters for one client.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorStats {
    pub total_calls: u64,
    pub failed_calls: u64,
    pub by_kind: BTreeMap<ErrorKind, u64>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
}

impl ErrorStats {
    fn record(&mut self, result: std::result::Result<(), &Error>) {
        self.total_calls += 1;
        if let Err(err) = result {
            self.failed_calls += 1;
            *self.by_kind.entry(err.kind()).or_insert(0) += 1;
            self.last_error = Some(err.to_string());
            self.last_error_at = Some(Utc::now());
        }
    }

    /// Share of calls that failed, in `[0, 1]`.
    pub fn error_rate(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.failed_calls as f64 / self.total_calls as f64
        }
    }
}

/// Health snapshot of a client.
#[derive(Debug, Clone, Serialize)]
pub struct ClientHealth {
    pub name: String,
    pub circuit: CircuitSnapshot,
    pub rate_limit: RateLimitStats,
    pub tracked_keys: usize,
    pub cache: Option<CacheStats>,
    pub errors: ErrorStats,
}

impl ClientHealth {
    /// Returns true while the circuit is closed.
    pub fn is_healthy(&self) -> bool {
        self.circuit.state == CircuitState::Closed
    }
}

/// Protects calls to one collaborator.
///
/// Instances are shared by every run that talks to the same collaborator, so
/// runs share its limits, cache and circuit state.
#[derive(Debug)]
pub struct ResilientClient<T> {
    name: String,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
    limiter: KeyedRateLimiter,
    cache: Option<Arc<CacheManager<T>>>,
    errors: Mutex<ErrorStats>,
}

impl<T> ResilientClient<T>
where
    T: Clone + Serialize + Send + Sync + 'static,
{
    /// Builds a client from its resilience settings.
    ///
    /// When caching is enabled and a runtime is available, a background sweep
    /// of expired entries is started.
    pub fn new(name: impl Into<String>, config: &ResilienceConfig) -> Self {
        let name = name.into();
        let cache = config.cache.enabled.then(|| {
            let cache = Arc::new(CacheManager::new(config.cache.clone()));
            cache.spawn_sweeper();
            cache
        });

        Self {
            retry: RetryPolicy::new(config.retry.clone()),
            breaker: CircuitBreaker::new(name.clone(), config.circuit_breaker.clone()),
            limiter: KeyedRateLimiter::new(name.clone(), config.rate_limit.clone()),
            cache,
            errors: Mutex::new(ErrorStats::default()),
            name,
        }
    }

    /// Returns the client's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the circuit breaker.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Returns the cache, if caching is enabled.
    pub fn cache(&self) -> Option<&CacheManager<T>> {
        self.cache.as_deref()
    }

    /// Runs `op` under the full resilience stack.
    ///
    /// `key` is used both as the cache key and as the rate-limiter key. `op`
    /// receives the 1-based attempt number.
    pub async fn execute<F, Fut>(&self, key: &str, op: F) -> CallOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();

        if let Some(value) = self.cache.as_ref().and_then(|c| c.get(key)) {
            tracing::debug!(client = %self.name, key, "cache hit");
            self.errors.lock().record(Ok(()));
            return CallOutcome {
                result: Ok(value),
                attempts: 0,
                retried_errors: Vec::new(),
                from_cache: true,
                latency: started.elapsed(),
            };
        }

        let permit = match self.limiter.acquire(key).await {
            Ok(permit) => permit,
            Err(err) => return self.rejected(err, started),
        };

        let guard = match self.breaker.try_acquire() {
            Ok(guard) => guard,
            Err(err) => {
                permit.refund();
                return self.rejected(err, started);
            }
        };

        let outcome = self.retry.execute(op).await;
        permit.release();
        guard.record(&outcome.result);

        if let (Ok(value), Some(cache)) = (&outcome.result, &self.cache) {
            cache.set(key, value.clone(), None);
        }
        self.errors.lock().record(outcome.result.as_ref().map(|_| ()));

        CallOutcome {
            result: outcome.result,
            attempts: outcome.attempts,
            retried_errors: outcome.retried_errors,
            from_cache: false,
            latency: started.elapsed(),
        }
    }

    fn rejected(&self, err: Error, started: Instant) -> CallOutcome<T> {
        tracing::warn!(client = %self.name, error = %err, "call rejected before execution");
        self.errors.lock().record(Err(&err));
        CallOutcome {
            result: Err(err),
            attempts: 0,
            retried_errors: Vec::new(),
            from_cache: false,
            latency: started.elapsed(),
        }
    }

    /// Returns a health snapshot.
    pub fn health(&self) -> ClientHealth {
        ClientHealth {
            name: self.name.clone(),
            circuit: self.breaker.snapshot(),
            rate_limit: self.limiter.stats(),
            tracked_keys: self.limiter.tracked_keys(),
            cache: self.cache.as_ref().map(|c| c.stats()),
            errors: self.errors.lock().clone(),
        }
    }
}
