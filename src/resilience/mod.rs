//! Resilience primitives wrapped around every collaborator call.
//!
//! A [`ResilientClient`] composes, in order: cache lookup, rate-limiter
//! admission, circuit-breaker gate and a retried call.

pub mod cache;
pub mod circuit_breaker;
pub mod client;
pub mod rate_limiter;
pub mod retry;

pub use cache::{CacheManager, CacheStats};
pub use circuit_breaker::{Admission, BreakerGuard, CircuitBreaker, CircuitSnapshot, CircuitState};
pub use client::{CallOutcome, ClientHealth, ErrorStats, ResilientClient};
pub use rate_limiter::{KeyedPermit, KeyedRateLimiter, RateLimitStats, RateLimiter, RatePermit};
pub use retry::{AttemptError, RetryOutcome, RetryPolicy};
