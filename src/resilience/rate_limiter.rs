//! Token-bucket admission control.
//!
//! Tokens refill lazily from elapsed time whenever the bucket is touched, so
//! there is no background timer. Per-minute, per-day and concurrency ceilings
//! are hard rejects; only a missing token makes the caller wait.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::error::{Error, Result};

pub use crate::config::RateLimitConfig;

const MINUTE: Duration = Duration::from_secs(60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);
const EPSILON: f64 = 1e-6;

/// Keyed limiters prune idle buckets once this many keys are tracked.
pub const MAX_TRACKED_KEYS: usize = 1024;

/// Counters for one bucket.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStats {
    pub available_tokens: f64,
    pub capacity: f64,
    pub in_flight: u32,
    pub waiting: u32,
    pub requests_this_minute: u64,
    pub requests_today: u64,
    pub total_acquired: u64,
    pub total_rejected: u64,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    minute_start: Instant,
    minute_count: u64,
    day_start: Instant,
    day_count: u64,
    in_flight: u32,
    waiting: u32,
    total_acquired: u64,
    total_rejected: u64,
}

impl Bucket {
    fn new(config: &RateLimitConfig, now: Instant) -> Self {
        Self {
            tokens: config.capacity,
            last_refill: now,
            minute_start: now,
            minute_count: 0,
            day_start: now,
            day_count: 0,
            in_flight: 0,
            waiting: 0,
            total_acquired: 0,
            total_rejected: 0,
        }
    }

    fn tokens_at(&self, config: &RateLimitConfig, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        (self.tokens + elapsed * config.refill_per_sec).min(config.capacity)
    }

    fn refill(&mut self, config: &RateLimitConfig, now: Instant) {
        self.tokens = self.tokens_at(config, now);
        self.last_refill = now;

        if now.saturating_duration_since(self.minute_start) >= MINUTE {
            self.minute_start = now;
            self.minute_count = 0;
        }
        if now.saturating_duration_since(self.day_start) >= DAY {
            self.day_start = now;
            self.day_count = 0;
        }
    }

    fn check_ceilings(&self, config: &RateLimitConfig, now: Instant) -> Result<()> {
        if self.minute_count >= config.requests_per_minute {
            let elapsed = now.saturating_duration_since(self.minute_start);
            return Err(Error::RateLimited {
                reason: format!("{} requests per minute", config.requests_per_minute),
                retry_after: Some(MINUTE.saturating_sub(elapsed)),
            });
        }
        if self.day_count >= config.requests_per_day {
            let elapsed = now.saturating_duration_since(self.day_start);
            return Err(Error::RateLimited {
                reason: format!("{} requests per day", config.requests_per_day),
                retry_after: Some(DAY.saturating_sub(elapsed)),
            });
        }
        if self.in_flight >= config.max_concurrent {
            return Err(Error::rate_limited(format!(
                "{} concurrent requests",
                config.max_concurrent
            )));
        }
        Ok(())
    }

    fn admit(&mut self) {
        self.tokens -= 1.0;
        self.in_flight += 1;
        self.minute_count += 1;
        self.day_count += 1;
        self.total_acquired += 1;
    }
}

#[derive(Debug)]
struct Shared {
    name: String,
    config: RateLimitConfig,
    bucket: Mutex<Bucket>,
}

enum Step {
    Admit,
    Reject(Error),
    Wait { delay: Duration, enqueue: bool },
}

/// Token-bucket rate limiter. Clones share the same bucket.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    shared: Arc<Shared>,
}

impl RateLimiter {
    /// Creates a limiter with a full bucket.
    pub fn new(name: impl Into<String>, config: RateLimitConfig) -> Self {
        let bucket = Bucket::new(&config, Instant::now());
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                config,
                bucket: Mutex::new(bucket),
            }),
        }
    }

    /// Returns the limiter's name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Returns the limiter configuration.
    pub fn config(&self) -> &RateLimitConfig {
        &self.shared.config
    }

    /// Waits for a token and takes it.
    ///
    /// Fails immediately with [`Error::RateLimited`] when a per-minute,
    /// per-day or concurrency ceiling is reached, when the wait queue is full,
    /// or when the next token would arrive after `max_wait`.
    pub async fn acquire(&self) -> Result<RatePermit> {
        let config = &self.shared.config;
        let deadline = Instant::now() + config.max_wait();
        let mut slot: Option<QueueSlot> = None;

        loop {
            let step = {
                let now = Instant::now();
                let mut b = self.shared.bucket.lock();
                b.refill(config, now);
                self.next_step(&mut b, now, deadline, slot.is_some())
            };

            match step {
                Step::Admit => return Ok(RatePermit::new(self.shared.clone())),
                Step::Reject(err) => {
                    tracing::debug!(limiter = %self.shared.name, error = %err, "rate limit rejected");
                    return Err(err);
                }
                Step::Wait { delay, enqueue } => {
                    if enqueue {
                        slot = Some(QueueSlot(self.shared.clone()));
                    }
                    tracing::debug!(limiter = %self.shared.name, delay = ?delay, "waiting for token");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn next_step(&self, b: &mut Bucket, now: Instant, deadline: Instant, queued: bool) -> Step {
        let config = &self.shared.config;

        if let Err(err) = b.check_ceilings(config, now) {
            b.total_rejected += 1;
            return Step::Reject(err);
        }
        if b.tokens >= 1.0 - EPSILON {
            b.admit();
            return Step::Admit;
        }
        if !queued && b.waiting >= config.max_queue {
            b.total_rejected += 1;
            return Step::Reject(Error::rate_limited(format!(
                "wait queue full ({} waiting)",
                b.waiting
            )));
        }

        let wait = if config.refill_per_sec > 0.0 {
            Duration::from_secs_f64((1.0 - b.tokens) / config.refill_per_sec)
        } else {
            Duration::MAX
        };
        if now.checked_add(wait).map(|t| t > deadline).unwrap_or(true) {
            b.total_rejected += 1;
            return Step::Reject(Error::RateLimited {
                reason: "token wait exceeds max wait".to_string(),
                retry_after: (wait != Duration::MAX).then_some(wait),
            });
        }

        if !queued {
            b.waiting += 1;
        }
        Step::Wait {
            delay: wait,
            enqueue: !queued,
        }
    }

    /// Takes a token if one is available right now.
    pub fn try_acquire(&self) -> Option<RatePermit> {
        let config = &self.shared.config;
        let now = Instant::now();
        let mut b = self.shared.bucket.lock();
        b.refill(config, now);

        if b.check_ceilings(config, now).is_err() || b.tokens < 1.0 - EPSILON {
            b.total_rejected += 1;
            return None;
        }
        b.admit();
        drop(b);
        Some(RatePermit::new(self.shared.clone()))
    }

    /// Returns current counters without advancing the bucket.
    pub fn stats(&self) -> RateLimitStats {
        let config = &self.shared.config;
        let now = Instant::now();
        let b = self.shared.bucket.lock();
        let minute_over = now.saturating_duration_since(b.minute_start) >= MINUTE;
        let day_over = now.saturating_duration_since(b.day_start) >= DAY;
        RateLimitStats {
            available_tokens: b.tokens_at(config, now),
            capacity: config.capacity,
            in_flight: b.in_flight,
            waiting: b.waiting,
            requests_this_minute: if minute_over { 0 } else { b.minute_count },
            requests_today: if day_over { 0 } else { b.day_count },
            total_acquired: b.total_acquired,
            total_rejected: b.total_rejected,
        }
    }

    /// True when the bucket is full and nothing is in flight or waiting.
    pub fn is_idle(&self) -> bool {
        let config = &self.shared.config;
        let b = self.shared.bucket.lock();
        b.in_flight == 0
            && b.waiting == 0
            && b.tokens_at(config, Instant::now()) >= config.capacity - EPSILON
    }
}

/// Decrements the waiting count when an acquirer leaves the queue.
struct QueueSlot(Arc<Shared>);

impl Drop for QueueSlot {
    fn drop(&mut self) {
        let mut b = self.0.bucket.lock();
        b.waiting = b.waiting.saturating_sub(1);
    }
}

/// An admitted request. Dropping the permit releases its concurrency slot.
#[derive(Debug)]
pub struct RatePermit {
    shared: Option<Arc<Shared>>,
}

impl RatePermit {
    fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared: Some(shared),
        }
    }

    /// Releases the concurrency slot after the protected work completes.
    pub fn release(mut self) {
        self.finish(false);
    }

    /// Releases the slot and returns the unused token to the bucket.
    pub fn refund(mut self) {
        self.finish(true);
    }

    fn finish(&mut self, refund: bool) {
        let Some(shared) = self.shared.take() else {
            return;
        };
        let mut b = shared.bucket.lock();
        b.in_flight = b.in_flight.saturating_sub(1);
        if refund {
            b.tokens = (b.tokens + 1.0).min(shared.config.capacity);
            b.minute_count = b.minute_count.saturating_sub(1);
            b.day_count = b.day_count.saturating_sub(1);
            b.total_acquired = b.total_acquired.saturating_sub(1);
        }
    }
}

impl Drop for RatePermit {
    fn drop(&mut self) {
        self.finish(false);
    }
}

/// Permit from a [`KeyedRateLimiter`], holding both the global and the key slot.
#[derive(Debug)]
pub struct KeyedPermit {
    global: RatePermit,
    key: RatePermit,
}

impl KeyedPermit {
    /// Releases both slots.
    pub fn release(self) {
        self.key.release();
        self.global.release();
    }

    /// Gives both tokens back when the call never ran.
    pub fn refund(self) {
        self.key.refund();
        self.global.refund();
    }
}

/// Global bucket plus one stricter bucket per key.
///
/// Each key gets the global limits scaled by `per_key_fraction`, so a single
/// busy key cannot starve the rest.
#[derive(Debug)]
pub struct KeyedRateLimiter {
    global: RateLimiter,
    key_config: RateLimitConfig,
    keys: Mutex<HashMap<String, RateLimiter>>,
}

impl KeyedRateLimiter {
    /// Creates a keyed limiter from the global configuration.
    pub fn new(name: impl Into<String>, config: RateLimitConfig) -> Self {
        let key_config = config.per_key();
        Self {
            global: RateLimiter::new(name, config),
            key_config,
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the global limiter.
    pub fn global(&self) -> &RateLimiter {
        &self.global
    }

    /// Acquires a global token, then a token for `key`.
    ///
    /// If the key is over its limit the global token is refunded.
    pub async fn acquire(&self, key: &str) -> Result<KeyedPermit> {
        let global = self.global.acquire().await?;
        let limiter = self.limiter_for(key);
        match limiter.acquire().await {
            Ok(key) => Ok(KeyedPermit { global, key }),
            Err(err) => {
                global.refund();
                Err(err)
            }
        }
    }

    /// Non-blocking variant of [`acquire`](Self::acquire).
    pub fn try_acquire(&self, key: &str) -> Option<KeyedPermit> {
        let global = self.global.try_acquire()?;
        match self.limiter_for(key).try_acquire() {
            Some(key) => Some(KeyedPermit { global, key }),
            None => {
                global.refund();
                None
            }
        }
    }

    /// Returns global counters.
    pub fn stats(&self) -> RateLimitStats {
        self.global.stats()
    }

    /// Returns counters for one key, if it is tracked.
    pub fn key_stats(&self, key: &str) -> Option<RateLimitStats> {
        self.keys.lock().get(key).map(RateLimiter::stats)
    }

    /// Returns the number of keys with a bucket.
    pub fn tracked_keys(&self) -> usize {
        self.keys.lock().len()
    }

    fn limiter_for(&self, key: &str) -> RateLimiter {
        let mut keys = self.keys.lock();
        if let Some(limiter) = keys.get(key) {
            return limiter.clone();
        }
        if keys.len() >= MAX_TRACKED_KEYS {
            let before = keys.len();
            keys.retain(|_, limiter| !limiter.is_idle());
            tracing::debug!(
                limiter = %self.global.name(),
                pruned = before - keys.len(),
                "pruned idle key buckets"
            );
        }
        let limiter = RateLimiter::new(
            format!("{}:{}", self.global.name(), key),
            self.key_config.clone(),
        );
        keys.insert(key.to_string(), limiter.clone());
        limiter
    }
}
