//! Circuit breaker guarding one collaborator.
//!
//! - **Closed**: calls pass through; consecutive transient failures are counted.
//! - **Open**: calls fail fast with [`Error::CircuitOpen`] until the recovery
//!   timeout has elapsed.
//! - **HalfOpen**: one trial call at a time is admitted. `success_threshold`
//!   consecutive trial successes close the circuit; any trial failure reopens it.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{Error, Result};

pub use crate::config::CircuitBreakerConfig;

/// State of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// How a call was let through the breaker.
///
/// Outcomes of calls admitted as [`Admission::Normal`] are ignored once the
/// circuit has left the Closed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Normal,
    Trial,
}

/// A call let through the breaker, to be settled with its outcome.
///
/// A guard dropped unsettled counts as a failure, so a call that panicked
/// still frees a half-open trial slot.
#[derive(Debug)]
#[must_use = "settle the guard with the call's outcome"]
pub struct BreakerGuard<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    settled: bool,
}

impl BreakerGuard<'_> {
    /// How the call was admitted.
    pub fn admission(&self) -> Admission {
        self.admission
    }

    /// Records a successful call.
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success(self.admission);
    }

    /// Records a failure that reflects on the backend's health.
    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure(self.admission);
    }

    /// Records a call whose failure says nothing about backend health.
    pub fn ignore(mut self) {
        self.settled = true;
        self.breaker.record_ignored(self.admission);
    }

    /// Settles from a result. Only transient errors count as failures.
    pub fn record<T>(self, result: &Result<T>) {
        match result {
            Ok(_) => self.success(),
            Err(e) if e.is_transient() => self.failure(),
            Err(_) => self.ignore(),
        }
    }
}

impl Drop for BreakerGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            tracing::warn!(circuit = %self.breaker.name, "call ended without an outcome");
            self.breaker.record_failure(self.admission);
        }
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    /// Time since the last counted failure.
    pub since_last_failure: Option<Duration>,
    /// Number of times the circuit has opened.
    pub times_opened: u64,
    /// Calls rejected while open.
    pub rejected: u64,
}

#[derive(Debug, Default)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
    times_opened: u64,
    rejected: u64,
}

impl BreakerState {
    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.consecutive_successes = 0;
        self.trial_in_flight = false;
        self.times_opened += 1;
    }
}

/// Consecutive-failure circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState::default()),
        }
    }

    /// Returns the breaker's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the current state, moving Open to HalfOpen if recovery is due.
    pub fn state(&self) -> CircuitState {
        let mut s = self.state.lock();
        self.maybe_half_open(&mut s, Instant::now());
        s.state
    }

    /// Asks to make a call.
    ///
    /// Fails with [`Error::CircuitOpen`] while open, or while half-open with a
    /// trial already in flight.
    pub fn try_acquire(&self) -> Result<BreakerGuard<'_>> {
        let mut s = self.state.lock();
        self.maybe_half_open(&mut s, Instant::now());

        let admission = match s.state {
            CircuitState::Closed => Admission::Normal,
            CircuitState::HalfOpen if !s.trial_in_flight => {
                s.trial_in_flight = true;
                tracing::info!(circuit = %self.name, "admitting half-open trial call");
                Admission::Trial
            }
            _ => {
                s.rejected += 1;
                return Err(Error::CircuitOpen(self.name.clone()));
            }
        };
        Ok(BreakerGuard {
            breaker: self,
            admission,
            settled: false,
        })
    }

    fn record_success(&self, admission: Admission) {
        let mut s = self.state.lock();
        match (s.state, admission) {
            (CircuitState::Closed, _) => {
                s.consecutive_failures = 0;
            }
            (CircuitState::HalfOpen, Admission::Trial) => {
                s.trial_in_flight = false;
                s.consecutive_successes += 1;
                if s.consecutive_successes >= self.config.success_threshold {
                    s.state = CircuitState::Closed;
                    s.consecutive_failures = 0;
                    s.consecutive_successes = 0;
                    s.opened_at = None;
                    tracing::info!(circuit = %self.name, "circuit closed");
                }
            }
            _ => {}
        }
    }

    fn record_failure(&self, admission: Admission) {
        let now = Instant::now();
        let mut s = self.state.lock();
        match (s.state, admission) {
            (CircuitState::Closed, _) => {
                s.consecutive_failures += 1;
                s.last_failure = Some(now);
                if s.consecutive_failures >= self.config.failure_threshold {
                    s.open(now);
                    tracing::warn!(
                        circuit = %self.name,
                        failures = s.consecutive_failures,
                        recovery = ?self.config.recovery_timeout(),
                        "circuit opened"
                    );
                }
            }
            (CircuitState::HalfOpen, Admission::Trial) => {
                s.consecutive_failures += 1;
                s.last_failure = Some(now);
                s.open(now);
                tracing::warn!(circuit = %self.name, "trial call failed, circuit reopened");
            }
            _ => {
                s.last_failure = Some(now);
            }
        }
    }

    /// Frees the half-open trial slot without moving toward Open or Closed.
    fn record_ignored(&self, admission: Admission) {
        let mut s = self.state.lock();
        if s.state == CircuitState::HalfOpen && admission == Admission::Trial {
            s.trial_in_flight = false;
        }
    }

    /// Runs `op` through the breaker, recording only transient failures.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guard = self.try_acquire()?;
        let result = op().await;
        guard.record(&result);
        result
    }

    /// Returns a snapshot of the breaker's counters.
    pub fn snapshot(&self) -> CircuitSnapshot {
        let now = Instant::now();
        let mut s = self.state.lock();
        self.maybe_half_open(&mut s, now);
        CircuitSnapshot {
            name: self.name.clone(),
            state: s.state,
            consecutive_failures: s.consecutive_failures,
            consecutive_successes: s.consecutive_successes,
            since_last_failure: s.last_failure.map(|t| now.saturating_duration_since(t)),
            times_opened: s.times_opened,
            rejected: s.rejected,
        }
    }

    /// Forces the breaker back to Closed and clears its counters.
    pub fn reset(&self) {
        *self.state.lock() = BreakerState::default();
        tracing::info!(circuit = %self.name, "circuit reset");
    }

    fn maybe_half_open(&self, s: &mut BreakerState, now: Instant) {
        if s.state != CircuitState::Open {
            return;
        }
        let due = s
            .opened_at
            .map(|t| now.saturating_duration_since(t) >= self.config.recovery_timeout())
            .unwrap_or(true);
        if due {
            s.state = CircuitState::HalfOpen;
            s.consecutive_successes = 0;
            s.trial_in_flight = false;
            tracing::info!(circuit = %self.name, "circuit half-open");
        }
    }
}
