//! Pipeline configuration and validation.
//!
//! Configuration is loaded from TOML and validated before an orchestrator is
//! built, so that bad thresholds and limits are caught early.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation errors (fatal).
    pub errors: Vec<String>,
    /// List of validation warnings (non-fatal).
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Adds an error to the result.
    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    /// Adds a warning to the result.
    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Merges another result, prefixing every message with a section name.
    pub fn merge_section(&mut self, section: &str, other: ValidationResult) {
        self.errors
            .extend(other.errors.into_iter().map(|e| format!("{section}: {e}")));
        self.warnings
            .extend(other.warnings.into_iter().map(|w| format!("{section}: {w}")));
    }

    /// Converts to a Result, failing if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    /// Validates the configuration and returns any issues found.
    fn validate(&self) -> ValidationResult;
}

// ----------------------------------------------------------------------------
// Retry
// ----------------------------------------------------------------------------

/// Configuration for the retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound on any single delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Growth factor between consecutive delays.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Perturb delays by up to ±25%.
    #[serde(default = "default_true")]
    pub jitter: bool,
    /// Per-attempt timeout; `0` disables it.
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
    /// Error kinds that are retried. Backend server faults are always retried.
    #[serde(default = "default_retryable")]
    pub retryable: Vec<ErrorKind>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

fn default_attempt_timeout_ms() -> u64 {
    60_000
}

fn default_retryable() -> Vec<ErrorKind> {
    vec![ErrorKind::Network, ErrorKind::Timeout, ErrorKind::RateLimited]
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: true,
            attempt_timeout_ms: default_attempt_timeout_ms(),
            retryable: default_retryable(),
        }
    }
}

impl RetryConfig {
    /// Returns the base delay as a Duration.
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Returns the maximum delay as a Duration.
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Returns the per-attempt timeout, if enabled.
    pub fn attempt_timeout(&self) -> Option<Duration> {
        (self.attempt_timeout_ms > 0).then(|| Duration::from_millis(self.attempt_timeout_ms))
    }
}

impl Validate for RetryConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.max_attempts == 0 {
            result.add_error("max_attempts must be at least 1");
        }
        if self.max_attempts > 10 {
            result.add_warning("max_attempts > 10 may hammer a failing backend");
        }
        if !(self.multiplier >= 1.0) {
            result.add_error("multiplier must be at least 1.0");
        }
        if self.base_delay_ms > self.max_delay_ms {
            result.add_error("base_delay_ms must not exceed max_delay_ms");
        }
        if self.retryable.contains(&ErrorKind::Validation) {
            result.add_warning("retrying validation errors will never succeed");
        }
        if self.retryable.contains(&ErrorKind::Authentication) {
            result.add_warning("retrying authentication errors requires operator action anyway");
        }

        result
    }
}

// ----------------------------------------------------------------------------
// Circuit breaker
// ----------------------------------------------------------------------------

/// Configuration for a circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close the circuit.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// Time the circuit stays open before admitting a trial call.
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_recovery_timeout_ms() -> u64 {
    60_000
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Returns the recovery timeout as a Duration.
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

impl Validate for CircuitBreakerConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.failure_threshold == 0 {
            result.add_error("failure_threshold must be at least 1");
        }
        if self.success_threshold == 0 {
            result.add_error("success_threshold must be at least 1");
        }
        if self.recovery_timeout_ms < 1000 {
            result.add_warning("recovery_timeout_ms under 1 second gives a backend little time to recover");
        }

        result
    }
}

// ----------------------------------------------------------------------------
// Rate limiting
// ----------------------------------------------------------------------------

/// Configuration for a token-bucket rate limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum number of tokens in the bucket.
    #[serde(default = "default_capacity")]
    pub capacity: f64,
    /// Tokens added per second.
    #[serde(default = "default_refill_per_sec")]
    pub refill_per_sec: f64,
    /// Hard ceiling on admissions per minute.
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u64,
    /// Hard ceiling on admissions per day.
    #[serde(default = "default_requests_per_day")]
    pub requests_per_day: u64,
    /// Maximum calls in flight at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
    /// Maximum callers waiting for a token.
    #[serde(default = "default_max_queue")]
    pub max_queue: u32,
    /// Longest a caller may wait for a token.
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
    /// Share of the global limits granted to each key.
    #[serde(default = "default_per_key_fraction")]
    pub per_key_fraction: f64,
}

fn default_capacity() -> f64 {
    10.0
}

fn default_refill_per_sec() -> f64 {
    1.0
}

fn default_requests_per_minute() -> u64 {
    60
}

fn default_requests_per_day() -> u64 {
    10_000
}

fn default_max_concurrent() -> u32 {
    5
}

fn default_max_queue() -> u32 {
    100
}

fn default_max_wait_ms() -> u64 {
    30_000
}

fn default_per_key_fraction() -> f64 {
    0.1
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            refill_per_sec: default_refill_per_sec(),
            requests_per_minute: default_requests_per_minute(),
            requests_per_day: default_requests_per_day(),
            max_concurrent: default_max_concurrent(),
            max_queue: default_max_queue(),
            max_wait_ms: default_max_wait_ms(),
            per_key_fraction: default_per_key_fraction(),
        }
    }
}

impl RateLimitConfig {
    /// Returns the maximum wait as a Duration.
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    /// Derives the stricter limits applied to a single key.
    ///
    /// Every limit is scaled by `per_key_fraction` and kept at one or more.
    pub fn per_key(&self) -> RateLimitConfig {
        let f = self.per_key_fraction;
        let scale_u64 = |v: u64| ((v as f64 * f).ceil() as u64).max(1);
        RateLimitConfig {
            capacity: (self.capacity * f).max(1.0),
            refill_per_sec: self.refill_per_sec * f,
            requests_per_minute: scale_u64(self.requests_per_minute),
            requests_per_day: scale_u64(self.requests_per_day),
            max_concurrent: (scale_u64(self.max_concurrent as u64)).min(u32::MAX as u64) as u32,
            max_queue: self.max_queue,
            max_wait_ms: self.max_wait_ms,
            per_key_fraction: 1.0,
        }
    }
}

impl Validate for RateLimitConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if !(self.capacity >= 1.0) {
            result.add_error("capacity must be at least 1");
        }
        if !(self.refill_per_sec > 0.0) {
            result.add_error("refill_per_sec must be positive");
        }
        if self.requests_per_minute == 0 {
            result.add_error("requests_per_minute must be at least 1");
        }
        if self.requests_per_day < self.requests_per_minute {
            result.add_warning("requests_per_day is below requests_per_minute");
        }
        if self.max_concurrent == 0 {
            result.add_error("max_concurrent must be at least 1");
        }
        if !(self.per_key_fraction > 0.0 && self.per_key_fraction <= 1.0) {
            result.add_error("per_key_fraction must be in (0, 1]");
        }
        if self.max_queue == 0 {
            result.add_warning("max_queue = 0 means callers are rejected instead of waiting for tokens");
        }

        result
    }
}

// ----------------------------------------------------------------------------
// Cache
// ----------------------------------------------------------------------------

/// Configuration for a response cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Whether successful results are cached at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Maximum number of entries.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// Time-to-live applied when `set` is called without one.
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,
    /// Share of capacity evicted when the cache is full.
    #[serde(default = "default_eviction_fraction")]
    pub eviction_fraction: f64,
    /// Interval of the background expiry sweep; `0` disables it.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_max_entries() -> usize {
    1000
}

fn default_ttl_secs() -> u64 {
    3600
}

fn default_eviction_fraction() -> f64 {
    0.1
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: default_max_entries(),
            default_ttl_secs: default_ttl_secs(),
            eviction_fraction: default_eviction_fraction(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl CacheConfig {
    /// Returns a disabled cache configuration.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Returns the default TTL as a Duration.
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    /// Returns the sweep interval, if enabled.
    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }
}

impl Validate for CacheConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.enabled && self.max_entries == 0 {
            result.add_error("max_entries must be at least 1 when the cache is enabled");
        }
        if !(self.eviction_fraction > 0.0 && self.eviction_fraction <= 1.0) {
            result.add_error("eviction_fraction must be in (0, 1]");
        } else if self.eviction_fraction < 0.1 {
            result.add_warning("eviction_fraction below 0.1 causes frequent evictions");
        }

        result
    }
}

// ----------------------------------------------------------------------------
// Per-collaborator resilience
// ----------------------------------------------------------------------------

/// Resilience settings for one collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// Retry policy.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Circuit breaker.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    /// Rate limiter.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Response cache.
    #[serde(default)]
    pub cache: CacheConfig,
}

impl ResilienceConfig {
    /// Returns a configuration with caching turned off.
    pub fn uncached() -> Self {
        Self {
            cache: CacheConfig::disabled(),
            ..Self::default()
        }
    }
}

impl Validate for ResilienceConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();
        result.merge_section("retry", self.retry.validate());
        result.merge_section("circuit_breaker", self.circuit_breaker.validate());
        result.merge_section("rate_limit", self.rate_limit.validate());
        result.merge_section("cache", self.cache.validate());
        result
    }
}

fn default_publisher_resilience() -> ResilienceConfig {
    ResilienceConfig::uncached()
}

// ----------------------------------------------------------------------------
// Workflow
// ----------------------------------------------------------------------------

/// Thresholds and limits for a workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Analyses below this confidence are escalated to a human.
    #[serde(default = "default_confidence_threshold")]
    pub analysis_confidence_threshold: f64,
    /// Reviews scoring below this are escalated to a human.
    #[serde(default = "default_approval_threshold")]
    pub review_approval_threshold: f64,
    /// Wall-clock budget for a whole run.
    #[serde(default = "default_max_execution_secs")]
    pub max_execution_secs: u64,
}

fn default_confidence_threshold() -> f64 {
    0.7
}

fn default_approval_threshold() -> f64 {
    0.8
}

fn default_max_execution_secs() -> u64 {
    300
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            analysis_confidence_threshold: default_confidence_threshold(),
            review_approval_threshold: default_approval_threshold(),
            max_execution_secs: default_max_execution_secs(),
        }
    }
}

impl WorkflowConfig {
    /// Returns the run budget as a Duration.
    pub fn max_execution(&self) -> Duration {
        Duration::from_secs(self.max_execution_secs)
    }
}

impl Validate for WorkflowConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if !(0.0..=1.0).contains(&self.analysis_confidence_threshold) {
            result.add_error("analysis_confidence_threshold must be in [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.review_approval_threshold) {
            result.add_error("review_approval_threshold must be in [0, 1]");
        }
        if self.max_execution_secs == 0 {
            result.add_error("max_execution_secs must be at least 1");
        }
        if self.max_execution_secs > 7200 {
            result.add_warning("max_execution_secs over 2 hours may indicate a misconfiguration");
        }
        if self.review_approval_threshold == 0.0 {
            result.add_warning("review_approval_threshold = 0 approves every reviewed change");
        }

        result
    }
}

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Run thresholds and limits.
    #[serde(default)]
    pub workflow: WorkflowConfig,
    /// Resilience for the analyzer.
    #[serde(default)]
    pub analyzer: ResilienceConfig,
    /// Resilience for the resolver.
    #[serde(default)]
    pub resolver: ResilienceConfig,
    /// Resilience for the reviewer.
    #[serde(default)]
    pub reviewer: ResilienceConfig,
    /// Resilience for the publisher. Uncached unless configured otherwise.
    #[serde(default = "default_publisher_resilience")]
    pub publisher: ResilienceConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workflow: WorkflowConfig::default(),
            analyzer: ResilienceConfig::default(),
            resolver: ResilienceConfig::default(),
            reviewer: ResilienceConfig::default(),
            publisher: default_publisher_resilience(),
        }
    }
}

impl PipelineConfig {
    /// Parses configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("failed to parse config: {}", e)))
    }

    /// Loads configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }
}

impl Validate for PipelineConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();
        result.merge_section("workflow", self.workflow.validate());
        result.merge_section("analyzer", self.analyzer.validate());
        result.merge_section("resolver", self.resolver.validate());
        result.merge_section("reviewer", self.reviewer.validate());
        result.merge_section("publisher", self.publisher.validate());

        if self.publisher.cache.enabled {
            result.add_warning("publisher: caching publications can hide duplicate change requests");
        }

        result
    }
}
