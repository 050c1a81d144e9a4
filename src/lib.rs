//! Issue Autopilot - resilient orchestration of automated issue resolution
//!
//! This library drives software issues through analysis, resolution, review and
//! publication, calling pluggable collaborators through retry, circuit-breaker,
//! rate-limit and cache layers. Runs that cannot be completed safely are
//! escalated to human review.

pub mod backoff;
pub mod collaborator;
pub mod config;
pub mod error;
pub mod resilience;
pub mod scenario;
pub mod workflow;

pub use error::{Error, ErrorKind, Result};

pub use collaborator::{
    Analysis, Analyzer, ChangeAction, ChangeSet, Collaborators, Complexity, FileChange, Issue,
    Publication, Publisher, Resolution, Resolver, Review, ReviewVerdict, Reviewer,
};

pub use config::{
    CacheConfig, CircuitBreakerConfig, PipelineConfig, RateLimitConfig, ResilienceConfig,
    RetryConfig, Validate, ValidationResult, WorkflowConfig,
};

pub use resilience::{
    CacheManager, CircuitBreaker, CircuitState, ClientHealth, KeyedRateLimiter, RateLimiter,
    ResilientClient, RetryPolicy,
};

pub use scenario::{Expectation, Scenario, ScenarioReport, ScriptedCollaborators, ScriptedError, Step};

pub use workflow::{
    GlobalMetrics, PipelineHealth, Stage, WorkflowOrchestrator, WorkflowResult, WorkflowState,
};
