//! Error types for the issue autopilot.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level error type for pipeline and resilience operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Input was rejected before any external call was made.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A quota or concurrency ceiling was hit.
    #[error("rate limit exceeded: {reason}")]
    RateLimited {
        reason: String,
        /// How long the caller should wait before trying again, when known.
        retry_after: Option<Duration>,
    },

    /// Transport-level failure talking to a collaborator.
    #[error("network error: {0}")]
    Network(String),

    /// A single attempt did not complete in time.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Credentials were rejected; needs operator action.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The collaborator answered with an error.
    #[error("backend error{}: {message}", .status.map(|s| format!(" (status {s})")).unwrap_or_default())]
    Backend { status: Option<u16>, message: String },

    /// The circuit protecting a collaborator is open.
    #[error("circuit '{0}' is open")]
    CircuitOpen(String),

    /// Issue analysis could not be performed.
    #[error("analysis failed: {0}")]
    Analysis(String),

    /// The change request could not be published.
    #[error("publication failed: {0}")]
    Publication(String),

    /// The whole run exceeded its time budget.
    #[error("workflow timed out after {0:?}")]
    WorkflowTimeout(Duration),

    /// The run was cancelled by a caller.
    #[error("workflow cancelled: {0}")]
    WorkflowCancelled(String),

    /// A run for this issue is already in flight.
    #[error("workflow already active for issue {0}")]
    DuplicateRun(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// A stage task ended without producing a result.
    #[error("internal error: {0}")]
    Internal(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Discriminant of [`Error`], used for retry classification and statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    RateLimited,
    Network,
    Timeout,
    Authentication,
    Backend,
    CircuitOpen,
    Analysis,
    Publication,
    WorkflowTimeout,
    WorkflowCancelled,
    DuplicateRun,
    Config,
    Internal,
    Io,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Backend => "backend",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Analysis => "analysis",
            ErrorKind::Publication => "publication",
            ErrorKind::WorkflowTimeout => "workflow_timeout",
            ErrorKind::WorkflowCancelled => "workflow_cancelled",
            ErrorKind::DuplicateRun => "duplicate_run",
            ErrorKind::Config => "config",
            ErrorKind::Internal => "internal",
            ErrorKind::Io => "io",
        };
        f.write_str(s)
    }
}

impl Error {
    /// Returns the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::RateLimited { .. } => ErrorKind::RateLimited,
            Error::Network(_) => ErrorKind::Network,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Authentication(_) => ErrorKind::Authentication,
            Error::Backend { .. } => ErrorKind::Backend,
            Error::CircuitOpen(_) => ErrorKind::CircuitOpen,
            Error::Analysis(_) => ErrorKind::Analysis,
            Error::Publication(_) => ErrorKind::Publication,
            Error::WorkflowTimeout(_) => ErrorKind::WorkflowTimeout,
            Error::WorkflowCancelled(_) => ErrorKind::WorkflowCancelled,
            Error::DuplicateRun(_) => ErrorKind::DuplicateRun,
            Error::Config(_) => ErrorKind::Config,
            Error::Internal(_) => ErrorKind::Internal,
            Error::Io(_) => ErrorKind::Io,
        }
    }

    /// Returns the server status carried by a backend error.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Backend { status, .. } => *status,
            _ => None,
        }
    }

    /// Returns true for backend errors that look like a transient server fault.
    ///
    /// A backend error without a status is treated as a server fault.
    pub fn is_server_fault(&self) -> bool {
        match self {
            Error::Backend { status, .. } => status.map(|s| s >= 500).unwrap_or(true),
            _ => false,
        }
    }

    /// Returns true if this failure says something about the health of the backend.
    ///
    /// Only these failures count toward opening a circuit.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Timeout(_)) || self.is_server_fault()
    }

    /// Returns the wait hint carried by a rate-limit error.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Creates a rate-limit error without a wait hint.
    pub fn rate_limited(reason: impl Into<String>) -> Self {
        Error::RateLimited {
            reason: reason.into(),
            retry_after: None,
        }
    }

    /// Creates a backend error with a status code.
    pub fn backend(status: u16, message: impl Into<String>) -> Self {
        Error::Backend {
            status: Some(status),
            message: message.into(),
        }
    }
}

/// Result type alias for autopilot operations.
pub type Result<T> = std::result::Result<T, Error>;
