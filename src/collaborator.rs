//! Collaborator contracts consumed by the orchestrator.
//!
//! Four external capabilities drive a run: an [`Analyzer`] judges the issue, a
//! [`Resolver`] proposes a change set, a [`Reviewer`] scores it and a
//! [`Publisher`] opens the change request. Implementations are injected through
//! [`Collaborators`].

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// An issue submitted for processing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    /// Identifier, unique among active runs.
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub body: String,
}

impl Issue {
    /// Creates an issue.
    pub fn new(id: impl Into<String>, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            body: body.into(),
        }
    }

    /// Rejects issues that cannot be processed at all.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::Validation("issue id must not be empty".to_string()));
        }
        if self.title.trim().is_empty() {
            return Err(Error::Validation(format!("issue {} has an empty title", self.id)));
        }
        Ok(())
    }

    /// Hash of the title and body, stable for the life of the process.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.title.hash(&mut hasher);
        self.body.hash(&mut hasher);
        hasher.finish()
    }

    /// Cache and rate-limit key for calls about this issue.
    ///
    /// Editing the issue text yields a new key, so stale analyses are not reused.
    pub fn cache_key(&self) -> String {
        format!("{}:{:016x}", self.id, self.fingerprint())
    }
}

/// Estimated effort of resolving an issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    #[default]
    Medium,
    High,
}

/// Output of the analysis stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    /// Kind of issue, e.g. "bug" or "feature".
    pub category: String,
    #[serde(default)]
    pub complexity: Complexity,
    pub feasible: bool,
    /// Confidence in the analysis, in `[0, 1]`.
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
}

/// What happens to a file in a change set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Create,
    Modify,
    Delete,
}

/// One file touched by a change set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub action: ChangeAction,
    /// New file content; absent for deletions.
    #[serde(default)]
    pub content: Option<String>,
}

/// Proposed fix for an issue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeSet {
    pub summary: String,
    #[serde(default)]
    pub files: Vec<FileChange>,
}

impl ChangeSet {
    /// Hash of the summary and file changes.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

/// Output of the resolution stage.
///
/// `Unresolved` is a normal answer meaning the resolver could not produce a
/// fix. It escalates the run rather than failing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Resolution {
    Resolved {
        change_set: ChangeSet,
        confidence: f64,
        #[serde(default)]
        reasoning: String,
    },
    Unresolved {
        #[serde(default)]
        confidence: f64,
        reasoning: String,
    },
}

impl Resolution {
    /// Returns the change set when the issue was resolved.
    pub fn change_set(&self) -> Option<&ChangeSet> {
        match self {
            Resolution::Resolved { change_set, .. } => Some(change_set),
            Resolution::Unresolved { .. } => None,
        }
    }
}

/// Verdict from a reviewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewVerdict {
    /// Changes are approved.
    Approved,
    /// Changes need modifications.
    NeedsChanges,
    /// Changes must not be published.
    Rejected,
}

/// Output of the review stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub verdict: ReviewVerdict,
    /// Quality score in `[0, 1]`.
    pub score: f64,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

impl Review {
    /// Returns true if the reviewer approved the change set.
    pub fn approved(&self) -> bool {
        self.verdict == ReviewVerdict::Approved
    }
}

/// A published change request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publication {
    pub identifier: String,
    pub url: String,
}

/// Judges whether and how an issue can be resolved.
#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Fails with [`Error::Analysis`] on malformed input or a backend fault.
    async fn analyze(&self, issue: &Issue) -> Result<Analysis>;
}

/// Proposes a change set for an analysed issue.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, issue: &Issue, analysis: &Analysis) -> Result<Resolution>;
}

/// Scores a proposed change set.
#[async_trait]
pub trait Reviewer: Send + Sync {
    async fn review(&self, change_set: &ChangeSet, issue: &Issue) -> Result<Review>;
}

/// Publishes an approved change set.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Fails with [`Error::Publication`] when the backend rejects the change.
    async fn publish(&self, change_set: &ChangeSet, issue: &Issue) -> Result<Publication>;
}

/// The four collaborators a run needs.
#[derive(Clone)]
pub struct Collaborators {
    pub analyzer: Arc<dyn Analyzer>,
    pub resolver: Arc<dyn Resolver>,
    pub reviewer: Arc<dyn Reviewer>,
    pub publisher: Arc<dyn Publisher>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
