//! Per-run records: the live run, stage results and the final result.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::{Stage, WorkflowState};
use crate::collaborator::{Analysis, Issue, Publication, Resolution, Review};
use crate::error::{Error, ErrorKind};
use crate::resilience::AttemptError;

/// An error appended to a run's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub at: DateTime<Utc>,
    /// Stage that produced the error, if any.
    pub stage: Option<Stage>,
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorRecord {
    /// Records `err` as of now.
    pub fn new(stage: Option<Stage>, err: &Error) -> Self {
        Self {
            at: Utc::now(),
            stage,
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    /// Records an attempt that failed and was retried.
    pub fn retried(stage: Stage, attempt: &AttemptError) -> Self {
        Self {
            at: attempt.at,
            stage: Some(stage),
            kind: attempt.kind,
            message: attempt.message.clone(),
        }
    }
}

/// Stage-specific payload of a successful stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", content = "output", rename_all = "snake_case")]
pub enum StageOutput {
    Analysis(Analysis),
    Resolution(Resolution),
    Review(Review),
    Publication(Publication),
}

impl From<Analysis> for StageOutput {
    fn from(v: Analysis) -> Self {
        StageOutput::Analysis(v)
    }
}

impl From<Resolution> for StageOutput {
    fn from(v: Resolution) -> Self {
        StageOutput::Resolution(v)
    }
}

impl From<Review> for StageOutput {
    fn from(v: Review) -> Self {
        StageOutput::Review(v)
    }
}

impl From<Publication> for StageOutput {
    fn from(v: Publication) -> Self {
        StageOutput::Publication(v)
    }
}

/// Outcome of one stage of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: Stage,
    pub success: bool,
    #[serde(default)]
    pub output: Option<StageOutput>,
    #[serde(default)]
    pub error: Option<ErrorRecord>,
    /// Attempts made against the collaborator.
    pub attempts: u32,
    pub from_cache: bool,
    pub duration_ms: u64,
}

/// Entry in the run's state history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub state: WorkflowState,
    pub at: DateTime<Utc>,
}

/// One execution of the pipeline for one issue.
///
/// Only the orchestrator mutates a run.
#[derive(Debug, Clone)]
pub struct WorkflowRun {
    pub run_id: Uuid,
    pub issue: Issue,
    pub state: WorkflowState,
    pub started_at: DateTime<Utc>,
    pub transitions: Vec<Transition>,
    pub stages: Vec<StageResult>,
    pub errors: Vec<ErrorRecord>,
    pub publication: Option<Publication>,
    /// Why the run was escalated or failed.
    pub reason: Option<String>,
    started: tokio::time::Instant,
}

impl WorkflowRun {
    /// Starts a run in `Initializing`.
    pub fn new(issue: Issue) -> Self {
        let started_at = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            issue,
            state: WorkflowState::Initializing,
            started_at,
            transitions: vec![Transition {
                state: WorkflowState::Initializing,
                at: started_at,
            }],
            stages: Vec::new(),
            errors: Vec::new(),
            publication: None,
            reason: None,
            started: tokio::time::Instant::now(),
        }
    }

    /// Moves to `to` if the transition is legal. Returns false otherwise.
    pub fn transition(&mut self, to: WorkflowState) -> bool {
        if !self.state.can_transition_to(to) {
            tracing::warn!(
                issue_id = %self.issue.id,
                from = %self.state,
                to = %to,
                "illegal state transition ignored"
            );
            return false;
        }
        self.state = to;
        self.transitions.push(Transition {
            state: to,
            at: Utc::now(),
        });
        true
    }

    /// Appends an error to the run's log.
    pub fn record_error(&mut self, stage: Option<Stage>, err: &Error) {
        self.errors.push(ErrorRecord::new(stage, err));
    }

    /// Time since the run started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Builds the caller-facing result. The run must be terminal.
    pub fn to_result(&self) -> WorkflowResult {
        let success = self.state == WorkflowState::Complete;
        let error = if success {
            None
        } else {
            self.reason
                .clone()
                .or_else(|| self.errors.last().map(|e| e.message.clone()))
                .or_else(|| Some(format!("run ended in state {}", self.state)))
        };

        WorkflowResult {
            issue_id: self.issue.id.clone(),
            run_id: self.run_id,
            success,
            final_state: self.state,
            error,
            requires_human_review: self.state == WorkflowState::RequiresHumanReview,
            execution_time_ms: self.elapsed().as_millis() as u64,
            errors: self.errors.clone(),
            stages: self.stages.clone(),
            publication: self.publication.clone(),
        }
    }
}

/// Result of processing one issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub issue_id: String,
    pub run_id: Uuid,
    pub success: bool,
    pub final_state: WorkflowState,
    /// Human-readable summary when the run did not complete.
    pub error: Option<String>,
    pub requires_human_review: bool,
    pub execution_time_ms: u64,
    pub errors: Vec<ErrorRecord>,
    pub stages: Vec<StageResult>,
    pub publication: Option<Publication>,
}

impl WorkflowResult {
    /// Returns the result for `stage`, if it ran.
    pub fn stage(&self, stage: Stage) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.stage == stage)
    }
}

/// Summary of an in-flight run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveWorkflow {
    pub id: String,
    pub run_id: Uuid,
    pub state: WorkflowState,
    pub started_at: DateTime<Utc>,
}
