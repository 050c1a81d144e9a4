//! Scripted pipeline scenarios.
//!
//! A scenario is a YAML file naming an issue, the responses each collaborator
//! gives on successive calls, optional configuration and the expected outcome.
//! Replaying it drives a real [`WorkflowOrchestrator`] against scripted
//! collaborators, which makes pipeline behaviour reproducible offline.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::collaborator::{
    Analysis, Analyzer, ChangeSet, Collaborators, Issue, Publication, Publisher, Resolution,
    Resolver, Review, Reviewer,
};
use crate::config::PipelineConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::workflow::{Stage, WorkflowOrchestrator, WorkflowResult, WorkflowState};

/// An error a scripted collaborator returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptedError {
    pub kind: ErrorKind,
    #[serde(default)]
    pub message: String,
    /// Status for backend errors.
    #[serde(default)]
    pub status: Option<u16>,
    /// Wait hint for rate-limit errors.
    #[serde(default)]
    pub retry_after_ms: Option<u64>,
}

impl ScriptedError {
    /// Creates a scripted error of `kind`.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            retry_after_ms: None,
        }
    }

    /// Sets the backend status.
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Builds the matching [`Error`].
    pub fn to_error(&self) -> Error {
        let msg = self.message.clone();
        match self.kind {
            ErrorKind::Validation => Error::Validation(msg),
            ErrorKind::RateLimited => Error::RateLimited {
                reason: msg,
                retry_after: self.retry_after_ms.map(Duration::from_millis),
            },
            ErrorKind::Network => Error::Network(msg),
            ErrorKind::Timeout => Error::Timeout(Duration::ZERO),
            ErrorKind::Authentication => Error::Authentication(msg),
            ErrorKind::Backend => Error::Backend {
                status: self.status,
                message: msg,
            },
            ErrorKind::CircuitOpen => Error::CircuitOpen(msg),
            ErrorKind::Analysis => Error::Analysis(msg),
            ErrorKind::Publication => Error::Publication(msg),
            ErrorKind::WorkflowTimeout => Error::WorkflowTimeout(Duration::ZERO),
            ErrorKind::WorkflowCancelled => Error::WorkflowCancelled(msg),
            ErrorKind::DuplicateRun => Error::DuplicateRun(msg),
            ErrorKind::Config => Error::Config(msg),
            ErrorKind::Internal => Error::Internal(msg),
            ErrorKind::Io => Error::Io(std::io::Error::new(std::io::ErrorKind::Other, msg)),
        }
    }
}

/// One scripted response: a value or an error, optionally delayed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step<T> {
    pub value: Option<T>,
    #[serde(default)]
    pub error: Option<ScriptedError>,
    /// Time the collaborator takes to answer.
    #[serde(default)]
    pub delay_ms: u64,
}

impl<T> Step<T> {
    /// A successful response.
    pub fn ok(value: T) -> Self {
        Self {
            value: Some(value),
            error: None,
            delay_ms: 0,
        }
    }

    /// A failed response.
    pub fn fail(error: ScriptedError) -> Self {
        Self {
            value: None,
            error: Some(error),
            delay_ms: 0,
        }
    }

    /// Delays the response.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_ms = delay.as_millis() as u64;
        self
    }

    fn is_well_formed(&self) -> bool {
        self.value.is_some() != self.error.is_some()
    }
}

type CallLog = Arc<Mutex<Vec<Stage>>>;

/// Collaborator that replays scripted steps in order.
///
/// Call `n` gets step `n`; once the script runs out the last step repeats.
#[derive(Debug)]
pub struct Scripted<T> {
    stage: Stage,
    steps: Vec<Step<T>>,
    calls: AtomicU32,
    log: CallLog,
}

impl<T: Clone> Scripted<T> {
    fn new(stage: Stage, steps: Vec<Step<T>>, log: CallLog) -> Self {
        Self {
            stage,
            steps,
            calls: AtomicU32::new(0),
            log,
        }
    }

    /// Number of times the collaborator was called.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    async fn respond(&self) -> Result<T> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
        self.log.lock().push(self.stage);

        let Some(step) = self.steps.get(n).or_else(|| self.steps.last()) else {
            return Err(Error::Backend {
                status: None,
                message: format!("no scripted {} response", self.stage),
            });
        };
        if step.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(step.delay_ms)).await;
        }
        match (&step.error, &step.value) {
            (Some(error), _) => Err(error.to_error()),
            (None, Some(value)) => Ok(value.clone()),
            (None, None) => Err(Error::Config(format!("empty scripted {} step", self.stage))),
        }
    }
}

#[async_trait]
impl Analyzer for Scripted<Analysis> {
    async fn analyze(&self, _issue: &Issue) -> Result<Analysis> {
        self.respond().await
    }
}

#[async_trait]
impl Resolver for Scripted<Resolution> {
    async fn resolve(&self, _issue: &Issue, _analysis: &Analysis) -> Result<Resolution> {
        self.respond().await
    }
}

#[async_trait]
impl Reviewer for Scripted<Review> {
    async fn review(&self, _change_set: &ChangeSet, _issue: &Issue) -> Result<Review> {
        self.respond().await
    }
}

#[async_trait]
impl Publisher for Scripted<Publication> {
    async fn publish(&self, _change_set: &ChangeSet, _issue: &Issue) -> Result<Publication> {
        self.respond().await
    }
}

/// The four scripted collaborators of a scenario, sharing one call log.
#[derive(Debug, Clone)]
pub struct ScriptedCollaborators {
    pub analyzer: Arc<Scripted<Analysis>>,
    pub resolver: Arc<Scripted<Resolution>>,
    pub reviewer: Arc<Scripted<Review>>,
    pub publisher: Arc<Scripted<Publication>>,
    log: CallLog,
}

impl ScriptedCollaborators {
    /// Builds scripted collaborators from per-stage steps.
    pub fn new(
        analyzer: Vec<Step<Analysis>>,
        resolver: Vec<Step<Resolution>>,
        reviewer: Vec<Step<Review>>,
        publisher: Vec<Step<Publication>>,
    ) -> Self {
        let log: CallLog = Arc::new(Mutex::new(Vec::new()));
        Self {
            analyzer: Arc::new(Scripted::new(Stage::Analysis, analyzer, log.clone())),
            resolver: Arc::new(Scripted::new(Stage::Resolution, resolver, log.clone())),
            reviewer: Arc::new(Scripted::new(Stage::Review, reviewer, log.clone())),
            publisher: Arc::new(Scripted::new(Stage::Publication, publisher, log.clone())),
            log,
        }
    }

    /// Returns them as orchestrator collaborators.
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            analyzer: self.analyzer.clone(),
            resolver: self.resolver.clone(),
            reviewer: self.reviewer.clone(),
            publisher: self.publisher.clone(),
        }
    }

    /// Stages in the order their collaborators were called.
    pub fn call_order(&self) -> Vec<Stage> {
        self.log.lock().clone()
    }

    /// Calls per stage.
    pub fn call_counts(&self) -> BTreeMap<Stage, u32> {
        BTreeMap::from([
            (Stage::Analysis, self.analyzer.calls()),
            (Stage::Resolution, self.resolver.calls()),
            (Stage::Review, self.reviewer.calls()),
            (Stage::Publication, self.publisher.calls()),
        ])
    }
}

/// What a scenario run must produce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Expectation {
    pub final_state: WorkflowState,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub requires_human_review: Option<bool>,
    /// Expected attempts per stage.
    #[serde(default)]
    pub stage_attempts: BTreeMap<Stage, u32>,
    /// Expected collaborator calls per stage.
    #[serde(default)]
    pub calls: BTreeMap<Stage, u32>,
}

/// A scripted pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    /// Scenario name.
    pub name: String,

    /// Description of what this scenario covers.
    #[serde(default)]
    pub description: String,

    /// Issue to process.
    pub issue: Issue,

    /// Pipeline configuration; defaults when absent.
    #[serde(default)]
    pub config: Option<PipelineConfig>,

    #[serde(default)]
    pub analyzer: Vec<Step<Analysis>>,

    #[serde(default)]
    pub resolver: Vec<Step<Resolution>>,

    #[serde(default)]
    pub reviewer: Vec<Step<Review>>,

    #[serde(default)]
    pub publisher: Vec<Step<Publication>>,

    /// Expected outcome.
    #[serde(default)]
    pub expect: Option<Expectation>,
}

impl Scenario {
    /// Loads a scenario from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(Error::Io)?;
        Self::from_yaml_str(&content)
    }

    /// Parses and checks a scenario from YAML.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let scenario: Scenario = serde_yaml::from_str(content)
            .map_err(|e| Error::Config(format!("failed to parse scenario: {}", e)))?;
        scenario.check_steps()?;
        Ok(scenario)
    }

    fn check_steps(&self) -> Result<()> {
        let malformed = [
            (Stage::Analysis, self.analyzer.iter().all(Step::is_well_formed)),
            (Stage::Resolution, self.resolver.iter().all(Step::is_well_formed)),
            (Stage::Review, self.reviewer.iter().all(Step::is_well_formed)),
            (Stage::Publication, self.publisher.iter().all(Step::is_well_formed)),
        ]
        .into_iter()
        .filter(|(_, ok)| !ok)
        .map(|(stage, _)| stage.collaborator())
        .collect::<Vec<_>>();

        if malformed.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(format!(
                "scenario '{}': every step needs exactly one of value or error ({})",
                self.name,
                malformed.join(", ")
            )))
        }
    }

    /// Builds fresh scripted collaborators for this scenario.
    pub fn scripted(&self) -> ScriptedCollaborators {
        ScriptedCollaborators::new(
            self.analyzer.clone(),
            self.resolver.clone(),
            self.reviewer.clone(),
            self.publisher.clone(),
        )
    }

    /// Replays the scenario through a new orchestrator.
    pub async fn run(&self) -> Result<ScenarioReport> {
        let scripted = self.scripted();
        let config = self.config.clone().unwrap_or_default();
        let orchestrator = WorkflowOrchestrator::new(config, scripted.collaborators())?;

        tracing::info!(scenario = %self.name, issue_id = %self.issue.id, "replaying scenario");
        let result = orchestrator
            .process_issue(&self.issue.id, &self.issue.title, &self.issue.body)
            .await?;

        Ok(ScenarioReport {
            name: self.name.clone(),
            result,
            calls: scripted.call_counts(),
            call_order: scripted.call_order(),
        })
    }
}

/// Outcome of replaying a scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub name: String,
    pub result: WorkflowResult,
    pub calls: BTreeMap<Stage, u32>,
    pub call_order: Vec<Stage>,
}

impl ScenarioReport {
    /// Lists every way the run differs from `expect`.
    pub fn mismatches(&self, expect: &Expectation) -> Vec<String> {
        let mut out = Vec::new();
        let result = &self.result;

        if result.final_state != expect.final_state {
            out.push(format!(
                "final state: expected {}, got {}",
                expect.final_state, result.final_state
            ));
        }
        if let Some(success) = expect.success {
            if result.success != success {
                out.push(format!("success: expected {success}, got {}", result.success));
            }
        }
        if let Some(review) = expect.requires_human_review {
            if result.requires_human_review != review {
                out.push(format!(
                    "requires_human_review: expected {review}, got {}",
                    result.requires_human_review
                ));
            }
        }
        for (stage, attempts) in &expect.stage_attempts {
            let actual = result.stage(*stage).map(|s| s.attempts);
            if actual != Some(*attempts) {
                out.push(format!("{stage} attempts: expected {attempts}, got {actual:?}"));
            }
        }
        for (stage, calls) in &expect.calls {
            let actual = self.calls.get(stage).copied().unwrap_or(0);
            if actual != *calls {
                out.push(format!("{stage} calls: expected {calls}, got {actual}"));
            }
        }
        out
    }

    /// Returns true if the run matches `expect`.
    pub fn matches_expectation(&self, expect: &Expectation) -> bool {
        self.mismatches(expect).is_empty()
    }
}
