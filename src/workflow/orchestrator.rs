//! WorkflowOrchestrator: drives issues through the pipeline.
//!
//! Each run goes Analysis → feasibility check → Resolution → Review →
//! Publication. Collaborator calls go through a shared [`ResilientClient`] per
//! collaborator, so concurrent runs share rate limits, caches and circuits.
//!
//! Stage calls run on their own task. When a run times out or is cancelled
//! the task is left to finish on its own and its result is discarded.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use super::metrics::{GlobalMetrics, MetricsCollector};
use super::run::{ActiveWorkflow, ErrorRecord, StageOutput, StageResult, WorkflowResult, WorkflowRun};
use super::state::{Stage, WorkflowState};
use crate::collaborator::{Analysis, Collaborators, Issue, Publication, Resolution, Review};
use crate::config::{PipelineConfig, Validate, WorkflowConfig};
use crate::error::{Error, Result};
use crate::resilience::{CallOutcome, ClientHealth, ResilientClient};

/// Health of every collaborator client.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineHealth {
    pub analyzer: ClientHealth,
    pub resolver: ClientHealth,
    pub reviewer: ClientHealth,
    pub publisher: ClientHealth,
    pub active_workflows: usize,
}

impl PipelineHealth {
    /// Returns true when every circuit is closed.
    pub fn is_healthy(&self) -> bool {
        [&self.analyzer, &self.resolver, &self.reviewer, &self.publisher]
            .iter()
            .all(|c| c.is_healthy())
    }
}

struct StageClients {
    analyzer: Arc<ResilientClient<Analysis>>,
    resolver: Arc<ResilientClient<Resolution>>,
    reviewer: Arc<ResilientClient<Review>>,
    publisher: Arc<ResilientClient<Publication>>,
}

struct RunHandle {
    run_id: Uuid,
    state: WorkflowState,
    started_at: DateTime<Utc>,
    cancel: watch::Sender<Option<String>>,
    /// Set by cancellation; the handle stays until the run itself unregisters.
    cancelled: bool,
}

/// How a run ends.
enum Disposition {
    Complete,
    Escalate(String),
    Fail(Error),
    Cancelled(String),
    TimedOut,
}

enum StageStep<T> {
    Done(T),
    Stop(Disposition),
}

enum Race<T> {
    Cancelled(String),
    TimedOut,
    Joined(std::result::Result<CallOutcome<T>, tokio::task::JoinError>),
}

/// Top-level state machine for issue runs.
pub struct WorkflowOrchestrator {
    config: WorkflowConfig,
    collaborators: Collaborators,
    clients: StageClients,
    registry: Mutex<HashMap<String, RunHandle>>,
    metrics: MetricsCollector,
}

impl WorkflowOrchestrator {
    /// Creates an orchestrator, rejecting invalid configuration.
    pub fn new(config: PipelineConfig, collaborators: Collaborators) -> Result<Self> {
        let warnings = config.validate().into_result()?;
        for warning in &warnings {
            tracing::warn!(warning = %warning, "configuration warning");
        }

        let clients = StageClients {
            analyzer: Arc::new(ResilientClient::new("analyzer", &config.analyzer)),
            resolver: Arc::new(ResilientClient::new("resolver", &config.resolver)),
            reviewer: Arc::new(ResilientClient::new("reviewer", &config.reviewer)),
            publisher: Arc::new(ResilientClient::new("publisher", &config.publisher)),
        };

        Ok(Self {
            config: config.workflow,
            collaborators,
            clients,
            registry: Mutex::new(HashMap::new()),
            metrics: MetricsCollector::new(),
        })
    }

    /// Returns the workflow configuration.
    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    /// Runs the pipeline for one issue.
    ///
    /// Fails with [`Error::Validation`] for an unusable issue and with
    /// [`Error::DuplicateRun`] if a run for the same id is already active.
    /// Every other outcome, including failures, is reported in the result.
    pub async fn process_issue(
        &self,
        id: impl Into<String>,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Result<WorkflowResult> {
        let issue = Issue::new(id, title, body);
        issue.validate()?;

        let mut run = WorkflowRun::new(issue);
        let mut cancel = self.register(&run)?;
        tracing::info!(issue_id = %run.issue.id, run_id = %run.run_id, "workflow started");

        let deadline = Instant::now() + self.config.max_execution();
        let disposition = self.drive(&mut run, deadline, &mut cancel).await;
        self.finish(&mut run, disposition);
        self.unregister(&run);

        let result = run.to_result();
        self.metrics.record(&result);
        tracing::info!(
            issue_id = %result.issue_id,
            final_state = %result.final_state,
            execution_ms = result.execution_time_ms,
            "workflow finished"
        );
        Ok(result)
    }

    /// Returns the state of an active run, or `None` once it has finished.
    ///
    /// A cancelled run reports `None` while it winds down.
    pub fn get_current_state(&self, id: &str) -> Option<WorkflowState> {
        self.registry
            .lock()
            .get(id)
            .filter(|h| !h.cancelled)
            .map(|h| h.state)
    }

    /// Lists active runs, oldest first.
    pub fn get_active_workflows(&self) -> Vec<ActiveWorkflow> {
        let mut active: Vec<ActiveWorkflow> = self
            .registry
            .lock()
            .iter()
            .filter(|(_, h)| !h.cancelled)
            .map(|(id, h)| ActiveWorkflow {
                id: id.clone(),
                run_id: h.run_id,
                state: h.state,
                started_at: h.started_at,
            })
            .collect();
        active.sort_by_key(|a| a.started_at);
        active
    }

    /// Returns aggregate metrics over finished runs.
    pub fn get_global_metrics(&self) -> GlobalMetrics {
        self.metrics.snapshot(self.active_count())
    }

    /// Cancels an active run. Returns false if no such run is active.
    ///
    /// The run ends as `Cancelled` at its next suspension point; a stage call
    /// already in flight is left to finish and its result is discarded. Until
    /// then the issue id stays reserved, so a new run for it is rejected.
    pub fn cancel_workflow(&self, id: &str, reason: impl Into<String>) -> bool {
        let mut registry = self.registry.lock();
        let Some(handle) = registry.get_mut(id).filter(|h| !h.cancelled) else {
            return false;
        };
        handle.cancelled = true;
        let reason = reason.into();
        tracing::info!(issue_id = %id, reason = %reason, "workflow cancellation requested");
        let _ = handle.cancel.send(Some(reason));
        true
    }

    fn active_count(&self) -> usize {
        self.registry.lock().values().filter(|h| !h.cancelled).count()
    }

    /// Returns the health of every collaborator client.
    pub fn health(&self) -> PipelineHealth {
        PipelineHealth {
            analyzer: self.clients.analyzer.health(),
            resolver: self.clients.resolver.health(),
            reviewer: self.clients.reviewer.health(),
            publisher: self.clients.publisher.health(),
            active_workflows: self.active_count(),
        }
    }

    fn register(&self, run: &WorkflowRun) -> Result<watch::Receiver<Option<String>>> {
        let mut registry = self.registry.lock();
        if registry.contains_key(&run.issue.id) {
            tracing::warn!(issue_id = %run.issue.id, "rejected duplicate workflow");
            return Err(Error::DuplicateRun(run.issue.id.clone()));
        }
        let (tx, rx) = watch::channel(None);
        registry.insert(
            run.issue.id.clone(),
            RunHandle {
                run_id: run.run_id,
                state: run.state,
                started_at: run.started_at,
                cancel: tx,
                cancelled: false,
            },
        );
        Ok(rx)
    }

    fn unregister(&self, run: &WorkflowRun) {
        let mut registry = self.registry.lock();
        if registry.get(&run.issue.id).map(|h| h.run_id) == Some(run.run_id) {
            registry.remove(&run.issue.id);
        }
    }

    fn advance(&self, run: &mut WorkflowRun, to: WorkflowState) {
        if !run.transition(to) {
            return;
        }
        if let Some(handle) = self.registry.lock().get_mut(&run.issue.id) {
            if handle.run_id == run.run_id {
                handle.state = to;
            }
        }
        tracing::debug!(issue_id = %run.issue.id, state = %to, "workflow state changed");
    }

    async fn drive(
        &self,
        run: &mut WorkflowRun,
        deadline: Instant,
        cancel: &mut watch::Receiver<Option<String>>,
    ) -> Disposition {
        let issue = run.issue.clone();
        let key = issue.cache_key();

        // Analysis
        if let Some(stop) = checkpoint(cancel, deadline) {
            return stop;
        }
        self.advance(run, WorkflowState::AnalyzingIssue);
        let task = {
            let analyzer = self.collaborators.analyzer.clone();
            let issue = issue.clone();
            spawn_stage(&self.clients.analyzer, key.clone(), move || {
                let analyzer = analyzer.clone();
                let issue = issue.clone();
                async move { analyzer.analyze(&issue).await }
            })
        };
        let analysis = match self.await_stage(run, Stage::Analysis, task, deadline, cancel).await {
            StageStep::Done(analysis) => analysis,
            StageStep::Stop(stop) => return stop,
        };

        self.advance(run, WorkflowState::CheckingFeasibility);
        if !analysis.feasible {
            return Disposition::Escalate(format!(
                "analysis marked the issue infeasible: {}",
                analysis.reasoning
            ));
        }
        let threshold = self.config.analysis_confidence_threshold;
        if !(analysis.confidence >= threshold) {
            return Disposition::Escalate(format!(
                "analysis confidence {:.2} below threshold {:.2}",
                analysis.confidence, threshold
            ));
        }

        // Resolution
        if let Some(stop) = checkpoint(cancel, deadline) {
            return stop;
        }
        self.advance(run, WorkflowState::GeneratingSolution);
        let task = {
            let resolver = self.collaborators.resolver.clone();
            let issue = issue.clone();
            let analysis = analysis.clone();
            spawn_stage(&self.clients.resolver, key.clone(), move || {
                let resolver = resolver.clone();
                let issue = issue.clone();
                let analysis = analysis.clone();
                async move { resolver.resolve(&issue, &analysis).await }
            })
        };
        let resolution = match self.await_stage(run, Stage::Resolution, task, deadline, cancel).await {
            StageStep::Done(resolution) => resolution,
            StageStep::Stop(stop) => return stop,
        };
        let change_set = match resolution {
            Resolution::Resolved { change_set, .. } => change_set,
            Resolution::Unresolved { reasoning, .. } => {
                return Disposition::Escalate(format!("resolver could not resolve the issue: {reasoning}"));
            }
        };
        let change_key = format!("{}:{:016x}", key, change_set.fingerprint());

        // Review
        if let Some(stop) = checkpoint(cancel, deadline) {
            return stop;
        }
        self.advance(run, WorkflowState::ReviewingCode);
        let task = {
            let reviewer = self.collaborators.reviewer.clone();
            let issue = issue.clone();
            let change_set = change_set.clone();
            spawn_stage(&self.clients.reviewer, change_key.clone(), move || {
                let reviewer = reviewer.clone();
                let issue = issue.clone();
                let change_set = change_set.clone();
                async move { reviewer.review(&change_set, &issue).await }
            })
        };
        let review = match self.await_stage(run, Stage::Review, task, deadline, cancel).await {
            StageStep::Done(review) => review,
            StageStep::Stop(stop) => return stop,
        };
        if !review.approved() {
            return Disposition::Escalate(format!(
                "reviewer did not approve ({:?}): {}",
                review.verdict,
                review.issues.join("; ")
            ));
        }
        let threshold = self.config.review_approval_threshold;
        if !(review.score >= threshold) {
            return Disposition::Escalate(format!(
                "review score {:.2} below threshold {:.2}",
                review.score, threshold
            ));
        }

        // Publication
        if let Some(stop) = checkpoint(cancel, deadline) {
            return stop;
        }
        self.advance(run, WorkflowState::CreatingPublication);
        let task = {
            let publisher = self.collaborators.publisher.clone();
            let issue = issue.clone();
            spawn_stage(&self.clients.publisher, change_key, move || {
                let publisher = publisher.clone();
                let issue = issue.clone();
                let change_set = change_set.clone();
                async move { publisher.publish(&change_set, &issue).await }
            })
        };
        match self.await_stage(run, Stage::Publication, task, deadline, cancel).await {
            StageStep::Done(publication) => {
                run.publication = Some(publication);
                Disposition::Complete
            }
            StageStep::Stop(stop) => stop,
        }
    }

    /// Waits for a stage task, racing it against cancellation and the deadline.
    async fn await_stage<T>(
        &self,
        run: &mut WorkflowRun,
        stage: Stage,
        mut task: JoinHandle<CallOutcome<T>>,
        deadline: Instant,
        cancel: &mut watch::Receiver<Option<String>>,
    ) -> StageStep<T>
    where
        T: Clone + Into<StageOutput> + Send + 'static,
    {
        let race = tokio::select! {
            biased;
            reason = cancelled(cancel) => Race::Cancelled(reason),
            _ = tokio::time::sleep_until(deadline) => Race::TimedOut,
            joined = &mut task => Race::Joined(joined),
        };

        let joined = match race {
            Race::Cancelled(reason) => {
                abandon(task, run.issue.id.clone(), stage);
                return StageStep::Stop(Disposition::Cancelled(reason));
            }
            Race::TimedOut => {
                abandon(task, run.issue.id.clone(), stage);
                return StageStep::Stop(Disposition::TimedOut);
            }
            Race::Joined(joined) => joined,
        };

        if let Some(reason) = cancel.borrow().clone() {
            tracing::warn!(issue_id = %run.issue.id, stage = %stage, "late completion discarded");
            return StageStep::Stop(Disposition::Cancelled(reason));
        }

        let outcome = joined.unwrap_or_else(|e| CallOutcome {
            result: Err(Error::Internal(format!("{stage} task ended: {e}"))),
            attempts: 0,
            retried_errors: Vec::new(),
            from_cache: false,
            latency: Default::default(),
        });
        let duration_ms = outcome.latency.as_millis() as u64;
        run.errors.extend(
            outcome
                .retried_errors
                .iter()
                .map(|attempt| ErrorRecord::retried(stage, attempt)),
        );

        match outcome.result {
            Ok(value) => {
                tracing::info!(
                    issue_id = %run.issue.id,
                    stage = %stage,
                    attempts = outcome.attempts,
                    from_cache = outcome.from_cache,
                    duration_ms,
                    "stage completed"
                );
                run.stages.push(StageResult {
                    stage,
                    success: true,
                    output: Some(value.clone().into()),
                    error: None,
                    attempts: outcome.attempts,
                    from_cache: outcome.from_cache,
                    duration_ms,
                });
                StageStep::Done(value)
            }
            Err(err) => {
                tracing::warn!(
                    issue_id = %run.issue.id,
                    stage = %stage,
                    attempts = outcome.attempts,
                    error = %err,
                    "stage failed"
                );
                let record = ErrorRecord::new(Some(stage), &err);
                run.stages.push(StageResult {
                    stage,
                    success: false,
                    output: None,
                    error: Some(record.clone()),
                    attempts: outcome.attempts,
                    from_cache: false,
                    duration_ms,
                });
                run.errors.push(record);
                StageStep::Stop(Disposition::Fail(err))
            }
        }
    }

    fn finish(&self, run: &mut WorkflowRun, disposition: Disposition) {
        let in_progress = stage_for(run.state);
        match disposition {
            Disposition::Complete => {
                self.advance(run, WorkflowState::Complete);
            }
            Disposition::Escalate(reason) => {
                tracing::warn!(issue_id = %run.issue.id, reason = %reason, "escalated to human review");
                run.reason = Some(reason);
                self.advance(run, WorkflowState::RequiresHumanReview);
            }
            Disposition::Fail(err) => {
                tracing::error!(issue_id = %run.issue.id, error = %err, "workflow failed");
                run.reason = Some(err.to_string());
                self.advance(run, WorkflowState::Failed);
            }
            Disposition::TimedOut => {
                let err = Error::WorkflowTimeout(self.config.max_execution());
                tracing::error!(issue_id = %run.issue.id, error = %err, "workflow timed out");
                run.record_error(in_progress, &err);
                run.reason = Some(err.to_string());
                self.advance(run, WorkflowState::Failed);
            }
            Disposition::Cancelled(reason) => {
                let err = Error::WorkflowCancelled(reason);
                tracing::info!(issue_id = %run.issue.id, "workflow cancelled");
                run.record_error(in_progress, &err);
                run.reason = Some(err.to_string());
                self.advance(run, WorkflowState::Cancelled);
            }
        }
    }
}

impl std::fmt::Debug for WorkflowOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowOrchestrator")
            .field("config", &self.config)
            .field("active", &self.active_count())
            .finish_non_exhaustive()
    }
}

/// Starts a protected collaborator call on its own task.
fn spawn_stage<T, F, Fut>(
    client: &Arc<ResilientClient<T>>,
    key: String,
    call: F,
) -> JoinHandle<CallOutcome<T>>
where
    T: Clone + Serialize + Send + Sync + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let client = client.clone();
    tokio::spawn(async move { client.execute(&key, |_| call()).await })
}

/// Lets an abandoned stage task run to completion and logs what it produced.
fn abandon<T: Send + 'static>(task: JoinHandle<CallOutcome<T>>, issue_id: String, stage: Stage) {
    tokio::spawn(async move {
        match task.await {
            Ok(outcome) => tracing::warn!(
                issue_id = %issue_id,
                stage = %stage,
                success = outcome.is_success(),
                attempts = outcome.attempts,
                "late completion discarded"
            ),
            Err(e) => tracing::warn!(
                issue_id = %issue_id,
                stage = %stage,
                error = %e,
                "abandoned stage task ended abnormally"
            ),
        }
    });
}

/// Checks for cancellation or an expired deadline between stages.
fn checkpoint(cancel: &watch::Receiver<Option<String>>, deadline: Instant) -> Option<Disposition> {
    if let Some(reason) = cancel.borrow().clone() {
        return Some(Disposition::Cancelled(reason));
    }
    if Instant::now() >= deadline {
        return Some(Disposition::TimedOut);
    }
    None
}

/// Resolves once the run has been cancelled. Pends forever otherwise.
async fn cancelled(cancel: &mut watch::Receiver<Option<String>>) -> String {
    let reason = match cancel.wait_for(Option::is_some).await {
        Ok(reason) => (*reason).clone(),
        Err(_) => None,
    };
    match reason {
        Some(reason) => reason,
        None => std::future::pending().await,
    }
}

fn stage_for(state: WorkflowState) -> Option<Stage> {
    Stage::ALL.into_iter().find(|s| s.state() == state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborator::{
        Analyzer, ChangeSet, Complexity, Publisher, Resolver, ReviewVerdict, Reviewer,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct Fixed {
        confidence: f64,
        delay: Duration,
        calls: AtomicU32,
    }

    impl Fixed {
        fn new(confidence: f64) -> Arc<Self> {
            Arc::new(Self {
                confidence,
                delay: Duration::ZERO,
                calls: AtomicU32::new(0),
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                confidence: 0.9,
                delay,
                calls: AtomicU32::new(0),
            })
        }

        async fn tick(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
        }
    }

    #[async_trait]
    impl Analyzer for Fixed {
        async fn analyze(&self, _issue: &Issue) -> Result<Analysis> {
            self.tick().await;
            Ok(Analysis {
                category: "bug".into(),
                complexity: Complexity::Low,
                feasible: true,
                confidence: self.confidence,
                reasoning: "clear reproduction".into(),
            })
        }
    }

    #[async_trait]
    impl Resolver for Fixed {
        async fn resolve(&self, _issue: &Issue, _analysis: &Analysis) -> Result<Resolution> {
            self.tick().await;
            Ok(Resolution::Resolved {
                change_set: ChangeSet {
                    summary: "fix".into(),
                    files: vec![],
                },
                confidence: self.confidence,
                reasoning: String::new(),
            })
        }
    }

    #[async_trait]
    impl Reviewer for Fixed {
        async fn review(&self, _change_set: &ChangeSet, _issue: &Issue) -> Result<Review> {
            self.tick().await;
            Ok(Review {
                verdict: ReviewVerdict::Approved,
                score: self.confidence,
                issues: vec![],
                recommendations: vec![],
            })
        }
    }

    #[async_trait]
    impl Publisher for Fixed {
        async fn publish(&self, _change_set: &ChangeSet, issue: &Issue) -> Result<Publication> {
            self.tick().await;
            Ok(Publication {
                identifier: format!("PR-{}", issue.id),
                url: format!("https://example.invalid/pulls/{}", issue.id),
            })
        }
    }

    fn collaborators(all: Arc<Fixed>) -> Collaborators {
        Collaborators {
            analyzer: all.clone(),
            resolver: all.clone(),
            reviewer: all.clone(),
            publisher: all,
        }
    }

    fn orchestrator(all: Arc<Fixed>) -> WorkflowOrchestrator {
        WorkflowOrchestrator::new(PipelineConfig::default(), collaborators(all)).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_completes() {
        let all = Fixed::new(0.9);
        let orch = orchestrator(all.clone());

        let result = orch.process_issue("123", "Test Issue", "body").await.unwrap();

        assert!(result.success);
        assert_eq!(result.final_state, WorkflowState::Complete);
        assert_eq!(result.stages.len(), 4);
        assert_eq!(result.publication.unwrap().identifier, "PR-123");
        assert_eq!(all.calls.load(Ordering::SeqCst), 4);
        assert_eq!(orch.get_current_state("123"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_config_is_rejected() {
        let mut config = PipelineConfig::default();
        config.workflow.review_approval_threshold = 2.0;
        let err = WorkflowOrchestrator::new(config, collaborators(Fixed::new(0.9))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_title_is_rejected_before_running() {
        let orch = orchestrator(Fixed::new(0.9));
        let err = orch.process_issue("1", "", "").await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(orch.get_global_metrics().total_workflows, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn low_review_score_escalates() {
        // Analysis passes 0.7 but review needs 0.8.
        let orch = orchestrator(Fixed::new(0.75));
        let result = orch.process_issue("7", "Flaky test", "").await.unwrap();

        assert_eq!(result.final_state, WorkflowState::RequiresHumanReview);
        assert!(result.requires_human_review);
        assert!(result.error.unwrap().contains("review score"));
        assert!(result.publication.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn whole_run_timeout_fails_and_abandons_stage() {
        let mut config = PipelineConfig::default();
        config.workflow.max_execution_secs = 5;
        config.analyzer.retry.attempt_timeout_ms = 0;
        let all = Fixed::slow(Duration::from_secs(60));
        let orch = WorkflowOrchestrator::new(config, collaborators(all.clone())).unwrap();

        let result = orch.process_issue("9", "Slow issue", "").await.unwrap();

        assert_eq!(result.final_state, WorkflowState::Failed);
        assert!(!result.requires_human_review);
        assert_eq!(result.errors.last().unwrap().kind, crate::error::ErrorKind::WorkflowTimeout);
        assert_eq!(result.errors.last().unwrap().stage, Some(Stage::Analysis));
        assert_eq!(all.calls.load(Ordering::SeqCst), 1);
        assert!(orch.get_active_workflows().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_unknown_run_returns_false() {
        let orch = orchestrator(Fixed::new(0.9));
        assert!(!orch.cancel_workflow("nope", "user request"));
    }

    #[tokio::test(start_paused = true)]
    async fn health_reports_every_client() {
        let orch = orchestrator(Fixed::new(0.9));
        orch.process_issue("1", "Test Issue", "").await.unwrap();

        let health = orch.health();
        assert!(health.is_healthy());
        assert_eq!(health.analyzer.name, "analyzer");
        assert!(health.analyzer.cache.is_some());
        assert!(health.publisher.cache.is_none());
        assert_eq!(health.publisher.errors.total_calls, 1);
        assert_eq!(health.active_workflows, 0);
    }

    #[test]
    fn stage_for_maps_running_states() {
        assert_eq!(stage_for(WorkflowState::ReviewingCode), Some(Stage::Review));
        assert_eq!(stage_for(WorkflowState::CheckingFeasibility), None);
    }
}
