//! End-to-end pipeline behaviour against scripted collaborators.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use autopilot::config::{CircuitBreakerConfig, RetryConfig};
use autopilot::{
    Analysis, ChangeAction, ChangeSet, CircuitState, Complexity, Error, ErrorKind, FileChange,
    Issue, PipelineConfig, Publication, Resolution, Resolver, Review, ReviewVerdict,
    ScriptedCollaborators, ScriptedError, Stage, Step, WorkflowOrchestrator, WorkflowState,
};

fn analysis(confidence: f64, feasible: bool) -> Analysis {
    Analysis {
        category: "bug".into(),
        complexity: Complexity::Low,
        feasible,
        confidence,
        reasoning: "reproducible from the report".into(),
    }
}

fn resolved() -> Resolution {
    Resolution::Resolved {
        change_set: ChangeSet {
            summary: "Guard against empty input".into(),
            files: vec![FileChange {
                path: "src/parse.rs".into(),
                action: ChangeAction::Modify,
                content: Some("fn parse(s: &str) {}".into()),
            }],
        },
        confidence: 0.85,
        reasoning: String::new(),
    }
}

fn review(verdict: ReviewVerdict, score: f64) -> Review {
    Review {
        verdict,
        score,
        issues: vec![],
        recommendations: vec![],
    }
}

fn publication() -> Publication {
    Publication {
        identifier: "PR-42".into(),
        url: "https://example.invalid/pulls/42".into(),
    }
}

fn scripted(analyzer: Vec<Step<Analysis>>, resolver: Vec<Step<Resolution>>) -> ScriptedCollaborators {
    ScriptedCollaborators::new(
        analyzer,
        resolver,
        vec![Step::ok(review(ReviewVerdict::Approved, 0.9))],
        vec![Step::ok(publication())],
    )
}

fn happy() -> ScriptedCollaborators {
    scripted(vec![Step::ok(analysis(0.9, true))], vec![Step::ok(resolved())])
}

fn fast_retries() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    for section in [&mut config.analyzer, &mut config.resolver, &mut config.reviewer, &mut config.publisher] {
        section.retry = RetryConfig {
            base_delay_ms: 10,
            max_delay_ms: 100,
            jitter: false,
            ..Default::default()
        };
    }
    config
}

fn orchestrator(config: PipelineConfig, scripted: &ScriptedCollaborators) -> Arc<WorkflowOrchestrator> {
    Arc::new(WorkflowOrchestrator::new(config, scripted.collaborators()).unwrap())
}

async fn wait_for_state(orch: &WorkflowOrchestrator, id: &str, state: WorkflowState) {
    for _ in 0..100 {
        if orch.get_current_state(id) == Some(state) {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("run {id} never reached {state}");
}

#[tokio::test(start_paused = true)]
async fn happy_path_calls_each_collaborator_once_in_order() {
    let scripted = happy();
    let orch = orchestrator(PipelineConfig::default(), &scripted);

    let result = orch.process_issue("123", "Test Issue", "Crash on empty input").await.unwrap();

    assert!(result.success);
    assert_eq!(result.final_state, WorkflowState::Complete);
    assert!(!result.requires_human_review);
    assert!(result.error.is_none());
    assert_eq!(result.publication.unwrap().identifier, "PR-42");
    assert_eq!(
        scripted.call_order(),
        vec![Stage::Analysis, Stage::Resolution, Stage::Review, Stage::Publication]
    );
    assert!(result.stages.iter().all(|s| s.success && s.attempts == 1));
}

#[tokio::test(start_paused = true)]
async fn finished_run_has_no_current_state() {
    let scripted = happy();
    let orch = orchestrator(PipelineConfig::default(), &scripted);

    orch.process_issue("123", "Test Issue", "").await.unwrap();

    assert_eq!(orch.get_current_state("123"), None);
    assert_eq!(orch.get_current_state("123"), None);
    assert!(orch.get_active_workflows().is_empty());
}

#[tokio::test(start_paused = true)]
async fn low_confidence_escalates_without_resolving() {
    let scripted = scripted(vec![Step::ok(analysis(0.3, true))], vec![Step::ok(resolved())]);
    let orch = orchestrator(PipelineConfig::default(), &scripted);

    let result = orch.process_issue("5", "Vague report", "").await.unwrap();

    assert_eq!(result.final_state, WorkflowState::RequiresHumanReview);
    assert!(result.requires_human_review);
    assert!(!result.success);
    assert!(result.error.unwrap().contains("confidence"));
    assert_eq!(scripted.resolver.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn confidence_at_threshold_proceeds() {
    let scripted = scripted(vec![Step::ok(analysis(0.7, true))], vec![Step::ok(resolved())]);
    let orch = orchestrator(PipelineConfig::default(), &scripted);

    let result = orch.process_issue("6", "Borderline", "").await.unwrap();

    assert_eq!(result.final_state, WorkflowState::Complete);
}

#[tokio::test(start_paused = true)]
async fn infeasible_issue_escalates() {
    let scripted = scripted(vec![Step::ok(analysis(0.95, false))], vec![Step::ok(resolved())]);
    let orch = orchestrator(PipelineConfig::default(), &scripted);

    let result = orch.process_issue("8", "Rewrite everything", "").await.unwrap();

    assert_eq!(result.final_state, WorkflowState::RequiresHumanReview);
    assert!(result.error.unwrap().contains("infeasible"));
    assert_eq!(scripted.call_order(), vec![Stage::Analysis]);
}

#[tokio::test(start_paused = true)]
async fn unresolved_issue_escalates() {
    let unresolved = Resolution::Unresolved {
        confidence: 0.2,
        reasoning: "needs product decision".into(),
    };
    let scripted = scripted(vec![Step::ok(analysis(0.9, true))], vec![Step::ok(unresolved)]);
    let orch = orchestrator(PipelineConfig::default(), &scripted);

    let result = orch.process_issue("9", "Ambiguous", "").await.unwrap();

    assert_eq!(result.final_state, WorkflowState::RequiresHumanReview);
    assert!(result.error.unwrap().contains("needs product decision"));
    assert_eq!(scripted.reviewer.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn rejected_review_escalates_despite_high_score() {
    let scripted = ScriptedCollaborators::new(
        vec![Step::ok(analysis(0.9, true))],
        vec![Step::ok(resolved())],
        vec![Step::ok(review(ReviewVerdict::Rejected, 0.95))],
        vec![Step::ok(publication())],
    );
    let orch = orchestrator(PipelineConfig::default(), &scripted);

    let result = orch.process_issue("10", "Risky change", "").await.unwrap();

    assert_eq!(result.final_state, WorkflowState::RequiresHumanReview);
    assert!(result.publication.is_none());
    assert_eq!(scripted.publisher.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn transient_resolver_failure_is_retried() {
    let scripted = scripted(
        vec![Step::ok(analysis(0.9, true))],
        vec![
            Step::fail(ScriptedError::new(ErrorKind::Network, "connection reset")),
            Step::ok(resolved()),
        ],
    );
    let orch = orchestrator(fast_retries(), &scripted);

    let result = orch.process_issue("11", "Flaky backend", "").await.unwrap();

    assert_eq!(result.final_state, WorkflowState::Complete);
    assert_eq!(result.stage(Stage::Resolution).unwrap().attempts, 2);
    assert_eq!(scripted.resolver.calls(), 2);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].kind, ErrorKind::Network);
    assert_eq!(result.errors[0].stage, Some(Stage::Resolution));
    assert!(result.errors[0].message.contains("connection reset"));
}

#[tokio::test(start_paused = true)]
async fn publication_error_fails_the_run() {
    let scripted = ScriptedCollaborators::new(
        vec![Step::ok(analysis(0.9, true))],
        vec![Step::ok(resolved())],
        vec![Step::ok(review(ReviewVerdict::Approved, 0.9))],
        vec![Step::fail(ScriptedError::new(ErrorKind::Publication, "branch protected"))],
    );
    let orch = orchestrator(fast_retries(), &scripted);

    let result = orch.process_issue("12", "Test Issue", "").await.unwrap();

    assert_eq!(result.final_state, WorkflowState::Failed);
    assert!(!result.requires_human_review);
    assert_eq!(scripted.publisher.calls(), 1);
    let last = result.errors.last().unwrap();
    assert_eq!(last.kind, ErrorKind::Publication);
    assert_eq!(last.stage, Some(Stage::Publication));
    assert!(result.error.unwrap().contains("branch protected"));
}

#[tokio::test(start_paused = true)]
async fn cancelled_run_ends_cancelled_and_leaves_registry() {
    let scripted = scripted(
        vec![Step::ok(analysis(0.9, true)).with_delay(Duration::from_secs(30))],
        vec![Step::ok(resolved())],
    );
    let orch = orchestrator(PipelineConfig::default(), &scripted);

    let run = tokio::spawn({
        let orch = orch.clone();
        async move { orch.process_issue("20", "Slow issue", "").await }
    });
    wait_for_state(&orch, "20", WorkflowState::AnalyzingIssue).await;

    assert!(orch.cancel_workflow("20", "user request"));
    assert_eq!(orch.get_current_state("20"), None);
    assert!(orch.get_active_workflows().is_empty());
    assert!(!orch.cancel_workflow("20", "twice"));

    // The id stays reserved until the cancelled run has wound down.
    let err = orch.process_issue("20", "Slow issue", "").await.unwrap_err();
    assert!(matches!(err, Error::DuplicateRun(ref id) if id == "20"));

    let result = run.await.unwrap().unwrap();
    assert_eq!(result.final_state, WorkflowState::Cancelled);
    assert!(!result.success);
    let last = result.errors.last().unwrap();
    assert_eq!(last.kind, ErrorKind::WorkflowCancelled);
    assert_eq!(last.stage, Some(Stage::Analysis));
    assert_eq!(scripted.resolver.calls(), 0);
    assert!(!orch.cancel_workflow("20", "again"));
}

#[tokio::test(start_paused = true)]
async fn duplicate_active_run_is_rejected() {
    let scripted = scripted(
        vec![Step::ok(analysis(0.9, true)).with_delay(Duration::from_secs(30))],
        vec![Step::ok(resolved())],
    );
    let orch = orchestrator(PipelineConfig::default(), &scripted);

    let run = tokio::spawn({
        let orch = orch.clone();
        async move { orch.process_issue("30", "Slow issue", "").await }
    });
    wait_for_state(&orch, "30", WorkflowState::AnalyzingIssue).await;

    let err = orch.process_issue("30", "Slow issue", "").await.unwrap_err();
    assert!(matches!(err, Error::DuplicateRun(ref id) if id == "30"));

    let result = run.await.unwrap().unwrap();
    assert_eq!(result.final_state, WorkflowState::Complete);
    assert_eq!(scripted.analyzer.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_runs_are_tracked_independently() {
    let scripted = scripted(
        vec![Step::ok(analysis(0.9, true)).with_delay(Duration::from_secs(1))],
        vec![Step::ok(resolved())],
    );
    let orch = orchestrator(PipelineConfig::default(), &scripted);

    let runs: Vec<_> = ["a", "b", "c"]
        .into_iter()
        .map(|id| {
            let orch = orch.clone();
            tokio::spawn(async move { orch.process_issue(id, format!("Issue {id}"), "").await })
        })
        .collect();
    for id in ["a", "b", "c"] {
        wait_for_state(&orch, id, WorkflowState::AnalyzingIssue).await;
    }
    assert_eq!(orch.get_active_workflows().len(), 3);
    assert_eq!(orch.get_global_metrics().concurrent_workflows, 3);

    for run in runs {
        let result = run.await.unwrap().unwrap();
        assert_eq!(result.final_state, WorkflowState::Complete);
    }
    assert!(orch.get_active_workflows().is_empty());
    assert_eq!(scripted.analyzer.calls(), 3);
    assert_eq!(scripted.publisher.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn repeated_server_faults_open_the_resolver_circuit() {
    let mut config = fast_retries();
    config.resolver.retry.max_attempts = 1;
    config.resolver.circuit_breaker = CircuitBreakerConfig {
        failure_threshold: 2,
        success_threshold: 1,
        recovery_timeout_ms: 60_000,
    };
    let scripted = scripted(
        vec![Step::ok(analysis(0.9, true))],
        vec![Step::fail(ScriptedError::new(ErrorKind::Backend, "overloaded").with_status(503))],
    );
    let orch = orchestrator(config, &scripted);

    for id in ["1", "2"] {
        let result = orch.process_issue(id, "Test Issue", "").await.unwrap();
        assert_eq!(result.final_state, WorkflowState::Failed);
        assert_eq!(result.errors.last().unwrap().kind, ErrorKind::Backend);
    }
    assert!(!orch.health().is_healthy());

    let result = orch.process_issue("3", "Test Issue", "").await.unwrap();
    assert_eq!(result.final_state, WorkflowState::Failed);
    assert_eq!(result.errors.last().unwrap().kind, ErrorKind::CircuitOpen);
    assert_eq!(scripted.resolver.calls(), 2);
}

/// Fails with a dropped connection, then panics, then recovers.
struct CrashingResolver {
    calls: AtomicU32,
}

#[async_trait]
impl Resolver for CrashingResolver {
    async fn resolve(&self, _issue: &Issue, _analysis: &Analysis) -> autopilot::Result<Resolution> {
        match self.calls.fetch_add(1, Ordering::SeqCst) {
            0 => Err(Error::Network("connection reset".into())),
            1 => panic!("resolver bug"),
            _ => Ok(resolved()),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn panicking_collaborator_fails_the_run_and_frees_the_circuit() {
    let mut config = fast_retries();
    config.resolver.retry.max_attempts = 1;
    config.resolver.circuit_breaker = CircuitBreakerConfig {
        failure_threshold: 1,
        success_threshold: 1,
        recovery_timeout_ms: 1_000,
    };
    let scripted = happy();
    let mut collaborators = scripted.collaborators();
    collaborators.resolver = Arc::new(CrashingResolver {
        calls: AtomicU32::new(0),
    });
    let orch = WorkflowOrchestrator::new(config, collaborators).unwrap();

    let first = orch.process_issue("1", "Test Issue", "").await.unwrap();
    assert_eq!(first.final_state, WorkflowState::Failed);
    assert_eq!(first.errors.last().unwrap().kind, ErrorKind::Network);
    assert_eq!(orch.health().resolver.circuit.state, CircuitState::Open);

    // The half-open trial call panics.
    tokio::time::advance(Duration::from_secs(1)).await;
    let crashed = orch.process_issue("2", "Test Issue", "").await.unwrap();
    assert_eq!(crashed.final_state, WorkflowState::Failed);
    assert!(!crashed.success);
    assert!(!crashed.requires_human_review);
    let last = crashed.errors.last().unwrap();
    assert_eq!(last.kind, ErrorKind::Internal);
    assert_eq!(last.stage, Some(Stage::Resolution));
    assert_eq!(orch.health().resolver.circuit.state, CircuitState::Open);
    assert_eq!(orch.get_current_state("2"), None);

    tokio::time::advance(Duration::from_secs(1)).await;
    let recovered = orch.process_issue("3", "Test Issue", "").await.unwrap();
    assert_eq!(recovered.final_state, WorkflowState::Complete);
    assert_eq!(orch.health().resolver.circuit.state, CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn metrics_summarize_finished_runs() {
    let scripted = scripted(
        vec![Step::ok(analysis(0.9, true)), Step::ok(analysis(0.2, true))],
        vec![Step::ok(resolved())],
    );
    let orch = orchestrator(PipelineConfig::default(), &scripted);

    orch.process_issue("1", "First", "").await.unwrap();
    orch.process_issue("2", "Second", "").await.unwrap();

    let metrics = orch.get_global_metrics();
    assert_eq!(metrics.total_workflows, 2);
    assert_eq!(metrics.completed, 1);
    assert_eq!(metrics.human_review_count, 1);
    assert_eq!(metrics.success_rate, 0.5);
    assert_eq!(metrics.concurrent_workflows, 0);
    assert_eq!(metrics.component_execution_times[&Stage::Analysis].calls, 2);
    assert_eq!(metrics.component_execution_times[&Stage::Publication].calls, 1);
}
