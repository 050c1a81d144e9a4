//! Replays the YAML scenarios under tests/fixtures.

use std::path::PathBuf;

use autopilot::{ErrorKind, Scenario, Stage, WorkflowState};

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

async fn replay(name: &str) -> autopilot::ScenarioReport {
    let scenario = Scenario::load(fixture(name)).unwrap();
    let expect = scenario.expect.clone().expect("fixture must declare expectations");
    let report = scenario.run().await.unwrap();
    let mismatches = report.mismatches(&expect);
    assert!(mismatches.is_empty(), "{name}: {mismatches:?}");
    report
}

#[tokio::test(start_paused = true)]
async fn happy_path_fixture() {
    let report = replay("happy_path.yaml").await;
    assert_eq!(report.result.publication.unwrap().identifier, "PR-42");
}

#[tokio::test(start_paused = true)]
async fn low_confidence_fixture() {
    let report = replay("low_confidence.yaml").await;
    assert!(report.result.error.unwrap().contains("0.30"));
}

#[tokio::test(start_paused = true)]
async fn resolver_retry_fixture() {
    let report = replay("resolver_retry.yaml").await;
    assert_eq!(report.result.final_state, WorkflowState::Complete);
    let kinds: Vec<_> = report.result.errors.iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![ErrorKind::Network, ErrorKind::Backend]);
    assert!(report
        .result
        .errors
        .iter()
        .all(|e| e.stage == Some(Stage::Resolution)));
}

#[tokio::test(start_paused = true)]
async fn review_rejected_fixture() {
    let report = replay("review_rejected.yaml").await;
    assert!(report.result.error.unwrap().contains("clients still call /v1/items"));
}

#[tokio::test(start_paused = true)]
async fn publish_failure_fixture() {
    let report = replay("publish_failure.yaml").await;
    assert_eq!(report.result.final_state, WorkflowState::Failed);
}

#[test]
fn every_fixture_parses() {
    let dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests").join("fixtures");
    let mut count = 0;
    for entry in std::fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.extension().and_then(|e| e.to_str()) == Some("yaml") {
            let scenario = Scenario::load(&path).unwrap();
            assert!(scenario.expect.is_some(), "{} has no expectations", path.display());
            count += 1;
        }
    }
    assert!(count >= 5);
}

#[test]
fn missing_fixture_is_an_io_error() {
    let err = Scenario::load(fixture("does_not_exist.yaml")).unwrap_err();
    assert!(matches!(err, autopilot::Error::Io(_)));
}
