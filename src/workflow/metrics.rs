//! Aggregate metrics across runs.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::run::WorkflowResult;
use super::state::{Stage, WorkflowState};

/// Window for [`GlobalMetrics::recent_errors`].
pub const RECENT_ERROR_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Latency of one stage across runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StageTiming {
    pub calls: u64,
    pub total_ms: u64,
    pub average_ms: f64,
    pub max_ms: u64,
}

impl StageTiming {
    fn record(&mut self, ms: u64) {
        self.calls += 1;
        self.total_ms += ms;
        self.max_ms = self.max_ms.max(ms);
        self.average_ms = self.total_ms as f64 / self.calls as f64;
    }
}

/// Snapshot of pipeline-wide metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalMetrics {
    /// Finished runs.
    pub total_workflows: u64,
    /// Share of finished runs that completed.
    pub success_rate: f64,
    /// Errors logged across all runs.
    pub error_count: u64,
    pub average_execution_time_ms: f64,
    pub component_execution_times: BTreeMap<Stage, StageTiming>,
    /// Runs in flight when the snapshot was taken.
    pub concurrent_workflows: usize,
    pub completed: u64,
    pub human_review_count: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Errors logged within the last hour.
    pub recent_errors: usize,
}

#[derive(Debug, Default)]
struct Counters {
    total: u64,
    completed: u64,
    human_review: u64,
    failed: u64,
    cancelled: u64,
    error_count: u64,
    total_execution_ms: u64,
    stages: BTreeMap<Stage, StageTiming>,
    recent_errors: VecDeque<Instant>,
}

/// Collects metrics from finished runs.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    counters: Mutex<Counters>,
}

impl MetricsCollector {
    /// Creates an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds a finished run into the totals.
    pub fn record(&self, result: &WorkflowResult) {
        let now = Instant::now();
        let mut c = self.counters.lock();

        c.total += 1;
        match result.final_state {
            WorkflowState::Complete => c.completed += 1,
            WorkflowState::RequiresHumanReview => c.human_review += 1,
            WorkflowState::Cancelled => c.cancelled += 1,
            _ => c.failed += 1,
        }
        c.total_execution_ms += result.execution_time_ms;
        c.error_count += result.errors.len() as u64;

        for stage in &result.stages {
            c.stages.entry(stage.stage).or_default().record(stage.duration_ms);
        }

        for _ in &result.errors {
            c.recent_errors.push_back(now);
        }
        while let Some(&oldest) = c.recent_errors.front() {
            if now.saturating_duration_since(oldest) < RECENT_ERROR_WINDOW {
                break;
            }
            c.recent_errors.pop_front();
        }
    }

    /// Returns current metrics.
    pub fn snapshot(&self, concurrent_workflows: usize) -> GlobalMetrics {
        let now = Instant::now();
        let c = self.counters.lock();
        let ratio = |n: u64| {
            if c.total == 0 {
                0.0
            } else {
                n as f64 / c.total as f64
            }
        };

        GlobalMetrics {
            total_workflows: c.total,
            success_rate: ratio(c.completed),
            error_count: c.error_count,
            average_execution_time_ms: ratio(c.total_execution_ms),
            component_execution_times: c.stages.clone(),
            concurrent_workflows,
            completed: c.completed,
            human_review_count: c.human_review,
            failed: c.failed,
            cancelled: c.cancelled,
            recent_errors: c
                .recent_errors
                .iter()
                .filter(|t| now.saturating_duration_since(**t) < RECENT_ERROR_WINDOW)
                .count(),
        }
    }
}
