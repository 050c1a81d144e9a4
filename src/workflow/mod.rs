//! Issue workflow: state machine, run records, metrics and the orchestrator.

pub mod metrics;
pub mod orchestrator;
pub mod run;
pub mod state;

pub use metrics::{GlobalMetrics, MetricsCollector, StageTiming};
pub use orchestrator::{PipelineHealth, WorkflowOrchestrator};
pub use run::{
    ActiveWorkflow, ErrorRecord, StageOutput, StageResult, Transition, WorkflowResult, WorkflowRun,
};
pub use state::{Stage, WorkflowState};
