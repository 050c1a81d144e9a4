//! Run states and pipeline stages.

use serde::{Deserialize, Serialize};

/// State of a workflow run.
///
/// Runs move forward through the pipeline in order. Any non-terminal state may
/// jump to `RequiresHumanReview`, `Failed` or `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    #[default]
    Initializing,
    AnalyzingIssue,
    CheckingFeasibility,
    GeneratingSolution,
    ReviewingCode,
    CreatingPublication,
    Complete,
    RequiresHumanReview,
    Failed,
    Cancelled,
}

impl WorkflowState {
    /// Returns true for states a run never leaves.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowState::Complete
                | WorkflowState::RequiresHumanReview
                | WorkflowState::Failed
                | WorkflowState::Cancelled
        )
    }

    /// The state that follows this one on the success path.
    pub fn next(self) -> Option<WorkflowState> {
        use WorkflowState::*;
        match self {
            Initializing => Some(AnalyzingIssue),
            AnalyzingIssue => Some(CheckingFeasibility),
            CheckingFeasibility => Some(GeneratingSolution),
            GeneratingSolution => Some(ReviewingCode),
            ReviewingCode => Some(CreatingPublication),
            CreatingPublication => Some(Complete),
            Complete | RequiresHumanReview | Failed | Cancelled => None,
        }
    }

    /// Returns true if a run may move from `self` to `to`.
    pub fn can_transition_to(self, to: WorkflowState) -> bool {
        if self.is_terminal() {
            return false;
        }
        matches!(
            to,
            WorkflowState::RequiresHumanReview | WorkflowState::Failed | WorkflowState::Cancelled
        ) || self.next() == Some(to)
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkflowState::Initializing => "initializing",
            WorkflowState::AnalyzingIssue => "analyzing_issue",
            WorkflowState::CheckingFeasibility => "checking_feasibility",
            WorkflowState::GeneratingSolution => "generating_solution",
            WorkflowState::ReviewingCode => "reviewing_code",
            WorkflowState::CreatingPublication => "creating_publication",
            WorkflowState::Complete => "complete",
            WorkflowState::RequiresHumanReview => "requires_human_review",
            WorkflowState::Failed => "failed",
            WorkflowState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A pipeline step that calls a collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Analysis,
    Resolution,
    Review,
    Publication,
}

impl Stage {
    /// All stages in pipeline order.
    pub const ALL: [Stage; 4] = [
        Stage::Analysis,
        Stage::Resolution,
        Stage::Review,
        Stage::Publication,
    ];

    /// The run state while this stage is in progress.
    pub fn state(self) -> WorkflowState {
        match self {
            Stage::Analysis => WorkflowState::AnalyzingIssue,
            Stage::Resolution => WorkflowState::GeneratingSolution,
            Stage::Review => WorkflowState::ReviewingCode,
            Stage::Publication => WorkflowState::CreatingPublication,
        }
    }

    /// Name of the collaborator serving this stage.
    pub fn collaborator(self) -> &'static str {
        match self {
            Stage::Analysis => "analyzer",
            Stage::Resolution => "resolver",
            Stage::Review => "reviewer",
            Stage::Publication => "publisher",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Analysis => write!(f, "analysis"),
            Stage::Resolution => write!(f, "resolution"),
            Stage::Review => write!(f, "review"),
            Stage::Publication => write!(f, "publication"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(WorkflowState::Complete.is_terminal());
        assert!(WorkflowState::RequiresHumanReview.is_terminal());
        assert!(WorkflowState::Failed.is_terminal());
        assert!(WorkflowState::Cancelled.is_terminal());
        assert!(!WorkflowState::ReviewingCode.is_terminal());
    }

    #[test]
    fn forward_path_reaches_complete() {
        let mut state = WorkflowState::Initializing;
        let mut steps = 0;
        while let Some(next) = state.next() {
            assert!(state.can_transition_to(next));
            state = next;
            steps += 1;
        }
        assert_eq!(state, WorkflowState::Complete);
        assert_eq!(steps, 6);
    }

    #[test]
    fn no_skipping_or_leaving_terminal() {
        assert!(!WorkflowState::AnalyzingIssue.can_transition_to(WorkflowState::ReviewingCode));
        assert!(!WorkflowState::Complete.can_transition_to(WorkflowState::Failed));
        assert!(!WorkflowState::Cancelled.can_transition_to(WorkflowState::Complete));
        assert!(WorkflowState::GeneratingSolution.can_transition_to(WorkflowState::Cancelled));
        assert!(WorkflowState::Initializing.can_transition_to(WorkflowState::Failed));
    }

    #[test]
    fn state_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&WorkflowState::RequiresHumanReview).unwrap(),
            "\"requires_human_review\""
        );
        assert_eq!(WorkflowState::CheckingFeasibility.to_string(), "checking_feasibility");
        let stage: Stage = serde_yaml::from_str("review").unwrap();
        assert_eq!(stage, Stage::Review);
        assert_eq!(stage.state(), WorkflowState::ReviewingCode);
    }
}
