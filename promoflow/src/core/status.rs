//! Run states, stage statuses and failure kinds.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The state of a pipeline run's promotion state machine.
///
/// ```text
/// Idle -> Publishing -> Deploying(0) -> [AwaitingGate(0)] -> Deploying(1) -> ... -> Completed
/// ```
///
/// `Failed` is reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", content = "stage", rename_all = "snake_case")]
pub enum RunState {
    /// Created, nothing done yet (also used for queued runs).
    Idle,
    /// Publishing the artifact and its per-target references.
    Publishing,
    /// Deploying the stage at this index.
    Deploying(usize),
    /// Suspended at the gate trailing the stage at this index.
    AwaitingGate(usize),
    /// Every stage deployed and every gate passed.
    Completed,
    /// Stopped by an unrecoverable failure, a rejection or an abort.
    Failed,
}

impl Default for RunState {
    fn default() -> Self {
        Self::Idle
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Publishing => write!(f, "publishing"),
            Self::Deploying(i) => write!(f, "deploying({i})"),
            Self::AwaitingGate(i) => write!(f, "awaiting_gate({i})"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl RunState {
    /// Returns true for `Completed` and `Failed`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns true while the run waits for a gate decision.
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        matches!(self, Self::AwaitingGate(_))
    }

    /// Returns true while a driver is actively working on the run.
    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Publishing | Self::Deploying(_))
    }

    /// Returns the stage index carried by the state, if any.
    #[must_use]
    pub fn stage_index(&self) -> Option<usize> {
        match self {
            Self::Deploying(i) | Self::AwaitingGate(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns whether the machine allows moving from `self` to `next` in a
    /// run with `stage_count` stages.
    ///
    /// `Failed -> Idle` is the only way out of a terminal state and is used
    /// exclusively by an explicit resume.
    #[must_use]
    pub fn can_transition_to(&self, next: Self, stage_count: usize) -> bool {
        let last = stage_count.saturating_sub(1);
        match (*self, next) {
            (Self::Completed, _) => false,
            (Self::Failed, next) => next == Self::Idle,
            (_, Self::Failed) => true,
            (Self::Idle, Self::Publishing) => true,
            (Self::Idle, Self::Deploying(i) | Self::AwaitingGate(i)) => i < stage_count,
            (Self::Publishing, Self::Deploying(0)) => stage_count > 0,
            (Self::Deploying(i), Self::AwaitingGate(j)) => i == j,
            (Self::Deploying(i) | Self::AwaitingGate(i), Self::Deploying(j)) => j == i + 1 && j < stage_count,
            (Self::Deploying(i) | Self::AwaitingGate(i), Self::Completed) => i == last,
            _ => false,
        }
    }
}

/// Deployment status of a single stage within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Not attempted yet.
    Pending,
    /// A deploy call is in flight.
    Deploying,
    /// Deployed successfully.
    Deployed,
    /// Deployment failed.
    Failed,
}

impl Default for StageStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Deploying => write!(f, "deploying"),
            Self::Deployed => write!(f, "deployed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Why a run ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Publishing or promoting the artifact failed.
    Publish,
    /// The adapter reported a non-retryable deployment failure.
    DeploymentFatal,
    /// Transient deployment failures exhausted the retry budget.
    RetryExhausted,
    /// A gate was rejected.
    GateRejected,
    /// An explicit abort signal was received.
    Aborted,
    /// The process stopped while the run was in flight.
    Interrupted,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Publish => write!(f, "publish"),
            Self::DeploymentFatal => write!(f, "deployment_fatal"),
            Self::RetryExhausted => write!(f, "retry_exhausted"),
            Self::GateRejected => write!(f, "gate_rejected"),
            Self::Aborted => write!(f, "aborted"),
            Self::Interrupted => write!(f, "interrupted"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_state_display() {
        assert_eq!(RunState::Idle.to_string(), "idle");
        assert_eq!(RunState::Deploying(2).to_string(), "deploying(2)");
        assert_eq!(RunState::AwaitingGate(1).to_string(), "awaiting_gate(1)");
        assert_eq!(RunState::Completed.to_string(), "completed");
    }

    #[test]
    fn test_run_state_predicates() {
        assert!(RunState::Completed.is_terminal());
        assert!(RunState::Failed.is_terminal());
        assert!(!RunState::AwaitingGate(0).is_terminal());
        assert!(RunState::AwaitingGate(0).is_suspended());
        assert!(RunState::Deploying(1).is_in_flight());
        assert_eq!(RunState::Deploying(1).stage_index(), Some(1));
        assert_eq!(RunState::Publishing.stage_index(), None);
    }

    #[test]
    fn test_forward_transitions() {
        let n = 3;
        assert!(RunState::Idle.can_transition_to(RunState::Publishing, n));
        assert!(RunState::Publishing.can_transition_to(RunState::Deploying(0), n));
        assert!(RunState::Deploying(0).can_transition_to(RunState::Deploying(1), n));
        assert!(RunState::Deploying(1).can_transition_to(RunState::AwaitingGate(1), n));
        assert!(RunState::AwaitingGate(1).can_transition_to(RunState::Deploying(2), n));
        assert!(RunState::Deploying(2).can_transition_to(RunState::Completed, n));
    }

    #[test]
    fn test_no_skipping_or_reordering() {
        let n = 3;
        assert!(!RunState::Deploying(0).can_transition_to(RunState::Deploying(2), n));
        assert!(!RunState::Deploying(1).can_transition_to(RunState::Deploying(0), n));
        assert!(!RunState::Deploying(0).can_transition_to(RunState::AwaitingGate(1), n));
        assert!(!RunState::Deploying(1).can_transition_to(RunState::Completed, n));
        assert!(!RunState::Publishing.can_transition_to(RunState::Deploying(1), n));
        assert!(!RunState::Deploying(2).can_transition_to(RunState::Deploying(3), n));
    }

    #[test]
    fn test_failed_reachable_and_terminal() {
        let n = 2;
        for state in [
            RunState::Idle,
            RunState::Publishing,
            RunState::Deploying(1),
            RunState::AwaitingGate(0),
        ] {
            assert!(state.can_transition_to(RunState::Failed, n), "{state}");
        }
        assert!(!RunState::Completed.can_transition_to(RunState::Failed, n));
        assert!(!RunState::Failed.can_transition_to(RunState::Deploying(0), n));
        assert!(RunState::Failed.can_transition_to(RunState::Idle, n));
    }

    #[test]
    fn test_run_state_serialize() {
        let json = serde_json::to_value(RunState::AwaitingGate(1)).unwrap();
        assert_eq!(json, serde_json::json!({"state": "awaiting_gate", "stage": 1}));

        let idle: RunState = serde_json::from_value(serde_json::json!({"state": "idle"})).unwrap();
        assert_eq!(idle, RunState::Idle);
    }
}
