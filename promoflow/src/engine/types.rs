//! Engine inputs and outputs.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::core::{EnvironmentDescriptor, LocalImage, RunState};
use crate::pipeline::{GateDecision, PipelineRun, RunFailure, StageRecord};

/// A new build to promote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerEvent {
    /// The logical pipeline.
    pub pipeline_id: String,
    /// The locally built image.
    pub image: LocalImage,
}

impl TriggerEvent {
    /// Creates a trigger.
    #[must_use]
    pub fn new(pipeline_id: impl Into<String>, image: LocalImage) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            image,
        }
    }
}

/// An external approval or rejection for one gate of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateSignal {
    /// Target run.
    pub run_id: Uuid,
    /// Target gate.
    pub gate_name: String,
    /// The decision.
    pub decision: GateDecision,
    /// Who decided.
    pub approver: Option<String>,
}

impl GateSignal {
    /// An approval.
    #[must_use]
    pub fn approve(run_id: Uuid, gate_name: impl Into<String>) -> Self {
        Self {
            run_id,
            gate_name: gate_name.into(),
            decision: GateDecision::Approve,
            approver: None,
        }
    }

    /// A rejection.
    #[must_use]
    pub fn reject(run_id: Uuid, gate_name: impl Into<String>) -> Self {
        Self {
            decision: GateDecision::Reject,
            ..Self::approve(run_id, gate_name)
        }
    }

    /// Records who made the decision.
    #[must_use]
    pub fn with_approver(mut self, approver: impl Into<String>) -> Self {
        self.approver = Some(approver.into());
        self
    }
}

/// Why a gate signal had no effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum IgnoreReason {
    /// No run with that id.
    UnknownRun,
    /// The run is not suspended at a gate.
    NotAwaitingGate {
        /// The run's state.
        state: RunState,
    },
    /// The run waits at a different gate.
    GateMismatch {
        /// The gate the run waits at.
        expected: String,
    },
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownRun => write!(f, "unknown run"),
            Self::NotAwaitingGate { state } => write!(f, "run is {state}, not awaiting a gate"),
            Self::GateMismatch { expected } => write!(f, "run is waiting at gate '{expected}'"),
        }
    }
}

/// A signal that was dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IgnoredSignal {
    /// The run named by the signal.
    pub run_id: Uuid,
    /// The gate named by the signal.
    pub gate_name: String,
    /// Why it was dropped.
    pub reason: IgnoreReason,
}

/// Result of [`super::PromotionEngine::signal_gate`].
#[derive(Debug, Clone)]
pub enum SignalOutcome {
    /// The decision was applied; the run has been driven as far as it goes.
    Applied(RunReport),
    /// The signal did not match a waiting gate and changed nothing.
    Ignored(IgnoredSignal),
}

impl SignalOutcome {
    /// Returns the report if the signal was applied.
    #[must_use]
    pub fn applied(&self) -> Option<&RunReport> {
        match self {
            Self::Applied(report) => Some(report),
            Self::Ignored(_) => None,
        }
    }

    /// Returns true if the signal was ignored.
    #[must_use]
    pub fn is_ignored(&self) -> bool {
        matches!(self, Self::Ignored(_))
    }
}

/// Snapshot of a run for callers and dashboards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    /// Run id.
    pub run_id: Uuid,
    /// Pipeline id.
    pub pipeline_id: String,
    /// Current state.
    pub state: RunState,
    /// Furthest deployed stage index.
    pub cursor: Option<usize>,
    /// Environment of the furthest deployed stage.
    pub reached: Option<EnvironmentDescriptor>,
    /// Gate the run waits at, if suspended.
    pub awaiting_gate: Option<String>,
    /// Why the run failed.
    pub failure: Option<RunFailure>,
    /// Per-stage history.
    pub stages: Vec<StageRecord>,
    /// Waiting behind another run.
    pub queued: bool,
    /// Queued run that became active when this one terminated; drive it with
    /// `resume`.
    pub next_run: Option<Uuid>,
}

impl RunReport {
    /// Builds a report from a run record.
    #[must_use]
    pub fn from_run(run: &PipelineRun) -> Self {
        let awaiting_gate = match run.state {
            RunState::AwaitingGate(i) => run.graph.gate_after(i).map(|g| g.name.clone()),
            _ => None,
        };
        Self {
            run_id: run.id,
            pipeline_id: run.pipeline_id.clone(),
            state: run.state,
            cursor: run.cursor,
            reached: run.reached().cloned(),
            awaiting_gate,
            failure: run.failure.clone(),
            stages: run.stages.clone(),
            queued: run.queued,
            next_run: None,
        }
    }

    /// Returns true if the run completed.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.state == RunState::Completed
    }

    /// Returns true if the run failed.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.state == RunState::Failed
    }
}

/// Outcome of [`super::PromotionEngine::recover`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Runs found mid-flight and failed as interrupted.
    pub interrupted: Vec<Uuid>,
    /// Runs suspended at a gate.
    pub suspended: Vec<Uuid>,
    /// Idle runs that hold their pipeline and wait to be driven with `resume`.
    pub ready: Vec<Uuid>,
}
