//! The pipeline run record: graph, state, cursor and history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use super::graph::{GateDecision, PipelineGraph};
use crate::core::{ArtifactReference, EnvironmentDescriptor, FailureKind, LocalImage, RunState, StageStatus};
use crate::errors::EngineError;

/// Per-stage deployment history within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    /// Stage index.
    pub index: usize,
    /// Stage (environment) name.
    pub name: String,
    /// Current status.
    pub status: StageStatus,
    /// Deploy calls made for this stage, across resumes.
    pub attempts: usize,
    /// When the last deployment started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the last deployment finished.
    pub finished_at: Option<DateTime<Utc>>,
    /// Outputs reported by a successful deployment.
    #[serde(default)]
    pub outputs: HashMap<String, String>,
    /// Last failure detail.
    pub last_error: Option<String>,
}

impl StageRecord {
    fn new(index: usize, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
            status: StageStatus::Pending,
            attempts: 0,
            started_at: None,
            finished_at: None,
            outputs: HashMap::new(),
            last_error: None,
        }
    }
}

/// A recorded gate decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateDecisionRecord {
    /// The gate.
    pub gate: String,
    /// Its predecessor stage index.
    pub after_stage: usize,
    /// The decision.
    pub decision: GateDecision,
    /// Who decided, if known.
    pub approver: Option<String>,
    /// When.
    pub decided_at: DateTime<Utc>,
}

/// Why and where a run stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    /// Failure kind.
    pub kind: FailureKind,
    /// Name of the stage being worked on, if any.
    pub stage: Option<String>,
    /// Index of that stage.
    pub stage_index: Option<usize>,
    /// Human-readable detail.
    pub message: String,
    /// Error code (e.g. "DEPLOY-002-FATAL").
    pub code: Option<String>,
}

/// One end-to-end execution promoting a single artifact through all stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Run id.
    pub id: Uuid,
    /// Logical pipeline this run belongs to.
    pub pipeline_id: String,
    /// The build being promoted.
    pub image: LocalImage,
    /// The planned canonical reference.
    pub source: ArtifactReference,
    /// Stages and gates.
    pub graph: PipelineGraph,
    /// State machine position.
    pub state: RunState,
    /// Index of the furthest stage successfully deployed; `None` before the
    /// first success.
    pub cursor: Option<usize>,
    /// Per-stage history, indexed like the graph's stages.
    pub stages: Vec<StageRecord>,
    /// Gate decisions in arrival order.
    #[serde(default)]
    pub gate_decisions: Vec<GateDecisionRecord>,
    /// Set once the run is `Failed`.
    pub failure: Option<RunFailure>,
    /// Waiting behind another run of the same pipeline.
    #[serde(default)]
    pub queued: bool,
    /// Whether the artifact and its target references exist.
    #[serde(default)]
    pub published: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
    /// Time the run reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    /// Creates an `Idle` run over `graph` with nothing deployed.
    #[must_use]
    pub fn new(
        pipeline_id: impl Into<String>,
        image: LocalImage,
        source: ArtifactReference,
        graph: PipelineGraph,
    ) -> Self {
        let stages = graph
            .stages()
            .map(|s| StageRecord::new(s.index, s.name()))
            .collect();
        let now = Utc::now();

        Self {
            id: Uuid::new_v4(),
            pipeline_id: pipeline_id.into(),
            image,
            source,
            graph,
            state: RunState::Idle,
            cursor: None,
            stages,
            gate_decisions: Vec::new(),
            failure: None,
            queued: false,
            published: false,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Returns the index of the first stage not yet deployed.
    #[must_use]
    pub fn next_stage(&self) -> usize {
        self.cursor.map_or(0, |c| c + 1)
    }

    /// Returns true until the run completes or fails.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Returns the environment of the furthest deployed stage.
    #[must_use]
    pub fn reached(&self) -> Option<&EnvironmentDescriptor> {
        self.cursor
            .and_then(|c| self.graph.stage(c))
            .map(|s| &s.environment)
    }

    /// Moves the state machine, returning the previous state.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidTransition`] if the machine forbids the
    /// move.
    pub fn transition(&mut self, next: RunState) -> Result<RunState, EngineError> {
        let from = self.state;
        if !from.can_transition_to(next, self.stage_count()) {
            return Err(EngineError::InvalidTransition {
                run_id: self.id,
                from: from.to_string(),
                to: next.to_string(),
            });
        }

        self.state = next;
        self.touch();
        if next.is_terminal() {
            self.finished_at = Some(self.updated_at);
        } else {
            self.finished_at = None;
        }
        Ok(from)
    }

    /// Marks a deploy attempt for the stage at `index` as started.
    pub fn record_attempt(&mut self, index: usize) {
        if let Some(record) = self.stages.get_mut(index) {
            record.status = StageStatus::Deploying;
            record.attempts += 1;
            record.started_at = Some(Utc::now());
            record.finished_at = None;
        }
        self.touch();
    }

    /// Records a successful deployment and advances the cursor.
    ///
    /// The cursor only moves forward, one stage at a time.
    pub fn record_deployed(&mut self, index: usize, outputs: HashMap<String, String>) {
        if let Some(record) = self.stages.get_mut(index) {
            record.status = StageStatus::Deployed;
            record.finished_at = Some(Utc::now());
            record.outputs = outputs;
            record.last_error = None;
        }
        if index == self.next_stage() {
            self.cursor = Some(index);
        }
        self.touch();
    }

    /// Records a failed deployment; the cursor is left untouched.
    pub fn record_stage_failed(&mut self, index: usize, message: impl Into<String>) {
        if let Some(record) = self.stages.get_mut(index) {
            record.status = StageStatus::Failed;
            record.finished_at = Some(Utc::now());
            record.last_error = Some(message.into());
        }
        self.touch();
    }

    /// Records a gate decision.
    pub fn record_gate_decision(
        &mut self,
        gate: &str,
        after_stage: usize,
        decision: GateDecision,
        approver: Option<String>,
    ) {
        self.gate_decisions.push(GateDecisionRecord {
            gate: gate.to_string(),
            after_stage,
            decision,
            approver,
            decided_at: Utc::now(),
        });
        self.touch();
    }

    /// Returns true if the latest decision for `gate` is an approval.
    #[must_use]
    pub fn is_gate_approved(&self, gate: &str) -> bool {
        self.gate_decisions
            .iter()
            .rev()
            .find(|d| d.gate == gate)
            .is_some_and(|d| d.decision == GateDecision::Approve)
    }

    /// Fails the run, recording why and where.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidTransition`] if the run is already
    /// terminal.
    pub fn fail(
        &mut self,
        kind: FailureKind,
        stage_index: Option<usize>,
        message: impl Into<String>,
        code: Option<String>,
    ) -> Result<RunState, EngineError> {
        let from = self.transition(RunState::Failed)?;
        self.failure = Some(RunFailure {
            kind,
            stage: stage_index
                .and_then(|i| self.graph.stage(i))
                .map(|s| s.name().to_string()),
            stage_index,
            message: message.into(),
            code,
        });
        Ok(from)
    }

    /// Clears per-attempt history so the run starts over from stage 0.
    pub fn reset_progress(&mut self) {
        self.cursor = None;
        self.published = false;
        self.gate_decisions.clear();
        for record in &mut self.stages {
            *record = StageRecord::new(record.index, record.name.clone());
        }
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
