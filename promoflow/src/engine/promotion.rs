//! The Promotion Engine: walks a run's graph through the state machine.

use futures::future::try_join_all;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use super::admission::{Admission, DriverGuard};
use super::types::{
    GateSignal, IgnoreReason, IgnoredSignal, RecoveryReport, RunReport, SignalOutcome, TriggerEvent,
};
use crate::cancellation::CancellationToken;
use crate::config::{ConcurrencyPolicy, EngineConfig, ResolvedConfig, ResumePolicy};
use crate::core::{FailureKind, RunEvent, RunState};
use crate::deploy::{DeploymentResult, DeploymentTarget};
use crate::errors::{DeploymentError, DeploymentFailureKind, EngineError, PublishError};
use crate::events::{EventSink, NoOpEventSink};
use crate::observability::{run_span, SpanTimer};
use crate::pipeline::{
    should_retry, GateDecision, PipelineRun, RetryDecision, RetryState, Stage, StageGraphBuilder,
};
use crate::publish::{ArtifactPublisher, Registry};
use crate::store::RunStore;

/// A pipeline the engine can run: resolved configuration plus its publisher.
#[derive(Debug, Clone)]
pub struct PipelineDefinition {
    /// Pipeline id.
    pub id: String,
    /// Resolved configuration.
    pub config: ResolvedConfig,
    publisher: ArtifactPublisher,
}

impl PipelineDefinition {
    /// Returns the publisher for this pipeline's application.
    #[must_use]
    pub fn publisher(&self) -> &ArtifactPublisher {
        &self.publisher
    }
}

/// How a deploy step ended.
enum StageOutcome {
    Deployed {
        outputs: HashMap<String, String>,
        duration_ms: f64,
    },
    Failed(DeploymentError),
    Aborted,
}

/// Builder for [`PromotionEngine`].
pub struct EngineBuilder {
    registry: Arc<dyn Registry>,
    target: Arc<dyn DeploymentTarget>,
    store: Arc<dyn RunStore>,
    sink: Arc<dyn EventSink>,
    config: EngineConfig,
    pipelines: Vec<(String, ResolvedConfig)>,
}

impl EngineBuilder {
    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Sets the engine settings.
    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Registers a pipeline.
    #[must_use]
    pub fn with_pipeline(mut self, id: impl Into<String>, config: ResolvedConfig) -> Self {
        self.pipelines.push((id.into(), config));
        self
    }

    /// Builds the engine.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Settings`] if the settings are inconsistent.
    pub fn build(self) -> Result<PromotionEngine, EngineError> {
        self.config.validate()?;
        let engine = PromotionEngine {
            inner: Arc::new(EngineInner {
                pipelines: RwLock::new(HashMap::new()),
                registry: self.registry,
                target: self.target,
                store: self.store,
                sink: self.sink,
                config: self.config,
                admission: Admission::default(),
            }),
        };
        for (id, config) in self.pipelines {
            engine.register_pipeline(id, config);
        }
        Ok(engine)
    }
}

struct EngineInner {
    pipelines: RwLock<HashMap<String, PipelineDefinition>>,
    registry: Arc<dyn Registry>,
    target: Arc<dyn DeploymentTarget>,
    store: Arc<dyn RunStore>,
    sink: Arc<dyn EventSink>,
    config: EngineConfig,
    admission: Admission,
}

/// Drives pipeline runs through publishing, serial deployment and gates.
///
/// Cloning is cheap; clones share state. Every run is saved after each
/// transition, so a run suspended at a gate holds no task or memory and
/// survives restarts (see [`Self::recover`]).
#[derive(Clone)]
pub struct PromotionEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for PromotionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromotionEngine")
            .field("pipelines", &self.inner.pipelines.read().len())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl PromotionEngine {
    /// Starts building an engine over its three collaborators.
    #[must_use]
    pub fn builder(
        registry: Arc<dyn Registry>,
        target: Arc<dyn DeploymentTarget>,
        store: Arc<dyn RunStore>,
    ) -> EngineBuilder {
        EngineBuilder {
            registry,
            target,
            store,
            sink: Arc::new(NoOpEventSink),
            config: EngineConfig::default(),
            pipelines: Vec::new(),
        }
    }

    /// Registers (or replaces) a pipeline.
    pub fn register_pipeline(&self, id: impl Into<String>, config: ResolvedConfig) {
        let id = id.into();
        let publisher = ArtifactPublisher::new(Arc::clone(&self.inner.registry), &config)
            .with_retry(self.inner.config.publish_retry.clone());
        info!(pipeline_id = %id, app = %config.app_name, stages = config.environments.len(), "Pipeline registered");
        self.inner.pipelines.write().insert(
            id.clone(),
            PipelineDefinition {
                id,
                config,
                publisher,
            },
        );
    }

    /// Returns a registered pipeline.
    #[must_use]
    pub fn pipeline(&self, id: &str) -> Option<PipelineDefinition> {
        self.inner.pipelines.read().get(id).cloned()
    }

    /// Returns the engine settings.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Returns the run currently holding `pipeline_id`.
    #[must_use]
    pub fn active_run(&self, pipeline_id: &str) -> Option<Uuid> {
        self.inner.admission.holder(pipeline_id)
    }

    /// Starts a run for a new build and drives it until it suspends at a
    /// gate or terminates.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownPipeline`], a graph error, a store error,
    /// or [`EngineError::RunInProgress`] under [`ConcurrencyPolicy::Reject`].
    /// Failures inside the run are reported, not returned.
    pub async fn trigger(&self, event: TriggerEvent) -> Result<RunReport, EngineError> {
        let definition = self.definition(&event.pipeline_id)?;
        let plan = definition
            .publisher
            .plan(&event.image, definition.config.environments());
        let mut run = StageGraphBuilder::new(definition.config.environments().to_vec())
            .with_artifacts(plan.targets)
            .with_gate_policy(definition.config.gate_policy.clone())
            .build(&definition.id, event.image, plan.source)?;

        if let Err(holder) = self.inner.admission.try_acquire(&run.pipeline_id, run.id) {
            match self.inner.config.concurrency {
                ConcurrencyPolicy::Reject => {
                    warn!(pipeline_id = %run.pipeline_id, active_run = %holder, "Trigger rejected");
                    return Err(EngineError::RunInProgress {
                        pipeline_id: run.pipeline_id,
                        active_run: holder,
                    });
                }
                ConcurrencyPolicy::Queue => {
                    run.queued = true;
                    self.inner.store.insert(&run).await?;
                    self.emit(created_event(&run)).await;
                    self.emit(
                        RunEvent::new("run.queued", run.id, &run.pipeline_id)
                            .add_data("behind", serde_json::json!(holder.to_string())),
                    )
                    .await;
                    info!(run_id = %run.id, pipeline_id = %run.pipeline_id, behind = %holder, "Run queued");
                    return Ok(RunReport::from_run(&run));
                }
            }
        }

        let guard = self.inner.admission.begin_drive(run.id)?;
        if let Err(e) = self.inner.store.insert(&run).await {
            self.inner.admission.release(&run.pipeline_id, run.id);
            return Err(e.into());
        }
        self.emit(created_event(&run)).await;
        info!(run_id = %run.id, pipeline_id = %run.pipeline_id, stages = run.stage_count(), "Run created");

        self.drive(&definition, run, guard).await
    }

    /// Applies a gate decision.
    ///
    /// Only a signal naming a run that waits at exactly that gate has any
    /// effect. An approval continues the run; a rejection fails it.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::RunBusy`] if the run is being driven, or a
    /// store error.
    pub async fn signal_gate(&self, signal: GateSignal) -> Result<SignalOutcome, EngineError> {
        if self.inner.store.load(signal.run_id).await?.is_none() {
            return Ok(self.ignore(signal, IgnoreReason::UnknownRun, None).await);
        }

        let guard = self.inner.admission.begin_drive(signal.run_id)?;
        let mut run = self.load(signal.run_id).await?;

        let RunState::AwaitingGate(index) = run.state else {
            let reason = IgnoreReason::NotAwaitingGate { state: run.state };
            return Ok(self.ignore(signal, reason, Some(run.pipeline_id.as_str())).await);
        };
        let Some(gate) = run.graph.gate_after(index).cloned() else {
            let reason = IgnoreReason::NotAwaitingGate { state: run.state };
            return Ok(self.ignore(signal, reason, Some(run.pipeline_id.as_str())).await);
        };
        if gate.name != signal.gate_name {
            let reason = IgnoreReason::GateMismatch {
                expected: gate.name.clone(),
            };
            return Ok(self.ignore(signal, reason, Some(run.pipeline_id.as_str())).await);
        }

        let definition = self.definition(&run.pipeline_id)?;
        run.record_gate_decision(&gate.name, index, signal.decision, signal.approver.clone());
        let approver = signal.approver.clone().unwrap_or_else(|| "unknown".to_string());

        match signal.decision {
            GateDecision::Approve => {
                info!(run_id = %run.id, gate = %gate.name, approver = %approver, "Gate approved");
                self.emit(
                    RunEvent::new("gate.approved", run.id, &run.pipeline_id)
                        .add_data("gate", serde_json::json!(gate.name))
                        .add_data("approver", serde_json::json!(approver)),
                )
                .await;
                let next = if index + 1 < run.stage_count() {
                    RunState::Deploying(index + 1)
                } else {
                    RunState::Completed
                };
                self.advance(&mut run, next).await?;
            }
            GateDecision::Reject => {
                info!(run_id = %run.id, gate = %gate.name, approver = %approver, "Gate rejected");
                self.emit(
                    RunEvent::new("gate.rejected", run.id, &run.pipeline_id)
                        .add_data("gate", serde_json::json!(gate.name))
                        .add_data("approver", serde_json::json!(approver)),
                )
                .await;
                self.fail(
                    &mut run,
                    FailureKind::GateRejected,
                    Some(index),
                    format!("Gate '{}' rejected by {}", gate.name, approver),
                    None,
                )
                .await?;
            }
        }

        self.drive(&definition, run, guard).await.map(SignalOutcome::Applied)
    }

    /// Aborts a run in any non-terminal state.
    ///
    /// A run being driven is cancelled through its token: the in-flight
    /// deploy call is dropped without rollback. Suspended, idle and queued
    /// runs are failed directly.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::RunNotFound`], [`EngineError::InvalidState`]
    /// for a terminal run, or a store error.
    pub async fn abort(&self, run_id: Uuid, reason: impl Into<String>) -> Result<RunReport, EngineError> {
        let reason = reason.into();
        loop {
            if let Some(slot) = self.inner.admission.driver(run_id) {
                let finished = slot.finished.notified();
                tokio::pin!(finished);
                finished.as_mut().enable();
                if slot.token.cancel(reason.clone()) {
                    info!(run_id = %run_id, reason = %reason, "Abort requested for in-flight run");
                }
                if self.inner.admission.is_driving(run_id) {
                    finished.await;
                }
                let run = self.load(run_id).await?;
                if run.state.is_terminal() {
                    if run.failure.as_ref().is_some_and(|f| f.kind == FailureKind::Aborted) {
                        return Ok(RunReport::from_run(&run));
                    }
                    return Err(EngineError::InvalidState {
                        run_id,
                        operation: "abort",
                        state: run.state.to_string(),
                    });
                }
                // The driver left without failing the run, e.g. a signal that
                // was ignored. Fail it directly on the next pass.
                continue;
            }

            let guard = match self.inner.admission.begin_drive(run_id) {
                Ok(guard) => guard,
                // A driver started in between; cancel it on the next pass.
                Err(EngineError::RunBusy(_)) => continue,
                Err(e) => return Err(e),
            };

            let mut run = self.load(run_id).await?;
            if run.state.is_terminal() {
                return Err(EngineError::InvalidState {
                    run_id,
                    operation: "abort",
                    state: run.state.to_string(),
                });
            }

            let stage = run.state.stage_index();
            self.fail(&mut run, FailureKind::Aborted, stage, reason.clone(), None)
                .await?;
            let next_run = self.finish(&run).await?;
            drop(guard);

            let mut report = RunReport::from_run(&run);
            report.next_run = next_run;
            return Ok(report);
        }
    }

    /// Drives a queued run, or re-opens a failed one.
    ///
    /// Failed runs restart per [`ResumePolicy`]: from the first undeployed
    /// stage (re-awaiting an unapproved gate after the cursor stage), or
    /// from publishing.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::RunNotFound`], [`EngineError::RunBusy`],
    /// [`EngineError::RunInProgress`] if another run holds the pipeline,
    /// [`EngineError::InvalidState`] for completed, suspended or in-flight
    /// runs, or a store error.
    pub async fn resume(&self, run_id: Uuid) -> Result<RunReport, EngineError> {
        let guard = self.inner.admission.begin_drive(run_id)?;
        let run = self.load(run_id).await?;
        let definition = self.definition(&run.pipeline_id)?;

        if !matches!(run.state, RunState::Idle | RunState::Failed) {
            return Err(EngineError::InvalidState {
                run_id,
                operation: "resume",
                state: run.state.to_string(),
            });
        }
        // A run handed the pipeline by `finish` already holds it.
        let held = self.inner.admission.holder(&run.pipeline_id) == Some(run.id);
        if let Err(holder) = self.inner.admission.try_acquire(&run.pipeline_id, run.id) {
            return Err(EngineError::RunInProgress {
                pipeline_id: run.pipeline_id,
                active_run: holder,
            });
        }

        let pipeline_id = run.pipeline_id.clone();
        let result = self.resume_held(&definition, run, guard).await;
        if result.is_err() && !held {
            self.inner.admission.release(&pipeline_id, run_id);
        }
        result
    }

    async fn resume_held(
        &self,
        definition: &PipelineDefinition,
        mut run: PipelineRun,
        guard: DriverGuard,
    ) -> Result<RunReport, EngineError> {
        if run.state == RunState::Idle {
            run.queued = false;
            self.inner.store.save(&run).await?;
            self.emit(RunEvent::new("run.resumed", run.id, &run.pipeline_id).add_data("from", serde_json::json!("idle")))
                .await;
            info!(run_id = %run.id, "Driving idle run");
            return self.drive(definition, run, guard).await;
        }

        let start = self.resume_point(&mut run)?;
        let previous = run.failure.take();
        self.advance(&mut run, RunState::Idle).await?;
        self.emit(
            RunEvent::new("run.resumed", run.id, &run.pipeline_id)
                .add_data("policy", serde_json::to_value(self.inner.config.resume).unwrap_or_default())
                .add_data("start", serde_json::json!(start.to_string()))
                .add_data(
                    "previous_failure",
                    serde_json::json!(previous.map(|f| f.kind.to_string())),
                ),
        )
        .await;
        info!(run_id = %run.id, start = %start, cursor = ?run.cursor, "Resuming failed run");

        self.advance(&mut run, start).await?;
        if let RunState::AwaitingGate(index) = start {
            self.announce_gate(&run, index).await;
        }
        self.drive(definition, run, guard).await
    }

    /// Returns the current report of a run.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::RunNotFound`] or a store error.
    pub async fn report(&self, run_id: Uuid) -> Result<RunReport, EngineError> {
        Ok(RunReport::from_run(&self.load(run_id).await?))
    }

    /// Rebuilds in-memory state from the store after a restart.
    ///
    /// Runs found in `Publishing` or `Deploying` were interrupted and are
    /// failed with [`FailureKind::Interrupted`]. Suspended and idle runs get
    /// their pipeline back; a pipeline left with only queued runs hands
    /// itself to the oldest one.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn recover(&self) -> Result<RecoveryReport, EngineError> {
        let runs = self.inner.store.list().await?;
        let mut report = RecoveryReport::default();
        let mut interrupted = Vec::new();

        for run in runs {
            if run.state.is_terminal() || self.inner.admission.is_driving(run.id) {
                continue;
            }
            if run.state.is_in_flight() {
                interrupted.push(run);
                continue;
            }
            if run.queued {
                continue;
            }
            if self.inner.admission.try_acquire(&run.pipeline_id, run.id).is_err() {
                warn!(run_id = %run.id, pipeline_id = %run.pipeline_id, "Second active run found during recovery");
                continue;
            }
            if run.state.is_suspended() {
                report.suspended.push(run.id);
            } else {
                report.ready.push(run.id);
            }
        }

        let failed = try_join_all(interrupted.into_iter().map(|run| self.interrupt(run))).await?;
        report.interrupted = failed.iter().map(|r| r.id).collect();

        let mut pipelines: Vec<String> = self.inner.pipelines.read().keys().cloned().collect();
        pipelines.sort();
        for pipeline_id in pipelines {
            if self.inner.admission.holder(&pipeline_id).is_none() {
                if let Some(next) = self.promote_queued(&pipeline_id).await? {
                    report.ready.push(next);
                }
            }
        }

        info!(
            interrupted = report.interrupted.len(),
            suspended = report.suspended.len(),
            ready = report.ready.len(),
            "Recovery complete"
        );
        Ok(report)
    }

    async fn interrupt(&self, mut run: PipelineRun) -> Result<PipelineRun, EngineError> {
        let _guard = self.inner.admission.begin_drive(run.id)?;
        let stage = run.state.stage_index();
        let message = format!("Process stopped while run was {}", run.state);
        self.fail(&mut run, FailureKind::Interrupted, stage, message, None)
            .await?;
        Ok(run)
    }

    fn resume_point(&self, run: &mut PipelineRun) -> Result<RunState, EngineError> {
        if self.inner.config.resume == ResumePolicy::Restart {
            run.reset_progress();
            return Ok(RunState::Publishing);
        }
        if !run.published {
            return Ok(RunState::Publishing);
        }

        let stage_count = run.stage_count();
        match run.cursor {
            None => Ok(RunState::Deploying(0)),
            Some(cursor) => match run.graph.gate_after(cursor) {
                Some(gate) if !run.is_gate_approved(&gate.name) => Ok(RunState::AwaitingGate(cursor)),
                _ if cursor + 1 < stage_count => Ok(RunState::Deploying(cursor + 1)),
                _ => Err(EngineError::InvalidState {
                    run_id: run.id,
                    operation: "resume",
                    state: format!("{} with every stage deployed", run.state),
                }),
            },
        }
    }

    async fn drive(
        &self,
        definition: &PipelineDefinition,
        mut run: PipelineRun,
        guard: DriverGuard,
    ) -> Result<RunReport, EngineError> {
        let span = run_span(run.id, &run.pipeline_id);
        if let Err(e) = self
            .drive_loop(definition, &mut run, guard.token())
            .instrument(span)
            .await
        {
            self.abandon(&mut run, &e).await;
            return Err(e);
        }

        let next_run = if run.state.is_terminal() {
            self.finish(&run).await?
        } else {
            None
        };
        drop(guard);

        let mut report = RunReport::from_run(&run);
        report.next_run = next_run;
        Ok(report)
    }

    /// Gives up on a run after an engine error, recording the failure if the
    /// store still accepts it. The pipeline is released either way.
    async fn abandon(&self, run: &mut PipelineRun, cause: &EngineError) {
        error!(run_id = %run.id, error = %cause, "Driver stopped on engine error");
        if !run.state.is_terminal() {
            let stage = run.state.stage_index();
            let message = format!("Driver stopped on engine error: {cause}");
            if let Err(e) = self.fail(run, FailureKind::Interrupted, stage, message, None).await {
                warn!(run_id = %run.id, error = %e, "Could not record failure");
            }
        }
        if let Err(e) = self.finish(run).await {
            warn!(run_id = %run.id, error = %e, "Could not hand over pipeline");
        }
    }

    async fn drive_loop(
        &self,
        definition: &PipelineDefinition,
        run: &mut PipelineRun,
        token: &CancellationToken,
    ) -> Result<(), EngineError> {
        loop {
            // Checked before suspension so an abort that lands while a gate
            // is being announced still fails the run.
            if token.is_cancelled() && !run.state.is_terminal() {
                let reason = token.reason().unwrap_or_default();
                let stage = run.state.stage_index();
                self.fail(run, FailureKind::Aborted, stage, reason, None).await?;
                return Ok(());
            }
            if run.state.is_terminal() || run.state.is_suspended() {
                return Ok(());
            }

            match run.state {
                RunState::Idle => self.advance(run, RunState::Publishing).await?,
                RunState::Publishing => self.publish_step(definition, run, token).await?,
                RunState::Deploying(index) => self.deploy_step(run, index, token).await?,
                RunState::AwaitingGate(_) | RunState::Completed | RunState::Failed => return Ok(()),
            }
        }
    }

    async fn publish_step(
        &self,
        definition: &PipelineDefinition,
        run: &mut PipelineRun,
        token: &CancellationToken,
    ) -> Result<(), EngineError> {
        let timer = SpanTimer::start("publish");
        let result = tokio::select! {
            biased;
            () = token.cancelled() => return Ok(()),
            result = publish_all(&definition.publisher, run) => result,
        };

        match result {
            Ok(()) => {
                let duration_ms = timer.finish();
                run.published = true;
                info!(source = %run.source, targets = run.stage_count(), duration_ms, "Artifact published");
                self.emit(
                    RunEvent::new("publish.completed", run.id, &run.pipeline_id)
                        .add_data("source", serde_json::json!(run.source.uri()))
                        .add_data("targets", serde_json::json!(run.stage_count()))
                        .add_data("duration_ms", serde_json::json!(duration_ms)),
                )
                .await;
                self.advance(run, RunState::Deploying(0)).await
            }
            Err(e) => {
                let code = e.error_info().code;
                self.fail(run, FailureKind::Publish, None, e.to_string(), Some(code))
                    .await
            }
        }
    }

    async fn deploy_step(
        &self,
        run: &mut PipelineRun,
        index: usize,
        token: &CancellationToken,
    ) -> Result<(), EngineError> {
        let Some(stage) = run.graph.stage(index).cloned() else {
            return Err(EngineError::InvalidState {
                run_id: run.id,
                operation: "deploy",
                state: run.state.to_string(),
            });
        };

        match self.deploy_with_retry(run, &stage, token).await? {
            StageOutcome::Deployed { outputs, duration_ms } => {
                run.record_deployed(index, outputs);
                info!(stage = %stage.name(), index, duration_ms, "Stage deployed");
                self.emit(RunEvent::deployed(run.id, &run.pipeline_id, stage.name(), index, duration_ms))
                    .await;

                if run.graph.gate_after(index).is_some() {
                    self.advance(run, RunState::AwaitingGate(index)).await?;
                    self.announce_gate(run, index).await;
                } else if index + 1 < run.stage_count() {
                    self.advance(run, RunState::Deploying(index + 1)).await?;
                } else {
                    self.advance(run, RunState::Completed).await?;
                }
                Ok(())
            }
            StageOutcome::Failed(err) => {
                run.record_stage_failed(index, err.message.clone());
                let kind = match err.kind {
                    DeploymentFailureKind::Transient => FailureKind::RetryExhausted,
                    DeploymentFailureKind::Fatal => FailureKind::DeploymentFatal,
                };
                let code = err.error_info().code;
                self.fail(run, kind, Some(index), err.to_string(), Some(code)).await
            }
            StageOutcome::Aborted => {
                let reason = token.reason().unwrap_or_default();
                run.record_stage_failed(index, format!("aborted: {reason}"));
                self.fail(run, FailureKind::Aborted, Some(index), reason, None).await
            }
        }
    }

    async fn deploy_with_retry(
        &self,
        run: &mut PipelineRun,
        stage: &Stage,
        token: &CancellationToken,
    ) -> Result<StageOutcome, EngineError> {
        let retry = &self.inner.config.deploy_retry;
        let mut state = RetryState::new();

        loop {
            state.record_attempt();
            run.record_attempt(stage.index);
            self.inner.store.save(run).await?;
            debug!(stage = %stage.name(), attempt = state.attempts, artifact = %stage.artifact, "Deploying");
            self.emit(RunEvent::deploy_started(
                run.id,
                &run.pipeline_id,
                stage.name(),
                stage.index,
                state.attempts,
            ))
            .await;

            let timer = SpanTimer::start(format!("deploy:{}", stage.name()));
            let result = tokio::select! {
                biased;
                () = token.cancelled() => return Ok(StageOutcome::Aborted),
                result = self.inner.target.deploy(&stage.artifact, &stage.environment) => result,
            };

            let message = match result {
                DeploymentResult::Success { outputs } => {
                    return Ok(StageOutcome::Deployed {
                        outputs,
                        duration_ms: timer.finish(),
                    });
                }
                DeploymentResult::FatalFailure { message } => {
                    error!(stage = %stage.name(), attempt = state.attempts, error = %message, "Fatal deployment failure");
                    return Ok(StageOutcome::Failed(DeploymentError {
                        stage: stage.name().to_string(),
                        index: stage.index,
                        kind: DeploymentFailureKind::Fatal,
                        attempts: state.attempts,
                        message,
                    }));
                }
                DeploymentResult::TransientFailure { message } => message,
            };

            match should_retry(&state, retry, true) {
                RetryDecision::Retry(delay) => {
                    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                    warn!(stage = %stage.name(), attempt = state.attempts, delay_ms, error = %message, "Transient deployment failure, retrying");
                    self.emit(
                        RunEvent::new("stage.deploy_retrying", run.id, &run.pipeline_id)
                            .add_data("stage", serde_json::json!(stage.name()))
                            .add_data("attempt", serde_json::json!(state.attempts))
                            .add_data("delay_ms", serde_json::json!(delay_ms))
                            .add_data("error", serde_json::json!(message)),
                    )
                    .await;
                    tokio::select! {
                        biased;
                        () = token.cancelled() => return Ok(StageOutcome::Aborted),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                RetryDecision::GiveUp | RetryDecision::NotRetryable => {
                    error!(stage = %stage.name(), attempts = state.attempts, error = %message, "Deployment retry budget exhausted");
                    return Ok(StageOutcome::Failed(DeploymentError {
                        stage: stage.name().to_string(),
                        index: stage.index,
                        kind: DeploymentFailureKind::Transient,
                        attempts: state.attempts,
                        message,
                    }));
                }
            }
        }
    }

    /// Moves the run, persists it and emits the transition.
    async fn advance(&self, run: &mut PipelineRun, next: RunState) -> Result<(), EngineError> {
        let from = run.transition(next)?;
        self.inner.store.save(run).await?;
        debug!(run_id = %run.id, from = %from, to = %next, "State changed");
        self.emit(RunEvent::state_changed(run.id, &run.pipeline_id, from, next))
            .await;

        if next == RunState::Completed {
            info!(run_id = %run.id, pipeline_id = %run.pipeline_id, "Run completed");
            self.emit(
                RunEvent::new("run.completed", run.id, &run.pipeline_id)
                    .add_data("reached", serde_json::json!(run.reached().map(|e| e.name.clone()))),
            )
            .await;
        }
        Ok(())
    }

    async fn fail(
        &self,
        run: &mut PipelineRun,
        kind: FailureKind,
        stage: Option<usize>,
        message: String,
        code: Option<String>,
    ) -> Result<(), EngineError> {
        let from = run.fail(kind, stage, message.clone(), code)?;
        self.inner.store.save(run).await?;
        error!(
            run_id = %run.id,
            pipeline_id = %run.pipeline_id,
            kind = %kind,
            stage = ?stage,
            cursor = ?run.cursor,
            error = %message,
            "Run failed"
        );
        self.emit(RunEvent::state_changed(run.id, &run.pipeline_id, from, RunState::Failed))
            .await;
        self.emit(
            RunEvent::failed(run.id, &run.pipeline_id, kind, &message)
                .add_data("stage", serde_json::json!(stage))
                .add_data("cursor", serde_json::json!(run.cursor)),
        )
        .await;
        Ok(())
    }

    async fn announce_gate(&self, run: &PipelineRun, index: usize) {
        if let Some(gate) = run.graph.gate_after(index) {
            info!(run_id = %run.id, gate = %gate.name, after_stage = index, "Awaiting approval");
            self.emit(
                RunEvent::new("gate.awaiting", run.id, &run.pipeline_id)
                    .add_data("gate", serde_json::json!(gate.name))
                    .add_data("after_stage", serde_json::json!(index)),
            )
            .await;
        }
    }

    /// Releases the pipeline held by a terminated run and hands it to the
    /// oldest queued run.
    async fn finish(&self, run: &PipelineRun) -> Result<Option<Uuid>, EngineError> {
        self.inner.admission.release(&run.pipeline_id, run.id);
        self.promote_queued(&run.pipeline_id).await
    }

    /// Hands the pipeline to its oldest queued run.
    ///
    /// The listing may be stale, so each candidate is re-read while holding
    /// its driver slot before it is activated.
    async fn promote_queued(&self, pipeline_id: &str) -> Result<Option<Uuid>, EngineError> {
        let candidates: Vec<Uuid> = self
            .inner
            .store
            .list_for_pipeline(pipeline_id)
            .await?
            .into_iter()
            .filter(|r| r.queued && r.state == RunState::Idle)
            .map(|r| r.id)
            .collect();

        for run_id in candidates {
            // Busy means it is being aborted or resumed right now.
            let Ok(_guard) = self.inner.admission.begin_drive(run_id) else {
                continue;
            };
            let Some(mut next) = self.inner.store.load(run_id).await? else {
                continue;
            };
            if !(next.queued && next.state == RunState::Idle) {
                continue;
            }
            if self.inner.admission.try_acquire(pipeline_id, next.id).is_err() {
                return Ok(None);
            }

            next.queued = false;
            if let Err(e) = self.inner.store.save(&next).await {
                self.inner.admission.release(pipeline_id, next.id);
                return Err(e.into());
            }
            info!(run_id = %next.id, pipeline_id, "Queued run is now active");
            return Ok(Some(next.id));
        }
        Ok(None)
    }

    async fn ignore(&self, signal: GateSignal, reason: IgnoreReason, pipeline_id: Option<&str>) -> SignalOutcome {
        warn!(run_id = %signal.run_id, gate = %signal.gate_name, reason = %reason, "Gate signal ignored");
        self.emit(
            RunEvent::new("signal.ignored", signal.run_id, pipeline_id.unwrap_or_default())
                .add_data("gate", serde_json::json!(signal.gate_name))
                .add_data("reason", serde_json::json!(reason.to_string())),
        )
        .await;
        SignalOutcome::Ignored(IgnoredSignal {
            run_id: signal.run_id,
            gate_name: signal.gate_name,
            reason,
        })
    }

    fn definition(&self, pipeline_id: &str) -> Result<PipelineDefinition, EngineError> {
        self.pipeline(pipeline_id)
            .ok_or_else(|| EngineError::UnknownPipeline(pipeline_id.to_string()))
    }

    async fn load(&self, run_id: Uuid) -> Result<PipelineRun, EngineError> {
        self.inner
            .store
            .load(run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))
    }

    async fn emit(&self, event: RunEvent) {
        self.inner.sink.emit(event).await;
    }
}

fn created_event(run: &PipelineRun) -> RunEvent {
    RunEvent::new("run.created", run.id, &run.pipeline_id)
        .add_data("source", serde_json::json!(run.source.uri()))
        .add_data("stages", serde_json::json!(run.graph.stage_names()))
        .add_data("gates", serde_json::json!(run.graph.gate_count()))
}

/// Publishes the source and materialises every planned target reference.
async fn publish_all(publisher: &ArtifactPublisher, run: &PipelineRun) -> Result<(), PublishError> {
    let source = publisher.publish(&run.image).await?;
    if source != run.source {
        return Err(PublishError::ReferenceMismatch {
            planned: run.source.uri(),
            actual: source.uri(),
        });
    }

    for stage in run.graph.stages() {
        let target = publisher.promote(&source, &stage.environment).await?;
        if target != stage.artifact {
            return Err(PublishError::ReferenceMismatch {
                planned: stage.artifact.uri(),
                actual: target.uri(),
            });
        }
    }
    Ok(())
}
