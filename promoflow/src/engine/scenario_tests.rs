//! End-to-end runs of the engine over the dev/test/prod fixture.

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::*;
use crate::config::{ConcurrencyPolicy, EngineConfig, ResumePolicy};
use crate::core::{FailureKind, LocalImage, RunEvent, RunState};
use crate::deploy::DeploymentResult;
use crate::errors::{EngineError, StoreError};
use crate::events::{CollectingEventSink, EventSink};
use crate::pipeline::PipelineRun;
use crate::publish::{RegistryFailure, RegistryFailureKind};
use crate::store::{FileRunStore, InMemoryRunStore, RunStore};
use crate::testing::fixtures::{fast_engine_config, local_image, sample_run, three_stage_config};
use crate::testing::{InMemoryRegistry, ScriptedDeploymentTarget};

const PIPELINE: &str = "hello";
const GATE: &str = "PromoteToProd";

struct Harness {
    engine: PromotionEngine,
    target: Arc<ScriptedDeploymentTarget>,
    registry: Arc<InMemoryRegistry>,
    store: Arc<dyn RunStore>,
    events: Arc<CollectingEventSink>,
}

impl Harness {
    fn new(target: ScriptedDeploymentTarget) -> Self {
        Self::with_config(target, fast_engine_config())
    }

    fn with_config(target: ScriptedDeploymentTarget, config: EngineConfig) -> Self {
        Self::over_store(target, config, Arc::new(InMemoryRunStore::new()))
    }

    fn over_store(target: ScriptedDeploymentTarget, config: EngineConfig, store: Arc<dyn RunStore>) -> Self {
        Self::assemble(target, config, store, None)
    }

    /// Holds the emitting task for `delay` on every event of `event_type`.
    fn stalling_on(target: ScriptedDeploymentTarget, event_type: &'static str, delay: Duration) -> Self {
        Self::assemble(
            target,
            fast_engine_config(),
            Arc::new(InMemoryRunStore::new()),
            Some((event_type, delay)),
        )
    }

    fn assemble(
        target: ScriptedDeploymentTarget,
        config: EngineConfig,
        store: Arc<dyn RunStore>,
        stall: Option<(&'static str, Duration)>,
    ) -> Self {
        let target = Arc::new(target);
        let registry = Arc::new(InMemoryRegistry::new());
        let events = Arc::new(CollectingEventSink::new());
        let sink: Arc<dyn EventSink> = match stall {
            Some((event_type, delay)) => Arc::new(StallingSink {
                inner: events.clone(),
                event_type,
                delay,
            }),
            None => events.clone(),
        };
        let engine = PromotionEngine::builder(registry.clone(), target.clone(), Arc::clone(&store))
            .with_event_sink(sink)
            .with_config(config)
            .with_pipeline(PIPELINE, three_stage_config())
            .build()
            .unwrap();
        Self {
            engine,
            target,
            registry,
            store,
            events,
        }
    }

    async fn trigger(&self) -> RunReport {
        self.engine
            .trigger(TriggerEvent::new(PIPELINE, local_image()))
            .await
            .unwrap()
    }

    async fn approve(&self, run_id: Uuid) -> RunReport {
        let outcome = self
            .engine
            .signal_gate(GateSignal::approve(run_id, GATE).with_approver("alice"))
            .await
            .unwrap();
        outcome.applied().cloned().unwrap()
    }
}

fn second_build() -> LocalImage {
    LocalImage::from_content("helloecs", "build-2", b"build-2")
}

/// Records every event, then holds the emitter on one event type.
struct StallingSink {
    inner: Arc<CollectingEventSink>,
    event_type: &'static str,
    delay: Duration,
}

#[async_trait]
impl EventSink for StallingSink {
    async fn emit(&self, event: RunEvent) {
        let stall = event.event_type == self.event_type;
        self.inner.emit(event).await;
        if stall {
            tokio::time::sleep(self.delay).await;
        }
    }

    fn try_emit(&self, event: RunEvent) {
        self.inner.try_emit(event);
    }
}

/// Takes its listing up front and returns it late, so callers act on a
/// stale view.
struct SlowListStore {
    inner: InMemoryRunStore,
    delay: Duration,
}

#[async_trait]
impl RunStore for SlowListStore {
    async fn insert(&self, run: &PipelineRun) -> Result<(), StoreError> {
        self.inner.insert(run).await
    }

    async fn load(&self, id: Uuid) -> Result<Option<PipelineRun>, StoreError> {
        self.inner.load(id).await
    }

    async fn save(&self, run: &PipelineRun) -> Result<(), StoreError> {
        self.inner.save(run).await
    }

    async fn list(&self) -> Result<Vec<PipelineRun>, StoreError> {
        let runs = self.inner.list().await?;
        tokio::time::sleep(self.delay).await;
        Ok(runs)
    }
}

/// Refuses to save runs in one state while armed.
#[derive(Default)]
struct FailingStore {
    inner: InMemoryRunStore,
    fail_on: Mutex<Option<RunState>>,
}

impl FailingStore {
    fn fail_saves_in(&self, state: Option<RunState>) {
        *self.fail_on.lock() = state;
    }
}

#[async_trait]
impl RunStore for FailingStore {
    async fn insert(&self, run: &PipelineRun) -> Result<(), StoreError> {
        self.inner.insert(run).await
    }

    async fn load(&self, id: Uuid) -> Result<Option<PipelineRun>, StoreError> {
        self.inner.load(id).await
    }

    async fn save(&self, run: &PipelineRun) -> Result<(), StoreError> {
        if *self.fail_on.lock() == Some(run.state) {
            return Err(StoreError::Io(std::io::Error::other("disk full")));
        }
        self.inner.save(run).await
    }

    async fn list(&self) -> Result<Vec<PipelineRun>, StoreError> {
        self.inner.list().await
    }
}

#[tokio::test]
async fn test_promotes_through_gate_to_prod() {
    let h = Harness::new(ScriptedDeploymentTarget::new());

    let report = h.trigger().await;
    assert_eq!(report.state, RunState::AwaitingGate(1));
    assert_eq!(report.cursor, Some(1));
    assert_eq!(report.awaiting_gate.as_deref(), Some(GATE));
    assert_eq!(h.target.called_environments(), vec!["dev", "test"]);
    assert_eq!(h.engine.active_run(PIPELINE), Some(report.run_id));

    let report = h.approve(report.run_id).await;
    assert!(report.is_completed());
    assert_eq!(report.cursor, Some(2));
    assert_eq!(report.reached.map(|e| e.name), Some("prod".to_string()));
    assert_eq!(h.target.called_environments(), vec!["dev", "test", "prod"]);
    assert_eq!(h.engine.active_run(PIPELINE), None);

    assert_eq!(h.registry.push_count(), 1);
    assert_eq!(h.registry.copy_count(), 3);
}

#[tokio::test]
async fn test_stages_deploy_strictly_in_order() {
    let h = Harness::new(ScriptedDeploymentTarget::new());
    let report = h.trigger().await;
    h.approve(report.run_id).await;

    let calls = h.target.calls();
    assert_eq!(calls.len(), 3);
    for pair in calls.windows(2) {
        assert!(pair[0].seq < pair[1].seq);
        assert!(pair[0].started_at <= pair[1].started_at);
    }

    let starts: Vec<String> = h
        .events
        .events_of_type("stage.deploy_started")
        .iter()
        .filter_map(|e| e.data_str("stage").map(str::to_string))
        .collect();
    assert_eq!(starts, vec!["dev", "test", "prod"]);
}

#[tokio::test]
async fn test_each_stage_deploys_the_planned_reference() {
    let h = Harness::new(ScriptedDeploymentTarget::new());
    let report = h.trigger().await;
    h.approve(report.run_id).await;

    let run = h.store.load(report.run_id).await.unwrap().unwrap();
    let planned: Vec<String> = run.graph.stages().map(|s| s.artifact.uri()).collect();
    let deployed: Vec<String> = h.target.calls().into_iter().map(|c| c.artifact_uri).collect();
    assert_eq!(deployed, planned);
    for stage in run.graph.stages() {
        assert!(h.registry.contains(&stage.artifact));
    }
}

#[tokio::test]
async fn test_fatal_failure_stops_before_later_stages() {
    let target = ScriptedDeploymentTarget::new().with_script("test", [DeploymentResult::fatal("stack rolled back")]);
    let h = Harness::new(target);

    let report = h.trigger().await;
    assert!(report.is_failed());
    assert_eq!(report.cursor, Some(0));
    assert_eq!(report.reached.map(|e| e.name), Some("dev".to_string()));

    let failure = report.failure.unwrap();
    assert_eq!(failure.kind, FailureKind::DeploymentFatal);
    assert_eq!(failure.stage.as_deref(), Some("test"));
    assert_eq!(failure.code.as_deref(), Some("DEPLOY-002-FATAL"));

    assert_eq!(h.target.call_count("test"), 1);
    assert_eq!(h.target.call_count("prod"), 0);
    assert_eq!(h.engine.active_run(PIPELINE), None);
}

#[tokio::test]
async fn test_transient_failures_exhaust_retry_budget() {
    let target = ScriptedDeploymentTarget::new().with_fallback("test", DeploymentResult::transient("throttled"));
    let h = Harness::new(target);

    let report = h.trigger().await;
    assert!(report.is_failed());
    assert_eq!(report.cursor, Some(0));
    assert_eq!(report.failure.as_ref().map(|f| f.kind), Some(FailureKind::RetryExhausted));
    assert_eq!(h.target.call_count("test"), 3);
    assert_eq!(report.stages[1].attempts, 3);
    assert_eq!(h.events.events_of_type("stage.deploy_retrying").len(), 2);
    assert_eq!(h.target.call_count("prod"), 0);
}

#[tokio::test]
async fn test_transient_failures_recover() {
    let target = ScriptedDeploymentTarget::new().with_script(
        "dev",
        [DeploymentResult::transient("timeout"), DeploymentResult::transient("timeout")],
    );
    let h = Harness::new(target);

    let report = h.trigger().await;
    assert_eq!(report.state, RunState::AwaitingGate(1));
    assert_eq!(h.target.call_count("dev"), 3);
    assert_eq!(report.stages[0].attempts, 3);
    assert_eq!(report.stages[0].last_error, None);
}

#[tokio::test]
async fn test_gate_rejection_fails_run() {
    let h = Harness::new(ScriptedDeploymentTarget::new());
    let report = h.trigger().await;

    let outcome = h
        .engine
        .signal_gate(GateSignal::reject(report.run_id, GATE).with_approver("bob"))
        .await
        .unwrap();
    let report = outcome.applied().cloned().unwrap();

    assert!(report.is_failed());
    assert_eq!(report.cursor, Some(1));
    assert_eq!(report.failure.as_ref().map(|f| f.kind), Some(FailureKind::GateRejected));
    assert_eq!(h.target.call_count("prod"), 0);
    assert_eq!(h.events.events_of_type("gate.rejected").len(), 1);
}

#[tokio::test]
async fn test_mismatched_signals_are_ignored() {
    let h = Harness::new(ScriptedDeploymentTarget::new());
    let report = h.trigger().await;

    let outcome = h
        .engine
        .signal_gate(GateSignal::approve(Uuid::new_v4(), GATE))
        .await
        .unwrap();
    match outcome {
        SignalOutcome::Ignored(ignored) => assert_eq!(ignored.reason, IgnoreReason::UnknownRun),
        SignalOutcome::Applied(_) => panic!("signal for unknown run was applied"),
    }

    let outcome = h
        .engine
        .signal_gate(GateSignal::approve(report.run_id, "PromoteToStaging"))
        .await
        .unwrap();
    match outcome {
        SignalOutcome::Ignored(ignored) => assert_eq!(
            ignored.reason,
            IgnoreReason::GateMismatch {
                expected: GATE.to_string()
            }
        ),
        SignalOutcome::Applied(_) => panic!("signal for wrong gate was applied"),
    }

    let current = h.engine.report(report.run_id).await.unwrap();
    assert_eq!(current.state, RunState::AwaitingGate(1));
    assert_eq!(h.target.call_count("prod"), 0);
    assert_eq!(h.events.events_of_type("signal.ignored").len(), 2);

    h.approve(report.run_id).await;
    let outcome = h
        .engine
        .signal_gate(GateSignal::approve(report.run_id, GATE))
        .await
        .unwrap();
    assert!(outcome.is_ignored());
    assert_eq!(h.target.call_count("prod"), 1);
}

#[tokio::test]
async fn test_signal_moves_only_the_named_run() {
    let h = Harness::new(ScriptedDeploymentTarget::new());
    h.engine.register_pipeline("hello-2", three_stage_config());

    let first = h.trigger().await;
    let second = h
        .engine
        .trigger(TriggerEvent::new("hello-2", second_build()))
        .await
        .unwrap();
    assert_eq!(first.awaiting_gate.as_deref(), Some(GATE));
    assert_eq!(second.awaiting_gate.as_deref(), Some(GATE));

    let report = h.approve(first.run_id).await;
    assert!(report.is_completed());

    let other = h.store.load(second.run_id).await.unwrap().unwrap();
    assert_eq!(other.state, RunState::AwaitingGate(1));
    assert_eq!(other.cursor, Some(1));
    assert!(other.gate_decisions.is_empty());
    assert_eq!(h.engine.active_run("hello-2"), Some(second.run_id));
    assert_eq!(h.target.call_count("prod"), 1);

    let report = h.approve(second.run_id).await;
    assert!(report.is_completed());
    assert_eq!(h.target.call_count("prod"), 2);
}

#[tokio::test]
async fn test_abort_while_awaiting_gate() {
    let h = Harness::new(ScriptedDeploymentTarget::new());
    let report = h.trigger().await;

    let report = h.engine.abort(report.run_id, "release cancelled").await.unwrap();
    assert!(report.is_failed());
    let failure = report.failure.unwrap();
    assert_eq!(failure.kind, FailureKind::Aborted);
    assert_eq!(failure.message, "release cancelled");
    assert_eq!(report.cursor, Some(1));
    assert_eq!(h.engine.active_run(PIPELINE), None);

    let err = h.engine.abort(report.run_id, "again").await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState { operation: "abort", .. }));
}

#[tokio::test]
async fn test_abort_cancels_in_flight_deploy() {
    let target = ScriptedDeploymentTarget::new().with_delay("dev", Duration::from_secs(30));
    let h = Harness::new(target);

    let engine = h.engine.clone();
    let handle = tokio::spawn(async move { engine.trigger(TriggerEvent::new(PIPELINE, local_image())).await });

    while h.target.call_count("dev") == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    let run_id = h.engine.active_run(PIPELINE).unwrap();

    let report = tokio::time::timeout(Duration::from_secs(5), h.engine.abort(run_id, "operator abort"))
        .await
        .unwrap()
        .unwrap();
    assert!(report.is_failed());
    assert_eq!(report.cursor, None);
    assert_eq!(report.failure.as_ref().map(|f| f.kind), Some(FailureKind::Aborted));

    let driven = handle.await.unwrap().unwrap();
    assert_eq!(driven.state, RunState::Failed);
    assert_eq!(h.target.call_count("test"), 0);
}

#[tokio::test]
async fn test_abort_while_gate_is_being_announced() {
    let h = Harness::stalling_on(ScriptedDeploymentTarget::new(), "gate.awaiting", Duration::from_millis(200));

    let engine = h.engine.clone();
    let handle = tokio::spawn(async move { engine.trigger(TriggerEvent::new(PIPELINE, local_image())).await });

    while h.events.events_of_type("gate.awaiting").is_empty() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    let run_id = h.engine.active_run(PIPELINE).unwrap();

    let report = h.engine.abort(run_id, "release cancelled").await.unwrap();
    assert!(report.is_failed());
    assert_eq!(report.failure.as_ref().map(|f| f.kind), Some(FailureKind::Aborted));

    let driven = handle.await.unwrap().unwrap();
    assert_eq!(driven.state, RunState::Failed);

    let stored = h.store.load(run_id).await.unwrap().unwrap();
    assert_eq!(stored.state, RunState::Failed);
    assert_eq!(h.engine.active_run(PIPELINE), None);
    assert_eq!(h.target.call_count("prod"), 0);
}

#[tokio::test]
async fn test_abort_while_signal_is_being_ignored() {
    let h = Harness::stalling_on(ScriptedDeploymentTarget::new(), "signal.ignored", Duration::from_millis(200));
    let report = h.trigger().await;

    let engine = h.engine.clone();
    let run_id = report.run_id;
    let handle = tokio::spawn(async move {
        engine
            .signal_gate(GateSignal::approve(run_id, "PromoteToStaging"))
            .await
    });

    while h.events.events_of_type("signal.ignored").is_empty() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let report = h.engine.abort(run_id, "release cancelled").await.unwrap();
    assert!(report.is_failed());
    assert_eq!(report.failure.as_ref().map(|f| f.kind), Some(FailureKind::Aborted));
    assert!(handle.await.unwrap().unwrap().is_ignored());

    let stored = h.store.load(run_id).await.unwrap().unwrap();
    assert_eq!(stored.state, RunState::Failed);
    assert_eq!(h.engine.active_run(PIPELINE), None);
}

#[tokio::test]
async fn test_resume_continues_from_cursor() {
    let target = ScriptedDeploymentTarget::new().with_script("test", [DeploymentResult::fatal("bad task definition")]);
    let h = Harness::new(target);

    let failed = h.trigger().await;
    assert!(failed.is_failed());

    let report = h.engine.resume(failed.run_id).await.unwrap();
    assert_eq!(report.state, RunState::AwaitingGate(1));
    assert_eq!(report.failure, None);
    assert_eq!(h.target.called_environments(), vec!["dev", "test", "test"]);

    let report = h.approve(failed.run_id).await;
    assert!(report.is_completed());
    assert_eq!(h.target.call_count("dev"), 1);
}

#[tokio::test]
async fn test_resume_after_rejection_waits_at_gate_again() {
    let h = Harness::new(ScriptedDeploymentTarget::new());
    let report = h.trigger().await;
    h.engine
        .signal_gate(GateSignal::reject(report.run_id, GATE))
        .await
        .unwrap();

    let report = h.engine.resume(report.run_id).await.unwrap();
    assert_eq!(report.state, RunState::AwaitingGate(1));
    assert_eq!(report.awaiting_gate.as_deref(), Some(GATE));
    assert_eq!(h.target.call_count("test"), 1);

    let report = h.approve(report.run_id).await;
    assert!(report.is_completed());
}

#[tokio::test]
async fn test_resume_with_restart_redeploys_everything() {
    let target = ScriptedDeploymentTarget::new().with_script("test", [DeploymentResult::fatal("bad task definition")]);
    let config = fast_engine_config().with_resume(ResumePolicy::Restart);
    let h = Harness::with_config(target, config);

    let failed = h.trigger().await;
    let report = h.engine.resume(failed.run_id).await.unwrap();

    assert_eq!(report.state, RunState::AwaitingGate(1));
    assert_eq!(h.target.call_count("dev"), 2);
    assert_eq!(report.stages[0].attempts, 1);
    assert_eq!(h.registry.push_count(), 1);
}

#[tokio::test]
async fn test_resume_rejects_completed_run() {
    let h = Harness::new(ScriptedDeploymentTarget::new());
    let report = h.trigger().await;
    h.approve(report.run_id).await;

    let err = h.engine.resume(report.run_id).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState { operation: "resume", .. }));

    let err = h.engine.resume(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, EngineError::RunNotFound(_)));
}

#[tokio::test]
async fn test_reject_policy_refuses_second_trigger() {
    let h = Harness::new(ScriptedDeploymentTarget::new());
    let first = h.trigger().await;

    let err = h
        .engine
        .trigger(TriggerEvent::new(PIPELINE, second_build()))
        .await
        .unwrap_err();
    match err {
        EngineError::RunInProgress { active_run, .. } => assert_eq!(active_run, first.run_id),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(h.store.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_queue_policy_hands_over_on_termination() {
    let config = fast_engine_config().with_concurrency(ConcurrencyPolicy::Queue);
    let h = Harness::with_config(ScriptedDeploymentTarget::new(), config);

    let first = h.trigger().await;
    let second = h
        .engine
        .trigger(TriggerEvent::new(PIPELINE, second_build()))
        .await
        .unwrap();
    assert!(second.queued);
    assert_eq!(second.state, RunState::Idle);
    assert_eq!(h.engine.active_run(PIPELINE), Some(first.run_id));

    let err = h.engine.resume(second.run_id).await.unwrap_err();
    assert!(matches!(err, EngineError::RunInProgress { .. }));

    let aborted = h.engine.abort(first.run_id, "superseded").await.unwrap();
    assert_eq!(aborted.next_run, Some(second.run_id));
    assert_eq!(h.engine.active_run(PIPELINE), Some(second.run_id));

    let report = h.engine.resume(second.run_id).await.unwrap();
    assert_eq!(report.state, RunState::AwaitingGate(1));
    assert!(!report.queued);
    assert_eq!(h.registry.push_count(), 2);
}

#[tokio::test]
async fn test_aborting_queued_run_during_handover_keeps_it_failed() {
    let config = fast_engine_config().with_concurrency(ConcurrencyPolicy::Queue);
    let store = Arc::new(SlowListStore {
        inner: InMemoryRunStore::new(),
        delay: Duration::from_millis(100),
    });
    let h = Harness::over_store(ScriptedDeploymentTarget::new(), config, store);

    let first = h.trigger().await;
    let second = h
        .engine
        .trigger(TriggerEvent::new(PIPELINE, second_build()))
        .await
        .unwrap();
    assert!(second.queued);

    let (first_abort, second_abort) = tokio::join!(
        h.engine.abort(first.run_id, "superseded"),
        h.engine.abort(second.run_id, "withdrawn"),
    );
    assert!(first_abort.unwrap().is_failed());
    assert!(second_abort.unwrap().is_failed());

    let stored = h.store.load(second.run_id).await.unwrap().unwrap();
    assert_eq!(stored.state, RunState::Failed);
    assert_eq!(stored.failure.map(|f| f.kind), Some(FailureKind::Aborted));
    assert_eq!(h.engine.active_run(PIPELINE), None);

    let report = h.engine.resume(second.run_id).await.unwrap();
    assert_eq!(report.state, RunState::AwaitingGate(1));
}

#[tokio::test]
async fn test_store_failure_while_driving_releases_pipeline() {
    let store = Arc::new(FailingStore::default());
    store.fail_saves_in(Some(RunState::Deploying(1)));
    let h = Harness::over_store(ScriptedDeploymentTarget::new(), fast_engine_config(), store.clone());

    let err = h
        .engine
        .trigger(TriggerEvent::new(PIPELINE, local_image()))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Store(_)));
    assert_eq!(h.engine.active_run(PIPELINE), None);

    let runs = h.store.list().await.unwrap();
    assert_eq!(runs.len(), 1);
    let run_id = runs[0].id;
    assert_eq!(runs[0].state, RunState::Failed);
    assert_eq!(runs[0].cursor, Some(0));
    assert_eq!(runs[0].failure.as_ref().map(|f| f.kind), Some(FailureKind::Interrupted));

    store.fail_saves_in(None);
    let report = h.engine.resume(run_id).await.unwrap();
    assert_eq!(report.state, RunState::AwaitingGate(1));
    assert_eq!(h.target.call_count("dev"), 1);
}

#[tokio::test]
async fn test_store_failure_during_resume_releases_pipeline() {
    let store = Arc::new(FailingStore::default());
    let target = ScriptedDeploymentTarget::new().with_script("test", [DeploymentResult::fatal("bad task definition")]);
    let h = Harness::over_store(target, fast_engine_config(), store.clone());

    let failed = h.trigger().await;
    assert!(failed.is_failed());

    store.fail_saves_in(Some(RunState::Idle));
    let err = h.engine.resume(failed.run_id).await.unwrap_err();
    assert!(matches!(err, EngineError::Store(_)));
    assert_eq!(h.engine.active_run(PIPELINE), None);
    let stored = h.store.load(failed.run_id).await.unwrap().unwrap();
    assert_eq!(stored.state, RunState::Failed);

    store.fail_saves_in(None);
    let report = h.engine.resume(failed.run_id).await.unwrap();
    assert_eq!(report.state, RunState::AwaitingGate(1));
}

#[tokio::test]
async fn test_publish_failure_fails_before_deploying() {
    let h = Harness::new(ScriptedDeploymentTarget::new());
    h.registry
        .fail_next("push", RegistryFailure::new(RegistryFailureKind::Auth, "token expired"));

    let report = h.trigger().await;
    assert!(report.is_failed());
    assert_eq!(report.cursor, None);
    let failure = report.failure.unwrap();
    assert_eq!(failure.kind, FailureKind::Publish);
    assert_eq!(failure.code.as_deref(), Some("PUBLISH-001-AUTH"));
    assert!(h.target.calls().is_empty());
}

#[tokio::test]
async fn test_events_describe_the_run() {
    let h = Harness::new(ScriptedDeploymentTarget::new());
    let report = h.trigger().await;
    h.approve(report.run_id).await;

    let types = h.events.event_types();
    for expected in [
        "run.created",
        "publish.completed",
        "stage.deploy_started",
        "stage.deployed",
        "gate.awaiting",
        "gate.approved",
        "run.completed",
    ] {
        assert!(types.iter().any(|t| t == expected), "missing {expected}");
    }
    assert_eq!(h.events.events_of_type("stage.deployed").len(), 3);
    assert!(h.events.events().iter().all(|e| e.run_id == report.run_id));
}

#[tokio::test]
async fn test_unknown_pipeline() {
    let h = Harness::new(ScriptedDeploymentTarget::new());
    let err = h
        .engine
        .trigger(TriggerEvent::new("nope", local_image()))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::UnknownPipeline(id) if id == "nope"));
}

#[tokio::test]
async fn test_gate_wait_survives_restart() {
    let dir = tempfile::tempdir().unwrap();

    let run_id = {
        let store = Arc::new(FileRunStore::open(dir.path()).await.unwrap());
        let h = Harness::over_store(ScriptedDeploymentTarget::new(), fast_engine_config(), store);
        h.trigger().await.run_id
    };

    let store = Arc::new(FileRunStore::open(dir.path()).await.unwrap());
    let h = Harness::over_store(ScriptedDeploymentTarget::new(), fast_engine_config(), store);

    let recovered = h.engine.recover().await.unwrap();
    assert_eq!(recovered.suspended, vec![run_id]);
    assert_eq!(h.engine.active_run(PIPELINE), Some(run_id));

    let report = h.approve(run_id).await;
    assert!(report.is_completed());
    assert_eq!(h.target.called_environments(), vec!["prod"]);
}

#[tokio::test]
async fn test_recover_marks_in_flight_runs_interrupted() {
    let h = Harness::new(ScriptedDeploymentTarget::new());
    let mut run = sample_run(PIPELINE);
    run.state = RunState::Deploying(0);
    run.published = true;
    h.store.insert(&run).await.unwrap();

    let recovered = h.engine.recover().await.unwrap();
    assert_eq!(recovered.interrupted, vec![run.id]);

    let report = h.engine.report(run.id).await.unwrap();
    assert!(report.is_failed());
    assert_eq!(report.failure.as_ref().map(|f| f.kind), Some(FailureKind::Interrupted));
    assert_eq!(h.engine.active_run(PIPELINE), None);

    let report = h.engine.resume(run.id).await.unwrap();
    assert_eq!(report.state, RunState::AwaitingGate(1));
    assert_eq!(h.target.called_environments(), vec!["dev", "test"]);
}

#[tokio::test]
async fn test_builder_rejects_invalid_settings() {
    let config = EngineConfig::new().with_deploy_retry(crate::pipeline::RetryConfig::new().with_max_attempts(0));
    let result = PromotionEngine::builder(
        Arc::new(InMemoryRegistry::new()),
        Arc::new(ScriptedDeploymentTarget::new()),
        Arc::new(InMemoryRunStore::new()),
    )
    .with_config(config)
    .build();
    assert!(matches!(result, Err(EngineError::Settings(_))));
}
