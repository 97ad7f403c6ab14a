//! # Promoflow
//!
//! Gated, multi-environment promotion of a single container image build.
//!
//! A build is published once to a canonical registry. Every deployment
//! target then gets a deterministic reference to that same artifact, and the
//! targets are deployed strictly in order:
//!
//! - **Deterministic publishing**: references are planned before anything is
//!   pushed, retagged in place or copied across accounts and regions
//! - **Serial deployment**: one stage at a time, with bounded retries for
//!   transient failures
//! - **Manual gates**: a run suspends durably until an approval or rejection
//!   names its exact gate
//! - **Recovery**: every transition is persisted, so runs survive restarts
//!   and failed runs resume from the last deployed stage
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use promoflow::prelude::*;
//!
//! let config = ConfigResolver::from_path("deploy.json").resolve()?;
//! let engine = PromotionEngine::builder(registry, target, store)
//!     .with_event_sink(Arc::new(LoggingEventSink::info()))
//!     .with_pipeline("hello-ecs", config)
//!     .build()?;
//!
//! let report = engine.trigger(TriggerEvent::new("hello-ecs", image)).await?;
//! if let Some(gate) = report.awaiting_gate {
//!     engine.signal_gate(GateSignal::approve(report.run_id, gate)).await?;
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod config;
pub mod core;
pub mod deploy;
pub mod engine;
pub mod errors;
pub mod events;
pub mod observability;
pub mod pipeline;
pub mod publish;
pub mod store;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{
        ConcurrencyPolicy, ConfigResolver, EngineConfig, ResolvedConfig, ResumePolicy,
    };
    pub use crate::core::{
        ArtifactReference, EnvironmentDescriptor, FailureKind, LocalImage, ReferenceKind,
        RunEvent, RunState, StageStatus,
    };
    pub use crate::deploy::{DeploymentResult, DeploymentTarget};
    pub use crate::engine::{
        GateSignal, PromotionEngine, RecoveryReport, RunReport, SignalOutcome, TriggerEvent,
    };
    pub use crate::errors::{
        ConfigError, DeploymentError, EngineError, GraphError, PublishError, StoreError,
    };
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::pipeline::{
        GateDecision, GatePolicy, PipelineGraph, PipelineRun, RetryConfig, StageGraphBuilder,
    };
    pub use crate::publish::{ArtifactPublisher, Registry, RepositoryPolicy};
    pub use crate::store::{FileRunStore, InMemoryRunStore, RunStore};
}
