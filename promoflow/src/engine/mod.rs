//! The promotion engine.
//!
//! [`PromotionEngine`] owns the run state machine. It publishes the build
//! once, deploys stage by stage through a [`crate::deploy::DeploymentTarget`],
//! suspends at gates, and persists every transition through a
//! [`crate::store::RunStore`].

mod admission;
mod promotion;
mod types;

#[cfg(test)]
mod scenario_tests;

pub use promotion::{EngineBuilder, PipelineDefinition, PromotionEngine};
pub use types::{
    GateSignal, IgnoreReason, IgnoredSignal, RecoveryReport, RunReport, SignalOutcome, TriggerEvent,
};
