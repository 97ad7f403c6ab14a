//! Promotion graphs and run records.
//!
//! This module provides:
//! - The stage/gate graph and its builder
//! - Gate policies
//! - The pipeline run record with its cursor
//! - Retry budgets for transient failures

mod builder;
mod graph;
mod retry;
mod run;

pub use builder::{default_gate_name, GatePolicy, GateRule, StageGraphBuilder};
pub use graph::{Gate, GateDecision, PipelineGraph, PipelineNode, Stage};
pub use retry::{
    retry_transient, should_retry, BackoffStrategy, JitterStrategy, RetryConfig, RetryDecision,
    RetryOutcome, RetryState,
};
pub use run::{GateDecisionRecord, PipelineRun, RunFailure, StageRecord};
