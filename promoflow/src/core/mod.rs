//! Core domain model types for promoflow.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Environment descriptors and artifact references
//! - Run states, stage statuses and failure kinds
//! - Run events

mod artifact;
mod environment;
mod event;
mod status;

pub use artifact::{ArtifactReference, LocalImage, ReferenceKind};
pub use environment::EnvironmentDescriptor;
pub use event::RunEvent;
pub use status::{FailureKind, RunState, StageStatus};
