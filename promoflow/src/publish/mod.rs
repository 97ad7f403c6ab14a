//! Artifact publishing: the canonical push and per-target references.

mod publisher;
mod registry;

pub use publisher::{ArtifactPublisher, PublishPlan};
pub use registry::{
    Registry, RegistryFailure, RegistryFailureKind, RepositoryPolicy, PULL_ACTIONS,
};
