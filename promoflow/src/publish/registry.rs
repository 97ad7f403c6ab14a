//! Container registry boundary and repository access policy.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{ArtifactReference, LocalImage};
use crate::errors::PublishError;

/// Classification of a registry failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryFailureKind {
    /// Connection reset, timeout, DNS.
    Network,
    /// Rate limited by the registry.
    Throttled,
    /// Credentials missing or expired.
    Auth,
    /// Authenticated but not allowed.
    Permission,
    /// Repository or image does not exist.
    NotFound,
    /// Anything else.
    Other,
}

/// A failed registry call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind:?}: {message}")]
pub struct RegistryFailure {
    /// What went wrong.
    pub kind: RegistryFailureKind,
    /// Registry-provided detail.
    pub message: String,
}

impl RegistryFailure {
    /// Creates a failure.
    #[must_use]
    pub fn new(kind: RegistryFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Network failures and throttling are worth retrying.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            RegistryFailureKind::Network | RegistryFailureKind::Throttled
        )
    }

    /// Converts the final failure of a retried call into a [`PublishError`].
    #[must_use]
    pub fn into_publish_error(self, target: &str, attempts: usize) -> PublishError {
        let target = target.to_string();
        match self.kind {
            RegistryFailureKind::Network | RegistryFailureKind::Throttled => PublishError::Network {
                target,
                attempts,
                message: self.message,
            },
            RegistryFailureKind::Auth => PublishError::Auth {
                target,
                message: self.message,
            },
            RegistryFailureKind::Permission => PublishError::Permission {
                target,
                message: self.message,
            },
            RegistryFailureKind::NotFound | RegistryFailureKind::Other => PublishError::Rejected {
                target,
                message: self.message,
            },
        }
    }
}

/// Actions a pull-only principal needs.
pub const PULL_ACTIONS: [&str; 3] = [
    "ecr:GetDownloadUrlForLayer",
    "ecr:BatchCheckLayerAvailability",
    "ecr:BatchGetImage",
];

/// Pull access for every principal of one organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryPolicy {
    /// Statement id.
    pub sid: String,
    /// Allowed actions.
    pub actions: Vec<String>,
    /// Organization id principals must belong to.
    pub organization_id: String,
}

impl RepositoryPolicy {
    /// Pull-only access scoped to `organization_id`.
    #[must_use]
    pub fn organization_pull(organization_id: impl Into<String>) -> Self {
        Self {
            sid: "AllowOrganizationPull".to_string(),
            actions: PULL_ACTIONS.iter().map(|a| (*a).to_string()).collect(),
            organization_id: organization_id.into(),
        }
    }

    /// Renders the policy document.
    #[must_use]
    pub fn to_document(&self) -> serde_json::Value {
        serde_json::json!({
            "Version": "2012-10-17",
            "Statement": [{
                "Sid": self.sid,
                "Effect": "Allow",
                "Principal": "*",
                "Action": self.actions,
                "Condition": {
                    "StringEquals": { "aws:PrincipalOrgID": self.organization_id }
                }
            }]
        })
    }
}

/// The registry operations the publisher relies on.
///
/// Implementations talk to a real registry; [`crate::testing::InMemoryRegistry`]
/// is provided for tests.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Registry: Send + Sync {
    /// Creates the repository holding `reference` if needed and applies `policy`.
    async fn ensure_repository(
        &self,
        reference: &ArtifactReference,
        policy: &RepositoryPolicy,
    ) -> Result<(), RegistryFailure>;

    /// Returns true if `reference` already resolves in its registry.
    async fn exists(&self, reference: &ArtifactReference) -> Result<bool, RegistryFailure>;

    /// Pushes a local image to `target`, returning the stored digest.
    async fn push(&self, image: &LocalImage, target: &ArtifactReference) -> Result<String, RegistryFailure>;

    /// Adds `target`'s tag to the image `source` points at (same repository).
    async fn tag(&self, source: &ArtifactReference, target: &ArtifactReference) -> Result<(), RegistryFailure>;

    /// Copies `source` into another account's or region's registry.
    async fn copy(&self, source: &ArtifactReference, target: &ArtifactReference) -> Result<(), RegistryFailure>;
}
