//! The boundary to the provisioning subsystem.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::core::{ArtifactReference, EnvironmentDescriptor};
use crate::errors::DeploymentFailureKind;

/// Outcome of one deploy call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum DeploymentResult {
    /// The artifact is running in the environment.
    Success {
        /// Named outputs such as a load balancer DNS name.
        #[serde(default)]
        outputs: HashMap<String, String>,
    },
    /// Retryable failure (throttling, timeouts).
    TransientFailure {
        /// Adapter detail.
        message: String,
    },
    /// Definitive failure.
    FatalFailure {
        /// Adapter detail.
        message: String,
    },
}

impl DeploymentResult {
    /// A success without outputs.
    #[must_use]
    pub fn success() -> Self {
        Self::Success {
            outputs: HashMap::new(),
        }
    }

    /// A success with one output.
    #[must_use]
    pub fn success_with_output(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Success {
            outputs: HashMap::from([(key.into(), value.into())]),
        }
    }

    /// A transient failure.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientFailure {
            message: message.into(),
        }
    }

    /// A fatal failure.
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::FatalFailure {
            message: message.into(),
        }
    }

    /// Returns true on success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Returns the failure kind, or `None` on success.
    #[must_use]
    pub fn failure_kind(&self) -> Option<DeploymentFailureKind> {
        match self {
            Self::Success { .. } => None,
            Self::TransientFailure { .. } => Some(DeploymentFailureKind::Transient),
            Self::FatalFailure { .. } => Some(DeploymentFailureKind::Fatal),
        }
    }
}

/// Deploys an artifact into an environment.
///
/// Implementations own every provisioning detail; the engine only relies on
/// the three-way result taxonomy to drive retries.
#[async_trait]
pub trait DeploymentTarget: Send + Sync {
    /// Deploys `artifact` into `environment`.
    async fn deploy(
        &self,
        artifact: &ArtifactReference,
        environment: &EnvironmentDescriptor,
    ) -> DeploymentResult;
}
