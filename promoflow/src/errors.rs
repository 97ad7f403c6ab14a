//! Error types for promoflow.
//!
//! Every component boundary returns one of the typed errors below so that a
//! run which stops early can always report the precise kind of failure and
//! the stage it happened at.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

/// The umbrella error returned by [`crate::engine::PromotionEngine`] operations.
///
/// Failures that happen *inside* a run (publishing, deployment, gate
/// rejection, abort) are not returned as errors; they move the run to
/// `Failed` and are reported through [`crate::engine::RunReport`].
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration could not be resolved.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// The stage graph could not be built.
    #[error("{0}")]
    Graph(#[from] GraphError),

    /// The run store failed.
    #[error("{0}")]
    Store(#[from] StoreError),

    /// The trigger named a pipeline the engine does not know.
    #[error("Unknown pipeline: {0}")]
    UnknownPipeline(String),

    /// No run with this id exists.
    #[error("Run not found: {0}")]
    RunNotFound(Uuid),

    /// The pipeline already has an active run and the policy rejects new ones.
    #[error("Pipeline '{pipeline_id}' already has an active run ({active_run})")]
    RunInProgress {
        /// The pipeline identifier.
        pipeline_id: String,
        /// The run currently holding the pipeline.
        active_run: Uuid,
    },

    /// The run is being driven by another caller right now.
    #[error("Run {0} is already being driven")]
    RunBusy(Uuid),

    /// The requested operation is not valid in the run's current state.
    #[error("Run {run_id} cannot {operation} while {state}")]
    InvalidState {
        /// The run.
        run_id: Uuid,
        /// The attempted operation.
        operation: &'static str,
        /// The state the run is in.
        state: String,
    },

    /// A state machine transition was attempted that the machine forbids.
    #[error("Invalid transition for run {run_id}: {from} -> {to}")]
    InvalidTransition {
        /// The run.
        run_id: Uuid,
        /// Source state.
        from: String,
        /// Target state.
        to: String,
    },

    /// Engine settings are inconsistent.
    #[error("Invalid engine settings: {0}")]
    Settings(String),
}

/// Structured metadata attached to errors for diagnostics and reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ErrorInfo {
    /// Error code (e.g., "CONFIG-002-MALFORMED").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ErrorInfo {
    /// Creates a new error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        let code = code.into();
        let fix_hint = ErrorSuggestions::get(&code).map(str::to_string);
        Self {
            code,
            summary: summary.into(),
            fix_hint,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Errors raised while resolving deployment configuration.
///
/// All of these are fatal and happen before any side effect.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Failed to read configuration from {path}: {source}")]
    Io {
        /// The path that was read.
        path: String,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration document is not valid JSON for the expected shape.
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// A required field is absent.
    #[error("Environment '{environment}' is missing required field '{field}'")]
    MissingField {
        /// The environment entry.
        environment: String,
        /// The missing field.
        field: &'static str,
    },

    /// A field is present but malformed.
    #[error("Environment '{environment}' has malformed {field} '{value}': {reason}")]
    Malformed {
        /// The environment entry.
        environment: String,
        /// The malformed field.
        field: &'static str,
        /// The offending value.
        value: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// The organization id used to scope registry access is absent.
    #[error("Organization id is missing or empty")]
    MissingOrganization,

    /// The application name is absent.
    #[error("Application name is missing or empty")]
    MissingAppName,

    /// The stage list names an environment that is not defined.
    #[error("Stage list references unknown environment '{name}'")]
    UnknownEnvironment {
        /// The unknown environment name.
        name: String,
    },

    /// No stages were configured.
    #[error("No stages configured")]
    NoStages,

    /// Two stages target the same (account, region, name) tuple.
    #[error("Duplicate deployment target '{name}' ({account}/{region})")]
    DuplicateTarget {
        /// Environment name.
        name: String,
        /// Account id.
        account: String,
        /// Region id.
        region: String,
    },
}

impl ConfigError {
    /// Returns structured diagnostics for this error.
    #[must_use]
    pub fn error_info(&self) -> ErrorInfo {
        let code = match self {
            Self::Io { .. } | Self::Parse(_) => "CONFIG-001-UNREADABLE",
            Self::MissingField { .. } | Self::MissingOrganization | Self::MissingAppName => {
                "CONFIG-002-MISSING"
            }
            Self::Malformed { .. } => "CONFIG-003-MALFORMED",
            Self::UnknownEnvironment { .. } | Self::NoStages => "CONFIG-004-STAGES",
            Self::DuplicateTarget { .. } => "CONFIG-005-DUPLICATE",
        };
        ErrorInfo::new(code, self.to_string())
    }
}

/// Errors raised while publishing or promoting an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    /// Registry authentication failed. Never retried.
    #[error("Registry authentication failed for {target}: {message}")]
    Auth {
        /// The registry location involved.
        target: String,
        /// Registry-provided detail.
        message: String,
    },

    /// The caller is authenticated but not permitted. Never retried.
    #[error("Registry permission denied for {target}: {message}")]
    Permission {
        /// The registry location involved.
        target: String,
        /// Registry-provided detail.
        message: String,
    },

    /// Transient network failures exhausted the retry budget.
    #[error("Registry unreachable for {target} after {attempts} attempts: {message}")]
    Network {
        /// The registry location involved.
        target: String,
        /// Attempts made.
        attempts: usize,
        /// Last failure detail.
        message: String,
    },

    /// The registry rejected the request for another, non-transient reason.
    #[error("Registry rejected {target}: {message}")]
    Rejected {
        /// The registry location involved.
        target: String,
        /// Registry-provided detail.
        message: String,
    },

    /// Publishing produced a reference other than the one planned for the run.
    #[error("Published reference {actual} does not match planned reference {planned}")]
    ReferenceMismatch {
        /// The reference the stage graph was built with.
        planned: String,
        /// The reference the registry produced.
        actual: String,
    },
}

impl PublishError {
    /// Returns true for failures caused by transient network conditions.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network { .. })
    }

    /// Returns structured diagnostics for this error.
    #[must_use]
    pub fn error_info(&self) -> ErrorInfo {
        let code = match self {
            Self::Auth { .. } => "PUBLISH-001-AUTH",
            Self::Permission { .. } => "PUBLISH-002-PERMISSION",
            Self::Network { .. } => "PUBLISH-003-NETWORK",
            Self::Rejected { .. } => "PUBLISH-004-REJECTED",
            Self::ReferenceMismatch { .. } => "PUBLISH-005-MISMATCH",
        };
        ErrorInfo::new(code, self.to_string())
    }
}

/// Errors raised while building the stage graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// No environments were supplied.
    #[error("Cannot build a pipeline with no stages")]
    NoStages,

    /// Two environments share a stage name.
    #[error("Stage '{stage}' appears more than once")]
    DuplicateStage {
        /// The repeated stage name.
        stage: String,
    },

    /// The gate policy references a stage that does not exist.
    #[error("Gate '{gate}' references unknown stage '{stage}'")]
    UnknownGateStage {
        /// The gate name.
        gate: String,
        /// The stage it was supposed to follow.
        stage: String,
    },

    /// Two gates were requested after the same stage.
    #[error("Stage '{stage}' already has a trailing gate")]
    DuplicateGate {
        /// The stage name.
        stage: String,
    },

    /// Two gates share a name.
    #[error("Gate name '{gate}' is used more than once")]
    DuplicateGateName {
        /// The gate name.
        gate: String,
    },

    /// No artifact reference was supplied for a stage.
    #[error("No artifact reference for stage '{stage}'")]
    MissingArtifact {
        /// The stage name.
        stage: String,
    },
}

impl GraphError {
    /// Returns structured diagnostics for this error.
    #[must_use]
    pub fn error_info(&self) -> ErrorInfo {
        let code = match self {
            Self::NoStages => "GRAPH-001-EMPTY",
            Self::DuplicateStage { .. } => "GRAPH-002-DUPLICATE_STAGE",
            Self::UnknownGateStage { .. } => "GRAPH-003-UNKNOWN_STAGE",
            Self::DuplicateGate { .. } | Self::DuplicateGateName { .. } => "GRAPH-004-DUPLICATE_GATE",
            Self::MissingArtifact { .. } => "GRAPH-005-MISSING_ARTIFACT",
        };
        ErrorInfo::new(code, self.to_string())
    }
}

/// Whether a deployment failure may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentFailureKind {
    /// Retryable infrastructure hiccup (throttling, timeouts).
    Transient,
    /// Definitive, non-recoverable error.
    Fatal,
}

/// A deployment into one stage failed for good.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Deployment to stage '{stage}' (#{index}) failed after {attempts} attempt(s): {message}")]
pub struct DeploymentError {
    /// The stage name.
    pub stage: String,
    /// The stage index.
    pub index: usize,
    /// Transient (budget exhausted) or fatal.
    pub kind: DeploymentFailureKind,
    /// How many deploy calls were made.
    pub attempts: usize,
    /// Last failure detail reported by the adapter.
    pub message: String,
}

impl DeploymentError {
    /// Returns structured diagnostics for this error.
    #[must_use]
    pub fn error_info(&self) -> ErrorInfo {
        let code = match self.kind {
            DeploymentFailureKind::Transient => "DEPLOY-001-RETRY_EXHAUSTED",
            DeploymentFailureKind::Fatal => "DEPLOY-002-FATAL",
        };
        ErrorInfo::new(code, self.to_string())
            .with_context_entry("stage", self.stage.clone())
            .with_context_entry("attempts", self.attempts.to_string())
    }
}

/// Errors raised by a [`crate::store::RunStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem failure.
    #[error("Run store IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored record could not be (de)serialized.
    #[error("Run store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Insert of a run id that already exists.
    #[error("Run {0} already exists")]
    AlreadyExists(Uuid),

    /// Save of a run id that was never inserted.
    #[error("Run {0} does not exist")]
    NotFound(Uuid),
}

/// Provides default remediation hints for error codes.
pub struct ErrorSuggestions;

impl ErrorSuggestions {
    /// Gets a suggestion for a given error code.
    #[must_use]
    pub fn get(code: &str) -> Option<&'static str> {
        match code {
            "CONFIG-002-MISSING" => Some(
                "Every environment needs an account and a region, and the document \
                 needs appName and organization.id.",
            ),
            "CONFIG-003-MALFORMED" => Some(
                "Accounts are 12 digits and regions look like 'us-east-1'.",
            ),
            "CONFIG-005-DUPLICATE" => Some(
                "Each stage must deploy to a distinct target; remove the repeated stage.",
            ),
            "GRAPH-003-UNKNOWN_STAGE" => Some(
                "Gates can only follow stages listed in the stage order. Check for typos.",
            ),
            "PUBLISH-001-AUTH" | "PUBLISH-002-PERMISSION" => Some(
                "Check the publishing account credentials and the repository policy.",
            ),
            "DEPLOY-001-RETRY_EXHAUSTED" => Some(
                "The target kept reporting transient failures; resume the run once it recovers.",
            ),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_info_picks_up_suggestion() {
        let info = ErrorInfo::new("CONFIG-003-MALFORMED", "bad account");
        assert!(info.fix_hint.is_some());

        let info = ErrorInfo::new("UNKNOWN", "whatever");
        assert!(info.fix_hint.is_none());
    }

    #[test]
    fn test_config_error_codes() {
        let err = ConfigError::Malformed {
            environment: "dev".to_string(),
            field: "account",
            value: "abc".to_string(),
            reason: "must be 12 digits".to_string(),
        };
        assert_eq!(err.error_info().code, "CONFIG-003-MALFORMED");
        assert!(err.to_string().contains("dev"));

        assert_eq!(ConfigError::MissingOrganization.error_info().code, "CONFIG-002-MISSING");
    }

    #[test]
    fn test_publish_error_transience() {
        let network = PublishError::Network {
            target: "repo".to_string(),
            attempts: 3,
            message: "timeout".to_string(),
        };
        let auth = PublishError::Auth {
            target: "repo".to_string(),
            message: "expired token".to_string(),
        };

        assert!(network.is_transient());
        assert!(!auth.is_transient());
        assert_eq!(auth.error_info().code, "PUBLISH-001-AUTH");
    }

    #[test]
    fn test_deployment_error_info_context() {
        let err = DeploymentError {
            stage: "test".to_string(),
            index: 1,
            kind: DeploymentFailureKind::Transient,
            attempts: 3,
            message: "throttled".to_string(),
        };

        let info = err.error_info();
        assert_eq!(info.code, "DEPLOY-001-RETRY_EXHAUSTED");
        assert_eq!(info.context.get("stage"), Some(&"test".to_string()));
        assert_eq!(info.context.get("attempts"), Some(&"3".to_string()));
    }

    #[test]
    fn test_graph_error_message() {
        let err = GraphError::UnknownGateStage {
            gate: "PromoteToProd".to_string(),
            stage: "staging".to_string(),
        };
        assert_eq!(err.to_string(), "Gate 'PromoteToProd' references unknown stage 'staging'");
        assert!(err.error_info().fix_hint.is_some());
    }
}
