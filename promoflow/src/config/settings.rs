//! Engine tuning knobs.

use serde::{Deserialize, Serialize};

use crate::errors::EngineError;
use crate::pipeline::RetryConfig;

/// What to do with a trigger for a pipeline that already has an active run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyPolicy {
    /// Refuse the trigger with `EngineError::RunInProgress`.
    #[default]
    Reject,
    /// Store the run as queued; it becomes active when the current run ends.
    Queue,
}

/// Where a resumed failed run restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumePolicy {
    /// Continue after the last successfully deployed stage.
    #[default]
    FromCursor,
    /// Republish and redeploy from the first stage.
    Restart,
}

/// Configuration for the promotion engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Per-stage retry budget for transient deployment failures.
    #[serde(default)]
    pub deploy_retry: RetryConfig,
    /// Retry budget for transient registry failures.
    #[serde(default)]
    pub publish_retry: RetryConfig,
    /// Policy for triggers that arrive while a run is active.
    #[serde(default)]
    pub concurrency: ConcurrencyPolicy,
    /// Policy for resuming failed runs.
    #[serde(default)]
    pub resume: ResumePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            deploy_retry: RetryConfig::default(),
            publish_retry: RetryConfig::default(),
            concurrency: ConcurrencyPolicy::default(),
            resume: ResumePolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Creates a new configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the deployment retry configuration.
    #[must_use]
    pub fn with_deploy_retry(mut self, retry: RetryConfig) -> Self {
        self.deploy_retry = retry;
        self
    }

    /// Sets the publish retry configuration.
    #[must_use]
    pub fn with_publish_retry(mut self, retry: RetryConfig) -> Self {
        self.publish_retry = retry;
        self
    }

    /// Sets the concurrency policy.
    #[must_use]
    pub fn with_concurrency(mut self, policy: ConcurrencyPolicy) -> Self {
        self.concurrency = policy;
        self
    }

    /// Sets the resume policy.
    #[must_use]
    pub fn with_resume(mut self, policy: ResumePolicy) -> Self {
        self.resume = policy;
        self
    }

    /// Checks that the settings can drive a run.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Settings`] if either retry budget allows zero
    /// attempts.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.deploy_retry.max_attempts == 0 {
            return Err(EngineError::Settings(
                "deploy_retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.publish_retry.max_attempts == 0 {
            return Err(EngineError::Settings(
                "publish_retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.deploy_retry.max_attempts, 3);
        assert_eq!(config.concurrency, ConcurrencyPolicy::Reject);
        assert_eq!(config.resume, ResumePolicy::FromCursor);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_partial() {
        let config: EngineConfig = serde_json::from_str(
            r#"{"concurrency": "queue", "deploy_retry": {"max_attempts": 5}}"#,
        )
        .unwrap();

        assert_eq!(config.concurrency, ConcurrencyPolicy::Queue);
        assert_eq!(config.deploy_retry.max_attempts, 5);
        assert_eq!(config.publish_retry.max_attempts, 3);
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let config = EngineConfig::new().with_deploy_retry(RetryConfig::new().with_max_attempts(0));
        assert!(matches!(config.validate(), Err(EngineError::Settings(_))));

        let config = EngineConfig::new().with_publish_retry(RetryConfig::new().with_max_attempts(0));
        assert!(matches!(config.validate(), Err(EngineError::Settings(_))));
        assert!(EngineConfig::new().validate().is_ok());
    }
}
