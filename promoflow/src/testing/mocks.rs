//! Test doubles for the deployment and registry boundaries.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use crate::core::{ArtifactReference, EnvironmentDescriptor, LocalImage};
use crate::deploy::{DeploymentResult, DeploymentTarget};
use crate::publish::{Registry, RegistryFailure, RegistryFailureKind, RepositoryPolicy};

/// One recorded deploy call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployCall {
    /// Monotonic sequence number across all calls.
    pub seq: u64,
    /// Target environment name.
    pub environment: String,
    /// URI of the deployed reference.
    pub artifact_uri: String,
    /// When the call started.
    pub started_at: DateTime<Utc>,
}

/// A deployment target that replays scripted results per environment.
///
/// Unscripted calls succeed. Calls are recorded when they start, so a call
/// cancelled mid-flight is still visible.
#[derive(Debug, Default)]
pub struct ScriptedDeploymentTarget {
    scripts: Mutex<HashMap<String, VecDeque<DeploymentResult>>>,
    fallbacks: Mutex<HashMap<String, DeploymentResult>>,
    delays: Mutex<HashMap<String, Duration>>,
    calls: Mutex<Vec<DeployCall>>,
    seq: AtomicU64,
}

impl ScriptedDeploymentTarget {
    /// Creates a target where every deployment succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues results for the next calls to `environment`.
    #[must_use]
    pub fn with_script(
        self,
        environment: impl Into<String>,
        results: impl IntoIterator<Item = DeploymentResult>,
    ) -> Self {
        self.script(environment, results);
        self
    }

    /// Returns `result` for every call to `environment` once its script is spent.
    #[must_use]
    pub fn with_fallback(self, environment: impl Into<String>, result: DeploymentResult) -> Self {
        self.fallbacks.lock().insert(environment.into(), result);
        self
    }

    /// Makes every call to `environment` take `delay`.
    #[must_use]
    pub fn with_delay(self, environment: impl Into<String>, delay: Duration) -> Self {
        self.delays.lock().insert(environment.into(), delay);
        self
    }

    /// Queues results for the next calls to `environment`.
    pub fn script(
        &self,
        environment: impl Into<String>,
        results: impl IntoIterator<Item = DeploymentResult>,
    ) {
        self.scripts
            .lock()
            .entry(environment.into())
            .or_default()
            .extend(results);
    }

    /// Returns every call in order.
    #[must_use]
    pub fn calls(&self) -> Vec<DeployCall> {
        self.calls.lock().clone()
    }

    /// Returns the environment of each call in order.
    #[must_use]
    pub fn called_environments(&self) -> Vec<String> {
        self.calls.lock().iter().map(|c| c.environment.clone()).collect()
    }

    /// Returns the number of calls made to `environment`.
    #[must_use]
    pub fn call_count(&self, environment: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.environment == environment)
            .count()
    }

    fn next_result(&self, environment: &str) -> DeploymentResult {
        if let Some(result) = self
            .scripts
            .lock()
            .get_mut(environment)
            .and_then(VecDeque::pop_front)
        {
            return result;
        }
        self.fallbacks
            .lock()
            .get(environment)
            .cloned()
            .unwrap_or_else(DeploymentResult::success)
    }
}

#[async_trait]
impl DeploymentTarget for ScriptedDeploymentTarget {
    async fn deploy(
        &self,
        artifact: &ArtifactReference,
        environment: &EnvironmentDescriptor,
    ) -> DeploymentResult {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().push(DeployCall {
            seq,
            environment: environment.name.clone(),
            artifact_uri: artifact.uri(),
            started_at: Utc::now(),
        });

        let delay = self.delays.lock().get(&environment.name).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.next_result(&environment.name)
    }
}

/// A registry held in memory that counts writes.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    repositories: Mutex<HashMap<String, RepositoryPolicy>>,
    images: Mutex<HashMap<String, String>>,
    failures: Mutex<HashMap<String, VecDeque<RegistryFailure>>>,
    pushes: AtomicUsize,
    tags: AtomicUsize,
    copies: AtomicUsize,
}

impl InMemoryRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next call of `operation` ("ensure_repository", "exists",
    /// "push", "tag", "copy") fail with `failure`.
    pub fn fail_next(&self, operation: &str, failure: RegistryFailure) {
        self.failures
            .lock()
            .entry(operation.to_string())
            .or_default()
            .push_back(failure);
    }

    /// Returns true if `reference` resolves.
    #[must_use]
    pub fn contains(&self, reference: &ArtifactReference) -> bool {
        self.images.lock().contains_key(&reference.uri())
    }

    /// Returns the policy applied to the repository holding `reference`.
    #[must_use]
    pub fn policy_for(&self, reference: &ArtifactReference) -> Option<RepositoryPolicy> {
        self.repositories
            .lock()
            .get(&reference.repository_arn())
            .cloned()
    }

    /// Number of pushes.
    #[must_use]
    pub fn push_count(&self) -> usize {
        self.pushes.load(Ordering::SeqCst)
    }

    /// Number of retags.
    #[must_use]
    pub fn tag_count(&self) -> usize {
        self.tags.load(Ordering::SeqCst)
    }

    /// Number of cross-registry copies.
    #[must_use]
    pub fn copy_count(&self) -> usize {
        self.copies.load(Ordering::SeqCst)
    }

    /// Total image writes.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.push_count() + self.tag_count() + self.copy_count()
    }

    fn injected(&self, operation: &str) -> Result<(), RegistryFailure> {
        match self
            .failures
            .lock()
            .get_mut(operation)
            .and_then(VecDeque::pop_front)
        {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }

    fn duplicate(&self, source: &ArtifactReference, target: &ArtifactReference) -> Result<(), RegistryFailure> {
        let mut images = self.images.lock();
        let digest = images.get(&source.uri()).cloned().ok_or_else(|| {
            RegistryFailure::new(RegistryFailureKind::NotFound, format!("{source} not found"))
        })?;
        images.insert(target.uri(), digest);
        Ok(())
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn ensure_repository(
        &self,
        reference: &ArtifactReference,
        policy: &RepositoryPolicy,
    ) -> Result<(), RegistryFailure> {
        self.injected("ensure_repository")?;
        self.repositories
            .lock()
            .insert(reference.repository_arn(), policy.clone());
        Ok(())
    }

    async fn exists(&self, reference: &ArtifactReference) -> Result<bool, RegistryFailure> {
        self.injected("exists")?;
        Ok(self.contains(reference))
    }

    async fn push(&self, image: &LocalImage, target: &ArtifactReference) -> Result<String, RegistryFailure> {
        self.injected("push")?;
        self.images.lock().insert(target.uri(), image.digest.clone());
        self.pushes.fetch_add(1, Ordering::SeqCst);
        Ok(image.digest.clone())
    }

    async fn tag(&self, source: &ArtifactReference, target: &ArtifactReference) -> Result<(), RegistryFailure> {
        self.injected("tag")?;
        self.duplicate(source, target)?;
        self.tags.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn copy(&self, source: &ArtifactReference, target: &ArtifactReference) -> Result<(), RegistryFailure> {
        self.injected("copy")?;
        self.duplicate(source, target)?;
        self.copies.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
