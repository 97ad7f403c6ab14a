//! Artifact Publisher: build once, then retag or copy per target.

use dashmap::DashMap;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::registry::{Registry, RegistryFailure, RepositoryPolicy};
use crate::config::ResolvedConfig;
use crate::core::{ArtifactReference, EnvironmentDescriptor, LocalImage, ReferenceKind};
use crate::errors::PublishError;
use crate::pipeline::{retry_transient, RetryConfig};

/// References a run will deploy, computed before anything is published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishPlan {
    /// The canonical reference in the home registry.
    pub source: ArtifactReference,
    /// Per-environment references, keyed by environment name.
    pub targets: HashMap<String, ArtifactReference>,
}

/// Publishes a build to the canonical registry and fans it out per target.
///
/// Cloning is cheap; clones share the promotion cache.
#[derive(Clone)]
pub struct ArtifactPublisher {
    registry: Arc<dyn Registry>,
    home: EnvironmentDescriptor,
    repository: String,
    policy: RepositoryPolicy,
    retry: RetryConfig,
    promoted: Arc<DashMap<(String, EnvironmentDescriptor), ArtifactReference>>,
}

impl std::fmt::Debug for ArtifactPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactPublisher")
            .field("home", &self.home)
            .field("repository", &self.repository)
            .field("promoted", &self.promoted.len())
            .finish_non_exhaustive()
    }
}

impl ArtifactPublisher {
    /// Creates a publisher for the application described by `config`.
    #[must_use]
    pub fn new(registry: Arc<dyn Registry>, config: &ResolvedConfig) -> Self {
        Self {
            registry,
            home: config.tools.clone(),
            repository: config.repository.clone(),
            policy: RepositoryPolicy::organization_pull(config.organization_id.clone()),
            retry: RetryConfig::default(),
            promoted: Arc::new(DashMap::new()),
        }
    }

    /// Sets the retry budget for transient registry failures.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Returns the access policy applied to the canonical repository.
    #[must_use]
    pub fn policy(&self) -> &RepositoryPolicy {
        &self.policy
    }

    /// Canonical reference for `image` in the home registry.
    #[must_use]
    pub fn source_reference(&self, image: &LocalImage) -> ArtifactReference {
        ArtifactReference {
            registry: self.home.registry_host(),
            repository: self.repository.clone(),
            tag: image.tag.clone(),
            account: self.home.account.clone(),
            region: self.home.region.clone(),
            digest: image.digest.clone(),
            kind: ReferenceKind::Source,
        }
    }

    /// Reference `source` resolves to inside `target`.
    ///
    /// A target sharing the home account and region gets a retag on the
    /// canonical repository; any other target gets a copy in its own registry.
    #[must_use]
    pub fn target_reference(
        &self,
        source: &ArtifactReference,
        target: &EnvironmentDescriptor,
    ) -> ArtifactReference {
        if target.account == source.account && target.region == source.region {
            ArtifactReference {
                tag: format!("{}-{}", source.tag, target.name),
                kind: ReferenceKind::Retag { from: source.uri() },
                ..source.clone()
            }
        } else {
            ArtifactReference {
                registry: target.registry_host(),
                account: target.account.clone(),
                region: target.region.clone(),
                kind: ReferenceKind::Copy { from: source.uri() },
                ..source.clone()
            }
        }
    }

    /// Computes every reference a run over `environments` will use, without
    /// side effects.
    #[must_use]
    pub fn plan(&self, image: &LocalImage, environments: &[EnvironmentDescriptor]) -> PublishPlan {
        let source = self.source_reference(image);
        let targets = environments
            .iter()
            .map(|env| (env.name.clone(), self.target_reference(&source, env)))
            .collect();
        PublishPlan { source, targets }
    }

    /// Publishes `image` to the canonical repository.
    ///
    /// Ensures the repository exists with the organization pull policy, then
    /// pushes unless the reference already resolves.
    ///
    /// # Errors
    ///
    /// Returns a [`PublishError`]. Transient failures are retried first.
    pub async fn publish(&self, image: &LocalImage) -> Result<ArtifactReference, PublishError> {
        let source = self.source_reference(image);
        let target = source.uri();

        self.call(&source.repository_arn(), || {
            self.registry.ensure_repository(&source, &self.policy)
        })
        .await?;

        if self.call(&target, || self.registry.exists(&source)).await? {
            debug!(reference = %target, "Source reference already published");
            return Ok(source);
        }

        let digest = self.call(&target, || self.registry.push(image, &source)).await?;
        if digest != source.digest {
            return Err(PublishError::ReferenceMismatch {
                planned: format!("{}@{}", target, source.digest),
                actual: format!("{target}@{digest}"),
            });
        }

        info!(reference = %target, digest = %digest, "Published source artifact");
        Ok(source)
    }

    /// Creates the reference `source` resolves to inside `target`.
    ///
    /// Idempotent: repeated calls for the same pair return the same reference
    /// and never write to the registry twice.
    ///
    /// # Errors
    ///
    /// Returns a [`PublishError`]. Transient failures are retried first.
    pub async fn promote(
        &self,
        source: &ArtifactReference,
        target: &EnvironmentDescriptor,
    ) -> Result<ArtifactReference, PublishError> {
        let key = (source.uri(), target.clone());
        if let Some(existing) = self.promoted.get(&key) {
            return Ok(existing.clone());
        }

        let reference = self.target_reference(source, target);
        let uri = reference.uri();

        if self.call(&uri, || self.registry.exists(&reference)).await? {
            debug!(reference = %uri, environment = %target.name, "Target reference already exists");
        } else {
            match &reference.kind {
                ReferenceKind::Retag { .. } => {
                    self.call(&uri, || self.registry.tag(source, &reference)).await?;
                }
                ReferenceKind::Copy { .. } => {
                    self.call(&uri, || self.registry.copy(source, &reference)).await?;
                }
                ReferenceKind::Source => {}
            }
            info!(
                reference = %uri,
                environment = %target.name,
                "Promoted artifact to target"
            );
        }

        self.promoted.insert(key, reference.clone());
        Ok(reference)
    }

    async fn call<T, F, Fut>(&self, target: &str, operation: F) -> Result<T, PublishError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RegistryFailure>>,
    {
        let outcome = retry_transient(&self.retry, target, RegistryFailure::is_transient, operation).await;
        outcome.result.map_err(|e| {
            warn!(target, attempts = outcome.attempts, error = %e, "Registry call failed");
            e.into_publish_error(target, outcome.attempts)
        })
    }
}
