//! Shared fixtures: the dev/test/prod configuration and ready-made runs.

use std::sync::Arc;

use crate::config::{ConfigResolver, EngineConfig, ResolvedConfig};
use crate::core::LocalImage;
use crate::pipeline::{JitterStrategy, PipelineRun, RetryConfig, StageGraphBuilder};
use crate::publish::ArtifactPublisher;

use super::InMemoryRegistry;

/// Three environments in three accounts, prod in another region, and a
/// `PromoteToProd` gate after test.
pub const THREE_STAGE_CONFIG: &str = r#"{
  "appName": "HelloEcs",
  "organization": { "id": "o-abc123" },
  "env": {
    "tools": { "account": "111111111111", "region": "us-east-1" },
    "dev":   { "account": "222222222222", "region": "us-east-1" },
    "test":  { "account": "333333333333", "region": "us-east-1",
               "approvalRequired": true, "gateName": "PromoteToProd" },
    "prod":  { "account": "444444444444", "region": "us-west-2" }
  },
  "stages": ["dev", "test", "prod"]
}"#;

/// The resolved [`THREE_STAGE_CONFIG`].
///
/// # Panics
///
/// Never in practice; the fixture is valid.
#[must_use]
pub fn three_stage_config() -> ResolvedConfig {
    ConfigResolver::from_json_str(THREE_STAGE_CONFIG)
        .resolve()
        .expect("fixture configuration is valid")
}

/// A local build of the fixture application.
#[must_use]
pub fn local_image() -> LocalImage {
    LocalImage::from_content("helloecs", "build-1", b"build-1")
}

/// Engine settings with millisecond backoff and no jitter.
#[must_use]
pub fn fast_engine_config() -> EngineConfig {
    let retry = RetryConfig::new()
        .with_base_delay_ms(1)
        .with_max_delay_ms(5)
        .with_jitter(JitterStrategy::None);
    EngineConfig::new()
        .with_deploy_retry(retry.clone())
        .with_publish_retry(retry)
}

/// An `Idle` run over the fixture configuration.
///
/// # Panics
///
/// Never in practice; the fixture is valid.
#[must_use]
pub fn sample_run(pipeline_id: &str) -> PipelineRun {
    let config = three_stage_config();
    let publisher = ArtifactPublisher::new(Arc::new(InMemoryRegistry::new()), &config);
    let image = local_image();
    let plan = publisher.plan(&image, config.environments());

    StageGraphBuilder::new(config.environments().to_vec())
        .with_artifacts(plan.targets)
        .with_gate_policy(config.gate_policy.clone())
        .build(pipeline_id, image, plan.source)
        .expect("fixture graph is valid")
}
