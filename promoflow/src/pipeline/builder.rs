//! Stage graph builder with gate validation.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use super::graph::{Gate, PipelineGraph, PipelineNode, Stage};
use super::run::PipelineRun;
use crate::core::{ArtifactReference, EnvironmentDescriptor, LocalImage};
use crate::errors::GraphError;

/// One gate request: insert `gate` after the stage named `stage`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateRule {
    /// The predecessor stage name.
    pub stage: String,
    /// The gate name.
    pub gate: String,
}

/// Where approval gates go.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GatePolicy {
    rules: Vec<GateRule>,
}

impl GatePolicy {
    /// Creates an empty policy (no gates).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a gate named `gate` after the stage named `stage`.
    #[must_use]
    pub fn after_stage_named(mut self, stage: impl Into<String>, gate: impl Into<String>) -> Self {
        self.rules.push(GateRule {
            stage: stage.into(),
            gate: gate.into(),
        });
        self
    }

    /// Returns the rules in insertion order.
    #[must_use]
    pub fn rules(&self) -> &[GateRule] {
        &self.rules
    }

    /// Returns the number of requested gates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Returns true if no gates are requested.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Returns the gate name requested after `stage`.
    #[must_use]
    pub fn gate_after(&self, stage: &str) -> Option<&str> {
        self.rules
            .iter()
            .find(|r| r.stage == stage)
            .map(|r| r.gate.as_str())
    }
}

/// Name for a gate configured without one: `PromoteTo<Next>`, or
/// `Approve<Stage>` when it trails the last stage.
#[must_use]
pub fn default_gate_name(stage_names: &[&str], index: usize) -> String {
    match stage_names.get(index + 1) {
        Some(next) => format!("PromoteTo{}", capitalize(next)),
        None => format!(
            "Approve{}",
            capitalize(stage_names.get(index).copied().unwrap_or_default())
        ),
    }
}

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Builds validated promotion graphs.
///
/// ```ignore
/// let graph = StageGraphBuilder::new(config.environments().to_vec())
///     .with_artifacts(plan.targets)
///     .with_gate_policy(config.gate_policy.clone())
///     .build_graph()?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct StageGraphBuilder {
    environments: Vec<EnvironmentDescriptor>,
    artifacts: HashMap<String, ArtifactReference>,
    gate_policy: GatePolicy,
}

impl StageGraphBuilder {
    /// Creates a builder over environments in promotion order.
    #[must_use]
    pub fn new(environments: Vec<EnvironmentDescriptor>) -> Self {
        Self {
            environments,
            ..Self::default()
        }
    }

    /// Sets the reference to deploy for one environment.
    #[must_use]
    pub fn with_artifact(mut self, environment: impl Into<String>, artifact: ArtifactReference) -> Self {
        self.artifacts.insert(environment.into(), artifact);
        self
    }

    /// Sets the references to deploy, keyed by environment name.
    #[must_use]
    pub fn with_artifacts(mut self, artifacts: HashMap<String, ArtifactReference>) -> Self {
        self.artifacts.extend(artifacts);
        self
    }

    /// Sets the gate policy.
    #[must_use]
    pub fn with_gate_policy(mut self, policy: GatePolicy) -> Self {
        self.gate_policy = policy;
        self
    }

    /// Builds the stage/gate graph.
    ///
    /// # Errors
    ///
    /// Returns a [`GraphError`] if there are no environments, if a stage name
    /// repeats, if a gate references an unknown stage or repeats, or if an
    /// environment has no artifact reference.
    pub fn build_graph(&self) -> Result<PipelineGraph, GraphError> {
        if self.environments.is_empty() {
            return Err(GraphError::NoStages);
        }

        let mut names = HashSet::new();
        for env in &self.environments {
            if !names.insert(env.name.as_str()) {
                return Err(GraphError::DuplicateStage {
                    stage: env.name.clone(),
                });
            }
        }

        let mut gates: HashMap<&str, &str> = HashMap::new();
        let mut gate_names = HashSet::new();
        for rule in self.gate_policy.rules() {
            if !names.contains(rule.stage.as_str()) {
                return Err(GraphError::UnknownGateStage {
                    gate: rule.gate.clone(),
                    stage: rule.stage.clone(),
                });
            }
            if gates.contains_key(rule.stage.as_str()) {
                return Err(GraphError::DuplicateGate {
                    stage: rule.stage.clone(),
                });
            }
            if !gate_names.insert(rule.gate.as_str()) {
                return Err(GraphError::DuplicateGateName {
                    gate: rule.gate.clone(),
                });
            }
            gates.insert(rule.stage.as_str(), rule.gate.as_str());
        }

        let mut nodes = Vec::with_capacity(self.environments.len() + gates.len());
        for (index, env) in self.environments.iter().enumerate() {
            let artifact = self
                .artifacts
                .get(&env.name)
                .cloned()
                .ok_or_else(|| GraphError::MissingArtifact {
                    stage: env.name.clone(),
                })?;

            nodes.push(PipelineNode::Stage(Stage {
                index,
                environment: env.clone(),
                artifact,
            }));

            if let Some(gate) = gates.get(env.name.as_str()) {
                nodes.push(PipelineNode::Gate(Gate {
                    name: (*gate).to_string(),
                    after_stage: index,
                }));
            }
        }

        Ok(PipelineGraph::from_nodes(nodes))
    }

    /// Builds a fresh run: the graph, nothing deployed yet, state `Idle`.
    ///
    /// # Errors
    ///
    /// Same as [`Self::build_graph`].
    pub fn build(
        &self,
        pipeline_id: impl Into<String>,
        image: LocalImage,
        source: ArtifactReference,
    ) -> Result<PipelineRun, GraphError> {
        let graph = self.build_graph()?;
        Ok(PipelineRun::new(pipeline_id, image, source, graph))
    }
}
