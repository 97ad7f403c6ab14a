//! The promotion graph: an ordered sequence of stage and gate nodes.

use serde::{Deserialize, Serialize};

use crate::core::{ArtifactReference, EnvironmentDescriptor};

/// One environment-targeted deployment step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    /// Position in the promotion order.
    pub index: usize,
    /// The target environment.
    pub environment: EnvironmentDescriptor,
    /// The reference deployed into that environment.
    pub artifact: ArtifactReference,
}

impl Stage {
    /// Returns the stage name (the environment name).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.environment.name
    }
}

/// A named approval checkpoint trailing one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gate {
    /// Gate name, unique within a graph.
    pub name: String,
    /// Index of the predecessor stage.
    pub after_stage: usize,
}

/// An external approval decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateDecision {
    /// Continue the promotion.
    Approve,
    /// Stop the promotion.
    Reject,
}

/// A node of the promotion graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum PipelineNode {
    /// A deployment step.
    Stage(Stage),
    /// An approval checkpoint.
    Gate(Gate),
}

/// A linear graph of stages with optional gates between them.
///
/// Nodes are stored in traversal order; a gate node always directly follows
/// its predecessor stage.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PipelineGraph {
    nodes: Vec<PipelineNode>,
}

impl PipelineGraph {
    pub(crate) fn from_nodes(nodes: Vec<PipelineNode>) -> Self {
        Self { nodes }
    }

    /// Returns every node in traversal order.
    #[must_use]
    pub fn nodes(&self) -> &[PipelineNode] {
        &self.nodes
    }

    /// Iterates over the stages in promotion order.
    pub fn stages(&self) -> impl Iterator<Item = &Stage> {
        self.nodes.iter().filter_map(|node| match node {
            PipelineNode::Stage(stage) => Some(stage),
            PipelineNode::Gate(_) => None,
        })
    }

    /// Iterates over the gates in traversal order.
    pub fn gates(&self) -> impl Iterator<Item = &Gate> {
        self.nodes.iter().filter_map(|node| match node {
            PipelineNode::Gate(gate) => Some(gate),
            PipelineNode::Stage(_) => None,
        })
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages().count()
    }

    /// Returns the number of gates.
    #[must_use]
    pub fn gate_count(&self) -> usize {
        self.gates().count()
    }

    /// Returns the stage at `index`.
    #[must_use]
    pub fn stage(&self, index: usize) -> Option<&Stage> {
        self.stages().find(|s| s.index == index)
    }

    /// Returns the gate trailing the stage at `index`, if any.
    #[must_use]
    pub fn gate_after(&self, index: usize) -> Option<&Gate> {
        self.gates().find(|g| g.after_stage == index)
    }

    /// Looks up a gate by name.
    #[must_use]
    pub fn gate_named(&self, name: &str) -> Option<&Gate> {
        self.gates().find(|g| g.name == name)
    }

    /// Returns the stage names in promotion order.
    #[must_use]
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages().map(Stage::name).collect()
    }
}
