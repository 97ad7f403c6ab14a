//! Run events emitted on every observable state change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use super::{FailureKind, RunState};

/// An event describing something that happened to a pipeline run.
///
/// Events are consumed by [`crate::events::EventSink`]s for dashboards,
/// logging and tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    /// The event type (e.g., "run.state_changed", "stage.deployed").
    #[serde(rename = "type")]
    pub event_type: String,

    /// The run the event belongs to.
    pub run_id: Uuid,

    /// The pipeline the run belongs to.
    pub pipeline_id: String,

    /// When the event occurred.
    pub timestamp: DateTime<Utc>,

    /// The event payload data.
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
}

impl RunEvent {
    /// Creates a new event.
    #[must_use]
    pub fn new(event_type: impl Into<String>, run_id: Uuid, pipeline_id: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            run_id,
            pipeline_id: pipeline_id.into(),
            timestamp: Utc::now(),
            data: HashMap::new(),
        }
    }

    /// Adds a data field to the event.
    #[must_use]
    pub fn add_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Creates a "run.state_changed" event.
    #[must_use]
    pub fn state_changed(run_id: Uuid, pipeline_id: &str, from: RunState, to: RunState) -> Self {
        Self::new("run.state_changed", run_id, pipeline_id)
            .add_data("from", serde_json::json!(from.to_string()))
            .add_data("to", serde_json::json!(to.to_string()))
    }

    /// Creates a "stage.deploy_started" event.
    #[must_use]
    pub fn deploy_started(run_id: Uuid, pipeline_id: &str, stage: &str, index: usize, attempt: usize) -> Self {
        Self::new("stage.deploy_started", run_id, pipeline_id)
            .add_data("stage", serde_json::json!(stage))
            .add_data("index", serde_json::json!(index))
            .add_data("attempt", serde_json::json!(attempt))
    }

    /// Creates a "stage.deployed" event.
    #[must_use]
    pub fn deployed(run_id: Uuid, pipeline_id: &str, stage: &str, index: usize, duration_ms: f64) -> Self {
        Self::new("stage.deployed", run_id, pipeline_id)
            .add_data("stage", serde_json::json!(stage))
            .add_data("index", serde_json::json!(index))
            .add_data("duration_ms", serde_json::json!(duration_ms))
    }

    /// Creates a "run.failed" event.
    #[must_use]
    pub fn failed(run_id: Uuid, pipeline_id: &str, kind: FailureKind, message: &str) -> Self {
        Self::new("run.failed", run_id, pipeline_id)
            .add_data("kind", serde_json::json!(kind.to_string()))
            .add_data("message", serde_json::json!(message))
    }

    /// Returns the string value of a data field.
    #[must_use]
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(serde_json::Value::as_str)
    }
}
