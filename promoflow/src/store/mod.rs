//! Durable storage for pipeline runs.
//!
//! The engine saves a run after every state transition, so a run suspended
//! at a gate is nothing more than a stored record.

mod file;
mod memory;

use async_trait::async_trait;
use uuid::Uuid;

use crate::errors::StoreError;
use crate::pipeline::PipelineRun;

pub use file::FileRunStore;
pub use memory::InMemoryRunStore;

/// Storage for run records.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Stores a new run.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AlreadyExists`] if the id is taken.
    async fn insert(&self, run: &PipelineRun) -> Result<(), StoreError>;

    /// Loads a run, or `None` if it does not exist.
    async fn load(&self, id: Uuid) -> Result<Option<PipelineRun>, StoreError>;

    /// Overwrites an existing run.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the run was never inserted.
    async fn save(&self, run: &PipelineRun) -> Result<(), StoreError>;

    /// Lists every run, oldest first.
    async fn list(&self) -> Result<Vec<PipelineRun>, StoreError>;

    /// Lists the runs of one pipeline, oldest first.
    async fn list_for_pipeline(&self, pipeline_id: &str) -> Result<Vec<PipelineRun>, StoreError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|r| r.pipeline_id == pipeline_id)
            .collect())
    }
}

fn sort_oldest_first(runs: &mut [PipelineRun]) {
    runs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
}
