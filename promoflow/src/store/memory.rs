//! In-process run store.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

use super::{sort_oldest_first, RunStore};
use crate::errors::StoreError;
use crate::pipeline::PipelineRun;

/// Keeps runs in memory. Nothing survives the process.
#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    runs: RwLock<HashMap<Uuid, PipelineRun>>,
}

impl InMemoryRunStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored runs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.runs.read().len()
    }

    /// Returns true if no runs are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.runs.read().is_empty()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn insert(&self, run: &PipelineRun) -> Result<(), StoreError> {
        let mut runs = self.runs.write();
        if runs.contains_key(&run.id) {
            return Err(StoreError::AlreadyExists(run.id));
        }
        runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<Option<PipelineRun>, StoreError> {
        Ok(self.runs.read().get(&id).cloned())
    }

    async fn save(&self, run: &PipelineRun) -> Result<(), StoreError> {
        let mut runs = self.runs.write();
        match runs.get_mut(&run.id) {
            Some(slot) => {
                *slot = run.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(run.id)),
        }
    }

    async fn list(&self) -> Result<Vec<PipelineRun>, StoreError> {
        let mut runs: Vec<PipelineRun> = self.runs.read().values().cloned().collect();
        sort_oldest_first(&mut runs);
        Ok(runs)
    }
}
