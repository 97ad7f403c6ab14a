//! File-backed run store: one JSON document per run.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{sort_oldest_first, RunStore};
use crate::errors::StoreError;
use crate::pipeline::PipelineRun;

/// Stores each run as `<dir>/<run_id>.json`.
///
/// Writes go to a temporary file that is then renamed over the target, so a
/// crash never leaves a half-written record.
#[derive(Debug, Clone)]
pub struct FileRunStore {
    dir: PathBuf,
}

impl FileRunStore {
    /// Opens (creating if needed) a store rooted at `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the directory cannot be created.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    /// Returns the store directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    async fn write(&self, run: &PipelineRun) -> Result<(), StoreError> {
        let path = self.path_for(run.id);
        let tmp_path = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(run)?;
        fs::write(&tmp_path, bytes).await?;
        fs::rename(&tmp_path, &path).await?;
        debug!(run_id = %run.id, state = %run.state, "Run persisted");
        Ok(())
    }
}

#[async_trait]
impl RunStore for FileRunStore {
    async fn insert(&self, run: &PipelineRun) -> Result<(), StoreError> {
        if fs::try_exists(self.path_for(run.id)).await? {
            return Err(StoreError::AlreadyExists(run.id));
        }
        self.write(run).await
    }

    async fn load(&self, id: Uuid) -> Result<Option<PipelineRun>, StoreError> {
        match fs::read(self.path_for(id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, run: &PipelineRun) -> Result<(), StoreError> {
        if !fs::try_exists(self.path_for(run.id)).await? {
            return Err(StoreError::NotFound(run.id));
        }
        self.write(run).await
    }

    async fn list(&self) -> Result<Vec<PipelineRun>, StoreError> {
        let mut runs = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(&path).await?;
            match serde_json::from_slice::<PipelineRun>(&bytes) {
                Ok(run) => runs.push(run),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable run record"),
            }
        }
        sort_oldest_first(&mut runs);
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RunState;
    use crate::testing::fixtures::sample_run;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_runs_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut run = sample_run("hello");

        {
            let store = FileRunStore::open(dir.path()).await.unwrap();
            store.insert(&run).await.unwrap();
            run.transition(RunState::Publishing).unwrap();
            store.save(&run).await.unwrap();
        }

        let store = FileRunStore::open(dir.path()).await.unwrap();
        let loaded = store.load(run.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, RunState::Publishing);
        assert_eq!(loaded.graph, run.graph);
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_insert_and_save_guards() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRunStore::open(dir.path().join("runs")).await.unwrap();
        let run = sample_run("hello");

        assert!(matches!(store.save(&run).await, Err(StoreError::NotFound(_))));
        store.insert(&run).await.unwrap();
        assert!(matches!(store.insert(&run).await, Err(StoreError::AlreadyExists(_))));
        assert!(store.load(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_skips_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRunStore::open(dir.path()).await.unwrap();
        store.insert(&sample_run("hello")).await.unwrap();
        std::fs::write(dir.path().join("notes.txt"), "hi").unwrap();
        std::fs::write(dir.path().join("broken.json"), "{").unwrap();

        assert_eq!(store.list().await.unwrap().len(), 1);
    }
}
