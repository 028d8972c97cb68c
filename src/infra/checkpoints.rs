//! Checkpoints on the local filesystem, one JSON document per paused run.
//! Saves go through a temp file and rename so a crash mid-write never
//! leaves a half checkpoint behind.

use crate::app::ports::CheckpointStore;
use crate::common::error::{PipelineError, Result};
use crate::pipeline::state::PipelineState;
use async_trait::async_trait;
use std::fs;
use std::path::PathBuf;
use uuid::Uuid;

pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, run_id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", run_id))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, state: &PipelineState) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let body = serde_json::to_vec_pretty(state)?;
        let final_path = self.path_for(state.run_id);
        let tmp_path = final_path.with_extension("json.tmp");
        fs::write(&tmp_path, body)?;
        fs::rename(&tmp_path, &final_path)?;
        Ok(())
    }

    async fn load(&self, run_id: Uuid) -> Result<PipelineState> {
        let path = self.path_for(run_id);
        if !path.exists() {
            return Err(PipelineError::Checkpoint {
                message: format!("no checkpoint found for run {}", run_id),
            });
        }
        let body = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn discard(&self, run_id: Uuid) -> Result<()> {
        match fs::remove_file(self.path_for(run_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::state::{PipelinePhase, PipelineState};
    use std::path::PathBuf;

    fn sample_state() -> PipelineState {
        let mut state = PipelineState::new(PathBuf::from("movimientos.csv"), "acme", "main");
        state.advance(PipelinePhase::ClassificationReview);
        state
    }

    #[tokio::test]
    async fn checkpoint_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        let state = sample_state();

        store.save(&state).await.unwrap();
        let restored = store.load(state.run_id).await.unwrap();

        assert_eq!(restored.run_id, state.run_id);
        assert_eq!(restored.phase, PipelinePhase::ClassificationReview);
        assert_eq!(restored.tenant, "acme");

        // No temp file left behind
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .filter(|name| name.ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn missing_checkpoint_is_a_checkpoint_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());

        let err = store.load(uuid::Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Checkpoint { .. }));
    }

    #[tokio::test]
    async fn discard_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        let state = sample_state();

        store.save(&state).await.unwrap();
        store.discard(state.run_id).await.unwrap();
        store.discard(state.run_id).await.unwrap();
        assert!(store.load(state.run_id).await.is_err());
    }
}
