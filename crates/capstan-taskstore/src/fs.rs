//! Filesystem-backed state store.
//!
//! Layout under the root directory:
//!
//! ```text
//! root/
//!   states/{task_id}.json
//!   checkpoints/{task_id}/{sequence_no}.json
//! ```
//!
//! Writes go through an exclusively-created temp file followed by an
//! atomic rename, so readers never observe a half-written record and a
//! second writer racing on the same task surfaces as a `Conflict`.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use crate::store::{
    rank_related, rank_search, validate_query, validate_task_id, StateStore, StateStoreError,
    StateStoreResult, DEFAULT_MAX_CHECKPOINTS,
};
use crate::types::{
    current_timestamp, state_content_hash, Checkpoint, RelatedTask, SearchHit, TaskState,
};

/// State store persisted as pretty-printed JSON files, one per task
/// state and one per checkpoint.
pub struct JsonStateStore {
    states_dir: PathBuf,
    checkpoints_dir: PathBuf,
    max_checkpoints: usize,
}

impl JsonStateStore {
    /// Opens a store rooted at `root`, creating the directory layout if
    /// needed. Leftover temp files from a crashed writer are removed.
    pub fn new(root: impl AsRef<Path>) -> StateStoreResult<Self> {
        Self::with_max_checkpoints(root, DEFAULT_MAX_CHECKPOINTS)
    }

    /// Opens a store with an explicit checkpoint retention limit. The
    /// limit must be at least 1.
    pub fn with_max_checkpoints(
        root: impl AsRef<Path>,
        max_checkpoints: usize,
    ) -> StateStoreResult<Self> {
        if max_checkpoints == 0 {
            return Err(StateStoreError::InvalidInput(
                "max_checkpoints must be at least 1".to_string(),
            ));
        }
        let root = root.as_ref().to_path_buf();
        let states_dir = root.join("states");
        let checkpoints_dir = root.join("checkpoints");
        for dir in [&states_dir, &checkpoints_dir] {
            fs::create_dir_all(dir).map_err(|err| {
                StateStoreError::Backend(format!("create store dir failed: {err}"))
            })?;
        }
        sweep_stale_temp_files(&states_dir)?;
        sweep_stale_temp_files(&checkpoints_dir)?;
        Ok(JsonStateStore {
            states_dir,
            checkpoints_dir,
            max_checkpoints,
        })
    }

    fn state_path(&self, task_id: &str) -> PathBuf {
        self.states_dir.join(format!("{task_id}.json"))
    }

    fn task_checkpoint_dir(&self, task_id: &str) -> PathBuf {
        self.checkpoints_dir.join(task_id)
    }

    fn checkpoint_path(&self, task_id: &str, sequence_no: u64) -> PathBuf {
        self.task_checkpoint_dir(task_id)
            .join(format!("{sequence_no}.json"))
    }

    fn write_json<T: serde::Serialize>(&self, path: &Path, value: &T) -> StateStoreResult<()> {
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|err| StateStoreError::Serialization(format!("encode record failed: {err}")))?;
        let tmp = path.with_extension("json.tmp");
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp)
            .map_err(|err| {
                if err.kind() == std::io::ErrorKind::AlreadyExists {
                    StateStoreError::Conflict(format!(
                        "concurrent write in progress for {}",
                        path.display()
                    ))
                } else {
                    StateStoreError::Backend(format!("create temp file failed: {err}"))
                }
            })?;
        if let Err(err) = file.write_all(&bytes) {
            drop(file);
            let _ = fs::remove_file(&tmp);
            return Err(StateStoreError::Backend(format!(
                "write temp file failed: {err}"
            )));
        }
        drop(file);
        if let Err(err) = fs::rename(&tmp, path) {
            let _ = fs::remove_file(&tmp);
            return Err(StateStoreError::Backend(format!(
                "replace record file failed: {err}"
            )));
        }
        Ok(())
    }

    fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> StateStoreResult<Option<T>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(StateStoreError::Backend(format!(
                    "read record file failed: {err}"
                )));
            }
        };
        let value = serde_json::from_slice(&bytes)
            .map_err(|err| StateStoreError::Serialization(format!("decode record failed: {err}")))?;
        Ok(Some(value))
    }

    /// Sequence numbers of stored checkpoints for a task, oldest first.
    fn checkpoint_sequences(&self, task_id: &str) -> StateStoreResult<Vec<u64>> {
        let dir = self.task_checkpoint_dir(task_id);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(StateStoreError::Backend(format!(
                    "read checkpoint dir failed: {err}"
                )));
            }
        };
        let mut sequences = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| {
                StateStoreError::Backend(format!("read checkpoint dir failed: {err}"))
            })?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            if let Ok(sequence_no) = stem.parse::<u64>() {
                sequences.push(sequence_no);
            }
        }
        sequences.sort_unstable();
        Ok(sequences)
    }

    /// Reads every task state under the states directory.
    fn all_states(&self) -> StateStoreResult<Vec<TaskState>> {
        let entries = fs::read_dir(&self.states_dir)
            .map_err(|err| StateStoreError::Backend(format!("read states dir failed: {err}")))?;
        let mut states = Vec::new();
        for entry in entries {
            let entry = entry
                .map_err(|err| StateStoreError::Backend(format!("read states dir failed: {err}")))?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(state) = Self::read_json::<TaskState>(&path)? {
                states.push(state);
            }
        }
        Ok(states)
    }
}

/// Task ids become file names here, so path fragments are rejected.
fn checked_task_id(task_id: &str) -> StateStoreResult<&str> {
    validate_task_id(task_id)?;
    if task_id.contains(['/', '\\']) || task_id.contains("..") {
        return Err(StateStoreError::InvalidInput(
            "task_id must not contain path fragments".to_string(),
        ));
    }
    Ok(task_id)
}

fn sweep_stale_temp_files(dir: &Path) -> StateStoreResult<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => {
            return Err(StateStoreError::Backend(format!(
                "read store dir failed: {err}"
            )));
        }
    };
    for entry in entries {
        let entry = entry
            .map_err(|err| StateStoreError::Backend(format!("read store dir failed: {err}")))?;
        let path = entry.path();
        if path.is_dir() {
            sweep_stale_temp_files(&path)?;
        } else if path.extension().and_then(|ext| ext.to_str()) == Some("tmp") {
            fs::remove_file(&path).map_err(|err| {
                StateStoreError::Backend(format!("remove stale temp file failed: {err}"))
            })?;
        }
    }
    Ok(())
}

#[async_trait::async_trait]
impl StateStore for JsonStateStore {
    async fn load(&self, task_id: &str) -> StateStoreResult<Option<TaskState>> {
        let task_id = checked_task_id(task_id)?;
        Self::read_json(&self.state_path(task_id))
    }

    async fn save(&self, state: &TaskState) -> StateStoreResult<()> {
        let task_id = checked_task_id(&state.task_id)?;
        self.write_json(&self.state_path(task_id), state)
    }

    async fn create_checkpoint(
        &self,
        state: &TaskState,
        description: &str,
    ) -> StateStoreResult<Checkpoint> {
        let task_id = checked_task_id(&state.task_id)?;
        let state_hash = state_content_hash(state)
            .map_err(|err| StateStoreError::Serialization(format!("hash task state failed: {err}")))?;

        self.write_json(&self.state_path(task_id), state)?;

        let dir = self.task_checkpoint_dir(task_id);
        fs::create_dir_all(&dir).map_err(|err| {
            StateStoreError::Backend(format!("create checkpoint dir failed: {err}"))
        })?;

        let sequences = self.checkpoint_sequences(task_id)?;
        let sequence_no = sequences.last().map(|s| s + 1).unwrap_or(1);
        let parent_id = sequences.last().map(|s| Checkpoint::id_for(task_id, *s));
        let checkpoint = Checkpoint {
            checkpoint_id: Checkpoint::id_for(task_id, sequence_no),
            task_id: task_id.to_string(),
            sequence_no,
            timestamp: current_timestamp(),
            description: description.to_string(),
            parent_id,
            state: state.clone(),
            state_hash,
        };
        self.write_json(&self.checkpoint_path(task_id, sequence_no), &checkpoint)?;

        let mut retained = sequences;
        retained.push(sequence_no);
        while retained.len() > self.max_checkpoints {
            let oldest = retained.remove(0);
            match fs::remove_file(self.checkpoint_path(task_id, oldest)) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(StateStoreError::Backend(format!(
                        "prune checkpoint failed: {err}"
                    )));
                }
            }
        }
        Ok(checkpoint)
    }

    async fn restore_checkpoint(
        &self,
        task_id: &str,
        checkpoint_id: &str,
    ) -> StateStoreResult<TaskState> {
        let task_id = checked_task_id(task_id)?;
        let not_found = || StateStoreError::NotFound {
            resource: "checkpoint",
            id: checkpoint_id.to_string(),
        };

        let Some((id_task, sequence)) = checkpoint_id.rsplit_once('_') else {
            return Err(not_found());
        };
        if id_task != task_id {
            return Err(not_found());
        }
        let Ok(sequence_no) = sequence.parse::<u64>() else {
            return Err(not_found());
        };

        let checkpoint: Checkpoint =
            Self::read_json(&self.checkpoint_path(task_id, sequence_no))?.ok_or_else(not_found)?;
        if checkpoint.checkpoint_id != checkpoint_id || checkpoint.task_id != task_id {
            return Err(not_found());
        }
        if !checkpoint.verify_integrity() {
            return Err(StateStoreError::Backend(format!(
                "checkpoint {checkpoint_id} failed integrity check"
            )));
        }

        self.write_json(&self.state_path(task_id), &checkpoint.state)?;
        Ok(checkpoint.state)
    }

    async fn list_checkpoints(
        &self,
        task_id: &str,
        limit: usize,
    ) -> StateStoreResult<Vec<Checkpoint>> {
        let task_id = checked_task_id(task_id)?;
        let sequences = self.checkpoint_sequences(task_id)?;
        let mut checkpoints = Vec::new();
        for sequence_no in sequences.iter().rev().take(limit) {
            let Some(checkpoint) =
                Self::read_json::<Checkpoint>(&self.checkpoint_path(task_id, *sequence_no))?
            else {
                continue;
            };
            checkpoints.push(checkpoint);
        }
        Ok(checkpoints)
    }

    async fn related_tasks(
        &self,
        task_id: &str,
        limit: usize,
    ) -> StateStoreResult<Vec<RelatedTask>> {
        let task_id = checked_task_id(task_id)?;
        let Some(current) = Self::read_json::<TaskState>(&self.state_path(task_id))? else {
            return Ok(Vec::new());
        };
        Ok(rank_related(&current, self.all_states()?, limit))
    }

    async fn search_history(&self, query: &str, limit: usize) -> StateStoreResult<Vec<SearchHit>> {
        validate_query(query)?;
        Ok(rank_search(self.all_states()?, query, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessageRole;

    #[tokio::test(flavor = "current_thread")]
    async fn states_and_checkpoints_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir should be created");

        let mut state = TaskState::new("persistent demo");
        state.push_message(MessageRole::User, "before restart");
        {
            let store = JsonStateStore::new(dir.path()).expect("store should open");
            store.save(&state).await.expect("save should succeed");
            store
                .create_checkpoint(&state, "before restart")
                .await
                .expect("checkpoint should be created");
        }

        let reopened = JsonStateStore::new(dir.path()).expect("store should reopen");
        let loaded = reopened
            .load(&state.task_id)
            .await
            .expect("load should succeed")
            .expect("saved task should be present");
        assert_eq!(loaded, state);

        let checkpoints = reopened
            .list_checkpoints(&state.task_id, 10)
            .await
            .expect("list should succeed");
        assert_eq!(checkpoints.len(), 1);
        assert_eq!(checkpoints[0].sequence_no, 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn stale_temp_files_are_swept_on_open() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let state = TaskState::new("sweep demo");

        {
            let store = JsonStateStore::new(dir.path()).expect("store should open");
            store.save(&state).await.expect("save should succeed");
        }
        let stale = dir
            .path()
            .join("states")
            .join(format!("{}.json.tmp", state.task_id));
        fs::write(&stale, b"{").expect("stale temp file should be written");

        let reopened = JsonStateStore::new(dir.path()).expect("store should reopen");
        assert!(!stale.exists(), "reopen should sweep stale temp files");
        reopened
            .save(&state)
            .await
            .expect("save should succeed after sweep");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn leftover_temp_file_surfaces_as_conflict() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let store = JsonStateStore::new(dir.path()).expect("store should open");
        let state = TaskState::new("conflict demo");

        let marker = dir
            .path()
            .join("states")
            .join(format!("{}.json.tmp", state.task_id));
        fs::write(&marker, b"partial").expect("marker should be written");

        let err = store
            .save(&state)
            .await
            .expect_err("save should refuse to race another writer");
        assert!(matches!(err, StateStoreError::Conflict(_)));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn task_id_with_path_fragment_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let store = JsonStateStore::new(dir.path()).expect("store should open");

        let err = store
            .load("../escape")
            .await
            .expect_err("path fragment should be rejected");
        assert!(matches!(err, StateStoreError::InvalidInput(_)));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn tampered_checkpoint_fails_restore() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let store = JsonStateStore::new(dir.path()).expect("store should open");
        let state = TaskState::new("tamper demo");

        let checkpoint = store
            .create_checkpoint(&state, "clean snapshot")
            .await
            .expect("checkpoint should be created");

        let path = dir
            .path()
            .join("checkpoints")
            .join(&state.task_id)
            .join("1.json");
        let mut stored: Checkpoint = serde_json::from_slice(
            &fs::read(&path).expect("checkpoint file should be readable"),
        )
        .expect("checkpoint file should decode");
        stored.state.description = "rewritten".to_string();
        fs::write(&path, serde_json::to_vec_pretty(&stored).expect("checkpoint should encode"))
            .expect("checkpoint file should be rewritten");

        let err = store
            .restore_checkpoint(&state.task_id, &checkpoint.checkpoint_id)
            .await
            .expect_err("tampered checkpoint should fail integrity check");
        assert!(matches!(err, StateStoreError::Backend(_)));
    }
}
