//! In-memory state store used by tests and short-lived runs.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::store::{
    rank_related, rank_search, validate_query, validate_task_id, StateStore, StateStoreError,
    StateStoreResult, DEFAULT_MAX_CHECKPOINTS,
};
use crate::types::{
    current_timestamp, state_content_hash, Checkpoint, RelatedTask, SearchHit, TaskId, TaskState,
};

#[derive(Debug, Default)]
struct StoreState {
    tasks: BTreeMap<TaskId, TaskState>,
    checkpoints: BTreeMap<TaskId, Vec<Checkpoint>>,
}

/// State store backed by process memory. Nothing survives a restart.
#[derive(Clone)]
pub struct MemoryStateStore {
    state: Arc<Mutex<StoreState>>,
    max_checkpoints: usize,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        MemoryStateStore {
            state: Arc::new(Mutex::new(StoreState::default())),
            max_checkpoints: DEFAULT_MAX_CHECKPOINTS,
        }
    }

    /// Overrides the per-task checkpoint retention limit. The limit
    /// must be at least 1.
    pub fn with_max_checkpoints(max_checkpoints: usize) -> StateStoreResult<Self> {
        if max_checkpoints == 0 {
            return Err(StateStoreError::InvalidInput(
                "max_checkpoints must be at least 1".to_string(),
            ));
        }
        Ok(MemoryStateStore {
            state: Arc::new(Mutex::new(StoreState::default())),
            max_checkpoints,
        })
    }

    fn lock(&self) -> StateStoreResult<std::sync::MutexGuard<'_, StoreState>> {
        self.state
            .lock()
            .map_err(|_| StateStoreError::Backend("memory state store mutex poisoned".to_string()))
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, task_id: &str) -> StateStoreResult<Option<TaskState>> {
        validate_task_id(task_id)?;
        let guard = self.lock()?;
        Ok(guard.tasks.get(task_id).cloned())
    }

    async fn save(&self, state: &TaskState) -> StateStoreResult<()> {
        validate_task_id(&state.task_id)?;
        let mut guard = self.lock()?;
        guard.tasks.insert(state.task_id.clone(), state.clone());
        Ok(())
    }

    async fn create_checkpoint(
        &self,
        state: &TaskState,
        description: &str,
    ) -> StateStoreResult<Checkpoint> {
        validate_task_id(&state.task_id)?;
        let state_hash = state_content_hash(state)
            .map_err(|err| StateStoreError::Serialization(format!("hash task state failed: {err}")))?;

        let mut guard = self.lock()?;
        guard.tasks.insert(state.task_id.clone(), state.clone());

        let chain = guard.checkpoints.entry(state.task_id.clone()).or_default();
        let sequence_no = chain.last().map(|c| c.sequence_no + 1).unwrap_or(1);
        let parent_id = chain.last().map(|c| c.checkpoint_id.clone());
        let checkpoint = Checkpoint {
            checkpoint_id: Checkpoint::id_for(&state.task_id, sequence_no),
            task_id: state.task_id.clone(),
            sequence_no,
            timestamp: current_timestamp(),
            description: description.to_string(),
            parent_id,
            state: state.clone(),
            state_hash,
        };
        chain.push(checkpoint.clone());
        let excess = chain.len().saturating_sub(self.max_checkpoints);
        if excess > 0 {
            chain.drain(..excess);
        }
        Ok(checkpoint)
    }

    async fn restore_checkpoint(
        &self,
        task_id: &str,
        checkpoint_id: &str,
    ) -> StateStoreResult<TaskState> {
        validate_task_id(task_id)?;
        let mut guard = self.lock()?;
        let checkpoint = guard
            .checkpoints
            .get(task_id)
            .and_then(|chain| chain.iter().find(|c| c.checkpoint_id == checkpoint_id))
            .cloned()
            .ok_or_else(|| StateStoreError::NotFound {
                resource: "checkpoint",
                id: checkpoint_id.to_string(),
            })?;
        if !checkpoint.verify_integrity() {
            return Err(StateStoreError::Backend(format!(
                "checkpoint {checkpoint_id} failed integrity check"
            )));
        }
        guard
            .tasks
            .insert(task_id.to_string(), checkpoint.state.clone());
        Ok(checkpoint.state)
    }

    async fn list_checkpoints(
        &self,
        task_id: &str,
        limit: usize,
    ) -> StateStoreResult<Vec<Checkpoint>> {
        validate_task_id(task_id)?;
        let guard = self.lock()?;
        let Some(chain) = guard.checkpoints.get(task_id) else {
            return Ok(Vec::new());
        };
        Ok(chain.iter().rev().take(limit).cloned().collect())
    }

    async fn related_tasks(
        &self,
        task_id: &str,
        limit: usize,
    ) -> StateStoreResult<Vec<RelatedTask>> {
        validate_task_id(task_id)?;
        let guard = self.lock()?;
        let Some(current) = guard.tasks.get(task_id) else {
            return Ok(Vec::new());
        };
        Ok(rank_related(
            current,
            guard.tasks.values().cloned().collect(),
            limit,
        ))
    }

    async fn search_history(&self, query: &str, limit: usize) -> StateStoreResult<Vec<SearchHit>> {
        validate_query(query)?;
        let guard = self.lock()?;
        Ok(rank_search(
            guard.tasks.values().cloned().collect(),
            query,
            limit,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "current_thread")]
    async fn save_then_load_returns_latest_state() {
        let store = MemoryStateStore::new();
        let mut state = TaskState::new("memory demo");
        store.save(&state).await.expect("save should succeed");

        state.push_message(crate::types::MessageRole::User, "updated");
        store.save(&state).await.expect("resave should succeed");

        let loaded = store
            .load(&state.task_id)
            .await
            .expect("load should succeed")
            .expect("saved task should be present");
        assert_eq!(loaded, state);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn empty_task_id_is_rejected() {
        let store = MemoryStateStore::new();
        let err = store.load("  ").await.expect_err("blank id should fail");
        assert!(matches!(err, StateStoreError::InvalidInput(_)));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn checkpoint_chain_prunes_oldest_but_keeps_sequence() {
        let store =
            MemoryStateStore::with_max_checkpoints(2).expect("limit of 2 should be accepted");
        let state = TaskState::new("pruning demo");
        for i in 1..=4u64 {
            let checkpoint = store
                .create_checkpoint(&state, &format!("step {i}"))
                .await
                .expect("checkpoint should be created");
            assert_eq!(checkpoint.sequence_no, i);
        }

        let listed = store
            .list_checkpoints(&state.task_id, 10)
            .await
            .expect("list should succeed");
        let sequences: Vec<u64> = listed.iter().map(|c| c.sequence_no).collect();
        assert_eq!(sequences, vec![4, 3]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn zero_retention_limit_is_rejected() {
        let err = MemoryStateStore::with_max_checkpoints(0)
            .err()
            .expect("limit of 0 should be rejected");
        assert!(matches!(err, StateStoreError::InvalidInput(_)));
    }
}
