//! Storage contract for task state and checkpoints.

use crate::types::{
    message_match_score, metadata_similarity, Checkpoint, RelatedTask, SearchHit, TaskState,
    TaskStatus,
};

/// Checkpoints retained per task unless a backend is built with an
/// explicit limit.
pub const DEFAULT_MAX_CHECKPOINTS: usize = 10;

/// Errors surfaced by state store backends.
#[derive(Debug, thiserror::Error)]
pub enum StateStoreError {
    #[error("resource not found: {resource} ({id})")]
    NotFound { resource: &'static str, id: String },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("backend error: {0}")]
    Backend(String),
}

pub type StateStoreResult<T> = Result<T, StateStoreError>;

pub(crate) fn validate_task_id(task_id: &str) -> StateStoreResult<()> {
    if task_id.trim().is_empty() {
        return Err(StateStoreError::InvalidInput(
            "task_id must not be empty".to_string(),
        ));
    }
    Ok(())
}

pub(crate) fn validate_query(query: &str) -> StateStoreResult<()> {
    if query.trim().is_empty() {
        return Err(StateStoreError::InvalidInput(
            "search query must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Shared ranking for `related_tasks`: scores every other task against
/// `current` by metadata similarity, drops zero-similarity entries, and
/// keeps the best `limit`, ties broken by task id.
pub(crate) fn rank_related(
    current: &TaskState,
    others: Vec<TaskState>,
    limit: usize,
) -> Vec<RelatedTask> {
    let mut related: Vec<RelatedTask> = others
        .into_iter()
        .filter(|other| other.task_id != current.task_id)
        .filter_map(|other| {
            let similarity = metadata_similarity(&current.metadata, &other.metadata);
            (similarity > 0.0).then(|| RelatedTask {
                completed: other.status == TaskStatus::Completed,
                task_id: other.task_id,
                description: other.description,
                similarity,
            })
        })
        .collect();
    related.sort_by(|a, b| {
        b.similarity
            .total_cmp(&a.similarity)
            .then_with(|| a.task_id.cmp(&b.task_id))
    });
    related.truncate(limit);
    related
}

/// Shared ranking for `search_history`: scores every stored
/// conversation against `query` and keeps the best `limit` hits, ties
/// broken by task id.
pub(crate) fn rank_search(states: Vec<TaskState>, query: &str, limit: usize) -> Vec<SearchHit> {
    let mut hits: Vec<SearchHit> = states
        .into_iter()
        .filter_map(|state| {
            let score = message_match_score(&state.messages, query);
            (score > 0.0).then(|| SearchHit {
                task_id: state.task_id,
                score,
            })
        })
        .collect();
    hits.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.task_id.cmp(&b.task_id))
    });
    hits.truncate(limit);
    hits
}

/// Persistence backend for task state.
///
/// All backends implement the same contract: `save`/`load` replace and
/// fetch whole task states, and the checkpoint operations maintain a
/// bounded per-task history of deep snapshots. Implementations must be
/// safe to share across async tasks.
#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    /// Fetches the current state of a task, or `None` when the task is
    /// unknown to this store.
    async fn load(&self, task_id: &str) -> StateStoreResult<Option<TaskState>>;

    /// Persists `state` as the current state of its task, replacing any
    /// previous version.
    async fn save(&self, state: &TaskState) -> StateStoreResult<()>;

    /// Snapshots `state` into the task's checkpoint chain and persists
    /// it as the current state in the same operation.
    ///
    /// Assigns the next sequence number, links `parent_id` to the
    /// newest surviving checkpoint, and prunes the oldest entries once
    /// the chain exceeds the store's retention limit.
    async fn create_checkpoint(
        &self,
        state: &TaskState,
        description: &str,
    ) -> StateStoreResult<Checkpoint>;

    /// Replaces the task's current state with the snapshot stored in
    /// `checkpoint_id`, after verifying the snapshot's content hash.
    ///
    /// Returns the restored state. The checkpoint chain itself is left
    /// untouched so the restore can be repeated or undone.
    async fn restore_checkpoint(
        &self,
        task_id: &str,
        checkpoint_id: &str,
    ) -> StateStoreResult<TaskState>;

    /// Lists up to `limit` checkpoints for a task, newest first by
    /// sequence number. Unknown tasks yield an empty list.
    async fn list_checkpoints(&self, task_id: &str, limit: usize)
        -> StateStoreResult<Vec<Checkpoint>>;

    /// Ranks every other stored task by metadata similarity to
    /// `task_id`, highest first, and returns the best `limit` entries.
    /// Unknown tasks yield an empty list.
    async fn related_tasks(&self, task_id: &str, limit: usize)
        -> StateStoreResult<Vec<RelatedTask>>;

    /// Scores every stored task's conversation against `query` and
    /// returns up to `limit` hits, highest score first. Tasks with no
    /// matching message are omitted.
    async fn search_history(&self, query: &str, limit: usize)
        -> StateStoreResult<Vec<SearchHit>>;
}
