//! Task state persistence for capstan agents.
//!
//! One contract, three backends: [`MemoryStateStore`] for tests and
//! throwaway runs, [`JsonStateStore`] for inspectable on-disk state,
//! and [`SqliteStateStore`] for single-file durability. All three obey
//! the same [`StateStore`] semantics, checked by the parity suite in
//! `tests/parity.rs`.

mod fs;
mod memory;
mod sqlite;
mod store;
mod types;

pub use fs::JsonStateStore;
pub use memory::MemoryStateStore;
pub use sqlite::SqliteStateStore;
pub use store::{
    StateStore, StateStoreError, StateStoreResult, DEFAULT_MAX_CHECKPOINTS,
};
pub use types::{
    current_timestamp, message_match_score, metadata_similarity, new_task_id, state_content_hash,
    Checkpoint, CheckpointId, FailureReason, InvalidTransition, MessageRecord, MessageRole,
    RelatedTask, SearchHit, TaskId, TaskState, TaskStatus, Timestamp, ToolExecutionRecord,
    ToolOutcomeKind, UserInputRecord,
};
