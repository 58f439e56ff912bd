//! Shared record types for persisted task state.
//!
//! Everything in this module is plain serializable data. Stores and the
//! agent loop both speak these types, so field changes here ripple across
//! every backend.

use std::collections::BTreeMap;

use serde_json::Value;

/// Identifier of a task. Generated once at task creation.
pub type TaskId = String;

/// Identifier of a checkpoint, `"{task_id}_{sequence_no}"`.
pub type CheckpointId = String;

/// Timestamp in `"{unix_secs}.{millis}Z"` form.
pub type Timestamp = String;

/// Returns the current timestamp as seconds since the epoch with a
/// millisecond suffix.
pub fn current_timestamp() -> Timestamp {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}.{:03}Z", now.as_secs(), now.subsec_millis())
}

/// Generates a fresh task id.
pub fn new_task_id() -> TaskId {
    uuid::Uuid::new_v4().to_string()
}

/// Lifecycle states for a task.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    AwaitingApproval,
    Suspended,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::AwaitingApproval => "awaiting_approval",
            TaskStatus::Suspended => "suspended",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// True once the task can no longer change status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Validates a status transition. Terminal states accept no further
    /// transitions; every live state may fail.
    pub fn can_transition_to(&self, next: &TaskStatus) -> bool {
        if self == next {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Pending, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::AwaitingApproval)
                | (TaskStatus::Running, TaskStatus::Suspended)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
                | (TaskStatus::AwaitingApproval, TaskStatus::Running)
                | (TaskStatus::AwaitingApproval, TaskStatus::Failed)
                | (TaskStatus::Suspended, TaskStatus::Running)
                | (TaskStatus::Suspended, TaskStatus::Failed)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a task ended in `Failed`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Cancelled,
    IterationLimitExceeded,
    ProviderError,
    StorageError,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Cancelled => "cancelled",
            FailureReason::IterationLimitExceeded => "iteration_limit_exceeded",
            FailureReason::ProviderError => "provider_error",
            FailureReason::StorageError => "storage_error",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Author of a conversation message.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        }
    }
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One conversation message, appended in order and never rewritten.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MessageRecord {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: Timestamp,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl MessageRecord {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        MessageRecord {
            role,
            content: content.into(),
            timestamp: current_timestamp(),
            metadata: BTreeMap::new(),
        }
    }
}

/// How a tool execution ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolOutcomeKind {
    /// The tool ran and reported success.
    Success,
    /// The tool ran and reported a domain failure.
    ToolError,
    /// The tool implementation panicked or was otherwise unrunnable.
    Exception,
    /// Approval was denied; the tool never ran.
    Rejected,
}

impl ToolOutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolOutcomeKind::Success => "success",
            ToolOutcomeKind::ToolError => "tool_error",
            ToolOutcomeKind::Exception => "exception",
            ToolOutcomeKind::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for ToolOutcomeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of one tool invocation, including rejected ones.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ToolExecutionRecord {
    pub tool_name: String,
    pub arguments: Value,
    pub result: Value,
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
    pub outcome: ToolOutcomeKind,
}

/// Out-of-band input supplied by the user while a task was suspended.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct UserInputRecord {
    pub content: String,
    pub timestamp: Timestamp,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

/// Error returned when a status change violates the lifecycle rules.
#[derive(Debug, thiserror::Error)]
#[error("invalid status transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: TaskStatus,
    pub to: TaskStatus,
}

/// Full persisted state of one task.
///
/// This is the unit of storage: stores read and write whole `TaskState`
/// values, and checkpoints embed a deep copy of one.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TaskState {
    pub task_id: TaskId,
    pub description: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub messages: Vec<MessageRecord>,
    #[serde(default)]
    pub tool_executions: Vec<ToolExecutionRecord>,
    #[serde(default)]
    pub user_inputs: Vec<UserInputRecord>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    #[serde(default)]
    pub consecutive_auto_approvals: u32,
    #[serde(default)]
    pub failure: Option<FailureReason>,
    pub started_at: Timestamp,
    #[serde(default)]
    pub finished_at: Option<Timestamp>,
}

impl TaskState {
    /// Creates a fresh `Pending` task with a generated id.
    pub fn new(description: impl Into<String>) -> Self {
        TaskState {
            task_id: new_task_id(),
            description: description.into(),
            status: TaskStatus::Pending,
            messages: Vec::new(),
            tool_executions: Vec::new(),
            user_inputs: Vec::new(),
            metadata: BTreeMap::new(),
            consecutive_auto_approvals: 0,
            failure: None,
            started_at: current_timestamp(),
            finished_at: None,
        }
    }

    /// Moves the task to `next`, rejecting transitions the lifecycle
    /// does not allow.
    pub fn transition_to(&mut self, next: TaskStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(&next) {
            return Err(InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn mark_running(&mut self) -> Result<(), InvalidTransition> {
        self.transition_to(TaskStatus::Running)
    }

    pub fn mark_awaiting_approval(&mut self) -> Result<(), InvalidTransition> {
        self.transition_to(TaskStatus::AwaitingApproval)
    }

    pub fn mark_suspended(&mut self) -> Result<(), InvalidTransition> {
        self.transition_to(TaskStatus::Suspended)
    }

    /// Marks the task completed and stamps the finish time.
    pub fn mark_completed(&mut self) -> Result<(), InvalidTransition> {
        self.transition_to(TaskStatus::Completed)?;
        self.finished_at = Some(current_timestamp());
        Ok(())
    }

    /// Marks the task failed with a reason and stamps the finish time.
    pub fn mark_failed(&mut self, reason: FailureReason) -> Result<(), InvalidTransition> {
        self.transition_to(TaskStatus::Failed)?;
        self.failure = Some(reason);
        self.finished_at = Some(current_timestamp());
        Ok(())
    }

    /// Appends a conversation message stamped with the current time.
    pub fn push_message(&mut self, role: MessageRole, content: impl Into<String>) {
        self.messages.push(MessageRecord::new(role, content));
    }

    /// Appends a user input record stamped with the current time.
    pub fn push_user_input(&mut self, content: impl Into<String>, metadata: BTreeMap<String, Value>) {
        self.user_inputs.push(UserInputRecord {
            content: content.into(),
            timestamp: current_timestamp(),
            metadata,
        });
    }

    /// Appends a tool execution record.
    pub fn record_tool_execution(&mut self, record: ToolExecutionRecord) {
        self.tool_executions.push(record);
    }

    /// Merges `updates` into task metadata, last write wins per key.
    pub fn update_metadata(&mut self, updates: BTreeMap<String, Value>) {
        self.metadata.extend(updates);
    }

    pub fn increment_auto_approvals(&mut self) {
        self.consecutive_auto_approvals = self.consecutive_auto_approvals.saturating_add(1);
    }

    pub fn reset_auto_approvals(&mut self) {
        self.consecutive_auto_approvals = 0;
    }
}

/// Content hash of a task state, used to detect checkpoint corruption.
pub fn state_content_hash(state: &TaskState) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(state)?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

/// Similarity of two metadata maps: the share of keys present in both
/// with equal values, over the size of the larger map. 0.0 when either
/// map is empty or nothing matches.
pub fn metadata_similarity(a: &BTreeMap<String, Value>, b: &BTreeMap<String, Value>) -> f64 {
    let larger = a.len().max(b.len());
    if larger == 0 {
        return 0.0;
    }
    let matching = a
        .iter()
        .filter(|(key, value)| b.get(*key) == Some(*value))
        .count();
    matching as f64 / larger as f64
}

/// How strongly a conversation matches `query`: the number of messages
/// whose content contains it, case-insensitive.
pub fn message_match_score(messages: &[MessageRecord], query: &str) -> f64 {
    let needle = query.to_lowercase();
    messages
        .iter()
        .filter(|message| message.content.to_lowercase().contains(&needle))
        .count() as f64
}

/// One entry in a similarity ranking of stored tasks.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RelatedTask {
    pub task_id: TaskId,
    pub description: String,
    pub similarity: f64,
    pub completed: bool,
}

/// One scored hit from a task-history search.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SearchHit {
    pub task_id: TaskId,
    pub score: f64,
}

/// Immutable snapshot of a task at one point in its history.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: CheckpointId,
    pub task_id: TaskId,
    /// Position in the task's checkpoint chain, starting at 1. Strictly
    /// increasing even after older checkpoints are pruned.
    pub sequence_no: u64,
    pub timestamp: Timestamp,
    pub description: String,
    /// Checkpoint this one was taken after, if any survives in the chain.
    #[serde(default)]
    pub parent_id: Option<CheckpointId>,
    pub state: TaskState,
    pub state_hash: String,
}

impl Checkpoint {
    /// Builds the id for a checkpoint of `task_id` at `sequence_no`.
    pub fn id_for(task_id: &str, sequence_no: u64) -> CheckpointId {
        format!("{task_id}_{sequence_no}")
    }

    /// True when the embedded state still matches the recorded hash.
    pub fn verify_integrity(&self) -> bool {
        match state_content_hash(&self.state) {
            Ok(hash) => hash == self.state_hash,
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_follow_lifecycle() {
        let table = [
            (TaskStatus::Pending, TaskStatus::Running, true),
            (TaskStatus::Pending, TaskStatus::Completed, false),
            (TaskStatus::Pending, TaskStatus::Failed, true),
            (TaskStatus::Running, TaskStatus::AwaitingApproval, true),
            (TaskStatus::Running, TaskStatus::Suspended, true),
            (TaskStatus::Running, TaskStatus::Completed, true),
            (TaskStatus::Running, TaskStatus::Failed, true),
            (TaskStatus::AwaitingApproval, TaskStatus::Running, true),
            (TaskStatus::AwaitingApproval, TaskStatus::Completed, false),
            (TaskStatus::Suspended, TaskStatus::Running, true),
            (TaskStatus::Suspended, TaskStatus::Completed, false),
            (TaskStatus::Completed, TaskStatus::Running, false),
            (TaskStatus::Completed, TaskStatus::Completed, false),
            (TaskStatus::Failed, TaskStatus::Running, false),
        ];
        for (from, to, expected) in table {
            assert_eq!(
                from.can_transition_to(&to),
                expected,
                "transition {from} -> {to}"
            );
        }
    }

    #[test]
    fn live_states_allow_self_transition() {
        assert!(TaskStatus::Running.can_transition_to(&TaskStatus::Running));
        assert!(!TaskStatus::Failed.can_transition_to(&TaskStatus::Failed));
    }

    #[test]
    fn mark_failed_records_reason_and_finish_time() {
        let mut state = TaskState::new("demo");
        state
            .transition_to(TaskStatus::Running)
            .expect("pending task should start");
        state
            .mark_failed(FailureReason::Cancelled)
            .expect("running task should fail");
        assert_eq!(state.status, TaskStatus::Failed);
        assert_eq!(state.failure, Some(FailureReason::Cancelled));
        assert!(state.finished_at.is_some());
    }

    #[test]
    fn completed_task_rejects_further_transitions() {
        let mut state = TaskState::new("demo");
        state
            .transition_to(TaskStatus::Running)
            .expect("pending task should start");
        state.mark_completed().expect("running task should complete");
        let err = state
            .transition_to(TaskStatus::Running)
            .expect_err("completed task should be frozen");
        assert_eq!(err.from, TaskStatus::Completed);
        assert_eq!(err.to, TaskStatus::Running);
    }

    #[test]
    fn status_serializes_as_snake_case() {
        let encoded =
            serde_json::to_string(&TaskStatus::AwaitingApproval).expect("status should encode");
        assert_eq!(encoded, "\"awaiting_approval\"");
        let decoded: TaskStatus =
            serde_json::from_str("\"awaiting_approval\"").expect("status should decode");
        assert_eq!(decoded, TaskStatus::AwaitingApproval);

        let reason = serde_json::to_string(&FailureReason::IterationLimitExceeded)
            .expect("failure reason should encode");
        assert_eq!(reason, "\"iteration_limit_exceeded\"");
    }

    #[test]
    fn task_state_round_trips_through_json() {
        let mut state = TaskState::new("round trip");
        state.push_message(MessageRole::User, "hello");
        state.record_tool_execution(ToolExecutionRecord {
            tool_name: "echo".to_string(),
            arguments: serde_json::json!({"text": "hi"}),
            result: serde_json::json!({"echo": "hi"}),
            started_at: current_timestamp(),
            finished_at: current_timestamp(),
            outcome: ToolOutcomeKind::Success,
        });
        state.update_metadata(BTreeMap::from([(
            "phase".to_string(),
            serde_json::json!("greeting"),
        )]));

        let encoded = serde_json::to_string(&state).expect("state should encode");
        let decoded: TaskState = serde_json::from_str(&encoded).expect("state should decode");
        assert_eq!(decoded, state);
    }

    #[test]
    fn state_hash_is_stable_and_detects_change() {
        let mut state = TaskState::new("hash me");
        let first = state_content_hash(&state).expect("state should hash");
        let second = state_content_hash(&state).expect("state should hash");
        assert_eq!(first, second);

        state.push_message(MessageRole::User, "mutated");
        let third = state_content_hash(&state).expect("state should hash");
        assert_ne!(first, third);
    }

    #[test]
    fn metadata_similarity_is_matching_values_over_larger_map() {
        let a = BTreeMap::from([
            ("lang".to_string(), serde_json::json!("rust")),
            ("topic".to_string(), serde_json::json!("storage")),
        ]);
        let b = BTreeMap::from([
            ("lang".to_string(), serde_json::json!("rust")),
            ("topic".to_string(), serde_json::json!("parsing")),
            ("phase".to_string(), serde_json::json!("done")),
        ]);
        assert!((metadata_similarity(&a, &b) - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(metadata_similarity(&a, &a), 1.0);
        assert_eq!(metadata_similarity(&a, &BTreeMap::new()), 0.0);
        assert_eq!(metadata_similarity(&BTreeMap::new(), &BTreeMap::new()), 0.0);
    }

    #[test]
    fn message_match_score_counts_matching_messages_case_insensitively() {
        let mut state = TaskState::new("scored");
        state.push_message(MessageRole::User, "Deploy the service");
        state.push_message(MessageRole::Assistant, "deploying now");
        state.push_message(MessageRole::Tool, "unrelated output");
        assert_eq!(message_match_score(&state.messages, "DEPLOY"), 2.0);
        assert_eq!(message_match_score(&state.messages, "missing"), 0.0);
    }

    #[test]
    fn checkpoint_integrity_fails_on_tampered_state() {
        let state = TaskState::new("snapshot");
        let hash = state_content_hash(&state).expect("state should hash");
        let mut checkpoint = Checkpoint {
            checkpoint_id: Checkpoint::id_for(&state.task_id, 1),
            task_id: state.task_id.clone(),
            sequence_no: 1,
            timestamp: current_timestamp(),
            description: "initial".to_string(),
            parent_id: None,
            state,
            state_hash: hash,
        };
        assert!(checkpoint.verify_integrity());

        checkpoint.state.push_message(MessageRole::User, "tampered");
        assert!(!checkpoint.verify_integrity());
    }
}
