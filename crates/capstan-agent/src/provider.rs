//! Action provider contract.
//!
//! The loop never talks to a model directly; it asks an
//! [`ActionProvider`] for the next action and interprets the result.
//! Prompt construction, transports, and retries all live behind this
//! trait.

use std::collections::VecDeque;
use std::sync::Mutex;

use capstan_taskstore::MessageRecord;
use serde_json::Value;

use crate::tools::ToolDescriptor;

/// Next step chosen by the provider.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Invoke a registered tool with JSON arguments.
    ToolCall { name: String, arguments: Value },
    /// The task is done; `result` carries the final answer.
    Complete { result: String },
    /// More input is needed from the user before continuing.
    ClarificationRequest { question: String },
}

impl Action {
    /// Short label for events and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Action::ToolCall { .. } => "tool_call",
            Action::Complete { .. } => "complete",
            Action::ClarificationRequest { .. } => "clarification_request",
        }
    }
}

/// Provider failures. The loop retries neither kind; transient
/// handling belongs to the provider implementation.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Transport-level failure (timeout, disconnect, overload).
    #[error("transient provider failure: {0}")]
    Transient(String),
    /// The provider answered with something the loop cannot use.
    #[error("provider protocol violation: {0}")]
    Protocol(String),
}

/// Source of the next action for a task.
#[async_trait::async_trait]
pub trait ActionProvider: Send + Sync {
    /// Chooses the next action given the conversation so far and the
    /// catalogue of tools the task may call.
    async fn get_next_action(
        &self,
        messages: &[MessageRecord],
        tools: &[ToolDescriptor],
    ) -> Result<Action, ProviderError>;
}

/// Provider fed from a fixed queue of actions.
///
/// Used by scripted CLI runs and by tests; an exhausted queue is a
/// protocol error.
pub struct QueueProvider {
    actions: Mutex<VecDeque<Action>>,
}

impl QueueProvider {
    pub fn new(actions: impl IntoIterator<Item = Action>) -> Self {
        QueueProvider {
            actions: Mutex::new(actions.into_iter().collect()),
        }
    }

    /// Actions left in the queue.
    pub fn remaining(&self) -> usize {
        self.actions.lock().map(|queue| queue.len()).unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl ActionProvider for QueueProvider {
    async fn get_next_action(
        &self,
        _messages: &[MessageRecord],
        _tools: &[ToolDescriptor],
    ) -> Result<Action, ProviderError> {
        let mut queue = self
            .actions
            .lock()
            .map_err(|_| ProviderError::Transient("action queue mutex poisoned".to_string()))?;
        queue
            .pop_front()
            .ok_or_else(|| ProviderError::Protocol("action queue exhausted".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "current_thread")]
    async fn queue_provider_drains_in_order_then_errors() {
        let provider = QueueProvider::new([
            Action::ToolCall {
                name: "echo".to_string(),
                arguments: serde_json::json!({"text": "hi"}),
            },
            Action::Complete {
                result: "done".to_string(),
            },
        ]);
        assert_eq!(provider.remaining(), 2);

        let first = provider
            .get_next_action(&[], &[])
            .await
            .expect("first action should be served");
        assert_eq!(first.kind(), "tool_call");

        let second = provider
            .get_next_action(&[], &[])
            .await
            .expect("second action should be served");
        assert_eq!(second.kind(), "complete");

        let err = provider
            .get_next_action(&[], &[])
            .await
            .expect_err("exhausted queue should error");
        assert!(matches!(err, ProviderError::Protocol(_)));
    }

    #[test]
    fn actions_round_trip_through_tagged_json() {
        let action = Action::ClarificationRequest {
            question: "which file?".to_string(),
        };
        let encoded = serde_json::to_string(&action).expect("action should encode");
        assert!(encoded.contains("\"type\":\"clarification_request\""));
        let decoded: Action = serde_json::from_str(&encoded).expect("action should decode");
        assert_eq!(decoded, action);
    }
}
