//! Human approval gate for tool execution.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde_json::Value;

/// Host-supplied decision source for manual approvals. May block on a
/// human for as long as it likes; the loop races it with cancellation.
#[async_trait::async_trait]
pub trait ApprovalCallback: Send + Sync {
    async fn get_approval(&self, tool_name: &str, arguments: &Value, description: &str) -> bool;
}

/// Callback with a fixed answer. The loop's default stand-in grants
/// everything, so a bare loop behaves like an unattended runner.
pub struct StaticApprovalCallback {
    answer: bool,
}

impl StaticApprovalCallback {
    pub fn new(answer: bool) -> Self {
        StaticApprovalCallback { answer }
    }
}

#[async_trait::async_trait]
impl ApprovalCallback for StaticApprovalCallback {
    async fn get_approval(&self, _tool_name: &str, _arguments: &Value, _description: &str) -> bool {
        self.answer
    }
}

/// Scripted answers consumed front to back; an exhausted queue denies.
pub struct QueueApprovalCallback {
    answers: Mutex<VecDeque<bool>>,
}

impl QueueApprovalCallback {
    pub fn new(answers: impl IntoIterator<Item = bool>) -> Self {
        QueueApprovalCallback {
            answers: Mutex::new(answers.into_iter().collect()),
        }
    }
}

#[async_trait::async_trait]
impl ApprovalCallback for QueueApprovalCallback {
    async fn get_approval(&self, _tool_name: &str, _arguments: &Value, _description: &str) -> bool {
        match self.answers.lock() {
            Ok(mut answers) => answers.pop_front().unwrap_or(false),
            Err(_) => false,
        }
    }
}

/// How an authorization was resolved.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ApprovalDecision {
    Granted { manual: bool },
    Denied,
}

/// Applies the auto-approval policy before falling back to the
/// callback.
///
/// The consecutive-auto-approval counter lives in `TaskState` (it has
/// to survive suspend/resume), so callers pass its current value in
/// and apply the increment or reset that the decision implies.
pub struct ApprovalGate {
    auto_approve: bool,
    max_consecutive: u32,
    callback: Arc<dyn ApprovalCallback>,
}

impl ApprovalGate {
    pub fn new(auto_approve: bool, max_consecutive: u32, callback: Arc<dyn ApprovalCallback>) -> Self {
        ApprovalGate {
            auto_approve,
            max_consecutive,
            callback,
        }
    }

    /// True when this call must be confirmed through the callback. The
    /// ceiling forces a manual check even with auto-approval on.
    pub fn requires_manual(&self, consecutive_auto_approvals: u32) -> bool {
        !self.auto_approve || consecutive_auto_approvals >= self.max_consecutive
    }

    /// Asks the callback for a decision.
    pub async fn request_manual(&self, tool_name: &str, arguments: &Value, description: &str) -> bool {
        self.callback
            .get_approval(tool_name, arguments, description)
            .await
    }

    /// One-shot authorization for embedders that do not persist state
    /// between the policy check and the callback.
    pub async fn authorize(
        &self,
        tool_name: &str,
        arguments: &Value,
        description: &str,
        consecutive_auto_approvals: u32,
    ) -> ApprovalDecision {
        if !self.requires_manual(consecutive_auto_approvals) {
            return ApprovalDecision::Granted { manual: false };
        }
        if self.request_manual(tool_name, arguments, description).await {
            ApprovalDecision::Granted { manual: true }
        } else {
            ApprovalDecision::Denied
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> Value {
        serde_json::json!({"path": "notes.txt"})
    }

    #[tokio::test(flavor = "current_thread")]
    async fn manual_mode_always_consults_the_callback() {
        let gate = ApprovalGate::new(false, 3, Arc::new(StaticApprovalCallback::new(true)));
        assert!(gate.requires_manual(0));
        let decision = gate.authorize("write_file", &args(), "demo task", 0).await;
        assert_eq!(decision, ApprovalDecision::Granted { manual: true });
    }

    #[tokio::test(flavor = "current_thread")]
    async fn auto_mode_grants_below_the_ceiling() {
        let gate = ApprovalGate::new(true, 3, Arc::new(StaticApprovalCallback::new(false)));
        assert!(!gate.requires_manual(2));
        let decision = gate.authorize("write_file", &args(), "demo task", 2).await;
        assert_eq!(decision, ApprovalDecision::Granted { manual: false });
    }

    #[tokio::test(flavor = "current_thread")]
    async fn ceiling_forces_a_manual_check() {
        let gate = ApprovalGate::new(true, 3, Arc::new(StaticApprovalCallback::new(false)));
        assert!(gate.requires_manual(3));
        let decision = gate.authorize("write_file", &args(), "demo task", 3).await;
        assert_eq!(decision, ApprovalDecision::Denied);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn queue_callback_drains_then_denies() {
        let callback = QueueApprovalCallback::new([true, false]);
        assert!(callback.get_approval("echo", &args(), "demo").await);
        assert!(!callback.get_approval("echo", &args(), "demo").await);
        assert!(!callback.get_approval("echo", &args(), "demo").await);
    }
}
