//! Loop configuration.
//!
//! The core consumes this struct but never loads it; hosts decide
//! whether values come from flags, files, or code.

/// Tunables for one task loop.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Provider requests allowed per minute.
    pub rate_limit: u32,
    /// Grant tool calls without consulting the approval callback.
    pub auto_approve_tools: bool,
    /// Auto-approvals allowed in a row before one manual check is
    /// forced regardless of `auto_approve_tools`.
    pub max_consecutive_auto_approvals: u32,
    /// Iterations before the task fails with
    /// `iteration_limit_exceeded`.
    pub max_iterations: u32,
    /// Checkpoint after every executed tool call.
    pub auto_checkpoint: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            rate_limit: 60,
            auto_approve_tools: false,
            max_consecutive_auto_approvals: 3,
            max_iterations: 50,
            auto_checkpoint: true,
        }
    }
}
