//! Capstan task execution core.
//!
//! The crate drives an iterative agent task: ask an action provider
//! for the next step, execute it through a tool registry, persist the
//! resulting [`TaskState`](capstan_taskstore::TaskState), and repeat
//! until the task completes, suspends for clarification, fails, or is
//! cancelled. Around that loop sit the supporting pieces hosts compose:
//! an approval gate, a sliding-window rate limiter, an interactive
//! breakpoint controller, and a fire-and-forget event sink.
//!
//! Hosts supply the collaborators ([`ActionProvider`], [`ToolRegistry`]
//! entries, an [`ApprovalCallback`], a store from `capstan-taskstore`)
//! and the loop owns the orchestration.

pub mod approval;
pub mod condition;
pub mod config;
pub mod debug;
pub mod errors;
pub mod events;
pub mod limiter;
pub mod provider;
pub mod runner;
pub mod tools;

pub use approval::{
    ApprovalCallback, ApprovalDecision, ApprovalGate, QueueApprovalCallback,
    StaticApprovalCallback,
};
pub use config::AgentConfig;
pub use debug::{
    BreakpointKind, BreakpointSpec, DebugCommand, DebugController, DebugHandle, DebugListener,
    DebugSettings, NoopDebugListener,
};
pub use errors::{AgentError, AgentResult};
pub use events::{task_event_channel, TaskEvent, TaskEventKind, TaskEventObserver, TaskEventSink};
pub use limiter::RateLimiter;
pub use provider::{Action, ActionProvider, ProviderError, QueueProvider};
pub use runner::{CancelHandle, TaskLoop, TaskResult};
pub use tools::{
    executor_fn, RegisteredTool, ToolDescriptor, ToolExecutor, ToolFuture, ToolOutcome,
    ToolRegistry,
};
