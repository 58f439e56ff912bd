//! Loop progress events for hosts that want to watch a run.
//!
//! Emission is strictly fire-and-forget: a sink with no observer and no
//! channel is free, and send failures never affect the loop.

use std::sync::Arc;

use capstan_taskstore::{FailureReason, TaskStatus, Timestamp, ToolOutcomeKind};
use tokio::sync::mpsc;

use crate::debug::BreakpointKind;

fn timestamp_now() -> Timestamp {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}.{:03}Z", now.as_secs(), now.subsec_millis())
}

/// What happened, with just enough payload to render a console line.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEventKind {
    TaskStarted { description: String },
    IterationStarted { iteration: u32 },
    RateLimited { wait_ms: u64 },
    ActionReceived { action: String },
    ApprovalRequested { tool_name: String },
    ApprovalResolved { tool_name: String, granted: bool, manual: bool },
    ToolStarted { tool_name: String },
    ToolFinished { tool_name: String, outcome: ToolOutcomeKind },
    CheckpointCreated { checkpoint_id: String, sequence_no: u64 },
    DebugPaused { point: BreakpointKind },
    DebugResumed { stepping: bool },
    TaskFinished { status: TaskStatus, failure: Option<FailureReason> },
}

/// One observed step of a run.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct TaskEvent {
    pub task_id: String,
    pub timestamp: Timestamp,
    pub kind: TaskEventKind,
}

pub type TaskEventObserver = Arc<dyn Fn(&TaskEvent) + Send + Sync>;

/// Fan-out point for task events. Cloneable; clones share nothing and
/// deliver to the same targets.
#[derive(Clone, Default)]
pub struct TaskEventSink {
    observer: Option<TaskEventObserver>,
    channel: Option<mpsc::UnboundedSender<TaskEvent>>,
}

impl TaskEventSink {
    /// A sink that drops everything.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_observer(observer: TaskEventObserver) -> Self {
        TaskEventSink {
            observer: Some(observer),
            channel: None,
        }
    }

    pub fn attach_channel(&mut self, sender: mpsc::UnboundedSender<TaskEvent>) {
        self.channel = Some(sender);
    }

    pub fn emit(&self, task_id: &str, kind: TaskEventKind) {
        if self.observer.is_none() && self.channel.is_none() {
            return;
        }
        let event = TaskEvent {
            task_id: task_id.to_string(),
            timestamp: timestamp_now(),
            kind,
        };
        if let Some(observer) = &self.observer {
            observer(&event);
        }
        if let Some(channel) = &self.channel {
            let _ = channel.send(event);
        }
    }
}

/// Builds a sink wired to an unbounded channel and hands back the
/// receiving half for the host to drain.
pub fn task_event_channel() -> (TaskEventSink, mpsc::UnboundedReceiver<TaskEvent>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let mut sink = TaskEventSink::new();
    sink.attach_channel(sender);
    (sink, receiver)
}
