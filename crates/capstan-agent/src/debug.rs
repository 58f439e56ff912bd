//! Interactive breakpoint controller.
//!
//! The loop calls [`DebugController::check`] at four fixed points per
//! iteration. A check that trips a breakpoint (or runs in step mode)
//! parks the task on a command channel until a host drives it forward
//! through a [`DebugHandle`]. Everything here is opt-in: a loop built
//! without a controller skips the checks entirely.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use capstan_taskstore::TaskState;
use tokio::sync::mpsc;

use crate::condition::{self, ConditionContext};
use crate::errors::{AgentError, AgentResult};
use crate::events::{TaskEventKind, TaskEventSink};

/// Places in an iteration where the loop consults the controller.
#[derive(
    Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum BreakpointKind {
    /// Before the provider is asked for the next action.
    LlmPre,
    /// After the provider's action was appended to the conversation.
    LlmPost,
    /// After approval, before the tool executes.
    ToolPre,
    /// After the tool executed and its record was saved.
    ToolPost,
}

impl BreakpointKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakpointKind::LlmPre => "llm_pre",
            BreakpointKind::LlmPost => "llm_post",
            BreakpointKind::ToolPre => "tool_pre",
            BreakpointKind::ToolPost => "tool_post",
        }
    }
}

impl std::fmt::Display for BreakpointKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One breakpoint's configuration.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct BreakpointSpec {
    pub enabled: bool,
    /// Optional condition expression; see [`crate::condition`].
    #[serde(default)]
    pub condition: Option<String>,
}

/// Debugger configuration accepted at construction.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct DebugSettings {
    /// Master switch; a disabled controller never pauses.
    pub enabled: bool,
    /// Start in step mode: every check pauses.
    pub step_by_step: bool,
    pub breakpoints: BTreeMap<BreakpointKind, BreakpointSpec>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum DebugMode {
    Running,
    Paused,
    Stepping,
}

/// Commands a host sends to a paused task.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DebugCommand {
    /// Continue until the next tripped breakpoint.
    Resume,
    /// Advance one check, then pause again.
    Step,
}

/// Cloneable sender half used by hosts to drive a paused task.
#[derive(Clone)]
pub struct DebugHandle {
    commands: mpsc::UnboundedSender<DebugCommand>,
}

impl DebugHandle {
    pub fn resume(&self) {
        let _ = self.commands.send(DebugCommand::Resume);
    }

    pub fn step(&self) {
        let _ = self.commands.send(DebugCommand::Step);
    }
}

/// Host-side observer of pause and resume transitions.
pub trait DebugListener: Send + Sync {
    fn on_pause(&self, point: BreakpointKind, state: &TaskState);
    fn on_resume(&self, stepping: bool);
}

/// Listener that ignores everything.
pub struct NoopDebugListener;

impl DebugListener for NoopDebugListener {
    fn on_pause(&self, _point: BreakpointKind, _state: &TaskState) {}
    fn on_resume(&self, _stepping: bool) {}
}

/// Decides at each check point whether the loop should pause, and runs
/// the pause when it should.
pub struct DebugController {
    enabled: bool,
    mode: Mutex<DebugMode>,
    breakpoints: Mutex<BTreeMap<BreakpointKind, BreakpointSpec>>,
    listener: Arc<dyn DebugListener>,
    commands: tokio::sync::Mutex<mpsc::UnboundedReceiver<DebugCommand>>,
    handle: DebugHandle,
}

impl DebugController {
    pub fn new(settings: DebugSettings) -> Self {
        Self::with_listener(settings, Arc::new(NoopDebugListener))
    }

    pub fn with_listener(settings: DebugSettings, listener: Arc<dyn DebugListener>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mode = if settings.step_by_step {
            DebugMode::Stepping
        } else {
            DebugMode::Running
        };
        DebugController {
            enabled: settings.enabled,
            mode: Mutex::new(mode),
            breakpoints: Mutex::new(settings.breakpoints),
            listener,
            commands: tokio::sync::Mutex::new(receiver),
            handle: DebugHandle { commands: sender },
        }
    }

    /// Handle for hosts; clones freely.
    pub fn handle(&self) -> DebugHandle {
        self.handle.clone()
    }

    /// Installs or replaces a breakpoint at runtime.
    pub fn set_breakpoint(&self, point: BreakpointKind, spec: BreakpointSpec) -> AgentResult<()> {
        let mut breakpoints = self.lock_breakpoints()?;
        breakpoints.insert(point, spec);
        Ok(())
    }

    /// Removes a breakpoint at runtime.
    pub fn clear_breakpoint(&self, point: BreakpointKind) -> AgentResult<()> {
        let mut breakpoints = self.lock_breakpoints()?;
        breakpoints.remove(&point);
        Ok(())
    }

    fn lock_breakpoints(
        &self,
    ) -> AgentResult<std::sync::MutexGuard<'_, BTreeMap<BreakpointKind, BreakpointSpec>>> {
        self.breakpoints
            .lock()
            .map_err(|_| AgentError::Internal("debug breakpoint mutex poisoned".to_string()))
    }

    fn lock_mode(&self) -> AgentResult<std::sync::MutexGuard<'_, DebugMode>> {
        self.mode
            .lock()
            .map_err(|_| AgentError::Internal("debug mode mutex poisoned".to_string()))
    }

    fn should_pause(&self, point: BreakpointKind, ctx: &ConditionContext<'_>) -> AgentResult<bool> {
        if !self.enabled {
            return Ok(false);
        }
        // Step mode outranks breakpoint filtering.
        if *self.lock_mode()? == DebugMode::Stepping {
            return Ok(true);
        }
        let breakpoints = self.lock_breakpoints()?;
        let Some(spec) = breakpoints.get(&point) else {
            return Ok(false);
        };
        if !spec.enabled {
            return Ok(false);
        }
        Ok(match &spec.condition {
            Some(expression) => condition::evaluate(expression, ctx),
            None => true,
        })
    }

    /// Pauses at `point` when a breakpoint or step mode demands it,
    /// blocking until the host resumes or steps. Cancellation is the
    /// caller's concern: the loop races this future against its cancel
    /// handle and simply drops it when the task is torn down.
    pub async fn check(
        &self,
        point: BreakpointKind,
        state: &TaskState,
        iteration: u32,
        events: &TaskEventSink,
    ) -> AgentResult<()> {
        let ctx = ConditionContext { state, iteration };
        if !self.should_pause(point, &ctx)? {
            return Ok(());
        }

        *self.lock_mode()? = DebugMode::Paused;
        self.listener.on_pause(point, state);
        events.emit(&state.task_id, TaskEventKind::DebugPaused { point });

        let command = {
            let mut commands = self.commands.lock().await;
            commands.recv().await
        };
        let stepping = matches!(command, Some(DebugCommand::Step));

        *self.lock_mode()? = if stepping {
            DebugMode::Stepping
        } else {
            DebugMode::Running
        };
        self.listener.on_resume(stepping);
        events.emit(&state.task_id, TaskEventKind::DebugResumed { stepping });
        Ok(())
    }
}
