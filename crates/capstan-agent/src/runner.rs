//! The task execution loop.
//!
//! One [`TaskLoop`] drives exactly one task at a time: it asks the
//! provider for an action, executes it, persists the resulting state,
//! and repeats until the task completes, suspends, fails, or is
//! cancelled. Every exit path leaves a freshly saved state behind, so
//! a crashed or cancelled run can always be inspected and resumed from
//! the store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use capstan_taskstore::{
    current_timestamp, FailureReason, MessageRole, StateStore, TaskState, TaskStatus,
    ToolExecutionRecord, ToolOutcomeKind,
};
use serde_json::Value;
use tokio::sync::Notify;

use crate::approval::{ApprovalCallback, ApprovalDecision, ApprovalGate, StaticApprovalCallback};
use crate::config::AgentConfig;
use crate::debug::{BreakpointKind, DebugController};
use crate::errors::{AgentError, AgentResult};
use crate::events::{TaskEventKind, TaskEventSink};
use crate::limiter::RateLimiter;
use crate::provider::{Action, ActionProvider};
use crate::tools::{ToolOutcome, ToolRegistry};

#[derive(Default)]
struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

/// Cooperative cancellation signal shared between the loop and hosts.
#[derive(Clone, Default)]
pub struct CancelHandle {
    inner: Arc<CancelInner>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Idempotent; wakes every waiter.
    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Resolves once cancellation is requested; resolves immediately
    /// when it already was. Safe to race in a `select!`.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let notified = self.inner.notify.notified();
        // A cancel between the flag check and registration would
        // otherwise be missed.
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

/// Final report of a run or resume.
#[derive(Clone, Debug)]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    pub failure: Option<FailureReason>,
    /// Final answer when the provider completed the task.
    pub result: Option<String>,
    /// Iterations consumed by this run.
    pub iterations: u32,
    pub state: TaskState,
}

/// Drives one task through the provider/tool/persist cycle.
pub struct TaskLoop {
    config: AgentConfig,
    provider: Arc<dyn ActionProvider>,
    tools: ToolRegistry,
    store: Arc<dyn StateStore>,
    gate: ApprovalGate,
    limiter: RateLimiter,
    debug: Option<Arc<DebugController>>,
    events: TaskEventSink,
    cancel: CancelHandle,
}

impl TaskLoop {
    /// Builds a loop from its required collaborators. The default
    /// approval callback grants everything; swap it with
    /// [`with_approval_callback`](Self::with_approval_callback) for
    /// attended runs.
    pub fn new(
        config: AgentConfig,
        provider: Arc<dyn ActionProvider>,
        tools: ToolRegistry,
        store: Arc<dyn StateStore>,
    ) -> AgentResult<Self> {
        if config.max_iterations == 0 {
            return Err(AgentError::InvalidConfiguration(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        let limiter = RateLimiter::new(config.rate_limit)?;
        let gate = ApprovalGate::new(
            config.auto_approve_tools,
            config.max_consecutive_auto_approvals,
            Arc::new(StaticApprovalCallback::new(true)),
        );
        Ok(TaskLoop {
            config,
            provider,
            tools,
            store,
            gate,
            limiter,
            debug: None,
            events: TaskEventSink::new(),
            cancel: CancelHandle::new(),
        })
    }

    pub fn with_approval_callback(mut self, callback: Arc<dyn ApprovalCallback>) -> Self {
        self.gate = ApprovalGate::new(
            self.config.auto_approve_tools,
            self.config.max_consecutive_auto_approvals,
            callback,
        );
        self
    }

    pub fn with_debug_controller(mut self, controller: Arc<DebugController>) -> Self {
        self.debug = Some(controller);
        self
    }

    pub fn with_event_sink(mut self, events: TaskEventSink) -> Self {
        self.events = events;
        self
    }

    /// Swaps the rate limiter, letting hosts shorten the window.
    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    /// Handle hosts use to request cancellation of the running task.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Runs a new task from `task_description` to a terminal status or
    /// suspension.
    pub async fn run(&self, task_description: impl Into<String>) -> AgentResult<TaskResult> {
        let description = task_description.into();
        let mut state = TaskState::new(&description);
        state.push_user_input(&description, BTreeMap::new());
        state.push_message(MessageRole::System, &description);
        self.events.emit(
            &state.task_id,
            TaskEventKind::TaskStarted {
                description: description.clone(),
            },
        );
        state.mark_running()?;
        self.store.save(&state).await?;
        self.drive(state).await
    }

    /// Resumes a previously loaded task, optionally supplying the
    /// clarification the provider asked for.
    ///
    /// Accepts suspended, awaiting-approval (a run torn down mid
    /// approval), pending, and running states; terminal states are
    /// rejected.
    pub async fn resume(
        &self,
        mut state: TaskState,
        clarification: Option<String>,
    ) -> AgentResult<TaskResult> {
        if let Some(clarification) = clarification {
            state.push_user_input(&clarification, BTreeMap::new());
            state.push_message(MessageRole::User, &clarification);
        }
        state.mark_running()?;
        self.events.emit(
            &state.task_id,
            TaskEventKind::TaskStarted {
                description: state.description.clone(),
            },
        );
        self.store.save(&state).await?;
        self.drive(state).await
    }

    /// Drives the loop to its end. A storage failure mid-run is
    /// stamped on the state before the error surfaces.
    async fn drive(&self, mut state: TaskState) -> AgentResult<TaskResult> {
        match self.iterate(&mut state).await {
            Err(error @ AgentError::Storage(_)) => Err(self.fail_storage(&mut state, error).await),
            other => other,
        }
    }

    async fn iterate(&self, state: &mut TaskState) -> AgentResult<TaskResult> {
        let mut iterations_used: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                return self.finish_cancelled(state, iterations_used).await;
            }
            if iterations_used >= self.config.max_iterations {
                return self.finish_iteration_limit(state, iterations_used).await;
            }
            iterations_used += 1;
            let iteration = iterations_used;
            self.events.emit(
                &state.task_id,
                TaskEventKind::IterationStarted { iteration },
            );

            // The rate limiter is the only gate to the provider.
            let hint = self.limiter.wait_hint()?;
            if !hint.is_zero() {
                self.events.emit(
                    &state.task_id,
                    TaskEventKind::RateLimited {
                        wait_ms: hint.as_millis() as u64,
                    },
                );
            }
            let limited = tokio::select! {
                res = self.limiter.acquire() => Some(res),
                _ = self.cancel.cancelled() => None,
            };
            match limited {
                Some(res) => res?,
                None => return self.finish_cancelled(state, iterations_used).await,
            }

            if !self
                .debug_check(BreakpointKind::LlmPre, state, iteration)
                .await?
            {
                return self.finish_cancelled(state, iterations_used).await;
            }

            let catalogue = self.tools.descriptors();
            let action = tokio::select! {
                res = self.provider.get_next_action(&state.messages, &catalogue) => Some(res),
                _ = self.cancel.cancelled() => None,
            };
            let action = match action {
                Some(Ok(action)) => action,
                Some(Err(err)) => return self.fail_provider(state, err.into()).await,
                None => return self.finish_cancelled(state, iterations_used).await,
            };
            self.events.emit(
                &state.task_id,
                TaskEventKind::ActionReceived {
                    action: action.kind().to_string(),
                },
            );

            // Record the assistant's side of the exchange before
            // anything acts on it.
            match &action {
                Action::ToolCall { name, arguments } => {
                    state.push_message(
                        MessageRole::Assistant,
                        format!("Calling tool {name} with arguments {arguments}"),
                    );
                }
                Action::Complete { result } => {
                    state.push_message(MessageRole::Assistant, result);
                }
                Action::ClarificationRequest { question } => {
                    state.push_message(MessageRole::Assistant, question);
                }
            }

            if !self
                .debug_check(BreakpointKind::LlmPost, state, iteration)
                .await?
            {
                return self.finish_cancelled(state, iterations_used).await;
            }

            match action {
                Action::Complete { result } => {
                    state.mark_completed()?;
                    // The completion checkpoint is unconditional; it
                    // doubles as the final save.
                    let checkpoint = self
                        .store
                        .create_checkpoint(state, "task completed")
                        .await?;
                    self.events.emit(
                        &state.task_id,
                        TaskEventKind::CheckpointCreated {
                            checkpoint_id: checkpoint.checkpoint_id.clone(),
                            sequence_no: checkpoint.sequence_no,
                        },
                    );
                    self.emit_finished(state);
                    return Ok(self.result_from(state, Some(result), iterations_used));
                }
                Action::ClarificationRequest { .. } => {
                    state.mark_suspended()?;
                    self.store.save(state).await?;
                    self.emit_finished(state);
                    return Ok(self.result_from(state, None, iterations_used));
                }
                Action::ToolCall { name, arguments } => {
                    if !self
                        .debug_check(BreakpointKind::ToolPre, state, iteration)
                        .await?
                    {
                        return self.finish_cancelled(state, iterations_used).await;
                    }

                    let decision = match self.authorize(state, &name, &arguments).await? {
                        Some(decision) => decision,
                        None => return self.finish_cancelled(state, iterations_used).await,
                    };
                    if decision == ApprovalDecision::Denied {
                        let now = current_timestamp();
                        state.record_tool_execution(ToolExecutionRecord {
                            tool_name: name.clone(),
                            arguments: arguments.clone(),
                            result: outcome_value(&ToolOutcome::failure(
                                "tool call denied by approval",
                            )),
                            started_at: now.clone(),
                            finished_at: now,
                            outcome: ToolOutcomeKind::Rejected,
                        });
                        state.push_message(
                            MessageRole::System,
                            format!("Tool call {name} was denied by the approver."),
                        );
                        self.store.save(state).await?;
                        continue;
                    }

                    self.events.emit(
                        &state.task_id,
                        TaskEventKind::ToolStarted {
                            tool_name: name.clone(),
                        },
                    );
                    let started_at = current_timestamp();
                    let (outcome, kind) = self.tools.execute(&name, arguments.clone()).await;
                    let finished_at = current_timestamp();
                    state.record_tool_execution(ToolExecutionRecord {
                        tool_name: name.clone(),
                        arguments,
                        result: outcome_value(&outcome),
                        started_at,
                        finished_at,
                        outcome: kind,
                    });
                    state.push_message(
                        MessageRole::Tool,
                        format!("Tool {name} result: {}", outcome.message),
                    );
                    self.events.emit(
                        &state.task_id,
                        TaskEventKind::ToolFinished {
                            tool_name: name.clone(),
                            outcome: kind,
                        },
                    );
                    self.store.save(state).await?;

                    if !self
                        .debug_check(BreakpointKind::ToolPost, state, iteration)
                        .await?
                    {
                        return self.finish_cancelled(state, iterations_used).await;
                    }

                    if self.config.auto_checkpoint {
                        let checkpoint = self
                            .store
                            .create_checkpoint(state, &format!("after tool: {name}"))
                            .await?;
                        self.events.emit(
                            &state.task_id,
                            TaskEventKind::CheckpointCreated {
                                checkpoint_id: checkpoint.checkpoint_id.clone(),
                                sequence_no: checkpoint.sequence_no,
                            },
                        );
                    }
                }
            }
        }
    }

    /// Resolves approval for one tool call. `None` means cancellation
    /// interrupted a manual approval wait.
    async fn authorize(
        &self,
        state: &mut TaskState,
        name: &str,
        arguments: &Value,
    ) -> AgentResult<Option<ApprovalDecision>> {
        if !self.gate.requires_manual(state.consecutive_auto_approvals) {
            state.increment_auto_approvals();
            self.events.emit(
                &state.task_id,
                TaskEventKind::ApprovalResolved {
                    tool_name: name.to_string(),
                    granted: true,
                    manual: false,
                },
            );
            return Ok(Some(ApprovalDecision::Granted { manual: false }));
        }

        // Hold the awaiting state on disk while a human decides; a
        // cancellation here must leave the pre-tool state behind.
        state.mark_awaiting_approval()?;
        self.store.save(state).await?;
        self.events.emit(
            &state.task_id,
            TaskEventKind::ApprovalRequested {
                tool_name: name.to_string(),
            },
        );

        let description = state.description.clone();
        let granted = tokio::select! {
            granted = self.gate.request_manual(name, arguments, &description) => Some(granted),
            _ = self.cancel.cancelled() => None,
        };
        let Some(granted) = granted else {
            return Ok(None);
        };

        state.reset_auto_approvals();
        state.mark_running()?;
        // A denial is persisted by the caller in one write together
        // with the rejected execution record.
        if granted {
            self.store.save(state).await?;
        }
        self.events.emit(
            &state.task_id,
            TaskEventKind::ApprovalResolved {
                tool_name: name.to_string(),
                granted,
                manual: true,
            },
        );
        Ok(Some(if granted {
            ApprovalDecision::Granted { manual: true }
        } else {
            ApprovalDecision::Denied
        }))
    }

    /// Runs one breakpoint check, racing cancellation. Returns false
    /// when the task was cancelled while paused.
    async fn debug_check(
        &self,
        point: BreakpointKind,
        state: &TaskState,
        iteration: u32,
    ) -> AgentResult<bool> {
        let Some(controller) = &self.debug else {
            return Ok(true);
        };
        let outcome = tokio::select! {
            res = controller.check(point, state, iteration, &self.events) => Some(res),
            _ = self.cancel.cancelled() => None,
        };
        match outcome {
            Some(res) => {
                res?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn finish_cancelled(
        &self,
        state: &mut TaskState,
        iterations: u32,
    ) -> AgentResult<TaskResult> {
        state.mark_failed(FailureReason::Cancelled)?;
        self.store.save(state).await?;
        self.emit_finished(state);
        Ok(self.result_from(state, None, iterations))
    }

    async fn finish_iteration_limit(
        &self,
        state: &mut TaskState,
        iterations: u32,
    ) -> AgentResult<TaskResult> {
        state.mark_failed(FailureReason::IterationLimitExceeded)?;
        self.store.save(state).await?;
        self.emit_finished(state);
        Ok(self.result_from(state, None, iterations))
    }

    /// Provider failures persist the failed state, then surface as an
    /// error rather than an orderly failed result.
    async fn fail_provider(
        &self,
        state: &mut TaskState,
        err: AgentError,
    ) -> AgentResult<TaskResult> {
        state.mark_failed(FailureReason::ProviderError)?;
        self.store.save(state).await?;
        self.emit_finished(state);
        Err(err)
    }

    /// Marks the state failed after a storage error and attempts one
    /// final save. When that save also fails, the store keeps the last
    /// acknowledged state; the original error is returned either way.
    async fn fail_storage(&self, state: &mut TaskState, error: AgentError) -> AgentError {
        if state.mark_failed(FailureReason::StorageError).is_ok() {
            let _ = self.store.save(state).await;
            self.emit_finished(state);
        }
        error
    }

    fn emit_finished(&self, state: &TaskState) {
        self.events.emit(
            &state.task_id,
            TaskEventKind::TaskFinished {
                status: state.status,
                failure: state.failure,
            },
        );
    }

    fn result_from(&self, state: &TaskState, result: Option<String>, iterations: u32) -> TaskResult {
        TaskResult {
            task_id: state.task_id.clone(),
            status: state.status,
            failure: state.failure,
            result,
            iterations,
            state: state.clone(),
        }
    }
}

fn outcome_value(outcome: &ToolOutcome) -> Value {
    serde_json::to_value(outcome).unwrap_or(Value::Null)
}
