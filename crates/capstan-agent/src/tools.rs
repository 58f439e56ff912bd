//! Tool registry and execution plumbing.
//!
//! The registry never returns an error from `execute`: unknown tools,
//! panicking executors, and domain failures all come back as structured
//! outcomes so the loop can record them and keep going.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use capstan_taskstore::ToolOutcomeKind;
use serde_json::Value;

/// Boxed future produced by a tool executor.
pub type ToolFuture = Pin<Box<dyn Future<Output = ToolOutcome> + Send>>;

/// Callable body of a tool.
pub type ToolExecutor = Arc<dyn Fn(Value) -> ToolFuture + Send + Sync>;

/// Wraps an async closure into a [`ToolExecutor`].
pub fn executor_fn<F, Fut>(body: F) -> ToolExecutor
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ToolOutcome> + Send + 'static,
{
    Arc::new(move |arguments| Box::pin(body(arguments)))
}

/// Tool metadata advertised to the action provider.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// Free-form schema of the arguments, passed through to the
    /// provider untouched.
    pub parameters: Value,
}

/// Structured result of one tool invocation.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ToolOutcome {
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub data: Value,
}

impl ToolOutcome {
    pub fn ok(message: impl Into<String>, data: Value) -> Self {
        ToolOutcome {
            success: true,
            message: message.into(),
            data,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        ToolOutcome {
            success: false,
            message: message.into(),
            data: Value::Null,
        }
    }
}

/// A descriptor plus the executor behind it.
#[derive(Clone)]
pub struct RegisteredTool {
    pub descriptor: ToolDescriptor,
    pub executor: ToolExecutor,
}

impl RegisteredTool {
    pub fn new(descriptor: ToolDescriptor, executor: ToolExecutor) -> Self {
        RegisteredTool {
            descriptor,
            executor,
        }
    }
}

/// Name-keyed collection of the tools one task may call.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool, replacing any previous tool of the same name.
    pub fn register(&mut self, descriptor: ToolDescriptor, executor: ToolExecutor) {
        self.tools.insert(
            descriptor.name.clone(),
            RegisteredTool::new(descriptor, executor),
        );
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Catalogue handed to the provider on every call.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools
            .values()
            .map(|tool| tool.descriptor.clone())
            .collect()
    }

    /// Runs a tool and classifies the outcome for the execution record.
    ///
    /// Unknown tools and panicking executors are reported as
    /// `exception` outcomes instead of surfacing an error.
    pub async fn execute(&self, name: &str, arguments: Value) -> (ToolOutcome, ToolOutcomeKind) {
        let Some(tool) = self.tools.get(name) else {
            return (
                ToolOutcome::failure(format!("unknown tool: {name}")),
                ToolOutcomeKind::Exception,
            );
        };
        let future = (tool.executor)(arguments);
        match tokio::spawn(future).await {
            Ok(outcome) => {
                let kind = if outcome.success {
                    ToolOutcomeKind::Success
                } else {
                    ToolOutcomeKind::ToolError
                };
                (outcome, kind)
            }
            Err(err) if err.is_panic() => (
                ToolOutcome::failure(format!("tool {name} panicked")),
                ToolOutcomeKind::Exception,
            ),
            Err(_) => (
                ToolOutcome::failure(format!("tool {name} was aborted")),
                ToolOutcomeKind::Exception,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(
            ToolDescriptor {
                name: "echo".to_string(),
                description: "Echoes the text argument back".to_string(),
                parameters: serde_json::json!({"text": "string"}),
            },
            executor_fn(|arguments| async move {
                match arguments.get("text").and_then(Value::as_str) {
                    Some(text) => {
                        ToolOutcome::ok(format!("echo: {text}"), serde_json::json!({"echo": text}))
                    }
                    None => ToolOutcome::failure("missing text argument"),
                }
            }),
        );
        registry
    }

    #[tokio::test(flavor = "current_thread")]
    async fn successful_execution_is_classified_success() {
        let registry = echo_registry();
        let (outcome, kind) = registry
            .execute("echo", serde_json::json!({"text": "hi"}))
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.message, "echo: hi");
        assert_eq!(kind, ToolOutcomeKind::Success);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn domain_failure_is_classified_tool_error() {
        let registry = echo_registry();
        let (outcome, kind) = registry.execute("echo", serde_json::json!({})).await;
        assert!(!outcome.success);
        assert_eq!(kind, ToolOutcomeKind::ToolError);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn unknown_tool_is_classified_exception() {
        let registry = echo_registry();
        let (outcome, kind) = registry.execute("missing", Value::Null).await;
        assert!(!outcome.success);
        assert_eq!(outcome.message, "unknown tool: missing");
        assert_eq!(kind, ToolOutcomeKind::Exception);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn panicking_executor_is_contained() {
        let mut registry = ToolRegistry::new();
        registry.register(
            ToolDescriptor {
                name: "boom".to_string(),
                description: "Always panics".to_string(),
                parameters: Value::Null,
            },
            executor_fn(|_| async { panic!("tool exploded") }),
        );

        let (outcome, kind) = registry.execute("boom", Value::Null).await;
        assert!(!outcome.success);
        assert_eq!(kind, ToolOutcomeKind::Exception);
    }

    #[test]
    fn reregistering_replaces_the_tool() {
        let mut registry = echo_registry();
        registry.register(
            ToolDescriptor {
                name: "echo".to_string(),
                description: "Replacement".to_string(),
                parameters: Value::Null,
            },
            executor_fn(|_| async { ToolOutcome::failure("replaced") }),
        );
        assert_eq!(registry.descriptors().len(), 1);
        assert_eq!(registry.descriptors()[0].description, "Replacement");
    }
}
