//! Breakpoint condition expressions.
//!
//! Grammar: clauses joined by `&&`; each clause is `key=value`,
//! `key!=value`, or a bare `key` (present and truthy). Keys address the
//! live task state; values parse as JSON scalars with a bare-string
//! fallback, so `iteration=3`, `status=running`, and
//! `metadata.dry_run=true` all read the way they look.
//!
//! Conditions guard breakpoints, so the failure mode is deliberate:
//! malformed clauses and unresolvable keys evaluate false and the
//! breakpoint stays quiet.

use capstan_taskstore::TaskState;
use serde_json::Value;

/// Read-only view of the loop state a condition can address.
pub struct ConditionContext<'a> {
    pub state: &'a TaskState,
    pub iteration: u32,
}

/// Evaluates `expression` against `ctx`. Empty expressions are false.
pub fn evaluate(expression: &str, ctx: &ConditionContext<'_>) -> bool {
    let trimmed = expression.trim();
    if trimmed.is_empty() {
        return false;
    }
    trimmed
        .split("&&")
        .all(|clause| evaluate_clause(clause.trim(), ctx))
}

fn evaluate_clause(clause: &str, ctx: &ConditionContext<'_>) -> bool {
    if clause.is_empty() {
        return false;
    }
    if let Some((key, expected)) = clause.split_once("!=") {
        let Some(actual) = resolve(key.trim(), ctx) else {
            return false;
        };
        actual != parse_value(expected.trim())
    } else if let Some((key, expected)) = clause.split_once('=') {
        let Some(actual) = resolve(key.trim(), ctx) else {
            return false;
        };
        actual == parse_value(expected.trim())
    } else {
        resolve(clause, ctx)
            .map(|value| is_truthy(&value))
            .unwrap_or(false)
    }
}

fn resolve(key: &str, ctx: &ConditionContext<'_>) -> Option<Value> {
    if let Some(meta_key) = key.strip_prefix("metadata.") {
        return ctx.state.metadata.get(meta_key).cloned();
    }
    match key {
        "status" => Some(Value::String(ctx.state.status.as_str().to_string())),
        "iteration" => Some(Value::from(ctx.iteration)),
        "last_tool" => ctx
            .state
            .tool_executions
            .last()
            .map(|record| Value::String(record.tool_name.clone())),
        "tool_count" => Some(Value::from(ctx.state.tool_executions.len() as u64)),
        "message_count" => Some(Value::from(ctx.state.messages.len() as u64)),
        _ => None,
    }
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(entries) => !entries.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capstan_taskstore::{current_timestamp, ToolExecutionRecord, ToolOutcomeKind};
    use std::collections::BTreeMap;

    fn sample_state() -> TaskState {
        let mut state = TaskState::new("condition demo");
        state.record_tool_execution(ToolExecutionRecord {
            tool_name: "write_file".to_string(),
            arguments: serde_json::json!({"path": "notes.txt"}),
            result: serde_json::json!({"success": true}),
            started_at: current_timestamp(),
            finished_at: current_timestamp(),
            outcome: ToolOutcomeKind::Success,
        });
        state.update_metadata(BTreeMap::from([
            ("dry_run".to_string(), serde_json::json!(true)),
            ("phase".to_string(), serde_json::json!("apply")),
            ("retries".to_string(), serde_json::json!(0)),
        ]));
        state
    }

    #[test]
    fn clause_table() {
        let state = sample_state();
        let ctx = ConditionContext {
            state: &state,
            iteration: 3,
        };
        let table = [
            ("status=pending", true),
            ("status=running", false),
            ("status!=running", true),
            ("iteration=3", true),
            ("iteration=4", false),
            ("iteration!=4", true),
            ("last_tool=write_file", true),
            ("last_tool=echo", false),
            ("tool_count=1", true),
            ("message_count=0", true),
            ("metadata.phase=apply", true),
            ("metadata.phase!=apply", false),
            ("metadata.dry_run", true),
            ("metadata.retries", false),
            ("metadata.missing", false),
            ("iteration=3 && last_tool=write_file", true),
            ("iteration=3 && last_tool=echo", false),
            ("iteration=3 && metadata.dry_run && status=pending", true),
        ];
        for (expression, expected) in table {
            assert_eq!(
                evaluate(expression, &ctx),
                expected,
                "expression {expression:?}"
            );
        }
    }

    #[test]
    fn malformed_expressions_never_fire() {
        let state = sample_state();
        let ctx = ConditionContext {
            state: &state,
            iteration: 1,
        };
        for expression in ["", "   ", "&&", "iteration=3 &&", "unknown_key=1", ">=3", "=running"] {
            assert!(!evaluate(expression, &ctx), "expression {expression:?}");
        }
    }

    #[test]
    fn last_tool_is_unresolvable_before_any_execution() {
        let state = TaskState::new("fresh");
        let ctx = ConditionContext {
            state: &state,
            iteration: 1,
        };
        assert!(!evaluate("last_tool=write_file", &ctx));
        assert!(!evaluate("last_tool", &ctx));
    }
}
