//! Tool call dispatch.
//!
//! Executes a batch of completed tool calls against a [`FunctionRegistry`].
//! Nothing in here fails: bad arguments become an empty object, and a tool
//! that errors or panics produces an `ERROR: ...` result while the rest of
//! the batch keeps running.

use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;
use serde::Serialize;
use serde_json::Value;

use super::{FunctionRegistry, ToolArgs};
use crate::types::{ChatMessage, ToolCall};

/// Outcome of one tool call, fed back to the model as a `tool` message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub name: String,
    pub content: String,
}

impl ToolResult {
    pub fn into_message(self) -> ChatMessage {
        ChatMessage::tool_result(self.tool_call_id, self.name, self.content)
    }

    pub fn is_error(&self) -> bool {
        self.content.starts_with("ERROR: ")
    }
}

/// Parse streamed tool arguments leniently.
///
/// Anything that is not a JSON object yields an empty map. `null` values,
/// empty strings and the literal string `"null"` are dropped, since providers
/// emit them for optional parameters they did not fill.
pub fn parse_arguments(raw: &str) -> ToolArgs {
    let parsed = match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map,
        Ok(_) => ToolArgs::new(),
        Err(e) => {
            if !raw.trim().is_empty() {
                tracing::debug!(error = %e, "tool arguments are not valid JSON, using {{}}");
            }
            ToolArgs::new()
        }
    };

    parsed
        .into_iter()
        .filter(|(_, v)| match v {
            Value::Null => false,
            Value::String(s) => !(s.is_empty() || s == "null"),
            _ => true,
        })
        .collect()
}

/// Run every tool call in order and collect their results.
pub async fn dispatch(tool_calls: &[ToolCall], registry: &dyn FunctionRegistry) -> Vec<ToolResult> {
    let mut results = Vec::with_capacity(tool_calls.len());

    for call in tool_calls {
        let content = match registry.get(&call.name) {
            None => {
                tracing::warn!(tool = %call.name, "model called an unknown function");
                format!("ERROR: unknown function '{}'", call.name)
            }
            Some(tool) => {
                let args = parse_arguments(&call.arguments);
                let outcome = AssertUnwindSafe(tool.execute(args)).catch_unwind().await;
                match outcome {
                    Ok(Ok(output)) => output,
                    Ok(Err(e)) => {
                        tracing::warn!(tool = %call.name, error = %e, "tool returned an error");
                        format!("ERROR: {e}")
                    }
                    Err(panic) => {
                        let reason = panic
                            .downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .or_else(|| panic.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "tool panicked".to_string());
                        tracing::warn!(tool = %call.name, %reason, "tool panicked");
                        format!("ERROR: {reason}")
                    }
                }
            }
        };

        results.push(ToolResult {
            tool_call_id: call.id.clone(),
            name: call.name.clone(),
            content,
        });
    }

    results
}
