//! Monadic envelope validation.
//!
//! [`validate_str`] and [`validate_value`] are total: whatever a provider
//! sends back, the caller gets a [`MonadicEnvelope`]. Problems are recorded
//! inside `context` (`parse_error`, `validation_errors`) instead of being
//! returned as errors.
//!
//! Parsing tries, in order:
//! 1. the input as-is
//! 2. one level of string escaping removed (double-encoded JSON)
//! 3. a stray `{"` prefix stripped and the remaining braces balanced
//! 4. the raw text wrapped as the message, flagged with `parse_error`

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::MonadicSchema;

pub const VALIDATION_ERRORS_KEY: &str = "validation_errors";
pub const PARSE_ERROR_KEY: &str = "parse_error";

/// Validated `{message, context}` response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonadicEnvelope {
    pub message: String,
    pub context: Map<String, Value>,
}

impl MonadicEnvelope {
    pub fn new(message: impl Into<String>, context: Map<String, Value>) -> Self {
        Self {
            message: message.into(),
            context,
        }
    }

    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("message".into(), Value::String(self.message.clone()));
        obj.insert("context".into(), Value::Object(self.context.clone()));
        Value::Object(obj)
    }

    /// Compact JSON, `message` first.
    pub fn to_json_string(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn has_parse_error(&self) -> bool {
        self.context.get(PARSE_ERROR_KEY) == Some(&Value::Bool(true))
    }

    pub fn validation_errors(&self) -> Vec<&str> {
        self.context
            .get(VALIDATION_ERRORS_KEY)
            .and_then(Value::as_array)
            .map(|errs| errs.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }
}

/// Validate raw response text.
pub fn validate_str(raw: &str, schema: MonadicSchema) -> MonadicEnvelope {
    match parse_lenient(raw) {
        Some(Value::Object(map)) => normalize(map, schema),
        Some(other) => {
            let message = match other {
                Value::String(s) => s,
                v => v.to_string(),
            };
            normalize_envelope(MonadicEnvelope::new(message, Map::new()), Vec::new(), schema)
        }
        None => {
            tracing::warn!(len = raw.len(), "monadic response is not JSON, wrapping as text");
            let mut context = Map::new();
            context.insert(PARSE_ERROR_KEY.into(), Value::Bool(true));
            normalize_envelope(MonadicEnvelope::new(raw, context), Vec::new(), schema)
        }
    }
}

/// Validate an already-parsed value. Strings go through [`validate_str`].
pub fn validate_value(value: &Value, schema: MonadicSchema) -> MonadicEnvelope {
    match value {
        Value::Object(map) => normalize(map.clone(), schema),
        Value::String(s) => validate_str(s, schema),
        other => validate_str(&other.to_string(), schema),
    }
}

fn parse_lenient(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        // A JSON string that itself holds an object
        if let Value::String(inner) = &value {
            if let Ok(obj @ Value::Object(_)) = serde_json::from_str::<Value>(inner) {
                return Some(obj);
            }
        }
        return Some(value);
    }

    if let Some(obj) = unescape_object(trimmed) {
        tracing::debug!("recovered double-encoded monadic response");
        return Some(obj);
    }

    if let Some(obj) = repair_stray_prefix(trimmed) {
        tracing::debug!("recovered monadic response with stray prefix");
        return Some(obj);
    }

    None
}

/// `{\"message\": ...}` with one level of escaping left on it.
fn unescape_object(text: &str) -> Option<Value> {
    let unquoted: String = serde_json::from_str(&format!("\"{}\"", text)).ok()?;
    match serde_json::from_str::<Value>(&unquoted) {
        Ok(obj @ Value::Object(_)) => Some(obj),
        _ => None,
    }
}

/// `{"{"message": ...}` where the real object starts at the second brace.
fn repair_stray_prefix(text: &str) -> Option<Value> {
    if !text.starts_with("{\"{") {
        return None;
    }
    let start = text[1..].find('{')? + 1;
    let candidate = &text[start..];

    let attempt = |s: &str| -> Option<Value> {
        match serde_json::from_str::<Value>(s) {
            Ok(obj @ Value::Object(_)) => Some(obj),
            _ => unescape_object(s),
        }
    };

    attempt(candidate).or_else(|| attempt(balance_braces(candidate)))
}

/// Cut `text` after the brace that closes its first object.
fn balance_braces(text: &str) -> &str {
    let mut depth = 0i32;
    for (i, c) in text.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return &text[..=i];
                }
            }
            _ => {}
        }
    }
    text
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn normalize(mut map: Map<String, Value>, schema: MonadicSchema) -> MonadicEnvelope {
    let mut errors = Vec::new();

    let message = match map.remove("message") {
        Some(Value::String(s)) => s,
        None | Some(Value::Null) => {
            errors.push("Missing required field: message".to_string());
            String::new()
        }
        Some(other) => {
            errors.push(format!(
                "Field 'message' must be a string, got {}",
                type_name(&other)
            ));
            other.to_string()
        }
    };

    let context = match map.remove("context") {
        Some(Value::Object(ctx)) => ctx,
        _ => Map::new(),
    };

    normalize_envelope(MonadicEnvelope::new(message, context), errors, schema)
}

fn normalize_envelope(
    mut envelope: MonadicEnvelope,
    mut errors: Vec<String>,
    schema: MonadicSchema,
) -> MonadicEnvelope {
    if schema == MonadicSchema::ChatPlus {
        check_chat_plus(&envelope.context, &mut errors);
    }

    if !errors.is_empty() {
        tracing::warn!(errors = ?errors, "monadic response failed validation");
        record_errors(&mut envelope.context, errors);
    }
    envelope
}

fn check_chat_plus(context: &Map<String, Value>, errors: &mut Vec<String>) {
    match context.get("reasoning") {
        None => errors.push("Missing required field: context.reasoning".to_string()),
        Some(Value::String(_)) => {}
        Some(other) => errors.push(format!(
            "Field 'context.reasoning' must be a string, got {}",
            type_name(other)
        )),
    }

    for field in ["topics", "people", "notes"] {
        match context.get(field) {
            None => errors.push(format!("Missing required field: context.{}", field)),
            Some(Value::Array(_)) => {}
            Some(other) => errors.push(format!(
                "Field 'context.{}' must be an array, got {}",
                field,
                type_name(other)
            )),
        }
    }
}

/// Append new errors to `context.validation_errors`, skipping ones already
/// recorded so repeated validation leaves the envelope unchanged.
/// The key keeps its position when it already exists.
fn record_errors(context: &mut Map<String, Value>, errors: Vec<String>) {
    let slot = context
        .entry(VALIDATION_ERRORS_KEY)
        .or_insert_with(|| Value::Array(Vec::new()));
    if !slot.is_array() {
        *slot = Value::Array(Vec::new());
    }
    if let Value::Array(recorded) = slot {
        for error in errors {
            let error = Value::String(error);
            if !recorded.contains(&error) {
                recorded.push(error);
            }
        }
    }
}
