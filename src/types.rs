//! Core data types shared by the streaming pipeline, the session and the
//! provider layer.
//!
//! This module defines the message types, tool call structures, stream
//! frames, request parameters and the live UI events that flow between
//! all components.

use serde::{Deserialize, Serialize};

use crate::monadic::MonadicSchema;

// --- Message Roles ---

/// The role of a message in the conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- Tool Call ---

/// A completed tool call request from the LLM.
///
/// `arguments` is the concatenation of every streamed argument chunk. It is
/// expected to be JSON but is not checked here; the dispatcher falls back to
/// an empty object when it is not.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    /// Identifier used to match the tool result back to the request
    pub id: String,
    /// Name of the function to invoke
    pub name: String,
    /// JSON-encoded arguments
    pub arguments: String,
}

/// Describes a tool's interface to the LLM via JSON Schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

// --- Chat Messages ---

/// A single message of an outgoing provider request.
///
/// This is the wire-facing view of the conversation: the session's
/// persisted turns are converted into these, and tool round-trips within a
/// turn are appended as assistant/tool pairs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    /// If the assistant wants to call tools, this will be non-empty
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// For tool result messages, this links back to the tool call ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// For tool result messages, the function that produced the result
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Image URLs (or data URLs) attached to a user message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: vec![],
            tool_call_id: None,
            name: None,
            images: vec![],
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Create an assistant message that includes tool calls.
    pub fn assistant_with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::new(Role::Assistant, content)
        }
    }

    /// Create a tool result message.
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            name: Some(name.into()),
            ..Self::new(Role::Tool, content)
        }
    }
}

/// A complete request to an LLM provider.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    /// Offered functions; empty when tools are disabled
    pub tools: Vec<ToolDefinition>,
    /// Resolved sampling options and mode flags
    pub parameters: RequestParameters,
}

// --- Stream Frames ---

/// Why the provider stopped generating for a choice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    Safety,
    ToolCalls,
    /// Anything else a provider sends; kept verbatim.
    Other(String),
}

impl FinishReason {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "stop" | "end_turn" | "stop_sequence" => FinishReason::Stop,
            "length" | "max_tokens" => FinishReason::Length,
            "safety" | "content_filter" => FinishReason::Safety,
            "tool_calls" | "function_call" | "tool_use" => FinishReason::ToolCalls,
            other => FinishReason::Other(other.to_string()),
        }
    }

    /// Whether this reason closes the message it belongs to.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FinishReason::Stop | FinishReason::Length | FinishReason::ToolCalls
        )
    }
}

/// A partial tool invocation carried by one stream frame.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ToolCallFragment {
    /// Position in the tool-call array of the response
    pub index: usize,
    pub call_id: Option<String>,
    pub function_name: Option<String>,
    pub arguments_chunk: String,
}

/// One decoded provider event.
///
/// Frames are produced by the parser and consumed immediately by the
/// merger; nothing retains them.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StreamFrame {
    /// Response identifier; fragments with the same id belong together
    pub id: String,
    /// Index of the choice this frame belongs to (`n > 1` requests)
    pub choice_index: usize,
    pub delta_text: Option<String>,
    pub delta_tool_calls: Vec<ToolCallFragment>,
    pub finish_reason: Option<FinishReason>,
    /// Present on the final usage chunk when `include_usage` was requested
    pub usage: Option<TokenUsage>,
}

/// Token usage reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

// --- Request Parameters ---

/// Typed request options for a session.
///
/// Every field is optional; unset fields fall back to the runtime
/// configuration defaults when a request is built.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    /// Number of most recent messages sent as context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_size: Option<usize>,
    /// Token budget for the active message window (0 = unlimited)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_input_tokens: Option<usize>,
    /// Explicit `response_format` passed through to the provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<serde_json::Value>,
    /// Whether the app's tools are offered to the model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<bool>,
    /// Monadic mode: responses are `{message, context}` envelopes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monadic: Option<bool>,
    /// Plain JSON mode without the monadic envelope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<MonadicSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_suffix: Option<String>,
}

impl RequestParameters {
    /// Overlay `self` on top of `defaults`: set fields win.
    pub fn merged_over(&self, defaults: &RequestParameters) -> RequestParameters {
        RequestParameters {
            model: self.model.clone().or_else(|| defaults.model.clone()),
            max_tokens: self.max_tokens.or(defaults.max_tokens),
            temperature: self.temperature.or(defaults.temperature),
            top_p: self.top_p.or(defaults.top_p),
            presence_penalty: self.presence_penalty.or(defaults.presence_penalty),
            frequency_penalty: self.frequency_penalty.or(defaults.frequency_penalty),
            context_size: self.context_size.or(defaults.context_size),
            max_input_tokens: self.max_input_tokens.or(defaults.max_input_tokens),
            response_format: self
                .response_format
                .clone()
                .or_else(|| defaults.response_format.clone()),
            tools: self.tools.or(defaults.tools),
            monadic: self.monadic.or(defaults.monadic),
            json: self.json.or(defaults.json),
            schema: self.schema.or(defaults.schema),
            initial_prompt: self
                .initial_prompt
                .clone()
                .or_else(|| defaults.initial_prompt.clone()),
            prompt_suffix: self
                .prompt_suffix
                .clone()
                .or_else(|| defaults.prompt_suffix.clone()),
        }
    }

    pub fn is_monadic(&self) -> bool {
        self.monadic.unwrap_or(false)
    }
}

// --- Live UI Events ---

/// Ordered events pushed to the host's live channel for progressive
/// rendering. Serializes as `{"type": "...", "content": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "lowercase")]
pub enum UiEvent {
    /// A piece of streamed assistant text
    Fragment(String),
    /// Tool calls are being collected or executed
    Wait(String),
    /// Monadic mode: the `{message, context}` merged from every complete
    /// object streamed so far
    Partial(serde_json::Value),
    /// The turn finished; carries the final assistant text
    Message(String),
    /// A human-readable terminal error
    Error(String),
}
