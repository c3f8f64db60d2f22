//! Conversation session: the ordered message log of one chat and the
//! token/message budget that decides which turns are sent as context.
//!
//! Messages only ever move from active to inactive as the budget evicts the
//! oldest ones; they disappear from the log only through an explicit
//! [`ConversationSession::delete`] or [`ConversationSession::reset`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ChatError;
use crate::monadic::MonadicEnvelope;
use crate::types::{RequestParameters, Role};

// --- Tokenizer ---

#[derive(Debug, thiserror::Error)]
#[error("tokenizer unavailable: {0}")]
pub struct TokenizerError(pub String);

/// Counts tokens for budget decisions. Failures are tolerated by the
/// session: the message gets a count of zero and reports carry an error.
pub trait Tokenizer: Send + Sync {
    fn count_tokens(&self, text: &str, model: &str) -> Result<usize, TokenizerError>;

    fn encoding_name(&self) -> &str;
}

/// `cl100k_base` BPE counter.
pub struct TiktokenCounter {
    bpe: Option<tiktoken_rs::CoreBPE>,
}

impl TiktokenCounter {
    pub fn new() -> Self {
        let bpe = match tiktoken_rs::cl100k_base() {
            Ok(bpe) => Some(bpe),
            Err(e) => {
                tracing::warn!(error = %e, "failed to load cl100k_base, token counts disabled");
                None
            }
        };
        Self { bpe }
    }
}

impl Default for TiktokenCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl Tokenizer for TiktokenCounter {
    fn count_tokens(&self, text: &str, _model: &str) -> Result<usize, TokenizerError> {
        match &self.bpe {
            Some(bpe) => Ok(bpe.encode_with_special_tokens(text).len()),
            None => Err(TokenizerError("cl100k_base not loaded".to_string())),
        }
    }

    fn encoding_name(&self) -> &str {
        "cl100k_base"
    }
}

// --- Messages ---

/// A persisted turn of the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub message_id: String,
    pub role: Role,
    pub text: String,
    /// Rendered form, owned by the host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    pub tokens: usize,
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
    pub created_at: String,
}

/// Result of a budget pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetReport {
    /// Whether any message was deactivated by this pass
    pub changed: bool,
    pub count_total_system_tokens: usize,
    pub count_total_input_tokens: usize,
    pub count_total_output_tokens: usize,
    pub count_total_active_tokens: usize,
    pub count_all_tokens: usize,
    pub count_messages: usize,
    pub count_active_messages: usize,
    pub encoding_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Everything a session owns for the life of a chat.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionState {
    pub messages: Vec<ConversationMessage>,
    pub parameters: RequestParameters,
    /// Tool-call recursion depth of the current turn
    pub call_depth: u32,
    /// Running monadic context, threaded through user messages
    #[serde(default)]
    pub monadic_context: serde_json::Map<String, serde_json::Value>,
}

/// Id given to the synthesized system message in built contexts.
pub const INITIAL_PROMPT_ID: &str = "initial";

fn generate_message_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

fn now_timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Owns the message log of one conversation. Not shared across workers.
pub struct ConversationSession {
    state: SessionState,
    tokenizer: Arc<dyn Tokenizer>,
    tokenizer_failed: bool,
}

impl ConversationSession {
    pub fn new(tokenizer: Arc<dyn Tokenizer>, parameters: RequestParameters) -> Self {
        Self {
            state: SessionState {
                parameters,
                ..Default::default()
            },
            tokenizer,
            tokenizer_failed: false,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn messages(&self) -> &[ConversationMessage] {
        &self.state.messages
    }

    pub fn get(&self, message_id: &str) -> Option<&ConversationMessage> {
        self.state.messages.iter().find(|m| m.message_id == message_id)
    }

    pub fn parameters(&self) -> &RequestParameters {
        &self.state.parameters
    }

    pub fn set_parameters(&mut self, parameters: RequestParameters) {
        self.state.parameters = parameters;
    }

    pub fn monadic_context(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.state.monadic_context
    }

    pub fn set_monadic_context(&mut self, context: serde_json::Map<String, serde_json::Value>) {
        self.state.monadic_context = context;
    }

    /// Wrap user text with the running monadic context.
    pub fn monadic_unit(&self, text: &str) -> String {
        crate::monadic::monadic_unit(text, &self.state.monadic_context)
    }

    /// Adopt the context of a validated response as the running context.
    pub fn monadic_map(&mut self, envelope: &MonadicEnvelope) {
        self.state.monadic_context = envelope.context.clone();
    }

    fn count(&mut self, text: &str) -> usize {
        let model = self.state.parameters.model.as_deref().unwrap_or_default();
        match self.tokenizer.count_tokens(text, model) {
            Ok(n) => n,
            Err(e) => {
                if !self.tokenizer_failed {
                    tracing::warn!(error = %e, "token counting failed, counting as 0");
                }
                self.tokenizer_failed = true;
                0
            }
        }
    }

    /// Append a message and return its id. New messages start active.
    pub fn append(&mut self, role: Role, text: impl Into<String>, images: Option<Vec<String>>) -> String {
        let text = text.into();
        let tokens = self.count(&text);
        let message_id = generate_message_id();
        self.state.messages.push(ConversationMessage {
            message_id: message_id.clone(),
            role,
            text,
            html: None,
            tokens,
            active: true,
            images,
            created_at: now_timestamp(),
        });
        message_id
    }

    /// Replace a message's text and recount its tokens.
    pub fn edit(&mut self, message_id: &str, text: impl Into<String>) -> bool {
        let text = text.into();
        let tokens = self.count(&text);
        match self
            .state
            .messages
            .iter_mut()
            .find(|m| m.message_id == message_id)
        {
            Some(message) => {
                message.text = text;
                message.html = None;
                message.tokens = tokens;
                true
            }
            None => false,
        }
    }

    /// Remove a message from the log entirely.
    pub fn delete(&mut self, message_id: &str) -> bool {
        let before = self.state.messages.len();
        self.state.messages.retain(|m| m.message_id != message_id);
        self.state.messages.len() != before
    }

    /// Forget everything: messages, parameters, depth and monadic context.
    pub fn reset(&mut self) {
        self.state = SessionState::default();
        self.tokenizer_failed = false;
    }

    /// Deactivate the oldest active messages until the active set fits both
    /// limits. A limit of zero means that dimension is unlimited.
    pub fn enforce_budget(&mut self, max_tokens: usize, max_messages: usize) -> BudgetReport {
        let mut active_tokens: usize = self
            .state
            .messages
            .iter()
            .filter(|m| m.active)
            .map(|m| m.tokens)
            .sum();
        let mut active_count = self.state.messages.iter().filter(|m| m.active).count();
        let over = |tokens: usize, count: usize| {
            (max_tokens > 0 && tokens > max_tokens) || (max_messages > 0 && count > max_messages)
        };

        let mut changed = false;
        for message in self.state.messages.iter_mut() {
            if !over(active_tokens, active_count) {
                break;
            }
            if message.active {
                message.active = false;
                active_tokens -= message.tokens;
                active_count -= 1;
                changed = true;
            }
        }

        if changed {
            tracing::debug!(active_count, active_tokens, "budget evicted old messages");
        }
        self.report(changed)
    }

    fn report(&self, changed: bool) -> BudgetReport {
        let sum_role = |role: Role| -> usize {
            self.state
                .messages
                .iter()
                .filter(|m| m.role == role)
                .map(|m| m.tokens)
                .sum()
        };
        let active = self.state.messages.iter().filter(|m| m.active);

        BudgetReport {
            changed,
            count_total_system_tokens: sum_role(Role::System),
            count_total_input_tokens: sum_role(Role::User),
            count_total_output_tokens: sum_role(Role::Assistant),
            count_total_active_tokens: active.clone().map(|m| m.tokens).sum(),
            count_all_tokens: self.state.messages.iter().map(|m| m.tokens).sum(),
            count_messages: self.state.messages.len(),
            count_active_messages: active.count(),
            encoding_name: self.tokenizer.encoding_name().to_string(),
            error: self
                .tokenizer_failed
                .then(|| "Token count not available".to_string()),
        }
    }

    /// Initial system message plus the last `context_size` messages.
    ///
    /// Messages inside the window are marked active and everything before it
    /// inactive. Derived from the full log on every call.
    pub fn build_context(&mut self, initial_prompt: &str, context_size: usize) -> Vec<ConversationMessage> {
        let start = self.state.messages.len().saturating_sub(context_size);
        for (i, message) in self.state.messages.iter_mut().enumerate() {
            message.active = i >= start;
        }

        let mut context = Vec::with_capacity(context_size + 1);
        if let Some(initial) = self.initial_message(initial_prompt) {
            context.push(initial);
        }
        context.extend(self.state.messages[start..].iter().cloned());
        context
    }

    /// Initial system message plus every message that is still active.
    pub fn active_context(&mut self, initial_prompt: &str) -> Vec<ConversationMessage> {
        let mut context = Vec::new();
        if let Some(initial) = self.initial_message(initial_prompt) {
            context.push(initial);
        }
        context.extend(self.state.messages.iter().filter(|m| m.active).cloned());
        context
    }

    fn initial_message(&mut self, initial_prompt: &str) -> Option<ConversationMessage> {
        if initial_prompt.is_empty() {
            return None;
        }
        let text = initial_prompt.replace(
            "{{DATE}}",
            &chrono::Local::now().format("%Y-%m-%d").to_string(),
        );
        let tokens = self.count(&text);
        Some(ConversationMessage {
            message_id: INITIAL_PROMPT_ID.to_string(),
            role: Role::System,
            text,
            html: None,
            tokens,
            active: true,
            images: None,
            created_at: now_timestamp(),
        })
    }

    /// Start a turn: tool-call recursion begins again at depth zero.
    pub fn begin_turn(&mut self) {
        self.state.call_depth = 0;
    }

    pub fn call_depth(&self) -> u32 {
        self.state.call_depth
    }

    /// Enter one more tool round, failing once the depth passes `limit`.
    pub fn enter_tool_round(&mut self, limit: u32) -> Result<u32, ChatError> {
        self.state.call_depth += 1;
        if self.state.call_depth > limit {
            return Err(ChatError::DepthExceeded {
                depth: self.state.call_depth,
                limit,
            });
        }
        Ok(self.state.call_depth)
    }
}
