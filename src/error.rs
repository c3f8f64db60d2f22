//! Error taxonomy for a conversation turn.
//!
//! Only a few failures ever reach the caller of a turn: transport failures
//! (after retries), provider API errors, an exceeded tool-call depth, and
//! cancellation. Malformed stream frames, tool failures and unparseable
//! monadic payloads are absorbed where they happen and never show up here.

use thiserror::Error;

/// Terminal failure of a conversation turn.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Transport failure reaching the provider (refused, reset, DNS, ...).
    #[error("connection error: {0}")]
    Connection(String),

    /// The provider did not answer within the configured timeouts.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// The provider answered with a non-success status or an error frame.
    /// `status` is 0 when the error arrived inside an otherwise successful
    /// stream.
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// A chain of tool calls went deeper than the configured limit.
    #[error("call depth exceeded: {depth} > {limit}")]
    DepthExceeded { depth: u32, limit: u32 },

    /// The host cancelled the in-flight turn.
    #[error("turn cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ChatError {
    /// Short machine-readable type, used as the `type` of UI error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            ChatError::Connection(_) => "connection",
            ChatError::Timeout(_) => "timeout",
            ChatError::Api { .. } => "api",
            ChatError::DepthExceeded { .. } => "depth_exceeded",
            ChatError::Cancelled => "cancelled",
            ChatError::Config(_) => "config",
            ChatError::Serialization(_) => "serialization",
        }
    }

    /// Whether the provider call that produced this error may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, ChatError::Connection(_) | ChatError::Timeout(_))
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ChatError::Timeout(err.to_string())
        } else if err.is_decode() {
            ChatError::Connection(format!("malformed response body: {err}"))
        } else {
            ChatError::Connection(err.to_string())
        }
    }
}
