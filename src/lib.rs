//! Streaming core of a multi-provider chat application.
//!
//! Provider SSE bytes are parsed into frames, merged into messages, tool
//! calls are dispatched to an injected registry, and in monadic mode the
//! final reply is validated into a `{message, context}` envelope. The
//! [`agent::Agent`] drives one conversation turn through all of it.

pub mod agent;
pub mod cache;
pub mod config;
pub mod error;
pub mod llm;
pub mod monadic;
pub mod perf;
pub mod session;
pub mod stream;
pub mod tools;
pub mod types;

pub use agent::{Agent, TurnOutcome};
pub use cache::{cache_key, monadic_cache_key, ResponseCache};
pub use config::RuntimeConfig;
pub use error::ChatError;
pub use monadic::{MonadicEnvelope, MonadicSchema, ProviderKind};
pub use perf::PerformanceMonitor;
pub use session::{BudgetReport, ConversationMessage, ConversationSession, TiktokenCounter, Tokenizer};
pub use tools::{FunctionRegistry, Tool, ToolRouter};
pub use types::{ChatMessage, RequestParameters, Role, UiEvent};
