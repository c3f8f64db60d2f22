//! LLM Client module.
//!
//! This module defines the `LlmProvider` trait that abstracts over the
//! streaming chat-completion endpoints, and the retry policy applied when
//! opening a stream.
//!
//! Key concepts:
//! - **Trait**: a provider only has to open a raw SSE byte stream; parsing
//!   and merging happen in [`crate::stream`] so every provider shares them
//! - **async_trait**: lets the trait carry async methods and stay object safe
//! - **Retry**: transient failures while opening are retried a fixed number
//!   of times with a fixed delay, anything else surfaces immediately

pub mod openai_compatible;

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;

use crate::error::ChatError;
use crate::monadic::ProviderKind;
use crate::types::ChatRequest;

/// Raw response body of a streaming request.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ChatError>> + Send>>;

/// Trait that all LLM providers must implement.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send a streaming chat completion request and return the SSE body.
    ///
    /// Errors returned here happen before any output was produced, which is
    /// what makes them safe to retry.
    async fn open_stream(&self, request: &ChatRequest) -> Result<ByteStream, ChatError>;

    /// Return the provider's display name (for logging and cache keys).
    fn name(&self) -> &str;

    /// Provider family, decides the monadic response format.
    fn kind(&self) -> ProviderKind;
}

/// Fixed-count, fixed-delay retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            delay: Duration::from_secs(1),
        }
    }
}

/// Open a stream, retrying transient failures according to `policy`.
pub async fn open_with_retry(
    provider: &dyn LlmProvider,
    request: &ChatRequest,
    policy: RetryPolicy,
) -> Result<ByteStream, ChatError> {
    let mut attempt = 0;
    loop {
        match provider.open_stream(request).await {
            Ok(stream) => return Ok(stream),
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                attempt += 1;
                tracing::info!(
                    provider = provider.name(),
                    attempt,
                    max_retries = policy.max_retries,
                    error = %e,
                    "provider request failed, retrying"
                );
                tokio::time::sleep(policy.delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
