//! Agent Loop - drives one conversation turn.
//!
//! The Agent owns the conversation session and wires the pipeline together:
//!
//! ```text
//! User Input
//!     |
//!     v
//! +---------+   bytes   +--------+  frames  +--------+
//! |Provider |---------->| Parser |--------->| Merger |---> UI fragments
//! +---------+           +--------+          +--------+
//!     ^                                          |
//!     |            tool results                  v
//!     +-------------------------------------- Tools
//!                                                |
//!                                 final text     v
//!                                     Validator / Cache ---> Session
//! ```
//!
//! A turn loops until the model answers without tool calls, the tool-call
//! depth limit is passed, the provider fails, or the host cancels. The
//! session only receives the assistant reply once the whole turn succeeded.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cache::{monadic_cache_key, ResponseCache};
use crate::config::RuntimeConfig;
use crate::error::ChatError;
use crate::llm::{open_with_retry, LlmProvider};
use crate::monadic::{self, MonadicEnvelope, PartialEnvelopeParser};
use crate::perf::PerformanceMonitor;
use crate::session::{BudgetReport, ConversationMessage, ConversationSession, Tokenizer};
use crate::stream::{parse_stream, DeltaMerger, MergeEvent, MergedMessage, StreamEvent};
use crate::tools::{dispatch, FunctionRegistry, ToolResult};
use crate::types::{ChatMessage, ChatRequest, RequestParameters, Role, TokenUsage, UiEvent};

/// Text of the wait event shown while tools run.
pub const TOOL_WAIT_MESSAGE: &str = "CALLING FUNCTIONS";

/// What a finished turn produced.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// Text stored in the session: the reply, or the envelope JSON in
    /// monadic mode
    pub text: String,
    pub envelope: Option<MonadicEnvelope>,
    /// Id of the assistant message appended to the session
    pub message_id: String,
    /// Summed over every provider round of the turn
    pub usage: TokenUsage,
    pub tool_rounds: u32,
    /// Answered from the response cache without calling the provider
    pub cached: bool,
    pub budget: BudgetReport,
}

/// The Agent holds all components and manages the conversation.
pub struct Agent {
    /// The LLM provider
    llm: Box<dyn LlmProvider>,
    /// Functions the model may call
    registry: Box<dyn FunctionRegistry>,
    session: ConversationSession,
    config: RuntimeConfig,
    cache: Option<Arc<ResponseCache>>,
    monitor: Arc<PerformanceMonitor>,
}

impl Agent {
    /// Create a new Agent with the given components.
    pub fn new(
        llm: Box<dyn LlmProvider>,
        registry: Box<dyn FunctionRegistry>,
        tokenizer: Arc<dyn Tokenizer>,
        config: RuntimeConfig,
    ) -> Self {
        let cache = config.cache.enabled.then(|| {
            Arc::new(ResponseCache::new(
                config.cache.capacity,
                std::time::Duration::from_secs(config.cache.ttl_secs),
            ))
        });

        Self {
            llm,
            registry,
            session: ConversationSession::new(tokenizer, RequestParameters::default()),
            config,
            cache,
            monitor: Arc::new(PerformanceMonitor::new()),
        }
    }

    /// Share a process-wide cache with other agents.
    pub fn with_cache(mut self, cache: Arc<ResponseCache>) -> Self {
        if self.config.cache.enabled {
            self.cache = Some(cache);
        }
        self
    }

    pub fn with_monitor(mut self, monitor: Arc<PerformanceMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn session(&self) -> &ConversationSession {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut ConversationSession {
        &mut self.session
    }

    pub fn monitor(&self) -> &PerformanceMonitor {
        &self.monitor
    }

    pub fn cache(&self) -> Option<&ResponseCache> {
        self.cache.as_deref()
    }

    /// Process a user message through the agent loop.
    pub async fn process_message(
        &mut self,
        user_input: &str,
        events: &mpsc::UnboundedSender<UiEvent>,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, ChatError> {
        self.process_message_with_images(user_input, Vec::new(), events, cancel)
            .await
    }

    /// Process a user message with attached image URLs.
    ///
    /// Terminal errors are also pushed to `events` as [`UiEvent::Error`],
    /// except cancellation, which the host asked for.
    pub async fn process_message_with_images(
        &mut self,
        user_input: &str,
        images: Vec<String>,
        events: &mpsc::UnboundedSender<UiEvent>,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, ChatError> {
        let result = self.run_turn(user_input, images, events, cancel).await;
        match &result {
            Ok(outcome) => tracing::info!(
                tool_rounds = outcome.tool_rounds,
                cached = outcome.cached,
                input_tokens = outcome.usage.input_tokens,
                output_tokens = outcome.usage.output_tokens,
                "turn finished"
            ),
            Err(ChatError::Cancelled) => tracing::info!("turn cancelled"),
            Err(e) => {
                tracing::error!(kind = e.kind(), error = %e, "turn failed");
                let _ = events.send(UiEvent::Error(e.to_string()));
            }
        }
        result
    }

    async fn run_turn(
        &mut self,
        user_input: &str,
        images: Vec<String>,
        events: &mpsc::UnboundedSender<UiEvent>,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, ChatError> {
        let params = self
            .session
            .parameters()
            .merged_over(&self.config.request_defaults());
        let model = params
            .model
            .clone()
            .unwrap_or_else(|| self.config.provider.model.clone());
        let max_func_calls = self.config.agent.max_func_calls;

        tracing::info!(provider = self.llm.name(), %model, monadic = params.is_monadic(), "turn started");

        self.session.begin_turn();
        let images = (!images.is_empty()).then_some(images);
        self.session.append(Role::User, user_input, images);

        // Step 1: Decide the context window
        let initial_prompt = params.initial_prompt.clone().unwrap_or_default();
        let context_size = params.context_size.unwrap_or(100);
        self.session.build_context(&initial_prompt, context_size);
        let budget = self
            .session
            .enforce_budget(params.max_input_tokens.unwrap_or(0), context_size);
        let context = self.session.active_context(&initial_prompt);
        let mut messages = self.request_messages(context, &params);

        let schema = params.schema.unwrap_or_default();
        let key = monadic_cache_key(self.llm.name(), &model, schema, &messages);
        if params.is_monadic() {
            if let Some(envelope) = self.cache.as_ref().and_then(|c| c.get(&key)) {
                return Ok(self.complete_monadic(envelope, TokenUsage::default(), 0, true, budget, events));
            }
        }

        let tools = if params.tools.unwrap_or(true) {
            self.registry.definitions()
        } else {
            Vec::new()
        };

        let mut usage = TokenUsage::default();
        let mut tool_rounds = 0;

        // Step 2: Call the provider until it answers without tool calls
        let (reply, streamed) = loop {
            let request = ChatRequest {
                model: model.clone(),
                messages: messages.clone(),
                tools: tools.clone(),
                parameters: params.clone(),
            };

            let round = self
                .monitor
                .measure_async("provider_round", self.stream_round(&request, events, cancel))
                .await?;
            let merged = round.reply;
            if let Some(u) = round.usage {
                usage.input_tokens += u.input_tokens;
                usage.output_tokens += u.output_tokens;
            }

            if !merged.has_tool_calls() {
                break (merged, round.streamed);
            }

            // Step 3: Execute tool calls and feed the results back
            tool_rounds = self.session.enter_tool_round(max_func_calls)?;
            tracing::info!(depth = tool_rounds, calls = merged.tool_calls.len(), "dispatching tool calls");

            let results: Vec<ToolResult> = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ChatError::Cancelled),
                results = dispatch(&merged.tool_calls, self.registry.as_ref()) => results,
            };

            messages.push(ChatMessage::assistant_with_tool_calls(
                merged.text,
                merged.tool_calls,
            ));
            messages.extend(results.into_iter().map(ToolResult::into_message));
        };

        // Step 4: Validate and commit the reply
        if params.is_monadic() {
            // A reply sent as several objects validates as their merge
            let envelope = self.monitor.measure("validate", || match &streamed {
                Some(merged) => monadic::validate_value(merged, schema),
                None => monadic::validate_str(&reply.text, schema),
            });
            if tool_rounds == 0 {
                if let Some(cache) = &self.cache {
                    cache.set(key, envelope.clone());
                }
            }
            return Ok(self.complete_monadic(envelope, usage, tool_rounds, false, budget, events));
        }

        let message_id = self.session.append(Role::Assistant, reply.text.clone(), None);
        let _ = events.send(UiEvent::Message(reply.text.clone()));
        Ok(TurnOutcome {
            text: reply.text,
            envelope: None,
            message_id,
            usage,
            tool_rounds,
            cached: false,
            budget,
        })
    }

    fn complete_monadic(
        &mut self,
        envelope: MonadicEnvelope,
        usage: TokenUsage,
        tool_rounds: u32,
        cached: bool,
        budget: BudgetReport,
        events: &mpsc::UnboundedSender<UiEvent>,
    ) -> TurnOutcome {
        let text = envelope.to_json_string();
        self.session.monadic_map(&envelope);
        let message_id = self.session.append(Role::Assistant, text.clone(), None);
        let _ = events.send(UiEvent::Message(text.clone()));
        TurnOutcome {
            text,
            envelope: Some(envelope),
            message_id,
            usage,
            tool_rounds,
            cached,
            budget,
        }
    }

    /// Convert the session context into request messages. The latest user
    /// message gets the prompt suffix and, in monadic mode, the running
    /// context; neither is stored.
    fn request_messages(
        &self,
        context: Vec<ConversationMessage>,
        params: &RequestParameters,
    ) -> Vec<ChatMessage> {
        let mut messages: Vec<ChatMessage> = context
            .into_iter()
            .map(|m| {
                let mut msg = ChatMessage::new(m.role, m.text);
                msg.images = m.images.unwrap_or_default();
                msg
            })
            .collect();

        if let Some(last_user) = messages.iter_mut().rev().find(|m| m.role == Role::User) {
            if let Some(suffix) = params.prompt_suffix.as_deref().filter(|s| !s.is_empty()) {
                last_user.content = format!("{}\n\n{}", last_user.content, suffix);
            }
            if params.is_monadic() {
                last_user.content = self.session.monadic_unit(&last_user.content);
            }
        }
        messages
    }

    /// One provider round trip: open the stream, merge it, return the reply.
    ///
    /// In monadic mode the streamed text is also scanned for complete
    /// envelope objects, each one reported as a [`UiEvent::Partial`].
    async fn stream_round(
        &self,
        request: &ChatRequest,
        events: &mpsc::UnboundedSender<UiEvent>,
        cancel: &CancellationToken,
    ) -> Result<RoundOutput, ChatError> {
        let open = open_with_retry(self.llm.as_ref(), request, self.config.retry_policy());
        let bytes = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ChatError::Cancelled),
            opened = open => opened?,
        };

        let mut frames = Box::pin(parse_stream(bytes));
        let mut merger = DeltaMerger::new();
        let mut completed = Vec::new();
        let mut partial = request
            .parameters
            .is_monadic()
            .then(PartialEnvelopeParser::new);

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    merger.discard();
                    return Err(ChatError::Cancelled);
                }
                next = frames.next() => next,
            };

            match next {
                None | Some(Ok(StreamEvent::Done)) => break,
                Some(Err(e)) => return Err(e),
                Some(Ok(StreamEvent::ProviderError(message))) => {
                    return Err(ChatError::Api { status: 0, message });
                }
                Some(Ok(StreamEvent::Frame(frame))) => {
                    for event in merger.merge(frame) {
                        match event {
                            MergeEvent::Fragment(text) => {
                                let progressed =
                                    partial.as_mut().is_some_and(|p| p.feed(&text));
                                let _ = events.send(UiEvent::Fragment(text));
                                if let Some(p) = partial.as_ref().filter(|_| progressed) {
                                    let _ = events.send(UiEvent::Partial(p.partial()));
                                }
                            }
                            MergeEvent::ToolWait => {
                                let _ = events.send(UiEvent::Wait(TOOL_WAIT_MESSAGE.to_string()));
                            }
                            MergeEvent::Completed(message) => completed.push(message),
                        }
                    }
                }
            }
        }

        let usage = merger.usage();
        completed.extend(merger.finish());

        // Only the first choice is used
        let reply = match completed.iter().position(|m| m.choice_index == 0) {
            Some(i) => completed.swap_remove(i),
            None if !completed.is_empty() => completed.swap_remove(0),
            None => MergedMessage {
                id: String::new(),
                choice_index: 0,
                text: String::new(),
                tool_calls: Vec::new(),
                finish_reason: None,
            },
        };
        let streamed = partial
            .filter(|p| p.objects_seen() > 1)
            .map(PartialEnvelopeParser::finish);
        Ok(RoundOutput {
            reply,
            usage,
            streamed,
        })
    }
}

struct RoundOutput {
    reply: MergedMessage,
    usage: Option<TokenUsage>,
    /// Merged envelope when the reply streamed as more than one object
    streamed: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monadic::ProviderKind;
    use crate::llm::ByteStream;
    use crate::tools::ToolRouter;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::Mutex;

    struct CharCounter;

    impl Tokenizer for CharCounter {
        fn count_tokens(&self, text: &str, _model: &str) -> Result<usize, crate::session::TokenizerError> {
            Ok(text.len())
        }
        fn encoding_name(&self) -> &str {
            "chars"
        }
    }

    /// Replays one scripted SSE body per call and records the requests.
    struct Scripted {
        bodies: Mutex<Vec<String>>,
        requests: Arc<Mutex<Vec<ChatRequest>>>,
    }

    #[async_trait]
    impl LlmProvider for Scripted {
        async fn open_stream(&self, request: &ChatRequest) -> Result<ByteStream, ChatError> {
            self.requests.lock().unwrap().push(request.clone());
            let body = self.bodies.lock().unwrap().remove(0);
            let chunks = vec![Ok(Bytes::from(body))];
            Ok(Box::pin(futures_util::stream::iter(chunks)))
        }
        fn name(&self) -> &str {
            "scripted"
        }
        fn kind(&self) -> ProviderKind {
            ProviderKind::OpenAi
        }
    }

    fn sse(text: &str) -> String {
        let chunk = serde_json::json!({
            "id": "r1",
            "choices": [{"index": 0, "delta": {"content": text}, "finish_reason": "stop"}]
        });
        format!("data: {}\n\ndata: [DONE]\n\n", chunk)
    }

    fn agent(bodies: Vec<String>, config: RuntimeConfig) -> (Agent, Arc<Mutex<Vec<ChatRequest>>>) {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let provider = Scripted {
            bodies: Mutex::new(bodies),
            requests: requests.clone(),
        };
        let agent = Agent::new(
            Box::new(provider),
            Box::new(ToolRouter::new()),
            Arc::new(CharCounter),
            config,
        );
        (agent, requests)
    }

    #[tokio::test]
    async fn test_prompt_suffix_and_monadic_unit_not_stored() {
        let mut config = RuntimeConfig::default();
        config.request.monadic = true;
        config.request.prompt_suffix = Some("Be brief.".into());
        config.request.initial_prompt = "sys".into();

        let (mut agent, requests) = agent(
            vec![sse(r#"{"message":"ok","context":{"n":1}}"#)],
            config,
        );
        let (tx, _rx) = mpsc::unbounded_channel();
        let outcome = agent
            .process_message("hello", &tx, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.envelope.unwrap().context["n"], 1);

        let sent = requests.lock().unwrap()[0].messages.clone();
        assert_eq!(sent[0].role, Role::System);
        assert_eq!(sent[1].content, r#"{"message":"hello\n\nBe brief.","context":{}}"#);

        let stored = agent.session().messages();
        assert_eq!(stored[0].text, "hello");
        assert_eq!(agent.session().monadic_context()["n"], 1);
    }

    #[tokio::test]
    async fn test_monadic_cache_hit_skips_provider() {
        let mut config = RuntimeConfig::default();
        config.request.monadic = true;
        config.request.context_size = 1;

        let (mut agent, requests) = agent(
            vec![sse(r#"{"message":"cached","context":{}}"#)],
            config,
        );
        let (tx, _rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let first = agent.process_message("same", &tx, &cancel).await.unwrap();
        assert!(!first.cached);

        // Context size 1 makes the second request identical to the first
        agent.session_mut().monadic_map(&MonadicEnvelope::default());
        let second = agent.process_message("same", &tx, &cancel).await.unwrap();
        assert!(second.cached);
        assert_eq!(second.envelope.unwrap().message, "cached");
        assert_eq!(requests.lock().unwrap().len(), 1);
        assert_eq!(agent.cache().unwrap().stats().hits, 1);
    }

    #[tokio::test]
    async fn test_cache_separates_schemas() {
        let mut config = RuntimeConfig::default();
        config.request.monadic = true;
        config.request.context_size = 1;

        let (mut agent, requests) = agent(
            vec![
                sse(r#"{"message":"plain","context":{}}"#),
                sse(r#"{"message":"plus","context":{}}"#),
            ],
            config,
        );
        let (tx, _rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        agent.process_message("same", &tx, &cancel).await.unwrap();

        agent.session_mut().set_parameters(RequestParameters {
            schema: Some(crate::monadic::MonadicSchema::ChatPlus),
            ..Default::default()
        });
        agent.session_mut().monadic_map(&MonadicEnvelope::default());
        let second = agent.process_message("same", &tx, &cancel).await.unwrap();

        assert!(!second.cached);
        assert_eq!(requests.lock().unwrap().len(), 2);
        let envelope = second.envelope.unwrap();
        assert_eq!(envelope.message, "plus");
        assert_eq!(envelope.validation_errors().len(), 4);
    }

    #[tokio::test]
    async fn test_empty_stream_gives_empty_reply() {
        let (mut agent, _) = agent(vec!["data: [DONE]\n\n".into()], RuntimeConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = agent
            .process_message("hi", &tx, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.text, "");
        assert_eq!(rx.recv().await, Some(UiEvent::Message(String::new())));
        assert!(agent.monitor().stats("provider_round").is_some());
    }
}
