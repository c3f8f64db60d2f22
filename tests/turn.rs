//! End-to-end turns against an in-memory provider.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use monadic_core::llm::{ByteStream, LlmProvider};
use monadic_core::session::TokenizerError;
use monadic_core::tools::ToolArgs;
use monadic_core::types::ChatRequest;
use monadic_core::{
    Agent, ChatError, MonadicSchema, ProviderKind, RequestParameters, Role, RuntimeConfig, Tokenizer,
    Tool, ToolRouter, UiEvent,
};

// --- Fixtures ---

enum Reply {
    /// Chunks delivered one by one, then the stream closes
    Chunks(Vec<Vec<u8>>),
    /// Chunks delivered, then the stream stays open forever
    Hang(Vec<Vec<u8>>),
    Fail(fn() -> ChatError),
}

struct MockProvider {
    replies: Mutex<VecDeque<Reply>>,
    /// Replayed once `replies` runs out
    fallback: Option<Vec<Vec<u8>>>,
    requests: Arc<Mutex<Vec<ChatRequest>>>,
}

impl MockProvider {
    fn new(replies: Vec<Reply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            fallback: None,
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn repeating(body: Vec<Vec<u8>>) -> Self {
        Self {
            fallback: Some(body),
            ..Self::new(vec![])
        }
    }
}

fn to_stream(chunks: Vec<Vec<u8>>) -> impl futures_util::Stream<Item = Result<Bytes, ChatError>> {
    futures_util::stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from(c))))
}

#[async_trait]
impl LlmProvider for MockProvider {
    async fn open_stream(&self, request: &ChatRequest) -> Result<ByteStream, ChatError> {
        self.requests.lock().unwrap().push(request.clone());
        let reply = self.replies.lock().unwrap().pop_front();
        match reply {
            Some(Reply::Chunks(chunks)) => Ok(Box::pin(to_stream(chunks))),
            Some(Reply::Hang(chunks)) => {
                Ok(Box::pin(to_stream(chunks).chain(futures_util::stream::pending())))
            }
            Some(Reply::Fail(error)) => Err(error()),
            None => match &self.fallback {
                Some(body) => Ok(Box::pin(to_stream(body.clone()))),
                None => panic!("provider called more often than scripted"),
            },
        }
    }

    fn name(&self) -> &str {
        "mock"
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }
}

struct WordCounter;

impl Tokenizer for WordCounter {
    fn count_tokens(&self, text: &str, _model: &str) -> Result<usize, TokenizerError> {
        Ok(text.split_whitespace().count())
    }

    fn encoding_name(&self) -> &str {
        "words"
    }
}

/// Counts its calls and returns the code it was asked to run.
struct RunCode {
    calls: Arc<Mutex<Vec<ToolArgs>>>,
}

#[async_trait]
impl Tool for RunCode {
    fn name(&self) -> &str {
        "run_code"
    }

    fn description(&self) -> &str {
        "Run a snippet of code"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "code": { "type": "string" } },
            "required": ["code"]
        })
    }

    async fn execute(&self, args: ToolArgs) -> Result<String> {
        self.calls.lock().unwrap().push(args.clone());
        Ok(format!(
            "ran {}",
            args.get("code").and_then(Value::as_str).unwrap_or_default()
        ))
    }
}

fn sse(payload: Value) -> Vec<u8> {
    format!("data: {}\n\n", payload).into_bytes()
}

fn done() -> Vec<u8> {
    b"data: [DONE]\n\n".to_vec()
}

fn text_delta(text: &str) -> Vec<u8> {
    sse(json!({"id": "r1", "choices": [{"index": 0, "delta": {"content": text}}]}))
}

fn finish(reason: &str) -> Vec<u8> {
    sse(json!({"id": "r1", "choices": [{"index": 0, "delta": {}, "finish_reason": reason}]}))
}

fn text_reply(text: &str) -> Reply {
    Reply::Chunks(vec![text_delta(text), finish("stop"), done()])
}

fn tool_call_reply(id: &str, args: &str) -> Vec<Vec<u8>> {
    let (head, tail) = args.split_at(args.len() / 2);
    vec![
        sse(json!({"id": "t1", "choices": [{"index": 0, "delta": {"tool_calls": [
            {"index": 0, "id": id, "type": "function", "function": {"name": "run_code", "arguments": head}}
        ]}}]})),
        sse(json!({"id": "t1", "choices": [{"index": 0, "delta": {"tool_calls": [
            {"index": 0, "function": {"arguments": tail}}
        ]}}]})),
        sse(json!({"id": "t1", "choices": [{"index": 0, "delta": {}, "finish_reason": "tool_calls"}]})),
        done(),
    ]
}

struct Harness {
    agent: Agent,
    requests: Arc<Mutex<Vec<ChatRequest>>>,
    tool_calls: Arc<Mutex<Vec<ToolArgs>>>,
}

fn harness(provider: MockProvider, config: RuntimeConfig) -> Harness {
    let requests = provider.requests.clone();
    let tool_calls = Arc::new(Mutex::new(Vec::new()));
    let mut router = ToolRouter::new();
    router.register(Box::new(RunCode {
        calls: tool_calls.clone(),
    }));
    let agent = Agent::new(Box::new(provider), Box::new(router), Arc::new(WordCounter), config);
    Harness {
        agent,
        requests,
        tool_calls,
    }
}

fn quick_config() -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.agent.retry_delay_ms = 1;
    config.request.initial_prompt = "You are a test assistant.".into();
    config
}

fn drain(rx: &mut mpsc::UnboundedReceiver<UiEvent>) -> Vec<UiEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// --- Tests ---

#[tokio::test]
async fn test_text_turn_with_split_utf8() {
    // "héllo wörld" with the multi-byte characters cut between chunks
    let body = [text_delta("héllo "), text_delta("wörld"), finish("stop"), done()].concat();
    let cut_a = body.iter().position(|&b| b == 0xC3).unwrap() + 1;
    let chunks = vec![body[..cut_a].to_vec(), body[cut_a..].to_vec()];

    let mut h = harness(MockProvider::new(vec![Reply::Chunks(chunks)]), quick_config());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let outcome = h
        .agent
        .process_message("hi there", &tx, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.text, "héllo wörld");
    assert_eq!(
        drain(&mut rx),
        vec![
            UiEvent::Fragment("héllo ".into()),
            UiEvent::Fragment("wörld".into()),
            UiEvent::Message("héllo wörld".into()),
        ]
    );

    let messages = h.agent.session().messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(messages[1].text, "héllo wörld");
    assert_eq!(messages[1].tokens, 2);

    let requests = h.requests.lock().unwrap();
    assert_eq!(requests[0].messages[0].role, Role::System);
    assert_eq!(requests[0].tools.len(), 1);
}

#[tokio::test]
async fn test_tool_round_trip() {
    let provider = MockProvider::new(vec![
        Reply::Chunks(tool_call_reply("call_1", r#"{"code":"print(1)","lang":"null"}"#)),
        text_reply("The output is 1"),
    ]);
    let mut h = harness(provider, quick_config());
    let (tx, mut rx) = mpsc::unbounded_channel();

    let outcome = h
        .agent
        .process_message("run print(1)", &tx, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.text, "The output is 1");
    assert_eq!(outcome.tool_rounds, 1);

    let events = drain(&mut rx);
    let waits = events
        .iter()
        .filter(|e| matches!(e, UiEvent::Wait(_)))
        .count();
    assert_eq!(waits, 1);
    assert_eq!(events.last(), Some(&UiEvent::Message("The output is 1".into())));

    // Nullish arguments never reach the tool
    let calls = h.tool_calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0]["code"], "print(1)");
    assert!(!calls[0].contains_key("lang"));

    // The follow-up request carries the call and its result
    let requests = h.requests.lock().unwrap();
    assert_eq!(requests.len(), 2);
    let follow_up = &requests[1].messages;
    let assistant = &follow_up[follow_up.len() - 2];
    assert_eq!(assistant.tool_calls[0].id, "call_1");
    assert_eq!(
        assistant.tool_calls[0].arguments,
        r#"{"code":"print(1)","lang":"null"}"#
    );
    let result = follow_up.last().unwrap();
    assert_eq!(result.role, Role::Tool);
    assert_eq!(result.tool_call_id.as_deref(), Some("call_1"));
    assert_eq!(result.content, "ran print(1)");

    // Only the final reply is persisted
    let messages = h.agent.session().messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].text, "The output is 1");
}

#[tokio::test]
async fn test_depth_limit_stops_tool_loop() {
    let provider = MockProvider::repeating(tool_call_reply("call_x", r#"{"code":"loop()"}"#));
    let mut h = harness(provider, quick_config());
    let (tx, mut rx) = mpsc::unbounded_channel();

    let err = h
        .agent
        .process_message("loop forever", &tx, &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        ChatError::DepthExceeded { depth, limit } => {
            assert_eq!(depth, 11);
            assert_eq!(limit, 10);
        }
        other => panic!("expected depth error, got {other:?}"),
    }
    assert_eq!(
        drain(&mut rx).last(),
        Some(&UiEvent::Error("call depth exceeded: 11 > 10".into()))
    );
    assert_eq!(h.requests.lock().unwrap().len(), 11);
    assert_eq!(h.tool_calls.lock().unwrap().len(), 10);

    // The user message stays, no partial assistant reply is stored
    let messages = h.agent.session().messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, Role::User);
}

#[tokio::test]
async fn test_cancel_discards_partial_reply() {
    let provider = MockProvider::new(vec![Reply::Hang(vec![text_delta("partial ans")])]);
    let mut h = harness(provider, quick_config());
    let (tx, mut rx) = mpsc::unbounded_channel();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = h
        .agent
        .process_message("tell me a story", &tx, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::Cancelled));

    // The fragment was shown live, but nothing else followed
    assert_eq!(drain(&mut rx), vec![UiEvent::Fragment("partial ans".into())]);
    let messages = h.agent.session().messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].text, "tell me a story");

    // The session stays usable
    h.agent.session_mut().reset();
    assert!(h.agent.session().messages().is_empty());
}

#[tokio::test]
async fn test_monadic_reply_is_repaired() {
    let mut config = quick_config();
    config.request.monadic = true;

    let malformed = r#"{"{\"message\":\"Test\",\"context\":{}}"#;
    let mut h = harness(MockProvider::new(vec![text_reply(malformed)]), config);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let outcome = h
        .agent
        .process_message("hello", &tx, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.text, r#"{"message":"Test","context":{}}"#);
    assert_eq!(
        drain(&mut rx).last(),
        Some(&UiEvent::Message(r#"{"message":"Test","context":{}}"#.into()))
    );

    let requests = h.requests.lock().unwrap();
    assert_eq!(
        requests[0].messages.last().unwrap().content,
        r#"{"message":"hello","context":{}}"#
    );
    assert!(h.agent.monitor().stats("validate").is_some());
}

#[tokio::test]
async fn test_monadic_context_threads_into_next_turn() {
    let mut config = quick_config();
    config.request.monadic = true;
    config.cache.enabled = false;

    let first = json!({
        "message": "Nice to meet you",
        "context": {"reasoning": "greeting", "topics": ["intro"], "people": ["Ann"], "notes": []}
    })
    .to_string();
    let mut h = harness(
        MockProvider::new(vec![text_reply(&first), text_reply(r#"{"message":"Hi again"}"#)]),
        config,
    );
    h.agent.session_mut().set_parameters(RequestParameters {
        schema: Some(MonadicSchema::ChatPlus),
        ..Default::default()
    });
    let (tx, _rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    h.agent.process_message("I am Ann", &tx, &cancel).await.unwrap();
    let second = h.agent.process_message("Remember me?", &tx, &cancel).await.unwrap();

    let requests = h.requests.lock().unwrap();
    let sent: Value =
        serde_json::from_str(&requests[1].messages.last().unwrap().content).unwrap();
    assert_eq!(sent["message"], "Remember me?");
    assert_eq!(sent["context"]["people"], json!(["Ann"]));

    // The second reply lacks the chat_plus fields and gets annotated
    let envelope = second.envelope.unwrap();
    assert_eq!(envelope.message, "Hi again");
    assert_eq!(envelope.validation_errors().len(), 4);
}

#[tokio::test]
async fn test_provider_error_frame_ends_turn() {
    let body = vec![
        text_delta("Hel"),
        sse(json!({"error": {"message": "overloaded", "type": "server_error"}})),
        text_delta("lo"),
    ];
    let mut h = harness(MockProvider::new(vec![Reply::Chunks(body)]), quick_config());
    let (tx, mut rx) = mpsc::unbounded_channel();

    let err = h
        .agent
        .process_message("hi", &tx, &CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        ChatError::Api { message, .. } => assert_eq!(message, "overloaded"),
        other => panic!("expected api error, got {other:?}"),
    }
    let events = drain(&mut rx);
    assert_eq!(events[0], UiEvent::Fragment("Hel".into()));
    assert!(matches!(events.last(), Some(UiEvent::Error(_))));
    assert_eq!(h.agent.session().messages().len(), 1);
}

#[tokio::test]
async fn test_transient_open_failure_is_retried() {
    let provider = MockProvider::new(vec![
        Reply::Fail(|| ChatError::Connection("connection reset".into())),
        text_reply("recovered"),
    ]);
    let mut h = harness(provider, quick_config());
    let (tx, _rx) = mpsc::unbounded_channel();

    let outcome = h
        .agent
        .process_message("hi", &tx, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.text, "recovered");
    assert_eq!(h.requests.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_budget_limits_sent_history() {
    let mut config = quick_config();
    config.request.max_input_tokens = 6;
    let provider = MockProvider::new(vec![
        text_reply("one two three"),
        text_reply("four five six"),
    ]);
    let mut h = harness(provider, config);
    let (tx, _rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    h.agent.process_message("first question here", &tx, &cancel).await.unwrap();
    let outcome = h.agent.process_message("second one", &tx, &cancel).await.unwrap();
    assert!(outcome.budget.changed);

    // 3 + 3 + 2 words exceed 6, so the oldest message is dropped
    let requests = h.requests.lock().unwrap();
    let sent: Vec<&str> = requests[1]
        .messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(sent, vec!["one two three", "second one"]);
    assert!(!h.agent.session().messages()[0].active);
}

#[tokio::test]
async fn test_usage_is_reported() {
    let body = vec![
        text_delta("ok"),
        finish("stop"),
        sse(json!({"id": "r1", "choices": [], "usage": {"prompt_tokens": 12, "completion_tokens": 3}})),
        done(),
    ];
    let mut h = harness(MockProvider::new(vec![Reply::Chunks(body)]), quick_config());
    let (tx, _rx) = mpsc::unbounded_channel();

    let outcome = h
        .agent
        .process_message("hi", &tx, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.usage.input_tokens, 12);
    assert_eq!(outcome.usage.output_tokens, 3);
}

#[tokio::test]
async fn test_monadic_reply_streamed_as_two_objects() {
    let mut config = quick_config();
    config.request.monadic = true;

    let first = r#"{"message":"Part one. ","context":{"topics":["weather"]}}"#;
    let second = r#"{"message":"Part two.","context":{"topics":["travel"],"mood":"calm"}}"#;
    let (head, tail) = first.split_at(20);
    let body = vec![
        text_delta(head),
        text_delta(tail),
        text_delta(second),
        finish("stop"),
        done(),
    ];
    let mut h = harness(MockProvider::new(vec![Reply::Chunks(body)]), config);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let outcome = h
        .agent
        .process_message("plan my day", &tx, &CancellationToken::new())
        .await
        .unwrap();

    let partials: Vec<Value> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            UiEvent::Partial(v) => Some(v),
            _ => None,
        })
        .collect();
    assert_eq!(
        partials,
        vec![
            json!({"message": "Part one. ", "context": {"topics": ["weather"]}}),
            json!({
                "message": "Part one. Part two.",
                "context": {"topics": ["weather", "travel"], "mood": "calm"}
            }),
        ]
    );

    let envelope = outcome.envelope.unwrap();
    assert_eq!(envelope.message, "Part one. Part two.");
    assert_eq!(envelope.context["topics"], json!(["weather", "travel"]));
    assert!(!envelope.has_parse_error());
    assert_eq!(
        h.agent.session().monadic_context()["mood"],
        "calm"
    );
}
