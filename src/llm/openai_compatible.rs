//! OpenAI-compatible LLM provider implementation.
//!
//! Works against any `/chat/completions` endpoint that streams SSE in the
//! OpenAI format (OpenAI, DeepSeek, Grok, Mistral, Perplexity, Ollama, ...).

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Serialize;
use serde_json::Value;

use super::{ByteStream, LlmProvider};
use crate::error::ChatError;
use crate::monadic::{configure_response_format, ProviderKind};
use crate::types::{ChatMessage, ChatRequest, Role};

pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

pub struct OpenAiCompatibleProvider {
    api_key: String,
    api_base: String,
    kind: ProviderKind,
    read_timeout: Duration,
    client: reqwest::Client,
}

// --- API Request Types (OpenAI format) ---

#[derive(Serialize)]
struct ApiRequest {
    model: String,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ApiTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
    stream: bool,
    stream_options: ApiStreamOptions,
}

#[derive(Serialize)]
struct ApiStreamOptions {
    include_usage: bool,
}

#[derive(Serialize)]
struct ApiMessage {
    role: &'static str,
    content: Option<ApiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum ApiContent {
    Text(String),
    Parts(Vec<ApiContentPart>),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiContentPart {
    Text { text: String },
    ImageUrl { image_url: ApiImageUrl },
}

#[derive(Serialize)]
struct ApiImageUrl {
    url: String,
}

#[derive(Serialize)]
struct ApiTool {
    r#type: &'static str,
    function: ApiFunction,
}

#[derive(Serialize)]
struct ApiFunction {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Serialize)]
struct ApiToolCall {
    id: String,
    r#type: &'static str,
    function: ApiToolCallFunction,
}

#[derive(Serialize)]
struct ApiToolCallFunction {
    name: String,
    arguments: String,
}

// --- Implementation ---

impl OpenAiCompatibleProvider {
    pub fn new(
        api_key: String,
        api_base: Option<String>,
        kind: ProviderKind,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self, ChatError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| ChatError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            api_key,
            api_base: api_base.unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            kind,
            read_timeout,
            client,
        })
    }

    fn convert_message(msg: &ChatMessage) -> ApiMessage {
        let content = match msg.role {
            Role::User if !msg.images.is_empty() => {
                let mut parts = vec![ApiContentPart::Text {
                    text: msg.content.clone(),
                }];
                parts.extend(msg.images.iter().map(|url| ApiContentPart::ImageUrl {
                    image_url: ApiImageUrl { url: url.clone() },
                }));
                Some(ApiContent::Parts(parts))
            }
            Role::Assistant if msg.content.is_empty() && !msg.tool_calls.is_empty() => None,
            _ => Some(ApiContent::Text(msg.content.clone())),
        };

        let tool_calls = if msg.tool_calls.is_empty() {
            None
        } else {
            Some(
                msg.tool_calls
                    .iter()
                    .map(|tc| ApiToolCall {
                        id: tc.id.clone(),
                        r#type: "function",
                        function: ApiToolCallFunction {
                            name: tc.name.clone(),
                            arguments: tc.arguments.clone(),
                        },
                    })
                    .collect(),
            )
        };

        ApiMessage {
            role: msg.role.as_str(),
            content,
            tool_calls,
            tool_call_id: msg.tool_call_id.clone(),
            name: if msg.role == Role::Tool { msg.name.clone() } else { None },
        }
    }

    /// Build the JSON body for a streaming request.
    pub fn build_body(&self, request: &ChatRequest) -> Result<Value, ChatError> {
        let params = &request.parameters;

        let tools: Vec<ApiTool> = request
            .tools
            .iter()
            .map(|t| ApiTool {
                r#type: "function",
                function: ApiFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.input_schema.clone(),
                },
            })
            .collect();

        let api_request = ApiRequest {
            model: request.model.clone(),
            messages: request.messages.iter().map(Self::convert_message).collect(),
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
            presence_penalty: params.presence_penalty,
            frequency_penalty: params.frequency_penalty,
            tools,
            response_format: params.response_format.clone(),
            stream: true,
            stream_options: ApiStreamOptions { include_usage: true },
        };

        let mut body = serde_json::to_value(&api_request)?;
        if params.response_format.is_none() {
            if params.is_monadic() {
                configure_response_format(&mut body, self.kind, params.schema.unwrap_or_default());
            } else if params.json.unwrap_or(false) {
                body["response_format"] = serde_json::json!({"type": "json_object"});
            }
        }
        Ok(body)
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.api_base.trim_end_matches('/'))
    }
}

/// Pull a readable message out of an error body, falling back to the raw text.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .or_else(|| v.get("error"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string())
}

#[async_trait]
impl LlmProvider for OpenAiCompatibleProvider {
    async fn open_stream(&self, request: &ChatRequest) -> Result<ByteStream, ChatError> {
        let body = self.build_body(request)?;
        let url = self.endpoint();
        tracing::debug!(provider = %self.kind, model = %request.model, messages = request.messages.len(), "opening stream");

        let send = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send();

        let response = match tokio::time::timeout(self.read_timeout, send).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ChatError::Timeout(format!(
                    "no response from {} within {}s",
                    url,
                    self.read_timeout.as_secs_f32()
                )))
            }
        };

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(ChatError::Api {
                status: status.as_u16(),
                message: error_message(&error_body),
            });
        }

        // Each chunk must arrive within the read timeout
        let idle = self.read_timeout;
        let bytes = Box::pin(response.bytes_stream());
        let stream = futures_util::stream::unfold(Some(bytes), move |state| async move {
            let mut inner = state?;
            match tokio::time::timeout(idle, inner.next()).await {
                Ok(Some(Ok(chunk))) => Some((Ok(chunk), Some(inner))),
                Ok(Some(Err(e))) => Some((Err(ChatError::from(e)), None)),
                Ok(None) => None,
                Err(_) => Some((
                    Err(ChatError::Timeout(format!(
                        "stream stalled for {}s",
                        idle.as_secs_f32()
                    ))),
                    None,
                )),
            }
        });

        Ok(Box::pin(stream))
    }

    fn name(&self) -> &str {
        self.kind.as_str()
    }

    fn kind(&self) -> ProviderKind {
        self.kind
    }
}
