//! Monadic response schemas and the per-provider request wiring that asks a
//! model to answer with a `{message, context}` object.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Named envelope schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonadicSchema {
    /// Free-form context
    #[default]
    Basic,
    /// Context must carry `reasoning`, `topics`, `people` and `notes`
    ChatPlus,
}

impl MonadicSchema {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonadicSchema::Basic => "basic",
            MonadicSchema::ChatPlus => "chat_plus",
        }
    }

    /// JSON Schema sent to providers that accept structured output.
    pub fn json_schema(&self) -> Value {
        match self {
            MonadicSchema::Basic => json!({
                "type": "object",
                "properties": {
                    "message": {
                        "type": "string",
                        "description": "The assistant's response to the user"
                    },
                    "context": {
                        "type": "object",
                        "description": "Additional context and metadata",
                        "properties": {},
                        "additionalProperties": true
                    }
                },
                "required": ["message", "context"]
            }),
            MonadicSchema::ChatPlus => json!({
                "type": "object",
                "properties": {
                    "message": {
                        "type": "string",
                        "description": "Your response to the user"
                    },
                    "context": {
                        "type": "object",
                        "properties": {
                            "reasoning": {
                                "type": "string",
                                "description": "The reasoning and thought process behind your response"
                            },
                            "topics": {
                                "type": "array",
                                "items": { "type": "string" },
                                "description": "A list of topics discussed in the conversation"
                            },
                            "people": {
                                "type": "array",
                                "items": { "type": "string" },
                                "description": "A list of people and their relationships mentioned"
                            },
                            "notes": {
                                "type": "array",
                                "items": { "type": "string" },
                                "description": "Important information to remember"
                            }
                        },
                        "required": ["reasoning", "topics", "people", "notes"]
                    }
                },
                "required": ["message", "context"]
            }),
        }
    }

    /// Plain-text instruction for providers without structured output.
    pub fn instruction(&self) -> &'static str {
        match self {
            MonadicSchema::Basic => concat!(
                "You must respond with a JSON object following this structure:\n",
                "{\n",
                "  \"message\": \"Your response to the user\",\n",
                "  \"context\": {\n",
                "    // Any relevant context information\n",
                "  }\n",
                "}\n",
            ),
            MonadicSchema::ChatPlus => concat!(
                "You must respond with a JSON object following this exact structure:\n",
                "{\n",
                "  \"message\": \"Your response to the user\",\n",
                "  \"context\": {\n",
                "    \"reasoning\": \"The reasoning and thought process behind your response\",\n",
                "    \"topics\": [\"List of topics discussed\"],\n",
                "    \"people\": [\"List of people and their relationships mentioned\"],\n",
                "    \"notes\": [\"Important information to remember\"]\n",
                "  }\n",
                "}\n",
            ),
        }
    }
}

impl fmt::Display for MonadicSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MonadicSchema {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "basic" => Ok(MonadicSchema::Basic),
            "chat_plus" => Ok(MonadicSchema::ChatPlus),
            other => Err(format!("unknown schema '{}' (expected basic or chat_plus)", other)),
        }
    }
}

/// Provider family, used only to pick the monadic `response_format` shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    OpenAi,
    DeepSeek,
    Grok,
    Perplexity,
    Claude,
    Gemini,
    Mistral,
    Cohere,
    Ollama,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::DeepSeek => "deepseek",
            ProviderKind::Grok => "grok",
            ProviderKind::Perplexity => "perplexity",
            ProviderKind::Claude => "claude",
            ProviderKind::Gemini => "gemini",
            ProviderKind::Mistral => "mistral",
            ProviderKind::Cohere => "cohere",
            ProviderKind::Ollama => "ollama",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAi),
            "deepseek" => Ok(ProviderKind::DeepSeek),
            "grok" | "xai" => Ok(ProviderKind::Grok),
            "perplexity" => Ok(ProviderKind::Perplexity),
            "claude" | "anthropic" => Ok(ProviderKind::Claude),
            "gemini" | "google" => Ok(ProviderKind::Gemini),
            "mistral" => Ok(ProviderKind::Mistral),
            "cohere" => Ok(ProviderKind::Cohere),
            "ollama" => Ok(ProviderKind::Ollama),
            other => Err(format!("unknown provider '{}'", other)),
        }
    }
}

/// Ask `provider` for a monadic JSON answer by editing the request body.
pub fn configure_response_format(body: &mut Value, provider: ProviderKind, schema: MonadicSchema) {
    let Some(obj) = body.as_object_mut() else {
        return;
    };

    match provider {
        ProviderKind::OpenAi | ProviderKind::DeepSeek | ProviderKind::Grok => {
            obj.insert("response_format".into(), json!({"type": "json_object"}));
        }
        ProviderKind::Perplexity => {
            obj.insert(
                "response_format".into(),
                json!({
                    "type": "json_schema",
                    "json_schema": { "schema": schema.json_schema() }
                }),
            );
        }
        ProviderKind::Mistral | ProviderKind::Cohere => {
            obj.insert(
                "response_format".into(),
                json!({
                    "type": "json_schema",
                    "json_schema": {
                        "name": "monadic_response",
                        "schema": schema.json_schema()
                    }
                }),
            );
        }
        ProviderKind::Gemini => {
            let config = obj
                .entry("generationConfig")
                .or_insert_with(|| json!({}));
            if let Some(config) = config.as_object_mut() {
                config.insert("responseMimeType".into(), json!("application/json"));
                config.insert("responseSchema".into(), schema.json_schema());
            }
        }
        ProviderKind::Ollama => {
            obj.insert("format".into(), json!("json"));
            if let Some(messages) = obj.get_mut("messages").and_then(Value::as_array_mut) {
                if messages.is_empty() {
                    return;
                }
                let instruction = schema.instruction();
                let system = messages
                    .iter_mut()
                    .find(|m| m.get("role").and_then(Value::as_str) == Some("system"));
                match system {
                    Some(system) => {
                        let content = system
                            .get("content")
                            .and_then(Value::as_str)
                            .unwrap_or_default();
                        let updated = format!("{}\n\n{}", content, instruction);
                        system["content"] = json!(updated);
                    }
                    None => messages.insert(0, json!({"role": "system", "content": instruction})),
                }
            }
        }
        // System prompt carries the format
        ProviderKind::Claude => {}
    }
}
