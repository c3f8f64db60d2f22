//! Configuration management for monadic-chat.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::llm::RetryPolicy;
use crate::monadic::{MonadicSchema, ProviderKind};
use crate::types::RequestParameters;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub request: RequestConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub kind: ProviderKind,
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_read_timeout() -> u64 {
    60
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::OpenAi,
            api_base: None,
            api_key: None,
            api_key_env: default_api_key_env(),
            model: default_model(),
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
        }
    }
}

/// Default request parameters; a session's own parameters override these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub presence_penalty: Option<f32>,
    #[serde(default)]
    pub frequency_penalty: Option<f32>,
    /// Number of most recent messages sent as context
    #[serde(default = "default_context_size")]
    pub context_size: usize,
    /// Token budget for the active window, 0 for unlimited
    #[serde(default)]
    pub max_input_tokens: usize,
    #[serde(default = "default_initial_prompt")]
    pub initial_prompt: String,
    #[serde(default)]
    pub prompt_suffix: Option<String>,
    #[serde(default)]
    pub monadic: bool,
    #[serde(default)]
    pub schema: MonadicSchema,
}

fn default_max_tokens() -> u32 {
    4000
}

fn default_context_size() -> usize {
    100
}

fn default_initial_prompt() -> String {
    "You are a friendly and professional consultant. Today is {{DATE}}.".to_string()
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            temperature: 0.0,
            top_p: None,
            presence_penalty: None,
            frequency_penalty: None,
            context_size: default_context_size(),
            max_input_tokens: 0,
            initial_prompt: default_initial_prompt(),
            prompt_suffix: None,
            monadic: false,
            schema: MonadicSchema::Basic,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Tool rounds allowed in one turn before it is aborted
    #[serde(default = "default_max_func_calls")]
    pub max_func_calls: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_max_func_calls() -> u32 {
    10
}

fn default_max_retries() -> u32 {
    1
}

fn default_retry_delay_ms() -> u64 {
    1000
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_func_calls: default_max_func_calls(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
}

fn bool_true() -> bool {
    true
}

fn default_cache_capacity() -> usize {
    100
}

fn default_cache_ttl() -> u64 {
    300
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: default_cache_capacity(),
            ttl_secs: default_cache_ttl(),
        }
    }
}

impl RuntimeConfig {
    pub fn config_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(".monadic").join("config.toml"))
    }

    /// Load from the default path, falling back to defaults if it is missing,
    /// then apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Apply `MONADIC_PROVIDER`, `MONADIC_MODEL` and `MONADIC_API_BASE`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(provider) = lookup("MONADIC_PROVIDER") {
            self.provider.kind = provider
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))
                .context("Invalid MONADIC_PROVIDER")?;
        }
        if let Some(model) = lookup("MONADIC_MODEL") {
            self.provider.model = model;
        }
        if let Some(api_base) = lookup("MONADIC_API_BASE") {
            self.provider.api_base = Some(api_base);
        }
        Ok(())
    }

    pub fn api_key(&self) -> Result<String> {
        if let Some(key) = &self.provider.api_key {
            if !key.is_empty() {
                return Ok(key.clone());
            }
        }
        std::env::var(&self.provider.api_key_env).with_context(|| {
            format!(
                "API key not found. Either:\n  \
                 1. Set api_key in config file: {}\n  \
                 2. Set environment variable: export {}=your-key",
                Self::config_path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
                self.provider.api_key_env
            )
        })
    }

    pub fn save_default() -> Result<PathBuf> {
        let config_path = Self::config_path()?;
        Self::default().save_to(&config_path)?;
        Ok(config_path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }

    /// Request defaults every session's parameters are merged over.
    pub fn request_defaults(&self) -> RequestParameters {
        let r = &self.request;
        RequestParameters {
            model: Some(self.provider.model.clone()),
            max_tokens: Some(r.max_tokens),
            temperature: Some(r.temperature),
            top_p: r.top_p,
            presence_penalty: r.presence_penalty,
            frequency_penalty: r.frequency_penalty,
            context_size: Some(r.context_size),
            max_input_tokens: Some(r.max_input_tokens),
            response_format: None,
            tools: None,
            monadic: Some(r.monadic),
            json: None,
            schema: Some(r.schema),
            initial_prompt: Some(r.initial_prompt.clone()),
            prompt_suffix: r.prompt_suffix.clone(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.agent.max_retries,
            delay: Duration::from_millis(self.agent.retry_delay_ms),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.provider.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.provider.read_timeout_secs)
    }
}
