//! OpenAI-compatible chat and embedding clients.
//!
//! Works with any endpoint that follows the OpenAI wire contract
//! (`/chat/completions`, `/embeddings`).

use async_trait::async_trait;
use serde_json::Value;

use pv_domain::chat::ChatMessage;
use pv_domain::config::ApiConfig;
use pv_domain::error::{Error, Result};

use crate::traits::{ChatClient, ChatOptions, ChatOutcome, EmbeddingClient, Usage};

const CHAT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(120);
const EMBEDDING_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Truncate embedding input; long tails add cost without signal.
const EMBEDDING_MAX_CHARS: usize = 500;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Chat client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct OpenAiChatClient {
    api_key: String,
    base_url: String,
    default_model: String,
    temperature: f32,
    max_tokens: u32,
    http: reqwest::Client,
}

impl OpenAiChatClient {
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(CHAT_TIMEOUT)
            .build()
            .map_err(|e| Error::Http(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            default_model: model.into(),
            temperature: 0.7,
            max_tokens: 2048,
            http,
        })
    }

    pub fn from_config(config: &ApiConfig) -> Result<Self> {
        let mut client = Self::new(&config.api_key, &config.base_url, &config.model)?;
        client.temperature = config.temperature;
        client.max_tokens = config.max_tokens;
        Ok(client)
    }
}

#[async_trait]
impl ChatClient for OpenAiChatClient {
    async fn chat(&self, messages: &[ChatMessage], opts: &ChatOptions) -> Result<ChatOutcome> {
        let model = opts.model.clone().unwrap_or_else(|| self.default_model.clone());
        if model.is_empty() {
            return Err(Error::Provider {
                provider: "openai".into(),
                message: "no model configured".into(),
            });
        }

        let mut body = serde_json::json!({
            "model": model,
            "messages": messages,
            "temperature": opts.temperature.unwrap_or(self.temperature),
            "max_tokens": opts.max_tokens.unwrap_or(self.max_tokens),
            "stream": false,
        });
        if opts.json_mode {
            body["response_format"] = serde_json::json!({"type": "json_object"});
        }

        let url = format!("{}/chat/completions", self.base_url);
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Http(format!("chat request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body_text = resp.text().await.unwrap_or_default();
            return Err(Error::Provider {
                provider: "openai".into(),
                message: format!("chat HTTP {status}: {body_text}"),
            });
        }

        let json: Value = resp
            .json()
            .await
            .map_err(|e| Error::Http(format!("failed to parse chat response: {e}")))?;

        let content = json["choices"]
            .get(0)
            .and_then(|c| c["message"]["content"].as_str())
            .unwrap_or_default()
            .to_string();
        let usage = Usage {
            prompt_tokens: json["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            completion_tokens: json["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32,
        };

        Ok(ChatOutcome { content, usage })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Embedding client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct OpenAiEmbeddingClient {
    api_key: String,
    base_url: String,
    model: String,
    http: reqwest::Client,
}

impl OpenAiEmbeddingClient {
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(EMBEDDING_TIMEOUT)
            .build()
            .map_err(|e| Error::Http(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            http,
        })
    }
}

#[async_trait]
impl EmbeddingClient for OpenAiEmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let input: String = text.chars().take(EMBEDDING_MAX_CHARS).collect();
        let url = format!("{}/embeddings", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "input": input,
            "encoding_format": "float",
        });

        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Http(format!("embedding request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body_text = resp.text().await.unwrap_or_default();
            return Err(Error::Provider {
                provider: "openai".into(),
                message: format!("embedding HTTP {status}: {body_text}"),
            });
        }

        let json: Value = resp
            .json()
            .await
            .map_err(|e| Error::Http(format!("failed to parse embedding response: {e}")))?;

        let embedding = json["data"]
            .get(0)
            .and_then(|d| d["embedding"].as_array())
            .ok_or_else(|| Error::Provider {
                provider: "openai".into(),
                message: "response missing 'embedding' array".into(),
            })?
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();

        Ok(embedding)
    }
}
