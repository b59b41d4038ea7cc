use async_trait::async_trait;

use pv_domain::chat::ChatMessage;
use pv_domain::error::Result;

/// Per-call options; `None` fields fall back to the client defaults.
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub json_mode: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// One non-streaming chat completion.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub content: String,
    pub usage: Usage,
}

/// The injected LLM dependency. Everything that talks to a model —
/// the conversation loop, the recall gate, the memory classifier,
/// the extractor, the summarizer — goes through this trait.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn chat(&self, messages: &[ChatMessage], opts: &ChatOptions) -> Result<ChatOutcome>;
}

/// Embedding provider used by warm-layer clustering. Retries are the
/// caller's concern; embeddings are idempotent.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}
