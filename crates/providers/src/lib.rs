//! LLM plumbing: the chat and embedding client traits, their
//! OpenAI-compatible implementations, and tolerant JSON recovery for
//! model output.

mod json;
mod openai;
mod traits;

pub use json::json_extract;
pub use openai::{OpenAiChatClient, OpenAiEmbeddingClient};
pub use traits::{ChatClient, ChatOptions, ChatOutcome, EmbeddingClient, Usage};
