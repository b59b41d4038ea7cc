//! The recall gate: decide whether a query needs durable user
//! context before paying for recall.
//!
//! A cheap code-level filter runs first; only ambiguous queries reach
//! the binary LLM classifier. Explicit memory-lookup phrasings bypass
//! the short-query rejection entirely.

use std::sync::Arc;

use serde_json::Value;

use pv_domain::chat::ChatMessage;
use pv_domain::config::RecallFilterConfig;
use pv_memory::MemoryService;
use pv_providers::{json_extract, ChatClient, ChatOptions};

const JUDGE_PROMPT: &str = "You are a binary classifier. Decide whether answering the user \
query requires long-term user context (profile, preferences, constraints, goals, project \
history). Return strict JSON: {\"recall\": true|false}.";

const CN_MARKERS: [&str; 8] = [
    "我叫什么",
    "我叫啥",
    "我的名字",
    "你记得我",
    "你还记得",
    "我是谁",
    "我的偏好",
    "我的设定",
];

const EN_MARKERS: [&str; 6] = [
    "what is my name",
    "who am i",
    "do you remember me",
    "remember my name",
    "my preference",
    "my profile",
];

/// Does the query itself ask for remembered state?
pub fn is_explicit_memory_query(text: &str) -> bool {
    let lowered = text.trim().to_lowercase();
    if lowered.is_empty() {
        return false;
    }
    CN_MARKERS.iter().any(|m| lowered.contains(m)) || EN_MARKERS.iter().any(|m| lowered.contains(m))
}

/// Cheap prefilter:
/// - `Some(true)` — explicit memory query, recall without asking
/// - `Some(false)` — definitely no recall
/// - `None` — unsure, continue to the LLM classifier
pub fn quick_recall_decision(query: &str, filter: &RecallFilterConfig) -> Option<bool> {
    let text = query.trim();
    if text.is_empty() {
        return Some(false);
    }
    if is_explicit_memory_query(text) {
        return Some(true);
    }
    let len = text.chars().count();
    if len < filter.min_query_chars || len > filter.max_query_chars {
        return Some(false);
    }
    None
}

pub struct RecallGate {
    chat: Arc<dyn ChatClient>,
    memory: Arc<MemoryService>,
}

impl RecallGate {
    pub fn new(chat: Arc<dyn ChatClient>, memory: Arc<MemoryService>) -> Self {
        Self { chat, memory }
    }

    /// Gate + classifier. Parse failures and LLM errors mean no
    /// recall.
    pub async fn should_recall(&self, query: &str, filter: &RecallFilterConfig) -> bool {
        if let Some(decision) = quick_recall_decision(query, filter) {
            return decision;
        }

        let messages = [ChatMessage::system(JUDGE_PROMPT), ChatMessage::user(query)];
        let opts = ChatOptions {
            temperature: Some(0.0),
            max_tokens: Some(50),
            ..Default::default()
        };
        match self.chat.chat(&messages, &opts).await {
            Ok(outcome) => json_extract(&outcome.content)
                .and_then(|v| v.get("recall").and_then(Value::as_bool))
                .unwrap_or(false),
            Err(e) => {
                tracing::debug!(error = %e, "recall classifier failed");
                false
            }
        }
    }

    /// Build the final system prompt: base prompt plus recalled
    /// context separated by a blank line when the gate passes.
    pub async fn build_system_prompt_with_memory(
        &self,
        query: &str,
        session_id: &str,
        user_id: &str,
        base_system_prompt: &str,
        filter: &RecallFilterConfig,
    ) -> String {
        let mut context = String::new();
        if self.memory.is_enabled()
            && !session_id.is_empty()
            && self.should_recall(query, filter).await
        {
            context = self
                .memory
                .get_context(query, session_id, Some(user_id))
                .await;
        }

        if context.is_empty() {
            base_system_prompt.to_string()
        } else if base_system_prompt.is_empty() {
            context
        } else {
            format!("{base_system_prompt}\n\n{context}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> RecallFilterConfig {
        RecallFilterConfig::default()
    }

    #[test]
    fn short_queries_are_rejected() {
        assert_eq!(quick_recall_decision("hi", &filter()), Some(false));
        assert_eq!(quick_recall_decision("hello", &filter()), Some(false));
    }

    #[test]
    fn explicit_memory_markers_bypass_length_gate() {
        // 4 chars, below min_query_chars, still recalled.
        assert_eq!(quick_recall_decision("who am i", &filter()), Some(true));
        assert_eq!(quick_recall_decision("我是谁", &filter()), Some(true));
        assert_eq!(
            quick_recall_decision("What is my name again?", &filter()),
            Some(true)
        );
    }

    #[test]
    fn oversized_queries_are_rejected() {
        let huge = "x".repeat(5000);
        assert_eq!(quick_recall_decision(&huge, &filter()), Some(false));
    }

    #[test]
    fn ambiguous_queries_fall_through_to_classifier() {
        assert_eq!(
            quick_recall_decision("plan my weekend in the mountains", &filter()),
            None
        );
    }

    #[test]
    fn empty_query_never_recalls() {
        assert_eq!(quick_recall_decision("   ", &filter()), Some(false));
    }
}
