//! Cold layer: LLM summarization of session memory.

use std::sync::Arc;

use serde_json::Value;

use pv_domain::chat::ChatMessage;
use pv_domain::config::ColdLayerConfig;
use pv_domain::error::Result;
use pv_providers::{ChatClient, ChatOptions};

use crate::graph::{GraphNode, GraphRelation, GraphStore, MessageRow, NodeKind, RelationKind, SummaryRow};

/// Sessions shorter than this never get a summary, whatever the
/// compression threshold says.
const MIN_MESSAGES_FOR_SUMMARY: usize = 5;

const SUMMARY_SYSTEM_PROMPT: &str =
    "You are a conversation summarization assistant. Distill the core of the dialog.";

pub struct ColdLayer {
    store: Arc<dyn GraphStore>,
    client: Arc<dyn ChatClient>,
    config: ColdLayerConfig,
}

impl ColdLayer {
    pub fn new(
        store: Arc<dyn GraphStore>,
        client: Arc<dyn ChatClient>,
        config: ColdLayerConfig,
    ) -> Self {
        Self {
            store,
            client,
            config,
        }
    }

    /// Should this session get a (new) summary? Total messages must
    /// reach the compression threshold, and when a summary already
    /// exists at least half a threshold of new messages must have
    /// arrived since.
    pub async fn should_create_summary(&self, session_node_id: &str) -> Result<bool> {
        let messages = self.store.session_messages(session_node_id, 0).await?;
        if messages.len() < self.config.compression_threshold {
            return Ok(false);
        }
        let summaries = self.store.summaries(session_node_id).await?;
        if let Some(latest) = summaries.first() {
            let new_messages = messages.len().saturating_sub(latest.message_count);
            if new_messages < self.config.compression_threshold / 2 {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Summarize the whole session. Returns the summary node id, or
    /// `None` when the session is too short or the LLM fails.
    pub async fn summarize_session(&self, session_node_id: &str) -> Result<Option<String>> {
        let messages = self.store.session_messages(session_node_id, 0).await?;
        if messages.len() < MIN_MESSAGES_FOR_SUMMARY {
            tracing::info!(messages = messages.len(), "too few messages, skipping summary");
            return Ok(None);
        }

        let concepts: Vec<String> = self
            .store
            .session_concepts(session_node_id, 10)
            .await?
            .into_iter()
            .map(|c| c.content)
            .collect();

        let Some(summary_text) = self.generate_summary(&messages, &concepts, None).await else {
            tracing::warn!("summary generation failed");
            return Ok(None);
        };

        let id = self
            .create_summary_node(session_node_id, &summary_text, messages.len())
            .await?;
        Ok(Some(id))
    }

    /// Incremental summary: only messages past the last summarized
    /// count, with the previous summary as context. The stored total
    /// covers all messages seen so far.
    pub async fn create_incremental_summary(&self, session_node_id: &str) -> Result<Option<String>> {
        let summaries = self.store.summaries(session_node_id).await?;
        let Some(latest) = summaries.first() else {
            return self.summarize_session(session_node_id).await;
        };

        let summarized = latest.message_count;
        let new_messages = self.store.session_messages(session_node_id, summarized).await?;
        if new_messages.len() < MIN_MESSAGES_FOR_SUMMARY {
            tracing::info!("not enough new messages, skipping incremental summary");
            return Ok(None);
        }

        let Some(summary_text) = self
            .generate_summary(&new_messages, &[], Some(&latest.content))
            .await
        else {
            return Ok(None);
        };

        let total = summarized + new_messages.len();
        let id = self
            .create_summary_node(session_node_id, &summary_text, total)
            .await?;
        Ok(Some(id))
    }

    pub async fn get_summaries(&self, session_node_id: &str) -> Result<Vec<SummaryRow>> {
        self.store.summaries(session_node_id).await
    }

    async fn generate_summary(
        &self,
        messages: &[MessageRow],
        concepts: &[String],
        previous: Option<&str>,
    ) -> Option<String> {
        let conversation_text = messages
            .iter()
            .map(|m| format!("{}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n");

        let mut prompt = match previous {
            Some(previous_summary) => format!(
                "Previous summary:\n{previous_summary}\n\nNew dialog:\n{conversation_text}\n\n\
                 Merge the new content into an updated summary"
            ),
            None => format!(
                "Summarize the following dialog, covering the main topics, \
                 the user's key needs, and the important conclusions.\n\n\
                 Dialog:\n{conversation_text}"
            ),
        };
        if !concepts.is_empty() {
            prompt.push_str(&format!("\n\nIdentified topics: {}", concepts.join(", ")));
        }
        prompt.push_str(&format!(
            "\n\nKeep the summary under {} characters.",
            self.config.max_summary_length
        ));

        let opts = ChatOptions {
            model: if self.config.summary_model.is_empty() {
                None
            } else {
                Some(self.config.summary_model.clone())
            },
            temperature: Some(0.3),
            max_tokens: Some(self.config.max_summary_length * 2),
            json_mode: false,
        };
        let messages = [
            ChatMessage::system(SUMMARY_SYSTEM_PROMPT),
            ChatMessage::user(prompt),
        ];
        match self.client.chat(&messages, &opts).await {
            Ok(outcome) => {
                let text = outcome.content.trim().to_string();
                if text.is_empty() {
                    None
                } else {
                    Some(text)
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "LLM summary generation failed");
                None
            }
        }
    }

    async fn create_summary_node(
        &self,
        session_node_id: &str,
        summary_text: &str,
        message_count: usize,
    ) -> Result<String> {
        let node = GraphNode::new(NodeKind::Summary, summary_text)
            .with_layer(2)
            .with_importance(0.9)
            .with_property("session_id", Value::String(session_node_id.to_string()))
            .with_property("message_count", Value::from(message_count));
        let id = self.store.ensure_node(node).await?;
        self.store
            .create_relation(GraphRelation::new(
                RelationKind::Summarizes,
                id.clone(),
                session_node_id,
            ))
            .await?;
        tracing::info!(summary_id = %id, message_count, "created summary node");
        Ok(id)
    }
}
