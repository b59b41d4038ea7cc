//! Tool invocation value types shared between the tool service, the
//! chat loop, and the session store's pending-confirmation state.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::chat::ChatMessage;

/// A single tool call emitted by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Call id, unique within the batch (`call_<n>` when the model
    /// supplies none).
    pub id: String,
    /// Tool name as the model wrote it.
    pub name: String,
    /// Raw arguments, including routing keys (`service_name`,
    /// `tool_name`, `agentType`) that the dispatcher strips before
    /// forwarding.
    pub args: Value,
}

/// Risk tier assigned to a tool call by the policy table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Safe,
    Moderate,
    High,
}

/// One block of a tool result injected back into the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }
}

/// Outcome of executing a batch of tool calls.
///
/// High-risk calls never execute without approval; a batch containing
/// an unapproved high-risk call aborts before any execution and
/// surfaces as `NeedsConfirmation` so the caller can persist the
/// pending state and ask the human.
#[derive(Debug, Clone)]
pub enum ToolBatchOutcome {
    Completed(Vec<ContentBlock>),
    NeedsConfirmation {
        tool_call_id: String,
        tool_name: String,
        args: Value,
        /// The full batch, preserved so an approval can replay it.
        all_tool_calls: Vec<ToolCall>,
    },
}

/// Tool confirmation state stored on a session while a high-risk call
/// waits for the human decision. Cleared on approve/reject; a
/// confirmed call may surface a new confirmation for a later call in
/// the same batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingConfirmation {
    pub tool_call_id: String,
    pub tool_name: String,
    pub args: Value,
    /// Conversation snapshot at suspension time.
    pub current_messages: Vec<ChatMessage>,
    /// The whole suspended batch.
    pub pending_tool_calls: Vec<ToolCall>,
    /// Assistant text that carried the tool calls.
    pub content: String,
    /// Call ids already approved by the human. Approvals accumulate
    /// across a chained confirmation so a replay never re-gates them.
    #[serde(default)]
    pub approved_call_ids: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_block_serializes_tagged() {
        let block = ContentBlock::text("hello");
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["type"], "text");
        assert_eq!(json["text"], "hello");
    }

    #[test]
    fn pending_confirmation_round_trips() {
        let pending = PendingConfirmation {
            tool_call_id: "call_1".into(),
            tool_name: "write_file".into(),
            args: serde_json::json!({"path": "/tmp/x"}),
            current_messages: vec![ChatMessage::user("do it")],
            pending_tool_calls: vec![ToolCall {
                id: "call_1".into(),
                name: "write_file".into(),
                args: serde_json::json!({"path": "/tmp/x"}),
            }],
            content: "writing".into(),
            approved_call_ids: vec![],
        };
        let json = serde_json::to_string(&pending).unwrap();
        let back: PendingConfirmation = serde_json::from_str(&json).unwrap();
        assert_eq!(back.tool_call_id, "call_1");
        assert_eq!(back.pending_tool_calls.len(), 1);
    }
}
