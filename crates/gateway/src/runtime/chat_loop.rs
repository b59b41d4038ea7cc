//! The LLM ↔ tool loop behind every turn.
//!
//! The model emits tool calls inline as JSON objects; each round
//! parses them, executes the batch through the tool service, injects
//! the results as a synthetic user message, and asks the model to
//! continue. A high-risk call suspends the whole loop as
//! `NeedsConfirmation` so the caller can persist the pending state.

use std::collections::HashSet;

use pv_domain::chat::ChatMessage;
use pv_domain::error::Result;
use pv_domain::tool::{ContentBlock, ToolBatchOutcome, ToolCall};
use pv_providers::{ChatClient, ChatOptions};
use pv_tools::{execute_tool_calls, parse_tool_calls, ToolContext, ToolService};

/// Rounds of tool execution before the loop forces a final answer.
const MAX_TOOL_ROUNDS: usize = 5;

#[derive(Debug)]
pub enum ChatLoopOutcome {
    Completed {
        content: String,
    },
    /// The loop is suspended on a high-risk tool call. Carries
    /// everything the confirm flow needs to resume.
    NeedsConfirmation {
        tool_call_id: String,
        tool_name: String,
        args: serde_json::Value,
        all_tool_calls: Vec<ToolCall>,
        /// Conversation snapshot at suspension time.
        current_messages: Vec<ChatMessage>,
        /// Assistant text that carried the tool calls.
        content: String,
    },
}

pub fn flatten_blocks(blocks: &[ContentBlock]) -> String {
    blocks
        .iter()
        .map(|block| match block {
            ContentBlock::Text { text } => text.as_str(),
        })
        .collect::<Vec<_>>()
        .join("\n\n---\n\n")
}

/// Run the chat loop to completion or suspension.
pub async fn run_chat_loop(
    chat: &dyn ChatClient,
    tools: &ToolService,
    mut messages: Vec<ChatMessage>,
    ctx: &ToolContext,
    opts: &ChatOptions,
    approved_call_ids: &HashSet<String>,
) -> Result<ChatLoopOutcome> {
    let mut content = String::new();

    for round in 0..MAX_TOOL_ROUNDS {
        let outcome = chat.chat(&messages, opts).await?;
        content = outcome.content;

        let tool_calls = parse_tool_calls(&content);
        if tool_calls.is_empty() {
            return Ok(ChatLoopOutcome::Completed { content });
        }
        tracing::debug!(round, count = tool_calls.len(), "executing tool calls");

        // Only the first round honors pre-approved ids: an approval
        // covers the suspended batch, not future ones.
        let approved = if round == 0 {
            approved_call_ids.clone()
        } else {
            HashSet::new()
        };

        match execute_tool_calls(&tool_calls, tools, ctx, &approved).await {
            ToolBatchOutcome::NeedsConfirmation {
                tool_call_id,
                tool_name,
                args,
                all_tool_calls,
            } => {
                return Ok(ChatLoopOutcome::NeedsConfirmation {
                    tool_call_id,
                    tool_name,
                    args,
                    all_tool_calls,
                    current_messages: messages,
                    content,
                });
            }
            ToolBatchOutcome::Completed(blocks) => {
                let results = flatten_blocks(&blocks);
                messages.push(ChatMessage::assistant(content.clone()));
                messages.push(ChatMessage::user(format!(
                    "Tool results:\n{results}\nAnswer the user's question based on these results."
                )));
            }
        }
    }

    // Round budget exhausted: ask for a final answer with what we
    // have.
    messages.push(ChatMessage::system(
        "The task has reached its step limit. Ignore any unfinished steps and give the user \
         a final answer from the information gathered so far.",
    ));
    let outcome = chat.chat(&messages, opts).await?;
    if !outcome.content.is_empty() {
        content = outcome.content;
    }
    Ok(ChatLoopOutcome::Completed { content })
}
