//! Batch execution with risk gating.
//!
//! The whole batch is pre-scanned before anything runs: if any call
//! is high-risk and not pre-approved, the batch aborts with zero
//! executions and surfaces a confirmation request carrying the full
//! batch. Approving one call replays the batch with that call id in
//! the approved set; a later high-risk call in the same batch then
//! surfaces its own confirmation (chain-able).

use std::collections::HashSet;

use pv_domain::tool::{ContentBlock, ToolBatchOutcome, ToolCall};

use crate::service::{ToolContext, ToolService};

pub async fn execute_tool_calls(
    tool_calls: &[ToolCall],
    service: &ToolService,
    ctx: &ToolContext,
    approved_call_ids: &HashSet<String>,
) -> ToolBatchOutcome {
    // Pre-scan for unapproved high-risk calls. Nothing executes until
    // the whole batch is cleared.
    for call in tool_calls {
        if service.policy().requires_confirmation(&call.name, &call.args)
            && !approved_call_ids.contains(&call.id)
        {
            tracing::info!(
                tool = %call.name,
                call_id = %call.id,
                "high-risk tool call requires confirmation, suspending batch"
            );
            return ToolBatchOutcome::NeedsConfirmation {
                tool_call_id: call.id.clone(),
                tool_name: call.name.clone(),
                args: call.args.clone(),
                all_tool_calls: tool_calls.to_vec(),
            };
        }
    }

    // Dispatch the batch concurrently; results come back in batch
    // order so the conversation sees a deterministic transcript.
    let futures: Vec<_> = tool_calls
        .iter()
        .map(|call| service.call_tool(&call.name, call.args.clone(), ctx))
        .collect();
    let results = futures_util::future::join_all(futures).await;

    let blocks = tool_calls
        .iter()
        .zip(results)
        .map(|(call, result)| match result {
            Ok(value) => {
                let rendered = match value {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                ContentBlock::text(format!("Result from tool \"{}\":\n{}", call.name, rendered))
            }
            Err(e) => ContentBlock::text(format!("Error executing tool {}: {}", call.name, e)),
        })
        .collect();

    ToolBatchOutcome::Completed(blocks)
}
