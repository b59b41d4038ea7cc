//! End-to-end tests for risk-gated batch execution.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use pv_domain::error::Result;
use pv_domain::tool::{ContentBlock, ToolBatchOutcome, ToolCall};
use pv_events::EventBus;
use pv_mcp_client::{McpDispatch, ServiceInfo};
use pv_tools::{execute_tool_calls, ToolContext, ToolService};

#[derive(Default)]
struct MockMcp {
    calls: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl McpDispatch for MockMcp {
    async fn unified_call(
        &self,
        service_name: &str,
        tool_name: &str,
        _args: Value,
    ) -> Result<Value> {
        self.calls
            .lock()
            .push((service_name.to_string(), tool_name.to_string()));
        Ok(Value::String(format!(
            "Result from {service_name}.{tool_name}"
        )))
    }

    fn list_services(&self) -> Vec<ServiceInfo> {
        Vec::new()
    }
}

fn call(id: &str, name: &str, args: Value) -> ToolCall {
    ToolCall {
        id: id.into(),
        name: name.into(),
        args,
    }
}

fn service_with_mock() -> (Arc<MockMcp>, ToolService) {
    let mcp = Arc::new(MockMcp::default());
    let service = ToolService::new(Arc::new(EventBus::new()), mcp.clone(), None);
    (mcp, service)
}

#[tokio::test]
async fn safe_batch_executes_in_order() {
    let (mcp, service) = service_with_mock();
    let batch = vec![
        call("call_1", "search", serde_json::json!({"service_name": "s1", "tool_name": "search", "q": "x"})),
        call("call_2", "search", serde_json::json!({"service_name": "s2", "tool_name": "search", "q": "y"})),
    ];

    let outcome =
        execute_tool_calls(&batch, &service, &ToolContext::default(), &HashSet::new()).await;

    let ToolBatchOutcome::Completed(blocks) = outcome else {
        panic!("safe batch must complete");
    };
    assert_eq!(blocks.len(), 2);
    let ContentBlock::Text { text } = &blocks[0];
    assert!(text.contains("Result from s1.search"));

    let log = mcp.calls.lock();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].0, "s1");
    assert_eq!(log[1].0, "s2");
}

#[tokio::test]
async fn high_risk_call_suspends_whole_batch() {
    let (mcp, service) = service_with_mock();
    let batch = vec![
        call("call_1", "search", serde_json::json!({"q": "x"})),
        call("call_2", "write_file", serde_json::json!({"path": "/tmp/x", "content": "hi"})),
        call("call_3", "search", serde_json::json!({"q": "y"})),
    ];

    let outcome =
        execute_tool_calls(&batch, &service, &ToolContext::default(), &HashSet::new()).await;

    match outcome {
        ToolBatchOutcome::NeedsConfirmation {
            tool_call_id,
            tool_name,
            all_tool_calls,
            ..
        } => {
            assert_eq!(tool_call_id, "call_2");
            assert_eq!(tool_name, "write_file");
            assert_eq!(all_tool_calls.len(), 3);
        }
        other => panic!("expected confirmation, got {other:?}"),
    }

    // Atomic batch semantics: nothing executed downstream.
    assert!(mcp.calls.lock().is_empty());
}

#[tokio::test]
async fn approved_batch_replays_fully() {
    let (mcp, service) = service_with_mock();
    let batch = vec![
        call("call_1", "search", serde_json::json!({"q": "x"})),
        call("call_2", "write_file", serde_json::json!({"path": "/tmp/x"})),
        call("call_3", "search", serde_json::json!({"q": "y"})),
    ];

    let approved: HashSet<String> = ["call_2".to_string()].into_iter().collect();
    let outcome = execute_tool_calls(&batch, &service, &ToolContext::default(), &approved).await;

    let ToolBatchOutcome::Completed(blocks) = outcome else {
        panic!("approved batch must complete");
    };
    assert_eq!(blocks.len(), 3);
    assert_eq!(mcp.calls.lock().len(), 3);
}

#[tokio::test]
async fn second_high_risk_call_chains_a_new_confirmation() {
    let (mcp, service) = service_with_mock();
    let batch = vec![
        call("call_1", "write_file", serde_json::json!({"path": "/a"})),
        call("call_2", "delete_file", serde_json::json!({"path": "/b"})),
    ];

    // Approving only the first still suspends on the second.
    let approved: HashSet<String> = ["call_1".to_string()].into_iter().collect();
    let outcome = execute_tool_calls(&batch, &service, &ToolContext::default(), &approved).await;

    match outcome {
        ToolBatchOutcome::NeedsConfirmation { tool_call_id, .. } => {
            assert_eq!(tool_call_id, "call_2");
        }
        other => panic!("expected chained confirmation, got {other:?}"),
    }
    assert!(mcp.calls.lock().is_empty());
}

#[tokio::test]
async fn backend_errors_become_error_blocks() {
    struct FailingMcp;

    #[async_trait]
    impl McpDispatch for FailingMcp {
        async fn unified_call(&self, _s: &str, _t: &str, _a: Value) -> Result<Value> {
            Err(pv_domain::error::Error::Tool("backend exploded".into()))
        }

        fn list_services(&self) -> Vec<ServiceInfo> {
            Vec::new()
        }
    }

    let service = ToolService::new(Arc::new(EventBus::new()), Arc::new(FailingMcp), None);
    let batch = vec![call("call_1", "search", serde_json::json!({"q": "x"}))];

    let outcome =
        execute_tool_calls(&batch, &service, &ToolContext::default(), &HashSet::new()).await;
    let ToolBatchOutcome::Completed(blocks) = outcome else {
        panic!("errors are reported as blocks, not batch failure");
    };
    let ContentBlock::Text { text } = &blocks[0];
    assert!(text.contains("Error executing tool search"));
    assert!(text.contains("backend exploded"));
}
