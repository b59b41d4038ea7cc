//! End-to-end tests over a fully wired gateway with fake externals:
//! per-session ordering, queue overflow, idempotent requests, and the
//! HITL confirmation chain.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use pv_domain::chat::ChatMessage;
use pv_domain::config::Config;
use pv_domain::error::Result;
use pv_events::EventType;
use pv_gateway::server::{GatewayServer, RequestContext};
use pv_gateway::state::{Gateway, GatewayDeps};
use pv_memory::MemGraph;
use pv_protocol::RequestMessage;
use pv_providers::{ChatClient, ChatOptions, ChatOutcome, EmbeddingClient, Usage};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Fakes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

type ChatScript = Box<dyn Fn(usize, &str) -> String + Send + Sync>;

/// Scripted chat client: the script maps (call index, last user
/// message) to the assistant reply. Optionally gated so a test can
/// hold the first call open.
struct FakeChat {
    script: ChatScript,
    calls: Mutex<Vec<String>>,
    gate: Option<Arc<tokio::sync::Semaphore>>,
    started: Arc<tokio::sync::Notify>,
}

impl FakeChat {
    fn echo() -> Self {
        Self::scripted(Box::new(|_, last| format!("reply to: {last}")))
    }

    fn scripted(script: ChatScript) -> Self {
        Self {
            script,
            calls: Mutex::new(Vec::new()),
            gate: None,
            started: Arc::new(tokio::sync::Notify::new()),
        }
    }

    fn gated(script: ChatScript, gate: Arc<tokio::sync::Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::scripted(script)
        }
    }

    fn call_log(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ChatClient for FakeChat {
    async fn chat(&self, messages: &[ChatMessage], _opts: &ChatOptions) -> Result<ChatOutcome> {
        let last = messages.last().map(|m| m.content.clone()).unwrap_or_default();
        let index = {
            let mut calls = self.calls.lock();
            calls.push(last.clone());
            calls.len() - 1
        };
        self.started.notify_one();
        if let Some(gate) = &self.gate {
            let permit = gate.acquire().await.map_err(|_| {
                pv_domain::error::Error::Other("gate closed".into())
            })?;
            permit.forget();
        }
        Ok(ChatOutcome {
            content: (self.script)(index, &last),
            usage: Usage::default(),
        })
    }
}

struct FakeEmbeddings;

#[async_trait]
impl EmbeddingClient for FakeEmbeddings {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Ok(vec![1.0, 0.0])
    }
}

/// Observation point for tool executions: a counting local tool
/// registered under the gated tool names.
struct CountingTool {
    id: String,
    calls: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl pv_tools::LocalTool for CountingTool {
    fn tool_id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        "test tool"
    }

    async fn invoke(&self, _args: Value, _ctx: &pv_tools::ToolContext) -> Result<Value> {
        self.calls.lock().push(self.id.clone());
        Ok(Value::String(format!("{} done", self.id)))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Harness
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn test_config(dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.sessions.state_dir = dir.to_path_buf();
    config.memory.enabled = false;
    // Keep retries fast and quiet in tests.
    config.conversation.processing.max_retries = 0;
    config
}

async fn build_gateway(config: Config, chat: Arc<FakeChat>) -> Arc<Gateway> {
    let chat_dyn: Arc<dyn ChatClient> = chat;
    Gateway::build_with(
        config,
        GatewayDeps {
            chat: chat_dyn.clone(),
            classifier: chat_dyn,
            embeddings: Arc::new(FakeEmbeddings),
            graph: Arc::new(MemGraph::new()),
            agents: None,
        },
    )
    .await
    .unwrap()
}

async fn emit_channel_message(gateway: &Gateway, sender: &str, content: &str) {
    gateway
        .bus
        .emit(
            EventType::ChannelMessage,
            serde_json::json!({"channel": "web", "sender": sender, "content": content}),
        )
        .await;
}

/// Poll the bus history until `count` events of `event` arrive.
async fn wait_for_events(gateway: &Gateway, event: EventType, count: usize) -> Vec<Value> {
    for _ in 0..300 {
        let history = gateway.bus.get_history(Some(event), 100);
        if history.len() >= count {
            return history.into_iter().map(|r| r.payload).collect();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {count} {event} event(s)");
}

fn request(method: &str, params: Value) -> RequestMessage {
    RequestMessage {
        id: uuid::Uuid::new_v4().simple().to_string(),
        method: method.to_string(),
        params,
        idempotency_key: None,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Per-session FIFO
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn turns_within_a_session_are_fifo() {
    let dir = tempfile::TempDir::new().unwrap();
    let chat = Arc::new(FakeChat::echo());
    let gateway = build_gateway(test_config(dir.path()), chat.clone()).await;

    emit_channel_message(&gateway, "u1", "m1").await;
    emit_channel_message(&gateway, "u1", "m2").await;

    let completes = wait_for_events(&gateway, EventType::ConversationComplete, 2).await;
    assert_eq!(completes.len(), 2);

    // The LLM saw m1 strictly before m2.
    let log = chat.call_log();
    let m1_pos = log.iter().position(|c| c == "m1").expect("m1 processed");
    let m2_pos = log.iter().position(|c| c == "m2").expect("m2 processed");
    assert!(m1_pos < m2_pos, "log: {log:?}");

    // Both turns landed in the same session, in order.
    let messages = gateway.sessions.get_messages("web_u1", "u1");
    let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(
        contents,
        vec!["m1", "reply to: m1", "m2", "reply to: m2"]
    );
}

#[tokio::test]
async fn sessions_process_in_parallel_but_independently() {
    let dir = tempfile::TempDir::new().unwrap();
    let chat = Arc::new(FakeChat::echo());
    let gateway = build_gateway(test_config(dir.path()), chat.clone()).await;

    emit_channel_message(&gateway, "alice", "hello from alice").await;
    emit_channel_message(&gateway, "bob", "hello from bob").await;

    wait_for_events(&gateway, EventType::ConversationComplete, 2).await;

    assert_eq!(gateway.sessions.get_messages("web_alice", "alice").len(), 2);
    assert_eq!(gateway.sessions.get_messages("web_bob", "bob").len(), 2);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Queue overflow
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn overflowing_the_session_queue_drops_the_message() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.conversation.processing.max_queue_size = 2;

    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    let chat = Arc::new(FakeChat::gated(
        Box::new(|_, last| format!("reply to: {last}")),
        gate.clone(),
    ));
    let gateway = build_gateway(config, chat.clone()).await;

    // First message occupies the worker (blocked inside the LLM call).
    emit_channel_message(&gateway, "u1", "m1").await;
    chat.started.notified().await;

    // Two more fill the queue; the fourth overflows.
    emit_channel_message(&gateway, "u1", "m2").await;
    emit_channel_message(&gateway, "u1", "m3").await;
    emit_channel_message(&gateway, "u1", "m4").await;

    let errors = wait_for_events(&gateway, EventType::ConversationError, 1).await;
    let overflow: Vec<&Value> = errors
        .iter()
        .filter(|e| e["error"] == "session queue is full")
        .collect();
    assert_eq!(overflow.len(), 1);

    // Release the worker and let the surviving messages drain.
    gate.add_permits(16);
    wait_for_events(&gateway, EventType::ConversationComplete, 3).await;

    // The dropped message never reached the LLM.
    assert!(!chat.call_log().iter().any(|c| c == "m4"));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Retry policy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A client that fails its first N calls.
struct FlakyChat {
    failures_left: Mutex<u32>,
}

#[async_trait]
impl ChatClient for FlakyChat {
    async fn chat(&self, _messages: &[ChatMessage], _opts: &ChatOptions) -> Result<ChatOutcome> {
        let mut left = self.failures_left.lock();
        if *left > 0 {
            *left -= 1;
            return Err(pv_domain::error::Error::Http("upstream 502".into()));
        }
        Ok(ChatOutcome {
            content: "recovered".into(),
            usage: Usage::default(),
        })
    }
}

#[tokio::test]
async fn transient_llm_failures_are_retried_with_backoff() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.conversation.processing.max_retries = 2;
    config.conversation.processing.retry_base_delay_s = 0.05; // clamped to 0.1
    config.conversation.processing.retry_max_delay_s = 0.2;

    let chat: Arc<dyn ChatClient> = Arc::new(FlakyChat {
        failures_left: Mutex::new(2),
    });
    let gateway = Gateway::build_with(
        config,
        GatewayDeps {
            chat: chat.clone(),
            classifier: chat,
            embeddings: Arc::new(FakeEmbeddings),
            graph: Arc::new(MemGraph::new()),
            agents: None,
        },
    )
    .await
    .unwrap();

    emit_channel_message(&gateway, "u1", "try this").await;

    let completes = wait_for_events(&gateway, EventType::ConversationComplete, 1).await;
    assert_eq!(completes[0]["response"], "recovered");

    // Two retryable failures were reported before success, with
    // backoff metadata attached.
    let errors = gateway.bus.get_history(Some(EventType::ConversationError), 10);
    assert_eq!(errors.len(), 2);
    for record in &errors {
        assert_eq!(record.payload["will_retry"], true);
        assert!(record.payload["retry_delay_s"].as_f64().unwrap() > 0.0);
    }
    assert_eq!(errors[0].payload["attempt"], 1);
    assert_eq!(errors[1].payload["attempt"], 2);
}

#[tokio::test]
async fn exhausted_retries_abort_the_turn() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.conversation.processing.max_retries = 1;
    config.conversation.processing.retry_base_delay_s = 0.05;
    config.conversation.processing.retry_max_delay_s = 0.1;

    let chat: Arc<dyn ChatClient> = Arc::new(FlakyChat {
        failures_left: Mutex::new(10),
    });
    let gateway = Gateway::build_with(
        config,
        GatewayDeps {
            chat: chat.clone(),
            classifier: chat,
            embeddings: Arc::new(FakeEmbeddings),
            graph: Arc::new(MemGraph::new()),
            agents: None,
        },
    )
    .await
    .unwrap();

    emit_channel_message(&gateway, "u1", "doomed").await;

    // One retry error, then the terminal one.
    let errors = wait_for_events(&gateway, EventType::ConversationError, 2).await;
    assert_eq!(errors[0]["will_retry"], true);
    assert_eq!(errors[1]["will_retry"], false);

    // The turn was aborted: no messages committed.
    assert!(gateway.sessions.get_messages("web_u1", "u1").is_empty());
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Idempotency
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn idempotent_requests_replay_the_cached_response() {
    let dir = tempfile::TempDir::new().unwrap();
    let chat = Arc::new(FakeChat::echo());
    let gateway = build_gateway(test_config(dir.path()), chat).await;
    let server = GatewayServer::new(gateway);
    let ctx = RequestContext::default();

    let make = || RequestMessage {
        id: "r1".into(),
        method: "send".into(),
        params: serde_json::json!({"channel": "web", "target": "u1", "content": "hi"}),
        idempotency_key: Some("key-1".into()),
    };

    let first = server.handle_request(&ctx, make()).await;
    assert!(first.ok, "error: {:?}", first.error);
    let second = server.handle_request(&ctx, make()).await;
    assert!(second.ok);

    // Same cached payload, including the allocated message id — the
    // handler did not run a second time.
    assert_eq!(
        first.payload.as_ref().unwrap()["message_id"],
        second.payload.as_ref().unwrap()["message_id"],
    );

    // A different key executes the handler normally.
    let mut third_req = make();
    third_req.idempotency_key = Some("key-2".into());
    let third = server.handle_request(&ctx, third_req).await;
    assert!(third.ok);
}

#[tokio::test]
async fn unknown_method_is_reported_against_the_request_id() {
    let dir = tempfile::TempDir::new().unwrap();
    let chat = Arc::new(FakeChat::echo());
    let gateway = build_gateway(test_config(dir.path()), chat).await;
    let server = GatewayServer::new(gateway);

    let response = server
        .handle_request(
            &RequestContext::default(),
            request("computer.browser", serde_json::json!({})),
        )
        .await;
    assert!(!response.ok);
    assert_eq!(
        response.error.as_deref(),
        Some("Unknown request method: computer.browser")
    );
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HITL confirmation chain
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// First reply carries a safe/high/safe batch; later replies are
/// plain text.
fn hitl_script() -> ChatScript {
    Box::new(|index, _| {
        if index == 0 {
            concat!(
                r#"Let me handle that. {"tool_name": "lookup", "q": "a"} "#,
                r#"{"tool_name": "write_file", "path": "/tmp/out"} "#,
                r#"{"tool_name": "lookup", "q": "b"}"#,
            )
            .to_string()
        } else {
            "All done.".to_string()
        }
    })
}

#[tokio::test]
async fn high_risk_tool_call_suspends_and_approval_resumes() {
    let dir = tempfile::TempDir::new().unwrap();
    let chat = Arc::new(FakeChat::scripted(hitl_script()));
    let gateway = build_gateway(test_config(dir.path()), chat).await;

    // Observe executions through counting local tools.
    let executed = Arc::new(Mutex::new(Vec::<String>::new()));
    for id in ["lookup", "write_file"] {
        gateway.tools.register_tool(Arc::new(CountingTool {
            id: id.into(),
            calls: executed.clone(),
        }));
    }

    let server = GatewayServer::new(gateway);
    let ctx = RequestContext::default();

    // 1. Chat suspends on the high-risk call; nothing executed.
    let response = server
        .handle_request(
            &ctx,
            request("chat", serde_json::json!({"message": "please write the file", "session_id": "s1"})),
        )
        .await;
    assert!(response.ok);
    let payload = response.payload.unwrap();
    assert_eq!(payload["status"], "needs_confirmation");
    assert_eq!(payload["tool_name"], "write_file");
    let tool_call_id = payload["tool_call_id"].as_str().unwrap().to_string();
    assert!(executed.lock().is_empty(), "no tool may run before approval");

    // The turn is not committed while suspended.
    assert!(server.gateway.sessions.get_messages("s1", "default_user").is_empty());

    // 2. Approval replays the whole batch and resumes the loop.
    let confirm = server
        .handle_request(
            &ctx,
            request(
                "chat.confirm",
                serde_json::json!({
                    "session_id": "s1",
                    "tool_call_id": tool_call_id,
                    "action": "approve",
                }),
            ),
        )
        .await;
    assert!(confirm.ok, "error: {:?}", confirm.error);
    let payload = confirm.payload.unwrap();
    assert_eq!(payload["status"], "success");
    assert_eq!(payload["response"], "All done.");

    // Pre-approved high call plus both safe calls executed.
    let log = executed.lock().clone();
    assert_eq!(log.len(), 3, "log: {log:?}");
    assert_eq!(log.iter().filter(|t| *t == "write_file").count(), 1);
    assert_eq!(log.iter().filter(|t| *t == "lookup").count(), 2);

    // Pending state is cleared.
    assert!(server
        .gateway
        .sessions
        .get_pending_confirmation("s1", "default_user")
        .is_none());
}

#[tokio::test]
async fn rejecting_a_confirmation_clears_the_pending_state() {
    let dir = tempfile::TempDir::new().unwrap();
    let chat = Arc::new(FakeChat::scripted(hitl_script()));
    let gateway = build_gateway(test_config(dir.path()), chat).await;

    let executed = Arc::new(Mutex::new(Vec::<String>::new()));
    for id in ["lookup", "write_file"] {
        gateway.tools.register_tool(Arc::new(CountingTool {
            id: id.into(),
            calls: executed.clone(),
        }));
    }

    let server = GatewayServer::new(gateway);
    let ctx = RequestContext::default();

    let response = server
        .handle_request(
            &ctx,
            request("chat", serde_json::json!({"message": "please write the file", "session_id": "s1"})),
        )
        .await;
    let tool_call_id = response.payload.unwrap()["tool_call_id"]
        .as_str()
        .unwrap()
        .to_string();

    let reject = server
        .handle_request(
            &ctx,
            request(
                "chat.confirm",
                serde_json::json!({
                    "session_id": "s1",
                    "tool_call_id": tool_call_id,
                    "action": "reject",
                }),
            ),
        )
        .await;
    assert!(reject.ok);
    assert_eq!(reject.payload.unwrap()["status"], "rejected");
    assert!(executed.lock().is_empty());
    assert!(server
        .gateway
        .sessions
        .get_pending_confirmation("s1", "default_user")
        .is_none());
}

/// Two high-risk calls chain two confirmations.
#[tokio::test]
async fn second_high_risk_call_chains_another_confirmation() {
    let dir = tempfile::TempDir::new().unwrap();
    let script: ChatScript = Box::new(|index, _| {
        if index == 0 {
            concat!(
                r#"{"tool_name": "write_file", "path": "/a"} "#,
                r#"{"tool_name": "delete_file", "path": "/b"}"#,
            )
            .to_string()
        } else {
            "Both done.".to_string()
        }
    });
    let chat = Arc::new(FakeChat::scripted(script));
    let gateway = build_gateway(test_config(dir.path()), chat).await;

    let executed = Arc::new(Mutex::new(Vec::<String>::new()));
    for id in ["write_file", "delete_file"] {
        gateway.tools.register_tool(Arc::new(CountingTool {
            id: id.into(),
            calls: executed.clone(),
        }));
    }

    let server = GatewayServer::new(gateway);
    let ctx = RequestContext::default();

    let first = server
        .handle_request(
            &ctx,
            request("chat", serde_json::json!({"message": "clean up the files", "session_id": "s1"})),
        )
        .await;
    let first_id = first.payload.unwrap()["tool_call_id"].as_str().unwrap().to_string();

    // Approving the first surfaces the second high-risk call.
    let second = server
        .handle_request(
            &ctx,
            request(
                "chat.confirm",
                serde_json::json!({"session_id": "s1", "tool_call_id": first_id, "action": "approve"}),
            ),
        )
        .await;
    let payload = second.payload.unwrap();
    assert_eq!(payload["status"], "needs_confirmation");
    assert_eq!(payload["tool_name"], "delete_file");
    assert!(executed.lock().is_empty(), "chained batch must stay atomic");
    let second_id = payload["tool_call_id"].as_str().unwrap().to_string();

    // The second approval completes the batch: approvals accumulate
    // across the chain, so the earlier approval still stands.
    let done = server
        .handle_request(
            &ctx,
            request(
                "chat.confirm",
                serde_json::json!({"session_id": "s1", "tool_call_id": second_id, "action": "approve"}),
            ),
        )
        .await;
    let payload = done.payload.unwrap();
    assert_eq!(payload["status"], "success");

    let log = executed.lock().clone();
    assert_eq!(log.len(), 2, "log: {log:?}");
    assert!(log.contains(&"write_file".to_string()));
    assert!(log.contains(&"delete_file".to_string()));
}
