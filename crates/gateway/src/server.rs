//! The gateway request server: the method table, the dispatch
//! pipeline (idempotency → heartbeat → handler), and the background
//! heartbeat/sweep tasks.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;

use pv_domain::chat::{ChatMessage, Role};
use pv_domain::error::Error;
use pv_domain::tool::{ContentBlock, PendingConfirmation, ToolBatchOutcome};
use pv_events::EventType;
use pv_protocol::{
    AgentParams, ChatConfirmParams, ChatParams, ConfigSwitchModelParams, ConfigUpdateParams,
    ConnectParams, EventMessage, MemoryQueryParams, MemorySummarizeParams, RequestMessage,
    RequestMethod, ResponseMessage, SendParams, SessionParams, ToolCallParams,
};
use pv_providers::ChatOptions;
use pv_tools::{execute_tool_calls, ToolContext};

use crate::doctor;
use crate::metrics::Metrics;
use crate::runtime::ChatLoopOutcome;
use crate::state::Gateway;

/// Marker appended to tool results after a human approval.
const CONFIRMED_MARKER: &str = "\n(user has confirmed and executed) please continue.";

type HandlerResult = Result<Value, Error>;
type HandlerFuture<'a> = Pin<Box<dyn Future<Output = HandlerResult> + Send + 'a>>;
type HandlerFn =
    for<'a> fn(&'a GatewayServer, &'a RequestContext, Value) -> HandlerFuture<'a>;

/// Per-request context. The auth scheme is pluggable and out of
/// scope; callers without one act as `default_user`.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub connection_id: Option<String>,
    pub user_id: String,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self {
            connection_id: None,
            user_id: "default_user".into(),
        }
    }
}

struct CachedResponse {
    response: ResponseMessage,
    cached_at: Instant,
}

pub struct GatewayServer {
    pub gateway: Arc<Gateway>,
    handlers: HashMap<RequestMethod, HandlerFn>,
    idempotency: Mutex<HashMap<String, CachedResponse>>,
    started_at: Instant,
    running: AtomicBool,
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, Error> {
    serde_json::from_value(params).map_err(|e| Error::Config(format!("invalid params: {e}")))
}

macro_rules! handler_table {
    ($($method:expr => $handler:ident),+ $(,)?) => {{
        let mut map: HashMap<RequestMethod, HandlerFn> = HashMap::new();
        $(map.insert($method, $handler as HandlerFn);)+
        map
    }};
}

impl GatewayServer {
    pub fn new(gateway: Arc<Gateway>) -> Arc<Self> {
        let handlers = handler_table! {
            RequestMethod::Connect => h_connect,
            RequestMethod::Health => h_health,
            RequestMethod::Status => h_status,
            RequestMethod::SystemInfo => h_system_info,
            RequestMethod::ChannelsStatus => h_channels_status,
            RequestMethod::Send => h_send,
            RequestMethod::Agent => h_agent,
            RequestMethod::Chat => h_chat,
            RequestMethod::ChatConfirm => h_chat_confirm,
            RequestMethod::MemoryQuery => h_memory_query,
            RequestMethod::MemoryCluster => h_memory_cluster,
            RequestMethod::MemorySummarize => h_memory_summarize,
            RequestMethod::MemoryGraph => h_memory_graph,
            RequestMethod::MemoryDecay => h_memory_decay,
            RequestMethod::MemoryCleanup => h_memory_cleanup,
            RequestMethod::SessionsList => h_sessions_list,
            RequestMethod::SessionDetail => h_session_detail,
            RequestMethod::SessionDelete => h_session_delete,
            RequestMethod::ToolsList => h_tools_list,
            RequestMethod::ToolCall => h_tool_call,
            RequestMethod::ConfigGet => h_config_get,
            RequestMethod::ConfigReload => h_config_reload,
            RequestMethod::ConfigUpdate => h_config_update,
            RequestMethod::ConfigReset => h_config_reset,
            RequestMethod::ConfigSwitchModel => h_config_switch_model,
            RequestMethod::ConfigDiagnose => h_config_diagnose,
        };

        Arc::new(Self {
            gateway,
            handlers,
            idempotency: Mutex::new(HashMap::new()),
            started_at: Instant::now(),
            running: AtomicBool::new(false),
        })
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Start the background tasks: heartbeat broadcast, periodic
    /// sweep, and bus→connection event forwarding.
    pub async fn start(self: &Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        let server_config = self.gateway.config.default_config().server;

        // Heartbeat broadcast.
        {
            let server = self.clone();
            let interval = server_config.heartbeat_interval_s.max(1);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(interval));
                ticker.tick().await;
                while server.running.load(Ordering::SeqCst) {
                    ticker.tick().await;
                    server
                        .gateway
                        .bus
                        .emit(
                            EventType::Heartbeat,
                            serde_json::json!({"timestamp": Utc::now().to_rfc3339()}),
                        )
                        .await;
                }
            });
        }

        // Periodic sweep: idempotency TTL eviction, stale connection
        // close, and the optional session age sweep.
        {
            let server = self.clone();
            let interval = server_config.sweep_interval_s.max(1);
            let ttl = Duration::from_secs(server_config.idempotency_ttl_s);
            let stale_after = server_config.stale_connection_s;
            let session_max_age = self.gateway.config.default_config().sessions.max_age_hours;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(interval));
                ticker.tick().await;
                while server.running.load(Ordering::SeqCst) {
                    ticker.tick().await;
                    server.sweep_idempotency(ttl);
                    server.gateway.connections.cleanup_stale(stale_after).await;
                    server.gateway.sessions.cleanup_old_sessions(session_max_age);
                }
            });
        }

        // Forward every bus event to connected clients.
        {
            let server = self.clone();
            let mut sink = self.gateway.bus.subscribe_sink();
            tokio::spawn(async move {
                loop {
                    match sink.recv().await {
                        Ok(record) => {
                            Metrics::incr(&server.gateway.metrics.events_emitted);
                            server.gateway.connections.broadcast(EventMessage::new(
                                record.event,
                                record.payload,
                                Some(record.seq),
                            ));
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "event forwarder lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
        }

        self.gateway
            .bus
            .emit(
                EventType::HealthUpdate,
                serde_json::json!({"status": "healthy", "message": "Gateway started"}),
            )
            .await;
        tracing::info!("gateway server started");
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        tracing::info!("gateway server stopped");
    }

    fn sweep_idempotency(&self, ttl: Duration) {
        let mut cache = self.idempotency.lock();
        cache.retain(|_, entry| entry.cached_at.elapsed() < ttl);
    }

    /// The request pipeline: idempotency replay → heartbeat touch →
    /// method lookup → handler → response caching.
    pub async fn handle_request(
        self: &Arc<Self>,
        ctx: &RequestContext,
        request: RequestMessage,
    ) -> ResponseMessage {
        Metrics::incr(&self.gateway.metrics.requests);

        if let Some(key) = &request.idempotency_key {
            let ttl = Duration::from_secs(
                self.gateway.config.default_config().server.idempotency_ttl_s,
            );
            let cached = {
                let cache = self.idempotency.lock();
                cache
                    .get(key)
                    .filter(|entry| entry.cached_at.elapsed() < ttl)
                    .map(|entry| entry.response.clone())
            };
            if let Some(response) = cached {
                tracing::debug!(idempotency_key = %key, "returning cached response");
                return response;
            }
        }

        if let Some(connection_id) = &ctx.connection_id {
            self.gateway.connections.heartbeat(connection_id);
        }

        let Some(method) = request.parsed_method() else {
            Metrics::incr(&self.gateway.metrics.request_errors);
            return ResponseMessage::unknown_method(request.id, &request.method);
        };
        let Some(handler) = self.handlers.get(&method) else {
            Metrics::incr(&self.gateway.metrics.request_errors);
            return ResponseMessage::unknown_method(request.id, &request.method);
        };

        let response = match handler(self, ctx, request.params).await {
            Ok(payload) => ResponseMessage::ok(request.id, payload),
            Err(e) => {
                Metrics::incr(&self.gateway.metrics.request_errors);
                tracing::error!(method = %method, error = %e, "request handler failed");
                let message = match &e {
                    Error::Io(_)
                    | Error::Json(_)
                    | Error::Http(_)
                    | Error::Graph(_)
                    | Error::Timeout(_)
                    | Error::Provider { .. } => format!("Internal error: {e}"),
                    other => other.to_string(),
                };
                ResponseMessage::err(request.id, message)
            }
        };

        if response.ok {
            if let Some(key) = request.idempotency_key {
                self.idempotency.lock().insert(
                    key,
                    CachedResponse {
                        response: response.clone(),
                        cached_at: Instant::now(),
                    },
                );
            }
        }
        response
    }

    async fn health_info(&self) -> Value {
        let gateway = &self.gateway;
        serde_json::json!({
            "status": "healthy",
            "uptime": self.uptime_seconds(),
            "active_connections": gateway.connections.active_count(),
            "channels": gateway.channels.names(),
            "memory": {
                "enabled": gateway.memory.is_enabled(),
            },
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// System handlers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn h_connect<'a>(
    server: &'a GatewayServer,
    ctx: &'a RequestContext,
    params: Value,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let params: ConnectParams = parse_params(params)?;
        let connection_id = ctx
            .connection_id
            .clone()
            .ok_or_else(|| Error::Other("connect is only valid on a WebSocket".into()))?;

        let connection = server
            .gateway
            .connections
            .get(&connection_id)
            .ok_or_else(|| Error::Other("connection not registered".into()))?;
        server
            .gateway
            .connections
            .bind_device(&connection, params.identity);

        Ok(serde_json::json!({
            "status": "connected",
            "connection_id": connection_id,
            "server_version": env!("CARGO_PKG_VERSION"),
            "protocol_version": params.protocol_version,
            "capabilities": ["agent", "memory", "channels", "tools"],
            "health": server.health_info().await,
        }))
    })
}

fn h_health<'a>(
    server: &'a GatewayServer,
    _ctx: &'a RequestContext,
    _params: Value,
) -> HandlerFuture<'a> {
    Box::pin(async move { Ok(server.health_info().await) })
}

fn h_status<'a>(
    server: &'a GatewayServer,
    _ctx: &'a RequestContext,
    _params: Value,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let gateway = &server.gateway;
        Ok(serde_json::json!({
            "gateway_status": if server.running.load(Ordering::SeqCst) { "running" } else { "stopped" },
            "uptime": server.uptime_seconds(),
            "connections": gateway.connections.active_count(),
            "channels": gateway.channels.status(),
            "agents": {},
            "nodes": {},
            "processing": gateway.orchestrator.stats(),
            "metrics": gateway.metrics.snapshot(),
        }))
    })
}

fn h_system_info<'a>(
    server: &'a GatewayServer,
    _ctx: &'a RequestContext,
    _params: Value,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let gateway = &server.gateway;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "uptime": server.uptime_seconds(),
            "connections": gateway.connections.active_count(),
            "channels": gateway.channels.names(),
            "features": ["agent", "memory", "mcp", "channels", "plugins"],
        }))
    })
}

fn h_channels_status<'a>(
    server: &'a GatewayServer,
    _ctx: &'a RequestContext,
    _params: Value,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        Ok(serde_json::json!({"channels": server.gateway.channels.status()}))
    })
}

fn h_send<'a>(
    server: &'a GatewayServer,
    _ctx: &'a RequestContext,
    params: Value,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let params: SendParams = parse_params(params)?;
        let channel = server
            .gateway
            .channels
            .get(&params.channel)
            .ok_or_else(|| Error::Other(format!("Channel not found: {}", params.channel)))?;

        // Outbound is text unless the channel advertises richer types.
        let message_type = if channel.supports_rich() {
            params.message_type.as_str()
        } else {
            "text"
        };
        channel.send(&params.target, &params.content, message_type).await?;

        Ok(serde_json::json!({
            "status": "sent",
            "channel": params.channel,
            "target": params.target,
            "message_id": format!("msg_{}", Utc::now().timestamp_millis()),
        }))
    })
}

fn h_agent<'a>(
    server: &'a GatewayServer,
    ctx: &'a RequestContext,
    params: Value,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let params: AgentParams = parse_params(params)?;
        let run_id = format!("run_{}", Utc::now().timestamp_millis());

        let gateway = server.gateway.clone();
        let user_id = ctx.user_id.clone();
        let run_id_bg = run_id.clone();
        tokio::spawn(async move {
            gateway
                .bus
                .emit(
                    EventType::AgentStart,
                    serde_json::json!({
                        "run_id": run_id_bg,
                        "agent_name": params.agent_name,
                        "user_id": user_id,
                    }),
                )
                .await;

            let result = match &gateway.agents {
                Some(agents) => {
                    agents
                        .call_agent(&params.agent_name, &params.prompt, params.session_id.as_deref())
                        .await
                }
                None => Err(Error::Other("agent manager not available".into())),
            };

            match result {
                Ok(result) => {
                    gateway
                        .bus
                        .emit(
                            EventType::AgentComplete,
                            serde_json::json!({"run_id": run_id_bg, "result": result}),
                        )
                        .await;
                }
                Err(e) => {
                    gateway
                        .bus
                        .emit(
                            EventType::AgentError,
                            serde_json::json!({"run_id": run_id_bg, "error": e.to_string()}),
                        )
                        .await;
                }
            }
        });

        Ok(serde_json::json!({"run_id": run_id, "status": "accepted"}))
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Chat handlers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn h_chat<'a>(
    server: &'a GatewayServer,
    ctx: &'a RequestContext,
    params: Value,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let params: ChatParams = parse_params(params)?;
        let gateway = &server.gateway;
        let user_id = ctx.user_id.as_str();

        let user_text = params.message.trim().to_string();
        if user_text.is_empty() {
            return Err(Error::Config("message is required".into()));
        }

        let session_id = match params.session_id {
            Some(session_id) => {
                if !gateway.sessions.session_exists(&session_id, user_id) {
                    gateway.sessions.create_session(Some(&session_id), user_id);
                }
                session_id
            }
            None => gateway.sessions.create_session(None, user_id),
        };
        let turn_id = uuid::Uuid::new_v4().simple().to_string();

        if !gateway
            .sessions
            .begin_turn(&session_id, &turn_id, Role::User, &user_text, user_id)
        {
            return Err(Error::TurnConflict {
                session_id,
                turn_id,
            });
        }

        let merged = gateway.config.merged_config(Some(user_id));
        let base_prompt = gateway.config.system_prompt(Some(user_id));
        let system_prompt = gateway
            .orchestrator
            .recall_gate()
            .build_system_prompt_with_memory(
                &user_text,
                &session_id,
                user_id,
                &base_prompt,
                &merged.memory.gating.recall_filter,
            )
            .await;

        let recent = gateway.sessions.get_recent_messages(&session_id, None, user_id);
        let mut messages = Vec::with_capacity(recent.len() + 2);
        if !system_prompt.is_empty() {
            messages.push(ChatMessage::system(system_prompt));
        }
        messages.extend(recent.into_iter().map(|m| ChatMessage {
            role: m.role,
            content: m.content,
        }));
        messages.push(ChatMessage::user(user_text.clone()));

        let opts = ChatOptions {
            model: if merged.api.model.is_empty() {
                None
            } else {
                Some(merged.api.model.clone())
            },
            temperature: Some(merged.api.temperature),
            max_tokens: Some(merged.api.max_tokens),
            json_mode: false,
        };
        let tool_ctx = ToolContext {
            session_id: Some(session_id.clone()),
            user_id: Some(user_id.to_string()),
            source: Some("chat".into()),
            connection_id: ctx.connection_id.clone(),
            ..Default::default()
        };

        Metrics::incr(&gateway.metrics.llm_calls);
        let outcome = crate::runtime::run_chat_loop(
            gateway.chat.as_ref(),
            &gateway.tools,
            messages,
            &tool_ctx,
            &opts,
            &HashSet::new(),
        )
        .await;

        match outcome {
            Err(e) => {
                gateway.sessions.abort_turn(&session_id, &turn_id, user_id);
                Err(e)
            }
            Ok(ChatLoopOutcome::NeedsConfirmation {
                tool_call_id,
                tool_name,
                args,
                all_tool_calls,
                current_messages,
                content,
            }) => {
                // The turn is not committed while the human decides.
                gateway.sessions.set_pending_confirmation(
                    &session_id,
                    PendingConfirmation {
                        tool_call_id: tool_call_id.clone(),
                        tool_name: tool_name.clone(),
                        args: args.clone(),
                        current_messages,
                        pending_tool_calls: all_tool_calls,
                        content,
                        approved_call_ids: vec![],
                    },
                    user_id,
                );
                Ok(serde_json::json!({
                    "response": format!("Executing tool {tool_name} requires your confirmation."),
                    "session_id": session_id,
                    "status": "needs_confirmation",
                    "tool_call_id": tool_call_id,
                    "tool_name": tool_name,
                    "args": args,
                }))
            }
            Ok(ChatLoopOutcome::Completed { content }) => {
                if !gateway
                    .sessions
                    .commit_turn(&session_id, &turn_id, &content, user_id)
                {
                    return Err(Error::TurnConflict {
                        session_id,
                        turn_id,
                    });
                }
                Metrics::incr(&gateway.metrics.turns_completed);

                gateway
                    .bus
                    .emit(
                        EventType::InteractionCompleted,
                        serde_json::json!({
                            "session_id": session_id,
                            "user_id": user_id,
                            "channel": "web",
                            "user_input": user_text,
                            "assistant_output": content,
                        }),
                    )
                    .await;

                Ok(serde_json::json!({
                    "response": content,
                    "session_id": session_id,
                    "status": "success",
                }))
            }
        }
    })
}

fn h_chat_confirm<'a>(
    server: &'a GatewayServer,
    ctx: &'a RequestContext,
    params: Value,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let params: ChatConfirmParams = parse_params(params)?;
        let gateway = &server.gateway;
        let user_id = ctx.user_id.as_str();
        let session_id = params.session_id.clone();

        let pending = gateway
            .sessions
            .get_pending_confirmation(&session_id, user_id)
            .ok_or_else(|| Error::Other("no pending tool confirmation".into()))?;
        if pending.tool_call_id != params.tool_call_id {
            return Err(Error::Other("tool call id mismatch".into()));
        }

        if params.action == "reject" {
            gateway.sessions.clear_pending_confirmation(&session_id, user_id);
            return Ok(serde_json::json!({
                "status": "rejected",
                "response": "Execution rejected.",
                "session_id": session_id,
            }));
        }
        if params.action != "approve" {
            return Err(Error::Config(format!(
                "unknown confirm action: {}",
                params.action
            )));
        }

        // Replay the preserved batch with the approved call ids
        // (accumulated across chained confirmations). Other high-risk
        // calls in the batch chain a new confirmation.
        let tool_ctx = ToolContext {
            session_id: Some(session_id.clone()),
            user_id: Some(user_id.to_string()),
            source: Some("chat.confirm".into()),
            connection_id: ctx.connection_id.clone(),
            ..Default::default()
        };
        let mut approved: HashSet<String> =
            pending.approved_call_ids.iter().cloned().collect();
        approved.insert(params.tool_call_id.clone());
        let outcome = execute_tool_calls(
            &pending.pending_tool_calls,
            &gateway.tools,
            &tool_ctx,
            &approved,
        )
        .await;

        let mut blocks = match outcome {
            ToolBatchOutcome::NeedsConfirmation {
                tool_call_id,
                tool_name,
                args,
                all_tool_calls,
            } => {
                let chained = PendingConfirmation {
                    tool_call_id: tool_call_id.clone(),
                    tool_name: tool_name.clone(),
                    args: args.clone(),
                    current_messages: pending.current_messages,
                    pending_tool_calls: all_tool_calls,
                    content: pending.content,
                    approved_call_ids: approved.iter().cloned().collect(),
                };
                gateway
                    .sessions
                    .set_pending_confirmation(&session_id, chained, user_id);
                return Ok(serde_json::json!({
                    "response": format!("Executing tool {tool_name} requires your confirmation."),
                    "session_id": session_id,
                    "status": "needs_confirmation",
                    "tool_call_id": tool_call_id,
                    "tool_name": tool_name,
                    "args": args,
                }));
            }
            ToolBatchOutcome::Completed(blocks) => blocks,
        };
        blocks.push(ContentBlock::text(CONFIRMED_MARKER));

        // Resume the conversation with the results injected as a
        // synthetic user message.
        let mut messages = pending.current_messages.clone();
        messages.push(ChatMessage::assistant(pending.content.clone()));
        messages.push(ChatMessage::user(format!(
            "Tool results:\n{}\nContinue based on these results.",
            crate::runtime::flatten_blocks(&blocks)
        )));
        gateway.sessions.clear_pending_confirmation(&session_id, user_id);

        let merged = gateway.config.merged_config(Some(user_id));
        let opts = ChatOptions {
            model: if merged.api.model.is_empty() {
                None
            } else {
                Some(merged.api.model.clone())
            },
            temperature: Some(merged.api.temperature),
            max_tokens: Some(merged.api.max_tokens),
            json_mode: false,
        };

        let outcome = crate::runtime::run_chat_loop(
            gateway.chat.as_ref(),
            &gateway.tools,
            messages,
            &tool_ctx,
            &opts,
            &HashSet::new(),
        )
        .await?;

        match outcome {
            ChatLoopOutcome::NeedsConfirmation {
                tool_call_id,
                tool_name,
                args,
                all_tool_calls,
                current_messages,
                content,
            } => {
                gateway.sessions.set_pending_confirmation(
                    &session_id,
                    PendingConfirmation {
                        tool_call_id: tool_call_id.clone(),
                        tool_name: tool_name.clone(),
                        args: args.clone(),
                        current_messages,
                        pending_tool_calls: all_tool_calls,
                        content,
                        // A fresh batch starts with a clean slate.
                        approved_call_ids: vec![],
                    },
                    user_id,
                );
                Ok(serde_json::json!({
                    "response": format!("Executing tool {tool_name} requires your confirmation."),
                    "session_id": session_id,
                    "status": "needs_confirmation",
                    "tool_call_id": tool_call_id,
                    "tool_name": tool_name,
                    "args": args,
                }))
            }
            ChatLoopOutcome::Completed { content } => {
                gateway
                    .sessions
                    .add_message(&session_id, Role::Assistant, &content, user_id, true);
                Ok(serde_json::json!({
                    "response": content,
                    "session_id": session_id,
                    "status": "success",
                }))
            }
        }
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Memory handlers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn memory_user<'v>(ctx: &'v RequestContext, filters: Option<&'v Value>) -> &'v str {
    filters
        .and_then(|f| f.get("user_id"))
        .and_then(Value::as_str)
        .unwrap_or(&ctx.user_id)
}

fn h_memory_query<'a>(
    server: &'a GatewayServer,
    ctx: &'a RequestContext,
    params: Value,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let params: MemoryQueryParams = parse_params(params)?;
        let user_id = memory_user(ctx, params.filters.as_ref()).to_string();
        let session_id = params.session_id.as_deref().unwrap_or("default");

        let context = server
            .gateway
            .memory
            .get_context(&params.query, session_id, Some(&user_id))
            .await;
        Metrics::incr(&server.gateway.metrics.memory_recalls);

        Ok(serde_json::json!({
            "query": params.query,
            "context": context,
            "total": context.chars().count(),
        }))
    })
}

fn require_memory(server: &GatewayServer) -> Result<(), Error> {
    if server.gateway.memory.is_enabled() {
        Ok(())
    } else {
        Err(Error::Other("Memory system not enabled".into()))
    }
}

fn h_memory_cluster<'a>(
    server: &'a GatewayServer,
    ctx: &'a RequestContext,
    params: Value,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let params: SessionParams = parse_params(params)?;
        require_memory(server)?;
        let result = server
            .gateway
            .memory
            .cluster_entities(&params.session_id, Some(&ctx.user_id))
            .await;
        Ok(merge_session_id(result, &params.session_id))
    })
}

fn h_memory_summarize<'a>(
    server: &'a GatewayServer,
    ctx: &'a RequestContext,
    params: Value,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let params: MemorySummarizeParams = parse_params(params)?;
        require_memory(server)?;
        Ok(server
            .gateway
            .memory
            .summarize_session(&params.session_id, Some(&ctx.user_id), params.incremental)
            .await)
    })
}

fn h_memory_graph<'a>(
    server: &'a GatewayServer,
    ctx: &'a RequestContext,
    params: Value,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let params: SessionParams = parse_params(params)?;
        Ok(server
            .gateway
            .memory
            .memory_graph(&params.session_id, Some(&ctx.user_id))
            .await)
    })
}

fn h_memory_decay<'a>(
    server: &'a GatewayServer,
    ctx: &'a RequestContext,
    params: Value,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let params: SessionParams = parse_params(params)?;
        require_memory(server)?;
        Ok(server
            .gateway
            .memory
            .apply_decay(&params.session_id, Some(&ctx.user_id))
            .await)
    })
}

fn h_memory_cleanup<'a>(
    server: &'a GatewayServer,
    ctx: &'a RequestContext,
    params: Value,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let params: SessionParams = parse_params(params)?;
        require_memory(server)?;
        Ok(server
            .gateway
            .memory
            .cleanup_forgotten(&params.session_id, Some(&ctx.user_id))
            .await)
    })
}

fn merge_session_id(mut result: Value, session_id: &str) -> Value {
    if let Value::Object(map) = &mut result {
        map.insert("session_id".into(), Value::String(session_id.to_string()));
    }
    result
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session handlers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn h_sessions_list<'a>(
    server: &'a GatewayServer,
    _ctx: &'a RequestContext,
    _params: Value,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let sessions = server.gateway.sessions.list_sessions(None);
        let total = sessions.len();
        Ok(serde_json::json!({"sessions": sessions, "total": total}))
    })
}

fn h_session_detail<'a>(
    server: &'a GatewayServer,
    ctx: &'a RequestContext,
    params: Value,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let params: SessionParams = parse_params(params)?;
        let info = server
            .gateway
            .sessions
            .get_session_info(&params.session_id, &ctx.user_id)
            .ok_or_else(|| Error::SessionNotFound(params.session_id.clone()))?;
        let session = server
            .gateway
            .sessions
            .get_session(&params.session_id, &ctx.user_id)
            .ok_or_else(|| Error::SessionNotFound(params.session_id.clone()))?;
        Ok(serde_json::json!({
            "info": info,
            "messages": session["messages"],
        }))
    })
}

fn h_session_delete<'a>(
    server: &'a GatewayServer,
    ctx: &'a RequestContext,
    params: Value,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let params: SessionParams = parse_params(params)?;
        if server
            .gateway
            .sessions
            .delete_session(&params.session_id, &ctx.user_id)
        {
            Ok(serde_json::json!({"status": "deleted", "session_id": params.session_id}))
        } else {
            Err(Error::SessionNotFound(params.session_id))
        }
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool handlers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn h_tools_list<'a>(
    server: &'a GatewayServer,
    _ctx: &'a RequestContext,
    _params: Value,
) -> HandlerFuture<'a> {
    Box::pin(async move { Ok(server.gateway.tools.list_tools()) })
}

fn h_tool_call<'a>(
    server: &'a GatewayServer,
    ctx: &'a RequestContext,
    params: Value,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let params: ToolCallParams = parse_params(params)?;
        let tool_ctx = ToolContext {
            session_id: params
                .params
                .get("session_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            user_id: Some(ctx.user_id.clone()),
            source: Some("gateway".into()),
            connection_id: ctx.connection_id.clone(),
            ..Default::default()
        };

        Metrics::incr(&server.gateway.metrics.tool_calls);
        let result = server
            .gateway
            .tools
            .call_tool(&params.tool_name, params.params, &tool_ctx)
            .await?;

        Ok(serde_json::json!({"tool": params.tool_name, "result": result}))
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config handlers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn h_config_get<'a>(
    server: &'a GatewayServer,
    ctx: &'a RequestContext,
    params: Value,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let user_id = params
            .get("user_id")
            .and_then(Value::as_str)
            .unwrap_or(&ctx.user_id);
        Ok(serde_json::json!({
            "config": server.gateway.config.merged_redacted(Some(user_id)),
        }))
    })
}

fn h_config_reload<'a>(
    server: &'a GatewayServer,
    _ctx: &'a RequestContext,
    _params: Value,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        server.gateway.config.reload().await?;
        Ok(serde_json::json!({"status": "reloaded"}))
    })
}

fn h_config_update<'a>(
    server: &'a GatewayServer,
    ctx: &'a RequestContext,
    params: Value,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let params: ConfigUpdateParams = parse_params(params)?;
        let user_id = params.user_id.clone().unwrap_or_else(|| ctx.user_id.clone());
        let saved = server.gateway.config.update_user(&user_id, params.changes).await?;
        Ok(serde_json::json!({"status": "updated", "user_id": user_id, "config": saved}))
    })
}

fn h_config_reset<'a>(
    server: &'a GatewayServer,
    ctx: &'a RequestContext,
    params: Value,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let user_id = params
            .get("user_id")
            .and_then(Value::as_str)
            .unwrap_or(&ctx.user_id)
            .to_string();
        server.gateway.config.reset_user(&user_id).await?;
        Ok(serde_json::json!({"status": "reset", "user_id": user_id}))
    })
}

fn h_config_switch_model<'a>(
    server: &'a GatewayServer,
    ctx: &'a RequestContext,
    params: Value,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let params: ConfigSwitchModelParams = parse_params(params)?;
        let user_id = params.user_id.clone().or_else(|| Some(ctx.user_id.clone()));
        server
            .gateway
            .config
            .switch_model(user_id.as_deref(), &params.model)
            .await?;
        Ok(serde_json::json!({"status": "switched", "model": params.model}))
    })
}

fn h_config_diagnose<'a>(
    server: &'a GatewayServer,
    _ctx: &'a RequestContext,
    _params: Value,
) -> HandlerFuture<'a> {
    Box::pin(async move { Ok(doctor::report(server).await) })
}
