//! The unified tool dispatcher.
//!
//! Resolution order: local tool → agent handoff → MCP. Every
//! invocation emits `tool.call.start` and then either
//! `tool.call.result` or `tool.call.error`; errors propagate to the
//! caller after the error event.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;

use pv_domain::error::{Error, Result};
use pv_events::{EventBus, EventType};
use pv_mcp_client::McpDispatch;

use crate::risk::ToolPolicy;

/// Context threaded through a tool invocation for event correlation.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub source: Option<String>,
    pub request_id: Option<String>,
    pub connection_id: Option<String>,
}

/// A tool implemented inside the gateway process.
#[async_trait]
pub trait LocalTool: Send + Sync {
    fn tool_id(&self) -> &str;
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    async fn invoke(&self, args: Value, ctx: &ToolContext) -> Result<Value>;
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentInfo {
    pub name: String,
    pub description: String,
}

/// Agent handoff backend (external agent manager).
#[async_trait]
pub trait AgentDispatch: Send + Sync {
    async fn call_agent(
        &self,
        agent_name: &str,
        prompt: &str,
        session_id: Option<&str>,
    ) -> Result<Value>;

    fn list_agents(&self) -> Vec<AgentInfo> {
        Vec::new()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ToolService
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ToolService {
    bus: Arc<EventBus>,
    mcp: Arc<dyn McpDispatch>,
    agents: Option<Arc<dyn AgentDispatch>>,
    local: RwLock<HashMap<String, Arc<dyn LocalTool>>>,
    policy: ToolPolicy,
}

impl ToolService {
    pub fn new(
        bus: Arc<EventBus>,
        mcp: Arc<dyn McpDispatch>,
        agents: Option<Arc<dyn AgentDispatch>>,
    ) -> Self {
        Self {
            bus,
            mcp,
            agents,
            local: RwLock::new(HashMap::new()),
            policy: ToolPolicy::new(),
        }
    }

    pub fn policy(&self) -> &ToolPolicy {
        &self.policy
    }

    pub fn register_tool(&self, tool: Arc<dyn LocalTool>) {
        let id = tool.tool_id().to_string();
        let mut local = self.local.write();
        if local.contains_key(&id) {
            tracing::warn!(tool_id = %id, "tool already registered, overwriting");
        }
        tracing::info!(tool_id = %id, "registered local tool");
        local.insert(id, tool);
    }

    pub fn unregister_tool(&self, tool_id: &str) {
        if self.local.write().remove(tool_id).is_some() {
            tracing::info!(tool_id = %tool_id, "unregistered local tool");
        }
    }

    /// All callable tools for `tools.list`: MCP services, agent
    /// handoffs, and local tools.
    pub fn list_tools(&self) -> Value {
        let mut tools: Vec<Value> = Vec::new();

        for svc in self.mcp.list_services() {
            tools.push(serde_json::json!({
                "service": svc.name,
                "name": svc.name,
                "description": svc.description,
                "actions": svc.available_tools,
                "type": "mcp",
            }));
        }

        if let Some(agents) = &self.agents {
            for agent in agents.list_agents() {
                tools.push(serde_json::json!({
                    "service": agent.name,
                    "name": agent.name,
                    "description": agent.description,
                    "actions": [{"name": "handoff", "description": agent.description}],
                    "type": "agent",
                }));
            }
        }

        for tool in self.local.read().values() {
            tools.push(serde_json::json!({
                "service": tool.tool_id(),
                "name": tool.name(),
                "description": tool.description(),
                "actions": [],
                "type": "local",
            }));
        }

        let total = tools.len();
        serde_json::json!({"tools": tools, "total": total})
    }

    async fn emit(&self, event: EventType, payload: Value) {
        self.bus.emit(event, payload).await;
    }

    /// Invoke one tool by name, resolving local → agent → MCP.
    pub async fn call_tool(&self, tool_name: &str, params: Value, ctx: &ToolContext) -> Result<Value> {
        let correlation = serde_json::json!({
            "request_id": ctx.request_id,
            "connection_id": ctx.connection_id,
        });

        // 1. Local tool.
        let local_tool = self.local.read().get(tool_name).cloned();
        if let Some(tool) = local_tool {
            let mut start = correlation.clone();
            start["tool_type"] = "local".into();
            start["tool_id"] = tool_name.into();
            start["args"] = params.clone();
            self.emit(EventType::ToolCallStart, start).await;

            match tool.invoke(params, ctx).await {
                Ok(result) => {
                    let mut payload = correlation.clone();
                    payload["tool_type"] = "local".into();
                    payload["tool_id"] = tool_name.into();
                    payload["result"] = result.clone();
                    self.emit(EventType::ToolCallResult, payload).await;
                    return Ok(result);
                }
                Err(e) => {
                    tracing::error!(tool = %tool_name, error = %e, "local tool invocation failed");
                    let mut payload = correlation.clone();
                    payload["tool_type"] = "local".into();
                    payload["tool_id"] = tool_name.into();
                    payload["error"] = e.to_string().into();
                    self.emit(EventType::ToolCallError, payload).await;
                    return Err(e);
                }
            }
        }

        // 2. Agent handoff.
        let agent_type = params
            .get("agentType")
            .and_then(|v| v.as_str())
            .unwrap_or("mcp")
            .to_lowercase();
        if agent_type == "agent" {
            let agent_name = params
                .get("agent_name")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            let prompt = params.get("prompt").and_then(|v| v.as_str()).map(str::to_string);
            let (Some(agent_name), Some(prompt)) = (agent_name, prompt) else {
                return Err(Error::Tool(
                    "agent tool call requires agent_name and prompt".into(),
                ));
            };
            let Some(agents) = &self.agents else {
                return Err(Error::Tool("agent manager not available".into()));
            };

            let mut start = correlation.clone();
            start["tool_type"] = "agent".into();
            start["agent_name"] = agent_name.clone().into();
            self.emit(EventType::ToolCallStart, start).await;

            match agents
                .call_agent(&agent_name, &prompt, ctx.session_id.as_deref())
                .await
            {
                Ok(result) => {
                    let mut payload = correlation.clone();
                    payload["tool_type"] = "agent".into();
                    payload["agent_name"] = agent_name.into();
                    payload["result"] = result.clone();
                    self.emit(EventType::ToolCallResult, payload).await;
                    return Ok(result);
                }
                Err(e) => {
                    let mut payload = correlation.clone();
                    payload["tool_type"] = "agent".into();
                    payload["agent_name"] = agent_name.into();
                    payload["error"] = e.to_string().into();
                    self.emit(EventType::ToolCallError, payload).await;
                    return Err(e);
                }
            }
        }

        // 3. MCP (the default backend).
        let service_name = params
            .get("service_name")
            .and_then(|v| v.as_str())
            .unwrap_or(tool_name)
            .to_string();
        let actual_tool_name = params
            .get("tool_name")
            .or_else(|| params.get("command"))
            .and_then(|v| v.as_str())
            .unwrap_or(tool_name)
            .to_string();
        let args = strip_routing_keys(&params);

        let mut start = correlation.clone();
        start["tool_type"] = "mcp".into();
        start["service_name"] = service_name.clone().into();
        start["tool_name"] = actual_tool_name.clone().into();
        start["args"] = args.clone();
        start["session_id"] = ctx.session_id.clone().into();
        start["user_id"] = ctx.user_id.clone().into();
        start["source"] = ctx.source.clone().into();
        self.emit(EventType::ToolCallStart, start).await;

        match self
            .mcp
            .unified_call(&service_name, &actual_tool_name, args)
            .await
        {
            Ok(result) => {
                let mut payload = correlation.clone();
                payload["tool_type"] = "mcp".into();
                payload["service_name"] = service_name.into();
                payload["tool_name"] = actual_tool_name.into();
                payload["result"] = result.clone();
                self.emit(EventType::ToolCallResult, payload).await;
                Ok(result)
            }
            Err(e) => {
                tracing::error!(
                    service = %service_name,
                    tool = %actual_tool_name,
                    error = %e,
                    "MCP tool invocation failed"
                );
                let mut payload = correlation.clone();
                payload["tool_type"] = "mcp".into();
                payload["service_name"] = service_name.into();
                payload["tool_name"] = actual_tool_name.into();
                payload["error"] = e.to_string().into();
                self.emit(EventType::ToolCallError, payload).await;
                Err(e)
            }
        }
    }
}

/// Strip the routing keys before forwarding args to the backend.
fn strip_routing_keys(params: &Value) -> Value {
    match params {
        Value::Object(map) => {
            let filtered: serde_json::Map<String, Value> = map
                .iter()
                .filter(|(k, _)| !matches!(k.as_str(), "service_name" | "tool_name" | "agentType"))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            Value::Object(filtered)
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_keys_are_stripped() {
        let params = serde_json::json!({
            "service_name": "s1",
            "tool_name": "t1",
            "agentType": "mcp",
            "query": "weather",
        });
        let args = strip_routing_keys(&params);
        assert_eq!(args, serde_json::json!({"query": "weather"}));
    }
}
