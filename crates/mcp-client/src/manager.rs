//! MCP manager: holds server connections, discovers tools, and
//! exposes the `unified_call(service, tool, args)` dispatch surface.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use pv_domain::config::{McpConfig, McpServerConfig};
use pv_domain::error::Error;

use crate::protocol::{self, McpToolDef, ToolCallResult, ToolsListResult};
use crate::transport::{StdioTransport, TransportError};

/// The gateway-facing dispatch surface. From the gateway's
/// perspective an MCP backend is nothing but this.
#[async_trait]
pub trait McpDispatch: Send + Sync {
    async fn unified_call(
        &self,
        service_name: &str,
        tool_name: &str,
        args: Value,
    ) -> Result<Value, Error>;

    fn list_services(&self) -> Vec<ServiceInfo>;
}

/// One service as listed by `tools.list`.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    pub name: String,
    pub description: String,
    pub available_tools: Vec<McpToolDef>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// McpServer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct McpServer {
    id: String,
    description: String,
    tools: Vec<McpToolDef>,
    transport: StdioTransport,
}

impl McpServer {
    /// Spawn the process, perform the MCP handshake, discover tools.
    async fn initialize(config: &McpServerConfig) -> Result<Self, McpError> {
        let transport = StdioTransport::spawn(config).map_err(McpError::Transport)?;

        let resp = transport
            .send_request("initialize", Some(protocol::initialize_params()))
            .await
            .map_err(McpError::Transport)?;
        if resp.is_error() {
            return Err(McpError::Protocol(format!(
                "initialize failed: {:?}",
                resp.error
            )));
        }

        transport
            .send_notification("notifications/initialized")
            .await
            .map_err(McpError::Transport)?;

        let tools_resp = transport
            .send_request("tools/list", None)
            .await
            .map_err(McpError::Transport)?;
        let tools = if tools_resp.is_error() {
            tracing::warn!(server_id = %config.id, "tools/list returned error, server has no tools");
            Vec::new()
        } else {
            match serde_json::from_value::<ToolsListResult>(
                tools_resp.result.unwrap_or(Value::Null),
            ) {
                Ok(r) => r.tools,
                Err(e) => {
                    tracing::warn!(server_id = %config.id, error = %e, "failed to parse tools/list result");
                    Vec::new()
                }
            }
        };

        tracing::info!(
            server_id = %config.id,
            tool_count = tools.len(),
            "MCP server initialized"
        );

        Ok(Self {
            id: config.id.clone(),
            description: config.description.clone(),
            tools,
            transport,
        })
    }

    async fn call_tool(&self, tool_name: &str, arguments: Value) -> Result<ToolCallResult, McpError> {
        if !self.transport.is_alive() {
            return Err(McpError::ServerDown(self.id.clone()));
        }

        let params = serde_json::json!({
            "name": tool_name,
            "arguments": arguments,
        });
        let resp = self
            .transport
            .send_request("tools/call", Some(params))
            .await
            .map_err(McpError::Transport)?;

        if resp.is_error() {
            return Err(McpError::Protocol(format!(
                "tools/call failed: {:?}",
                resp.error
            )));
        }

        serde_json::from_value::<ToolCallResult>(resp.result.unwrap_or(Value::Null))
            .map_err(|e| McpError::Protocol(format!("failed to parse tools/call result: {e}")))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// McpManager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Manager holding all configured server connections.
pub struct McpManager {
    servers: HashMap<String, McpServer>,
}

impl McpManager {
    pub fn empty() -> Self {
        Self {
            servers: HashMap::new(),
        }
    }

    /// Initialize every configured server. Failures are logged and the
    /// server skipped; a dead tool backend never blocks startup.
    pub async fn from_config(config: &McpConfig) -> Self {
        let mut servers = HashMap::new();
        for server_config in &config.servers {
            tracing::info!(
                server_id = %server_config.id,
                command = %server_config.command,
                "initializing MCP server"
            );
            match McpServer::initialize(server_config).await {
                Ok(server) => {
                    servers.insert(server_config.id.clone(), server);
                }
                Err(e) => {
                    tracing::warn!(
                        server_id = %server_config.id,
                        error = %e,
                        "failed to initialize MCP server, skipping"
                    );
                }
            }
        }
        Self { servers }
    }

    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub async fn shutdown(&self) {
        for server in self.servers.values() {
            server.transport.shutdown().await;
        }
    }
}

#[async_trait]
impl McpDispatch for McpManager {
    async fn unified_call(
        &self,
        service_name: &str,
        tool_name: &str,
        args: Value,
    ) -> Result<Value, Error> {
        let server = self
            .servers
            .get(service_name)
            .ok_or_else(|| Error::Tool(format!("MCP service not found: {service_name}")))?;

        let result = server
            .call_tool(tool_name, args)
            .await
            .map_err(|e| Error::Tool(e.to_string()))?;

        if result.is_error {
            return Err(Error::Tool(result.text()));
        }
        Ok(Value::String(result.text()))
    }

    fn list_services(&self) -> Vec<ServiceInfo> {
        self.servers
            .values()
            .filter(|s| s.transport.is_alive())
            .map(|s| ServiceInfo {
                name: s.id.clone(),
                description: s.description.clone(),
                available_tools: s.tools.clone(),
            })
            .collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Error type
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("MCP transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("MCP protocol error: {0}")]
    Protocol(String),

    #[error("MCP server is down: {0}")]
    ServerDown(String),
}
