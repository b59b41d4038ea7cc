//! Aggregated diagnostics for `config.diagnose` and the doctor CLI.

use serde_json::Value;

use crate::server::GatewayServer;

pub async fn report(server: &GatewayServer) -> Value {
    let gateway = &server.gateway;

    let issues: Vec<Value> = gateway
        .config
        .diagnose()
        .into_iter()
        .map(|issue| {
            serde_json::json!({
                "severity": format!("{:?}", issue.severity),
                "field": issue.field,
                "message": issue.message,
            })
        })
        .collect();

    let memory_enabled = gateway.memory.is_enabled();
    let graph_reachable = if memory_enabled {
        gateway.memory.store().graph_reachable().await
    } else {
        false
    };

    serde_json::json!({
        "issues": issues,
        "memory": {
            "enabled": memory_enabled,
            "graph_reachable": graph_reachable,
        },
        "sessions": {
            "count": gateway.sessions.session_count(),
        },
        "channels": gateway.channels.names(),
        "plugins": gateway.plugins.count(),
        "mcp_servers": gateway.mcp.server_count(),
        "processing": gateway.orchestrator.stats(),
        "metrics": gateway.metrics.snapshot(),
        "uptime": server.uptime_seconds(),
    })
}
