use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Gateway server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default = "d_port")]
    pub port: u16,
    /// Heartbeat event broadcast interval.
    #[serde(default = "d_heartbeat_interval_s")]
    pub heartbeat_interval_s: u64,
    /// Cached idempotent responses live this long.
    #[serde(default = "d_idempotency_ttl_s")]
    pub idempotency_ttl_s: u64,
    /// Periodic sweep: idempotency eviction + stale connection close.
    #[serde(default = "d_sweep_interval_s")]
    pub sweep_interval_s: u64,
    /// Connections without a heartbeat for this long are force-closed.
    #[serde(default = "d_stale_connection_s")]
    pub stale_connection_s: u64,
    /// Optional pre-shared WebSocket token. Empty disables the check;
    /// the auth scheme proper is pluggable and out of scope here.
    #[serde(default)]
    pub token: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: d_host(),
            port: d_port(),
            heartbeat_interval_s: d_heartbeat_interval_s(),
            idempotency_ttl_s: d_idempotency_ttl_s(),
            sweep_interval_s: d_sweep_interval_s(),
            stale_connection_s: d_stale_connection_s(),
            token: String::new(),
        }
    }
}

fn d_host() -> String {
    "127.0.0.1".into()
}

fn d_port() -> u16 {
    8700
}

fn d_heartbeat_interval_s() -> u64 {
    30
}

fn d_idempotency_ttl_s() -> u64 {
    300
}

fn d_sweep_interval_s() -> u64 {
    60
}

fn d_stale_connection_s() -> u64 {
    300
}
