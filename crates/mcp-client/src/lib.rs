//! MCP (model context protocol) client: server connections, tool
//! discovery, and the `unified_call` dispatch surface the gateway's
//! tool service builds on.

mod manager;
mod protocol;
mod transport;

pub use manager::{McpDispatch, McpError, McpManager, ServiceInfo};
pub use protocol::{McpToolDef, ToolCallResult};
