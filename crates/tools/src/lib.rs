//! Unified tool dispatch: local tools, agent handoffs, and MCP
//! services behind one entry point, with risk-gated human-in-the-loop
//! confirmation for destructive calls.

mod batch;
mod parse;
mod risk;
mod service;

pub use batch::execute_tool_calls;
pub use parse::parse_tool_calls;
pub use risk::ToolPolicy;
pub use service::{AgentDispatch, AgentInfo, LocalTool, ToolContext, ToolService};
