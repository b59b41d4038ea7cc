//! Typed parameter DTOs for the method table. Validation happens at
//! the boundary: handlers deserialize into these and reject bad
//! params as protocol errors.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::DeviceIdentity;
use crate::method::RequestMethod;

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectParams {
    pub identity: DeviceIdentity,
    #[serde(default = "d_protocol_version")]
    pub protocol_version: String,
}

fn d_protocol_version() -> String {
    "1.0".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendParams {
    pub channel: String,
    pub target: String,
    pub content: String,
    #[serde(default = "d_text")]
    pub message_type: String,
}

fn d_text() -> String {
    "text".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentParams {
    pub agent_name: String,
    pub prompt: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatParams {
    pub message: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatConfirmParams {
    pub session_id: String,
    pub tool_call_id: String,
    /// `"approve"` or `"reject"`.
    pub action: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemoryQueryParams {
    pub query: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default = "d_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub filters: Option<Value>,
}

fn d_top_k() -> usize {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionParams {
    pub session_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemorySummarizeParams {
    pub session_id: String,
    #[serde(default)]
    pub incremental: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolCallParams {
    pub tool_name: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfigUpdateParams {
    #[serde(default)]
    pub user_id: Option<String>,
    pub changes: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfigSwitchModelParams {
    #[serde(default)]
    pub user_id: Option<String>,
    pub model: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HTTP batch surface
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Deserialize)]
pub struct BatchRequest {
    pub requests: Vec<BatchItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchItem {
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchItemResult {
    pub method: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchItem {
    pub fn parse_method(&self) -> Option<RequestMethod> {
        RequestMethod::parse(&self.method)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_items_sort_by_priority_desc() {
        let req: BatchRequest = serde_json::from_str(
            r#"{"requests":[
                {"method":"health","priority":1},
                {"method":"status","priority":5},
                {"method":"system.info"}
            ]}"#,
        )
        .unwrap();
        let mut items = req.requests;
        items.sort_by_key(|i| std::cmp::Reverse(i.priority));
        let methods: Vec<_> = items.iter().map(|i| i.method.as_str()).collect();
        assert_eq!(methods, vec!["status", "health", "system.info"]);
    }

    #[test]
    fn chat_confirm_params_require_ids() {
        let params: ChatConfirmParams = serde_json::from_str(
            r#"{"session_id":"s1","tool_call_id":"call_2","action":"approve"}"#,
        )
        .unwrap();
        assert_eq!(params.action, "approve");

        let missing = serde_json::from_str::<ChatConfirmParams>(r#"{"session_id":"s1"}"#);
        assert!(missing.is_err());
    }

    #[test]
    fn memory_query_defaults_top_k() {
        let params: MemoryQueryParams =
            serde_json::from_str(r#"{"query":"what do I like"}"#).unwrap();
        assert_eq!(params.top_k, 5);
        assert!(params.session_id.is_none());
    }
}
