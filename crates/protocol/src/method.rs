use serde::{Deserialize, Serialize};

/// The fixed request method table. Dispatch is a map from this enum
/// to handler closures; there is no reflective dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestMethod {
    #[serde(rename = "connect")]
    Connect,
    #[serde(rename = "health")]
    Health,
    #[serde(rename = "status")]
    Status,
    #[serde(rename = "system.info")]
    SystemInfo,
    #[serde(rename = "channels.status")]
    ChannelsStatus,
    #[serde(rename = "send")]
    Send,
    #[serde(rename = "agent")]
    Agent,
    #[serde(rename = "chat")]
    Chat,
    #[serde(rename = "chat.confirm")]
    ChatConfirm,

    #[serde(rename = "memory.query")]
    MemoryQuery,
    #[serde(rename = "memory.cluster")]
    MemoryCluster,
    #[serde(rename = "memory.summarize")]
    MemorySummarize,
    #[serde(rename = "memory.graph")]
    MemoryGraph,
    #[serde(rename = "memory.decay")]
    MemoryDecay,
    #[serde(rename = "memory.cleanup")]
    MemoryCleanup,

    #[serde(rename = "sessions.list")]
    SessionsList,
    #[serde(rename = "session.detail")]
    SessionDetail,
    #[serde(rename = "session.delete")]
    SessionDelete,

    #[serde(rename = "tools.list")]
    ToolsList,
    #[serde(rename = "tool.call")]
    ToolCall,

    #[serde(rename = "config.get")]
    ConfigGet,
    #[serde(rename = "config.reload")]
    ConfigReload,
    #[serde(rename = "config.update")]
    ConfigUpdate,
    #[serde(rename = "config.reset")]
    ConfigReset,
    #[serde(rename = "config.switch_model")]
    ConfigSwitchModel,
    #[serde(rename = "config.diagnose")]
    ConfigDiagnose,
}

impl RequestMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestMethod::Connect => "connect",
            RequestMethod::Health => "health",
            RequestMethod::Status => "status",
            RequestMethod::SystemInfo => "system.info",
            RequestMethod::ChannelsStatus => "channels.status",
            RequestMethod::Send => "send",
            RequestMethod::Agent => "agent",
            RequestMethod::Chat => "chat",
            RequestMethod::ChatConfirm => "chat.confirm",
            RequestMethod::MemoryQuery => "memory.query",
            RequestMethod::MemoryCluster => "memory.cluster",
            RequestMethod::MemorySummarize => "memory.summarize",
            RequestMethod::MemoryGraph => "memory.graph",
            RequestMethod::MemoryDecay => "memory.decay",
            RequestMethod::MemoryCleanup => "memory.cleanup",
            RequestMethod::SessionsList => "sessions.list",
            RequestMethod::SessionDetail => "session.detail",
            RequestMethod::SessionDelete => "session.delete",
            RequestMethod::ToolsList => "tools.list",
            RequestMethod::ToolCall => "tool.call",
            RequestMethod::ConfigGet => "config.get",
            RequestMethod::ConfigReload => "config.reload",
            RequestMethod::ConfigUpdate => "config.update",
            RequestMethod::ConfigReset => "config.reset",
            RequestMethod::ConfigSwitchModel => "config.switch_model",
            RequestMethod::ConfigDiagnose => "config.diagnose",
        }
    }

    /// Parse a method string; `None` for anything outside the table.
    pub fn parse(s: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_string())).ok()
    }
}

impl std::fmt::Display for RequestMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_table_entries() {
        assert_eq!(RequestMethod::parse("connect"), Some(RequestMethod::Connect));
        assert_eq!(
            RequestMethod::parse("memory.cluster"),
            Some(RequestMethod::MemoryCluster)
        );
        assert_eq!(
            RequestMethod::parse("config.switch_model"),
            Some(RequestMethod::ConfigSwitchModel)
        );
    }

    #[test]
    fn parse_rejects_unknown_methods() {
        assert_eq!(RequestMethod::parse("computer.browser"), None);
        assert_eq!(RequestMethod::parse(""), None);
    }

    #[test]
    fn as_str_round_trips() {
        let all = [
            RequestMethod::Connect,
            RequestMethod::Health,
            RequestMethod::Status,
            RequestMethod::SystemInfo,
            RequestMethod::ChannelsStatus,
            RequestMethod::Send,
            RequestMethod::Agent,
            RequestMethod::Chat,
            RequestMethod::ChatConfirm,
            RequestMethod::MemoryQuery,
            RequestMethod::MemoryCluster,
            RequestMethod::MemorySummarize,
            RequestMethod::MemoryGraph,
            RequestMethod::MemoryDecay,
            RequestMethod::MemoryCleanup,
            RequestMethod::SessionsList,
            RequestMethod::SessionDetail,
            RequestMethod::SessionDelete,
            RequestMethod::ToolsList,
            RequestMethod::ToolCall,
            RequestMethod::ConfigGet,
            RequestMethod::ConfigReload,
            RequestMethod::ConfigUpdate,
            RequestMethod::ConfigReset,
            RequestMethod::ConfigSwitchModel,
            RequestMethod::ConfigDiagnose,
        ];
        for method in all {
            assert_eq!(RequestMethod::parse(method.as_str()), Some(method));
        }
    }
}
