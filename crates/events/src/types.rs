use serde::{Deserialize, Serialize};

/// The closed set of events carried on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "connected")]
    Connected,
    #[serde(rename = "disconnected")]
    Disconnected,
    #[serde(rename = "channel.message")]
    ChannelMessage,
    #[serde(rename = "conversation.start")]
    ConversationStart,
    #[serde(rename = "conversation.complete")]
    ConversationComplete,
    #[serde(rename = "conversation.error")]
    ConversationError,
    #[serde(rename = "interaction.completed")]
    InteractionCompleted,
    #[serde(rename = "memory.saved")]
    MemorySaved,
    #[serde(rename = "memory.recalled")]
    MemoryRecalled,
    #[serde(rename = "memory.clustered")]
    MemoryClustered,
    #[serde(rename = "memory.summarized")]
    MemorySummarized,
    #[serde(rename = "tool.call.start")]
    ToolCallStart,
    #[serde(rename = "tool.call.result")]
    ToolCallResult,
    #[serde(rename = "tool.call.error")]
    ToolCallError,
    #[serde(rename = "config.changed")]
    ConfigChanged,
    #[serde(rename = "config.reloaded")]
    ConfigReloaded,
    #[serde(rename = "heartbeat")]
    Heartbeat,
    #[serde(rename = "health.update")]
    HealthUpdate,
    #[serde(rename = "agent.start")]
    AgentStart,
    #[serde(rename = "agent.stream")]
    AgentStream,
    #[serde(rename = "agent.complete")]
    AgentComplete,
    #[serde(rename = "agent.error")]
    AgentError,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Connected => "connected",
            EventType::Disconnected => "disconnected",
            EventType::ChannelMessage => "channel.message",
            EventType::ConversationStart => "conversation.start",
            EventType::ConversationComplete => "conversation.complete",
            EventType::ConversationError => "conversation.error",
            EventType::InteractionCompleted => "interaction.completed",
            EventType::MemorySaved => "memory.saved",
            EventType::MemoryRecalled => "memory.recalled",
            EventType::MemoryClustered => "memory.clustered",
            EventType::MemorySummarized => "memory.summarized",
            EventType::ToolCallStart => "tool.call.start",
            EventType::ToolCallResult => "tool.call.result",
            EventType::ToolCallError => "tool.call.error",
            EventType::ConfigChanged => "config.changed",
            EventType::ConfigReloaded => "config.reloaded",
            EventType::Heartbeat => "heartbeat",
            EventType::HealthUpdate => "health.update",
            EventType::AgentStart => "agent.start",
            EventType::AgentStream => "agent.stream",
            EventType::AgentComplete => "agent.complete",
            EventType::AgentError => "agent.error",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serde_form_matches_as_str() {
        for event in [
            EventType::ChannelMessage,
            EventType::InteractionCompleted,
            EventType::ToolCallStart,
            EventType::ConfigReloaded,
            EventType::AgentStream,
        ] {
            let json = serde_json::to_value(event).unwrap();
            assert_eq!(json, event.as_str());
        }
    }
}
