//! Channel registry.
//!
//! Concrete enterprise adapters live outside the gateway; this module
//! defines the interface they implement and the registry the `send`
//! handler routes through. Outbound replies are plain text unless a
//! channel explicitly advertises richer types.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use pv_domain::error::Result;
use pv_events::{EventBus, EventType};

#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    fn channel_type(&self) -> &str {
        "generic"
    }

    /// Whether the channel supports message types beyond `text`.
    fn supports_rich(&self) -> bool {
        false
    }

    async fn send(&self, target: &str, content: &str, message_type: &str) -> Result<()>;
}

#[derive(Default)]
pub struct ChannelRegistry {
    channels: RwLock<HashMap<String, Arc<dyn Channel>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, channel: Arc<dyn Channel>) {
        let name = channel.name().to_string();
        tracing::info!(channel = %name, "registered channel");
        self.channels.write().insert(name, channel);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Channel>> {
        self.channels.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.channels.read().keys().cloned().collect()
    }

    pub fn status(&self) -> Value {
        let channels = self.channels.read();
        let map: serde_json::Map<String, Value> = channels
            .values()
            .map(|c| {
                (
                    c.name().to_string(),
                    serde_json::json!({"status": "active", "type": c.channel_type()}),
                )
            })
            .collect();
        Value::Object(map)
    }

    /// Dispatch an outbound reply; unknown channels only log.
    pub async fn dispatch_reply(&self, channel: &str, target: &str, content: &str) {
        let Some(chan) = self.get(channel) else {
            tracing::debug!(channel = %channel, "no channel registered for reply");
            return;
        };
        let message_type = if chan.supports_rich() { "rich" } else { "text" };
        if let Err(e) = chan.send(target, content, message_type).await {
            tracing::warn!(channel = %channel, error = %e, "outbound reply failed");
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Web channel
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The built-in loopback channel behind the web UI: inbound messages
/// enter the bus as `channel.message`, outbound replies are collected
/// for pickup by the HTTP/WS surface.
pub struct WebChannel {
    bus: Arc<EventBus>,
    outbox: Mutex<Vec<(String, String)>>,
}

impl WebChannel {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            outbox: Mutex::new(Vec::new()),
        }
    }

    /// Feed an inbound message into the gateway.
    pub async fn inject_inbound(&self, sender: &str, content: &str) {
        self.bus
            .emit(
                EventType::ChannelMessage,
                serde_json::json!({
                    "channel": "web",
                    "sender": sender,
                    "content": content,
                }),
            )
            .await;
    }

    pub fn drain_outbox(&self) -> Vec<(String, String)> {
        std::mem::take(&mut *self.outbox.lock())
    }
}

#[async_trait]
impl Channel for WebChannel {
    fn name(&self) -> &str {
        "web"
    }

    fn channel_type(&self) -> &str {
        "web"
    }

    async fn send(&self, target: &str, content: &str, _message_type: &str) -> Result<()> {
        self.outbox
            .lock()
            .push((target.to_string(), content.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registry_lists_and_reports_status() {
        let bus = Arc::new(EventBus::new());
        let registry = ChannelRegistry::new();
        registry.register(Arc::new(WebChannel::new(bus)));

        assert_eq!(registry.names(), vec!["web"]);
        let status = registry.status();
        assert_eq!(status["web"]["status"], "active");
        assert_eq!(status["web"]["type"], "web");
    }

    #[tokio::test]
    async fn web_channel_collects_outbound() {
        let bus = Arc::new(EventBus::new());
        let channel = Arc::new(WebChannel::new(bus));
        let registry = ChannelRegistry::new();
        registry.register(channel.clone());

        registry.dispatch_reply("web", "u1", "hello back").await;
        let outbox = channel.drain_outbox();
        assert_eq!(outbox, vec![("u1".to_string(), "hello back".to_string())]);
    }
}
