//! WebSocket connection table.
//!
//! Each connection owns an outbound message channel; a writer task in
//! `ws.rs` drains it into the socket. The table is guarded by one
//! lock covering accept/disconnect; heartbeats update per-connection
//! state through the same manager.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use pv_events::{EventBus, EventType};
use pv_protocol::{DeviceIdentity, EventMessage, ResponseMessage, WireMessage};

const OUTBOUND_CAPACITY: usize = 64;

/// One connected client.
pub struct Connection {
    pub connection_id: String,
    pub identity: Mutex<Option<DeviceIdentity>>,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: Mutex<Instant>,
    pub is_authenticated: Mutex<bool>,
    outbound: mpsc::Sender<String>,
}

impl Connection {
    pub fn send_frame(&self, frame: &WireMessage) {
        match serde_json::to_string(frame) {
            Ok(json) => {
                if self.outbound.try_send(json).is_err() {
                    tracing::debug!(
                        connection_id = %self.connection_id,
                        "outbound channel full or closed, dropping frame"
                    );
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize outbound frame");
            }
        }
    }

    pub fn send_response(&self, response: ResponseMessage) {
        self.send_frame(&WireMessage::Response(response));
    }

    pub fn send_event(&self, event: EventMessage) {
        self.send_frame(&WireMessage::Event(event));
    }

    pub fn touch(&self) {
        *self.last_heartbeat.lock() = Instant::now();
    }

    pub fn bind_identity(&self, identity: DeviceIdentity) {
        *self.identity.lock() = Some(identity);
        // Auth scheme is pluggable; the gateway accepts every bound
        // identity.
        *self.is_authenticated.lock() = true;
    }
}

/// Connection table plus device-id index.
pub struct ConnectionManager {
    connections: Mutex<HashMap<String, Arc<Connection>>>,
    device_index: Mutex<HashMap<String, String>>,
    bus: Arc<EventBus>,
    counter: AtomicU64,
}

impl ConnectionManager {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            device_index: Mutex::new(HashMap::new()),
            bus,
            counter: AtomicU64::new(0),
        }
    }

    /// Accept a connection: allocate the id, register it, emit
    /// `connected`. Returns the connection and the receiver the
    /// socket writer drains.
    pub async fn accept(&self) -> (Arc<Connection>, mpsc::Receiver<String>) {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let connection_id = format!("conn_{}_{}", n, Utc::now().timestamp_millis());
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);

        let connection = Arc::new(Connection {
            connection_id: connection_id.clone(),
            identity: Mutex::new(None),
            connected_at: Utc::now(),
            last_heartbeat: Mutex::new(Instant::now()),
            is_authenticated: Mutex::new(false),
            outbound: tx,
        });
        self.connections
            .lock()
            .insert(connection_id.clone(), connection.clone());

        tracing::info!(connection_id = %connection_id, "new connection accepted");
        self.bus
            .emit(
                EventType::Connected,
                serde_json::json!({"connection_id": connection_id}),
            )
            .await;

        (connection, rx)
    }

    /// Bind a device identity after the `connect` handshake.
    pub fn bind_device(&self, connection: &Connection, identity: DeviceIdentity) {
        self.device_index
            .lock()
            .insert(identity.device_id.clone(), connection.connection_id.clone());
        connection.bind_identity(identity);
    }

    /// Remove a connection and emit `disconnected`.
    pub async fn disconnect(&self, connection_id: &str) {
        let removed = {
            let mut connections = self.connections.lock();
            connections.remove(connection_id)
        };
        let Some(connection) = removed else {
            return;
        };

        if let Some(identity) = connection.identity.lock().as_ref() {
            self.device_index.lock().remove(&identity.device_id);
        }

        tracing::info!(connection_id = %connection_id, "connection disconnected");
        self.bus
            .emit(
                EventType::Disconnected,
                serde_json::json!({"connection_id": connection_id}),
            )
            .await;
    }

    pub fn get(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.connections.lock().get(connection_id).cloned()
    }

    pub fn get_by_device(&self, device_id: &str) -> Option<Arc<Connection>> {
        let connection_id = self.device_index.lock().get(device_id).cloned()?;
        self.get(&connection_id)
    }

    pub fn active_count(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn heartbeat(&self, connection_id: &str) {
        if let Some(connection) = self.get(connection_id) {
            connection.touch();
        }
    }

    /// Broadcast an event frame to every connection.
    pub fn broadcast(&self, event: EventMessage) {
        let connections: Vec<Arc<Connection>> =
            self.connections.lock().values().cloned().collect();
        for connection in connections {
            connection.send_event(event.clone());
        }
    }

    pub fn connections_info(&self) -> Value {
        let connections = self.connections.lock();
        let map: serde_json::Map<String, Value> = connections
            .values()
            .map(|c| {
                let identity = c.identity.lock();
                (
                    c.connection_id.clone(),
                    serde_json::json!({
                        "connection_id": c.connection_id,
                        "device_id": identity.as_ref().map(|i| i.device_id.clone()),
                        "device_name": identity.as_ref().map(|i| i.device_name.clone()),
                        "connected_at": c.connected_at.to_rfc3339(),
                        "is_authenticated": *c.is_authenticated.lock(),
                    }),
                )
            })
            .collect();
        Value::Object(map)
    }

    /// Force-close connections idle past `timeout_seconds`.
    pub async fn cleanup_stale(&self, timeout_seconds: u64) {
        let stale: Vec<String> = {
            let connections = self.connections.lock();
            connections
                .values()
                .filter(|c| c.last_heartbeat.lock().elapsed().as_secs() > timeout_seconds)
                .map(|c| c.connection_id.clone())
                .collect()
        };
        for connection_id in stale {
            tracing::warn!(connection_id = %connection_id, "disconnecting stale connection");
            self.disconnect(&connection_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn accept_and_disconnect_emit_events() {
        let bus = Arc::new(EventBus::new());
        let manager = ConnectionManager::new(bus.clone());

        let (connection, _rx) = manager.accept().await;
        assert_eq!(manager.active_count(), 1);
        assert_eq!(bus.get_history(Some(EventType::Connected), 10).len(), 1);

        manager.disconnect(&connection.connection_id).await;
        assert_eq!(manager.active_count(), 0);
        assert_eq!(bus.get_history(Some(EventType::Disconnected), 10).len(), 1);
    }

    #[tokio::test]
    async fn device_index_follows_identity() {
        let bus = Arc::new(EventBus::new());
        let manager = ConnectionManager::new(bus);

        let (connection, _rx) = manager.accept().await;
        manager.bind_device(
            &connection,
            DeviceIdentity {
                device_id: "dev-1".into(),
                device_name: "laptop".into(),
                role: Default::default(),
                capabilities: vec![],
            },
        );

        assert!(manager.get_by_device("dev-1").is_some());
        manager.disconnect(&connection.connection_id).await;
        assert!(manager.get_by_device("dev-1").is_none());
    }

    #[tokio::test]
    async fn stale_connections_are_closed() {
        let bus = Arc::new(EventBus::new());
        let manager = ConnectionManager::new(bus.clone());

        let (connection, _rx) = manager.accept().await;
        // Zero-timeout sweep treats everything as stale.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        manager.cleanup_stale(0).await;

        assert_eq!(manager.active_count(), 0);
        assert!(manager.get(&connection.connection_id).is_none());
    }
}
