//! The event bus proper: listener registry, bounded history ring,
//! concurrent dispatch.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::types::EventType;

/// History ring capacity: oldest events are evicted past this.
const MAX_HISTORY: usize = 1000;

/// Capacity of the broadcast tap used by connection forwarding.
const SINK_CAPACITY: usize = 256;

pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

type Handler = Arc<dyn Fn(EventRecord) -> HandlerFuture + Send + Sync>;

/// One emitted event, as seen by handlers and the history ring.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub event: EventType,
    pub payload: Value,
    /// Monotonic per-process sequence number.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
}

struct Registry {
    listeners: HashMap<EventType, Vec<(String, Handler)>>,
    seq: u64,
    history: VecDeque<EventRecord>,
}

/// Async event emitter with a listener registry and bounded history.
pub struct EventBus {
    registry: Mutex<Registry>,
    sink: broadcast::Sender<EventRecord>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sink, _) = broadcast::channel(SINK_CAPACITY);
        Self {
            registry: Mutex::new(Registry {
                listeners: HashMap::new(),
                seq: 0,
                history: VecDeque::with_capacity(MAX_HISTORY),
            }),
            sink,
        }
    }

    /// Register a handler under a stable id. Registering the same id
    /// for the same event again is a no-op.
    pub fn on<F, Fut>(&self, event: EventType, id: impl Into<String>, handler: F)
    where
        F: Fn(EventRecord) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = id.into();
        let mut registry = self.registry.lock();
        let entries = registry.listeners.entry(event).or_default();
        if entries.iter().any(|(existing, _)| *existing == id) {
            return;
        }
        tracing::debug!(event = %event, handler = %id, "registered event handler");
        entries.push((
            id,
            Arc::new(move |record| Box::pin(handler(record)) as HandlerFuture),
        ));
    }

    /// Unregister a handler by id.
    pub fn off(&self, event: EventType, id: &str) {
        let mut registry = self.registry.lock();
        if let Some(entries) = registry.listeners.get_mut(&event) {
            entries.retain(|(existing, _)| existing != id);
        }
    }

    /// Register a handler that unregisters itself after the first
    /// invocation.
    pub fn once<F, Fut>(self: &Arc<Self>, event: EventType, id: impl Into<String>, handler: F)
    where
        F: Fn(EventRecord) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = id.into();
        let bus = Arc::downgrade(self);
        let own_id = id.clone();
        let handler = Arc::new(handler);
        self.on(event, id, move |record| {
            let bus = bus.clone();
            let own_id = own_id.clone();
            let handler = handler.clone();
            async move {
                handler(record).await;
                if let Some(bus) = bus.upgrade() {
                    bus.off(event, &own_id);
                }
            }
        });
    }

    /// Emit an event: assign the sequence number, record history, run
    /// every handler concurrently. Handler panics are isolated per
    /// handler task and never reach the emitter.
    pub async fn emit(&self, event: EventType, payload: Value) {
        let (record, handlers) = {
            let mut registry = self.registry.lock();
            registry.seq += 1;
            let record = EventRecord {
                event,
                payload,
                seq: registry.seq,
                timestamp: Utc::now(),
            };
            registry.history.push_back(record.clone());
            if registry.history.len() > MAX_HISTORY {
                registry.history.pop_front();
            }
            let handlers: Vec<Handler> = registry
                .listeners
                .get(&event)
                .map(|entries| entries.iter().map(|(_, h)| h.clone()).collect())
                .unwrap_or_default();
            (record, handlers)
        };

        let _ = self.sink.send(record.clone());

        if handlers.is_empty() {
            return;
        }

        let tasks: Vec<_> = handlers
            .into_iter()
            .map(|handler| {
                let record = record.clone();
                tokio::spawn(async move { handler(record).await })
            })
            .collect();

        for (idx, result) in futures_util::future::join_all(tasks).await.into_iter().enumerate() {
            if let Err(e) = result {
                tracing::error!(event = %event, handler_index = idx, error = %e, "event handler failed");
            }
        }
    }

    /// Most recent events, optionally filtered by type.
    pub fn get_history(&self, event: Option<EventType>, limit: usize) -> Vec<EventRecord> {
        let registry = self.registry.lock();
        let iter = registry.history.iter().filter(|r| match event {
            Some(wanted) => r.event == wanted,
            None => true,
        });
        let matching: Vec<_> = iter.cloned().collect();
        let skip = matching.len().saturating_sub(limit);
        matching.into_iter().skip(skip).collect()
    }

    /// Tap every emitted event (used to forward events to connected
    /// clients). Lagging receivers drop oldest events.
    pub fn subscribe_sink(&self) -> broadcast::Receiver<EventRecord> {
        self.sink.subscribe()
    }

    /// Drop listeners for one event, or all of them.
    pub fn clear_handlers(&self, event: Option<EventType>) {
        let mut registry = self.registry.lock();
        match event {
            Some(event) => {
                registry.listeners.remove(&event);
            }
            None => registry.listeners.clear(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn count_handler(counter: Arc<AtomicUsize>) -> impl Fn(EventRecord) -> HandlerFuture {
        move |_record| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        }
    }

    #[tokio::test]
    async fn emit_reaches_all_handlers() {
        let bus = EventBus::new();
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        bus.on(EventType::Heartbeat, "a", count_handler(a.clone()));
        bus.on(EventType::Heartbeat, "b", count_handler(b.clone()));

        bus.emit(EventType::Heartbeat, serde_json::json!({})).await;

        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn duplicate_registration_is_noop() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        bus.on(EventType::Heartbeat, "dup", count_handler(counter.clone()));
        bus.on(EventType::Heartbeat, "dup", count_handler(counter.clone()));

        bus.emit(EventType::Heartbeat, serde_json::json!({})).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_handler_does_not_stop_siblings() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        bus.on(EventType::Heartbeat, "boom", |_record| async {
            panic!("handler blew up");
        });
        bus.on(EventType::Heartbeat, "ok", count_handler(counter.clone()));

        bus.emit(EventType::Heartbeat, serde_json::json!({})).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn once_fires_exactly_once() {
        let bus = Arc::new(EventBus::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let inner = counter.clone();
        bus.once(EventType::Connected, "one-shot", move |_record| {
            let inner = inner.clone();
            async move {
                inner.fetch_add(1, Ordering::SeqCst);
            }
        });

        bus.emit(EventType::Connected, serde_json::json!({})).await;
        bus.emit(EventType::Connected, serde_json::json!({})).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn seq_is_monotonic_and_history_bounded() {
        let bus = EventBus::new();
        for _ in 0..(MAX_HISTORY + 50) {
            bus.emit(EventType::Heartbeat, serde_json::json!({})).await;
        }
        let history = bus.get_history(None, MAX_HISTORY + 100);
        assert_eq!(history.len(), MAX_HISTORY);
        // Oldest 50 evicted: the first surviving seq is 51.
        assert_eq!(history.first().unwrap().seq, 51);
        assert_eq!(history.last().unwrap().seq, (MAX_HISTORY + 50) as u64);
        for pair in history.windows(2) {
            assert!(pair[0].seq < pair[1].seq);
        }
    }

    #[tokio::test]
    async fn history_filters_by_type_and_limit() {
        let bus = EventBus::new();
        bus.emit(EventType::Connected, serde_json::json!({"n": 1})).await;
        bus.emit(EventType::Heartbeat, serde_json::json!({})).await;
        bus.emit(EventType::Connected, serde_json::json!({"n": 2})).await;

        let connected = bus.get_history(Some(EventType::Connected), 10);
        assert_eq!(connected.len(), 2);

        let limited = bus.get_history(Some(EventType::Connected), 1);
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].payload["n"], 2);
    }

    #[tokio::test]
    async fn last_event_of_type_matches_emitted_payload() {
        let bus = EventBus::new();
        let payload = serde_json::json!({"session_id": "s1", "user_id": "u1"});
        bus.emit(EventType::ConversationComplete, payload.clone()).await;

        let last = bus
            .get_history(Some(EventType::ConversationComplete), 1)
            .pop()
            .unwrap();
        assert_eq!(last.payload, payload);
    }
}
