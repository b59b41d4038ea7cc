//! In-process typed event bus — the integration spine between the
//! gateway services.
//!
//! Services register async handlers per event type; `emit` assigns a
//! monotonic sequence number, appends the event to a bounded history
//! ring, and runs all handlers concurrently. A failing handler never
//! affects its siblings or the emitter.

mod bus;
mod types;

pub use bus::{EventBus, EventRecord, HandlerFuture};
pub use types::EventType;
