//! Gateway wire protocol: JSON messages over WebSocket.
//!
//! Three frame shapes, discriminated by `type`:
//!
//! Client → Server (request):
//!   { "type": "req", "id": "r1", "method": "health", "params": {...},
//!     "idempotency_key": "k1" }
//!
//! Server → Client (response):
//!   { "type": "res", "id": "r1", "ok": true, "payload": {...} }
//!   { "type": "res", "id": "r1", "ok": false, "error": "..." }
//!
//! Server → Client (event push):
//!   { "type": "event", "event": "heartbeat", "payload": {...}, "seq": 42 }

mod message;
mod method;
mod params;

pub use message::*;
pub use method::RequestMethod;
pub use params::*;
