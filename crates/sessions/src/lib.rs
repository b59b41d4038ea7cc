//! Session and turn management.
//!
//! Sessions are keyed `"{user_id}::{session_id}"` and persisted as
//! one JSON document written atomically on every mutation. A turn is
//! one user input paired with one assistant output, committed
//! atomically and idempotently per `turn_id`.

mod session;
mod store;

pub use session::{
    generate_session_title, normalize_user_id, Message, PendingTurn, Session, DEFAULT_USER,
};
pub use store::{MemorySync, SessionInfo, SessionStore};
