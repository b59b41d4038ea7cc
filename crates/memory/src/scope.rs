//! User scoping for memory sessions.
//!
//! Every memory session node is owned by exactly one user. The
//! canonical session id is `"{user_id}::{session_id}"`; a legacy
//! unscoped id may still exist on disk and is accepted on lookup, but
//! a lookup never resolves to a session owned by another user.

use pv_domain::error::Result;

use crate::graph::GraphStore;

pub fn normalize_user_id(user_id: Option<&str>) -> String {
    let uid = user_id.unwrap_or("default_user").trim();
    if uid.is_empty() {
        "default_user".to_string()
    } else {
        uid.to_string()
    }
}

pub fn user_node_id(user_id: Option<&str>) -> String {
    let uid = normalize_user_id(user_id);
    if uid.starts_with("user_") {
        uid
    } else {
        format!("user_{uid}")
    }
}

/// The user-scoped logical session id for the memory graph.
pub fn scoped_session_id(session_id: &str, user_id: Option<&str>) -> String {
    format!("{}::{}", normalize_user_id(user_id), session_id)
}

pub fn session_node_id(session_id: &str, user_id: Option<&str>) -> String {
    format!("session_{}", scoped_session_id(session_id, user_id))
}

/// Resolve the session id owned by this user: the scoped id first,
/// then the legacy raw id. Returns the logical id without the
/// `session_` prefix, or `None` when the user owns neither.
pub async fn resolve_owned_session_id(
    store: &dyn GraphStore,
    session_id: &str,
    user_id: Option<&str>,
) -> Result<Option<String>> {
    let uid = user_node_id(user_id);
    let scoped = scoped_session_id(session_id, user_id);
    let candidates = vec![format!("session_{scoped}"), format!("session_{session_id}")];

    let owned = store.owned_session_id(&uid, &candidates).await?;
    Ok(owned.map(|id| {
        id.strip_prefix("session_")
            .map(str::to_string)
            .unwrap_or(id)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scoped_ids_compose() {
        assert_eq!(scoped_session_id("s1", Some("alice")), "alice::s1");
        assert_eq!(scoped_session_id("s1", None), "default_user::s1");
        assert_eq!(session_node_id("s1", Some("alice")), "session_alice::s1");
    }

    #[test]
    fn user_node_id_is_idempotent() {
        assert_eq!(user_node_id(Some("alice")), "user_alice");
        assert_eq!(user_node_id(Some("user_alice")), "user_alice");
        assert_eq!(user_node_id(None), "user_default_user");
    }
}
