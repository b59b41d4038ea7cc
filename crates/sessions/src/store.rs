//! Disk-backed session store with atomic turn commit semantics.
//!
//! The whole session map is serialized to `sessions.json` on every
//! mutation: write to a temp file in the same directory, fsync,
//! rename. Sessions are keyed `"{user_id}::{session_id}"`; legacy
//! unscoped keys are accepted on read and treated as belonging to
//! `default_user`.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use pv_domain::chat::Role;
use pv_domain::error::Result;
use pv_domain::tool::PendingConfirmation;

use crate::session::{
    generate_session_title, normalize_user_id, now_epoch, Message, PendingTurn, Session,
    DEFAULT_USER,
};

const SESSION_KEY_SEP: &str = "::";

/// Hook for the fire-and-forget memory sync. The implementation is
/// expected to spawn its own background work and never block.
pub trait MemorySync: Send + Sync {
    fn on_message(&self, session_id: &str, role: Role, content: &str, user_id: &str);
}

/// Summary info for one session, as served by `sessions.list` and
/// `session.detail`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub user_id: String,
    pub created_at: f64,
    pub last_activity: f64,
    pub title: String,
    pub message_count: usize,
    pub conversation_rounds: usize,
    pub agent_type: String,
    pub max_history_rounds: usize,
    pub last_message: String,
}

/// Per-user-scoped session storage with atomic turn commits.
pub struct SessionStore {
    path: PathBuf,
    sessions: RwLock<HashMap<String, Session>>,
    max_history_rounds: usize,
    memory_sync: RwLock<Option<Arc<dyn MemorySync>>>,
}

impl SessionStore {
    /// Load or create the store at `state_dir/sessions.json`.
    pub fn new(state_dir: &Path, max_history_rounds: usize) -> Result<Self> {
        std::fs::create_dir_all(state_dir)?;
        let path = state_dir.join("sessions.json");

        let sessions: HashMap<String, Session> = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "sessions.json unreadable, starting empty");
                HashMap::new()
            })
        } else {
            HashMap::new()
        };

        tracing::info!(
            sessions = sessions.len(),
            path = %path.display(),
            "session store loaded"
        );

        Ok(Self {
            path,
            sessions: RwLock::new(sessions),
            max_history_rounds: max_history_rounds.max(1),
            memory_sync: RwLock::new(None),
        })
    }

    /// Wire the memory sync hook after construction (the memory
    /// service is built later in the dependency order).
    pub fn set_memory_sync(&self, sync: Arc<dyn MemorySync>) {
        *self.memory_sync.write() = Some(sync);
    }

    fn max_messages(&self) -> usize {
        self.max_history_rounds * 2
    }

    fn make_key(session_id: &str, user_id: &str) -> String {
        format!("{}{}{}", normalize_user_id(Some(user_id)), SESSION_KEY_SEP, session_id)
    }

    fn split_key(key: &str) -> (Option<&str>, &str) {
        match key.split_once(SESSION_KEY_SEP) {
            Some((user_id, session_id)) => (Some(user_id), session_id),
            None => (None, key),
        }
    }

    /// Resolve the in-map key for a `(session_id, user_id)` pair,
    /// honoring legacy unscoped keys for `default_user`.
    fn resolve_key(
        sessions: &HashMap<String, Session>,
        session_id: &str,
        user_id: &str,
    ) -> Option<String> {
        let key = Self::make_key(session_id, user_id);
        if sessions.contains_key(&key) {
            return Some(key);
        }
        if normalize_user_id(Some(user_id)) == DEFAULT_USER && sessions.contains_key(session_id) {
            return Some(session_id.to_string());
        }
        None
    }

    fn persist(&self, sessions: &HashMap<String, Session>) {
        if let Err(e) = self.write_atomic(sessions) {
            tracing::error!(error = %e, path = %self.path.display(), "failed to persist sessions");
        }
    }

    fn write_atomic(&self, sessions: &HashMap<String, Session>) -> Result<()> {
        let json = serde_json::to_vec_pretty(sessions)?;
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn sync_to_memory(&self, session_id: &str, role: Role, content: &str, user_id: &str) {
        if let Some(sync) = self.memory_sync.read().as_ref() {
            sync.on_message(session_id, role, content, user_id);
        }
    }

    // ── Session lifecycle ─────────────────────────────────────────

    /// Create a session; generates an id when none is supplied.
    pub fn create_session(&self, session_id: Option<&str>, user_id: &str) -> String {
        let session_id = session_id
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let key = Self::make_key(&session_id, user_id);

        let mut sessions = self.sessions.write();
        sessions.insert(key, Session::default());
        tracing::info!(session_id = %session_id, user_id = %user_id, "created session");
        self.persist(&sessions);
        session_id
    }

    pub fn session_exists(&self, session_id: &str, user_id: &str) -> bool {
        let sessions = self.sessions.read();
        Self::resolve_key(&sessions, session_id, user_id).is_some()
    }

    /// Full session content (excluding pending confirmation state).
    pub fn get_session(&self, session_id: &str, user_id: &str) -> Option<serde_json::Value> {
        let sessions = self.sessions.read();
        let key = Self::resolve_key(&sessions, session_id, user_id)?;
        let session = sessions.get(&key)?;
        Some(serde_json::json!({
            "created_at": session.created_at,
            "last_activity": session.last_activity,
            "title": session.title,
            "agent_type": session.agent_type,
            "messages": session.messages,
        }))
    }

    pub fn get_session_info(&self, session_id: &str, user_id: &str) -> Option<SessionInfo> {
        let sessions = self.sessions.read();
        let key = Self::resolve_key(&sessions, session_id, user_id)?;
        let session = sessions.get(&key)?;
        let (owner, raw_id) = Self::split_key(&key);
        let last_message = session
            .messages
            .last()
            .map(|m| {
                let preview: String = m.content.chars().take(100).collect();
                if m.content.chars().count() > 100 {
                    format!("{preview}...")
                } else {
                    preview
                }
            })
            .unwrap_or_default();
        Some(SessionInfo {
            session_id: raw_id.to_string(),
            user_id: owner.unwrap_or(DEFAULT_USER).to_string(),
            created_at: session.created_at,
            last_activity: session.last_activity,
            title: session.title.clone(),
            message_count: session.messages.len(),
            conversation_rounds: session.messages.len() / 2,
            agent_type: session.agent_type.clone(),
            max_history_rounds: self.max_history_rounds,
            last_message,
        })
    }

    /// All sessions, optionally restricted to one user, most recent
    /// first.
    pub fn list_sessions(&self, user_id: Option<&str>) -> Vec<SessionInfo> {
        let keys: Vec<String> = {
            let sessions = self.sessions.read();
            sessions
                .keys()
                .filter(|key| match user_id {
                    Some(uid) => {
                        let (owner, _) = Self::split_key(key);
                        owner.unwrap_or(DEFAULT_USER) == normalize_user_id(Some(uid))
                    }
                    None => true,
                })
                .cloned()
                .collect()
        };

        let mut infos: Vec<SessionInfo> = keys
            .iter()
            .filter_map(|key| {
                let (owner, raw_id) = Self::split_key(key);
                self.get_session_info(raw_id, owner.unwrap_or(DEFAULT_USER))
            })
            .collect();
        infos.sort_by(|a, b| {
            b.last_activity
                .partial_cmp(&a.last_activity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        infos
    }

    pub fn delete_session(&self, session_id: &str, user_id: &str) -> bool {
        let mut sessions = self.sessions.write();
        let Some(key) = Self::resolve_key(&sessions, session_id, user_id) else {
            return false;
        };
        sessions.remove(&key);
        tracing::info!(session_id = %session_id, "deleted session");
        self.persist(&sessions);
        true
    }

    pub fn clear_all(&self) -> usize {
        let mut sessions = self.sessions.write();
        let count = sessions.len();
        sessions.clear();
        self.persist(&sessions);
        count
    }

    /// Remove sessions idle longer than `max_age_hours`. Zero
    /// disables the sweep.
    pub fn cleanup_old_sessions(&self, max_age_hours: u64) -> usize {
        if max_age_hours == 0 {
            return 0;
        }
        let cutoff = now_epoch() - (max_age_hours as f64) * 3600.0;
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, s| s.last_activity >= cutoff);
        let removed = before - sessions.len();
        if removed > 0 {
            tracing::info!(removed, "expired sessions removed");
            self.persist(&sessions);
        }
        removed
    }

    // ── Messages ──────────────────────────────────────────────────

    pub fn add_message(
        &self,
        session_id: &str,
        role: Role,
        content: &str,
        user_id: &str,
        sync_memory: bool,
    ) -> bool {
        let max_messages = self.max_messages();
        {
            let mut sessions = self.sessions.write();
            let Some(key) = Self::resolve_key(&sessions, session_id, user_id) else {
                tracing::warn!(session_id = %session_id, "session not found");
                return false;
            };
            let session = sessions.get_mut(&key).expect("resolved key present");
            session.push_message(role, content.to_string(), max_messages);
            session.touch();
            self.persist(&sessions);
        }
        if sync_memory {
            self.sync_to_memory(session_id, role, content, user_id);
        }
        true
    }

    pub fn get_messages(&self, session_id: &str, user_id: &str) -> Vec<Message> {
        let sessions = self.sessions.read();
        Self::resolve_key(&sessions, session_id, user_id)
            .and_then(|key| sessions.get(&key))
            .map(|s| s.messages.clone())
            .unwrap_or_default()
    }

    /// Last `count` messages (defaults to the full history window).
    pub fn get_recent_messages(
        &self,
        session_id: &str,
        count: Option<usize>,
        user_id: &str,
    ) -> Vec<Message> {
        let count = count.unwrap_or_else(|| self.max_messages());
        let messages = self.get_messages(session_id, user_id);
        let skip = messages.len().saturating_sub(count);
        messages.into_iter().skip(skip).collect()
    }

    // ── Turns ─────────────────────────────────────────────────────

    /// Record a pending turn without touching the message list.
    ///
    /// Idempotent: re-beginning an already-completed turn returns
    /// true; re-beginning a pending turn returns true only when the
    /// payload matches exactly.
    pub fn begin_turn(
        &self,
        session_id: &str,
        turn_id: &str,
        user_role: Role,
        user_content: &str,
        user_id: &str,
    ) -> bool {
        if turn_id.is_empty() {
            tracing::warn!("begin_turn missing turn_id");
            return false;
        }
        let mut sessions = self.sessions.write();
        let Some(key) = Self::resolve_key(&sessions, session_id, user_id) else {
            tracing::warn!(session_id = %session_id, "session not found");
            return false;
        };
        let session = sessions.get_mut(&key).expect("resolved key present");

        if session.completed_turn_ids.iter().any(|t| t == turn_id) {
            return true;
        }
        if let Some(existing) = session.pending_turns.get(turn_id) {
            return existing.user_role == user_role
                && existing.user_content == user_content
                && existing.user_id == user_id;
        }

        session.pending_turns.insert(
            turn_id.to_string(),
            PendingTurn {
                user_role,
                user_content: user_content.to_string(),
                user_id: user_id.to_string(),
                started_at: now_epoch(),
            },
        );
        if session.messages.is_empty() && (session.title.is_empty() || session.title == "New Chat")
        {
            session.title = generate_session_title(user_content);
        }
        session.touch();
        self.persist(&sessions);
        true
    }

    /// Commit a turn: append the user and assistant messages in one
    /// persistence write, exactly once per `(session_id, turn_id)`.
    pub fn commit_turn(
        &self,
        session_id: &str,
        turn_id: &str,
        assistant_content: &str,
        user_id: &str,
    ) -> bool {
        if turn_id.is_empty() {
            tracing::warn!("commit_turn missing turn_id");
            return false;
        }
        let max_messages = self.max_messages();
        let turn = {
            let mut sessions = self.sessions.write();
            let Some(key) = Self::resolve_key(&sessions, session_id, user_id) else {
                tracing::warn!(session_id = %session_id, "session not found");
                return false;
            };
            let session = sessions.get_mut(&key).expect("resolved key present");

            if session.completed_turn_ids.iter().any(|t| t == turn_id) {
                return true;
            }
            let Some(turn) = session.pending_turns.remove(turn_id) else {
                tracing::warn!(
                    session_id = %session_id,
                    turn_id = %turn_id,
                    "commit_turn pending turn not found"
                );
                return false;
            };

            session.push_message(turn.user_role, turn.user_content.clone(), max_messages);
            session.push_message(Role::Assistant, assistant_content.to_string(), max_messages);
            session.record_completed_turn(turn_id.to_string());
            session.touch();
            self.persist(&sessions);
            turn
        };

        // Keep the memory graph consistent with the turn-based write
        // path (fire-and-forget through the sync hook).
        self.sync_to_memory(session_id, turn.user_role, &turn.user_content, user_id);
        self.sync_to_memory(session_id, Role::Assistant, assistant_content, user_id);
        true
    }

    /// Discard a pending turn without committing anything.
    pub fn abort_turn(&self, session_id: &str, turn_id: &str, user_id: &str) -> bool {
        let mut sessions = self.sessions.write();
        let Some(key) = Self::resolve_key(&sessions, session_id, user_id) else {
            return false;
        };
        let session = sessions.get_mut(&key).expect("resolved key present");
        if session.pending_turns.remove(turn_id).is_some() {
            session.touch();
            self.persist(&sessions);
            true
        } else {
            false
        }
    }

    // ── Tool confirmation state ───────────────────────────────────

    pub fn set_pending_confirmation(
        &self,
        session_id: &str,
        confirmation: PendingConfirmation,
        user_id: &str,
    ) -> bool {
        let mut sessions = self.sessions.write();
        let Some(key) = Self::resolve_key(&sessions, session_id, user_id) else {
            return false;
        };
        let session = sessions.get_mut(&key).expect("resolved key present");
        session.pending_confirmation = Some(confirmation);
        self.persist(&sessions);
        true
    }

    pub fn get_pending_confirmation(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Option<PendingConfirmation> {
        let sessions = self.sessions.read();
        let key = Self::resolve_key(&sessions, session_id, user_id)?;
        sessions.get(&key)?.pending_confirmation.clone()
    }

    pub fn clear_pending_confirmation(&self, session_id: &str, user_id: &str) {
        let mut sessions = self.sessions.write();
        let Some(key) = Self::resolve_key(&sessions, session_id, user_id) else {
            return;
        };
        let session = sessions.get_mut(&key).expect("resolved key present");
        session.pending_confirmation = None;
        self.persist(&sessions);
    }

    // ── Agent type ────────────────────────────────────────────────

    pub fn set_agent_type(&self, session_id: &str, agent_type: &str, user_id: &str) -> bool {
        let mut sessions = self.sessions.write();
        let Some(key) = Self::resolve_key(&sessions, session_id, user_id) else {
            return false;
        };
        let session = sessions.get_mut(&key).expect("resolved key present");
        session.agent_type = agent_type.to_string();
        true
    }

    pub fn get_agent_type(&self, session_id: &str, user_id: &str) -> Option<String> {
        let sessions = self.sessions.read();
        let key = Self::resolve_key(&sessions, session_id, user_id)?;
        sessions.get(&key).map(|s| s.agent_type.clone())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, SessionStore) {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path(), 10).unwrap();
        (dir, store)
    }

    #[test]
    fn duplicate_commit_is_idempotent() {
        let (_dir, store) = store();
        store.create_session(Some("s1"), "u1");

        assert!(store.begin_turn("s1", "t1", Role::User, "hello", "u1"));
        assert!(store.commit_turn("s1", "t1", "world", "u1"));
        assert!(store.commit_turn("s1", "t1", "world", "u1"));

        let messages = store.get_messages("s1", "u1");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].content, "hello");
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].content, "world");
    }

    #[test]
    fn commit_without_begin_fails() {
        let (_dir, store) = store();
        store.create_session(Some("s1"), "u1");
        assert!(!store.commit_turn("s1", "t-none", "x", "u1"));
        assert!(store.get_messages("s1", "u1").is_empty());
    }

    #[test]
    fn abort_then_commit_fails() {
        let (_dir, store) = store();
        store.create_session(Some("s1"), "u1");
        assert!(store.begin_turn("s1", "t1", Role::User, "hello", "u1"));
        assert!(store.abort_turn("s1", "t1", "u1"));
        assert!(!store.commit_turn("s1", "t1", "x", "u1"));
        assert!(store.get_messages("s1", "u1").is_empty());
    }

    #[test]
    fn begin_turn_idempotent_only_for_identical_payload() {
        let (_dir, store) = store();
        store.create_session(Some("s1"), "u1");
        assert!(store.begin_turn("s1", "t1", Role::User, "hello", "u1"));
        assert!(store.begin_turn("s1", "t1", Role::User, "hello", "u1"));
        assert!(!store.begin_turn("s1", "t1", Role::User, "different", "u1"));
    }

    #[test]
    fn create_delete_get_round_trip() {
        let (_dir, store) = store();
        store.create_session(Some("s1"), "u1");
        assert!(store.get_session("s1", "u1").is_some());
        assert!(store.delete_session("s1", "u1"));
        assert!(store.get_session("s1", "u1").is_none());
    }

    #[test]
    fn sessions_are_user_scoped() {
        let (_dir, store) = store();
        store.create_session(Some("s1"), "alice");
        assert!(store.get_session("s1", "alice").is_some());
        assert!(store.get_session("s1", "bob").is_none());
        assert!(!store.delete_session("s1", "bob"));
    }

    #[test]
    fn legacy_unscoped_keys_belong_to_default_user() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sessions.json");
        std::fs::write(
            &path,
            r#"{"old-session": {"created_at": 1700000000.0, "last_activity": 1700000000.0,
                "messages": [{"role": "user", "content": "hi"}]}}"#,
        )
        .unwrap();
        let store = SessionStore::new(dir.path(), 10).unwrap();

        assert!(store.get_session("old-session", "default_user").is_some());
        assert!(store.get_session("old-session", "alice").is_none());
    }

    #[test]
    fn title_set_from_first_user_message() {
        let (_dir, store) = store();
        store.create_session(Some("s1"), "u1");
        store.begin_turn("s1", "t1", Role::User, "plan my trip to Lisbon", "u1");
        let info = store.get_session_info("s1", "u1").unwrap();
        assert_eq!(info.title, "plan my trip to Lisbon");
    }

    #[test]
    fn history_bounded_to_two_times_rounds() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path(), 2).unwrap();
        store.create_session(Some("s1"), "u1");
        for i in 0..6 {
            store.add_message("s1", Role::User, &format!("m{i}"), "u1", false);
        }
        assert_eq!(store.get_messages("s1", "u1").len(), 4);
    }

    #[test]
    fn persistence_survives_reload() {
        let dir = TempDir::new().unwrap();
        {
            let store = SessionStore::new(dir.path(), 10).unwrap();
            store.create_session(Some("s1"), "u1");
            store.begin_turn("s1", "t1", Role::User, "hello", "u1");
            store.commit_turn("s1", "t1", "world", "u1");
        }
        let store = SessionStore::new(dir.path(), 10).unwrap();
        assert_eq!(store.get_messages("s1", "u1").len(), 2);
        // Completed turn ids survive, so the commit stays idempotent.
        assert!(store.commit_turn("s1", "t1", "world", "u1"));
        assert_eq!(store.get_messages("s1", "u1").len(), 2);
    }

    #[test]
    fn cleanup_disabled_when_zero() {
        let (_dir, store) = store();
        store.create_session(Some("s1"), "u1");
        assert_eq!(store.cleanup_old_sessions(0), 0);
        assert!(store.get_session("s1", "u1").is_some());
    }

    #[test]
    fn pending_confirmation_lifecycle() {
        let (_dir, store) = store();
        store.create_session(Some("s1"), "u1");
        let pending = PendingConfirmation {
            tool_call_id: "call_1".into(),
            tool_name: "write_file".into(),
            args: serde_json::json!({}),
            current_messages: vec![],
            pending_tool_calls: vec![],
            content: String::new(),
            approved_call_ids: vec![],
        };
        assert!(store.set_pending_confirmation("s1", pending, "u1"));
        assert!(store.get_pending_confirmation("s1", "u1").is_some());
        store.clear_pending_confirmation("s1", "u1");
        assert!(store.get_pending_confirmation("s1", "u1").is_none());
    }
}
