use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize};

use pv_domain::chat::Role;
use pv_domain::tool::PendingConfirmation;

pub const DEFAULT_USER: &str = "default_user";

/// Timestamps below this are legacy monotonic-clock values written by
/// older builds; they are rewritten to current wall-clock on load.
const EPOCH_SANITY_FLOOR: f64 = 1_000_000_000.0;

/// How many completed turn ids each session remembers.
const MAX_COMPLETED_TURNS: usize = 1000;

pub fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

pub fn normalize_user_id(user_id: Option<&str>) -> String {
    let uid = user_id.unwrap_or(DEFAULT_USER).trim();
    if uid.is_empty() {
        DEFAULT_USER.to_string()
    } else {
        uid.to_string()
    }
}

/// Session title from the first user message: single line, 40 chars.
pub fn generate_session_title(text: &str) -> String {
    let one_line = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if one_line.is_empty() {
        return "New Chat".to_string();
    }
    let truncated: String = one_line.chars().take(40).collect();
    if one_line.chars().count() > 40 {
        format!("{truncated}...")
    } else {
        truncated
    }
}

fn de_epoch_seconds<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<f64>::deserialize(deserializer)?.unwrap_or_else(now_epoch);
    if raw < EPOCH_SANITY_FLOOR {
        Ok(now_epoch())
    } else {
        Ok(raw)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

/// A turn recorded by `begin_turn` but not yet committed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingTurn {
    pub user_role: Role,
    pub user_content: String,
    pub user_id: String,
    pub started_at: f64,
}

/// One conversation, scoped to a `(user_id, session_id)` pair.
///
/// Timestamps are Unix epoch seconds so a frontend can render them
/// via `new Date(ts * 1000)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    #[serde(default = "now_epoch", deserialize_with = "de_epoch_seconds")]
    pub created_at: f64,
    #[serde(default = "now_epoch", deserialize_with = "de_epoch_seconds")]
    pub last_activity: f64,
    #[serde(default = "d_title")]
    pub title: String,
    #[serde(default = "d_agent_type")]
    pub agent_type: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_confirmation: Option<PendingConfirmation>,
    #[serde(default)]
    pub pending_turns: HashMap<String, PendingTurn>,
    #[serde(default)]
    pub completed_turn_ids: Vec<String>,
}

fn d_title() -> String {
    "New Chat".into()
}

fn d_agent_type() -> String {
    "default".into()
}

impl Default for Session {
    fn default() -> Self {
        let now = now_epoch();
        Self {
            created_at: now,
            last_activity: now,
            title: d_title(),
            agent_type: d_agent_type(),
            messages: Vec::new(),
            pending_confirmation: None,
            pending_turns: HashMap::new(),
            completed_turn_ids: Vec::new(),
        }
    }
}

impl Session {
    pub fn touch(&mut self) {
        self.last_activity = now_epoch();
    }

    /// Append a message and enforce the history bound.
    pub fn push_message(&mut self, role: Role, content: String, max_messages: usize) {
        self.messages.push(Message { role, content });
        if self.messages.len() > max_messages {
            let excess = self.messages.len() - max_messages;
            self.messages.drain(..excess);
        }
    }

    pub fn record_completed_turn(&mut self, turn_id: String) {
        self.completed_turn_ids.push(turn_id);
        if self.completed_turn_ids.len() > MAX_COMPLETED_TURNS {
            let excess = self.completed_turn_ids.len() - MAX_COMPLETED_TURNS;
            self.completed_turn_ids.drain(..excess);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_is_single_line_and_bounded() {
        assert_eq!(generate_session_title(""), "New Chat");
        assert_eq!(generate_session_title("  hello\n world "), "hello world");

        let long = "x".repeat(60);
        let title = generate_session_title(&long);
        assert_eq!(title.chars().count(), 43);
        assert!(title.ends_with("..."));
    }

    #[test]
    fn legacy_monotonic_timestamps_rewritten_on_load() {
        let raw = r#"{"created_at": 12345.0, "last_activity": 98.5}"#;
        let session: Session = serde_json::from_str(raw).unwrap();
        assert!(session.created_at >= EPOCH_SANITY_FLOOR);
        assert!(session.last_activity >= EPOCH_SANITY_FLOOR);
    }

    #[test]
    fn sane_timestamps_survive_load() {
        let raw = r#"{"created_at": 1700000000.0, "last_activity": 1700000001.0}"#;
        let session: Session = serde_json::from_str(raw).unwrap();
        assert_eq!(session.created_at, 1_700_000_000.0);
        assert_eq!(session.last_activity, 1_700_000_001.0);
    }

    #[test]
    fn history_bound_drops_oldest() {
        let mut session = Session::default();
        for i in 0..10 {
            session.push_message(Role::User, format!("m{i}"), 4);
        }
        assert_eq!(session.messages.len(), 4);
        assert_eq!(session.messages[0].content, "m6");
    }

    #[test]
    fn user_id_normalization() {
        assert_eq!(normalize_user_id(None), "default_user");
        assert_eq!(normalize_user_id(Some("  ")), "default_user");
        assert_eq!(normalize_user_id(Some(" alice ")), "alice");
    }
}
