//! Configuration service: system defaults, per-user overlays, and
//! change events.
//!
//! Layout:
//! - `config/default.json` — system config (missing file = defaults)
//! - `config/users/<user>.json` — per-user overlays (secrets refused)
//!
//! Reads merge default ← user with a deep merge; every read surface
//! gets secrets redacted. Changes emit `config.changed`
//! `{user_id, changes}`; a reload emits `config.reloaded`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use pv_domain::config::{redact_secrets, Config, ConfigIssue, ProcessingConfig};
use pv_domain::error::{Error, Result};
use pv_events::{EventBus, EventType};

pub struct ConfigService {
    config_dir: PathBuf,
    default: RwLock<Config>,
    /// Merged config documents per user id.
    user_cache: RwLock<HashMap<String, Value>>,
    bus: Arc<EventBus>,
}

impl ConfigService {
    /// Create the service rooted at `config_dir` (usually
    /// `<state_dir>/config`) with `initial` as the system config. A
    /// `default.json` on disk replaces it on [`reload`].
    pub fn new(config_dir: PathBuf, initial: Config, bus: Arc<EventBus>) -> Result<Self> {
        std::fs::create_dir_all(config_dir.join("users"))?;
        Ok(Self {
            config_dir,
            default: RwLock::new(initial),
            user_cache: RwLock::new(HashMap::new()),
            bus,
        })
    }

    fn load_default(config_dir: &std::path::Path) -> Result<Option<Config>> {
        let path = config_dir.join("default.json");
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no default.json on disk");
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)?;
        let config: Config =
            serde_json::from_str(&raw).map_err(|e| Error::Config(format!("default.json: {e}")))?;
        tracing::info!(path = %path.display(), "default config loaded");
        Ok(Some(config))
    }

    fn user_path(&self, user_id: &str) -> PathBuf {
        // User ids come from auth; keep the filename safe regardless.
        let safe: String = user_id
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.config_dir.join("users").join(format!("{safe}.json"))
    }

    // ── Reads ─────────────────────────────────────────────────────

    pub fn default_config(&self) -> Config {
        self.default.read().clone()
    }

    fn user_overlay(&self, user_id: &str) -> Value {
        let path = self.user_path(user_id);
        if !path.exists() {
            return Value::Object(Default::default());
        }
        std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_else(|| Value::Object(Default::default()))
    }

    /// Merged document for a user (default ← user overlay).
    pub fn merged(&self, user_id: Option<&str>) -> Value {
        let default_doc = serde_json::to_value(&*self.default.read()).unwrap_or_default();
        let Some(user_id) = user_id else {
            return default_doc;
        };

        if let Some(cached) = self.user_cache.read().get(user_id) {
            return cached.clone();
        }

        let mut merged = default_doc;
        deep_merge(&mut merged, &self.user_overlay(user_id));
        self.user_cache
            .write()
            .insert(user_id.to_string(), merged.clone());
        merged
    }

    /// Merged document with secrets stripped, for read surfaces.
    pub fn merged_redacted(&self, user_id: Option<&str>) -> Value {
        let mut merged = self.merged(user_id);
        redact_secrets(&mut merged);
        merged
    }

    /// Typed view of the merged document; unknown fields fall back to
    /// defaults per-section.
    pub fn merged_config(&self, user_id: Option<&str>) -> Config {
        serde_json::from_value(self.merged(user_id)).unwrap_or_else(|_| self.default_config())
    }

    pub fn processing_policy(&self, user_id: Option<&str>) -> ProcessingConfig {
        self.merged_config(user_id).conversation.processing.clamped()
    }

    pub fn system_prompt(&self, user_id: Option<&str>) -> String {
        let merged = self.merged(user_id);
        // A top-level `system_prompt` override wins over the prompts
        // section.
        merged
            .get("system_prompt")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| {
                merged["prompts"]["system_prompt"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string()
            })
    }

    // ── Writes ────────────────────────────────────────────────────

    /// Apply a change set to a user overlay. API keys never land in
    /// user files.
    pub async fn update_user(&self, user_id: &str, changes: Value) -> Result<Value> {
        if contains_secret_key(&changes) {
            return Err(Error::Config(
                "user config must not contain api keys".into(),
            ));
        }
        let Value::Object(_) = changes else {
            return Err(Error::Config("changes must be an object".into()));
        };

        let mut overlay = self.user_overlay(user_id);
        deep_merge(&mut overlay, &changes);
        let path = self.user_path(user_id);
        std::fs::write(&path, serde_json::to_vec_pretty(&overlay)?)?;

        self.user_cache.write().remove(user_id);

        let changed_keys: Vec<String> = changes
            .as_object()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default();
        self.bus
            .emit(
                EventType::ConfigChanged,
                serde_json::json!({"user_id": user_id, "changes": changed_keys}),
            )
            .await;

        let mut saved = overlay;
        redact_secrets(&mut saved);
        Ok(saved)
    }

    pub async fn reset_user(&self, user_id: &str) -> Result<()> {
        let path = self.user_path(user_id);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        self.user_cache.write().remove(user_id);
        self.bus
            .emit(
                EventType::ConfigChanged,
                serde_json::json!({"user_id": user_id, "changes": ["reset"]}),
            )
            .await;
        Ok(())
    }

    pub async fn switch_model(&self, user_id: Option<&str>, model: &str) -> Result<()> {
        match user_id {
            Some(user_id) => {
                self.update_user(user_id, serde_json::json!({"api": {"model": model}}))
                    .await?;
            }
            None => {
                {
                    let mut default = self.default.write();
                    default.api.model = model.to_string();
                }
                self.user_cache.write().clear();
                self.bus
                    .emit(
                        EventType::ConfigChanged,
                        serde_json::json!({"user_id": null, "changes": ["api"]}),
                    )
                    .await;
            }
        }
        Ok(())
    }

    /// Re-read `default.json` (when present) and drop the merge
    /// cache.
    pub async fn reload(&self) -> Result<()> {
        if let Some(fresh) = Self::load_default(&self.config_dir)? {
            *self.default.write() = fresh;
        }
        self.user_cache.write().clear();
        self.bus
            .emit(EventType::ConfigReloaded, serde_json::json!({}))
            .await;
        tracing::info!("default config reloaded");
        Ok(())
    }

    pub fn diagnose(&self) -> Vec<ConfigIssue> {
        self.default.read().validate()
    }
}

/// Recursive merge: objects merge key-wise, everything else replaces.
fn deep_merge(target: &mut Value, source: &Value) {
    match (target, source) {
        (Value::Object(target_map), Value::Object(source_map)) => {
            for (key, value) in source_map {
                match target_map.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        deep_merge(existing, value);
                    }
                    _ => {
                        target_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, source) => *target = source.clone(),
    }
}

fn contains_secret_key(value: &Value) -> bool {
    match value {
        Value::Object(map) => map.iter().any(|(key, v)| {
            matches!(key.as_str(), "api_key" | "password") || contains_secret_key(v)
        }),
        Value::Array(items) => items.iter().any(contains_secret_key),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn service() -> (TempDir, ConfigService) {
        let dir = TempDir::new().unwrap();
        let bus = Arc::new(EventBus::new());
        let service =
            ConfigService::new(dir.path().join("config"), Config::default(), bus).unwrap();
        (dir, service)
    }

    #[tokio::test]
    async fn user_overlay_wins_over_default() {
        let (_dir, service) = service();
        service
            .update_user("alice", serde_json::json!({"api": {"model": "gpt-x"}}))
            .await
            .unwrap();

        let merged = service.merged(Some("alice"));
        assert_eq!(merged["api"]["model"], "gpt-x");
        // Default untouched for another user.
        assert_eq!(service.merged(Some("bob"))["api"]["model"], "");
    }

    #[tokio::test]
    async fn api_keys_are_refused_in_user_config() {
        let (_dir, service) = service();
        let err = service
            .update_user("alice", serde_json::json!({"api": {"api_key": "sk-leak"}}))
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn reset_clears_overlay() {
        let (_dir, service) = service();
        service
            .update_user("alice", serde_json::json!({"api": {"model": "gpt-x"}}))
            .await
            .unwrap();
        service.reset_user("alice").await.unwrap();
        assert_eq!(service.merged(Some("alice"))["api"]["model"], "");
    }

    #[tokio::test]
    async fn switch_model_updates_default_or_user() {
        let (_dir, service) = service();
        service.switch_model(None, "global-model").await.unwrap();
        assert_eq!(service.default_config().api.model, "global-model");

        service.switch_model(Some("alice"), "user-model").await.unwrap();
        assert_eq!(service.merged(Some("alice"))["api"]["model"], "user-model");
        assert_eq!(service.merged(None)["api"]["model"], "global-model");
    }

    #[tokio::test]
    async fn change_events_are_emitted() {
        let dir = TempDir::new().unwrap();
        let bus = Arc::new(EventBus::new());
        let service =
            ConfigService::new(dir.path().join("config"), Config::default(), bus.clone()).unwrap();

        service
            .update_user("alice", serde_json::json!({"conversation": {"max_history_rounds": 5}}))
            .await
            .unwrap();

        let history = bus.get_history(Some(EventType::ConfigChanged), 10);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].payload["user_id"], "alice");
    }

    #[test]
    fn deep_merge_merges_nested_objects() {
        let mut target = serde_json::json!({"a": {"x": 1, "y": 2}, "b": 3});
        deep_merge(&mut target, &serde_json::json!({"a": {"y": 9}, "c": 4}));
        assert_eq!(target, serde_json::json!({"a": {"x": 1, "y": 9}, "b": 3, "c": 4}));
    }

    #[test]
    fn merged_redacted_hides_secrets() {
        let (_dir, service) = service();
        let redacted = service.merged_redacted(None);
        // Empty secrets stay empty, non-empty would be starred; either
        // way nothing real leaks.
        assert!(redacted["api"]["api_key"].as_str().unwrap().len() <= 3);
    }
}
