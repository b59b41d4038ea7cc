//! Plugin discovery and registration.
//!
//! A plugin is a directory under the configured plugins dir carrying
//! a `plugin.json` manifest. Channel plugins contribute channels to
//! the registry; malformed manifests are logged and skipped.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use pv_events::EventBus;

use crate::channels::{ChannelRegistry, WebChannel};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    #[serde(default)]
    pub version: String,
    /// `"channel"` is the only kind the gateway instantiates; other
    /// kinds are recorded for discovery surfaces only.
    #[serde(default = "d_kind")]
    pub kind: String,
    #[serde(default)]
    pub description: String,
    /// Entry point: `builtin:<name>` for channels shipped in-process;
    /// anything else refers to an external adapter.
    #[serde(default)]
    pub entry: String,
}

fn d_kind() -> String {
    "channel".into()
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadedPlugin {
    pub manifest: PluginManifest,
    pub active: bool,
}

#[derive(Default)]
pub struct PluginRegistry {
    plugins: parking_lot::RwLock<Vec<LoadedPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan `dir` for manifests and register channel plugins.
    pub fn discover(&self, dir: &Path, bus: &Arc<EventBus>, channels: &ChannelRegistry) {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(_) => {
                tracing::debug!(dir = %dir.display(), "no plugins directory");
                return;
            }
        };

        for entry in entries.flatten() {
            let manifest_path = entry.path().join("plugin.json");
            if !manifest_path.is_file() {
                continue;
            }
            let manifest: PluginManifest = match std::fs::read_to_string(&manifest_path)
                .map_err(|e| e.to_string())
                .and_then(|raw| serde_json::from_str(&raw).map_err(|e| e.to_string()))
            {
                Ok(manifest) => manifest,
                Err(e) => {
                    tracing::warn!(
                        path = %manifest_path.display(),
                        error = %e,
                        "skipping malformed plugin manifest"
                    );
                    continue;
                }
            };
            if manifest.name.is_empty() {
                tracing::warn!(path = %manifest_path.display(), "plugin manifest missing name, skipped");
                continue;
            }

            let active = self.activate(&manifest, bus, channels);
            tracing::info!(
                plugin = %manifest.name,
                kind = %manifest.kind,
                active,
                "plugin discovered"
            );
            self.plugins.write().push(LoadedPlugin { manifest, active });
        }
    }

    fn activate(
        &self,
        manifest: &PluginManifest,
        bus: &Arc<EventBus>,
        channels: &ChannelRegistry,
    ) -> bool {
        if manifest.kind != "channel" {
            return false;
        }
        match manifest.entry.as_str() {
            "builtin:web" => {
                channels.register(Arc::new(WebChannel::new(bus.clone())));
                true
            }
            other => {
                // External adapters connect over the wire; the
                // manifest only announces them.
                tracing::debug!(entry = %other, "channel plugin is external, not instantiated");
                false
            }
        }
    }

    pub fn list(&self) -> Vec<LoadedPlugin> {
        self.plugins.read().clone()
    }

    pub fn count(&self) -> usize {
        self.plugins.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_manifest(dir: &Path, name: &str, body: &str) {
        let plugin_dir = dir.join(name);
        std::fs::create_dir_all(&plugin_dir).unwrap();
        std::fs::write(plugin_dir.join("plugin.json"), body).unwrap();
    }

    #[test]
    fn discovers_builtin_channel_plugin() {
        let dir = TempDir::new().unwrap();
        write_manifest(
            dir.path(),
            "web",
            r#"{"name": "web", "version": "1.0", "kind": "channel", "entry": "builtin:web"}"#,
        );

        let bus = Arc::new(EventBus::new());
        let channels = ChannelRegistry::new();
        let plugins = PluginRegistry::new();
        plugins.discover(dir.path(), &bus, &channels);

        assert_eq!(plugins.count(), 1);
        assert!(plugins.list()[0].active);
        assert!(channels.get("web").is_some());
    }

    #[test]
    fn malformed_manifest_is_skipped() {
        let dir = TempDir::new().unwrap();
        write_manifest(dir.path(), "broken", "not json at all");
        write_manifest(
            dir.path(),
            "ok",
            r#"{"name": "external-im", "kind": "channel", "entry": "external"}"#,
        );

        let bus = Arc::new(EventBus::new());
        let channels = ChannelRegistry::new();
        let plugins = PluginRegistry::new();
        plugins.discover(dir.path(), &bus, &channels);

        assert_eq!(plugins.count(), 1);
        assert!(!plugins.list()[0].active);
    }

    #[test]
    fn missing_dir_is_fine() {
        let bus = Arc::new(EventBus::new());
        let channels = ChannelRegistry::new();
        let plugins = PluginRegistry::new();
        plugins.discover(Path::new("/nonexistent/plugins"), &bus, &channels);
        assert_eq!(plugins.count(), 0);
    }
}
