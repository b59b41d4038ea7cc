mod api;
mod conversation;
mod mcp;
mod memory;
mod plugins;
mod server;
mod sessions;

pub use api::*;
pub use conversation::*;
pub use mcp::*;
pub use memory::*;
pub use plugins::*;
pub use server::*;
pub use sessions::*;

use serde::{Deserialize, Serialize};
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub prompts: PromptsConfig,
    #[serde(default)]
    pub conversation: ConversationConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub mcp: McpConfig,
    #[serde(default)]
    pub plugins: PluginsConfig,
}

impl Config {
    /// Validate the configuration. Issues of severity `Error` must
    /// abort startup (exit code 1).
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.server.port == 0 {
            issues.push(ConfigIssue::error("server.port", "port must be non-zero"));
        }
        if self.api.model.is_empty() {
            issues.push(ConfigIssue::warning(
                "api.model",
                "no model configured; LLM calls will fail",
            ));
        }
        if self.memory.enabled && self.memory.graph.http_url.is_empty() {
            issues.push(ConfigIssue::warning(
                "memory.graph.http_url",
                "memory enabled without a graph endpoint; falling back to in-memory store",
            ));
        }
        let proc = &self.conversation.processing;
        if proc.retry_max_delay_s < proc.retry_base_delay_s {
            issues.push(ConfigIssue::warning(
                "conversation.processing.retry_max_delay_s",
                "max retry delay below base delay; will be clamped",
            ));
        }
        for server in &self.mcp.servers {
            if server.command.is_empty() {
                issues.push(ConfigIssue::error(
                    "mcp.servers",
                    format!("server '{}' has no command", server.id),
                ));
            }
        }

        issues
    }

    /// A deep copy safe for read surfaces: every secret field is
    /// replaced with `"***"`.
    pub fn redacted(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        redact_secrets(&mut value);
        value
    }
}

/// Replace the values of secret-bearing keys anywhere in a config
/// document. Applied to both system and per-user documents before
/// they leave the process.
pub fn redact_secrets(value: &mut serde_json::Value) {
    const SECRET_KEYS: [&str; 3] = ["api_key", "password", "token"];

    match value {
        serde_json::Value::Object(map) => {
            for (key, v) in map.iter_mut() {
                if SECRET_KEYS.contains(&key.as_str()) {
                    if let serde_json::Value::String(s) = v {
                        if !s.is_empty() {
                            *v = serde_json::Value::String("***".into());
                        }
                    }
                } else {
                    redact_secrets(v);
                }
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                redact_secrets(item);
            }
        }
        _ => {}
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl ConfigIssue {
    pub fn error(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Error,
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn warning(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Warning,
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_no_errors() {
        let config = Config::default();
        let errors: Vec<_> = config
            .validate()
            .into_iter()
            .filter(|i| i.severity == ConfigSeverity::Error)
            .collect();
        assert!(errors.is_empty(), "default config must start: {errors:?}");
    }

    #[test]
    fn redacted_hides_api_key() {
        let mut config = Config::default();
        config.api.api_key = "sk-secret".into();
        let redacted = config.redacted();
        assert_eq!(redacted["api"]["api_key"], "***");
    }

    #[test]
    fn redacted_leaves_empty_secrets_empty() {
        let config = Config::default();
        let redacted = config.redacted();
        assert_eq!(redacted["api"]["api_key"], "");
    }

    #[test]
    fn empty_json_deserializes_to_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.conversation.processing.max_queue_size, 32);
        assert_eq!(config.memory.gating.recall_filter.min_query_chars, 6);
    }
}
