//! Tool risk classification.
//!
//! A fixed allowlist defines the HIGH (destructive) and MODERATE
//! tiers; known read-only actions within a moderate tool are
//! downgraded to SAFE. Everything else defaults to SAFE.

use std::collections::HashSet;

use serde_json::Value;

use pv_domain::tool::RiskLevel;

const HIGH_RISK_TOOLS: [&str; 7] = [
    "execute_command",
    "run_script",
    "delete_file",
    "move_file",
    "replace_in_file",
    "write_file",
    "computer_control",
];

const MODERATE_RISK_TOOLS: [&str; 4] = ["browser_action", "click", "type", "scroll"];

/// Read-only actions inside `computer_control` / `browser_action`.
const SAFE_ACTIONS: [&str; 6] = [
    "screenshot",
    "get_content",
    "get_url",
    "get_title",
    "get_mouse_position",
    "get_screen_size",
];

pub struct ToolPolicy {
    high: HashSet<&'static str>,
    moderate: HashSet<&'static str>,
    safe_actions: HashSet<&'static str>,
}

impl Default for ToolPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolPolicy {
    pub fn new() -> Self {
        Self {
            high: HIGH_RISK_TOOLS.into_iter().collect(),
            moderate: MODERATE_RISK_TOOLS.into_iter().collect(),
            safe_actions: SAFE_ACTIONS.into_iter().collect(),
        }
    }

    fn lookup(&self, name: &str) -> Option<RiskLevel> {
        if self.high.contains(name) {
            Some(RiskLevel::High)
        } else if self.moderate.contains(name) {
            Some(RiskLevel::Moderate)
        } else {
            None
        }
    }

    /// Classify one call. The effective tool may be nested under
    /// `args.tool_name` when the outer name is only a service name.
    pub fn check_risk(&self, tool_name: &str, args: &Value) -> RiskLevel {
        let action_tools = ["computer_control", "browser_action"];
        let nested = args.get("tool_name").and_then(|v| v.as_str());

        // Action-scoped tools get the read-only downgrade before the
        // direct table lookup is final.
        for candidate in [Some(tool_name), nested].into_iter().flatten() {
            if action_tools.contains(&candidate) {
                let action = args.get("action").and_then(|v| v.as_str()).unwrap_or("");
                if self.safe_actions.contains(action) {
                    return RiskLevel::Safe;
                }
            }
        }

        if let Some(level) = self.lookup(tool_name) {
            return level;
        }
        if let Some(level) = nested.and_then(|n| self.lookup(n)) {
            return level;
        }
        RiskLevel::Safe
    }

    pub fn requires_confirmation(&self, tool_name: &str, args: &Value) -> bool {
        self.check_risk(tool_name, args) == RiskLevel::High
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destructive_tools_are_high() {
        let policy = ToolPolicy::new();
        for name in HIGH_RISK_TOOLS {
            if name == "computer_control" {
                continue; // action-dependent, checked below
            }
            assert_eq!(
                policy.check_risk(name, &serde_json::json!({})),
                RiskLevel::High,
                "{name} should be high risk"
            );
        }
    }

    #[test]
    fn browser_tools_are_moderate() {
        let policy = ToolPolicy::new();
        assert_eq!(
            policy.check_risk("click", &serde_json::json!({})),
            RiskLevel::Moderate
        );
        assert_eq!(
            policy.check_risk("scroll", &serde_json::json!({})),
            RiskLevel::Moderate
        );
    }

    #[test]
    fn unknown_tools_default_to_safe() {
        let policy = ToolPolicy::new();
        assert_eq!(
            policy.check_risk("get_weather", &serde_json::json!({})),
            RiskLevel::Safe
        );
    }

    #[test]
    fn nested_tool_name_is_classified() {
        let policy = ToolPolicy::new();
        let args = serde_json::json!({"tool_name": "delete_file", "path": "/x"});
        assert_eq!(policy.check_risk("filesystem", &args), RiskLevel::High);
    }

    #[test]
    fn readonly_actions_downgrade_to_safe() {
        let policy = ToolPolicy::new();
        let args = serde_json::json!({"action": "screenshot"});
        assert_eq!(policy.check_risk("computer_control", &args), RiskLevel::Safe);
        assert_eq!(policy.check_risk("browser_action", &args), RiskLevel::Safe);

        let destructive = serde_json::json!({"action": "press_keys"});
        assert_eq!(
            policy.check_risk("computer_control", &destructive),
            RiskLevel::High
        );
        assert_eq!(
            policy.check_risk("browser_action", &destructive),
            RiskLevel::Moderate
        );
    }

    #[test]
    fn confirmation_required_only_for_high() {
        let policy = ToolPolicy::new();
        assert!(policy.requires_confirmation("write_file", &serde_json::json!({})));
        assert!(!policy.requires_confirmation("click", &serde_json::json!({})));
        assert!(!policy.requires_confirmation("search", &serde_json::json!({})));
    }
}
