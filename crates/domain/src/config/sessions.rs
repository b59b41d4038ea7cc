use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session storage
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Directory holding `sessions.json` and the config overlays.
    #[serde(default = "d_state_dir")]
    pub state_dir: PathBuf,
    /// Inactive sessions older than this are swept. `0` disables the
    /// time-based sweep (the default).
    #[serde(default)]
    pub max_age_hours: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            state_dir: d_state_dir(),
            max_age_hours: 0,
        }
    }
}

fn d_state_dir() -> PathBuf {
    PathBuf::from("./data")
}
