use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Conversation orchestration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    #[serde(default)]
    pub processing: ProcessingConfig,
    /// Per-session history window, in user/assistant rounds. The
    /// message list is bounded to twice this value.
    #[serde(default = "d_max_history_rounds")]
    pub max_history_rounds: usize,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            processing: ProcessingConfig::default(),
            max_history_rounds: d_max_history_rounds(),
        }
    }
}

fn d_max_history_rounds() -> usize {
    10
}

/// Per-session queue and retry policy for the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    #[serde(default = "d_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "d_max_retries")]
    pub max_retries: u32,
    #[serde(default = "d_retry_base_delay_s")]
    pub retry_base_delay_s: f64,
    #[serde(default = "d_retry_max_delay_s")]
    pub retry_max_delay_s: f64,
    /// Workers exit after the queue has been empty this long.
    #[serde(default = "d_worker_idle_ttl_s")]
    pub worker_idle_ttl_s: f64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_queue_size: d_max_queue_size(),
            max_retries: d_max_retries(),
            retry_base_delay_s: d_retry_base_delay_s(),
            retry_max_delay_s: d_retry_max_delay_s(),
            worker_idle_ttl_s: d_worker_idle_ttl_s(),
        }
    }
}

impl ProcessingConfig {
    /// Normalize out-of-range values instead of failing: queue size
    /// at least 1, base delay at least 100 ms, max delay at least the
    /// base delay, idle TTL at least 5 s.
    pub fn clamped(&self) -> Self {
        let max_queue_size = self.max_queue_size.max(1);
        let retry_base_delay_s = self.retry_base_delay_s.max(0.1);
        let retry_max_delay_s = self.retry_max_delay_s.max(retry_base_delay_s);
        let worker_idle_ttl_s = self.worker_idle_ttl_s.max(5.0);
        Self {
            max_queue_size,
            max_retries: self.max_retries,
            retry_base_delay_s,
            retry_max_delay_s,
            worker_idle_ttl_s,
        }
    }

    /// Backoff delay for a retry attempt (0-based): geometric with
    /// ratio 2, capped at `retry_max_delay_s`.
    pub fn retry_delay_s(&self, attempt: u32) -> f64 {
        let factor = 2f64.powi(attempt.min(30) as i32);
        (self.retry_base_delay_s * factor).min(self.retry_max_delay_s)
    }
}

fn d_max_queue_size() -> usize {
    32
}

fn d_max_retries() -> u32 {
    2
}

fn d_retry_base_delay_s() -> f64 {
    0.8
}

fn d_retry_max_delay_s() -> f64 {
    8.0
}

fn d_worker_idle_ttl_s() -> f64 {
    300.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delays_form_capped_geometric_sequence() {
        let policy = ProcessingConfig::default();
        assert!((policy.retry_delay_s(0) - 0.8).abs() < 1e-9);
        assert!((policy.retry_delay_s(1) - 1.6).abs() < 1e-9);
        assert!((policy.retry_delay_s(2) - 3.2).abs() < 1e-9);
        assert!((policy.retry_delay_s(3) - 6.4).abs() < 1e-9);
        // Capped at retry_max_delay_s from here on.
        assert!((policy.retry_delay_s(4) - 8.0).abs() < 1e-9);
        assert!((policy.retry_delay_s(20) - 8.0).abs() < 1e-9);
    }

    #[test]
    fn clamped_repairs_degenerate_values() {
        let policy = ProcessingConfig {
            max_queue_size: 0,
            max_retries: 2,
            retry_base_delay_s: 0.0,
            retry_max_delay_s: 0.0,
            worker_idle_ttl_s: 1.0,
        }
        .clamped();
        assert_eq!(policy.max_queue_size, 1);
        assert!(policy.retry_base_delay_s >= 0.1);
        assert!(policy.retry_max_delay_s >= policy.retry_base_delay_s);
        assert!(policy.worker_idle_ttl_s >= 5.0);
    }
}
