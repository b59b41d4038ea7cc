//! In-process counters surfaced through health / status / doctor.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    pub requests: AtomicU64,
    pub request_errors: AtomicU64,
    pub events_emitted: AtomicU64,
    pub llm_calls: AtomicU64,
    pub tool_calls: AtomicU64,
    pub memory_writes: AtomicU64,
    pub memory_recalls: AtomicU64,
    pub turns_completed: AtomicU64,
    pub turns_failed: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "requests": self.requests.load(Ordering::Relaxed),
            "request_errors": self.request_errors.load(Ordering::Relaxed),
            "events_emitted": self.events_emitted.load(Ordering::Relaxed),
            "llm_calls": self.llm_calls.load(Ordering::Relaxed),
            "tool_calls": self.tool_calls.load(Ordering::Relaxed),
            "memory_writes": self.memory_writes.load(Ordering::Relaxed),
            "memory_recalls": self.memory_recalls.load(Ordering::Relaxed),
            "turns_completed": self.turns_completed.load(Ordering::Relaxed),
            "turns_failed": self.turns_failed.load(Ordering::Relaxed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let metrics = Metrics::new();
        Metrics::incr(&metrics.requests);
        Metrics::incr(&metrics.requests);
        Metrics::incr(&metrics.turns_completed);
        let snap = metrics.snapshot();
        assert_eq!(snap["requests"], 2);
        assert_eq!(snap["turns_completed"], 1);
        assert_eq!(snap["turns_failed"], 0);
    }
}
