//! Time decay and forgetting.
//!
//! Importance follows a stepwise decay curve by node age, reinforced
//! by access counts. Layer-0 non-message nodes that decay below the
//! configured floor are deleted in batches.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use pv_domain::config::ForgettingConfig;
use pv_domain::error::Result;

use crate::graph::GraphStore;

/// Access reinforcement: +5% per 10 accesses, capped at +20%.
const ACCESS_BOOST_STEP: f64 = 0.05;
const ACCESS_BOOST_CAP: f64 = 0.2;
const MAX_IMPORTANCE: f64 = 1.0;

/// Stepwise decay factor by age in days.
pub fn calculate_decay_factor(days_passed: f64) -> f64 {
    if days_passed <= 1.0 {
        1.0
    } else if days_passed <= 7.0 {
        0.9
    } else if days_passed <= 30.0 {
        0.7
    } else if days_passed <= 90.0 {
        0.5
    } else if days_passed <= 365.0 {
        0.3
    } else {
        0.2
    }
}

pub struct ForgettingManager {
    store: Arc<dyn GraphStore>,
    config: ForgettingConfig,
}

impl ForgettingManager {
    pub fn new(store: Arc<dyn GraphStore>, config: ForgettingConfig) -> Self {
        Self { store, config }
    }

    /// Apply time decay to the session's layer-0/1 nodes. Returns the
    /// operation report served by `memory.decay`.
    pub async fn apply_time_decay(&self, session_node_id: &str) -> Result<Value> {
        let nodes = self.store.decay_nodes(session_node_id).await?;
        let now = Utc::now();
        let mut updated = 0usize;

        for node in nodes {
            let days_passed = (now - node.created_at).num_seconds() as f64 / 86_400.0;
            let decay_factor = calculate_decay_factor(days_passed);
            let access_boost =
                ((node.access_count / 10) as f64 * ACCESS_BOOST_STEP).min(ACCESS_BOOST_CAP);
            let new_importance =
                (node.importance * decay_factor + access_boost).min(MAX_IMPORTANCE);
            self.store.set_importance(&node.id, new_importance).await?;
            updated += 1;
        }

        tracing::info!(updated, "time decay applied");
        Ok(serde_json::json!({"updated_count": updated, "status": "success"}))
    }

    /// Delete forgotten nodes (layer-0 non-message, below the
    /// importance floor), one batch per call.
    pub async fn cleanup_forgotten(&self, session_node_id: &str) -> Result<Value> {
        let deleted = self
            .store
            .delete_forgotten(
                session_node_id,
                self.config.min_importance,
                self.config.cleanup_batch,
            )
            .await?;
        tracing::info!(deleted, "forgotten nodes cleaned up");
        Ok(serde_json::json!({"deleted_count": deleted, "status": "success"}))
    }

    /// Weak/strong node distribution for the doctor surface.
    pub async fn forgetting_stats(&self, session_node_id: &str) -> Result<Value> {
        let nodes = self.store.decay_nodes(session_node_id).await?;
        if nodes.is_empty() {
            return Ok(serde_json::json!({"status": "no_data"}));
        }
        let total = nodes.len();
        let avg = nodes.iter().map(|n| n.importance).sum::<f64>() / total as f64;
        let weak = nodes.iter().filter(|n| n.importance < 0.3).count();
        let strong = nodes.iter().filter(|n| n.importance >= 0.7).count();
        Ok(serde_json::json!({
            "total_nodes": total,
            "avg_importance": (avg * 1000.0).round() / 1000.0,
            "weak_nodes": weak,
            "strong_nodes": strong,
            "status": "success",
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decay_curve_boundaries() {
        assert_eq!(calculate_decay_factor(0.5), 1.0);
        assert_eq!(calculate_decay_factor(1.0), 1.0);
        assert_eq!(calculate_decay_factor(1.1), 0.9);
        assert_eq!(calculate_decay_factor(7.0), 0.9);
        assert_eq!(calculate_decay_factor(8.0), 0.7);
        assert_eq!(calculate_decay_factor(30.0), 0.7);
        assert_eq!(calculate_decay_factor(90.0), 0.5);
        assert_eq!(calculate_decay_factor(365.0), 0.3);
        assert_eq!(calculate_decay_factor(366.0), 0.2);
        assert_eq!(calculate_decay_factor(10_000.0), 0.2);
    }

    #[test]
    fn access_boost_is_stepped_and_capped() {
        let boost = |count: i64| ((count / 10) as f64 * ACCESS_BOOST_STEP).min(ACCESS_BOOST_CAP);
        assert_eq!(boost(0), 0.0);
        assert_eq!(boost(9), 0.0);
        assert_eq!(boost(10), 0.05);
        assert_eq!(boost(25), 0.10);
        assert_eq!(boost(40), 0.20);
        assert_eq!(boost(1000), 0.20);
    }
}
