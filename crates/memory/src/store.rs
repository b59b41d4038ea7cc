//! The memory store facade: hot-layer writes, recall reads, and the
//! threshold-driven background maintenance (clustering, summaries,
//! decay, cleanup).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::Value;

use pv_domain::config::MemoryConfig;
use pv_domain::error::Result;

use crate::cold::ColdLayer;
use crate::forgetting::ForgettingManager;
use crate::graph::GraphStore;
use crate::hot::HotLayer;
use crate::recall::RecallEngine;
use crate::scope::session_node_id;
use crate::warm::WarmLayer;

struct SessionCounters {
    messages_since_cluster: u64,
    messages_total: u64,
    last_cluster_at: Option<Instant>,
    last_decay_at: Option<Instant>,
    /// Bumped on every message; the idle timer only fires when its
    /// captured generation is still current.
    idle_generation: u64,
}

impl Default for SessionCounters {
    fn default() -> Self {
        Self {
            messages_since_cluster: 0,
            messages_total: 0,
            last_cluster_at: None,
            last_decay_at: None,
            idle_generation: 0,
        }
    }
}

/// Facade over the memory layers, as wired into the session store and
/// the memory service.
pub struct MemoryStore {
    store: Arc<dyn GraphStore>,
    hot: HotLayer,
    warm: WarmLayer,
    cold: ColdLayer,
    forgetting: ForgettingManager,
    recall: RecallEngine,
    config: MemoryConfig,
    counters: Mutex<HashMap<String, SessionCounters>>,
}

impl MemoryStore {
    pub fn new(
        store: Arc<dyn GraphStore>,
        hot: HotLayer,
        warm: WarmLayer,
        cold: ColdLayer,
        forgetting: ForgettingManager,
        config: MemoryConfig,
    ) -> Self {
        let recall = RecallEngine::new(store.clone());
        Self {
            store,
            hot,
            warm,
            cold,
            forgetting,
            recall,
            config,
            counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn graph(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Write one message into the hot layer. Failures degrade to
    /// `false`; memory never fails a request.
    pub async fn add_message(
        &self,
        session_id: &str,
        role: &str,
        content: &str,
        user_id: &str,
        metadata: Option<Value>,
    ) -> bool {
        if !self.is_enabled() {
            return false;
        }
        match self
            .hot
            .process_message(session_id, role, content, user_id, metadata)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(error = %e, "memory write dropped");
                false
            }
        }
    }

    /// Recall context for a query; empty string when disabled or the
    /// graph is unreachable.
    pub async fn get_context(&self, query: &str, session_id: &str, user_id: &str) -> String {
        if !self.is_enabled() {
            return String::new();
        }
        self.recall.recall(&self.hot, query, session_id, user_id).await
    }

    // ── Maintenance ───────────────────────────────────────────────

    /// Bump per-session counters and fire whichever maintenance tasks
    /// have crossed their thresholds. Runs in the background; the
    /// caller never waits on graph work.
    pub fn on_message_saved(self: &Arc<Self>, session_id: &str, _role: &str, user_id: &str) {
        if !self.is_enabled() {
            return;
        }

        let scoped = session_node_id(session_id, Some(user_id));
        let warm_cfg = &self.config.warm_layer;

        let (run_cluster, run_decay, run_cleanup, idle_generation) = {
            let mut counters = self.counters.lock();
            let entry = counters.entry(scoped.clone()).or_default();
            entry.messages_since_cluster += 1;
            entry.messages_total += 1;
            entry.idle_generation += 1;

            let cluster_due = entry.messages_since_cluster >= warm_cfg.cluster_every_messages
                && entry
                    .last_cluster_at
                    .map(|at| at.elapsed().as_secs() >= warm_cfg.cluster_min_interval_s)
                    .unwrap_or(true);
            if cluster_due {
                entry.messages_since_cluster = 0;
                entry.last_cluster_at = Some(Instant::now());
            }

            let decay_due = entry
                .last_decay_at
                .map(|at| at.elapsed().as_secs() >= self.config.forgetting.decay_interval_s)
                .unwrap_or(false);
            if entry.last_decay_at.is_none() {
                entry.last_decay_at = Some(Instant::now());
            } else if decay_due {
                entry.last_decay_at = Some(Instant::now());
            }

            let cleanup_due = self.config.forgetting.cleanup_every_messages > 0
                && entry.messages_total % self.config.forgetting.cleanup_every_messages == 0;

            (cluster_due, decay_due, cleanup_due, entry.idle_generation)
        };

        let this = self.clone();
        let scoped_bg = scoped.clone();
        tokio::spawn(async move {
            if run_cluster {
                if let Err(e) = this.warm.cluster_entities(&scoped_bg).await {
                    tracing::warn!(error = %e, "background clustering failed");
                }
            }
            match this.cold.should_create_summary(&scoped_bg).await {
                Ok(true) => {
                    if let Err(e) = this.cold.summarize_session(&scoped_bg).await {
                        tracing::warn!(error = %e, "background summarization failed");
                    }
                }
                Ok(false) => {}
                Err(e) => tracing::debug!(error = %e, "summary threshold check failed"),
            }
            if run_decay {
                if let Err(e) = this.forgetting.apply_time_decay(&scoped_bg).await {
                    tracing::warn!(error = %e, "background decay failed");
                }
            }
            if run_cleanup {
                if let Err(e) = this.forgetting.cleanup_forgotten(&scoped_bg).await {
                    tracing::warn!(error = %e, "background cleanup failed");
                }
            }
        });

        // Idle-triggered clustering: fire only if no further message
        // arrives before the delay elapses.
        let this = self.clone();
        let delay = warm_cfg.idle_cluster_delay_s;
        let min_pending = warm_cfg.idle_cluster_min_messages;
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(delay)).await;
            let still_idle_with_pending = {
                let counters = this.counters.lock();
                counters
                    .get(&scoped)
                    .map(|entry| {
                        entry.idle_generation == idle_generation
                            && entry.messages_since_cluster >= min_pending
                    })
                    .unwrap_or(false)
            };
            if still_idle_with_pending {
                {
                    let mut counters = this.counters.lock();
                    if let Some(entry) = counters.get_mut(&scoped) {
                        entry.messages_since_cluster = 0;
                        entry.last_cluster_at = Some(Instant::now());
                    }
                }
                if let Err(e) = this.warm.cluster_entities(&scoped).await {
                    tracing::warn!(error = %e, "idle clustering failed");
                }
            }
        });
    }

    // ── Direct layer access (memory.* operations) ─────────────────

    pub fn warm(&self) -> &WarmLayer {
        &self.warm
    }

    pub fn cold(&self) -> &ColdLayer {
        &self.cold
    }

    pub fn forgetting(&self) -> &ForgettingManager {
        &self.forgetting
    }

    pub fn hot(&self) -> &HotLayer {
        &self.hot
    }

    pub async fn graph_reachable(&self) -> bool {
        self.store.ping().await.is_ok()
    }

    pub async fn stats(&self) -> Result<crate::graph::GraphStats> {
        self.store.stats().await
    }
}
