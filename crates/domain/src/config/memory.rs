use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Memory system
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MemoryConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Optional dedicated endpoint for memory-side LLM calls
    /// (classifier, extractor, summarizer).
    #[serde(default)]
    pub api: MemoryApiConfig,
    #[serde(default)]
    pub gating: GatingConfig,
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub warm_layer: WarmLayerConfig,
    #[serde(default)]
    pub cold_layer: ColdLayerConfig,
    #[serde(default)]
    pub forgetting: ForgettingConfig,
}

/// Memory LLM endpoint. When `use_main_api` is set (the default),
/// empty fields fall back to the main `api` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryApiConfig {
    #[serde(default = "d_true")]
    pub use_main_api: bool,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub model: String,
}

impl Default for MemoryApiConfig {
    fn default() -> Self {
        Self {
            use_main_api: true,
            api_key: String::new(),
            base_url: String::new(),
            model: String::new(),
        }
    }
}

// ── Gating ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GatingConfig {
    #[serde(default)]
    pub recall_filter: RecallFilterConfig,
    #[serde(default)]
    pub write_filter: WriteFilterConfig,
    #[serde(default)]
    pub dedupe: DedupeConfig,
}

/// Code-level gate in front of the recall classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecallFilterConfig {
    #[serde(default = "d_min_query_chars")]
    pub min_query_chars: usize,
    #[serde(default = "d_max_query_chars")]
    pub max_query_chars: usize,
}

impl Default for RecallFilterConfig {
    fn default() -> Self {
        Self {
            min_query_chars: d_min_query_chars(),
            max_query_chars: d_max_query_chars(),
        }
    }
}

/// Code-level gate in front of the memory-write classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteFilterConfig {
    #[serde(default = "d_min_user_chars")]
    pub min_user_chars: usize,
    #[serde(default = "d_min_assistant_chars_for_short_user")]
    pub min_assistant_chars_for_short_user: usize,
    #[serde(default = "d_max_combined_chars")]
    pub max_combined_chars: usize,
}

impl Default for WriteFilterConfig {
    fn default() -> Self {
        Self {
            min_user_chars: d_min_user_chars(),
            min_assistant_chars_for_short_user: d_min_assistant_chars_for_short_user(),
            max_combined_chars: d_max_combined_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupeConfig {
    #[serde(default = "d_min_candidate_chars")]
    pub min_candidate_chars: usize,
    #[serde(default = "d_recent_write_cache_size")]
    pub recent_write_cache_size: usize,
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self {
            min_candidate_chars: d_min_candidate_chars(),
            recent_write_cache_size: d_recent_write_cache_size(),
        }
    }
}

// ── Graph database ────────────────────────────────────────────────

/// Graph database connection (HTTP transaction endpoint). Empty
/// `http_url` means no external graph; the in-memory store is used.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    #[serde(default)]
    pub http_url: String,
    #[serde(default = "d_database")]
    pub database: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            http_url: String::new(),
            database: d_database(),
            username: String::new(),
            password: String::new(),
        }
    }
}

// ── Warm layer (clustering) ───────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarmLayerConfig {
    /// Cosine similarity threshold; DBSCAN eps = 1 − threshold.
    #[serde(default = "d_clustering_threshold")]
    pub clustering_threshold: f32,
    #[serde(default = "d_min_cluster_size")]
    pub min_cluster_size: usize,
    #[serde(default = "d_embedding_model")]
    pub embedding_model: String,
    /// Cluster after this many messages since the last run.
    #[serde(default = "d_cluster_every_messages")]
    pub cluster_every_messages: u64,
    #[serde(default = "d_cluster_min_interval_s")]
    pub cluster_min_interval_s: u64,
    /// Idle-triggered clustering: after this many quiet seconds...
    #[serde(default = "d_idle_cluster_delay_s")]
    pub idle_cluster_delay_s: u64,
    /// ...with at least this many unclustered messages pending.
    #[serde(default = "d_idle_cluster_min_messages")]
    pub idle_cluster_min_messages: u64,
}

impl Default for WarmLayerConfig {
    fn default() -> Self {
        Self {
            clustering_threshold: d_clustering_threshold(),
            min_cluster_size: d_min_cluster_size(),
            embedding_model: d_embedding_model(),
            cluster_every_messages: d_cluster_every_messages(),
            cluster_min_interval_s: d_cluster_min_interval_s(),
            idle_cluster_delay_s: d_idle_cluster_delay_s(),
            idle_cluster_min_messages: d_idle_cluster_min_messages(),
        }
    }
}

// ── Cold layer (summaries) ────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColdLayerConfig {
    /// Summarize once a session holds this many layer-0 messages.
    #[serde(default = "d_compression_threshold")]
    pub compression_threshold: usize,
    #[serde(default = "d_max_summary_length")]
    pub max_summary_length: u32,
    /// Summary model override; empty means the memory API model.
    #[serde(default)]
    pub summary_model: String,
}

impl Default for ColdLayerConfig {
    fn default() -> Self {
        Self {
            compression_threshold: d_compression_threshold(),
            max_summary_length: d_max_summary_length(),
            summary_model: String::new(),
        }
    }
}

// ── Forgetting ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForgettingConfig {
    #[serde(default = "d_decay_interval_s")]
    pub decay_interval_s: u64,
    /// Layer-0 non-message nodes below this importance are deleted.
    #[serde(default = "d_min_importance")]
    pub min_importance: f64,
    #[serde(default = "d_cleanup_batch")]
    pub cleanup_batch: usize,
    /// Run cleanup every N messages per session.
    #[serde(default = "d_cleanup_every_messages")]
    pub cleanup_every_messages: u64,
}

impl Default for ForgettingConfig {
    fn default() -> Self {
        Self {
            decay_interval_s: d_decay_interval_s(),
            min_importance: d_min_importance(),
            cleanup_batch: d_cleanup_batch(),
            cleanup_every_messages: d_cleanup_every_messages(),
        }
    }
}

// ── Defaults ──────────────────────────────────────────────────────

fn d_true() -> bool {
    true
}

fn d_min_query_chars() -> usize {
    6
}

fn d_max_query_chars() -> usize {
    4000
}

fn d_min_user_chars() -> usize {
    4
}

fn d_min_assistant_chars_for_short_user() -> usize {
    20
}

fn d_max_combined_chars() -> usize {
    8000
}

fn d_min_candidate_chars() -> usize {
    8
}

fn d_recent_write_cache_size() -> usize {
    2000
}

fn d_database() -> String {
    "neo4j".into()
}

fn d_clustering_threshold() -> f32 {
    0.7
}

fn d_min_cluster_size() -> usize {
    3
}

fn d_embedding_model() -> String {
    "text-embedding-3-small".into()
}

fn d_cluster_every_messages() -> u64 {
    12
}

fn d_cluster_min_interval_s() -> u64 {
    300
}

fn d_idle_cluster_delay_s() -> u64 {
    120
}

fn d_idle_cluster_min_messages() -> u64 {
    2
}

fn d_compression_threshold() -> usize {
    50
}

fn d_max_summary_length() -> u32 {
    500
}

fn d_decay_interval_s() -> u64 {
    86_400
}

fn d_min_importance() -> f64 {
    0.15
}

fn d_cleanup_batch() -> usize {
    100
}

fn d_cleanup_every_messages() -> u64 {
    100
}
