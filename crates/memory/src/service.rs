//! The gateway memory facade.
//!
//! A passive listener of full-turn `interaction.completed` events: the
//! LLM only nominates long-term state candidates, the final write
//! decision is code-driven (write filters, recent-write cache, and
//! graph-level dedupe). Also serves the `memory.*` operations of the
//! method table, all user-scoped.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use sha2::{Digest, Sha256};

use pv_domain::chat::ChatMessage;
use pv_domain::config::MemoryConfig;
use pv_events::{EventBus, EventType};
use pv_providers::{json_extract, ChatClient, ChatOptions};

use crate::hot::normalize_content;
use crate::scope::{resolve_owned_session_id, scoped_session_id, user_node_id};
use crate::store::MemoryStore;

const CLASSIFIER_PROMPT: &str = "You are a strict memory classifier. Input is one completed \
interaction (user input + assistant output). Ignore tool logs and execution traces. Find only \
durable user or project state worth long-term memory.\n\
Allowed types: goal, preference, constraint, identity, project_state.\n\
Return strict JSON with this schema:\n\
{\"has_long_term_state\": true|false, \
\"candidates\": [{\"type\": \"...\", \"content\": \"...\", \"semantic_keys\": [\"...\"]}]}\n\
Rules:\n\
- If no durable state, return has_long_term_state=false and empty candidates.\n\
- Keep each content concise and factual.\n\
- semantic_keys should include cross-lingual equivalents when obvious.\n\
- semantic_keys should be lower-case normalized concepts, not long sentences.\n\
- Do not include temporary tool/output details.";

const ALLOWED_TYPES: [&str; 5] = ["goal", "preference", "constraint", "identity", "project_state"];

#[derive(Debug, Clone, PartialEq)]
pub struct WriteCandidate {
    pub memory_type: String,
    pub content: String,
    pub semantic_keys: Vec<String>,
}

/// Bounded recent-write cache: skip candidates written moments ago
/// before touching the graph at all.
struct RecentWrites {
    order: VecDeque<String>,
    index: HashSet<String>,
    limit: usize,
}

impl RecentWrites {
    fn new(limit: usize) -> Self {
        Self {
            order: VecDeque::new(),
            index: HashSet::new(),
            limit,
        }
    }

    fn contains(&self, key: &str) -> bool {
        self.index.contains(key)
    }

    fn remember(&mut self, key: String) {
        if self.index.contains(&key) {
            return;
        }
        self.index.insert(key.clone());
        self.order.push_back(key);
        while self.order.len() > self.limit {
            if let Some(old) = self.order.pop_front() {
                self.index.remove(&old);
            }
        }
    }
}

pub struct MemoryService {
    store: Arc<MemoryStore>,
    bus: Arc<EventBus>,
    classifier: Arc<dyn ChatClient>,
    classifier_model: Option<String>,
    config: MemoryConfig,
    recent_writes: Mutex<RecentWrites>,
}

impl MemoryService {
    pub fn new(
        store: Arc<MemoryStore>,
        bus: Arc<EventBus>,
        classifier: Arc<dyn ChatClient>,
        config: MemoryConfig,
    ) -> Self {
        let classifier_model = if config.api.use_main_api || config.api.model.is_empty() {
            None
        } else {
            Some(config.api.model.clone())
        };
        let recent_writes = RecentWrites::new(config.gating.dedupe.recent_write_cache_size);
        Self {
            store,
            bus,
            classifier,
            classifier_model,
            config,
            recent_writes: Mutex::new(recent_writes),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_enabled()
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// Register the interaction listener on the bus.
    pub fn subscribe(self: &Arc<Self>) {
        let this = self.clone();
        self.bus
            .on(EventType::InteractionCompleted, "memory-service", move |record| {
                let this = this.clone();
                async move {
                    this.handle_interaction(record.payload).await;
                }
            });
        tracing::debug!("memory service subscribed to event bus");
    }

    // ── Write path ────────────────────────────────────────────────

    pub async fn handle_interaction(&self, payload: Value) {
        if !self.is_enabled() {
            return;
        }

        let session_id = payload
            .get("session_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let user_id = payload
            .get("user_id")
            .and_then(Value::as_str)
            .filter(|u| !u.trim().is_empty())
            .unwrap_or("default_user")
            .to_string();
        let channel = payload
            .get("channel")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let user_input = payload
            .get("user_input")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();
        let assistant_output = payload
            .get("assistant_output")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();

        if session_id.is_empty() || (user_input.is_empty() && assistant_output.is_empty()) {
            return;
        }

        let classification = self
            .classify_interaction(&user_input, &assistant_output)
            .await;
        if classification.is_empty() {
            return;
        }

        let mut saved = 0usize;
        for candidate in classification {
            if !self.should_write_candidate(&user_id, &candidate) {
                continue;
            }
            if !self.graph_state_changed(&user_id, &candidate).await {
                continue;
            }

            let metadata = serde_json::json!({
                "memory_type": candidate.memory_type,
                "semantic_keys": candidate.semantic_keys,
                "memory_source": "interaction.completed",
            });
            let ok = self
                .store
                .add_message(&session_id, "user", &candidate.content, &user_id, Some(metadata))
                .await;
            if !ok {
                continue;
            }

            let write_key = make_write_key(&user_id, &candidate.memory_type, &candidate.content);
            self.recent_writes.lock().remember(write_key);
            self.store.on_message_saved(&session_id, "user", &user_id);
            saved += 1;

            self.bus
                .emit(
                    EventType::MemorySaved,
                    serde_json::json!({
                        "session_id": session_id,
                        "user_id": user_id,
                        "channel": channel,
                        "source": "interaction.completed",
                        "memory_type": candidate.memory_type,
                        "semantic_keys": candidate.semantic_keys,
                        "content_length": candidate.content.chars().count(),
                    }),
                )
                .await;
        }

        if saved > 0 {
            tracing::info!(saved, session_id = %session_id, "saved memory items from interaction");
        }
    }

    /// Code-level gate in front of the classifier LLM.
    fn should_run_classifier(&self, user_text: &str, assistant_text: &str) -> bool {
        let filter = &self.config.gating.write_filter;
        if user_text.is_empty() {
            return false;
        }
        if user_text.chars().count() < filter.min_user_chars
            && assistant_text.chars().count() < filter.min_assistant_chars_for_short_user
        {
            return false;
        }
        let combined = user_text.chars().count() + 1 + assistant_text.chars().count();
        if combined > filter.max_combined_chars {
            return false;
        }
        true
    }

    async fn classify_interaction(
        &self,
        user_input: &str,
        assistant_output: &str,
    ) -> Vec<WriteCandidate> {
        if !self.should_run_classifier(user_input, assistant_output) {
            return Vec::new();
        }

        let query = format!("[USER_INPUT]\n{user_input}\n\n[ASSISTANT_OUTPUT]\n{assistant_output}\n");
        let messages = [
            ChatMessage::system(CLASSIFIER_PROMPT),
            ChatMessage::user(query),
        ];
        let opts = ChatOptions {
            model: self.classifier_model.clone(),
            temperature: Some(0.2),
            max_tokens: Some(500),
            json_mode: false,
        };

        match self.classifier.chat(&messages, &opts).await {
            Ok(outcome) => {
                let Some(parsed) = json_extract(&outcome.content) else {
                    return Vec::new();
                };
                if !parsed
                    .get("has_long_term_state")
                    .and_then(Value::as_bool)
                    .unwrap_or(false)
                {
                    return Vec::new();
                }
                normalize_candidates(parsed.get("candidates"))
            }
            Err(e) => {
                tracing::debug!(error = %e, "classifier unavailable, using heuristic");
                heuristic_classify(user_input, assistant_output)
            }
        }
    }

    fn should_write_candidate(&self, user_id: &str, candidate: &WriteCandidate) -> bool {
        let normalized = normalize_content(&candidate.content);
        if normalized.chars().count() < self.config.gating.dedupe.min_candidate_chars {
            return false;
        }
        let key = make_write_key(user_id, &candidate.memory_type, &normalized);
        !self.recent_writes.lock().contains(&key)
    }

    /// Graph-level dedupe: exact duplicate skips; a semantic match
    /// whose contents all differ is a state change (write); no match
    /// writes. Graph failures default to writing.
    async fn graph_state_changed(&self, user_id: &str, candidate: &WriteCandidate) -> bool {
        let graph = self.store.graph();
        let normalized = normalize_content(&candidate.content);

        match graph.user_message_exists(user_id, &normalized).await {
            Ok(true) => return false,
            Ok(false) => {}
            Err(e) => {
                tracing::debug!(error = %e, "graph dedupe failed, allowing write");
                return true;
            }
        }

        if !candidate.semantic_keys.is_empty() {
            match graph
                .messages_for_semantic_keys(&user_node_id(Some(user_id)), &candidate.semantic_keys, 5)
                .await
            {
                Ok(contents) => {
                    for previous in &contents {
                        if normalize_content(previous) == normalized {
                            return false;
                        }
                    }
                    if !contents.is_empty() {
                        return true;
                    }
                }
                Err(e) => {
                    tracing::debug!(error = %e, "semantic dedupe failed, allowing write");
                    return true;
                }
            }
        }

        true
    }

    // ── Read path ─────────────────────────────────────────────────

    pub async fn get_context(&self, query: &str, session_id: &str, user_id: Option<&str>) -> String {
        if !self.is_enabled() {
            return String::new();
        }
        let user_id = user_id.unwrap_or("default_user");
        let context = self.store.get_context(query, session_id, user_id).await;
        if !context.is_empty() {
            self.bus
                .emit(
                    EventType::MemoryRecalled,
                    serde_json::json!({
                        "session_id": session_id,
                        "user_id": user_id,
                        "query": query,
                        "context_length": context.chars().count(),
                    }),
                )
                .await;
        }
        context
    }

    // ── Maintenance operations (method table) ─────────────────────

    pub async fn cluster_entities(&self, session_id: &str, user_id: Option<&str>) -> Value {
        if !self.is_enabled() {
            return serde_json::json!({"concepts_created": 0, "total_concepts": 0, "concepts": []});
        }
        let scoped = scoped_session_id(session_id, user_id);
        let node_id = format!("session_{scoped}");

        let created = match self.store.warm().cluster_entities(&node_id).await {
            Ok(created) => created,
            Err(e) => {
                tracing::error!(error = %e, "clustering failed");
                0
            }
        };
        let concepts = self.store.warm().get_concepts(&node_id).await.unwrap_or_default();

        self.bus
            .emit(
                EventType::MemoryClustered,
                serde_json::json!({
                    "session_id": session_id,
                    "memory_session_id": scoped,
                    "user_id": user_id,
                    "concepts_created": created,
                    "total_concepts": concepts.len(),
                }),
            )
            .await;

        serde_json::json!({
            "concepts_created": created,
            "total_concepts": concepts.len(),
            "concepts": concepts,
        })
    }

    pub async fn summarize_session(
        &self,
        session_id: &str,
        user_id: Option<&str>,
        incremental: bool,
    ) -> Value {
        if !self.is_enabled() {
            return serde_json::json!({"status": "skipped", "message": "Memory system not enabled"});
        }
        let scoped = scoped_session_id(session_id, user_id);
        let node_id = format!("session_{scoped}");

        let should = self
            .store
            .cold()
            .should_create_summary(&node_id)
            .await
            .unwrap_or(false);
        if !should {
            return serde_json::json!({
                "status": "skipped",
                "message": "Not enough messages or summary exists",
            });
        }

        let result = if incremental {
            self.store.cold().create_incremental_summary(&node_id).await
        } else {
            self.store.cold().summarize_session(&node_id).await
        };

        match result {
            Ok(Some(summary_id)) => {
                let summaries = self.store.cold().get_summaries(&node_id).await.unwrap_or_default();
                let summary = summaries.iter().find(|s| s.id == summary_id).cloned();
                self.bus
                    .emit(
                        EventType::MemorySummarized,
                        serde_json::json!({
                            "session_id": session_id,
                            "memory_session_id": scoped,
                            "user_id": user_id,
                            "summary_id": summary_id,
                            "incremental": incremental,
                        }),
                    )
                    .await;
                serde_json::json!({
                    "session_id": session_id,
                    "memory_session_id": scoped,
                    "summary_id": summary_id,
                    "summary": summary,
                })
            }
            Ok(None) => serde_json::json!({
                "status": "skipped",
                "message": "Not enough messages or summary exists",
            }),
            Err(e) => serde_json::json!({"status": "error", "message": e.to_string()}),
        }
    }

    pub async fn apply_decay(&self, session_id: &str, user_id: Option<&str>) -> Value {
        if !self.is_enabled() {
            return serde_json::json!({"status": "skipped", "message": "Memory system not enabled"});
        }
        let node_id = format!("session_{}", scoped_session_id(session_id, user_id));
        match self.store.forgetting().apply_time_decay(&node_id).await {
            Ok(report) => report,
            Err(e) => serde_json::json!({"status": "error", "message": e.to_string()}),
        }
    }

    pub async fn cleanup_forgotten(&self, session_id: &str, user_id: Option<&str>) -> Value {
        if !self.is_enabled() {
            return serde_json::json!({"status": "skipped", "message": "Memory system not enabled"});
        }
        let node_id = format!("session_{}", scoped_session_id(session_id, user_id));
        match self.store.forgetting().cleanup_forgotten(&node_id).await {
            Ok(report) => report,
            Err(e) => serde_json::json!({"status": "error", "message": e.to_string()}),
        }
    }

    /// Session graph for visualization — strictly user-scoped: a
    /// session the requesting user does not own yields an empty graph.
    pub async fn memory_graph(&self, session_id: &str, user_id: Option<&str>) -> Value {
        let empty = serde_json::json!({
            "nodes": [],
            "edges": [],
            "stats": {"total_nodes": 0, "total_edges": 0},
        });
        if !self.is_enabled() {
            return empty;
        }

        let graph = self.store.graph();
        let owned = match resolve_owned_session_id(graph.as_ref(), session_id, user_id).await {
            Ok(Some(owned)) => owned,
            _ => return empty,
        };

        match graph.session_graph(&format!("session_{owned}")).await {
            Ok((nodes, edges)) => serde_json::json!({
                "stats": {"total_nodes": nodes.len(), "total_edges": edges.len()},
                "nodes": nodes,
                "edges": edges,
            }),
            Err(e) => {
                tracing::error!(error = %e, "memory graph query failed");
                empty
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Candidate normalization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub(crate) fn make_write_key(user_id: &str, memory_type: &str, content: &str) -> String {
    let normalized = normalize_content(content);
    let raw = format!("{user_id}|{memory_type}|{normalized}");
    hex::encode(Sha256::digest(raw.as_bytes()))
}

/// Tokenize normalized content into CJK runs and latin/digit tokens
/// (underscore-split), keeping tokens of at least two characters.
pub(crate) fn extract_tokens(text: &str) -> Vec<String> {
    let cleaned = normalize_content(text);
    if cleaned.is_empty() {
        return Vec::new();
    }
    static TOKEN_RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let pattern = TOKEN_RE.get_or_init(|| {
        regex::Regex::new(r"[一-鿿]+|[a-z0-9_]+").expect("static pattern")
    });
    let mut tokens = Vec::new();
    for chunk in pattern.find_iter(&cleaned) {
        let chunk = chunk.as_str();
        if chunk.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            tokens.extend(chunk.split('_').filter(|p| !p.is_empty()).map(str::to_string));
        } else {
            tokens.push(chunk.to_string());
        }
    }
    tokens
}

/// Merge LLM-supplied keys with tokenized content keys, normalized
/// and deduplicated.
pub(crate) fn build_semantic_keys(content: &str, llm_keys: Option<&Value>) -> Vec<String> {
    let mut keys: HashSet<String> = HashSet::new();
    if let Some(Value::Array(items)) = llm_keys {
        for item in items {
            if let Some(key) = item.as_str() {
                let normalized = normalize_content(key);
                if !normalized.is_empty() {
                    keys.insert(normalized);
                }
            }
        }
    }
    for token in extract_tokens(content) {
        if token.chars().count() >= 2 {
            keys.insert(token);
        }
    }
    let mut sorted: Vec<String> = keys.into_iter().collect();
    sorted.sort();
    sorted
}

pub(crate) fn normalize_candidates(candidates: Option<&Value>) -> Vec<WriteCandidate> {
    let Some(Value::Array(items)) = candidates else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let raw_type = item
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .trim()
                .to_lowercase();
            let content = item
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .trim()
                .to_string();
            if !ALLOWED_TYPES.contains(&raw_type.as_str()) || content.is_empty() {
                return None;
            }
            let semantic_keys = build_semantic_keys(&content, item.get("semantic_keys"));
            Some(WriteCandidate {
                memory_type: raw_type,
                content,
                semantic_keys,
            })
        })
        .collect()
}

/// Conservative fallback when the classifier LLM is unavailable: scan
/// for marker phrases and emit at most one candidate.
pub(crate) fn heuristic_classify(user_input: &str, assistant_output: &str) -> Vec<WriteCandidate> {
    let text = format!("{user_input}\n{assistant_output}").to_lowercase();
    let hints: [(&str, &[&str]); 5] = [
        ("preference", &["prefer", "like"]),
        ("constraint", &["must", "cannot", "deadline"]),
        ("goal", &["goal", "plan to"]),
        ("identity", &["i am", "my name is"]),
        ("project_state", &["project", "milestone", "release"]),
    ];
    for (memory_type, markers) in hints {
        if markers.iter().any(|m| text.contains(m)) {
            return vec![WriteCandidate {
                memory_type: memory_type.to_string(),
                content: user_input.trim().to_string(),
                semantic_keys: build_semantic_keys(user_input, None),
            }];
        }
    }
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_key_is_stable_under_normalization() {
        let a = make_write_key("u1", "preference", "I like  Coffee ");
        let b = make_write_key("u1", "preference", "i like coffee");
        assert_eq!(a, b);
        assert_ne!(a, make_write_key("u2", "preference", "i like coffee"));
        assert_ne!(a, make_write_key("u1", "goal", "i like coffee"));
    }

    #[test]
    fn tokens_split_cjk_runs_and_latin_words() {
        let tokens = extract_tokens("I like 苹果 and rust_lang v2");
        assert!(tokens.contains(&"like".to_string()));
        assert!(tokens.contains(&"苹果".to_string()));
        assert!(tokens.contains(&"rust".to_string()));
        assert!(tokens.contains(&"lang".to_string()));
    }

    #[test]
    fn semantic_keys_merge_llm_and_tokens() {
        let llm = serde_json::json!(["Apple", "苹果"]);
        let keys = build_semantic_keys("I like apple pie", Some(&llm));
        assert!(keys.contains(&"apple".to_string()));
        assert!(keys.contains(&"苹果".to_string()));
        assert!(keys.contains(&"pie".to_string()));
        // Single-char tokens are dropped.
        assert!(!keys.contains(&"i".to_string()));
    }

    #[test]
    fn candidates_filter_unknown_types() {
        let raw = serde_json::json!([
            {"type": "preference", "content": "likes dark roast", "semantic_keys": ["coffee"]},
            {"type": "gossip", "content": "nope"},
            {"type": "goal", "content": ""},
        ]);
        let candidates = normalize_candidates(Some(&raw));
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].memory_type, "preference");
        assert!(candidates[0].semantic_keys.contains(&"coffee".to_string()));
    }

    #[test]
    fn heuristic_matches_first_hint_only() {
        let candidates = heuristic_classify("I prefer tea over coffee", "noted");
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].memory_type, "preference");

        assert!(heuristic_classify("hello there", "hi").is_empty());
    }

    #[test]
    fn recent_writes_evicts_oldest() {
        let mut cache = RecentWrites::new(2);
        cache.remember("a".into());
        cache.remember("b".into());
        cache.remember("c".into());
        assert!(!cache.contains("a"));
        assert!(cache.contains("b"));
        assert!(cache.contains("c"));
    }
}
