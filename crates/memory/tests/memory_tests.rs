//! Write-path, dedupe, scoping, recall, and clustering tests over the
//! in-memory graph store.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use pv_domain::chat::ChatMessage;
use pv_domain::config::MemoryConfig;
use pv_domain::error::Result;
use pv_events::{EventBus, EventType};
use pv_memory::{
    ColdLayer, ForgettingManager, GraphStore, HotLayer, LlmExtractor, MemGraph, MemoryService,
    MemoryStore, WarmLayer,
};
use pv_providers::{ChatClient, ChatOptions, ChatOutcome, EmbeddingClient, Usage};

// ── Fakes ─────────────────────────────────────────────────────────

/// Routes calls on the system prompt: extraction, classification, or
/// summarization.
struct FakeChat;

#[async_trait]
impl ChatClient for FakeChat {
    async fn chat(&self, messages: &[ChatMessage], _opts: &ChatOptions) -> Result<ChatOutcome> {
        let system = messages.first().map(|m| m.content.as_str()).unwrap_or("");
        let user = messages.last().map(|m| m.content.as_str()).unwrap_or("");

        let content = if system.contains("memory classifier") {
            // Candidate content = the [USER_INPUT] section verbatim.
            let input = user
                .split("[USER_INPUT]\n")
                .nth(1)
                .and_then(|rest| rest.split("\n\n[ASSISTANT_OUTPUT]").next())
                .unwrap_or("")
                .trim();
            format!(
                r#"{{"has_long_term_state": true, "candidates": [
                    {{"type": "preference", "content": "{input}", "semantic_keys": ["coffee"]}}
                ]}}"#
            )
        } else if system.contains("information extraction") {
            r#"{"facts": [], "entities": ["coffee"], "time_expressions": [], "locations": [], "keywords": ["coffee"]}"#
                .to_string()
        } else {
            "A short summary.".to_string()
        };

        Ok(ChatOutcome {
            content,
            usage: Usage::default(),
        })
    }
}

struct FakeEmbeddings;

#[async_trait]
impl EmbeddingClient for FakeEmbeddings {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Ok(vec![1.0, 0.0, 0.0])
    }
}

fn memory_config() -> MemoryConfig {
    let mut config = MemoryConfig::default();
    config.enabled = true;
    config
}

fn build_service(graph: Arc<MemGraph>, bus: Arc<EventBus>) -> Arc<MemoryService> {
    let store: Arc<dyn GraphStore> = graph;
    let chat: Arc<dyn ChatClient> = Arc::new(FakeChat);
    let embeddings: Arc<dyn EmbeddingClient> = Arc::new(FakeEmbeddings);
    let config = memory_config();

    let hot = HotLayer::new(store.clone(), LlmExtractor::new(chat.clone(), None));
    let warm = WarmLayer::new(store.clone(), embeddings, config.warm_layer.clone());
    let cold = ColdLayer::new(store.clone(), chat.clone(), config.cold_layer.clone());
    let forgetting = ForgettingManager::new(store.clone(), config.forgetting.clone());

    let memory_store = Arc::new(MemoryStore::new(
        store,
        hot,
        warm,
        cold,
        forgetting,
        config.clone(),
    ));
    Arc::new(MemoryService::new(memory_store, bus, chat, config))
}

fn interaction(session_id: &str, user_id: &str, user_input: &str) -> Value {
    serde_json::json!({
        "session_id": session_id,
        "user_id": user_id,
        "channel": "web",
        "user_input": user_input,
        "assistant_output": "Noted, I'll remember that about your coffee taste.",
    })
}

async fn message_count(service: &MemoryService) -> usize {
    service
        .store()
        .stats()
        .await
        .unwrap()
        .nodes_by_type
        .get("Message")
        .copied()
        .unwrap_or(0)
}

// ── Tests ─────────────────────────────────────────────────────────

#[tokio::test]
async fn interaction_writes_one_memory_item() {
    let bus = Arc::new(EventBus::new());
    let service = build_service(Arc::new(MemGraph::new()), bus.clone());

    service
        .handle_interaction(interaction("s1", "alice", "I really like dark roast coffee"))
        .await;

    assert_eq!(message_count(&service).await, 1);
    let saved = bus.get_history(Some(EventType::MemorySaved), 10);
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].payload["memory_type"], "preference");
}

#[tokio::test]
async fn recent_write_cache_skips_duplicates() {
    let bus = Arc::new(EventBus::new());
    let service = build_service(Arc::new(MemGraph::new()), bus);

    let payload = interaction("s1", "alice", "I really like dark roast coffee");
    service.handle_interaction(payload.clone()).await;
    service.handle_interaction(payload).await;

    assert_eq!(message_count(&service).await, 1);
}

#[tokio::test]
async fn graph_dedupe_survives_cache_loss() {
    let graph = Arc::new(MemGraph::new());
    let bus = Arc::new(EventBus::new());

    let first = build_service(graph.clone(), bus.clone());
    first
        .handle_interaction(interaction("s1", "alice", "I really like dark roast coffee"))
        .await;
    assert_eq!(message_count(&first).await, 1);

    // A fresh service (empty recent-write cache) over the same graph
    // still skips the exact duplicate.
    let second = build_service(graph, bus);
    second
        .handle_interaction(interaction("s2", "alice", "I really like dark roast coffee"))
        .await;
    assert_eq!(message_count(&second).await, 1);
}

#[tokio::test]
async fn semantic_match_with_changed_content_writes() {
    let graph = Arc::new(MemGraph::new());
    let bus = Arc::new(EventBus::new());
    let service = build_service(graph, bus);

    service
        .handle_interaction(interaction("s1", "alice", "I really like dark roast coffee"))
        .await;
    // Same semantic key ("coffee"), different content = state change.
    service
        .handle_interaction(interaction("s1", "alice", "Actually I now prefer light roast coffee"))
        .await;

    assert_eq!(message_count(&service).await, 2);
}

#[tokio::test]
async fn memory_graph_is_user_scoped() {
    let graph = Arc::new(MemGraph::new());
    let bus = Arc::new(EventBus::new());
    let service = build_service(graph, bus);

    service
        .handle_interaction(interaction("s1", "alice", "I really like dark roast coffee"))
        .await;

    let alice_view = service.memory_graph("s1", Some("alice")).await;
    assert!(alice_view["stats"]["total_nodes"].as_u64().unwrap() > 0);

    let bob_view = service.memory_graph("s1", Some("bob")).await;
    assert_eq!(bob_view["stats"]["total_nodes"], 0);
    assert_eq!(bob_view["nodes"].as_array().unwrap().len(), 0);
    assert_eq!(bob_view["edges"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn recall_returns_cross_session_context_for_owner() {
    let graph = Arc::new(MemGraph::new());
    let bus = Arc::new(EventBus::new());
    let service = build_service(graph, bus);

    service
        .handle_interaction(interaction("s1", "alice", "I really like dark roast coffee"))
        .await;

    let context = service
        .get_context("what kind of coffee do I like", "s1", Some("alice"))
        .await;
    assert!(context.contains("dark roast coffee"), "context: {context}");

    // Another user recalls nothing from alice's memory.
    let foreign = service
        .get_context("what kind of coffee do I like", "s1", Some("bob"))
        .await;
    assert!(foreign.is_empty(), "foreign context: {foreign}");
}

#[tokio::test]
async fn clustering_below_min_size_creates_nothing() {
    let graph = Arc::new(MemGraph::new());
    let bus = Arc::new(EventBus::new());
    let service = build_service(graph, bus);

    // One interaction produces a single entity ("coffee"), below the
    // default min_cluster_size of 3.
    service
        .handle_interaction(interaction("s1", "alice", "I really like dark roast coffee"))
        .await;

    let result = service.cluster_entities("s1", Some("alice")).await;
    assert_eq!(result["concepts_created"], 0);
    assert_eq!(result["total_concepts"], 0);
}
