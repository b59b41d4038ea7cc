//! In-memory `GraphStore`.
//!
//! Backs the test suite and serves as the fallback store when no
//! graph database is configured. Implements the same invariants as
//! the Cypher implementation: MERGE-by-id with access-count bump,
//! content dedupe per node kind, and user-scoped session ownership.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use serde_json::Value;

use pv_domain::error::Result;

use crate::graph::{
    ConceptRow, DecayRow, GraphNode, GraphRelation, GraphStats, GraphStore, MessageRow, NodeKind,
    RecallItem, RecallLayers, RelationKind, SummaryRow,
};

#[derive(Default)]
struct State {
    nodes: HashMap<String, GraphNode>,
    relations: Vec<GraphRelation>,
}

impl State {
    fn targets(&self, source_id: &str, kind: RelationKind) -> Vec<String> {
        self.relations
            .iter()
            .filter(|r| r.kind == kind && r.source_id == source_id)
            .map(|r| r.target_id.clone())
            .collect()
    }

    fn sources(&self, target_id: &str, kind: RelationKind) -> Vec<String> {
        self.relations
            .iter()
            .filter(|r| r.kind == kind && r.target_id == target_id)
            .map(|r| r.source_id.clone())
            .collect()
    }

    /// Undirected neighbors over a set of relation kinds.
    fn neighbors(&self, id: &str, kinds: &[RelationKind]) -> Vec<String> {
        self.relations
            .iter()
            .filter(|r| kinds.contains(&r.kind))
            .filter_map(|r| {
                if r.source_id == id {
                    Some(r.target_id.clone())
                } else if r.target_id == id {
                    Some(r.source_id.clone())
                } else {
                    None
                }
            })
            .collect()
    }

    /// Is this message part of a session owned by the given user?
    fn message_owned_by(&self, message_id: &str, user_node_id: &str) -> bool {
        self.targets(message_id, RelationKind::PartOfSession)
            .iter()
            .any(|session_id| {
                self.targets(session_id, RelationKind::OwnedBy)
                    .iter()
                    .any(|owner| owner == user_node_id)
            })
    }

    fn recall_item(&self, message: &GraphNode, via: Option<String>) -> RecallItem {
        RecallItem {
            content: message.content.clone(),
            time: message.created_at,
            importance: message.importance,
            via,
        }
    }

    /// Message nodes a set of entity contents link to, user-scoped.
    fn messages_via_entities(
        &self,
        entity_contents: &[String],
        user_node_id: &str,
    ) -> Vec<(String, String)> {
        let mut hits = Vec::new();
        for node in self.nodes.values() {
            if node.kind != NodeKind::Entity || !entity_contents.contains(&node.content) {
                continue;
            }
            for message_id in self.targets(&node.id, RelationKind::FromMessage) {
                if self.message_owned_by(&message_id, user_node_id) {
                    hits.push((message_id, node.content.clone()));
                }
            }
        }
        hits
    }
}

/// In-memory graph store.
#[derive(Default)]
pub struct MemGraph {
    state: Mutex<State>,
}

impl MemGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_count(&self) -> usize {
        self.state.lock().nodes.len()
    }
}

#[async_trait]
impl GraphStore for MemGraph {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn ensure_node(&self, node: GraphNode) -> Result<String> {
        let mut state = self.state.lock();
        let id = node.id.clone();
        match state.nodes.get_mut(&id) {
            Some(existing) => {
                existing.access_count += 1;
                for (key, value) in node.properties {
                    existing.properties.insert(key, value);
                }
            }
            None => {
                state.nodes.insert(id.clone(), node);
            }
        }
        Ok(id)
    }

    async fn create_relation(&self, relation: GraphRelation) -> Result<()> {
        let mut state = self.state.lock();
        let duplicate = state.relations.iter().any(|r| {
            r.kind == relation.kind
                && r.source_id == relation.source_id
                && r.target_id == relation.target_id
        });
        if !duplicate {
            state.relations.push(relation);
        }
        Ok(())
    }

    async fn find_node_by_content(&self, kind: NodeKind, content: &str) -> Result<Option<String>> {
        let state = self.state.lock();
        Ok(state
            .nodes
            .values()
            .find(|n| n.kind == kind && n.content == content)
            .map(|n| n.id.clone()))
    }

    async fn set_importance(&self, id: &str, importance: f64) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(node) = state.nodes.get_mut(id) {
            node.importance = importance;
        }
        Ok(())
    }

    async fn set_embedding(&self, id: &str, embedding: &[f32]) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(node) = state.nodes.get_mut(id) {
            node.embedding = Some(embedding.to_vec());
        }
        Ok(())
    }

    async fn user_message_exists(&self, user_id: &str, normalized_content: &str) -> Result<bool> {
        let state = self.state.lock();
        Ok(state.nodes.values().any(|n| {
            n.kind == NodeKind::Message
                && n.properties.get("role").and_then(Value::as_str) == Some("user")
                && n.properties.get("user_id").and_then(Value::as_str) == Some(user_id)
                && n.content.trim().to_lowercase() == normalized_content
        }))
    }

    async fn messages_for_semantic_keys(
        &self,
        user_node_id: &str,
        keys: &[String],
        limit: usize,
    ) -> Result<Vec<String>> {
        let state = self.state.lock();
        let mut rows: Vec<(chrono::DateTime<Utc>, String)> = state
            .messages_via_entities(keys, user_node_id)
            .into_iter()
            .filter_map(|(message_id, _)| {
                let node = state.nodes.get(&message_id)?;
                if node.properties.get("role").and_then(Value::as_str) == Some("user") {
                    Some((node.created_at, node.content.clone()))
                } else {
                    None
                }
            })
            .collect();
        rows.sort_by(|a, b| b.0.cmp(&a.0));
        rows.dedup_by(|a, b| a.1 == b.1);
        Ok(rows.into_iter().take(limit).map(|(_, c)| c).collect())
    }

    async fn three_layer_recall(
        &self,
        entities: &[String],
        user_node_id: &str,
        session_node_id: &str,
        recent_days: i64,
    ) -> Result<RecallLayers> {
        let state = self.state.lock();
        let mut layers = RecallLayers::default();

        // Layer 1: direct entity hits, cross-session, user-scoped.
        let mut seen_direct = HashSet::new();
        for (message_id, _) in state.messages_via_entities(entities, user_node_id) {
            if let Some(message) = state.nodes.get(&message_id) {
                if seen_direct.insert(message_id) {
                    layers.direct.push(state.recall_item(message, None));
                }
            }
        }

        // Layer 2: two hops via actions.
        let action_kinds = [RelationKind::SubjectOf, RelationKind::ObjectOf];
        let mut seen_related = HashSet::new();
        for entity in state.nodes.values() {
            if entity.kind != NodeKind::Entity || !entities.contains(&entity.content) {
                continue;
            }
            for action_id in state.neighbors(&entity.id, &action_kinds) {
                let Some(action) = state.nodes.get(&action_id) else {
                    continue;
                };
                if action.kind != NodeKind::Action {
                    continue;
                }
                for related_id in state.neighbors(&action_id, &action_kinds) {
                    let Some(related) = state.nodes.get(&related_id) else {
                        continue;
                    };
                    if related.kind != NodeKind::Entity || related.content == entity.content {
                        continue;
                    }
                    for message_id in state.targets(&related_id, RelationKind::FromMessage) {
                        if !state.message_owned_by(&message_id, user_node_id) {
                            continue;
                        }
                        if let Some(message) = state.nodes.get(&message_id) {
                            if seen_related.insert(message_id.clone()) {
                                layers
                                    .related
                                    .push(state.recall_item(message, Some(related.content.clone())));
                            }
                        }
                    }
                }
            }
        }

        // Layer 3: recent window, current session only.
        let cutoff = Utc::now() - Duration::days(recent_days);
        for message_id in state.sources(session_node_id, RelationKind::PartOfSession) {
            let Some(message) = state.nodes.get(&message_id) else {
                continue;
            };
            if message.kind == NodeKind::Message && message.created_at > cutoff {
                layers.recent.push(state.recall_item(message, None));
            }
        }

        Ok(layers)
    }

    async fn session_entities(&self, session_node_id: &str) -> Result<Vec<GraphNode>> {
        let state = self.state.lock();
        let mut seen = HashSet::new();
        let mut entities = Vec::new();
        for message_id in state.sources(session_node_id, RelationKind::PartOfSession) {
            for entity_id in state.sources(&message_id, RelationKind::FromMessage) {
                if let Some(node) = state.nodes.get(&entity_id) {
                    if node.kind == NodeKind::Entity && node.layer == 0 && seen.insert(entity_id) {
                        entities.push(node.clone());
                    }
                }
            }
        }
        Ok(entities)
    }

    async fn session_messages(&self, session_node_id: &str, skip: usize) -> Result<Vec<MessageRow>> {
        let state = self.state.lock();
        let mut rows: Vec<MessageRow> = state
            .sources(session_node_id, RelationKind::PartOfSession)
            .iter()
            .filter_map(|id| state.nodes.get(id))
            .filter(|n| n.kind == NodeKind::Message && n.layer == 0)
            .map(|n| MessageRow {
                content: n.content.clone(),
                role: n
                    .properties
                    .get("role")
                    .and_then(Value::as_str)
                    .unwrap_or("user")
                    .to_string(),
                created_at: n.created_at,
            })
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(rows.into_iter().skip(skip).collect())
    }

    async fn session_concepts(&self, session_node_id: &str, limit: usize) -> Result<Vec<ConceptRow>> {
        let state = self.state.lock();
        let mut rows: Vec<ConceptRow> = state
            .sources(session_node_id, RelationKind::PartOfSession)
            .iter()
            .filter_map(|id| state.nodes.get(id))
            .filter(|n| n.kind == NodeKind::Concept)
            .map(|n| ConceptRow {
                id: n.id.clone(),
                content: n.content.clone(),
                importance: n.importance,
                entity_count: state.sources(&n.id, RelationKind::BelongsTo).len(),
            })
            .collect();
        rows.sort_by(|a, b| {
            b.importance
                .partial_cmp(&a.importance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        rows.truncate(limit);
        Ok(rows)
    }

    async fn summaries(&self, session_node_id: &str) -> Result<Vec<SummaryRow>> {
        let state = self.state.lock();
        let mut rows: Vec<SummaryRow> = state
            .sources(session_node_id, RelationKind::Summarizes)
            .iter()
            .filter_map(|id| state.nodes.get(id))
            .filter(|n| n.kind == NodeKind::Summary)
            .map(|n| SummaryRow {
                id: n.id.clone(),
                content: n.content.clone(),
                importance: n.importance,
                message_count: n
                    .properties
                    .get("message_count")
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as usize,
                created_at: n.created_at,
            })
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn decay_nodes(&self, session_node_id: &str) -> Result<Vec<DecayRow>> {
        let state = self.state.lock();
        Ok(state
            .sources(session_node_id, RelationKind::PartOfSession)
            .iter()
            .filter_map(|id| state.nodes.get(id))
            .filter(|n| n.layer == 0 || n.layer == 1)
            .map(|n| DecayRow {
                id: n.id.clone(),
                created_at: n.created_at,
                importance: n.importance,
                access_count: n.access_count,
            })
            .collect())
    }

    async fn delete_forgotten(
        &self,
        session_node_id: &str,
        min_importance: f64,
        batch: usize,
    ) -> Result<usize> {
        let mut state = self.state.lock();

        // In scope: nodes attached to the session directly, plus
        // extraction nodes hanging off the session's messages.
        let mut scope: HashSet<String> = HashSet::new();
        for message_id in state.sources(session_node_id, RelationKind::PartOfSession) {
            scope.insert(message_id.clone());
            for extracted in state.sources(&message_id, RelationKind::FromMessage) {
                scope.insert(extracted);
            }
        }

        let doomed: Vec<String> = scope
            .iter()
            .filter_map(|id| state.nodes.get(id))
            .filter(|n| n.layer == 0 && n.kind != NodeKind::Message && n.importance < min_importance)
            .take(batch)
            .map(|n| n.id.clone())
            .collect();

        for id in &doomed {
            state.nodes.remove(id);
            state
                .relations
                .retain(|r| r.source_id != *id && r.target_id != *id);
        }
        Ok(doomed.len())
    }

    async fn session_graph(&self, session_node_id: &str) -> Result<(Vec<Value>, Vec<Value>)> {
        let state = self.state.lock();
        let members: HashSet<String> = state
            .sources(session_node_id, RelationKind::PartOfSession)
            .into_iter()
            .collect();

        let nodes: Vec<Value> = members
            .iter()
            .filter_map(|id| state.nodes.get(id))
            .map(|n| {
                serde_json::json!({
                    "id": n.id,
                    "type": n.kind.label(),
                    "content": n.content,
                })
            })
            .collect();

        let edges: Vec<Value> = state
            .relations
            .iter()
            .filter(|r| members.contains(&r.source_id))
            .map(|r| {
                serde_json::json!({
                    "source": r.source_id,
                    "target": r.target_id,
                    "type": r.kind.label(),
                })
            })
            .collect();

        Ok((nodes, edges))
    }

    async fn owned_session_id(
        &self,
        user_node_id: &str,
        candidates: &[String],
    ) -> Result<Option<String>> {
        let state = self.state.lock();
        for candidate in candidates {
            let Some(node) = state.nodes.get(candidate) else {
                continue;
            };
            if node.kind != NodeKind::Session {
                continue;
            }
            let owned = state
                .targets(candidate, RelationKind::OwnedBy)
                .iter()
                .any(|owner| owner == user_node_id);
            if owned {
                return Ok(Some(candidate.clone()));
            }
        }
        Ok(None)
    }

    async fn stats(&self) -> Result<GraphStats> {
        let state = self.state.lock();
        let mut stats = GraphStats {
            relationships: state.relations.len(),
            ..Default::default()
        };
        for node in state.nodes.values() {
            *stats
                .nodes_by_type
                .entry(node.kind.label().to_string())
                .or_insert(0) += 1;
        }
        Ok(stats)
    }
}
