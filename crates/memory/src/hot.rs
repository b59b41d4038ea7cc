//! Hot layer: persist extracted structure into the graph.
//!
//! Every processed message produces a Message node linked to its
//! session, plus Entity / Action / Time / Location nodes for the
//! extracted structure. Nodes of those four kinds are canonicalized
//! by trim+lowercase content and reused when an equivalent node
//! already exists.

use std::sync::Arc;

use serde_json::Value;

use pv_domain::error::Result;

use crate::extract::{Extraction, LlmExtractor};
use crate::graph::{GraphNode, GraphRelation, GraphStore, NodeKind, RelationKind};
use crate::scope::{session_node_id, user_node_id};

pub fn normalize_content(content: &str) -> String {
    let lowered = content.trim().to_lowercase();
    lowered.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[derive(Debug, Clone, Default)]
pub struct ProcessStats {
    pub message_id: String,
    pub facts: usize,
    pub entities: usize,
    pub time_nodes: usize,
    pub location_nodes: usize,
}

pub struct HotLayer {
    store: Arc<dyn GraphStore>,
    extractor: LlmExtractor,
}

impl HotLayer {
    pub fn new(store: Arc<dyn GraphStore>, extractor: LlmExtractor) -> Self {
        Self { store, extractor }
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    /// Make sure the user node, the scoped session node, and the
    /// ownership edge exist.
    pub async fn ensure_session(&self, session_id: &str, user_id: &str) -> Result<String> {
        let uid = user_node_id(Some(user_id));
        let sid = session_node_id(session_id, Some(user_id));

        self.store
            .ensure_node(
                GraphNode::new(NodeKind::User, user_id)
                    .with_id(uid.clone())
                    .with_importance(1.0),
            )
            .await?;
        self.store
            .ensure_node(
                GraphNode::new(NodeKind::Session, format!("Session {session_id}"))
                    .with_id(sid.clone())
                    .with_importance(1.0)
                    .with_property("session_id", Value::String(session_id.to_string())),
            )
            .await?;
        self.store
            .create_relation(GraphRelation::new(RelationKind::OwnedBy, sid.clone(), uid))
            .await?;
        Ok(sid)
    }

    /// Process one message: extract structure, write the message node
    /// and its extraction nodes.
    pub async fn process_message(
        &self,
        session_id: &str,
        role: &str,
        content: &str,
        user_id: &str,
        metadata: Option<Value>,
    ) -> Result<ProcessStats> {
        let session_node = self.ensure_session(session_id, user_id).await?;
        let extraction = self.extractor.extract(role, content).await;

        let message_id = self
            .create_message_node(&session_node, role, content, user_id, metadata)
            .await?;

        let mut stats = ProcessStats {
            message_id: message_id.clone(),
            ..Default::default()
        };

        for triple in &extraction.triples {
            self.store_fact_triple(triple, &message_id).await?;
            stats.facts += 1;
        }
        for entity in &extraction.entities {
            if !self
                .create_linked_node(NodeKind::Entity, entity, &message_id, 0.6, 0.8)
                .await?
                .is_empty()
            {
                stats.entities += 1;
            }
        }
        for time_expr in &extraction.time_expressions {
            if !self
                .create_linked_node(NodeKind::Time, time_expr, &message_id, 0.5, 0.7)
                .await?
                .is_empty()
            {
                stats.time_nodes += 1;
            }
        }
        for location in &extraction.locations {
            if !self
                .create_linked_node(NodeKind::Location, location, &message_id, 0.6, 0.7)
                .await?
                .is_empty()
            {
                stats.location_nodes += 1;
            }
        }

        tracing::debug!(
            message_id = %stats.message_id,
            facts = stats.facts,
            entities = stats.entities,
            "hot layer message processed"
        );
        Ok(stats)
    }

    /// Query-time entity extraction used by the recall engine.
    pub async fn extract_query_entities(&self, query: &str) -> Vec<String> {
        let extraction: Extraction = self.extractor.extract("user", query).await;
        extraction
            .entities
            .iter()
            .map(|e| normalize_content(e))
            .filter(|e| !e.is_empty())
            .collect()
    }

    async fn create_message_node(
        &self,
        session_node: &str,
        role: &str,
        content: &str,
        user_id: &str,
        metadata: Option<Value>,
    ) -> Result<String> {
        let importance = if role == "user" { 0.7 } else { 0.6 };
        let mut node = GraphNode::new(NodeKind::Message, content)
            .with_importance(importance)
            .with_property("role", Value::String(role.to_string()))
            .with_property("user_id", Value::String(user_id.to_string()));
        if let Some(Value::Object(map)) = metadata {
            for (key, value) in map {
                node.properties.insert(key, value);
            }
        }

        let message_id = self.store.ensure_node(node).await?;
        self.store
            .create_relation(GraphRelation::new(
                RelationKind::PartOfSession,
                message_id.clone(),
                session_node,
            ))
            .await?;
        Ok(message_id)
    }

    /// Create or reuse a canonicalized node and link it to the
    /// message. Returns the node id (empty when the content
    /// normalizes away).
    async fn create_linked_node(
        &self,
        kind: NodeKind,
        raw_content: &str,
        message_id: &str,
        importance: f64,
        link_weight: f64,
    ) -> Result<String> {
        let normalized = normalize_content(raw_content);
        if normalized.is_empty() {
            return Ok(String::new());
        }

        let node_id = match self.store.find_node_by_content(kind, &normalized).await? {
            Some(existing) => existing,
            None => {
                self.store
                    .ensure_node(
                        GraphNode::new(kind, normalized)
                            .with_importance(importance)
                            .with_property(
                                "original_text",
                                Value::String(raw_content.to_string()),
                            ),
                    )
                    .await?
            }
        };

        // The link is created even when the node is reused.
        self.store
            .create_relation(
                GraphRelation::new(RelationKind::FromMessage, node_id.clone(), message_id)
                    .with_weight(link_weight),
            )
            .await?;
        Ok(node_id)
    }

    async fn store_fact_triple(
        &self,
        triple: &crate::extract::FactTriple,
        message_id: &str,
    ) -> Result<()> {
        let subject_id = self
            .find_or_create(NodeKind::Entity, &triple.subject, triple.confidence)
            .await?;
        let action_id = self
            .find_or_create(NodeKind::Action, &triple.predicate, triple.confidence)
            .await?;
        let object_id = self
            .find_or_create(NodeKind::Entity, &triple.object, triple.confidence)
            .await?;

        if let (Some(subject_id), Some(action_id)) = (&subject_id, &action_id) {
            self.store
                .create_relation(
                    GraphRelation::new(RelationKind::SubjectOf, subject_id.as_str(), action_id.as_str())
                        .with_weight(triple.confidence),
                )
                .await?;
            self.store
                .create_relation(GraphRelation::new(RelationKind::FromMessage, action_id.as_str(), message_id))
                .await?;

            if let Some(object_id) = &object_id {
                self.store
                    .create_relation(
                        GraphRelation::new(RelationKind::ObjectOf, action_id.as_str(), object_id.as_str())
                            .with_weight(triple.confidence),
                    )
                    .await?;
            }
            if let Some(time) = &triple.time {
                let time_id = self
                    .create_linked_node(NodeKind::Time, time, message_id, 0.5, 0.7)
                    .await?;
                if !time_id.is_empty() {
                    self.store
                        .create_relation(
                            GraphRelation::new(RelationKind::AtTime, action_id.as_str(), time_id)
                                .with_weight(triple.confidence),
                        )
                        .await?;
                }
            }
            if let Some(location) = &triple.location {
                let location_id = self
                    .create_linked_node(NodeKind::Location, location, message_id, 0.6, 0.7)
                    .await?;
                if !location_id.is_empty() {
                    self.store
                        .create_relation(
                            GraphRelation::new(RelationKind::AtLocation, action_id.as_str(), location_id)
                                .with_weight(triple.confidence),
                        )
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn find_or_create(
        &self,
        kind: NodeKind,
        raw_content: &str,
        importance: f64,
    ) -> Result<Option<String>> {
        let normalized = normalize_content(raw_content);
        if normalized.is_empty() {
            return Ok(None);
        }
        if let Some(existing) = self.store.find_node_by_content(kind, &normalized).await? {
            return Ok(Some(existing));
        }
        let id = self
            .store
            .ensure_node(GraphNode::new(kind, normalized).with_importance(importance))
            .await?;
        Ok(Some(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_trims_lowers_and_collapses() {
        assert_eq!(normalize_content("  Apple  "), "apple");
        assert_eq!(normalize_content("San   Francisco"), "san francisco");
        assert_eq!(normalize_content("   "), "");
    }
}
