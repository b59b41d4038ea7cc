//! The logical graph schema and the store interface.
//!
//! The concrete graph database driver is an external collaborator;
//! this trait is the interface the memory layers are written against.
//! `CypherGraph` implements it over the database's HTTP transaction
//! endpoint; `MemGraph` implements it in memory for tests and for
//! running without a graph database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use pv_domain::error::Result;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Schema
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    User,
    Session,
    Message,
    Entity,
    Action,
    Time,
    Location,
    Concept,
    Summary,
}

impl NodeKind {
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::User => "User",
            NodeKind::Session => "Session",
            NodeKind::Message => "Message",
            NodeKind::Entity => "Entity",
            NodeKind::Action => "Action",
            NodeKind::Time => "Time",
            NodeKind::Location => "Location",
            NodeKind::Concept => "Concept",
            NodeKind::Summary => "Summary",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationKind {
    SubjectOf,
    ObjectOf,
    AtTime,
    AtLocation,
    FromMessage,
    BelongsTo,
    Summarizes,
    PartOfSession,
    OwnedBy,
}

impl RelationKind {
    pub fn label(&self) -> &'static str {
        match self {
            RelationKind::SubjectOf => "SUBJECT_OF",
            RelationKind::ObjectOf => "OBJECT_OF",
            RelationKind::AtTime => "AT_TIME",
            RelationKind::AtLocation => "AT_LOCATION",
            RelationKind::FromMessage => "FROM_MESSAGE",
            RelationKind::BelongsTo => "BELONGS_TO",
            RelationKind::Summarizes => "SUMMARIZES",
            RelationKind::PartOfSession => "PART_OF_SESSION",
            RelationKind::OwnedBy => "OWNED_BY",
        }
    }
}

/// One node. Ids are `<kind>_<uuid12>` unless the caller supplies a
/// scoped id (user/session nodes).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub kind: NodeKind,
    pub content: String,
    /// 0 = hot, 1 = warm, 2 = cold.
    pub layer: i64,
    pub importance: f64,
    pub access_count: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub properties: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl GraphNode {
    pub fn new(kind: NodeKind, content: impl Into<String>) -> Self {
        let short = uuid::Uuid::new_v4().simple().to_string();
        Self {
            id: format!("{}_{}", kind.label().to_lowercase(), &short[..12]),
            kind,
            content: content.into(),
            layer: 0,
            importance: 0.5,
            access_count: 1,
            embedding: None,
            properties: Map::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_layer(mut self, layer: i64) -> Self {
        self.layer = layer;
        self
    }

    pub fn with_importance(mut self, importance: f64) -> Self {
        self.importance = importance;
        self
    }

    pub fn with_property(mut self, key: &str, value: Value) -> Self {
        self.properties.insert(key.to_string(), value);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphRelation {
    pub kind: RelationKind,
    pub source_id: String,
    pub target_id: String,
    pub weight: f64,
}

impl GraphRelation {
    pub fn new(kind: RelationKind, source_id: impl Into<String>, target_id: impl Into<String>) -> Self {
        Self {
            kind,
            source_id: source_id.into(),
            target_id: target_id.into(),
            weight: 1.0,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Query result rows
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize)]
pub struct RecallItem {
    pub content: String,
    pub time: DateTime<Utc>,
    pub importance: f64,
    /// The linking entity, for the `related` layer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub via: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecallLayers {
    pub direct: Vec<RecallItem>,
    pub related: Vec<RecallItem>,
    pub recent: Vec<RecallItem>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageRow {
    pub content: String,
    pub role: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConceptRow {
    pub id: String,
    pub content: String,
    pub importance: f64,
    pub entity_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SummaryRow {
    pub id: String,
    pub content: String,
    pub importance: f64,
    pub message_count: usize,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DecayRow {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub importance: f64,
    pub access_count: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GraphStats {
    pub nodes_by_type: std::collections::HashMap<String, usize>,
    pub relationships: usize,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store interface
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Cheap reachability probe for health/doctor surfaces.
    async fn ping(&self) -> Result<()>;

    /// MERGE the node by id: create with its fields, or bump
    /// `access_count` when it already exists. Returns the node id.
    async fn ensure_node(&self, node: GraphNode) -> Result<String>;

    async fn create_relation(&self, relation: GraphRelation) -> Result<()>;

    /// Find an existing node of `kind` by exact (already normalized)
    /// content. This is the dedupe primitive.
    async fn find_node_by_content(&self, kind: NodeKind, content: &str) -> Result<Option<String>>;

    async fn set_importance(&self, id: &str, importance: f64) -> Result<()>;

    /// Write-through embedding cache on the node.
    async fn set_embedding(&self, id: &str, embedding: &[f32]) -> Result<()>;

    /// Does this user already have a user-role message with exactly
    /// this normalized content (any session)?
    async fn user_message_exists(&self, user_id: &str, normalized_content: &str) -> Result<bool>;

    /// User-scoped messages linked (via entities) to any of the
    /// semantic keys, newest first, up to `limit`.
    async fn messages_for_semantic_keys(
        &self,
        user_node_id: &str,
        keys: &[String],
        limit: usize,
    ) -> Result<Vec<String>>;

    /// The three-layer recall query: direct entity hits and related
    /// (two-hop via actions) hits are cross-session but scoped to the
    /// user; recent is the current session within `recent_days`.
    async fn three_layer_recall(
        &self,
        entities: &[String],
        user_node_id: &str,
        session_node_id: &str,
        recent_days: i64,
    ) -> Result<RecallLayers>;

    /// Layer-0 entities of a session (with cached embeddings).
    async fn session_entities(&self, session_node_id: &str) -> Result<Vec<GraphNode>>;

    /// Ordered layer-0 messages of a session, skipping the first
    /// `skip` (incremental summaries).
    async fn session_messages(&self, session_node_id: &str, skip: usize) -> Result<Vec<MessageRow>>;

    /// Session concepts by importance, up to `limit`.
    async fn session_concepts(&self, session_node_id: &str, limit: usize) -> Result<Vec<ConceptRow>>;

    /// Session summaries, newest first.
    async fn summaries(&self, session_node_id: &str) -> Result<Vec<SummaryRow>>;

    /// Layer 0/1 nodes of a session eligible for time decay.
    async fn decay_nodes(&self, session_node_id: &str) -> Result<Vec<DecayRow>>;

    /// Delete layer-0 non-message nodes below `min_importance`
    /// (detaching their relations), at most `batch` per call. Returns
    /// the number deleted.
    async fn delete_forgotten(
        &self,
        session_node_id: &str,
        min_importance: f64,
        batch: usize,
    ) -> Result<usize>;

    /// Nodes and edges of one session, for `memory.graph`.
    async fn session_graph(&self, session_node_id: &str) -> Result<(Vec<Value>, Vec<Value>)>;

    /// Which of `candidates` is a session node owned by this user?
    async fn owned_session_id(
        &self,
        user_node_id: &str,
        candidates: &[String],
    ) -> Result<Option<String>>;

    async fn stats(&self) -> Result<GraphStats>;
}
