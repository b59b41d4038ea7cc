//! Layered long-term memory over a graph database.
//!
//! Three layers: hot (layer 0, extracted facts), warm (layer 1,
//! clustered concepts), cold (layer 2, summaries). Writes are gated
//! by a classifier plus graph-level dedupe; reads go through a
//! three-layer recall query with dynamic parameters; maintenance
//! applies clustering, summarization, time decay, and forgetting.

mod cold;
mod cypher;
mod extract;
mod forgetting;
mod graph;
mod hot;
mod memgraph;
mod recall;
mod scope;
mod service;
mod store;
mod warm;

pub use cold::ColdLayer;
pub use cypher::CypherGraph;
pub use extract::{Extraction, FactTriple, LlmExtractor};
pub use forgetting::{calculate_decay_factor, ForgettingManager};
pub use graph::{
    ConceptRow, DecayRow, GraphNode, GraphRelation, GraphStats, GraphStore, MessageRow, NodeKind,
    RecallItem, RecallLayers, RelationKind, SummaryRow,
};
pub use hot::HotLayer;
pub use memgraph::MemGraph;
pub use recall::RecallEngine;
pub use scope::{
    normalize_user_id, resolve_owned_session_id, scoped_session_id, session_node_id, user_node_id,
};
pub use service::{MemoryService, WriteCandidate};
pub use store::MemoryStore;
pub use warm::WarmLayer;
