//! Warm layer: semantic clustering of hot-layer entities into
//! Concept nodes.
//!
//! Entity embeddings are cached on the nodes (read before compute,
//! write-through on first compute). Clustering is DBSCAN over
//! L2-normalized vectors with cosine distance,
//! `eps = 1 − clustering_threshold`.

use std::sync::Arc;

use serde_json::Value;

use pv_domain::config::WarmLayerConfig;
use pv_domain::error::Result;
use pv_providers::EmbeddingClient;

use crate::graph::{ConceptRow, GraphNode, GraphRelation, GraphStore, NodeKind, RelationKind};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Vector math
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Cosine similarity in `[-1, 1]`; zero-magnitude vectors yield 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    dot / (mag_a * mag_b)
}

fn l2_normalize(v: &[f32]) -> Vec<f32> {
    let mag: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag == 0.0 {
        v.to_vec()
    } else {
        v.iter().map(|x| x / mag).collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// DBSCAN (cosine metric)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub const NOISE: i32 = -1;
const UNVISITED: i32 = -2;

/// DBSCAN over cosine distance (`1 − cosine_similarity`). Returns one
/// label per input: cluster ids from 0, `NOISE` for noise points.
pub fn dbscan_cosine(vectors: &[Vec<f32>], eps: f32, min_samples: usize) -> Vec<i32> {
    let n = vectors.len();
    let mut labels = vec![UNVISITED; n];
    let mut cluster = 0i32;

    let neighbors = |idx: usize| -> Vec<usize> {
        (0..n)
            .filter(|&other| {
                let dist = 1.0 - cosine_similarity(&vectors[idx], &vectors[other]);
                dist <= eps
            })
            .collect()
    };

    for point in 0..n {
        if labels[point] != UNVISITED {
            continue;
        }
        let seed = neighbors(point);
        if seed.len() < min_samples {
            labels[point] = NOISE;
            continue;
        }

        labels[point] = cluster;
        let mut queue: Vec<usize> = seed;
        let mut head = 0;
        while head < queue.len() {
            let current = queue[head];
            head += 1;
            if labels[current] == NOISE {
                labels[current] = cluster;
            }
            if labels[current] != UNVISITED {
                continue;
            }
            labels[current] = cluster;
            let expansion = neighbors(current);
            if expansion.len() >= min_samples {
                queue.extend(expansion);
            }
        }
        cluster += 1;
    }

    labels
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Warm layer manager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct WarmLayer {
    store: Arc<dyn GraphStore>,
    embeddings: Arc<dyn EmbeddingClient>,
    config: WarmLayerConfig,
}

impl WarmLayer {
    pub fn new(
        store: Arc<dyn GraphStore>,
        embeddings: Arc<dyn EmbeddingClient>,
        config: WarmLayerConfig,
    ) -> Self {
        Self {
            store,
            embeddings,
            config,
        }
    }

    /// Cluster the session's layer-0 entities into Concept nodes.
    /// Returns the number of concepts created or linked.
    pub async fn cluster_entities(&self, session_node_id: &str) -> Result<usize> {
        let entities = self.store.session_entities(session_node_id).await?;
        if entities.len() < self.config.min_cluster_size {
            tracing::info!(
                entities = entities.len(),
                min = self.config.min_cluster_size,
                "not enough entities, skipping clustering"
            );
            return Ok(0);
        }

        // Resolve embeddings, cache-first.
        let mut vectors: Vec<Vec<f32>> = Vec::new();
        let mut valid: Vec<GraphNode> = Vec::new();
        let mut computed = 0usize;
        for entity in entities {
            let embedding = match &entity.embedding {
                Some(cached) => Some(cached.clone()),
                None => match self.embeddings.embed(&entity.content).await {
                    Ok(fresh) => {
                        self.store.set_embedding(&entity.id, &fresh).await?;
                        computed += 1;
                        Some(fresh)
                    }
                    Err(e) => {
                        tracing::warn!(entity = %entity.content, error = %e, "embedding failed");
                        None
                    }
                },
            };
            if let Some(embedding) = embedding {
                vectors.push(l2_normalize(&embedding));
                valid.push(entity);
            }
        }
        if computed > 0 {
            tracing::info!(computed, "computed and cached new embeddings");
        }
        if vectors.len() < self.config.min_cluster_size {
            tracing::info!("not enough valid embeddings, skipping clustering");
            return Ok(0);
        }

        let eps = 1.0 - self.config.clustering_threshold;
        let labels = dbscan_cosine(&vectors, eps, self.config.min_cluster_size);
        let cluster_count = labels.iter().copied().filter(|&l| l >= 0).max().map(|m| m + 1).unwrap_or(0);
        tracing::info!(
            clusters = cluster_count,
            noise = labels.iter().filter(|&&l| l == NOISE).count(),
            "clustering finished"
        );

        let mut concepts_created = 0usize;
        for cluster_id in 0..cluster_count {
            let members: Vec<&GraphNode> = labels
                .iter()
                .zip(valid.iter())
                .filter(|(label, _)| **label == cluster_id)
                .map(|(_, node)| node)
                .collect();
            if self
                .create_concept_node(session_node_id, cluster_id, &members)
                .await?
                .is_some()
            {
                concepts_created += 1;
            }
        }

        Ok(concepts_created)
    }

    pub async fn get_concepts(&self, session_node_id: &str) -> Result<Vec<ConceptRow>> {
        self.store.session_concepts(session_node_id, 1000).await
    }

    async fn create_concept_node(
        &self,
        session_node_id: &str,
        cluster_id: i32,
        members: &[&GraphNode],
    ) -> Result<Option<String>> {
        let mut sorted: Vec<&&GraphNode> = members.iter().collect();
        sorted.sort_by(|a, b| {
            b.importance
                .partial_cmp(&a.importance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let top: Vec<&str> = sorted.iter().take(3).map(|n| n.content.as_str()).collect();
        let concept_name = format!("Topic: {}", top.join(", "));

        // Reuse an existing concept on keyword match instead of
        // accumulating near-duplicates.
        let concept_id = match self.find_similar_concept(&concept_name).await? {
            Some(existing) => {
                tracing::debug!(concept = %existing, "concept already exists, linking");
                existing
            }
            None => {
                let importance = members.iter().map(|n| n.importance).sum::<f64>()
                    / members.len().max(1) as f64;
                let node = GraphNode::new(NodeKind::Concept, concept_name.clone())
                    .with_layer(1)
                    .with_importance(importance)
                    .with_property("cluster_id", Value::from(cluster_id))
                    .with_property("entity_count", Value::from(members.len()));
                let id = self.store.ensure_node(node).await?;
                self.store
                    .create_relation(GraphRelation::new(
                        RelationKind::PartOfSession,
                        id.clone(),
                        session_node_id,
                    ))
                    .await?;
                tracing::info!(concept = %concept_name, entities = members.len(), "created concept node");
                id
            }
        };

        for member in members {
            self.store
                .create_relation(
                    GraphRelation::new(RelationKind::BelongsTo, member.id.clone(), concept_id.clone())
                        .with_weight(0.8),
                )
                .await?;
        }

        Ok(Some(concept_id))
    }

    /// Keyword match against existing concepts: the first entity name
    /// in the generated title.
    async fn find_similar_concept(&self, concept_name: &str) -> Result<Option<String>> {
        let keyword = concept_name
            .split(':')
            .nth(1)
            .and_then(|rest| rest.split(',').next())
            .map(str::trim)
            .unwrap_or("");
        if keyword.is_empty() {
            return Ok(None);
        }
        // Exact-content reuse only; substring search stays inside the
        // store implementations.
        self.store
            .find_node_by_content(NodeKind::Concept, &format!("Topic: {keyword}"))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_similarity_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 2.0], &[-1.0, -2.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn l2_normalize_unit_length() {
        let v = l2_normalize(&[3.0, 4.0]);
        let mag: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((mag - 1.0).abs() < 1e-6);
    }

    #[test]
    fn dbscan_finds_two_clusters() {
        // Two tight groups on orthogonal axes plus one outlier.
        let vectors = vec![
            vec![1.0, 0.0, 0.0],
            vec![0.99, 0.05, 0.0],
            vec![0.98, 0.0, 0.05],
            vec![0.0, 1.0, 0.0],
            vec![0.05, 0.99, 0.0],
            vec![0.0, 0.98, 0.05],
            vec![0.577, 0.577, 0.577],
        ];
        let labels = dbscan_cosine(&vectors, 0.05, 3);
        assert_eq!(labels[0], labels[1]);
        assert_eq!(labels[1], labels[2]);
        assert_eq!(labels[3], labels[4]);
        assert_eq!(labels[4], labels[5]);
        assert_ne!(labels[0], labels[3]);
        assert_eq!(labels[6], NOISE);
    }

    #[test]
    fn dbscan_below_min_samples_is_all_noise() {
        let vectors = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
        let labels = dbscan_cosine(&vectors, 0.3, 3);
        assert!(labels.iter().all(|&l| l == NOISE));
    }

    #[test]
    fn dbscan_empty_input() {
        assert!(dbscan_cosine(&[], 0.3, 3).is_empty());
    }
}
