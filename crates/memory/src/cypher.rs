//! `GraphStore` over the graph database's HTTP transaction endpoint.
//!
//! Statements are posted to `{http_url}/db/{database}/tx/commit` as
//! `{"statements": [{"statement", "parameters"}]}`. An unreachable
//! database degrades at the call sites: recall returns empty, writes
//! are dropped with a warning, no request fails.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use pv_domain::config::GraphConfig;
use pv_domain::error::{Error, Result};

use crate::graph::{
    ConceptRow, DecayRow, GraphNode, GraphRelation, GraphStats, GraphStore, MessageRow, NodeKind,
    RecallItem, RecallLayers, SummaryRow,
};

const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(15);

pub struct CypherGraph {
    http: reqwest::Client,
    endpoint: String,
    username: String,
    password: String,
}

impl CypherGraph {
    pub fn new(config: &GraphConfig) -> Result<Self> {
        if config.http_url.is_empty() {
            return Err(Error::Graph("no graph endpoint configured".into()));
        }
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Http(format!("failed to build HTTP client: {e}")))?;
        let endpoint = format!(
            "{}/db/{}/tx/commit",
            config.http_url.trim_end_matches('/'),
            config.database
        );
        Ok(Self {
            http,
            endpoint,
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    /// Apply the uniqueness constraints and content indexes the
    /// dedupe queries rely on. Failures are logged and ignored; older
    /// database versions reject `IF NOT EXISTS`.
    pub async fn bootstrap_schema(&self) {
        let statements = [
            "CREATE CONSTRAINT entity_id IF NOT EXISTS FOR (n:Entity) REQUIRE n.id IS UNIQUE",
            "CREATE CONSTRAINT action_id IF NOT EXISTS FOR (n:Action) REQUIRE n.id IS UNIQUE",
            "CREATE CONSTRAINT message_id IF NOT EXISTS FOR (n:Message) REQUIRE n.id IS UNIQUE",
            "CREATE CONSTRAINT session_id IF NOT EXISTS FOR (n:Session) REQUIRE n.id IS UNIQUE",
            "CREATE INDEX entity_content IF NOT EXISTS FOR (n:Entity) ON (n.content)",
            "CREATE INDEX action_content IF NOT EXISTS FOR (n:Action) ON (n.content)",
            "CREATE INDEX message_created IF NOT EXISTS FOR (n:Message) ON (n.created_at)",
        ];
        for statement in statements {
            if let Err(e) = self.run(statement, serde_json::json!({})).await {
                tracing::debug!(error = %e, "schema statement skipped");
            }
        }
    }

    /// Run one statement; returns the raw rows.
    async fn run(&self, statement: &str, parameters: Value) -> Result<Vec<Vec<Value>>> {
        let body = serde_json::json!({
            "statements": [{"statement": statement, "parameters": parameters}],
        });

        let resp = self
            .http
            .post(&self.endpoint)
            .basic_auth(&self.username, Some(&self.password))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Graph(format!("graph request failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(Error::Graph(format!("graph HTTP {}", resp.status())));
        }

        let json: Value = resp
            .json()
            .await
            .map_err(|e| Error::Graph(format!("bad graph response: {e}")))?;

        if let Some(errors) = json.get("errors").and_then(Value::as_array) {
            if !errors.is_empty() {
                return Err(Error::Graph(format!("graph errors: {errors:?}")));
            }
        }

        let rows = json["results"]
            .get(0)
            .and_then(|r| r["data"].as_array())
            .map(|data| {
                data.iter()
                    .filter_map(|d| d["row"].as_array().cloned())
                    .collect()
            })
            .unwrap_or_default();
        Ok(rows)
    }
}

fn row_str(row: &[Value], idx: usize) -> String {
    row.get(idx).and_then(Value::as_str).unwrap_or_default().to_string()
}

fn row_f64(row: &[Value], idx: usize, default: f64) -> f64 {
    row.get(idx).and_then(Value::as_f64).unwrap_or(default)
}

fn row_time(row: &[Value], idx: usize) -> DateTime<Utc> {
    row.get(idx)
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

fn recall_item(row: &[Value], with_via: bool) -> Option<RecallItem> {
    let content = row.first()?.as_str()?.to_string();
    Some(RecallItem {
        content,
        time: row_time(row, 1),
        importance: row_f64(row, 2, 0.0),
        via: if with_via {
            row.get(3).and_then(Value::as_str).map(str::to_string)
        } else {
            None
        },
    })
}

#[async_trait]
impl GraphStore for CypherGraph {
    async fn ping(&self) -> Result<()> {
        self.run("RETURN 1", serde_json::json!({})).await.map(|_| ())
    }

    async fn ensure_node(&self, node: GraphNode) -> Result<String> {
        let statement = format!(
            "MERGE (n:{} {{id: $id}}) \
             ON CREATE SET n.content = $content, n.layer = $layer, \
                 n.importance = $importance, n.access_count = $access_count, \
                 n.created_at = datetime($created_at) \
             ON MATCH SET n.access_count = n.access_count + 1 \
             SET n += $properties \
             RETURN n.id",
            node.kind.label()
        );
        let mut properties = Value::Object(node.properties.clone());
        if let Some(embedding) = &node.embedding {
            properties["embedding"] = serde_json::json!(embedding);
        }
        let params = serde_json::json!({
            "id": node.id,
            "content": node.content,
            "layer": node.layer,
            "importance": node.importance,
            "access_count": node.access_count,
            "created_at": node.created_at.to_rfc3339(),
            "properties": properties,
        });
        let rows = self.run(&statement, params).await?;
        Ok(rows
            .first()
            .map(|row| row_str(row, 0))
            .filter(|id| !id.is_empty())
            .unwrap_or(node.id))
    }

    async fn create_relation(&self, relation: GraphRelation) -> Result<()> {
        let statement = format!(
            "MATCH (a {{id: $source_id}}) MATCH (b {{id: $target_id}}) \
             MERGE (a)-[r:{}]->(b) \
             ON CREATE SET r.weight = $weight, r.created_at = datetime() \
             RETURN r",
            relation.kind.label()
        );
        self.run(
            &statement,
            serde_json::json!({
                "source_id": relation.source_id,
                "target_id": relation.target_id,
                "weight": relation.weight,
            }),
        )
        .await?;
        Ok(())
    }

    async fn find_node_by_content(&self, kind: NodeKind, content: &str) -> Result<Option<String>> {
        let statement = format!(
            "MATCH (n:{} {{content: $content}}) RETURN n.id LIMIT 1",
            kind.label()
        );
        let rows = self
            .run(&statement, serde_json::json!({"content": content}))
            .await?;
        Ok(rows.first().map(|row| row_str(row, 0)).filter(|id| !id.is_empty()))
    }

    async fn set_importance(&self, id: &str, importance: f64) -> Result<()> {
        self.run(
            "MATCH (n {id: $id}) SET n.importance = $importance",
            serde_json::json!({"id": id, "importance": importance}),
        )
        .await?;
        Ok(())
    }

    async fn set_embedding(&self, id: &str, embedding: &[f32]) -> Result<()> {
        self.run(
            "MATCH (n {id: $id}) SET n.embedding = $embedding",
            serde_json::json!({"id": id, "embedding": embedding}),
        )
        .await?;
        Ok(())
    }

    async fn user_message_exists(&self, user_id: &str, normalized_content: &str) -> Result<bool> {
        let rows = self
            .run(
                "MATCH (m:Message {user_id: $user_id, role: 'user'}) \
                 WHERE toLower(trim(m.content)) = $content \
                 RETURN m.id LIMIT 1",
                serde_json::json!({"user_id": user_id, "content": normalized_content}),
            )
            .await?;
        Ok(!rows.is_empty())
    }

    async fn messages_for_semantic_keys(
        &self,
        user_node_id: &str,
        keys: &[String],
        limit: usize,
    ) -> Result<Vec<String>> {
        let rows = self
            .run(
                "MATCH (u:User {id: $user_node_id})<-[:OWNED_BY]-(s:Session)\
                 <-[:PART_OF_SESSION]-(m:Message {role: 'user'}) \
                 MATCH (e:Entity)-[:FROM_MESSAGE]->(m) \
                 WHERE e.content IN $keys \
                 RETURN m.content ORDER BY m.created_at DESC LIMIT $limit",
                serde_json::json!({
                    "user_node_id": user_node_id,
                    "keys": keys,
                    "limit": limit,
                }),
            )
            .await?;
        Ok(rows.iter().map(|row| row_str(row, 0)).collect())
    }

    async fn three_layer_recall(
        &self,
        entities: &[String],
        user_node_id: &str,
        session_node_id: &str,
        recent_days: i64,
    ) -> Result<RecallLayers> {
        let mut layers = RecallLayers::default();

        let direct = self
            .run(
                "MATCH (e:Entity) WHERE e.content IN $entities \
                 MATCH (e)-[:FROM_MESSAGE]->(m:Message)-[:PART_OF_SESSION]->\
                       (s:Session)-[:OWNED_BY]->(u:User {id: $user_node_id}) \
                 RETURN DISTINCT m.content, toString(m.created_at), m.importance",
                serde_json::json!({"entities": entities, "user_node_id": user_node_id}),
            )
            .await?;
        layers.direct = direct.iter().filter_map(|row| recall_item(row, false)).collect();

        let related = self
            .run(
                "MATCH (e0:Entity) WHERE e0.content IN $entities \
                 MATCH (e0)-[:SUBJECT_OF|OBJECT_OF]-(a:Action)-[:SUBJECT_OF|OBJECT_OF]-(related:Entity) \
                 WHERE related.content IS NOT NULL AND related.content <> e0.content \
                 MATCH (related)-[:FROM_MESSAGE]->(m:Message)-[:PART_OF_SESSION]->\
                       (s:Session)-[:OWNED_BY]->(u:User {id: $user_node_id}) \
                 RETURN DISTINCT m.content, toString(m.created_at), m.importance, related.content",
                serde_json::json!({"entities": entities, "user_node_id": user_node_id}),
            )
            .await?;
        layers.related = related.iter().filter_map(|row| recall_item(row, true)).collect();

        let recent = self
            .run(
                "MATCH (m:Message)-[:PART_OF_SESSION]->(s:Session {id: $session_node_id}) \
                 WHERE m.created_at > datetime() - duration({days: $recent_days}) \
                 RETURN DISTINCT m.content, toString(m.created_at), m.importance",
                serde_json::json!({
                    "session_node_id": session_node_id,
                    "recent_days": recent_days,
                }),
            )
            .await?;
        layers.recent = recent.iter().filter_map(|row| recall_item(row, false)).collect();

        Ok(layers)
    }

    async fn session_entities(&self, session_node_id: &str) -> Result<Vec<GraphNode>> {
        let rows = self
            .run(
                "MATCH (s:Session {id: $session_node_id})<-[:PART_OF_SESSION]-(m:Message) \
                 MATCH (m)<-[:FROM_MESSAGE]-(e:Entity) WHERE e.layer = 0 \
                 RETURN DISTINCT e.id, e.content, e.importance, e.embedding",
                serde_json::json!({"session_node_id": session_node_id}),
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| {
                let embedding = row.get(3).and_then(Value::as_array).map(|values| {
                    values
                        .iter()
                        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                        .collect::<Vec<f32>>()
                });
                let mut node = GraphNode::new(NodeKind::Entity, row_str(row, 1))
                    .with_id(row_str(row, 0))
                    .with_importance(row_f64(row, 2, 0.5));
                node.embedding = embedding;
                node
            })
            .collect())
    }

    async fn session_messages(&self, session_node_id: &str, skip: usize) -> Result<Vec<MessageRow>> {
        let rows = self
            .run(
                "MATCH (s:Session {id: $session_node_id})<-[:PART_OF_SESSION]-(m:Message) \
                 WHERE m.layer = 0 \
                 RETURN m.content, m.role, toString(m.created_at) \
                 ORDER BY m.created_at ASC SKIP $skip",
                serde_json::json!({"session_node_id": session_node_id, "skip": skip}),
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| MessageRow {
                content: row_str(row, 0),
                role: row_str(row, 1),
                created_at: row_time(row, 2),
            })
            .collect())
    }

    async fn session_concepts(&self, session_node_id: &str, limit: usize) -> Result<Vec<ConceptRow>> {
        let rows = self
            .run(
                "MATCH (s:Session {id: $session_node_id})<-[:PART_OF_SESSION]-(c:Concept) \
                 OPTIONAL MATCH (c)<-[:BELONGS_TO]-(e:Entity) \
                 RETURN c.id, c.content, c.importance, count(e) \
                 ORDER BY c.importance DESC LIMIT $limit",
                serde_json::json!({"session_node_id": session_node_id, "limit": limit}),
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| ConceptRow {
                id: row_str(row, 0),
                content: row_str(row, 1),
                importance: row_f64(row, 2, 0.5),
                entity_count: row.get(3).and_then(Value::as_u64).unwrap_or(0) as usize,
            })
            .collect())
    }

    async fn summaries(&self, session_node_id: &str) -> Result<Vec<SummaryRow>> {
        let rows = self
            .run(
                "MATCH (s:Session {id: $session_node_id})<-[:SUMMARIZES]-(sum:Summary) \
                 RETURN sum.id, sum.content, sum.importance, sum.message_count, \
                        toString(sum.created_at) \
                 ORDER BY sum.created_at DESC",
                serde_json::json!({"session_node_id": session_node_id}),
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| SummaryRow {
                id: row_str(row, 0),
                content: row_str(row, 1),
                importance: row_f64(row, 2, 0.9),
                message_count: row.get(3).and_then(Value::as_u64).unwrap_or(0) as usize,
                created_at: row_time(row, 4),
            })
            .collect())
    }

    async fn decay_nodes(&self, session_node_id: &str) -> Result<Vec<DecayRow>> {
        let rows = self
            .run(
                "MATCH (s:Session {id: $session_node_id})<-[:PART_OF_SESSION]-(n) \
                 WHERE n.layer IN [0, 1] AND n.created_at IS NOT NULL \
                 RETURN n.id, toString(n.created_at), n.importance, n.access_count",
                serde_json::json!({"session_node_id": session_node_id}),
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| DecayRow {
                id: row_str(row, 0),
                created_at: row_time(row, 1),
                importance: row_f64(row, 2, 0.5),
                access_count: row.get(3).and_then(Value::as_i64).unwrap_or(0),
            })
            .collect())
    }

    async fn delete_forgotten(
        &self,
        session_node_id: &str,
        min_importance: f64,
        batch: usize,
    ) -> Result<usize> {
        let rows = self
            .run(
                "MATCH (s:Session {id: $session_node_id})<-[:PART_OF_SESSION]-(m:Message) \
                 MATCH (m)<-[:FROM_MESSAGE]-(n) \
                 WHERE n.layer = 0 AND NOT n:Message AND n.importance < $min_importance \
                 WITH DISTINCT n LIMIT $batch \
                 DETACH DELETE n RETURN count(n)",
                serde_json::json!({
                    "session_node_id": session_node_id,
                    "min_importance": min_importance,
                    "batch": batch,
                }),
            )
            .await?;
        Ok(rows
            .first()
            .and_then(|row| row.first())
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize)
    }

    async fn session_graph(&self, session_node_id: &str) -> Result<(Vec<Value>, Vec<Value>)> {
        let node_rows = self
            .run(
                "MATCH (s:Session {id: $session_node_id})<-[:PART_OF_SESSION]-(n) \
                 RETURN n.id, labels(n)[0], n.content",
                serde_json::json!({"session_node_id": session_node_id}),
            )
            .await?;
        let edge_rows = self
            .run(
                "MATCH (s:Session {id: $session_node_id})<-[:PART_OF_SESSION]-(n1) \
                 MATCH (n1)-[r]->(n2) \
                 RETURN n1.id, n2.id, type(r)",
                serde_json::json!({"session_node_id": session_node_id}),
            )
            .await?;

        let nodes = node_rows
            .iter()
            .map(|row| {
                serde_json::json!({
                    "id": row_str(row, 0),
                    "type": row_str(row, 1),
                    "content": row_str(row, 2),
                })
            })
            .collect();
        let edges = edge_rows
            .iter()
            .map(|row| {
                serde_json::json!({
                    "source": row_str(row, 0),
                    "target": row_str(row, 1),
                    "type": row_str(row, 2),
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
        let rows = self
            .run(
                "MATCH (s:Session)-[:OWNED_BY]->(u:User {id: $user_node_id}) \
                 WHERE s.id IN $candidate_ids \
                 RETURN s.id LIMIT 1",
                serde_json::json!({
                    "user_node_id": user_node_id,
                    "candidate_ids": candidates,
                }),
            )
            .await?;
        Ok(rows.first().map(|row| row_str(row, 0)).filter(|id| !id.is_empty()))
    }

    async fn stats(&self) -> Result<GraphStats> {
        let node_rows = self
            .run(
                "MATCH (n) RETURN labels(n)[0], count(n)",
                serde_json::json!({}),
            )
            .await?;
        let rel_rows = self
            .run("MATCH ()-[r]->() RETURN count(r)", serde_json::json!({}))
            .await?;

        let mut stats = GraphStats::default();
        for row in &node_rows {
            let label = row_str(row, 0);
            if !label.is_empty() {
                let count = row.get(1).and_then(Value::as_u64).unwrap_or(0) as usize;
                stats.nodes_by_type.insert(label, count);
            }
        }
        stats.relationships = rel_rows
            .first()
            .and_then(|row| row.first())
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize;
        Ok(stats)
    }
}
