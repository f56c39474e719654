//! Embedding service: content digests, batched generation, vector upkeep
//!
//! Sits between entities and the vector index. Content is digested and
//! capped before it reaches the provider; provider outages degrade to
//! fallback vectors marked in metadata so indexing never stalls.

use anyhow::Result;
use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, instrument, warn};

use crate::embeddings::{fallback_vector, EmbeddingProvider, DEFAULT_DIMENSIONS};
use crate::entity::Entity;
use crate::entity_service::from_node;
use crate::events::{EngineEvent, EventBus};
use crate::types::{ChangeSetId, EntityId};
use crate::vector_index::{
    default_index_spec, SimilarityMetric, VectorIndexService, VectorIndexSpec, VectorRecord,
    VectorSearchOptions,
};

/// Per-entity embedding cache bounds.
const CACHE_CAPACITY: usize = 500;
const CACHE_TTL: Duration = Duration::from_secs(300);

/// Embedding service configuration.
#[derive(Debug, Clone)]
pub struct EmbeddingServiceConfig {
    pub index_name: String,
    pub dimensions: usize,
    pub similarity: SimilarityMetric,
    pub batch_size: usize,
    pub max_in_flight: usize,
}

impl Default for EmbeddingServiceConfig {
    fn default() -> Self {
        Self {
            index_name: "entity_embedding".to_string(),
            dimensions: DEFAULT_DIMENSIONS,
            similarity: SimilarityMetric::Cosine,
            batch_size: 10,
            max_in_flight: 4,
        }
    }
}

/// Per-entity failure captured during a batch run.
#[derive(Debug, Clone)]
pub struct EmbedFailure {
    pub entity_id: EntityId,
    pub error: String,
}

/// Outcome of a batch embedding run.
#[derive(Debug, Clone, Default)]
pub struct BatchEmbedOutcome {
    pub processed: usize,
    pub fallbacks: usize,
    pub failures: Vec<EmbedFailure>,
    pub checkpoint_id: Option<ChangeSetId>,
}

/// Embedding statistics.
#[derive(Debug, Clone, Default)]
pub struct EmbeddingStats {
    pub indexed: usize,
    pub dimensions: usize,
    pub average_magnitude: f32,
    pub cache_entries: usize,
}

/// One semantic search hit parsed back into an entity.
#[derive(Debug, Clone)]
pub struct SemanticHit {
    pub entity: Entity,
    pub score: f32,
}

struct CacheEntry {
    vector: Vec<f32>,
    inserted: Instant,
}

/// Small LRU with TTL for per-entity vectors.
struct VectorCache {
    map: HashMap<EntityId, CacheEntry>,
    order: VecDeque<EntityId>,
}

impl VectorCache {
    fn new() -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&mut self, id: &EntityId) -> Option<Vec<f32>> {
        let entry = self.map.get(id)?;
        if entry.inserted.elapsed() > CACHE_TTL {
            self.map.remove(id);
            self.order.retain(|k| k != id);
            return None;
        }
        let vector = entry.vector.clone();
        self.order.retain(|k| k != id);
        self.order.push_back(id.clone());
        Some(vector)
    }

    fn put(&mut self, id: EntityId, vector: Vec<f32>) {
        if self.map.contains_key(&id) {
            self.order.retain(|k| k != &id);
        } else if self.map.len() >= CACHE_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.map.remove(&oldest);
            }
        }
        self.order.push_back(id.clone());
        self.map.insert(
            id,
            CacheEntry {
                vector,
                inserted: Instant::now(),
            },
        );
    }

    fn remove(&mut self, id: &EntityId) {
        self.map.remove(id);
        self.order.retain(|k| k != id);
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}

pub struct EmbeddingService {
    provider: Arc<dyn EmbeddingProvider>,
    vectors: Arc<VectorIndexService>,
    events: Arc<EventBus>,
    config: EmbeddingServiceConfig,
    cache: Mutex<VectorCache>,
    in_flight: Arc<Semaphore>,
}

impl EmbeddingService {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        vectors: Arc<VectorIndexService>,
        events: Arc<EventBus>,
    ) -> Self {
        let config = EmbeddingServiceConfig {
            dimensions: provider.dimension(),
            ..Default::default()
        };
        let in_flight = Arc::new(Semaphore::new(config.max_in_flight));
        Self {
            provider,
            vectors,
            events,
            config,
            cache: Mutex::new(VectorCache::new()),
            in_flight,
        }
    }

    pub fn with_config(mut self, config: EmbeddingServiceConfig) -> Self {
        self.in_flight = Arc::new(Semaphore::new(config.max_in_flight));
        self.config = config;
        self
    }

    /// Create the vector index if it does not exist yet. Idempotent.
    pub fn initialize_index(&self) -> Result<()> {
        let spec = VectorIndexSpec {
            name: self.config.index_name.clone(),
            similarity: self.config.similarity,
            ..default_index_spec(self.config.dimensions)
        };
        self.vectors.ensure_index(spec)
    }

    /// Generate and persist the embedding for one entity.
    ///
    /// Provider failures degrade to a fallback vector marked with
    /// `source: "fallback"` in the embedding metadata.
    #[instrument(skip(self, entity), fields(id = %entity.id))]
    pub async fn generate_and_store(&self, entity: &Entity) -> Result<bool> {
        let digest = entity.content_digest();
        let (vector, fallback) = match self.provider.embed_text(&digest).await {
            Ok(vector) => (vector, false),
            Err(err) => {
                warn!(id = %entity.id, "embedding provider failed, using fallback: {err:#}");
                (fallback_vector(&digest, self.config.dimensions), true)
            }
        };

        let mut metadata = Map::new();
        metadata.insert(
            "source".to_string(),
            Value::from(if fallback { "fallback" } else { "provider" }),
        );
        metadata.insert(
            "model".to_string(),
            Value::from(self.provider.model_name().to_string()),
        );
        metadata.insert(
            "generatedAt".to_string(),
            Value::from(Utc::now().to_rfc3339()),
        );
        let mut properties = Map::new();
        properties.insert("embeddingMetadata".to_string(), Value::Object(metadata));

        self.vectors
            .upsert_vectors(
                "Entity",
                vec![VectorRecord {
                    id: entity.id.clone(),
                    vector: vector.clone(),
                    properties: Some(properties),
                }],
            )
            .await?;

        self.cache.lock().await.put(entity.id.clone(), vector);
        crate::observability::record_metric(crate::observability::MetricType::Counter {
            name: "embedding.generated",
            value: 1,
        });
        Ok(fallback)
    }

    /// Embed a set of entities in bounded-concurrency batches, recording
    /// per-entity failures and emitting progress events.
    #[instrument(skip(self, entities), fields(count = entities.len()))]
    pub async fn batch_embed(
        &self,
        entities: &[Entity],
        checkpoint_id: Option<ChangeSetId>,
    ) -> Result<BatchEmbedOutcome> {
        let mut outcome = BatchEmbedOutcome {
            checkpoint_id,
            ..Default::default()
        };
        let total = entities.len();
        for chunk in entities.chunks(self.config.batch_size.max(1)) {
            let permit = self
                .in_flight
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore never closed");
            for entity in chunk {
                match self.generate_and_store(entity).await {
                    Ok(true) => {
                        outcome.processed += 1;
                        outcome.fallbacks += 1;
                    }
                    Ok(false) => outcome.processed += 1,
                    Err(err) => outcome.failures.push(EmbedFailure {
                        entity_id: entity.id.clone(),
                        error: format!("{err:#}"),
                    }),
                }
            }
            drop(permit);
            self.events.publish(EngineEvent::EmbeddingProgress {
                processed: outcome.processed,
                total,
            });
        }
        debug!(
            processed = outcome.processed,
            failures = outcome.failures.len(),
            "batch embedding finished"
        );
        Ok(outcome)
    }

    /// Semantic search: embed the query, delegate to the vector index, and
    /// parse hits back into entities.
    pub async fn search(&self, query: &str, opts: &VectorSearchOptions) -> Result<Vec<SemanticHit>> {
        let query_vector = self.provider.embed_text(query).await.unwrap_or_else(|_| {
            fallback_vector(query, self.config.dimensions)
        });
        let hits = self
            .vectors
            .search(&self.config.index_name, &query_vector, opts)
            .await?;
        let mut parsed = Vec::with_capacity(hits.len());
        for hit in hits {
            match from_node(&hit.node) {
                Ok(entity) => parsed.push(SemanticHit {
                    entity,
                    score: hit.score,
                }),
                Err(err) => debug!("skipping non-entity vector hit: {err:#}"),
            }
        }
        Ok(parsed)
    }

    /// Entities similar to a given one, excluding itself. Checks the local
    /// cache before touching the store.
    pub async fn find_similar(
        &self,
        entity_id: &EntityId,
        opts: &VectorSearchOptions,
    ) -> Result<Vec<SemanticHit>> {
        let cached = self.cache.lock().await.get(entity_id);
        let hits = match cached {
            Some(vector) => {
                let mut widened = opts.clone();
                widened.limit = if opts.limit == 0 { 10 } else { opts.limit } + 1;
                self.vectors
                    .search(&self.config.index_name, &vector, &widened)
                    .await?
                    .into_iter()
                    .filter(|h| &h.node.id != entity_id)
                    .take(if opts.limit == 0 { 10 } else { opts.limit })
                    .collect()
            }
            None => {
                self.vectors
                    .find_similar(&self.config.index_name, entity_id, opts)
                    .await?
            }
        };
        let mut parsed = Vec::with_capacity(hits.len());
        for hit in hits {
            if let Ok(entity) = from_node(&hit.node) {
                parsed.push(SemanticHit {
                    entity,
                    score: hit.score,
                });
            }
        }
        Ok(parsed)
    }

    /// Drop an entity from the embedding cache (deletion path).
    pub async fn evict(&self, entity_id: &EntityId) {
        self.cache.lock().await.remove(entity_id);
    }

    /// Index statistics; magnitude averaged over a bounded sample.
    pub async fn get_stats(&self) -> Result<EmbeddingStats> {
        const SAMPLE: usize = 100;
        let mut stats = EmbeddingStats {
            dimensions: self.config.dimensions,
            cache_entries: self.cache.lock().await.len(),
            ..Default::default()
        };
        let hits = {
            // Zero query vector scores everything 0; use the fallback scan
            // path via a neutral probe vector instead.
            let probe = vec![1.0 / (self.config.dimensions as f32).sqrt(); self.config.dimensions];
            self.vectors
                .search(
                    &self.config.index_name,
                    &probe,
                    &VectorSearchOptions {
                        limit: SAMPLE,
                        min_score: f32::MIN,
                        filter: None,
                    },
                )
                .await?
        };
        stats.indexed = hits.len();
        if !hits.is_empty() {
            let mut magnitude_sum = 0.0f32;
            for hit in &hits {
                if let Some(embedding) = hit.node.properties.get("embedding") {
                    if let Some(arr) = embedding.as_array() {
                        let norm: f32 = arr
                            .iter()
                            .filter_map(Value::as_f64)
                            .map(|v| (v * v) as f32)
                            .sum::<f32>()
                            .sqrt();
                        magnitude_sum += norm;
                    }
                }
            }
            stats.average_magnitude = magnitude_sum / hits.len() as f32;
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::{EmbeddingResult, HashEmbeddingProvider};
    use crate::entity::{EntityData, SymbolData, SymbolKind};
    use crate::events::RecordingSubscriber;
    use crate::executor::GraphExecutor;
    use crate::memory_graph::MemoryGraphStore;

    fn symbol(id: &str, name: &str) -> Entity {
        Entity::new(
            EntityId::new(id).unwrap(),
            EntityData::Symbol(SymbolData {
                name: name.to_string(),
                kind: SymbolKind::Function,
                signature: format!("function {name}()"),
                docstring: None,
                visibility: "public".to_string(),
                is_exported: true,
                is_deprecated: false,
                location: None,
                detail: Default::default(),
            }),
        )
    }

    fn build_service(dimensions: usize) -> (EmbeddingService, Arc<EventBus>, Arc<GraphExecutor>) {
        let store = Arc::new(MemoryGraphStore::new());
        let events = Arc::new(EventBus::new());
        let exec = Arc::new(GraphExecutor::new(store, events.clone()));
        let vectors = Arc::new(VectorIndexService::new(exec.clone()));
        let provider = Arc::new(HashEmbeddingProvider::with_dimensions(dimensions));
        let svc = EmbeddingService::new(provider, vectors, events.clone());
        svc.initialize_index().unwrap();
        (svc, events, exec)
    }

    async fn seed_entity(exec: &GraphExecutor, entity: &Entity) {
        let node = crate::entity_service::to_node(entity).unwrap();
        exec.execute(
            crate::graph_store::Statement::UpsertNode(node),
            crate::executor::ExecOptions::write(),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn identical_entities_store_identical_vectors() -> Result<()> {
        let (svc, _, _exec) = build_service(32);
        let entity = symbol("sym:a.ts#login", "login");
        svc.generate_and_store(&entity).await?;
        let first = svc.vectors.vector_of("Entity", &entity.id).await?.unwrap();
        svc.generate_and_store(&entity).await?;
        let second = svc.vectors.vector_of("Entity", &entity.id).await?.unwrap();
        assert_eq!(first, second);
        Ok(())
    }

    #[tokio::test]
    async fn batch_embed_emits_progress_and_counts() -> Result<()> {
        let (svc, events, _exec) = build_service(16);
        let recorder = Arc::new(RecordingSubscriber::new());
        events.subscribe(recorder.clone()).unwrap();

        let entities: Vec<Entity> = (0..7)
            .map(|i| symbol(&format!("sym:f{i}"), &format!("f{i}")))
            .collect();
        let outcome = svc.batch_embed(&entities, None).await?;
        assert_eq!(outcome.processed, 7);
        assert!(outcome.failures.is_empty());
        assert!(recorder
            .events()
            .iter()
            .any(|e| matches!(e, EngineEvent::EmbeddingProgress { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn provider_failure_falls_back_with_marker() -> Result<()> {
        struct BrokenProvider;
        #[async_trait::async_trait]
        impl EmbeddingProvider for BrokenProvider {
            async fn embed_texts(&self, _texts: &[String]) -> Result<EmbeddingResult> {
                Err(crate::errors::KgError::ProviderFailure("down".into()).into())
            }
            fn dimension(&self) -> usize {
                16
            }
            fn model_name(&self) -> &str {
                "broken"
            }
            fn max_batch_size(&self) -> usize {
                8
            }
        }

        let store = Arc::new(MemoryGraphStore::new());
        let events = Arc::new(EventBus::new());
        let exec = Arc::new(GraphExecutor::new(store, events.clone()));
        let vectors = Arc::new(VectorIndexService::new(exec.clone()));
        let svc = EmbeddingService::new(Arc::new(BrokenProvider), vectors, events);
        svc.initialize_index()?;

        let entity = symbol("sym:x", "x");
        let used_fallback = svc.generate_and_store(&entity).await?;
        assert!(used_fallback);

        let node = exec
            .get_node(&entity.id, crate::executor::ExecOptions::default())
            .await?
            .unwrap();
        let source = node
            .properties
            .get("embeddingMetadata")
            .and_then(|m| m.get("source"))
            .and_then(Value::as_str);
        assert_eq!(source, Some("fallback"));
        Ok(())
    }

    #[tokio::test]
    async fn semantic_search_returns_closest_entity() -> Result<()> {
        let (svc, _, exec) = build_service(64);
        let auth = symbol("sym:auth", "authenticateUser");
        let parse = symbol("sym:parse", "parseManifest");
        seed_entity(&exec, &auth).await;
        seed_entity(&exec, &parse).await;
        svc.generate_and_store(&auth).await?;
        svc.generate_and_store(&parse).await?;

        let hits = svc
            .search(
                "Name: authenticateUser\nType: symbol\nContent: function authenticateUser()",
                &VectorSearchOptions {
                    limit: 2,
                    min_score: -1.0,
                    filter: None,
                },
            )
            .await?;
        assert!(!hits.is_empty());
        assert_eq!(hits[0].entity.id.as_str(), "sym:auth");
        Ok(())
    }

    #[tokio::test]
    async fn find_similar_excludes_self() -> Result<()> {
        let (svc, _, exec) = build_service(32);
        let a = symbol("sym:a", "alpha");
        let b = symbol("sym:b", "alphaBeta");
        seed_entity(&exec, &a).await;
        seed_entity(&exec, &b).await;
        svc.generate_and_store(&a).await?;
        svc.generate_and_store(&b).await?;
        let hits = svc
            .find_similar(
                &a.id,
                &VectorSearchOptions {
                    limit: 5,
                    min_score: -1.0,
                    filter: None,
                },
            )
            .await?;
        assert!(hits.iter().all(|h| h.entity.id.as_str() != "sym:a"));
        Ok(())
    }

    #[tokio::test]
    async fn stats_report_dimensions_and_counts() -> Result<()> {
        let (svc, _, _exec) = build_service(32);
        svc.generate_and_store(&symbol("sym:a", "alpha")).await?;
        let stats = svc.get_stats().await?;
        assert_eq!(stats.dimensions, 32);
        assert_eq!(stats.indexed, 1);
        assert!(stats.average_magnitude > 0.9);
        Ok(())
    }
}
