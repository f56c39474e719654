//! Unified search: structural, semantic, and hybrid strategies
//!
//! Strategy selection is driven by the request shape: path-like queries go
//! structural, explicit requests are honored, everything else runs hybrid.
//! Hybrid merges both result sets, boosting structural hits and averaging
//! duplicates. Responses are cached by canonical request key with a
//! bounded LRU + TTL.

use anyhow::Result;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::instrument;

use crate::embedding_service::EmbeddingService;
use crate::executor::{ExecOptions, GraphExecutor};
use crate::graph_store::{NodeQuery, StoredNode};
use crate::types::EntityId;
use crate::vector_index::VectorSearchOptions;
use crate::events::{EngineEvent, EventBus};

/// Structural hits are boosted by this factor in hybrid merges.
const STRUCTURAL_BOOST: f32 = 1.2;
/// Minimum Levenshtein similarity for a fuzzy structural match.
const FUZZY_THRESHOLD: f32 = 0.6;
const CACHE_CAPACITY: usize = 100;
const CACHE_TTL: Duration = Duration::from_secs(60);
/// Latency window retained for metrics.
const LATENCY_WINDOW: usize = 100;
/// Labels fanned out by default when the request names no entity types.
const DEFAULT_LABELS: &[&str] = &["File", "Symbol", "Module", "Documentation", "Spec", "Test"];

/// Requested search strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchType {
    Structural,
    Semantic,
    Hybrid,
}

/// Search filters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub fuzzy: bool,
}

impl SearchFilters {
    /// Number of filter dimensions in play (strategy selection input).
    fn dimensions(&self) -> usize {
        let mut dims = 0;
        if self.language.is_some() {
            dims += 1;
        }
        if self.path_prefix.is_some() {
            dims += 1;
        }
        if !self.tags.is_empty() {
            dims += 1;
        }
        dims
    }
}

/// A search request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    pub query: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entity_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_type: Option<SearchType>,
    #[serde(default)]
    pub filters: SearchFilters,
    #[serde(default)]
    pub include_related: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

/// How a result matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    Structural,
    Semantic,
    Merged,
}

/// One search hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub entity_id: EntityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    pub score: f32,
    pub match_kind: MatchKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related: Vec<EntityId>,
}

/// Rolling search metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchStats {
    pub total_searches: u64,
    pub cache_hits: u64,
    pub hit_rate: f64,
    pub top_queries: Vec<(String, u64)>,
    pub recent_latency_ms: Vec<u64>,
}

struct CacheSlot {
    results: Vec<SearchResult>,
    inserted: Instant,
}

#[derive(Default)]
struct Metrics {
    total: u64,
    cache_hits: u64,
    query_counts: HashMap<String, u64>,
    latencies: VecDeque<u64>,
}

pub struct SearchService {
    executor: Arc<GraphExecutor>,
    embeddings: Arc<EmbeddingService>,
    events: Arc<EventBus>,
    cache: Mutex<HashMap<String, CacheSlot>>,
    cache_order: Mutex<VecDeque<String>>,
    metrics: Mutex<Metrics>,
}

impl SearchService {
    pub fn new(
        executor: Arc<GraphExecutor>,
        embeddings: Arc<EmbeddingService>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            executor,
            embeddings,
            events,
            cache: Mutex::new(HashMap::new()),
            cache_order: Mutex::new(VecDeque::new()),
            metrics: Mutex::new(Metrics::default()),
        }
    }

    /// Pick the strategy for a request.
    pub fn select_strategy(request: &SearchRequest) -> SearchType {
        if request.query.contains('/')
            || request.query.contains(':')
            || request.filters.dimensions() > 2
        {
            return SearchType::Structural;
        }
        match request.search_type {
            Some(SearchType::Semantic) => SearchType::Semantic,
            Some(SearchType::Structural) => SearchType::Structural,
            _ => SearchType::Hybrid,
        }
    }

    /// Run a search request end to end, consulting the cache first.
    #[instrument(skip(self, request), fields(query = %request.query))]
    pub async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchResult>> {
        let key = request_key(request)?;
        let started = Instant::now();

        if let Some(results) = self.cache_get(&key).await {
            let mut metrics = self.metrics.lock().await;
            metrics.total += 1;
            metrics.cache_hits += 1;
            *metrics.query_counts.entry(request.query.clone()).or_default() += 1;
            drop(metrics);
            self.events.publish(EngineEvent::SearchCacheHit { key });
            return Ok(results);
        }

        let strategy = Self::select_strategy(request);
        let limit = request.limit.unwrap_or(10).max(1);
        let mut results = match strategy {
            SearchType::Structural => self.structural(request, limit).await?,
            SearchType::Semantic => self.semantic(request, limit).await?,
            SearchType::Hybrid => self.hybrid(request, limit).await?,
        };
        results.truncate(limit);

        if request.include_related {
            for result in results.iter_mut() {
                let outgoing = self
                    .executor
                    .outgoing(&result.entity_id, ExecOptions::default())
                    .await?;
                result.related = outgoing.into_iter().map(|e| e.to).take(5).collect();
            }
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        {
            let mut metrics = self.metrics.lock().await;
            metrics.total += 1;
            *metrics.query_counts.entry(request.query.clone()).or_default() += 1;
            metrics.latencies.push_back(elapsed_ms);
            while metrics.latencies.len() > LATENCY_WINDOW {
                metrics.latencies.pop_front();
            }
        }
        self.cache_put(key, results.clone()).await;
        self.events.publish(EngineEvent::SearchCompleted {
            strategy: format!("{strategy:?}").to_lowercase(),
            results: results.len(),
            latency_ms: elapsed_ms,
        });
        Ok(results)
    }

    /// Structural search: parallel per-label fan-out with substring or
    /// fuzzy name matching.
    async fn structural(&self, request: &SearchRequest, limit: usize) -> Result<Vec<SearchResult>> {
        let labels = self.labels_for(request);
        let needle = request.query.to_lowercase();
        let fuzzy = request.filters.fuzzy;

        let fetches = labels.iter().map(|label| {
            let mut query = NodeQuery::by_label(label.clone());
            if let Some(lang) = &request.filters.language {
                query
                    .equals
                    .push(("language".to_string(), Value::from(lang.clone())));
            }
            query.path_prefix = request.filters.path_prefix.clone();
            // Candidate pool per label; matching happens host-side
            query.limit = Some(limit * 10);
            let executor = self.executor.clone();
            async move { executor.query_nodes(&query, ExecOptions::default()).await }
        });

        let mut hits: Vec<SearchResult> = Vec::new();
        for fetched in join_all(fetches).await {
            for node in fetched? {
                if !request.filters.tags.is_empty() && !node_has_tags(&node, &request.filters.tags)
                {
                    continue;
                }
                if let Some(score) = structural_score(&node, &needle, fuzzy) {
                    hits.push(result_from_node(&node, score, MatchKind::Structural));
                }
            }
        }
        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.entity_id.cmp(&b.entity_id))
        });
        hits.dedup_by(|a, b| a.entity_id == b.entity_id);
        hits.truncate(limit);
        Ok(hits)
    }

    /// Semantic search via the embedding service.
    async fn semantic(&self, request: &SearchRequest, limit: usize) -> Result<Vec<SearchResult>> {
        let mut filter = serde_json::Map::new();
        if let Some(lang) = &request.filters.language {
            filter.insert("language".to_string(), Value::from(lang.clone()));
        }
        let hits = self
            .embeddings
            .search(
                &request.query,
                &VectorSearchOptions {
                    limit,
                    min_score: 0.0,
                    filter: if filter.is_empty() { None } else { Some(filter) },
                },
            )
            .await?;
        Ok(hits
            .into_iter()
            .map(|hit| SearchResult {
                entity_id: hit.entity.id.clone(),
                name: hit.entity.name().map(str::to_string),
                path: hit.entity.path.as_ref().map(|p| p.as_str().to_string()),
                entity_type: Some(hit.entity.type_name().to_string()),
                score: hit.score,
                match_kind: MatchKind::Semantic,
                related: Vec::new(),
            })
            .collect())
    }

    /// Hybrid: run both strategies at half limit, boost structural scores,
    /// and average duplicates.
    async fn hybrid(&self, request: &SearchRequest, limit: usize) -> Result<Vec<SearchResult>> {
        let half = (limit / 2).max(1);
        let (structural, semantic) = tokio::join!(
            self.structural(request, half),
            self.semantic(request, half)
        );
        let structural = structural?;
        let semantic = semantic?;

        let mut merged: HashMap<EntityId, SearchResult> = HashMap::new();
        for mut hit in structural {
            hit.score *= STRUCTURAL_BOOST;
            merged.insert(hit.entity_id.clone(), hit);
        }
        for hit in semantic {
            match merged.get_mut(&hit.entity_id) {
                Some(existing) => {
                    existing.score = (existing.score + hit.score) / 2.0;
                    existing.match_kind = MatchKind::Merged;
                }
                None => {
                    merged.insert(hit.entity_id.clone(), hit);
                }
            }
        }
        let mut results: Vec<SearchResult> = merged.into_values().collect();
        results.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.entity_id.cmp(&b.entity_id))
        });
        results.truncate(limit);
        Ok(results)
    }

    fn labels_for(&self, request: &SearchRequest) -> Vec<String> {
        if request.entity_types.is_empty() {
            DEFAULT_LABELS.iter().map(|l| l.to_string()).collect()
        } else {
            request
                .entity_types
                .iter()
                .map(|t| type_to_label(t))
                .collect()
        }
    }

    async fn cache_get(&self, key: &str) -> Option<Vec<SearchResult>> {
        let mut cache = self.cache.lock().await;
        match cache.get(key) {
            Some(slot) if slot.inserted.elapsed() <= CACHE_TTL => Some(slot.results.clone()),
            Some(_) => {
                cache.remove(key);
                None
            }
            None => None,
        }
    }

    async fn cache_put(&self, key: String, results: Vec<SearchResult>) {
        let mut cache = self.cache.lock().await;
        let mut order = self.cache_order.lock().await;
        if !cache.contains_key(&key) && cache.len() >= CACHE_CAPACITY {
            while let Some(evicted) = order.pop_front() {
                if cache.remove(&evicted).is_some() {
                    break;
                }
            }
        }
        order.push_back(key.clone());
        cache.insert(
            key,
            CacheSlot {
                results,
                inserted: Instant::now(),
            },
        );
    }

    /// Drop all cached responses.
    pub async fn clear_cache(&self) {
        self.cache.lock().await.clear();
        self.cache_order.lock().await.clear();
        self.events.publish(EngineEvent::CacheCleared);
    }

    /// Rolling metrics: totals, hit rate, top queries, latency window.
    pub async fn get_search_stats(&self) -> SearchStats {
        let metrics = self.metrics.lock().await;
        let mut top: Vec<(String, u64)> = metrics
            .query_counts
            .iter()
            .map(|(q, c)| (q.clone(), *c))
            .collect();
        top.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top.truncate(10);
        SearchStats {
            total_searches: metrics.total,
            cache_hits: metrics.cache_hits,
            hit_rate: if metrics.total > 0 {
                metrics.cache_hits as f64 / metrics.total as f64
            } else {
                0.0
            },
            top_queries: top,
            recent_latency_ms: metrics.latencies.iter().copied().collect(),
        }
    }
}

/// Canonical cache key: the JSON serialization of the request.
fn request_key(request: &SearchRequest) -> Result<String> {
    Ok(serde_json::to_string(request)?)
}

fn type_to_label(entity_type: &str) -> String {
    let mut chars = entity_type.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

fn node_has_tags(node: &StoredNode, tags: &[String]) -> bool {
    node.properties
        .get("metadata")
        .and_then(|m| m.get("tags"))
        .and_then(Value::as_array)
        .map(|node_tags| {
            tags.iter()
                .all(|t| node_tags.iter().any(|v| v.as_str() == Some(t)))
        })
        .unwrap_or(false)
}

fn result_from_node(node: &StoredNode, score: f32, kind: MatchKind) -> SearchResult {
    SearchResult {
        entity_id: node.id.clone(),
        name: node
            .properties
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string),
        path: node
            .properties
            .get("path")
            .and_then(Value::as_str)
            .map(str::to_string),
        entity_type: node
            .properties
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_string),
        score,
        match_kind: kind,
        related: Vec::new(),
    }
}

/// Score a node structurally: exact substring on name, path, or id scores
/// 1.0; fuzzy name similarity scores its Levenshtein ratio.
fn structural_score(node: &StoredNode, needle: &str, fuzzy: bool) -> Option<f32> {
    let name = node
        .properties
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("");
    let path = node
        .properties
        .get("path")
        .and_then(Value::as_str)
        .unwrap_or("");
    let id = node.id.as_str();

    // Multi-word queries match if every word hits
    let words: Vec<&str> = needle.split_whitespace().collect();
    let exact = if words.is_empty() {
        false
    } else {
        words.iter().all(|w| {
            name.to_lowercase().contains(w)
                || path.to_lowercase().contains(w)
                || id.to_lowercase().contains(w)
        })
    };
    if exact {
        return Some(1.0);
    }
    if fuzzy && !name.is_empty() {
        let similarity = levenshtein_similarity(&name.to_lowercase(), needle);
        if similarity >= FUZZY_THRESHOLD {
            return Some(similarity);
        }
    }
    None
}

/// Levenshtein similarity in [0, 1].
pub fn levenshtein_similarity(a: &str, b: &str) -> f32 {
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();
    let max_len = a_chars.len().max(b_chars.len());
    if max_len == 0 {
        return 1.0;
    }
    let distance = levenshtein(&a_chars, &b_chars);
    1.0 - distance as f32 / max_len as f32
}

fn levenshtein(a: &[char], b: &[char]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(prev[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut prev, &mut current);
    }
    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::HashEmbeddingProvider;
    use crate::entity::{Entity, EntityData, FileData, SymbolData, SymbolKind};
    use crate::entity_service::EntityService;
    use crate::events::RecordingSubscriber;
    use crate::memory_graph::MemoryGraphStore;
    use crate::types::RepoPath;
    use crate::vector_index::VectorIndexService;

    async fn build() -> (SearchService, Arc<EntityService>, Arc<EmbeddingService>, Arc<EventBus>) {
        let store = Arc::new(MemoryGraphStore::new());
        let events = Arc::new(EventBus::new());
        let exec = Arc::new(GraphExecutor::new(store, events.clone()));
        let vectors = Arc::new(VectorIndexService::new(exec.clone()));
        let provider = Arc::new(HashEmbeddingProvider::with_dimensions(64));
        let embeddings = Arc::new(EmbeddingService::new(provider, vectors, events.clone()));
        embeddings.initialize_index().unwrap();
        let entities = Arc::new(EntityService::new(exec.clone()));
        let search = SearchService::new(exec, embeddings.clone(), events.clone());
        (search, entities, embeddings, events)
    }

    fn symbol(id: &str, name: &str, path: &str) -> Entity {
        Entity::new(
            EntityId::new(id).unwrap(),
            EntityData::Symbol(SymbolData {
                name: name.to_string(),
                kind: SymbolKind::Class,
                signature: format!("class {name}"),
                docstring: None,
                visibility: "public".to_string(),
                is_exported: true,
                is_deprecated: false,
                location: None,
                detail: Default::default(),
            }),
        )
        .with_path(RepoPath::new(path).unwrap())
        .with_language("typescript")
    }

    fn file(id: &str, path: &str) -> Entity {
        Entity::new(
            EntityId::new(id).unwrap(),
            EntityData::File(FileData {
                extension: "ts".into(),
                size: 10,
                lines: 1,
                is_test: false,
                is_config: false,
                dependencies: vec![],
            }),
        )
        .with_path(RepoPath::new(path).unwrap())
        .with_language("typescript")
    }

    #[test]
    fn slash_and_colon_queries_select_structural() {
        let request = SearchRequest {
            query: "src/auth.ts".to_string(),
            search_type: Some(SearchType::Semantic),
            ..Default::default()
        };
        assert_eq!(SearchService::select_strategy(&request), SearchType::Structural);

        let request = SearchRequest {
            query: "sym:login".to_string(),
            ..Default::default()
        };
        assert_eq!(SearchService::select_strategy(&request), SearchType::Structural);

        let request = SearchRequest {
            query: "login".to_string(),
            ..Default::default()
        };
        assert_eq!(SearchService::select_strategy(&request), SearchType::Hybrid);
    }

    #[tokio::test]
    async fn structural_search_finds_substring_matches() -> Result<()> {
        let (search, entities, _, _) = build().await;
        entities
            .upsert(&symbol("sym:auth", "AuthService", "src/auth.ts"))
            .await?;
        entities
            .upsert(&symbol("sym:user", "UserService", "src/user.ts"))
            .await?;
        entities.upsert(&file("file:src/auth.ts", "src/auth.ts")).await?;

        let results = search
            .search(&SearchRequest {
                query: "auth".to_string(),
                search_type: Some(SearchType::Structural),
                ..Default::default()
            })
            .await?;
        assert!(results.len() >= 2);
        assert!(results.iter().all(|r| r.score == 1.0));
        Ok(())
    }

    #[tokio::test]
    async fn fuzzy_matching_scores_by_similarity() -> Result<()> {
        let (search, entities, _, _) = build().await;
        entities
            .upsert(&symbol("sym:auth", "AuthService", "src/auth.ts"))
            .await?;
        let results = search
            .search(&SearchRequest {
                query: "authservce".to_string(),
                search_type: Some(SearchType::Structural),
                filters: SearchFilters {
                    fuzzy: true,
                    ..Default::default()
                },
                ..Default::default()
            })
            .await?;
        assert_eq!(results.len(), 1);
        assert!(results[0].score >= FUZZY_THRESHOLD && results[0].score < 1.0);
        Ok(())
    }

    #[tokio::test]
    async fn hybrid_merges_and_boosts_structural() -> Result<()> {
        let (search, entities, embeddings, _) = build().await;
        let auth = symbol("sym:auth", "AuthService", "src/auth.ts");
        let user = symbol("sym:user", "UserService", "src/user.ts");
        entities.upsert(&auth).await?;
        entities.upsert(&user).await?;
        embeddings.generate_and_store(&auth).await?;
        embeddings.generate_and_store(&user).await?;

        let results = search
            .search(&SearchRequest {
                query: "service".to_string(),
                filters: SearchFilters {
                    language: Some("typescript".to_string()),
                    ..Default::default()
                },
                limit: Some(10),
                ..Default::default()
            })
            .await?;
        assert!(results.len() <= 10);
        // Both classes match structurally, so the hybrid merge keeps them
        assert!(results.len() >= 2);
        assert!(results
            .iter()
            .all(|r| r.score > 0.05));
        Ok(())
    }

    #[tokio::test]
    async fn repeated_requests_hit_the_cache() -> Result<()> {
        let (search, entities, _, events) = build().await;
        let recorder = Arc::new(RecordingSubscriber::new());
        events.subscribe(recorder.clone()).unwrap();
        entities
            .upsert(&symbol("sym:auth", "AuthService", "src/auth.ts"))
            .await?;

        let request = SearchRequest {
            query: "auth".to_string(),
            search_type: Some(SearchType::Structural),
            ..Default::default()
        };
        search.search(&request).await?;
        search.search(&request).await?;

        let stats = search.get_search_stats().await;
        assert_eq!(stats.total_searches, 2);
        assert_eq!(stats.cache_hits, 1);
        assert!(stats.hit_rate > 0.4);
        assert!(recorder
            .events()
            .iter()
            .any(|e| matches!(e, EngineEvent::SearchCacheHit { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn clear_cache_emits_event() -> Result<()> {
        let (search, _, _, events) = build().await;
        let recorder = Arc::new(RecordingSubscriber::new());
        events.subscribe(recorder.clone()).unwrap();
        search.clear_cache().await;
        assert!(recorder.events().contains(&EngineEvent::CacheCleared));
        Ok(())
    }

    #[test]
    fn levenshtein_similarity_bounds() {
        assert_eq!(levenshtein_similarity("abc", "abc"), 1.0);
        assert!(levenshtein_similarity("kitten", "sitting") > 0.5);
        assert!(levenshtein_similarity("abc", "xyz") < 0.1);
    }
}
