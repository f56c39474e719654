//! Relationship service: exclusive owner of edge mutation
//!
//! Edges are keyed by canonical identity so repeated observations merge
//! deterministically. Temporal transitions for one canonical id are
//! serialized through an advisory lock, which is what keeps the
//! one-active-interval invariant under concurrent syncs.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::errors::KgError;
use crate::executor::{ExecOptions, GraphExecutor};
use crate::graph_store::{EdgeQuery, Statement, StoredEdge};
use crate::relationship::{
    canonical_relationship_id, EdgeLocation, Evidence, RelationType, Relationship, MAX_EVIDENCE,
};
use crate::types::{ChangeSetId, EntityId};

/// Options controlling bulk relationship upserts.
#[derive(Debug, Clone, Copy, Default)]
pub struct BulkRelOptions {
    /// CREATE-only mode: an existing canonical edge counts as a failure.
    pub skip_existing: bool,
    /// MERGE mode: evidence/locations union, occurrence counts sum.
    pub merge_evidence: bool,
    /// Refresh `lastSeenAt`/`lastModified` on merge.
    pub update_timestamps: bool,
}

/// Outcome of a bulk relationship upsert.
#[derive(Debug, Clone, Default)]
pub struct BulkRelOutcome {
    pub created: usize,
    pub merged: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

/// Dependency-graph analysis over active code edges.
#[derive(Debug, Clone, Default)]
pub struct DependencyAnalysis {
    pub total_nodes: usize,
    pub total_edges: usize,
    /// Strongly connected components with more than one member.
    pub cycles: Vec<Vec<EntityId>>,
    /// Entities with no code-edge connectivity at all.
    pub orphaned: Vec<EntityId>,
    /// Highest-degree entities, capped at ten.
    pub highly_coupled: Vec<(EntityId, usize)>,
}

/// Aggregate statistics over stored relationships.
#[derive(Debug, Clone, Default)]
pub struct RelationshipStats {
    pub total: usize,
    pub active: usize,
    pub closed: usize,
    pub by_type: HashMap<String, usize>,
    pub average_confidence: Option<f64>,
    pub max_evidence_items: usize,
}

pub struct RelationshipService {
    executor: Arc<GraphExecutor>,
    /// Advisory locks serializing temporal transitions per canonical id.
    canonical_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl RelationshipService {
    pub fn new(executor: Arc<GraphExecutor>) -> Self {
        Self {
            executor,
            canonical_locks: DashMap::new(),
        }
    }

    fn lock_for(&self, canonical_id: &str) -> Arc<Mutex<()>> {
        self.canonical_locks
            .entry(canonical_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Create a single normalized edge.
    #[instrument(skip(self, rel), fields(rel_type = %rel.rel_type))]
    pub async fn create(&self, mut rel: Relationship) -> Result<Relationship> {
        rel.normalize()?;
        let edge = to_edge(&rel)?;
        self.executor
            .execute(Statement::UpsertEdge(edge), ExecOptions::write())
            .await?;
        Ok(rel)
    }

    pub async fn get(&self, id: &str) -> Result<Relationship> {
        let edge = self
            .executor
            .get_edge(id, ExecOptions::default())
            .await?
            .ok_or_else(|| KgError::not_found("relationship", id))?;
        from_edge(&edge)
    }

    pub async fn try_get(&self, id: &str) -> Result<Option<Relationship>> {
        match self.executor.get_edge(id, ExecOptions::default()).await? {
            Some(edge) => Ok(Some(from_edge(&edge)?)),
            None => Ok(None),
        }
    }

    pub async fn list(&self, query: &EdgeQuery) -> Result<Vec<Relationship>> {
        let edges = self
            .executor
            .query_edges(query, ExecOptions::default())
            .await?;
        edges.iter().map(from_edge).collect()
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        if self
            .executor
            .get_edge(id, ExecOptions::default())
            .await?
            .is_none()
        {
            return Err(KgError::not_found("relationship", id).into());
        }
        self.executor
            .execute(Statement::DeleteEdge { id: id.to_string() }, ExecOptions::write())
            .await
    }

    /// Bulk upsert, grouped by relationship type.
    ///
    /// With `merge_evidence`, an existing canonical edge absorbs the new
    /// observation (evidence union, occurrence sum, max confidence). With
    /// `skip_existing`, a guarded CREATE is attempted and an existing edge
    /// counts as a failure.
    #[instrument(skip(self, rels), fields(count = rels.len()))]
    pub async fn bulk_upsert(
        &self,
        rels: Vec<Relationship>,
        opts: BulkRelOptions,
    ) -> Result<BulkRelOutcome> {
        let mut outcome = BulkRelOutcome::default();

        // Group by type so each group ships as one transaction
        let mut groups: HashMap<RelationType, Vec<Relationship>> = HashMap::new();
        for mut rel in rels {
            if let Err(err) = rel.normalize() {
                outcome.failed += 1;
                outcome.errors.push(format!("{err:#}"));
                continue;
            }
            groups.entry(rel.rel_type.clone()).or_default().push(rel);
        }

        for (rel_type, group) in groups {
            let mut statements = Vec::with_capacity(group.len());
            let mut group_created = 0usize;
            let mut group_merged = 0usize;
            let mut group_failures: Vec<String> = Vec::new();

            for rel in &group {
                let existing = self
                    .executor
                    .get_edge(&rel.id, ExecOptions::default())
                    .await?;
                match existing {
                    Some(edge) if opts.skip_existing => {
                        group_failures.push(format!(
                            "edge {} already exists for type {rel_type}",
                            edge.id
                        ));
                    }
                    Some(edge) if opts.merge_evidence => {
                        let mut stored = from_edge(&edge)?;
                        stored.merge_observation(rel);
                        if !opts.update_timestamps {
                            stored.last_modified = rel.last_modified.max(stored.last_modified);
                        }
                        statements.push(Statement::UpsertEdge(to_edge(&stored)?));
                        group_merged += 1;
                    }
                    Some(_) => {
                        // Plain re-assertion refreshes visibility only
                        let mut props = Map::new();
                        props.insert(
                            "lastSeenAt".to_string(),
                            Value::from(Utc::now().to_rfc3339()),
                        );
                        statements.push(Statement::MergeEdgeProperties {
                            id: rel.id.clone(),
                            properties: props,
                        });
                        group_merged += 1;
                    }
                    None if opts.skip_existing => {
                        statements.push(Statement::CreateEdgeIfAbsent(to_edge(rel)?));
                        group_created += 1;
                    }
                    None => {
                        statements.push(Statement::UpsertEdge(to_edge(rel)?));
                        group_created += 1;
                    }
                }
            }

            if !group_failures.is_empty() && opts.skip_existing {
                outcome.failed += group_failures.len();
                outcome.errors.extend(group_failures);
            }

            match self
                .executor
                .transaction(&statements, ExecOptions::write())
                .await
            {
                Ok(()) => {
                    outcome.created += group_created;
                    outcome.merged += group_merged;
                }
                Err(err) => {
                    warn!(%rel_type, "bulk relationship batch failed: {err:#}");
                    outcome.failed += statements.len();
                    outcome.errors.push(format!("{err:#}"));
                }
            }
        }
        Ok(outcome)
    }

    /// Mark active edges unseen since `cutoff` as inactive. Returns the
    /// exact number of edges mutated; calling again is a no-op.
    #[instrument(skip(self))]
    pub async fn mark_inactive_not_seen_since(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let active = self
            .executor
            .query_edges(
                &EdgeQuery {
                    active: Some(true),
                    ..Default::default()
                },
                ExecOptions::default(),
            )
            .await?;
        let mut statements = Vec::new();
        for edge in &active {
            let last_seen = edge
                .properties
                .get("lastSeenAt")
                .and_then(Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc));
            let stale = match last_seen {
                Some(seen) => seen < cutoff,
                None => true,
            };
            if stale {
                let mut props = Map::new();
                props.insert("active".to_string(), Value::from(false));
                props.insert(
                    "lastModified".to_string(),
                    Value::from(Utc::now().to_rfc3339()),
                );
                statements.push(Statement::MergeEdgeProperties {
                    id: edge.id.clone(),
                    properties: props,
                });
            }
        }
        let count = statements.len();
        if count > 0 {
            self.executor
                .transaction(&statements, ExecOptions::write())
                .await?;
        }
        debug!(count, "marked stale edges inactive");
        Ok(count)
    }

    /// Merge duplicate edges between the same endpoints with the same type
    /// and equivalent target reference. Returns the number of edges folded
    /// away.
    #[instrument(skip(self))]
    pub async fn merge_normalized_duplicates(&self) -> Result<usize> {
        let all = self
            .executor
            .query_edges(&EdgeQuery::default(), ExecOptions::default())
            .await?;
        // Key: endpoints + type + target reference
        let mut groups: HashMap<String, Vec<Relationship>> = HashMap::new();
        for edge in &all {
            let rel = from_edge(edge)?;
            let key = format!(
                "{}|{}|{}|{}",
                rel.from_entity_id,
                rel.to_entity_id,
                rel.rel_type,
                rel.to_ref
                    .as_ref()
                    .map(|r| r.target_key())
                    .unwrap_or_default()
            );
            groups.entry(key).or_default().push(rel);
        }

        let mut statements = Vec::new();
        let mut merged_away = 0usize;
        for (_, mut group) in groups {
            if group.len() < 2 {
                continue;
            }
            group.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
            let mut survivor = group.remove(0);
            for duplicate in &group {
                survivor.merge_observation(duplicate);
                statements.push(Statement::DeleteEdge {
                    id: duplicate.id.clone(),
                });
                merged_away += 1;
            }
            statements.push(Statement::UpsertEdge(to_edge(&survivor)?));
        }
        if !statements.is_empty() {
            self.executor
                .transaction(&statements, ExecOptions::write())
                .await?;
        }
        Ok(merged_away)
    }

    /// Replace auxiliary evidence/location lists on an edge, enforcing the
    /// bound.
    pub async fn update_auxiliary(
        &self,
        id: &str,
        evidence: Option<Vec<Evidence>>,
        locations: Option<Vec<EdgeLocation>>,
    ) -> Result<()> {
        let mut rel = self.get(id).await?;
        if let Some(evidence) = evidence {
            rel.evidence = evidence;
        }
        if let Some(locations) = locations {
            rel.locations = locations;
        }
        rel.normalize()?;
        debug_assert!(rel.evidence.len() <= MAX_EVIDENCE);
        self.executor
            .execute(Statement::UpsertEdge(to_edge(&rel)?), ExecOptions::write())
            .await
    }

    /// Open a temporal interval for `(from, type, to)` at `at`.
    ///
    /// A new interval record is created per transition; all records of one
    /// canonical edge share the `canonicalId` property. If an interval is
    /// already active, the call refreshes it instead of opening a second
    /// one.
    pub async fn open_edge(
        &self,
        from: &EntityId,
        to: &EntityId,
        rel_type: RelationType,
        at: DateTime<Utc>,
        change_set_id: Option<ChangeSetId>,
    ) -> Result<Relationship> {
        let canonical = canonical_relationship_id(from, &rel_type, to.as_str());
        let lock = self.lock_for(&canonical);
        let _guard = lock.lock().await;

        if let Some(active) = self.active_interval(&canonical).await? {
            let mut props = Map::new();
            props.insert(
                "lastSeenAt".to_string(),
                Value::from(Utc::now().to_rfc3339()),
            );
            self.executor
                .execute(
                    Statement::MergeEdgeProperties {
                        id: active.id.clone(),
                        properties: props,
                    },
                    ExecOptions::write(),
                )
                .await?;
            return Ok(active);
        }

        let mut rel = Relationship::new(from.clone(), to.clone(), rel_type);
        rel.valid_from = at;
        rel.valid_to = None;
        rel.active = true;
        rel.change_set_id = change_set_id;
        rel.normalize()?;
        // Interval records carry a distinct id per transition
        rel.id = format!("{canonical}@{}", at.timestamp_millis());
        self.executor
            .execute(Statement::UpsertEdge(to_edge(&rel)?), ExecOptions::write())
            .await?;
        Ok(rel)
    }

    /// Close the active interval for `(from, type, to)` at `at`. No-op if
    /// the edge is already closed.
    pub async fn close_edge(
        &self,
        from: &EntityId,
        to: &EntityId,
        rel_type: RelationType,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let canonical = canonical_relationship_id(from, &rel_type, to.as_str());
        let lock = self.lock_for(&canonical);
        let _guard = lock.lock().await;

        let Some(active) = self.active_interval(&canonical).await? else {
            return Ok(false);
        };
        if at < active.valid_from {
            return Err(KgError::validation(
                "validTo",
                "close instant precedes the interval's validFrom",
            )
            .into());
        }
        let mut props = Map::new();
        props.insert("validTo".to_string(), Value::from(at.to_rfc3339()));
        props.insert("active".to_string(), Value::from(false));
        props.insert(
            "lastModified".to_string(),
            Value::from(Utc::now().to_rfc3339()),
        );
        self.executor
            .execute(
                Statement::MergeEdgeProperties {
                    id: active.id.clone(),
                    properties: props,
                },
                ExecOptions::write(),
            )
            .await?;
        Ok(true)
    }

    /// All interval records for a canonical id, ordered by `validFrom`.
    pub async fn intervals(&self, canonical_id: &str) -> Result<Vec<Relationship>> {
        let all = self
            .executor
            .query_edges(&EdgeQuery::default(), ExecOptions::default())
            .await?;
        let mut intervals: Vec<Relationship> = Vec::new();
        for edge in &all {
            let canonical = edge
                .properties
                .get("canonicalId")
                .and_then(Value::as_str)
                .unwrap_or(edge.id.as_str());
            if canonical == canonical_id {
                intervals.push(from_edge(edge)?);
            }
        }
        intervals.sort_by(|a, b| a.valid_from.cmp(&b.valid_from));
        Ok(intervals)
    }

    async fn active_interval(&self, canonical_id: &str) -> Result<Option<Relationship>> {
        let intervals = self.intervals(canonical_id).await?;
        Ok(intervals.into_iter().find(|r| r.active))
    }

    /// Build the dependency graph over code edges and analyze it: cycles,
    /// orphaned entities, and the most coupled nodes.
    pub async fn analyze_dependencies(&self) -> Result<DependencyAnalysis> {
        let edges = self
            .executor
            .query_edges(
                &EdgeQuery {
                    active: Some(true),
                    ..Default::default()
                },
                ExecOptions::default(),
            )
            .await?;

        let mut graph: DiGraph<EntityId, RelationType> = DiGraph::new();
        let mut nodes: HashMap<EntityId, NodeIndex> = HashMap::new();
        for edge in &edges {
            let rel = from_edge(edge)?;
            if !rel.rel_type.is_code_edge() {
                continue;
            }
            let from = *nodes
                .entry(rel.from_entity_id.clone())
                .or_insert_with(|| graph.add_node(rel.from_entity_id.clone()));
            let to = *nodes
                .entry(rel.to_entity_id.clone())
                .or_insert_with(|| graph.add_node(rel.to_entity_id.clone()));
            graph.add_edge(from, to, rel.rel_type);
        }

        let cycles: Vec<Vec<EntityId>> = tarjan_scc(&graph)
            .into_iter()
            .filter(|component| component.len() > 1)
            .map(|component| {
                component
                    .into_iter()
                    .map(|ix| graph[ix].clone())
                    .collect()
            })
            .collect();

        let mut coupling: Vec<(EntityId, usize)> = graph
            .node_indices()
            .map(|ix| {
                let degree = graph
                    .edges_directed(ix, Direction::Outgoing)
                    .count()
                    + graph.edges_directed(ix, Direction::Incoming).count();
                (graph[ix].clone(), degree)
            })
            .collect();
        coupling.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        let orphaned: Vec<EntityId> = coupling
            .iter()
            .filter(|(_, degree)| *degree == 0)
            .map(|(id, _)| id.clone())
            .collect();
        coupling.truncate(10);

        Ok(DependencyAnalysis {
            total_nodes: graph.node_count(),
            total_edges: graph.edge_count(),
            cycles,
            orphaned,
            highly_coupled: coupling,
        })
    }

    /// Aggregate stats over all edges.
    pub async fn get_stats(&self) -> Result<RelationshipStats> {
        let all = self
            .executor
            .query_edges(&EdgeQuery::default(), ExecOptions::default())
            .await?;
        let mut stats = RelationshipStats {
            total: all.len(),
            ..Default::default()
        };
        let mut confidence_sum = 0.0;
        let mut confidence_count = 0usize;
        for edge in &all {
            let active = edge
                .properties
                .get("active")
                .and_then(Value::as_bool)
                .unwrap_or(true);
            if active {
                stats.active += 1;
            } else {
                stats.closed += 1;
            }
            *stats
                .by_type
                .entry(edge.rel_type.as_str().to_string())
                .or_default() += 1;
            if let Some(c) = edge.properties.get("confidence").and_then(Value::as_f64) {
                confidence_sum += c;
                confidence_count += 1;
            }
            let evidence_len = edge
                .properties
                .get("evidence")
                .and_then(Value::as_array)
                .map(|a| a.len())
                .unwrap_or(0);
            stats.max_evidence_items = stats.max_evidence_items.max(evidence_len);
        }
        if confidence_count > 0 {
            stats.average_confidence = Some(confidence_sum / confidence_count as f64);
        }
        Ok(stats)
    }
}

/// Serialize a relationship to its stored edge form. The canonical id is
/// carried as a property so interval records group correctly.
pub fn to_edge(rel: &Relationship) -> Result<StoredEdge> {
    let value = serde_json::to_value(rel).context("serializing relationship")?;
    let Value::Object(mut properties) = value else {
        return Err(
            KgError::validation("relationship", "did not serialize to an object").into(),
        );
    };
    properties.remove("id");
    properties.remove("fromEntityId");
    properties.remove("toEntityId");
    properties.remove("type");
    properties.insert(
        "canonicalId".to_string(),
        Value::from(rel.canonical_id()),
    );
    // Upserts merge property maps, so a reopened edge must overwrite any
    // stale close marker explicitly
    if rel.valid_to.is_none() {
        properties.insert("validTo".to_string(), Value::Null);
    }
    Ok(StoredEdge {
        id: rel.id.clone(),
        from: rel.from_entity_id.clone(),
        to: rel.to_entity_id.clone(),
        rel_type: rel.rel_type.clone(),
        properties,
    })
}

/// Deserialize a stored edge back into a relationship.
pub fn from_edge(edge: &StoredEdge) -> Result<Relationship> {
    let mut props = edge.properties.clone();
    props.remove("canonicalId");
    props.insert("id".to_string(), Value::from(edge.id.clone()));
    props.insert(
        "fromEntityId".to_string(),
        Value::from(edge.from.as_str().to_string()),
    );
    props.insert(
        "toEntityId".to_string(),
        Value::from(edge.to.as_str().to_string()),
    );
    props.insert(
        "type".to_string(),
        serde_json::to_value(&edge.rel_type).context("serializing relationship type")?,
    );
    serde_json::from_value(Value::Object(props))
        .with_context(|| format!("deserializing relationship {}", edge.id))
}
