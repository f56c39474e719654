//! Temporal queries: validity-interval traversal, timelines, checkpoints
//!
//! Every temporal edge carries `validFrom`/`validTo`. Traversals filter
//! edges against an `until` instant, timelines group interval records by
//! canonical id, and checkpoints pin the membership of a moment so history
//! can be walked later.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use crate::errors::KgError;
use crate::executor::{ExecOptions, GraphExecutor};
use crate::graph_store::{EdgeQuery, NodeQuery, Statement, StoredNode};
use crate::relationship::{RelationType, Relationship};
use crate::relationship_service::from_edge;
use crate::types::{ChangeSetId, EntityId};

/// Smallest representable gap between intervals; anything below this is a
/// clock artifact, not a real gap.
const CLOCK_GRANULARITY: Duration = Duration::milliseconds(1);

/// Parameters for a time-travel traversal.
#[derive(Debug, Clone)]
pub struct TimeTravelQuery {
    pub start_id: EntityId,
    pub until: DateTime<Utc>,
    pub max_depth: usize,
    pub relationship_types: Option<Vec<RelationType>>,
}

/// One node reached by a traversal, with the depth it was first seen at.
#[derive(Debug, Clone)]
pub struct TraversalNode {
    pub entity_id: EntityId,
    pub depth: usize,
}

/// Traversal output: nodes in breadth-first order (shorter paths first) and
/// the edges that were crossed.
#[derive(Debug, Clone, Default)]
pub struct TraversalResult {
    pub nodes: Vec<TraversalNode>,
    pub edges: Vec<Relationship>,
}

/// One interval in a relationship timeline.
#[derive(Debug, Clone)]
pub struct TimelineInterval {
    pub valid_from: DateTime<Utc>,
    pub valid_to: Option<DateTime<Utc>>,
    pub active: bool,
    pub change_set_id: Option<ChangeSetId>,
    pub versions: Vec<u32>,
}

/// Ordered timeline for one canonical edge.
#[derive(Debug, Clone, Default)]
pub struct RelationshipTimeline {
    pub canonical_id: String,
    pub intervals: Vec<TimelineInterval>,
}

/// Aggregated view of one ingestion session.
#[derive(Debug, Clone, Default)]
pub struct SessionTimeline {
    pub change_set_id: Option<ChangeSetId>,
    pub started: Option<DateTime<Utc>>,
    pub ended: Option<DateTime<Utc>>,
    pub edges: Vec<Relationship>,
    pub entities: Vec<EntityId>,
}

/// History metrics over versions, checkpoints, and temporal edges.
#[derive(Debug, Clone, Default)]
pub struct HistoryMetrics {
    pub version_edges: usize,
    pub checkpoints: usize,
    pub temporal_edges_open: usize,
    pub temporal_edges_closed: usize,
    pub checkpoint_members_avg: f64,
    pub checkpoint_members_min: usize,
    pub checkpoint_members_max: usize,
    pub last_prune: Option<PruneSnapshot>,
}

/// Snapshot of the most recent prune run.
#[derive(Debug, Clone)]
pub struct PruneSnapshot {
    pub at: DateTime<Utc>,
    pub checkpoints_removed: usize,
    pub closed_edges_removed: usize,
}

pub struct TemporalQueryService {
    executor: Arc<GraphExecutor>,
    last_prune: RwLock<Option<PruneSnapshot>>,
}

impl TemporalQueryService {
    pub fn new(executor: Arc<GraphExecutor>) -> Self {
        Self {
            executor,
            last_prune: RwLock::new(None),
        }
    }

    /// Expand outgoing paths from `start_id` up to `max_depth`, crossing
    /// only edges valid at `until`. Nodes surface at their shortest depth.
    #[instrument(skip(self, query), fields(start = %query.start_id, depth = query.max_depth))]
    pub async fn time_travel_traversal(&self, query: &TimeTravelQuery) -> Result<TraversalResult> {
        let mut result = TraversalResult::default();
        let mut visited: HashSet<EntityId> = HashSet::new();
        let mut frontier: VecDeque<(EntityId, usize)> = VecDeque::new();
        visited.insert(query.start_id.clone());
        frontier.push_back((query.start_id.clone(), 0));
        let mut seen_edges: HashSet<String> = HashSet::new();

        while let Some((node, depth)) = frontier.pop_front() {
            if depth >= query.max_depth {
                continue;
            }
            let edge_query = EdgeQuery {
                from: Some(node.clone()),
                rel_types: query.relationship_types.clone().unwrap_or_default(),
                valid_at: Some(query.until),
                ..Default::default()
            };
            let edges = self
                .executor
                .query_edges(&edge_query, ExecOptions::default())
                .await?;
            for edge in &edges {
                if seen_edges.insert(edge.id.clone()) {
                    result.edges.push(from_edge(edge)?);
                }
                if visited.insert(edge.to.clone()) {
                    result.nodes.push(TraversalNode {
                        entity_id: edge.to.clone(),
                        depth: depth + 1,
                    });
                    frontier.push_back((edge.to.clone(), depth + 1));
                }
            }
        }
        Ok(result)
    }

    /// Ordered validity intervals for one canonical edge, bounded by an
    /// optional time range. Verifies the no-overlap invariant.
    pub async fn get_relationship_timeline(
        &self,
        canonical_id: &str,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Result<RelationshipTimeline> {
        let all = self
            .executor
            .query_edges(&EdgeQuery::default(), ExecOptions::default())
            .await?;
        let mut intervals: Vec<(Relationship, TimelineInterval)> = Vec::new();
        for edge in &all {
            let canonical = edge
                .properties
                .get("canonicalId")
                .and_then(Value::as_str)
                .unwrap_or(edge.id.as_str());
            if canonical != canonical_id {
                continue;
            }
            let rel = from_edge(edge)?;
            if let Some((from, to)) = range {
                let ends = rel.valid_to.unwrap_or(DateTime::<Utc>::MAX_UTC);
                if ends < from || rel.valid_from > to {
                    continue;
                }
            }
            let interval = TimelineInterval {
                valid_from: rel.valid_from,
                valid_to: rel.valid_to,
                active: rel.active,
                change_set_id: rel.change_set_id,
                versions: vec![rel.version],
            };
            intervals.push((rel, interval));
        }
        intervals.sort_by(|a, b| a.1.valid_from.cmp(&b.1.valid_from));
        let timeline = RelationshipTimeline {
            canonical_id: canonical_id.to_string(),
            intervals: intervals.into_iter().map(|(_, i)| i).collect(),
        };
        validate_timeline(&timeline)?;
        Ok(timeline)
    }

    /// Everything recorded under one change set, with its time bounds.
    pub async fn get_session_timeline(
        &self,
        change_set_id: ChangeSetId,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Result<SessionTimeline> {
        let edges = self
            .executor
            .query_edges(
                &EdgeQuery {
                    change_set_id: Some(change_set_id),
                    ..Default::default()
                },
                ExecOptions::default(),
            )
            .await?;
        let mut timeline = SessionTimeline {
            change_set_id: Some(change_set_id),
            ..Default::default()
        };
        let mut entities: HashSet<EntityId> = HashSet::new();
        for edge in &edges {
            let rel = from_edge(edge)?;
            if let Some((from, to)) = range {
                if rel.valid_from < from || rel.valid_from > to {
                    continue;
                }
            }
            timeline.started = Some(match timeline.started {
                Some(t) => t.min(rel.valid_from),
                None => rel.valid_from,
            });
            let end = rel.valid_to.unwrap_or(rel.last_modified);
            timeline.ended = Some(match timeline.ended {
                Some(t) => t.max(end),
                None => end,
            });
            entities.insert(rel.from_entity_id.clone());
            entities.insert(rel.to_entity_id.clone());
            timeline.edges.push(rel);
        }
        let mut entity_list: Vec<EntityId> = entities.into_iter().collect();
        entity_list.sort();
        timeline.entities = entity_list;
        Ok(timeline)
    }

    /// Entities a session touched, sorted for stable output.
    pub async fn get_session_impacts(&self, change_set_id: ChangeSetId) -> Result<Vec<EntityId>> {
        Ok(self
            .get_session_timeline(change_set_id, None)
            .await?
            .entities)
    }

    /// Sessions whose edges touch the given entity, newest first.
    pub async fn get_sessions_affecting_entity(
        &self,
        entity_id: &EntityId,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Result<Vec<ChangeSetId>> {
        let mut touching: Vec<(DateTime<Utc>, ChangeSetId)> = Vec::new();
        let mut seen: HashSet<ChangeSetId> = HashSet::new();
        for direction in [
            EdgeQuery::outgoing(entity_id.clone()),
            EdgeQuery::incoming(entity_id.clone()),
        ] {
            let edges = self
                .executor
                .query_edges(&direction, ExecOptions::default())
                .await?;
            for edge in &edges {
                let rel = from_edge(edge)?;
                let Some(csid) = rel.change_set_id else {
                    continue;
                };
                if let Some((from, to)) = range {
                    if rel.valid_from < from || rel.valid_from > to {
                        continue;
                    }
                }
                if seen.insert(csid) {
                    touching.push((rel.valid_from, csid));
                }
            }
        }
        touching.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(touching.into_iter().map(|(_, id)| id).collect())
    }

    /// Edge-level changes recorded under a session.
    pub async fn get_changes_for_session(
        &self,
        change_set_id: ChangeSetId,
        limit: Option<usize>,
    ) -> Result<Vec<Relationship>> {
        let mut edges = self.get_session_timeline(change_set_id, None).await?.edges;
        edges.sort_by(|a, b| a.valid_from.cmp(&b.valid_from).then_with(|| a.id.cmp(&b.id)));
        if let Some(limit) = limit {
            edges.truncate(limit);
        }
        Ok(edges)
    }

    /// Create a checkpoint node linked by `INCLUDES` to each member.
    #[instrument(skip(self, members), fields(members = members.len()))]
    pub async fn create_checkpoint(
        &self,
        members: &[EntityId],
        change_set_id: Option<ChangeSetId>,
    ) -> Result<EntityId> {
        let now = Utc::now();
        let checkpoint_id = EntityId::new(format!("checkpoint:{}", Uuid::new_v4()))?;
        let mut properties = Map::new();
        properties.insert("type".to_string(), Value::from("checkpoint"));
        properties.insert("created".to_string(), Value::from(now.to_rfc3339()));
        properties.insert("memberCount".to_string(), Value::from(members.len()));
        if let Some(csid) = change_set_id {
            properties.insert("changeSetId".to_string(), Value::from(csid.to_string()));
        }
        let mut statements = vec![Statement::UpsertNode(StoredNode {
            id: checkpoint_id.clone(),
            labels: vec!["Checkpoint".to_string()],
            properties,
        })];
        for member in members {
            let mut rel = Relationship::new(
                checkpoint_id.clone(),
                member.clone(),
                RelationType::Includes,
            );
            rel.valid_from = now;
            rel.change_set_id = change_set_id;
            rel.normalize()?;
            statements.push(Statement::UpsertEdge(
                crate::relationship_service::to_edge(&rel)?,
            ));
        }
        self.executor
            .transaction(&statements, ExecOptions::write())
            .await?;
        Ok(checkpoint_id)
    }

    pub async fn list_checkpoints(&self) -> Result<Vec<StoredNode>> {
        self.executor
            .query_nodes(&NodeQuery::by_label("Checkpoint"), ExecOptions::default())
            .await
    }

    /// Remove checkpoints and closed temporal edges older than the
    /// retention window. Records a snapshot surfaced by history metrics.
    #[instrument(skip(self))]
    pub async fn prune(&self, retention_days: i64) -> Result<PruneSnapshot> {
        let cutoff = Utc::now() - Duration::days(retention_days);
        let mut statements = Vec::new();
        let mut checkpoints_removed = 0usize;
        for checkpoint in self.list_checkpoints().await? {
            let created = checkpoint
                .properties
                .get("created")
                .and_then(Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc));
            if created.map(|t| t < cutoff).unwrap_or(false) {
                statements.push(Statement::DeleteNode {
                    id: checkpoint.id.clone(),
                });
                checkpoints_removed += 1;
            }
        }

        let mut closed_removed = 0usize;
        let closed = self
            .executor
            .query_edges(
                &EdgeQuery {
                    active: Some(false),
                    ..Default::default()
                },
                ExecOptions::default(),
            )
            .await?;
        for edge in &closed {
            let valid_to = edge
                .properties
                .get("validTo")
                .and_then(Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc));
            if valid_to.map(|t| t < cutoff).unwrap_or(false) {
                statements.push(Statement::DeleteEdge {
                    id: edge.id.clone(),
                });
                closed_removed += 1;
            }
        }

        if !statements.is_empty() {
            self.executor
                .transaction(&statements, ExecOptions::write())
                .await?;
        }
        let snapshot = PruneSnapshot {
            at: Utc::now(),
            checkpoints_removed,
            closed_edges_removed: closed_removed,
        };
        *self.last_prune.write() = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// Counts of versions, checkpoints, and temporal edges, plus
    /// checkpoint-membership statistics.
    pub async fn get_history_metrics(&self) -> Result<HistoryMetrics> {
        let mut metrics = HistoryMetrics {
            last_prune: self.last_prune.read().clone(),
            ..Default::default()
        };

        let all_edges = self
            .executor
            .query_edges(&EdgeQuery::default(), ExecOptions::default())
            .await?;
        for edge in &all_edges {
            if edge.rel_type == RelationType::PreviousVersion {
                metrics.version_edges += 1;
            }
            let active = edge
                .properties
                .get("active")
                .and_then(Value::as_bool)
                .unwrap_or(true);
            if active {
                metrics.temporal_edges_open += 1;
            } else {
                metrics.temporal_edges_closed += 1;
            }
        }

        let checkpoints = self.list_checkpoints().await?;
        metrics.checkpoints = checkpoints.len();
        if !checkpoints.is_empty() {
            let members: Vec<usize> = checkpoints
                .iter()
                .map(|c| {
                    c.properties
                        .get("memberCount")
                        .and_then(crate::graph_store::as_int)
                        .unwrap_or(0) as usize
                })
                .collect();
            metrics.checkpoint_members_min = *members.iter().min().unwrap_or(&0);
            metrics.checkpoint_members_max = *members.iter().max().unwrap_or(&0);
            metrics.checkpoint_members_avg =
                members.iter().sum::<usize>() as f64 / members.len() as f64;
        }
        Ok(metrics)
    }
}

/// Verify a timeline contains no overlapping active intervals and no gaps
/// below the clock granularity.
pub fn validate_timeline(timeline: &RelationshipTimeline) -> Result<()> {
    let active_count = timeline.intervals.iter().filter(|i| i.active).count();
    if active_count > 1 {
        return Err(KgError::conflict(
            timeline.canonical_id.clone(),
            format!("{active_count} overlapping active intervals"),
        )
        .into());
    }
    for pair in timeline.intervals.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        if let Some(prev_end) = prev.valid_to {
            if next.valid_from < prev_end {
                return Err(KgError::conflict(
                    timeline.canonical_id.clone(),
                    "overlapping validity intervals",
                )
                .into());
            }
            let gap = next.valid_from - prev_end;
            if gap > Duration::zero() && gap < CLOCK_GRANULARITY {
                return Err(KgError::conflict(
                    timeline.canonical_id.clone(),
                    "interval gap below clock granularity",
                )
                .into());
            }
        } else if prev.active {
            return Err(KgError::conflict(
                timeline.canonical_id.clone(),
                "active interval followed by a later interval",
            )
            .into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::memory_graph::MemoryGraphStore;
    use crate::relationship_service::RelationshipService;

    fn services() -> (Arc<GraphExecutor>, TemporalQueryService, RelationshipService) {
        let store = Arc::new(MemoryGraphStore::new());
        let exec = Arc::new(GraphExecutor::new(store, Arc::new(EventBus::new())));
        (
            exec.clone(),
            TemporalQueryService::new(exec.clone()),
            RelationshipService::new(exec),
        )
    }

    fn eid(s: &str) -> EntityId {
        EntityId::new(s).unwrap()
    }

    #[tokio::test]
    async fn traversal_respects_validity_intervals() -> Result<()> {
        let (_exec, temporal, rels) = services();
        let t1 = Utc::now() - Duration::hours(5);
        let t2 = t1 + Duration::hours(1);
        let t3 = t1 + Duration::hours(2);
        let t5 = t1 + Duration::hours(4);

        // foo -> bar valid [t1, t3); bar -> baz valid [t3, t5)
        rels.open_edge(&eid("foo"), &eid("bar"), RelationType::Calls, t1, None)
            .await?;
        rels.close_edge(&eid("foo"), &eid("bar"), RelationType::Calls, t3)
            .await?;
        rels.open_edge(&eid("bar"), &eid("baz"), RelationType::Calls, t3, None)
            .await?;
        rels.close_edge(&eid("bar"), &eid("baz"), RelationType::Calls, t5)
            .await?;

        let result = temporal
            .time_travel_traversal(&TimeTravelQuery {
                start_id: eid("foo"),
                until: t2,
                max_depth: 2,
                relationship_types: Some(vec![RelationType::Calls]),
            })
            .await?;
        assert_eq!(result.edges.len(), 1);
        assert_eq!(result.edges[0].to_entity_id, eid("bar"));
        assert_eq!(result.nodes.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn timeline_is_ordered_and_valid() -> Result<()> {
        let (_exec, temporal, rels) = services();
        let from = eid("a");
        let to = eid("b");
        let t1 = Utc::now() - Duration::hours(4);
        rels.open_edge(&from, &to, RelationType::Calls, t1, None).await?;
        rels.close_edge(&from, &to, RelationType::Calls, t1 + Duration::hours(1))
            .await?;
        rels.open_edge(&from, &to, RelationType::Calls, t1 + Duration::hours(2), None)
            .await?;

        let canonical = crate::relationship::canonical_relationship_id(
            &from,
            &RelationType::Calls,
            to.as_str(),
        );
        let timeline = temporal.get_relationship_timeline(&canonical, None).await?;
        assert_eq!(timeline.intervals.len(), 2);
        assert!(timeline.intervals[0].valid_from < timeline.intervals[1].valid_from);
        Ok(())
    }

    #[tokio::test]
    async fn session_timeline_groups_by_change_set() -> Result<()> {
        let (_exec, temporal, rels) = services();
        let csid = ChangeSetId::new();
        let t = Utc::now() - Duration::minutes(30);
        rels.open_edge(&eid("a"), &eid("b"), RelationType::Calls, t, Some(csid))
            .await?;
        rels.open_edge(&eid("a"), &eid("c"), RelationType::References, t, Some(csid))
            .await?;
        rels.open_edge(&eid("x"), &eid("y"), RelationType::Calls, t, None)
            .await?;

        let timeline = temporal.get_session_timeline(csid, None).await?;
        assert_eq!(timeline.edges.len(), 2);
        assert_eq!(timeline.entities.len(), 3);

        let impacts = temporal.get_session_impacts(csid).await?;
        assert!(impacts.contains(&eid("a")));
        assert!(!impacts.contains(&eid("x")));

        let sessions = temporal
            .get_sessions_affecting_entity(&eid("b"), None)
            .await?;
        assert_eq!(sessions, vec![csid]);
        Ok(())
    }

    #[tokio::test]
    async fn checkpoints_count_into_history_metrics() -> Result<()> {
        let (_exec, temporal, _rels) = services();
        temporal
            .create_checkpoint(&[eid("a"), eid("b")], None)
            .await?;
        temporal.create_checkpoint(&[eid("c")], None).await?;

        let metrics = temporal.get_history_metrics().await?;
        assert_eq!(metrics.checkpoints, 2);
        assert_eq!(metrics.checkpoint_members_min, 1);
        assert_eq!(metrics.checkpoint_members_max, 2);
        assert!((metrics.checkpoint_members_avg - 1.5).abs() < f64::EPSILON);
        Ok(())
    }

    #[tokio::test]
    async fn prune_removes_old_checkpoints_and_records_snapshot() -> Result<()> {
        let (exec, temporal, _rels) = services();
        // Fabricate an old checkpoint directly
        let mut properties = Map::new();
        properties.insert("type".to_string(), Value::from("checkpoint"));
        properties.insert(
            "created".to_string(),
            Value::from((Utc::now() - Duration::days(90)).to_rfc3339()),
        );
        properties.insert("memberCount".to_string(), Value::from(0));
        exec.execute(
            Statement::UpsertNode(StoredNode {
                id: eid("checkpoint:old"),
                labels: vec!["Checkpoint".to_string()],
                properties,
            }),
            ExecOptions::write(),
        )
        .await?;

        let snapshot = temporal.prune(30).await?;
        assert_eq!(snapshot.checkpoints_removed, 1);
        let metrics = temporal.get_history_metrics().await?;
        assert_eq!(metrics.checkpoints, 0);
        assert!(metrics.last_prune.is_some());
        Ok(())
    }

    #[test]
    fn overlapping_active_intervals_fail_validation() {
        let now = Utc::now();
        let timeline = RelationshipTimeline {
            canonical_id: "rel_x".to_string(),
            intervals: vec![
                TimelineInterval {
                    valid_from: now - Duration::hours(2),
                    valid_to: None,
                    active: true,
                    change_set_id: None,
                    versions: vec![1],
                },
                TimelineInterval {
                    valid_from: now - Duration::hours(1),
                    valid_to: None,
                    active: true,
                    change_set_id: None,
                    versions: vec![1],
                },
            ],
        };
        assert!(validate_timeline(&timeline).is_err());
    }
}
