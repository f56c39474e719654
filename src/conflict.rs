//! Conflict detection and resolution for concurrent ingestion
//!
//! A conflict exists when the stored entity drifted away from the baseline
//! an incoming write was computed against. Strategies are consulted in
//! priority order; the first one that produces a resolution wins.
//! Unresolved conflicts queue for manual handling and surface through
//! monitoring.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use parking_lot::Mutex;
use tracing::debug;

use crate::entity::Entity;
use crate::types::EntityId;

/// A detected conflict between stored and incoming state.
#[derive(Debug, Clone)]
pub struct Conflict {
    pub entity_id: EntityId,
    pub stored: Entity,
    pub incoming: Entity,
    pub detected_at: DateTime<Utc>,
    pub reason: ConflictReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    /// `lastModified` drifted from the incoming baseline.
    TimestampDrift,
    /// Content hash drifted while timestamps agree.
    HashDrift,
    /// A delete arrived while dependents still exist.
    DeleteWithDependents,
}

/// Outcome of running the strategy chain.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// Write this entity.
    Apply(Box<Entity>),
    /// Drop the incoming change.
    Skip,
    /// No strategy accepted the conflict.
    Unresolved,
}

/// A pluggable resolution strategy.
pub trait ConflictStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    /// Return `None` to pass to the next strategy in the chain.
    fn resolve(&self, conflict: &Conflict) -> Option<Resolution>;
}

/// Overwrite with the incoming entity.
pub struct LastWriteWins;

impl ConflictStrategy for LastWriteWins {
    fn name(&self) -> &'static str {
        "last_write_wins"
    }

    fn resolve(&self, conflict: &Conflict) -> Option<Resolution> {
        if conflict.reason == ConflictReason::DeleteWithDependents {
            return None;
        }
        Some(Resolution::Apply(Box::new(conflict.incoming.clone())))
    }
}

/// Union metadata, take the newer timestamp, merge same-shape properties.
pub struct PropertyMerge;

impl ConflictStrategy for PropertyMerge {
    fn name(&self) -> &'static str {
        "property_merge"
    }

    fn resolve(&self, conflict: &Conflict) -> Option<Resolution> {
        if conflict.reason == ConflictReason::DeleteWithDependents {
            return None;
        }
        let mut merged = conflict.incoming.clone();
        merged.last_modified = conflict
            .incoming
            .last_modified
            .max(conflict.stored.last_modified);
        merged.created = conflict.stored.created;

        let mut metadata = conflict.stored.metadata.clone().unwrap_or_default();
        if let Some(incoming_meta) = &conflict.incoming.metadata {
            merge_metadata(&mut metadata, incoming_meta);
        }
        if !metadata.is_empty() {
            merged.metadata = Some(metadata);
        }
        Some(Resolution::Apply(Box::new(merged)))
    }
}

/// Ignore deletes while dependents still point at the entity.
pub struct SkipDeletions;

impl ConflictStrategy for SkipDeletions {
    fn name(&self) -> &'static str {
        "skip_deletions"
    }

    fn resolve(&self, conflict: &Conflict) -> Option<Resolution> {
        if conflict.reason == ConflictReason::DeleteWithDependents {
            return Some(Resolution::Skip);
        }
        None
    }
}

/// Union of two metadata maps. Scalar collisions resolve to the larger
/// value for orderable types, incoming otherwise.
fn merge_metadata(base: &mut Map<String, Value>, incoming: &Map<String, Value>) {
    for (key, incoming_value) in incoming {
        match base.get_mut(key) {
            Some(existing) => {
                let keep_max = match (existing.as_f64(), incoming_value.as_f64()) {
                    (Some(a), Some(b)) => Some(if b > a {
                        incoming_value.clone()
                    } else {
                        existing.clone()
                    }),
                    _ => match (existing.as_str(), incoming_value.as_str()) {
                        (Some(a), Some(b)) => Some(Value::from(a.max(b).to_string())),
                        _ => None,
                    },
                };
                *existing = keep_max.unwrap_or_else(|| incoming_value.clone());
            }
            None => {
                base.insert(key.clone(), incoming_value.clone());
            }
        }
    }
}

/// Runs strategies in priority order and queues what nothing resolves.
pub struct ConflictResolver {
    strategies: Vec<Box<dyn ConflictStrategy>>,
    unresolved: Mutex<VecDeque<Conflict>>,
}

impl ConflictResolver {
    /// Default chain: `last_write_wins`, `property_merge`, `skip_deletions`.
    pub fn new() -> Self {
        Self::with_strategies(vec![
            Box::new(LastWriteWins),
            Box::new(PropertyMerge),
            Box::new(SkipDeletions),
        ])
    }

    pub fn with_strategies(strategies: Vec<Box<dyn ConflictStrategy>>) -> Self {
        Self {
            strategies,
            unresolved: Mutex::new(VecDeque::new()),
        }
    }

    /// Detect whether incoming drifted from stored.
    pub fn detect(stored: &Entity, incoming: &Entity) -> Option<ConflictReason> {
        if stored.last_modified != incoming.last_modified
            && stored.hash != incoming.hash
        {
            return Some(ConflictReason::TimestampDrift);
        }
        if stored.hash != incoming.hash {
            return Some(ConflictReason::HashDrift);
        }
        None
    }

    /// Resolve through the strategy chain.
    pub fn resolve(&self, conflict: Conflict) -> Resolution {
        for strategy in &self.strategies {
            if let Some(resolution) = strategy.resolve(&conflict) {
                debug!(
                    entity = %conflict.entity_id,
                    strategy = strategy.name(),
                    "conflict resolved"
                );
                return resolution;
            }
        }
        self.unresolved.lock().push_back(conflict);
        Resolution::Unresolved
    }

    /// Drain the manual-resolution queue.
    pub fn take_unresolved(&self) -> Vec<Conflict> {
        self.unresolved.lock().drain(..).collect()
    }

    pub fn unresolved_count(&self) -> usize {
        self.unresolved.lock().len()
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityData;
    use serde_json::json;

    fn entity(id: &str, meta: Option<Map<String, Value>>) -> Entity {
        let mut e = Entity::new(
            EntityId::new(id).unwrap(),
            EntityData::Change { description: None },
        );
        e.metadata = meta;
        e
    }

    fn conflict(reason: ConflictReason, stored: Entity, incoming: Entity) -> Conflict {
        Conflict {
            entity_id: stored.id.clone(),
            stored,
            incoming,
            detected_at: Utc::now(),
            reason,
        }
    }

    #[test]
    fn property_merge_takes_max_version_and_timestamp() {
        let mut stored_meta = Map::new();
        stored_meta.insert("version".to_string(), json!(7));
        let mut incoming_meta = Map::new();
        incoming_meta.insert("version".to_string(), json!(3));
        incoming_meta.insert("owner".to_string(), json!("sync"));

        let mut stored = entity("e", Some(stored_meta));
        let mut incoming = entity("e", Some(incoming_meta));
        stored.last_modified = Utc::now() - chrono::Duration::hours(1);
        incoming.last_modified = Utc::now();

        let resolver = ConflictResolver::with_strategies(vec![Box::new(PropertyMerge)]);
        let resolution = resolver.resolve(conflict(
            ConflictReason::TimestampDrift,
            stored.clone(),
            incoming.clone(),
        ));
        match resolution {
            Resolution::Apply(merged) => {
                let meta = merged.metadata.unwrap();
                assert_eq!(meta.get("version"), Some(&json!(7)));
                assert_eq!(meta.get("owner"), Some(&json!("sync")));
                assert_eq!(merged.last_modified, incoming.last_modified);
                assert_eq!(merged.created, stored.created);
            }
            other => panic!("expected Apply, got {other:?}"),
        }
    }

    #[test]
    fn last_write_wins_takes_priority_in_default_chain() {
        let resolver = ConflictResolver::new();
        let stored = entity("e", None);
        let incoming = entity("e", None);
        let resolution = resolver.resolve(conflict(
            ConflictReason::TimestampDrift,
            stored,
            incoming.clone(),
        ));
        match resolution {
            Resolution::Apply(applied) => assert_eq!(applied.metadata, incoming.metadata),
            other => panic!("expected Apply, got {other:?}"),
        }
    }

    #[test]
    fn deletes_with_dependents_are_skipped() {
        let resolver = ConflictResolver::new();
        let resolution = resolver.resolve(conflict(
            ConflictReason::DeleteWithDependents,
            entity("e", None),
            entity("e", None),
        ));
        assert!(matches!(resolution, Resolution::Skip));
    }

    #[test]
    fn unresolved_conflicts_queue_for_manual_handling() {
        let resolver = ConflictResolver::with_strategies(vec![]);
        let resolution = resolver.resolve(conflict(
            ConflictReason::HashDrift,
            entity("e", None),
            entity("e", None),
        ));
        assert!(matches!(resolution, Resolution::Unresolved));
        assert_eq!(resolver.unresolved_count(), 1);
        assert_eq!(resolver.take_unresolved().len(), 1);
        assert_eq!(resolver.unresolved_count(), 0);
    }
}
