//! Property-graph store contract
//!
//! The store is a typed command executor: mutations arrive as `Statement`
//! batches applied atomically, reads go through structured node/edge
//! queries. Property names are whitelisted identifiers, so no caller can
//! smuggle arbitrary query text into the store.
//!
//! Implementations must classify failures: recoverable infrastructure
//! errors surface as `KgError::Transient` (the executor retries those),
//! everything else propagates as-is.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::KgError;
use crate::relationship::{RelationType, ResolutionSource};
use crate::types::{ChangeSetId, EntityId};

static PROPERTY_KEY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static regex"));

/// Reject property keys that are not plain identifiers.
pub fn validate_property_key(key: &str) -> Result<()> {
    if PROPERTY_KEY_RE.is_match(key) {
        Ok(())
    } else {
        Err(KgError::validation("property", format!("invalid property key: {key:?}")).into())
    }
}

/// Validate every key of a property map.
pub fn validate_properties(props: &Map<String, Value>) -> Result<()> {
    for key in props.keys() {
        validate_property_key(key)?;
    }
    Ok(())
}

/// Widen a graph-native numeric value to a host integer where it is
/// integral. Stores speak 64-bit numbers; callers want `i64`.
pub fn as_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_u64().and_then(|u| i64::try_from(u).ok()))
            .or_else(|| {
                n.as_f64()
                    .filter(|f| f.fract() == 0.0 && f.abs() < 9.0e15)
                    .map(|f| f as i64)
            }),
        _ => None,
    }
}

/// A node record as the store sees it: labels plus a flat property map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredNode {
    pub id: EntityId,
    pub labels: Vec<String>,
    pub properties: Map<String, Value>,
}

/// An edge record: structural endpoints plus a flat property map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEdge {
    pub id: String,
    pub from: EntityId,
    pub to: EntityId,
    pub rel_type: RelationType,
    pub properties: Map<String, Value>,
}

/// One mutation in a transactional batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    /// MERGE on node id; property union, incoming values win.
    UpsertNode(StoredNode),
    /// Merge properties into an existing node. Fails `NotFound` if absent.
    MergeNodeProperties {
        id: EntityId,
        properties: Map<String, Value>,
    },
    /// Delete a node and all its edges.
    DeleteNode { id: EntityId },
    /// MERGE on edge id; property union, incoming values win.
    UpsertEdge(StoredEdge),
    /// CREATE guarded on absence; fails `Conflict` if the id exists.
    CreateEdgeIfAbsent(StoredEdge),
    /// Merge properties into an existing edge. Fails `NotFound` if absent.
    MergeEdgeProperties {
        id: String,
        properties: Map<String, Value>,
    },
    /// Delete an edge by id.
    DeleteEdge { id: String },
}

impl Statement {
    /// Validate property identifiers before the batch ships.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::UpsertNode(n) => validate_properties(&n.properties),
            Self::MergeNodeProperties { properties, .. } => validate_properties(properties),
            Self::UpsertEdge(e) | Self::CreateEdgeIfAbsent(e) => {
                validate_properties(&e.properties)
            }
            Self::MergeEdgeProperties { properties, .. } => validate_properties(properties),
            Self::DeleteNode { .. } | Self::DeleteEdge { .. } => Ok(()),
        }
    }
}

/// Structured node query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeQuery {
    /// Match nodes carrying any of these labels. Empty = all nodes.
    pub labels: Vec<String>,
    /// Property equality conjunction.
    pub equals: Vec<(String, Value)>,
    /// Prefix match on the `path` property.
    pub path_prefix: Option<String>,
    /// Case-insensitive substring match on the `name` property.
    pub name_contains: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl NodeQuery {
    pub fn by_label(label: impl Into<String>) -> Self {
        Self {
            labels: vec![label.into()],
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (key, _) in &self.equals {
            validate_property_key(key)?;
        }
        Ok(())
    }
}

/// Structured edge query mirroring the consumer API surface.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EdgeQuery {
    pub from: Option<EntityId>,
    pub to: Option<EntityId>,
    pub rel_types: Vec<RelationType>,
    pub active: Option<bool>,
    pub confidence_min: Option<f64>,
    pub kind: Option<String>,
    pub source: Option<ResolutionSource>,
    pub change_set_id: Option<ChangeSetId>,
    /// Validity-interval filter: `valid_from <= at` and
    /// (`valid_to` unset or `valid_to > at`).
    pub valid_at: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl EdgeQuery {
    pub fn outgoing(from: EntityId) -> Self {
        Self {
            from: Some(from),
            ..Default::default()
        }
    }

    pub fn incoming(to: EntityId) -> Self {
        Self {
            to: Some(to),
            ..Default::default()
        }
    }
}

/// Store-level statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStats {
    pub node_count: usize,
    pub edge_count: usize,
    pub nodes_by_label: Map<String, Value>,
    pub edges_by_type: Map<String, Value>,
}

/// The property-graph store contract consumed by the executor.
///
/// # Atomicity
/// `apply` commits the whole batch or none of it.
///
/// # Error classification
/// Implementations wrap recoverable infrastructure failures in
/// `KgError::Transient`; constraint and validation failures surface as
/// their own kinds and are never retried.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Apply a batch of mutations atomically.
    async fn apply(&self, statements: &[Statement]) -> Result<()>;

    /// Fetch a node by id.
    async fn get_node(&self, id: &EntityId) -> Result<Option<StoredNode>>;

    /// Query nodes. Results are stable-ordered by `(path, name, id)`.
    async fn query_nodes(&self, query: &NodeQuery) -> Result<Vec<StoredNode>>;

    /// Fetch an edge by id.
    async fn get_edge(&self, id: &str) -> Result<Option<StoredEdge>>;

    /// Query edges. Results are stable-ordered by `(valid_from, id)`.
    async fn query_edges(&self, query: &EdgeQuery) -> Result<Vec<StoredEdge>>;

    /// Nodes reachable one hop out from `from` (edge + neighbor id pairs).
    async fn outgoing(&self, from: &EntityId) -> Result<Vec<StoredEdge>>;

    /// Edges arriving at `to`.
    async fn incoming(&self, to: &EntityId) -> Result<Vec<StoredEdge>>;

    /// Store statistics.
    async fn stats(&self) -> Result<StoreStats>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn property_keys_are_whitelisted_identifiers() {
        assert!(validate_property_key("valid_from").is_ok());
        assert!(validate_property_key("embeddingUpdatedAt").is_ok());
        assert!(validate_property_key("1bad").is_err());
        assert!(validate_property_key("drop table").is_err());
        assert!(validate_property_key("a.b").is_err());
        assert!(validate_property_key("").is_err());
    }

    #[test]
    fn statement_validation_covers_nested_maps() {
        let mut props = Map::new();
        props.insert("ok_key".to_string(), Value::from(1));
        props.insert("bad key".to_string(), Value::from(2));
        let stmt = Statement::MergeNodeProperties {
            id: EntityId::new("e1").unwrap(),
            properties: props,
        };
        assert!(stmt.validate().is_err());
    }

    #[test]
    fn integer_widening_handles_floats_and_u64() {
        assert_eq!(as_int(&Value::from(42_i64)), Some(42));
        assert_eq!(as_int(&Value::from(42_u64)), Some(42));
        assert_eq!(as_int(&Value::from(42.0_f64)), Some(42));
        assert_eq!(as_int(&Value::from(42.5_f64)), None);
        assert_eq!(as_int(&Value::from("42")), None);
    }
}
