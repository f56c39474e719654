//! In-memory reference implementation of the graph store
//!
//! Backs tests and the default local deployment. Nodes and edges live in
//! ordered maps guarded by `parking_lot` locks, with label and adjacency
//! indexes kept in lockstep. A JSON snapshot can be persisted to disk and
//! reloaded, which makes a local index survive restarts without an external
//! database.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

use crate::errors::KgError;
use crate::graph_store::{
    EdgeQuery, GraphStore, NodeQuery, Statement, StoreStats, StoredEdge, StoredNode,
};
use crate::types::EntityId;

/// Snapshot format version; bumped when the layout changes.
const SNAPSHOT_VERSION: u32 = 1;
const SNAPSHOT_FILE: &str = "graph_snapshot.json";

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    nodes: Vec<StoredNode>,
    edges: Vec<StoredEdge>,
}

#[derive(Default)]
struct Indexes {
    by_label: HashMap<String, HashSet<EntityId>>,
    edges_out: HashMap<EntityId, HashSet<String>>,
    edges_in: HashMap<EntityId, HashSet<String>>,
}

/// In-memory graph store with optional snapshot persistence.
pub struct MemoryGraphStore {
    db_path: Option<PathBuf>,
    nodes: RwLock<BTreeMap<EntityId, StoredNode>>,
    edges: RwLock<BTreeMap<String, StoredEdge>>,
    indexes: RwLock<Indexes>,
}

impl MemoryGraphStore {
    /// Create an ephemeral store (no persistence).
    pub fn new() -> Self {
        Self {
            db_path: None,
            nodes: RwLock::new(BTreeMap::new()),
            edges: RwLock::new(BTreeMap::new()),
            indexes: RwLock::new(Indexes::default()),
        }
    }

    /// Open a store rooted at `dir`, loading a snapshot if one exists.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating graph directory {}", dir.display()))?;
        let store = Self {
            db_path: Some(dir.clone()),
            nodes: RwLock::new(BTreeMap::new()),
            edges: RwLock::new(BTreeMap::new()),
            indexes: RwLock::new(Indexes::default()),
        };

        let snapshot_path = dir.join(SNAPSHOT_FILE);
        if fs::try_exists(&snapshot_path).await.unwrap_or(false) {
            let raw = fs::read(&snapshot_path)
                .await
                .with_context(|| format!("reading snapshot {}", snapshot_path.display()))?;
            let snapshot: Snapshot = serde_json::from_slice(&raw)
                .map_err(|e| KgError::Fatal(format!("corrupted graph snapshot: {e}")))?;
            if snapshot.version != SNAPSHOT_VERSION {
                return Err(KgError::Fatal(format!(
                    "unsupported snapshot version {}",
                    snapshot.version
                ))
                .into());
            }
            let mut nodes = store.nodes.write();
            let mut edges = store.edges.write();
            let mut indexes = store.indexes.write();
            for node in snapshot.nodes {
                index_node(&mut indexes, &node);
                nodes.insert(node.id.clone(), node);
            }
            for edge in snapshot.edges {
                index_edge(&mut indexes, &edge);
                edges.insert(edge.id.clone(), edge);
            }
            info!(
                nodes = nodes.len(),
                edges = edges.len(),
                "graph snapshot loaded"
            );
        }
        Ok(store)
    }

    /// Write the current state to the snapshot file.
    pub async fn flush(&self) -> Result<()> {
        let Some(dir) = &self.db_path else {
            return Ok(());
        };
        let snapshot = {
            let nodes = self.nodes.read();
            let edges = self.edges.read();
            Snapshot {
                version: SNAPSHOT_VERSION,
                nodes: nodes.values().cloned().collect(),
                edges: edges.values().cloned().collect(),
            }
        };
        let raw = serde_json::to_vec(&snapshot)?;
        let path = dir.join(SNAPSHOT_FILE);
        let tmp = dir.join(format!("{SNAPSHOT_FILE}.tmp"));
        fs::write(&tmp, &raw)
            .await
            .with_context(|| format!("writing snapshot {}", tmp.display()))?;
        fs::rename(&tmp, &path).await?;
        debug!(bytes = raw.len(), "graph snapshot flushed");
        Ok(())
    }

    /// Validate a batch against current state. Any failure here rejects the
    /// whole batch before a single mutation lands, which is what makes
    /// `apply` atomic for an in-memory store.
    fn preflight(
        &self,
        statements: &[Statement],
        nodes: &BTreeMap<EntityId, StoredNode>,
        edges: &BTreeMap<String, StoredEdge>,
    ) -> Result<()> {
        // Track ids created earlier in the same batch
        let mut created_nodes: HashSet<&EntityId> = HashSet::new();
        let mut created_edges: HashSet<&str> = HashSet::new();
        for stmt in statements {
            stmt.validate()?;
            match stmt {
                Statement::UpsertNode(n) => {
                    created_nodes.insert(&n.id);
                }
                Statement::MergeNodeProperties { id, .. } => {
                    if !nodes.contains_key(id) && !created_nodes.contains(id) {
                        return Err(KgError::not_found("entity", id.as_str()).into());
                    }
                }
                Statement::UpsertEdge(e) => {
                    created_edges.insert(e.id.as_str());
                }
                Statement::CreateEdgeIfAbsent(e) => {
                    if edges.contains_key(&e.id) || created_edges.contains(e.id.as_str()) {
                        return Err(KgError::conflict(
                            e.id.clone(),
                            "edge already exists with this canonical id",
                        )
                        .into());
                    }
                    created_edges.insert(e.id.as_str());
                }
                Statement::MergeEdgeProperties { id, .. } => {
                    if !edges.contains_key(id) && !created_edges.contains(id.as_str()) {
                        return Err(KgError::not_found("relationship", id.clone()).into());
                    }
                }
                Statement::DeleteNode { .. } | Statement::DeleteEdge { .. } => {}
            }
        }
        Ok(())
    }
}

impl Default for MemoryGraphStore {
    fn default() -> Self {
        Self::new()
    }
}

fn index_node(indexes: &mut Indexes, node: &StoredNode) {
    for label in &node.labels {
        indexes
            .by_label
            .entry(label.clone())
            .or_default()
            .insert(node.id.clone());
    }
}

fn unindex_node(indexes: &mut Indexes, node: &StoredNode) {
    for label in &node.labels {
        if let Some(set) = indexes.by_label.get_mut(label) {
            set.remove(&node.id);
        }
    }
}

fn index_edge(indexes: &mut Indexes, edge: &StoredEdge) {
    indexes
        .edges_out
        .entry(edge.from.clone())
        .or_default()
        .insert(edge.id.clone());
    indexes
        .edges_in
        .entry(edge.to.clone())
        .or_default()
        .insert(edge.id.clone());
}

fn unindex_edge(indexes: &mut Indexes, edge: &StoredEdge) {
    if let Some(set) = indexes.edges_out.get_mut(&edge.from) {
        set.remove(&edge.id);
    }
    if let Some(set) = indexes.edges_in.get_mut(&edge.to) {
        set.remove(&edge.id);
    }
}

fn prop_str<'a>(props: &'a serde_json::Map<String, Value>, key: &str) -> Option<&'a str> {
    props.get(key).and_then(Value::as_str)
}

fn prop_time(props: &serde_json::Map<String, Value>, key: &str) -> Option<DateTime<Utc>> {
    prop_str(props, key)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn node_sort_key(node: &StoredNode) -> (String, String, String) {
    (
        prop_str(&node.properties, "path").unwrap_or("").to_string(),
        prop_str(&node.properties, "name").unwrap_or("").to_string(),
        node.id.as_str().to_string(),
    )
}

fn edge_matches(edge: &StoredEdge, query: &EdgeQuery) -> bool {
    if let Some(from) = &query.from {
        if &edge.from != from {
            return false;
        }
    }
    if let Some(to) = &query.to {
        if &edge.to != to {
            return false;
        }
    }
    if !query.rel_types.is_empty() && !query.rel_types.contains(&edge.rel_type) {
        return false;
    }
    let props = &edge.properties;
    if let Some(active) = query.active {
        if props.get("active").and_then(Value::as_bool).unwrap_or(true) != active {
            return false;
        }
    }
    if let Some(min) = query.confidence_min {
        match props.get("confidence").and_then(Value::as_f64) {
            Some(c) if c >= min => {}
            _ => return false,
        }
    }
    if let Some(kind) = &query.kind {
        if prop_str(props, "kind") != Some(kind.as_str()) {
            return false;
        }
    }
    if let Some(source) = &query.source {
        if prop_str(props, "source") != Some(source.as_str()) {
            return false;
        }
    }
    if let Some(csid) = &query.change_set_id {
        if prop_str(props, "changeSetId") != Some(csid.to_string().as_str()) {
            return false;
        }
    }
    if let Some(at) = query.valid_at {
        let valid_from = prop_time(props, "validFrom");
        match valid_from {
            Some(vf) if vf <= at => {}
            _ => return false,
        }
        if let Some(vt) = prop_time(props, "validTo") {
            if vt <= at {
                return false;
            }
        }
    }
    true
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn apply(&self, statements: &[Statement]) -> Result<()> {
        let mut nodes = self.nodes.write();
        let mut edges = self.edges.write();
        let mut indexes = self.indexes.write();

        self.preflight(statements, &nodes, &edges)?;

        for stmt in statements {
            match stmt {
                Statement::UpsertNode(incoming) => {
                    match nodes.get_mut(&incoming.id) {
                        Some(existing) => {
                            unindex_node(&mut indexes, existing);
                            existing.labels = incoming.labels.clone();
                            for (k, v) in &incoming.properties {
                                existing.properties.insert(k.clone(), v.clone());
                            }
                            let existing = existing.clone();
                            index_node(&mut indexes, &existing);
                        }
                        None => {
                            index_node(&mut indexes, incoming);
                            nodes.insert(incoming.id.clone(), incoming.clone());
                        }
                    };
                }
                Statement::MergeNodeProperties { id, properties } => {
                    if let Some(node) = nodes.get_mut(id) {
                        for (k, v) in properties {
                            node.properties.insert(k.clone(), v.clone());
                        }
                    }
                }
                Statement::DeleteNode { id } => {
                    if let Some(node) = nodes.remove(id) {
                        unindex_node(&mut indexes, &node);
                    }
                    let touching: Vec<String> = indexes
                        .edges_out
                        .remove(id)
                        .unwrap_or_default()
                        .into_iter()
                        .chain(indexes.edges_in.remove(id).unwrap_or_default())
                        .collect();
                    for edge_id in touching {
                        if let Some(edge) = edges.remove(&edge_id) {
                            unindex_edge(&mut indexes, &edge);
                        }
                    }
                }
                Statement::UpsertEdge(incoming) => {
                    match edges.get_mut(&incoming.id) {
                        Some(existing) => {
                            for (k, v) in &incoming.properties {
                                existing.properties.insert(k.clone(), v.clone());
                            }
                        }
                        None => {
                            index_edge(&mut indexes, incoming);
                            edges.insert(incoming.id.clone(), incoming.clone());
                        }
                    };
                }
                Statement::CreateEdgeIfAbsent(incoming) => {
                    index_edge(&mut indexes, incoming);
                    edges.insert(incoming.id.clone(), incoming.clone());
                }
                Statement::MergeEdgeProperties { id, properties } => {
                    if let Some(edge) = edges.get_mut(id) {
                        for (k, v) in properties {
                            edge.properties.insert(k.clone(), v.clone());
                        }
                    }
                }
                Statement::DeleteEdge { id } => {
                    if let Some(edge) = edges.remove(id) {
                        unindex_edge(&mut indexes, &edge);
                    }
                }
            }
        }
        Ok(())
    }

    async fn get_node(&self, id: &EntityId) -> Result<Option<StoredNode>> {
        Ok(self.nodes.read().get(id).cloned())
    }

    async fn query_nodes(&self, query: &NodeQuery) -> Result<Vec<StoredNode>> {
        query.validate()?;
        let nodes = self.nodes.read();
        let indexes = self.indexes.read();

        // Label index narrows the candidate set when labels are given
        let candidates: Vec<StoredNode> = if query.labels.is_empty() {
            nodes.values().cloned().collect()
        } else {
            let mut ids: HashSet<EntityId> = HashSet::new();
            for label in &query.labels {
                if let Some(set) = indexes.by_label.get(label) {
                    ids.extend(set.iter().cloned());
                }
            }
            ids.into_iter()
                .filter_map(|id| nodes.get(&id).cloned())
                .collect()
        };

        let mut matched: Vec<StoredNode> = candidates
            .into_iter()
            .filter(|node| {
                for (key, expected) in &query.equals {
                    if node.properties.get(key) != Some(expected) {
                        return false;
                    }
                }
                if let Some(prefix) = &query.path_prefix {
                    match prop_str(&node.properties, "path") {
                        Some(p) if p.starts_with(prefix.as_str()) => {}
                        _ => return false,
                    }
                }
                if let Some(needle) = &query.name_contains {
                    let needle = needle.to_lowercase();
                    match prop_str(&node.properties, "name") {
                        Some(n) if n.to_lowercase().contains(&needle) => {}
                        _ => return false,
                    }
                }
                true
            })
            .collect();

        matched.sort_by(|a, b| node_sort_key(a).cmp(&node_sort_key(b)));
        let offset = query.offset.unwrap_or(0);
        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(matched.into_iter().skip(offset).take(limit).collect())
    }

    async fn get_edge(&self, id: &str) -> Result<Option<StoredEdge>> {
        Ok(self.edges.read().get(id).cloned())
    }

    async fn query_edges(&self, query: &EdgeQuery) -> Result<Vec<StoredEdge>> {
        let edges = self.edges.read();
        let indexes = self.indexes.read();

        // Adjacency indexes narrow the scan when an endpoint is pinned
        let candidates: Vec<StoredEdge> = match (&query.from, &query.to) {
            (Some(from), _) => indexes
                .edges_out
                .get(from)
                .into_iter()
                .flatten()
                .filter_map(|id| edges.get(id).cloned())
                .collect(),
            (None, Some(to)) => indexes
                .edges_in
                .get(to)
                .into_iter()
                .flatten()
                .filter_map(|id| edges.get(id).cloned())
                .collect(),
            (None, None) => edges.values().cloned().collect(),
        };

        let mut matched: Vec<StoredEdge> = candidates
            .into_iter()
            .filter(|e| edge_matches(e, query))
            .collect();
        matched.sort_by(|a, b| {
            let ta = prop_time(&a.properties, "validFrom");
            let tb = prop_time(&b.properties, "validFrom");
            ta.cmp(&tb).then_with(|| a.id.cmp(&b.id))
        });
        let offset = query.offset.unwrap_or(0);
        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(matched.into_iter().skip(offset).take(limit).collect())
    }

    async fn outgoing(&self, from: &EntityId) -> Result<Vec<StoredEdge>> {
        self.query_edges(&EdgeQuery::outgoing(from.clone())).await
    }

    async fn incoming(&self, to: &EntityId) -> Result<Vec<StoredEdge>> {
        self.query_edges(&EdgeQuery::incoming(to.clone())).await
    }

    async fn stats(&self) -> Result<StoreStats> {
        let nodes = self.nodes.read();
        let edges = self.edges.read();
        let indexes = self.indexes.read();
        let mut nodes_by_label = serde_json::Map::new();
        for (label, set) in &indexes.by_label {
            nodes_by_label.insert(label.clone(), Value::from(set.len()));
        }
        let mut edges_by_type: HashMap<String, usize> = HashMap::new();
        for edge in edges.values() {
            *edges_by_type
                .entry(edge.rel_type.as_str().to_string())
                .or_default() += 1;
        }
        Ok(StoreStats {
            node_count: nodes.len(),
            edge_count: edges.len(),
            nodes_by_label,
            edges_by_type: edges_by_type
                .into_iter()
                .map(|(k, v)| (k, Value::from(v)))
                .collect(),
        })
    }
}
