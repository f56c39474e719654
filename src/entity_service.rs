//! Entity service: exclusive owner of entity mutation
//!
//! All entity writes flow through here and out via the executor. Readers
//! get stable-ordered listings; writers get idempotent upserts with
//! last-writer-wins property merging (arrays are treated as sets, and
//! `created` never moves once written).

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::entity::Entity;
use crate::errors::KgError;
use crate::executor::{ExecOptions, GraphExecutor};
use crate::graph_store::{NodeQuery, Statement, StoredNode};
use crate::types::EntityId;
use crate::vector_index::VectorIndexService;

/// Default transactional batch size for bulk upserts.
pub const DEFAULT_BULK_BATCH: usize = 500;

/// Filters for entity listing.
#[derive(Debug, Clone, Default)]
pub struct EntityListQuery {
    pub entity_type: Option<String>,
    pub language: Option<String>,
    pub path_prefix: Option<String>,
    pub name_contains: Option<String>,
    pub tags: Vec<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Outcome of a bulk upsert. Failures are per batch; a failed batch rolls
/// back alone and does not poison its siblings.
#[derive(Debug, Clone, Default)]
pub struct BulkUpsertOutcome {
    pub upserted: usize,
    pub batches: usize,
    pub failures: Vec<BatchFailure>,
}

#[derive(Debug, Clone)]
pub struct BatchFailure {
    pub batch_index: usize,
    pub size: usize,
    pub error: String,
}

/// Entity service configuration.
#[derive(Debug, Clone)]
pub struct EntityServiceConfig {
    pub bulk_batch_size: usize,
}

impl Default for EntityServiceConfig {
    fn default() -> Self {
        Self {
            bulk_batch_size: DEFAULT_BULK_BATCH,
        }
    }
}

pub struct EntityService {
    executor: Arc<GraphExecutor>,
    vector_index: Option<Arc<VectorIndexService>>,
    config: EntityServiceConfig,
}

impl EntityService {
    pub fn new(executor: Arc<GraphExecutor>) -> Self {
        Self {
            executor,
            vector_index: None,
            config: EntityServiceConfig::default(),
        }
    }

    /// Wire the vector index so entity deletion also drops vectors.
    pub fn with_vector_index(mut self, vector_index: Arc<VectorIndexService>) -> Self {
        self.vector_index = Some(vector_index);
        self
    }

    pub fn with_config(mut self, config: EntityServiceConfig) -> Self {
        self.config = config;
        self
    }

    /// Content hash for an entity (change detection, id disambiguation).
    pub fn hash(&self, entity: &Entity) -> String {
        entity.content_hash()
    }

    /// Create a new entity. Fails with `Conflict` if the id exists.
    #[instrument(skip(self, entity), fields(id = %entity.id))]
    pub async fn create(&self, entity: &Entity) -> Result<()> {
        if self
            .executor
            .get_node(&entity.id, ExecOptions::default())
            .await?
            .is_some()
        {
            return Err(
                KgError::conflict(entity.id.as_str(), "entity already exists").into(),
            );
        }
        let node = to_node(entity)?;
        self.executor
            .execute(Statement::UpsertNode(node), ExecOptions::write())
            .await
    }

    /// Idempotent upsert. Existing properties merge last-writer-wins;
    /// `created` is immutable; arrays union as sets. A stored entity with a
    /// different `type` is a conflict, not an overwrite.
    #[instrument(skip(self, entity), fields(id = %entity.id))]
    pub async fn upsert(&self, entity: &Entity) -> Result<()> {
        let statement = self.upsert_statement(entity).await?;
        self.executor.execute(statement, ExecOptions::write()).await
    }

    /// Build the upsert statement without executing it, for callers that
    /// batch entity writes into a larger transaction.
    pub async fn upsert_statement(&self, entity: &Entity) -> Result<Statement> {
        let existing = self
            .executor
            .get_node(&entity.id, ExecOptions::default())
            .await?;
        let mut node = to_node(entity)?;
        if let Some(existing) = existing {
            merge_for_upsert(&mut node, &existing)?;
        }
        Ok(Statement::UpsertNode(node))
    }

    pub async fn get(&self, id: &EntityId) -> Result<Entity> {
        let node = self
            .executor
            .get_node(id, ExecOptions::default())
            .await?
            .ok_or_else(|| KgError::not_found("entity", id.as_str()))?;
        from_node(&node)
    }

    pub async fn try_get(&self, id: &EntityId) -> Result<Option<Entity>> {
        match self.executor.get_node(id, ExecOptions::default()).await? {
            Some(node) => Ok(Some(from_node(&node)?)),
            None => Ok(None),
        }
    }

    /// Partial update: merge a property patch into the stored entity.
    /// Structural fields (`id`, `type`, `created`) cannot be patched.
    pub async fn update(&self, id: &EntityId, patch: Map<String, Value>) -> Result<Entity> {
        if self
            .executor
            .get_node(id, ExecOptions::default())
            .await?
            .is_none()
        {
            return Err(KgError::not_found("entity", id.as_str()).into());
        }
        let mut properties = Map::new();
        for (key, value) in patch {
            if matches!(key.as_str(), "id" | "type" | "created") {
                return Err(KgError::validation(
                    key,
                    "field is immutable and cannot be patched",
                )
                .into());
            }
            properties.insert(key, value);
        }
        properties.insert(
            "lastModified".to_string(),
            Value::from(Utc::now().to_rfc3339()),
        );
        self.executor
            .execute(
                Statement::MergeNodeProperties {
                    id: id.clone(),
                    properties,
                },
                ExecOptions::write(),
            )
            .await?;
        self.get(id).await
    }

    /// Delete an entity. Its vector-index entry goes with it.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: &EntityId) -> Result<()> {
        if self
            .executor
            .get_node(id, ExecOptions::default())
            .await?
            .is_none()
        {
            return Err(KgError::not_found("entity", id.as_str()).into());
        }
        self.executor
            .execute(Statement::DeleteNode { id: id.clone() }, ExecOptions::write())
            .await?;
        if let Some(vectors) = &self.vector_index {
            vectors.remove_vector(id);
        }
        Ok(())
    }

    /// Transactional bulk upsert in batches. Each batch commits or rolls
    /// back as a unit; failures are reported per batch.
    #[instrument(skip(self, entities), fields(count = entities.len()))]
    pub async fn bulk_upsert(&self, entities: &[Entity]) -> Result<BulkUpsertOutcome> {
        let mut outcome = BulkUpsertOutcome::default();
        let batch_size = self.config.bulk_batch_size.max(1);
        for (batch_index, chunk) in entities.chunks(batch_size).enumerate() {
            outcome.batches += 1;
            let mut statements = Vec::with_capacity(chunk.len());
            let mut batch_err: Option<anyhow::Error> = None;
            for entity in chunk {
                match self.upsert_statement(entity).await {
                    Ok(stmt) => statements.push(stmt),
                    Err(err) => {
                        batch_err = Some(err);
                        break;
                    }
                }
            }
            let result = match batch_err {
                Some(err) => Err(err),
                None => {
                    self.executor
                        .transaction(&statements, ExecOptions::write())
                        .await
                }
            };
            match result {
                Ok(()) => outcome.upserted += chunk.len(),
                Err(err) => {
                    debug!(batch_index, "bulk upsert batch failed: {err:#}");
                    outcome.failures.push(BatchFailure {
                        batch_index,
                        size: chunk.len(),
                        error: format!("{err:#}"),
                    });
                }
            }
        }
        Ok(outcome)
    }

    /// Stable-ordered listing by `(path, name, id)`.
    pub async fn list(&self, query: &EntityListQuery) -> Result<Vec<Entity>> {
        let mut node_query = NodeQuery {
            // Scope to the superlabel so bookkeeping nodes stay invisible
            labels: vec!["Entity".to_string()],
            path_prefix: query.path_prefix.clone(),
            name_contains: query.name_contains.clone(),
            limit: query.limit,
            offset: query.offset,
            ..Default::default()
        };
        if let Some(t) = &query.entity_type {
            node_query
                .equals
                .push(("type".to_string(), Value::from(t.clone())));
        }
        if let Some(lang) = &query.language {
            node_query
                .equals
                .push(("language".to_string(), Value::from(lang.clone())));
        }
        let nodes = self
            .executor
            .query_nodes(&node_query, ExecOptions::default())
            .await?;
        let mut entities = Vec::with_capacity(nodes.len());
        for node in &nodes {
            let entity = from_node(node)?;
            if !query.tags.is_empty() {
                let has_tags = entity
                    .metadata
                    .as_ref()
                    .and_then(|m| m.get("tags"))
                    .and_then(Value::as_array)
                    .map(|tags| {
                        query
                            .tags
                            .iter()
                            .all(|t| tags.iter().any(|v| v.as_str() == Some(t)))
                    })
                    .unwrap_or(false);
                if !has_tags {
                    continue;
                }
            }
            entities.push(entity);
        }
        Ok(entities)
    }
}

/// Serialize an entity to its stored node form.
pub fn to_node(entity: &Entity) -> Result<StoredNode> {
    let value = serde_json::to_value(entity).context("serializing entity")?;
    let Value::Object(properties) = value else {
        return Err(KgError::validation("entity", "entity did not serialize to an object").into());
    };
    Ok(StoredNode {
        id: entity.id.clone(),
        labels: entity.labels().iter().map(|l| l.to_string()).collect(),
        properties,
    })
}

/// Deserialize a stored node back into an entity.
pub fn from_node(node: &StoredNode) -> Result<Entity> {
    // Drop non-entity bookkeeping the store may have merged in
    let mut props = node.properties.clone();
    props.remove("embedding");
    props.remove("embeddingUpdatedAt");
    props.remove("embeddingMetadata");
    serde_json::from_value(Value::Object(props))
        .with_context(|| format!("deserializing entity {}", node.id))
        .map_err(|e| KgError::validation("entity", format!("{e:#}")).into())
}

/// Apply upsert merge rules against the stored node.
fn merge_for_upsert(incoming: &mut StoredNode, existing: &StoredNode) -> Result<()> {
    let existing_type = existing.properties.get("type").and_then(Value::as_str);
    let incoming_type = incoming.properties.get("type").and_then(Value::as_str);
    if let (Some(a), Some(b)) = (existing_type, incoming_type) {
        if a != b {
            return Err(KgError::conflict(
                incoming.id.as_str(),
                format!("entity type drift: stored {a}, incoming {b}"),
            )
            .into());
        }
    }
    // `created` is immutable
    if let Some(created) = existing.properties.get("created") {
        incoming
            .properties
            .insert("created".to_string(), created.clone());
    }
    // Arrays merge as sets
    for (key, incoming_value) in incoming.properties.iter_mut() {
        if let (Some(Value::Array(old)), Value::Array(new)) =
            (existing.properties.get(key), &mut *incoming_value)
        {
            if key == "embedding" {
                continue;
            }
            let mut merged = old.clone();
            for item in new.drain(..) {
                if !merged.contains(&item) {
                    merged.push(item);
                }
            }
            *incoming_value = Value::Array(merged);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityData, FileData};
    use crate::events::EventBus;
    use crate::memory_graph::MemoryGraphStore;
    use crate::types::RepoPath;
    use pretty_assertions::assert_eq;

    fn service() -> EntityService {
        let store = Arc::new(MemoryGraphStore::new());
        let exec = Arc::new(GraphExecutor::new(store, Arc::new(EventBus::new())));
        EntityService::new(exec)
    }

    fn file_entity(id: &str, path: &str) -> Entity {
        Entity::new(
            EntityId::new(id).unwrap(),
            EntityData::File(FileData {
                extension: "ts".into(),
                size: 100,
                lines: 10,
                is_test: false,
                is_config: false,
                dependencies: vec!["react".to_string()],
            }),
        )
        .with_path(RepoPath::new(path).unwrap())
        .with_language("typescript")
    }

    #[tokio::test]
    async fn upsert_then_get_round_trips() -> Result<()> {
        let svc = service();
        let entity = file_entity("file:src/a.ts", "src/a.ts");
        svc.upsert(&entity).await?;
        let got = svc.get(&entity.id).await?;
        assert_eq!(got.id, entity.id);
        assert_eq!(got.path, entity.path);
        assert_eq!(got.type_name(), "file");
        Ok(())
    }

    #[tokio::test]
    async fn create_twice_conflicts_but_upsert_is_idempotent() -> Result<()> {
        let svc = service();
        let entity = file_entity("file:src/a.ts", "src/a.ts");
        svc.create(&entity).await?;
        assert!(svc.create(&entity).await.is_err());
        svc.upsert(&entity).await?;
        svc.upsert(&entity).await?;
        Ok(())
    }

    #[tokio::test]
    async fn upsert_preserves_created_and_unions_arrays() -> Result<()> {
        let svc = service();
        let mut entity = file_entity("file:src/a.ts", "src/a.ts");
        svc.upsert(&entity).await?;
        let first = svc.get(&entity.id).await?;

        if let EntityData::File(f) = &mut entity.data {
            f.dependencies = vec!["lodash".to_string()];
        }
        entity.created = Utc::now();
        svc.upsert(&entity).await?;
        let second = svc.get(&entity.id).await?;

        assert_eq!(second.created, first.created);
        if let EntityData::File(f) = &second.data {
            assert!(f.dependencies.contains(&"react".to_string()));
            assert!(f.dependencies.contains(&"lodash".to_string()));
        } else {
            panic!("expected file entity");
        }
        Ok(())
    }

    #[tokio::test]
    async fn type_drift_is_a_conflict() -> Result<()> {
        let svc = service();
        let entity = file_entity("shared-id", "src/a.ts");
        svc.upsert(&entity).await?;

        let other = Entity::new(
            EntityId::new("shared-id").unwrap(),
            EntityData::Session { agent: None },
        );
        let err = svc.upsert(&other).await.unwrap_err();
        assert!(err.to_string().contains("conflict"));
        Ok(())
    }

    #[tokio::test]
    async fn list_is_stable_ordered_and_filtered() -> Result<()> {
        let svc = service();
        svc.upsert(&file_entity("file:src/b.ts", "src/b.ts")).await?;
        svc.upsert(&file_entity("file:src/a.ts", "src/a.ts")).await?;
        svc.upsert(&file_entity("file:lib/c.ts", "lib/c.ts")).await?;

        let all = svc.list(&EntityListQuery::default()).await?;
        let paths: Vec<_> = all
            .iter()
            .map(|e| e.path.as_ref().unwrap().as_str().to_string())
            .collect();
        assert_eq!(paths, vec!["lib/c.ts", "src/a.ts", "src/b.ts"]);

        let src_only = svc
            .list(&EntityListQuery {
                path_prefix: Some("src/".to_string()),
                ..Default::default()
            })
            .await?;
        assert_eq!(src_only.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn update_rejects_immutable_fields() -> Result<()> {
        let svc = service();
        let entity = file_entity("file:src/a.ts", "src/a.ts");
        svc.upsert(&entity).await?;
        let mut patch = Map::new();
        patch.insert("id".to_string(), Value::from("other"));
        assert!(svc.update(&entity.id, patch).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn bulk_upsert_reports_batches() -> Result<()> {
        let svc = service();
        let entities: Vec<Entity> = (0..12)
            .map(|i| file_entity(&format!("file:src/f{i}.ts"), &format!("src/f{i}.ts")))
            .collect();
        let outcome = svc.bulk_upsert(&entities).await?;
        assert_eq!(outcome.upserted, 12);
        assert!(outcome.failures.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let svc = service();
        let err = svc
            .delete(&EntityId::new("nope").unwrap())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
