//! Synchronization coordinator: file events in, graph state out
//!
//! Watches the debounced change queue and drives the per-file pipeline:
//! hash short-circuit, parse, symbol diff, transactional commit, temporal
//! bookkeeping, embedding enqueue, and deferred-reference reconciliation.
//! Paths process in parallel under a worker cap, but one path never has
//! two pipelines in flight.

use anyhow::{Context, Result};
use chrono::Utc;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, instrument, warn};

use crate::conflict::{Conflict, ConflictResolver, Resolution};
use crate::entity::Entity;
use crate::entity_service::EntityService;
use crate::errors::is_fatal_error;
use crate::events::{EngineEvent, EventBus};
use crate::executor::{ExecOptions, GraphExecutor};
use crate::graph_store::{EdgeQuery, Statement};
use crate::monitoring::{
    AlertSeverity, LogSeverity, MonitoringService, OperationCounters, Phase,
};
use crate::embedding_service::EmbeddingService;
use crate::parsing::{CodeParser, SupportedLanguage};
use crate::relationship::{RelationType, Relationship, ResolutionSource, ToRef};
use crate::relationship_service::{from_edge, to_edge, RelationshipService};
use crate::relationship_builder::{
    BuildOutput, IndexBackedOracle, OracleBudget, RelationshipBuilder,
};
use crate::symbol_index::{SymbolIndex, SymbolRecord};
use crate::temporal_query::TemporalQueryService;
use crate::types::{ChangeSetId, EntityId, RepoPath};
use crate::watcher::{FileEvent, FileEventKind, FileEventReceiver};

/// Priority classes for pending changes. Backpressure drops `Low` first,
/// then `Medium`, never `High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChangePriority {
    Low,
    Medium,
    High,
}

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub repo_root: PathBuf,
    /// Per-path debounce window.
    pub debounce: Duration,
    /// Worker cap for parallel per-path pipelines.
    pub max_concurrent: usize,
    /// Soft cap on the pending queue; beyond it, low-priority drops begin.
    pub queue_soft_cap: usize,
    /// Type-oracle consultations allowed per flush.
    pub oracle_budget: usize,
    /// How often the deferred-reference reconciler runs.
    pub reconcile_interval: Duration,
}

impl SyncConfig {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            debounce: Duration::from_millis(500),
            max_concurrent: num_cpus::get().min(8),
            queue_soft_cap: 1000,
            oracle_budget: 200,
            reconcile_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
struct PendingChange {
    rel_path: RepoPath,
    abs_path: PathBuf,
    kind: FileEventKind,
    priority: ChangePriority,
    last_event: Instant,
}

/// Summary of one flush cycle.
#[derive(Debug, Clone, Default)]
pub struct FlushSummary {
    pub processed: usize,
    pub skipped_unchanged: usize,
    pub dropped: usize,
    pub errors: Vec<String>,
    pub change_set_id: Option<ChangeSetId>,
}

/// Service bundle the coordinator drives.
pub struct SyncServices {
    pub executor: Arc<GraphExecutor>,
    pub entities: Arc<EntityService>,
    pub relationships: Arc<RelationshipService>,
    pub embeddings: Arc<EmbeddingService>,
    pub temporal: Arc<TemporalQueryService>,
    pub monitoring: Arc<MonitoringService>,
    pub events: Arc<EventBus>,
}

pub struct SyncCoordinator {
    config: SyncConfig,
    services: SyncServices,
    resolver: Arc<ConflictResolver>,
    symbol_index: Arc<SymbolIndex>,
    parser: Mutex<CodeParser>,
    pending: Mutex<HashMap<PathBuf, PendingChange>>,
    file_hashes: DashMap<String, String>,
    path_locks: DashMap<String, Arc<Mutex<()>>>,
    workers: Arc<Semaphore>,
    stopped: std::sync::atomic::AtomicBool,
}

impl SyncCoordinator {
    pub fn new(config: SyncConfig, services: SyncServices) -> Result<Arc<Self>> {
        let workers = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Ok(Arc::new(Self {
            config,
            services,
            resolver: Arc::new(ConflictResolver::new()),
            symbol_index: Arc::new(SymbolIndex::new()),
            parser: Mutex::new(CodeParser::new()?),
            pending: Mutex::new(HashMap::new()),
            file_hashes: DashMap::new(),
            path_locks: DashMap::new(),
            workers,
            stopped: std::sync::atomic::AtomicBool::new(false),
        }))
    }

    pub fn symbol_index(&self) -> Arc<SymbolIndex> {
        Arc::clone(&self.symbol_index)
    }

    pub fn resolver(&self) -> Arc<ConflictResolver> {
        Arc::clone(&self.resolver)
    }

    /// Run the event loop: consume watcher events, debounce, and flush.
    pub fn start(self: &Arc<Self>, mut events: FileEventReceiver) -> tokio::task::JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(100));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                if coordinator.stopped.load(std::sync::atomic::Ordering::SeqCst) {
                    break;
                }
                tokio::select! {
                    event = events.recv() => {
                        match event {
                            Some(event) => coordinator.enqueue_event(event).await,
                            None => break,
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(err) = coordinator.flush_ready().await {
                            warn!("flush cycle failed: {err:#}");
                            if is_fatal_error(&err) {
                                coordinator.services.monitoring.trigger_alert(
                                    AlertSeverity::Critical,
                                    format!("coordinator stopping: {err:#}"),
                                );
                                break;
                            }
                        }
                    }
                }
            }
            info!("sync coordinator stopped");
        })
    }

    /// Run the periodic deferred-reference reconciler.
    pub fn start_reconciler(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(coordinator.config.reconcile_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if coordinator.stopped.load(std::sync::atomic::Ordering::SeqCst) {
                    break;
                }
                match coordinator.reconcile_deferred().await {
                    Ok(upgraded) if upgraded > 0 => {
                        debug!(upgraded, "deferred references upgraded");
                    }
                    Ok(_) => {}
                    Err(err) => warn!("reconciliation failed: {err:#}"),
                }
            }
        })
    }

    pub fn stop(&self) {
        self.stopped.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    /// Queue a raw watcher event, collapsing bursts per path.
    pub async fn enqueue_event(&self, event: FileEvent) {
        let Some(rel_path) = self.relative_path(&event.path) else {
            return;
        };
        let priority = classify_priority(rel_path.as_str());
        let mut pending = self.pending.lock().await;
        pending.insert(
            event.path.clone(),
            PendingChange {
                rel_path,
                abs_path: event.path,
                kind: event.kind,
                priority,
                last_event: Instant::now(),
            },
        );
        let dropped = enforce_soft_cap(&mut pending, self.config.queue_soft_cap);
        if dropped > 0 {
            debug!(dropped, "queue backpressure dropped low-priority changes");
        }
        self.services.monitoring.set_queue_depth(pending.len());
    }

    /// Process every change whose debounce window has elapsed.
    pub async fn flush_ready(self: &Arc<Self>) -> Result<FlushSummary> {
        let ready: Vec<PendingChange> = {
            let mut pending = self.pending.lock().await;
            let now = Instant::now();
            let ready_paths: Vec<PathBuf> = pending
                .iter()
                .filter(|(_, change)| {
                    now.duration_since(change.last_event) >= self.config.debounce
                })
                .map(|(path, _)| path.clone())
                .collect();
            let ready = ready_paths
                .iter()
                .filter_map(|p| pending.remove(p))
                .collect();
            self.services.monitoring.set_queue_depth(pending.len());
            ready
        };
        if ready.is_empty() {
            return Ok(FlushSummary::default());
        }
        self.flush_changes(ready).await
    }

    /// Drain the queue immediately, ignoring debounce. Used by reindex and
    /// tests.
    pub async fn flush_all(self: &Arc<Self>) -> Result<FlushSummary> {
        let ready: Vec<PendingChange> = {
            let mut pending = self.pending.lock().await;
            let drained = pending.drain().map(|(_, c)| c).collect();
            self.services.monitoring.set_queue_depth(0);
            drained
        };
        if ready.is_empty() {
            return Ok(FlushSummary::default());
        }
        self.flush_changes(ready).await
    }

    async fn flush_changes(self: &Arc<Self>, mut ready: Vec<PendingChange>) -> Result<FlushSummary> {
        // High priority first within one flush
        ready.sort_by(|a, b| b.priority.cmp(&a.priority));

        let change_set_id = ChangeSetId::new();
        let operation_id = self.services.monitoring.record_operation_start();
        let budget = Arc::new(OracleBudget::new(self.config.oracle_budget));
        let mut summary = FlushSummary {
            change_set_id: Some(change_set_id),
            ..Default::default()
        };

        let mut handles = Vec::with_capacity(ready.len());
        for change in ready {
            let coordinator = Arc::clone(self);
            let op_id = operation_id.clone();
            let budget = Arc::clone(&budget);
            let permit = Arc::clone(&self.workers)
                .acquire_owned()
                .await
                .expect("worker semaphore never closed");
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let path = change.rel_path.clone();
                let result = coordinator
                    .process_change(&change, change_set_id, &budget, &op_id)
                    .await;
                (path, result)
            }));
        }

        let mut touched: Vec<EntityId> = Vec::new();
        for handle in handles {
            match handle.await {
                Ok((_, Ok(ProcessOutcome::Committed(entity_ids)))) => {
                    summary.processed += 1;
                    touched.extend(entity_ids);
                }
                Ok((_, Ok(ProcessOutcome::Unchanged))) => summary.skipped_unchanged += 1,
                Ok((path, Err(err))) => {
                    self.services
                        .monitoring
                        .record_operation_error(&operation_id, format!("{path}: {err:#}"));
                    summary.errors.push(format!("{path}: {err:#}"));
                }
                Err(join_err) => summary.errors.push(format!("worker panicked: {join_err}")),
            }
        }

        // Temporal bookkeeping: checkpoint the flush membership
        if !touched.is_empty() {
            touched.sort();
            touched.dedup();
            if let Err(err) = self
                .services
                .temporal
                .create_checkpoint(&touched, Some(change_set_id))
                .await
            {
                warn!("checkpoint creation failed: {err:#}");
            }
        }

        if summary.errors.is_empty() {
            self.services.monitoring.record_operation_complete(&operation_id);
        } else {
            self.services.monitoring.record_operation_failed(&operation_id);
        }
        Ok(summary)
    }

    /// One path's pipeline. Serialized per path via an advisory lock.
    #[instrument(skip(self, change, budget), fields(path = %change.rel_path))]
    async fn process_change(
        &self,
        change: &PendingChange,
        change_set_id: ChangeSetId,
        budget: &OracleBudget,
        operation_id: &str,
    ) -> Result<ProcessOutcome> {
        let lock = self
            .path_locks
            .entry(change.rel_path.as_str().to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        match change.kind {
            FileEventKind::Delete => {
                self.handle_delete(&change.rel_path, change_set_id, operation_id)
                    .await
            }
            FileEventKind::Create | FileEventKind::Modify => {
                self.handle_upsert(change, change_set_id, budget, operation_id)
                    .await
            }
        }
    }

    async fn handle_upsert(
        &self,
        change: &PendingChange,
        change_set_id: ChangeSetId,
        budget: &OracleBudget,
        operation_id: &str,
    ) -> Result<ProcessOutcome> {
        let content = tokio::fs::read_to_string(&change.abs_path)
            .await
            .with_context(|| format!("reading {}", change.abs_path.display()))?;

        // Hash short-circuit: unchanged content means no work
        let content_hash = hash_content(&content);
        if let Some(previous) = self.file_hashes.get(change.rel_path.as_str()) {
            if *previous == content_hash {
                return Ok(ProcessOutcome::Unchanged);
            }
        }

        let language = change
            .rel_path
            .extension()
            .and_then(SupportedLanguage::from_extension);

        let parse_started = Instant::now();
        let output = match language {
            Some(language) => {
                let parsed = {
                    let mut parser = self.parser.lock().await;
                    parser.parse_content(&content, language)?
                };
                let oracle = IndexBackedOracle;
                let builder = RelationshipBuilder::new(&oracle, budget);
                builder.build(
                    &change.rel_path,
                    &content,
                    &parsed,
                    &self.symbol_index.snapshot(),
                )?
            }
            None => {
                // Unknown language: file entity only
                let mut output = BuildOutput::default();
                let file_id = EntityId::new(format!("file:{}", change.rel_path))?;
                output.file_entity = Some(
                    Entity::new(
                        file_id,
                        crate::entity::EntityData::File(crate::entity::FileData {
                            extension: change.rel_path.extension().unwrap_or("").to_string(),
                            size: content.len() as u64,
                            lines: content.lines().count(),
                            is_test: false,
                            is_config: true,
                            dependencies: Vec::new(),
                        }),
                    )
                    .with_path(change.rel_path.clone()),
                );
                output
            }
        };
        self.services
            .monitoring
            .record_phase(Phase::Parse, parse_started.elapsed());

        // Diff against the previously published symbol table
        let previous: Vec<SymbolRecord> = self
            .symbol_index
            .snapshot()
            .symbols_in_file(change.rel_path.as_str())
            .into_iter()
            .cloned()
            .collect();
        let delta = diff_symbols(&previous, &output.symbol_records);

        let commit_started = Instant::now();
        let touched = self
            .commit(change, &output, &delta, change_set_id, operation_id)
            .await?;
        self.services
            .monitoring
            .record_phase(Phase::GraphUpdate, commit_started.elapsed());

        // Publish the new symbol table snapshot after a successful commit
        self.symbol_index
            .publish_file(change.rel_path.as_str(), output.symbol_records.clone());
        self.file_hashes
            .insert(change.rel_path.as_str().to_string(), content_hash);

        // Embedding runs after commit; failures must not fail the pipeline
        let embed_started = Instant::now();
        let mut to_embed: Vec<Entity> = Vec::new();
        if let Some(file_entity) = &output.file_entity {
            to_embed.push(file_entity.clone());
        }
        to_embed.extend(output.symbol_entities.iter().cloned());
        if let Err(err) = self
            .services
            .embeddings
            .batch_embed(&to_embed, Some(change_set_id))
            .await
        {
            warn!("embedding batch failed: {err:#}");
        }
        self.services
            .monitoring
            .record_phase(Phase::Embedding, embed_started.elapsed());

        self.services.monitoring.log(
            LogSeverity::Info,
            Some(operation_id),
            format!(
                "{}: {} symbols, {} relationships",
                change.rel_path,
                output.symbol_entities.len(),
                output.relationships.len()
            ),
        );
        Ok(ProcessOutcome::Committed(touched))
    }

    /// Commit one file's entities and edges in a single transaction.
    async fn commit(
        &self,
        change: &PendingChange,
        output: &BuildOutput,
        delta: &SymbolDelta,
        change_set_id: ChangeSetId,
        operation_id: &str,
    ) -> Result<Vec<EntityId>> {
        let mut statements: Vec<Statement> = Vec::new();
        let mut touched: Vec<EntityId> = Vec::new();
        let mut counters = OperationCounters {
            files_processed: 1,
            ..Default::default()
        };

        let mut entities: Vec<&Entity> = Vec::new();
        if let Some(file_entity) = &output.file_entity {
            entities.push(file_entity);
        }
        entities.extend(output.symbol_entities.iter());

        for entity in entities {
            let stored = self.services.entities.try_get(&entity.id).await?;
            let to_write: Option<Entity> = match stored {
                Some(stored) => {
                    match ConflictResolver::detect(&stored, entity) {
                        Some(reason) => {
                            let conflict = Conflict {
                                entity_id: entity.id.clone(),
                                stored,
                                incoming: entity.clone(),
                                detected_at: Utc::now(),
                                reason,
                            };
                            self.services.events.publish(EngineEvent::ConflictDetected {
                                entity_id: entity.id.as_str().to_string(),
                                resolved: true,
                            });
                            match self.resolver.resolve(conflict) {
                                Resolution::Apply(merged) => {
                                    counters.entities_updated += 1;
                                    Some(*merged)
                                }
                                Resolution::Skip => None,
                                Resolution::Unresolved => {
                                    self.services.monitoring.record_operation_conflict(
                                        operation_id,
                                        entity.id.as_str(),
                                    );
                                    self.services.monitoring.trigger_alert(
                                        AlertSeverity::Warning,
                                        format!("unresolved conflict on {}", entity.id),
                                    );
                                    None
                                }
                            }
                        }
                        None => {
                            counters.entities_updated += 1;
                            Some(entity.clone())
                        }
                    }
                }
                None => {
                    counters.entities_created += 1;
                    Some(entity.clone())
                }
            };
            if let Some(mut entity) = to_write {
                let meta = entity.metadata.get_or_insert_with(serde_json::Map::new);
                meta.insert(
                    "changeSetId".to_string(),
                    serde_json::Value::from(change_set_id.to_string()),
                );
                statements.push(self.services.entities.upsert_statement(&entity).await?);
                touched.push(entity.id.clone());
            }
        }

        // Relationship merge statements
        for rel in &output.relationships {
            let mut rel = rel.clone();
            rel.change_set_id = Some(change_set_id);
            rel.normalize()?;
            match self.services.relationships.try_get(&rel.id).await? {
                Some(mut existing) => {
                    existing.merge_observation(&rel);
                    // Re-assertion reopens an edge that had been closed
                    existing.active = true;
                    existing.valid_to = None;
                    statements.push(Statement::UpsertEdge(to_edge(&existing)?));
                    counters.relationships_updated += 1;
                }
                None => {
                    statements.push(Statement::UpsertEdge(to_edge(&rel)?));
                    counters.relationships_created += 1;
                }
            }
        }

        // Edges are re-asserted on every parse; active edges out of this
        // file's entities that were not re-emitted close now
        let now = Utc::now();
        let emitted: std::collections::HashSet<String> =
            output.relationships.iter().map(|r| r.id.clone()).collect();
        let mut from_ids: Vec<EntityId> = Vec::new();
        if let Some(file_entity) = &output.file_entity {
            from_ids.push(file_entity.id.clone());
        }
        from_ids.extend(output.symbol_entities.iter().map(|e| e.id.clone()));
        for from in &from_ids {
            let outgoing = self
                .services
                .executor
                .outgoing(from, ExecOptions::default())
                .await?;
            for edge in outgoing {
                if emitted.contains(&edge.id) {
                    continue;
                }
                if matches!(
                    edge.rel_type,
                    RelationType::PreviousVersion | RelationType::Includes
                ) {
                    continue;
                }
                let active = edge
                    .properties
                    .get("active")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(true);
                if !active {
                    continue;
                }
                let mut props = serde_json::Map::new();
                props.insert(
                    "validTo".to_string(),
                    serde_json::Value::from(now.to_rfc3339()),
                );
                props.insert("active".to_string(), serde_json::Value::from(false));
                props.insert(
                    "changeSetId".to_string(),
                    serde_json::Value::from(change_set_id.to_string()),
                );
                statements.push(Statement::MergeEdgeProperties {
                    id: edge.id,
                    properties: props,
                });
                counters.relationships_deleted += 1;
            }
        }

        // Removed symbols: close their active outgoing edges
        for removed in &delta.removed {
            let outgoing = self
                .services
                .executor
                .outgoing(&removed.entity_id, ExecOptions::default())
                .await?;
            for edge in outgoing {
                let active = edge
                    .properties
                    .get("active")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(true);
                if !active {
                    continue;
                }
                let mut props = serde_json::Map::new();
                props.insert(
                    "validTo".to_string(),
                    serde_json::Value::from(now.to_rfc3339()),
                );
                props.insert("active".to_string(), serde_json::Value::from(false));
                props.insert(
                    "changeSetId".to_string(),
                    serde_json::Value::from(change_set_id.to_string()),
                );
                statements.push(Statement::MergeEdgeProperties {
                    id: edge.id,
                    properties: props,
                });
                counters.relationships_deleted += 1;
            }
        }

        // Version bookkeeping: renames and signature changes get
        // PREVIOUS_VERSION edges stamped with this change set
        for (old, new) in &delta.renamed {
            let mut version_edge = Relationship::new(
                old.entity_id.clone(),
                new.entity_id.clone(),
                RelationType::PreviousVersion,
            );
            version_edge.change_set_id = Some(change_set_id);
            version_edge.source = ResolutionSource::Heuristic;
            version_edge.normalize()?;
            version_edge.id = format!(
                "{}@{}",
                version_edge.canonical_id(),
                now.timestamp_millis()
            );
            statements.push(Statement::UpsertEdge(to_edge(&version_edge)?));
        }
        for changed in &delta.signature_changed {
            let mut version_edge = Relationship::new(
                changed.entity_id.clone(),
                changed.entity_id.clone(),
                RelationType::PreviousVersion,
            );
            version_edge.change_set_id = Some(change_set_id);
            version_edge.source = ResolutionSource::Heuristic;
            let meta = version_edge
                .metadata
                .get_or_insert_with(serde_json::Map::new);
            meta.insert(
                "newSignature".to_string(),
                serde_json::Value::from(changed.signature.clone()),
            );
            version_edge.normalize()?;
            version_edge.id = format!(
                "{}@{}",
                version_edge.canonical_id(),
                now.timestamp_millis()
            );
            statements.push(Statement::UpsertEdge(to_edge(&version_edge)?));
        }

        self.services
            .executor
            .transaction(&statements, ExecOptions::write())
            .await
            .with_context(|| format!("committing {}", change.rel_path))?;
        self.services
            .monitoring
            .record_progress(operation_id, &counters);
        Ok(touched)
    }

    async fn handle_delete(
        &self,
        rel_path: &RepoPath,
        change_set_id: ChangeSetId,
        operation_id: &str,
    ) -> Result<ProcessOutcome> {
        let now = Utc::now();
        let file_id = EntityId::new(format!("file:{rel_path}"))?;
        let symbols: Vec<SymbolRecord> = self
            .symbol_index
            .snapshot()
            .symbols_in_file(rel_path.as_str())
            .into_iter()
            .cloned()
            .collect();

        let mut counters = OperationCounters {
            files_processed: 1,
            ..Default::default()
        };
        let mut statements: Vec<Statement> = Vec::new();
        for symbol in &symbols {
            // Entities survive while inbound edges remain; outgoing edges
            // close now
            let outgoing = self
                .services
                .executor
                .outgoing(&symbol.entity_id, ExecOptions::default())
                .await?;
            for edge in outgoing {
                let mut props = serde_json::Map::new();
                props.insert(
                    "validTo".to_string(),
                    serde_json::Value::from(now.to_rfc3339()),
                );
                props.insert("active".to_string(), serde_json::Value::from(false));
                props.insert(
                    "changeSetId".to_string(),
                    serde_json::Value::from(change_set_id.to_string()),
                );
                statements.push(Statement::MergeEdgeProperties {
                    id: edge.id,
                    properties: props,
                });
            }
            let inbound = self
                .services
                .executor
                .incoming(&symbol.entity_id, ExecOptions::default())
                .await?;
            let has_external_dependents = inbound
                .iter()
                .any(|e| e.from != file_id && e.from != symbol.entity_id);
            if !has_external_dependents {
                statements.push(Statement::DeleteNode {
                    id: symbol.entity_id.clone(),
                });
                counters.entities_deleted += 1;
            }
        }
        statements.push(Statement::DeleteNode {
            id: file_id.clone(),
        });
        counters.entities_deleted += 1;

        self.services
            .executor
            .transaction(&statements, ExecOptions::write())
            .await?;

        for symbol in &symbols {
            self.services.embeddings.evict(&symbol.entity_id).await;
        }
        self.symbol_index.remove_file(rel_path.as_str());
        self.file_hashes.remove(rel_path.as_str());
        self.services
            .monitoring
            .record_progress(operation_id, &counters);
        self.services.monitoring.log(
            LogSeverity::Info,
            Some(operation_id),
            format!("{rel_path}: deleted"),
        );
        Ok(ProcessOutcome::Committed(vec![file_id]))
    }

    /// Scan deferred `toRef` placeholders and upgrade resolvable ones.
    ///
    /// An upgrade changes the target key, so a new edge replaces the
    /// placeholder and the old one is closed.
    pub async fn reconcile_deferred(&self) -> Result<usize> {
        let snapshot = self.symbol_index.snapshot();
        let all = self
            .services
            .executor
            .query_edges(
                &EdgeQuery {
                    active: Some(true),
                    ..Default::default()
                },
                ExecOptions::default(),
            )
            .await?;

        let now = Utc::now();
        let mut statements: Vec<Statement> = Vec::new();
        let mut upgraded = 0usize;
        for edge in &all {
            let rel = from_edge(edge)?;
            let Some(to_ref) = &rel.to_ref else {
                continue;
            };
            let target = match to_ref {
                ToRef::Sym { name, .. } => snapshot.resolve_unique_export(name),
                ToRef::FileSymbol { file_path, name } => snapshot.lookup(file_path, name),
                _ => None,
            };
            let Some(record) = target else {
                continue;
            };

            // Close the placeholder
            let mut props = serde_json::Map::new();
            props.insert(
                "validTo".to_string(),
                serde_json::Value::from(now.to_rfc3339()),
            );
            props.insert("active".to_string(), serde_json::Value::from(false));
            statements.push(Statement::MergeEdgeProperties {
                id: edge.id.clone(),
                properties: props,
            });

            // Open the concrete edge, carrying the evidence forward
            let mut resolved = rel.clone();
            resolved.to_entity_id = record.entity_id.clone();
            resolved.to_ref = Some(ToRef::Entity {
                id: record.entity_id.clone(),
            });
            resolved.valid_from = now;
            resolved.valid_to = None;
            resolved.active = true;
            resolved.confidence = Some(rel.confidence.unwrap_or(0.3).max(0.7));
            resolved.normalize()?;
            statements.push(Statement::UpsertEdge(to_edge(&resolved)?));
            upgraded += 1;
        }

        if !statements.is_empty() {
            self.services
                .executor
                .transaction(&statements, ExecOptions::write())
                .await?;
        }
        Ok(upgraded)
    }

    /// Enqueue every file under the repository root, then drain.
    pub async fn full_reindex(self: &Arc<Self>) -> Result<FlushSummary> {
        let root = self.config.repo_root.clone();
        let mut stack = vec![root.clone()];
        let mut queued = 0usize;
        while let Some(dir) = stack.pop() {
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .with_context(|| format!("listing {}", dir.display()))?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name.starts_with('.')
                    || name == "node_modules"
                    || name == "target"
                    || name == "dist"
                {
                    continue;
                }
                if entry.file_type().await?.is_dir() {
                    stack.push(path);
                } else {
                    self.enqueue_event(FileEvent::new(path, FileEventKind::Create))
                        .await;
                    queued += 1;
                }
            }
        }
        info!(queued, "reindex queued");
        self.flush_all().await
    }

    fn relative_path(&self, path: &Path) -> Option<RepoPath> {
        let rel = path.strip_prefix(&self.config.repo_root).ok()?;
        RepoPath::new(rel.to_string_lossy().to_string()).ok()
    }

    /// Current queue depth (pending, not yet flushed).
    pub async fn queue_depth(&self) -> usize {
        self.pending.lock().await.len()
    }
}

enum ProcessOutcome {
    Committed(Vec<EntityId>),
    Unchanged,
}

/// Symbol-table delta between two parses of a file.
#[derive(Debug, Default)]
pub struct SymbolDelta {
    pub added: Vec<SymbolRecord>,
    pub removed: Vec<SymbolRecord>,
    pub signature_changed: Vec<SymbolRecord>,
    /// `(old, new)` pairs detected as renames.
    pub renamed: Vec<(SymbolRecord, SymbolRecord)>,
}

/// Diff previous vs current symbol records by name.
pub fn diff_symbols(previous: &[SymbolRecord], current: &[SymbolRecord]) -> SymbolDelta {
    let mut delta = SymbolDelta::default();
    let prev_by_name: HashMap<&str, &SymbolRecord> =
        previous.iter().map(|r| (r.name.as_str(), r)).collect();
    let curr_by_name: HashMap<&str, &SymbolRecord> =
        current.iter().map(|r| (r.name.as_str(), r)).collect();

    for record in current {
        match prev_by_name.get(record.name.as_str()) {
            None => delta.added.push(record.clone()),
            Some(prev) if prev.signature != record.signature => {
                delta.signature_changed.push(record.clone());
            }
            Some(_) => {}
        }
    }
    for record in previous {
        if !curr_by_name.contains_key(record.name.as_str()) {
            delta.removed.push(record.clone());
        }
    }

    // A lone removal paired with a lone addition of the same kind reads as
    // a rename
    if delta.removed.len() == 1 && delta.added.len() == 1 {
        let removed = &delta.removed[0];
        let added = &delta.added[0];
        if removed.kind == added.kind {
            delta.renamed.push((removed.clone(), added.clone()));
        }
    }
    delta
}

fn hash_content(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Priority classification: source trees high, manifests medium, build
/// outputs low.
pub fn classify_priority(rel_path: &str) -> ChangePriority {
    let lowered = rel_path.to_lowercase();
    if lowered.starts_with("dist/")
        || lowered.starts_with("build/")
        || lowered.starts_with("target/")
        || lowered.contains("/dist/")
        || lowered.contains("/build/")
        || lowered.contains("node_modules/")
    {
        return ChangePriority::Low;
    }
    let file_name = lowered.rsplit('/').next().unwrap_or(&lowered);
    if matches!(
        file_name,
        "package.json"
            | "package-lock.json"
            | "yarn.lock"
            | "pnpm-lock.yaml"
            | "cargo.toml"
            | "cargo.lock"
            | "pyproject.toml"
            | "requirements.txt"
    ) {
        return ChangePriority::Medium;
    }
    ChangePriority::High
}

/// Drop pending changes above the soft cap, lowest priority first. High
/// priority entries are never dropped.
fn enforce_soft_cap(
    pending: &mut HashMap<PathBuf, PendingChange>,
    soft_cap: usize,
) -> usize {
    if pending.len() <= soft_cap {
        return 0;
    }
    let mut dropped = 0usize;
    for class in [ChangePriority::Low, ChangePriority::Medium] {
        while pending.len() > soft_cap {
            let victim = pending
                .iter()
                .find(|(_, change)| change.priority == class)
                .map(|(path, _)| path.clone());
            match victim {
                Some(path) => {
                    pending.remove(&path);
                    dropped += 1;
                }
                None => break,
            }
        }
        if pending.len() <= soft_cap {
            break;
        }
    }
    dropped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, signature: &str) -> SymbolRecord {
        SymbolRecord {
            entity_id: EntityId::new(format!("sym:a.ts#{name}")).unwrap(),
            name: name.to_string(),
            kind: crate::entity::SymbolKind::Function,
            file_path: "a.ts".to_string(),
            is_exported: true,
            signature: signature.to_string(),
        }
    }

    #[test]
    fn diff_detects_adds_removes_and_signature_changes() {
        let previous = vec![record("foo", "function foo()"), record("bar", "function bar()")];
        let current = vec![
            record("foo", "function foo(x: number)"),
            record("baz", "function baz()"),
        ];
        let delta = diff_symbols(&previous, &current);
        assert_eq!(delta.signature_changed.len(), 1);
        assert_eq!(delta.signature_changed[0].name, "foo");
        assert_eq!(delta.added.len(), 1);
        assert_eq!(delta.removed.len(), 1);
        // bar -> baz pairs as a rename
        assert_eq!(delta.renamed.len(), 1);
        assert_eq!(delta.renamed[0].0.name, "bar");
        assert_eq!(delta.renamed[0].1.name, "baz");
    }

    #[test]
    fn priority_classification() {
        assert_eq!(classify_priority("src/auth.ts"), ChangePriority::High);
        assert_eq!(classify_priority("package.json"), ChangePriority::Medium);
        assert_eq!(classify_priority("sub/yarn.lock"), ChangePriority::Medium);
        assert_eq!(classify_priority("dist/bundle.js"), ChangePriority::Low);
        assert_eq!(classify_priority("app/build/out.js"), ChangePriority::Low);
    }

    #[test]
    fn soft_cap_drops_low_then_medium_never_high() {
        let mut pending = HashMap::new();
        for i in 0..5 {
            let path = PathBuf::from(format!("/repo/src/f{i}.ts"));
            pending.insert(
                path.clone(),
                PendingChange {
                    rel_path: RepoPath::new(format!("src/f{i}.ts")).unwrap(),
                    abs_path: path,
                    kind: FileEventKind::Modify,
                    priority: ChangePriority::High,
                    last_event: Instant::now(),
                },
            );
        }
        for i in 0..5 {
            let path = PathBuf::from(format!("/repo/dist/f{i}.js"));
            pending.insert(
                path.clone(),
                PendingChange {
                    rel_path: RepoPath::new(format!("dist/f{i}.js")).unwrap(),
                    abs_path: path,
                    kind: FileEventKind::Modify,
                    priority: ChangePriority::Low,
                    last_event: Instant::now(),
                },
            );
        }

        let dropped = enforce_soft_cap(&mut pending, 5);
        assert_eq!(dropped, 5);
        assert!(pending
            .values()
            .all(|change| change.priority == ChangePriority::High));

        // With only high entries the cap cannot drop further
        let dropped = enforce_soft_cap(&mut pending, 2);
        assert_eq!(dropped, 0);
        assert_eq!(pending.len(), 5);
    }
}
