// Cartograph - A Code Knowledge Graph Engine for Repository Intelligence
// Root library module

pub mod conflict;
pub mod embedding_service;
pub mod embeddings;
pub mod entity;
pub mod entity_service;
pub mod errors;
pub mod events;
pub mod executor;
pub mod graph_store;
pub mod memory_graph;
pub mod monitoring;
pub mod observability;
pub mod relationship;
pub mod relationship_service;
pub mod search_service;
pub mod symbol_index;
pub mod temporal_query;
pub mod types;
pub mod vector_index;
pub mod watcher;

// Code parsing module
pub mod parsing;

// Relationship extraction from parsed sources
#[cfg(feature = "tree-sitter-parsing")]
pub mod relationship_builder;

// File-watch driven ingestion pipeline
#[cfg(feature = "tree-sitter-parsing")]
pub mod sync_coordinator;

// Re-export key types
pub use observability::{
    init_logging, init_logging_with_level, log_operation, record_metric, with_trace_id,
    MetricType, Operation, OperationContext,
};

pub use errors::{is_fatal_error, is_transient_error, ExitCode, KgError};

// Re-export validated types
pub use types::{ChangeSetId, EntityId, RepoPath, TimestampPair, ValidatedLimit};

// Re-export the data model
pub use entity::{Entity, EntityData, SourceLocation, SymbolData, SymbolDetail, SymbolKind};
pub use relationship::{
    canonical_relationship_id, EdgeLocation, Evidence, RelationType, Relationship,
    ResolutionSource, ToRef, MAX_EVIDENCE,
};

// Re-export the store layer
pub use executor::{AccessMode, ExecOptions, GraphExecutor, RetryConfig};
pub use graph_store::{EdgeQuery, GraphStore, NodeQuery, Statement, StoredEdge, StoredNode};
pub use memory_graph::MemoryGraphStore;

// Re-export services
pub use embedding_service::{BatchEmbedOutcome, EmbeddingService, SemanticHit};
pub use embeddings::{EmbeddingConfig, EmbeddingProvider, HashEmbeddingProvider};
pub use entity_service::{BulkUpsertOutcome, EntityListQuery, EntityService};
pub use relationship_service::{BulkRelOptions, BulkRelOutcome, RelationshipService};
pub use search_service::{
    SearchFilters, SearchRequest, SearchResult, SearchService, SearchType,
};
pub use temporal_query::{
    RelationshipTimeline, TemporalQueryService, TimeTravelQuery, TraversalResult,
};
pub use vector_index::{
    SimilarityMetric, VectorHit, VectorIndexService, VectorIndexSpec, VectorSearchOptions,
};

// Re-export monitoring and events
pub use events::{EngineEvent, EventBus, RecordingSubscriber, Subscriber};
pub use monitoring::{AlertSeverity, HealthStatus, MonitoringService, OperationCounters};

// Re-export conflict resolution
pub use conflict::{Conflict, ConflictResolver, ConflictStrategy, Resolution};

// Re-export the ingestion pipeline
#[cfg(feature = "tree-sitter-parsing")]
pub use relationship_builder::{OracleBudget, RelationshipBuilder, TypeOracle};
#[cfg(feature = "tree-sitter-parsing")]
pub use sync_coordinator::{
    ChangePriority, FlushSummary, SyncConfig, SyncCoordinator, SyncServices,
};
pub use symbol_index::{SymbolIndex, SymbolRecord, SymbolSnapshot};
pub use watcher::{FileEvent, FileEventKind, NotifyEventSource, SyntheticEventSource};
