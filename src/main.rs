// Cartograph CLI - operational entry points for the knowledge graph engine

use anyhow::Result;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use cartograph::embedding_service::EmbeddingService;
use cartograph::entity_service::EntityService;
use cartograph::errors::ExitCode;
use cartograph::events::EventBus;
use cartograph::executor::GraphExecutor;
use cartograph::memory_graph::MemoryGraphStore;
use cartograph::monitoring::MonitoringService;
use cartograph::relationship_service::RelationshipService;
use cartograph::sync_coordinator::{SyncConfig, SyncCoordinator, SyncServices};
use cartograph::temporal_query::TemporalQueryService;
use cartograph::vector_index::VectorIndexService;
use cartograph::watcher::NotifyEventSource;
use cartograph::{init_logging_with_level, HashEmbeddingProvider};

#[derive(Parser)]
#[command(name = "cartograph")]
#[command(about = "A code knowledge graph engine for repository intelligence")]
#[command(version)]
struct Cli {
    /// Directory holding the graph snapshot and indexes
    #[arg(long, global = true, default_value = ".cartograph", env = "CARTOGRAPH_DATA_DIR")]
    data_dir: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create storage and the vector index (idempotent)
    InitIndex {
        /// Embedding dimensionality
        #[arg(long, default_value_t = 768)]
        dimensions: usize,
    },
    /// Re-ingest the whole repository
    Reindex {
        /// Repository root to index
        #[arg(long, default_value = ".")]
        repo_root: PathBuf,
    },
    /// Fold duplicate relationships between identical endpoints
    CompactDuplicates,
    /// Remove checkpoints and closed temporal edges past retention
    Prune {
        /// Retention window in days
        #[arg(long, default_value_t = 30)]
        retention_days: i64,
    },
    /// Watch a repository and synchronize continuously
    Watch {
        /// Repository root to watch
        #[arg(long, default_value = ".")]
        repo_root: PathBuf,
    },
}

struct Engine {
    executor: Arc<GraphExecutor>,
    store: Arc<MemoryGraphStore>,
    entities: Arc<EntityService>,
    relationships: Arc<RelationshipService>,
    embeddings: Arc<EmbeddingService>,
    temporal: Arc<TemporalQueryService>,
    monitoring: Arc<MonitoringService>,
    events: Arc<EventBus>,
}

impl Engine {
    async fn open(data_dir: &PathBuf, dimensions: usize) -> Result<Self> {
        let store = Arc::new(MemoryGraphStore::open(data_dir).await?);
        let events = Arc::new(EventBus::new());
        let executor = Arc::new(GraphExecutor::new(store.clone(), events.clone()));
        let vectors = Arc::new(VectorIndexService::new(executor.clone()));
        let provider = Arc::new(HashEmbeddingProvider::with_dimensions(dimensions));
        let embeddings = Arc::new(EmbeddingService::new(
            provider,
            vectors.clone(),
            events.clone(),
        ));
        embeddings.initialize_index()?;
        let entities = Arc::new(EntityService::new(executor.clone()).with_vector_index(vectors));
        let relationships = Arc::new(RelationshipService::new(executor.clone()));
        let temporal = Arc::new(TemporalQueryService::new(executor.clone()));
        let monitoring = Arc::new(MonitoringService::new(events.clone()));
        Ok(Self {
            executor,
            store,
            entities,
            relationships,
            embeddings,
            temporal,
            monitoring,
            events,
        })
    }

    fn coordinator(&self, repo_root: PathBuf) -> Result<Arc<SyncCoordinator>> {
        SyncCoordinator::new(
            SyncConfig::new(repo_root),
            SyncServices {
                executor: self.executor.clone(),
                entities: self.entities.clone(),
                relationships: self.relationships.clone(),
                embeddings: self.embeddings.clone(),
                temporal: self.temporal.clone(),
                monitoring: self.monitoring.clone(),
                events: self.events.clone(),
            },
        )
    }
}

async fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::InitIndex { dimensions } => {
            let engine = Engine::open(&cli.data_dir, dimensions).await?;
            engine.store.flush().await?;
            if !cli.quiet {
                println!(
                    "Initialized graph store and {dimensions}-dimension vector index at {}",
                    cli.data_dir.display()
                );
            }
            Ok(0)
        }
        Commands::Reindex { repo_root } => {
            let engine = Engine::open(&cli.data_dir, 768).await?;
            let coordinator = engine.coordinator(repo_root.clone())?;

            let spinner = if cli.quiet {
                ProgressBar::hidden()
            } else {
                let spinner = ProgressBar::new_spinner();
                spinner.set_style(
                    ProgressStyle::with_template("{spinner} {msg}")
                        .expect("static progress template"),
                );
                spinner.enable_steady_tick(Duration::from_millis(120));
                spinner.set_message(format!("indexing {}", repo_root.display()));
                spinner
            };

            let summary = coordinator.full_reindex().await?;
            // A second pass settles cross-file references that only became
            // resolvable once every file was indexed
            coordinator.reconcile_deferred().await?;
            engine.store.flush().await?;
            spinner.finish_and_clear();

            if !cli.quiet {
                println!(
                    "Indexed {} files ({} unchanged, {} failed)",
                    summary.processed,
                    summary.skipped_unchanged,
                    summary.errors.len()
                );
                for error in &summary.errors {
                    eprintln!("  {error}");
                }
            }
            if summary.errors.is_empty() {
                Ok(0)
            } else if summary.processed > 0 {
                Ok(ExitCode::PartialFailure as i32)
            } else {
                Ok(ExitCode::StorageUnavailable as i32)
            }
        }
        Commands::CompactDuplicates => {
            let engine = Engine::open(&cli.data_dir, 768).await?;
            let merged = engine.relationships.merge_normalized_duplicates().await?;
            engine.store.flush().await?;
            if !cli.quiet {
                println!("Merged {merged} duplicate relationships");
            }
            Ok(0)
        }
        Commands::Prune { retention_days } => {
            let engine = Engine::open(&cli.data_dir, 768).await?;
            let snapshot = engine.temporal.prune(retention_days).await?;
            engine.store.flush().await?;
            if !cli.quiet {
                println!(
                    "Pruned {} checkpoints and {} closed edges",
                    snapshot.checkpoints_removed, snapshot.closed_edges_removed
                );
            }
            Ok(0)
        }
        Commands::Watch { repo_root } => {
            let engine = Engine::open(&cli.data_dir, 768).await?;
            let coordinator = engine.coordinator(repo_root.clone())?;
            let monitoring = engine.monitoring.clone();
            let _health = monitoring.start_health_monitor();
            let _reconciler = coordinator.start_reconciler();

            let (source, rx) = NotifyEventSource::start(&[repo_root.clone()])?;
            let loop_handle = coordinator.start(rx);
            if !cli.quiet {
                println!("Watching {} (ctrl-c to stop)", repo_root.display());
            }
            tokio::signal::ctrl_c().await?;
            coordinator.stop();
            drop(source);
            loop_handle.abort();
            engine.store.flush().await?;
            Ok(0)
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = init_logging_with_level(cli.verbose, cli.quiet) {
        eprintln!("failed to initialize logging: {err:#}");
    }
    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(ExitCode::from_error(&err) as i32);
        }
    }
}
