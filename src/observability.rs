// Centralized Observability Infrastructure
// Structured logging, metric counters, and trace-id scoping for the
// knowledge graph engine. Installed once at startup; every pipeline entry
// point logs through here.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{error, info, instrument};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

// Global atomic counters for coarse engine metrics
static OPERATION_COUNTER: AtomicU64 = AtomicU64::new(0);
static ERROR_COUNTER: AtomicU64 = AtomicU64::new(0);
static QUERY_COUNTER: AtomicU64 = AtomicU64::new(0);
static EMBEDDING_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Initialize the logging and tracing infrastructure.
/// This should be called once at application startup.
pub fn init_logging() -> Result<()> {
    init_logging_with_level(false, false)
}

/// Initialize logging with configurable verbosity.
pub fn init_logging_with_level(verbose: bool, quiet: bool) -> Result<()> {
    let filter_level = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("cartograph=debug,info")
    } else {
        // Warnings and errors from the engine, errors only from dependencies.
        // RUST_LOG or --verbose widens this.
        EnvFilter::new("cartograph=warn,error")
    };

    // Quiet takes precedence over RUST_LOG so --quiet always silences output
    let env_filter = if quiet {
        EnvFilter::new("error")
    } else if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::try_from_default_env().unwrap_or(filter_level)
    } else {
        filter_level
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(!quiet)
        .with_thread_ids(!quiet)
        .with_line_number(!quiet)
        .with_file(!quiet)
        .with_ansi(true);

    match tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
    {
        Ok(()) => {
            if !quiet {
                info!("Cartograph observability initialized");
            }
            Ok(())
        }
        Err(_) => {
            // Already initialized, which is fine in test environments
            Ok(())
        }
    }
}

/// Structured operations logged by the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Operation {
    // Ingestion pipeline
    FileParse {
        path: String,
        symbols: usize,
    },
    SymbolDiff {
        path: String,
        added: usize,
        removed: usize,
        changed: usize,
    },
    GraphCommit {
        path: String,
        entities: usize,
        relationships: usize,
    },
    ReconcileDeferred {
        scanned: usize,
        upgraded: usize,
    },

    // Graph store
    StoreQuery {
        command: String,
        rows: usize,
    },
    StoreTransaction {
        statements: usize,
    },

    // Embedding
    EmbeddingBatch {
        entities: usize,
        failures: usize,
    },

    // Query surface
    Search {
        strategy: String,
        results: usize,
    },
    TemporalTraversal {
        start: String,
        depth: usize,
        paths: usize,
    },

    // System
    Startup {
        version: String,
    },
    Shutdown {
        reason: String,
    },
    Checkpoint {
        members: usize,
    },
    Prune {
        removed: usize,
    },
}

impl Operation {
    /// Validate operation parameters before logging.
    pub fn validate(&self) -> Result<()> {
        match self {
            Operation::FileParse { path, .. } | Operation::GraphCommit { path, .. } => {
                if path.is_empty() {
                    anyhow::bail!("Operation with empty path");
                }
            }
            Operation::StoreTransaction { statements } => {
                if *statements == 0 {
                    anyhow::bail!("Transaction must carry at least one statement");
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Metric types for performance monitoring
#[derive(Debug, Clone)]
pub enum MetricType {
    Counter {
        name: &'static str,
        value: u64,
    },
    Gauge {
        name: &'static str,
        value: f64,
    },
    Histogram {
        name: &'static str,
        value: f64,
        unit: &'static str,
    },
    Timer {
        name: &'static str,
        duration: Duration,
    },
}

/// Operation context for tracing through the system
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub trace_id: Uuid,
    pub span_id: Uuid,
    pub parent_span_id: Option<Uuid>,
    pub operation: String,
    pub start_time: Instant,
    pub attributes: Vec<(String, String)>,
}

impl OperationContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            trace_id: Uuid::new_v4(),
            span_id: Uuid::new_v4(),
            parent_span_id: None,
            operation: operation.into(),
            start_time: Instant::now(),
            attributes: Vec::new(),
        }
    }

    pub fn child(&self, operation: impl Into<String>) -> Self {
        Self {
            trace_id: self.trace_id,
            span_id: Uuid::new_v4(),
            parent_span_id: Some(self.span_id),
            operation: operation.into(),
            start_time: Instant::now(),
            attributes: Vec::new(),
        }
    }

    pub fn add_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.push((key.into(), value.into()));
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

/// Log an operation with full context
#[instrument(skip(ctx, op, result))]
pub fn log_operation(ctx: &OperationContext, op: &Operation, result: &Result<()>) {
    let elapsed = ctx.elapsed();
    let attrs = ctx
        .attributes
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(", ");

    OPERATION_COUNTER.fetch_add(1, Ordering::Relaxed);

    match result {
        Ok(()) => {
            info!(
                trace_id = %ctx.trace_id,
                span_id = %ctx.span_id,
                operation = %ctx.operation,
                elapsed_ms = elapsed.as_millis(),
                attributes = %attrs,
                "Operation completed: {:?}", op
            );
        }
        Err(e) => {
            ERROR_COUNTER.fetch_add(1, Ordering::Relaxed);
            error!(
                trace_id = %ctx.trace_id,
                span_id = %ctx.span_id,
                operation = %ctx.operation,
                elapsed_ms = elapsed.as_millis(),
                attributes = %attrs,
                "Operation failed: {:?}: {e:#}", op
            );
        }
    }
}

/// Record a metric through the tracing pipeline
pub fn record_metric(metric: MetricType) {
    match &metric {
        MetricType::Counter { name, value } => {
            if *name == "query.executed" {
                QUERY_COUNTER.fetch_add(*value, Ordering::Relaxed);
            } else if *name == "embedding.generated" {
                EMBEDDING_COUNTER.fetch_add(*value, Ordering::Relaxed);
            }
            tracing::debug!(metric = name, value, "counter");
        }
        MetricType::Gauge { name, value } => {
            tracing::debug!(metric = name, value, "gauge");
        }
        MetricType::Histogram { name, value, unit } => {
            tracing::debug!(metric = name, value, unit, "histogram");
        }
        MetricType::Timer { name, duration } => {
            tracing::debug!(metric = name, duration_ms = duration.as_millis(), "timer");
        }
    }
}

/// Snapshot of the global counters, used by health reporting.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub operations: u64,
    pub errors: u64,
    pub queries: u64,
    pub embeddings: u64,
}

pub fn counter_snapshot() -> CounterSnapshot {
    CounterSnapshot {
        operations: OPERATION_COUNTER.load(Ordering::Relaxed),
        errors: ERROR_COUNTER.load(Ordering::Relaxed),
        queries: QUERY_COUNTER.load(Ordering::Relaxed),
        embeddings: EMBEDDING_COUNTER.load(Ordering::Relaxed),
    }
}

/// Run a future inside a fresh trace scope, logging entry and exit.
pub async fn with_trace_id<F, T>(operation: &str, fut: F) -> T
where
    F: Future<Output = T>,
{
    let ctx = OperationContext::new(operation);
    tracing::debug!(trace_id = %ctx.trace_id, operation, "trace start");
    let out = fut.await;
    tracing::debug!(
        trace_id = %ctx.trace_id,
        operation,
        elapsed_ms = ctx.elapsed().as_millis(),
        "trace end"
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_validation_rejects_empty_paths() {
        let op = Operation::FileParse {
            path: String::new(),
            symbols: 0,
        };
        assert!(op.validate().is_err());

        let op = Operation::StoreTransaction { statements: 0 };
        assert!(op.validate().is_err());
    }

    #[test]
    fn counters_accumulate() {
        let before = counter_snapshot();
        record_metric(MetricType::Counter {
            name: "query.executed",
            value: 3,
        });
        let after = counter_snapshot();
        assert!(after.queries >= before.queries + 3);
    }

    #[tokio::test]
    async fn with_trace_id_passes_value_through() {
        let v = with_trace_id("test", async { 42 }).await;
        assert_eq!(v, 42);
    }
}
