//! Graph command executor
//!
//! Front door to the graph store: every read and every transactional batch
//! flows through here so deadlines, retry policy, and failure events are
//! applied in one place. Retries fire only for failures classified as
//! transient, with jittered exponential backoff and a bounded attempt
//! count.

use anyhow::Result;
use rand::Rng;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::errors::{is_transient_error, KgError};
use crate::events::{EngineEvent, EventBus};
use crate::graph_store::{
    EdgeQuery, GraphStore, NodeQuery, Statement, StoreStats, StoredEdge, StoredNode,
};
use crate::types::EntityId;

/// Whether an execution takes the read or the write path on the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessMode {
    #[default]
    Read,
    Write,
}

/// Per-call execution options.
#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub timeout: Duration,
    pub retryable: bool,
    pub access_mode: AccessMode,
    pub database: Option<String>,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            retryable: true,
            access_mode: AccessMode::Read,
            database: None,
        }
    }
}

impl ExecOptions {
    pub fn write() -> Self {
        Self {
            access_mode: AccessMode::Write,
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn no_retry(mut self) -> Self {
        self.retryable = false;
        self
    }
}

/// Retry policy for transient failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// Executor over a graph store.
pub struct GraphExecutor {
    store: Arc<dyn GraphStore>,
    retry: RetryConfig,
    events: Arc<EventBus>,
    closed: AtomicBool,
    queries_executed: AtomicU64,
    transactions_executed: AtomicU64,
}

impl GraphExecutor {
    pub fn new(store: Arc<dyn GraphStore>, events: Arc<EventBus>) -> Self {
        Self {
            store,
            retry: RetryConfig::default(),
            events,
            closed: AtomicBool::new(false),
            queries_executed: AtomicU64::new(0),
            transactions_executed: AtomicU64::new(0),
        }
    }

    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(&self) -> Arc<dyn GraphStore> {
        Arc::clone(&self.store)
    }

    /// Mark the executor closed; subsequent calls fail fast.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.events.publish(EngineEvent::ExecutorClosed);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn query_count(&self) -> u64 {
        self.queries_executed.load(Ordering::Relaxed)
    }

    pub fn transaction_count(&self) -> u64 {
        self.transactions_executed.load(Ordering::Relaxed)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(KgError::Fatal("executor is closed".to_string()).into());
        }
        Ok(())
    }

    /// Run one attempt-loop with deadline and retry classification.
    async fn run<T, F, Fut>(&self, operation: &str, opts: &ExecOptions, f: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.ensure_open()?;
        let started = std::time::Instant::now();
        let mut attempt: u32 = 0;
        loop {
            let remaining = opts
                .timeout
                .checked_sub(started.elapsed())
                .ok_or_else(|| KgError::Timeout {
                    operation: operation.to_string(),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                })?;

            match tokio::time::timeout(remaining, f()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) => {
                    let transient = is_transient_error(&err);
                    if transient && opts.retryable && attempt < self.retry.max_retries {
                        attempt += 1;
                        let delay = backoff_delay(&self.retry, attempt);
                        debug!(
                            operation,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "transient failure, backing off"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    warn!(operation, attempt, "execution failed: {err:#}");
                    self.events.publish(EngineEvent::ExecutorError {
                        operation: operation.to_string(),
                        message: format!("{err:#}"),
                    });
                    return Err(err);
                }
                Err(_elapsed) => {
                    let err = KgError::Timeout {
                        operation: operation.to_string(),
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    };
                    self.events.publish(EngineEvent::ExecutorError {
                        operation: operation.to_string(),
                        message: err.to_string(),
                    });
                    return Err(err.into());
                }
            }
        }
    }

    /// Apply a single mutation with default write options.
    pub async fn execute(&self, statement: Statement, opts: ExecOptions) -> Result<()> {
        statement.validate()?;
        self.queries_executed.fetch_add(1, Ordering::Relaxed);
        let statements = [statement];
        self.run("execute", &opts, || async {
            self.store.apply(&statements).await
        })
        .await
    }

    /// Apply a batch atomically. Rolls back entirely on failure.
    pub async fn transaction(&self, statements: &[Statement], opts: ExecOptions) -> Result<()> {
        if statements.is_empty() {
            return Ok(());
        }
        for stmt in statements {
            stmt.validate()?;
        }
        self.transactions_executed.fetch_add(1, Ordering::Relaxed);
        let count = statements.len();
        let result = self
            .run("transaction", &opts, || async {
                self.store.apply(statements).await
            })
            .await;
        if let Err(err) = &result {
            self.events.publish(EngineEvent::TransactionError {
                statements: count,
                message: format!("{err:#}"),
            });
        }
        result
    }

    pub async fn get_node(&self, id: &EntityId, opts: ExecOptions) -> Result<Option<StoredNode>> {
        self.queries_executed.fetch_add(1, Ordering::Relaxed);
        self.run("get_node", &opts, || async { self.store.get_node(id).await })
            .await
    }

    pub async fn query_nodes(
        &self,
        query: &NodeQuery,
        opts: ExecOptions,
    ) -> Result<Vec<StoredNode>> {
        self.queries_executed.fetch_add(1, Ordering::Relaxed);
        self.run("query_nodes", &opts, || async {
            self.store.query_nodes(query).await
        })
        .await
    }

    pub async fn get_edge(&self, id: &str, opts: ExecOptions) -> Result<Option<StoredEdge>> {
        self.queries_executed.fetch_add(1, Ordering::Relaxed);
        self.run("get_edge", &opts, || async { self.store.get_edge(id).await })
            .await
    }

    pub async fn query_edges(
        &self,
        query: &EdgeQuery,
        opts: ExecOptions,
    ) -> Result<Vec<StoredEdge>> {
        self.queries_executed.fetch_add(1, Ordering::Relaxed);
        self.run("query_edges", &opts, || async {
            self.store.query_edges(query).await
        })
        .await
    }

    pub async fn outgoing(&self, from: &EntityId, opts: ExecOptions) -> Result<Vec<StoredEdge>> {
        self.run("outgoing", &opts, || async { self.store.outgoing(from).await })
            .await
    }

    pub async fn incoming(&self, to: &EntityId, opts: ExecOptions) -> Result<Vec<StoredEdge>> {
        self.run("incoming", &opts, || async { self.store.incoming(to).await })
            .await
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        self.run("stats", &ExecOptions::default(), || async {
            self.store.stats().await
        })
        .await
    }
}

/// Exponential backoff with jitter, capped at the configured max.
fn backoff_delay(retry: &RetryConfig, attempt: u32) -> Duration {
    let exp = retry
        .base_delay
        .saturating_mul(2_u32.saturating_pow(attempt.saturating_sub(1)));
    let capped = exp.min(retry.max_delay);
    let jitter = rand::thread_rng().gen_range(0.5..1.5);
    capped.mul_f64(jitter).min(retry.max_delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph_store::StoredNode;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    /// Store that fails with a transient error N times before succeeding.
    struct FlakyStore {
        failures_remaining: AtomicU32,
        calls: AtomicU32,
    }

    impl FlakyStore {
        fn new(failures: u32) -> Self {
            Self {
                failures_remaining: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
            }
        }

        fn fail_if_due(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures_remaining.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
                return Err(KgError::Transient("connection reset".to_string()).into());
            }
            Ok(())
        }
    }

    #[async_trait]
    impl GraphStore for FlakyStore {
        async fn apply(&self, _statements: &[Statement]) -> Result<()> {
            self.fail_if_due()
        }
        async fn get_node(&self, _id: &EntityId) -> Result<Option<StoredNode>> {
            self.fail_if_due()?;
            Ok(None)
        }
        async fn query_nodes(&self, _query: &NodeQuery) -> Result<Vec<StoredNode>> {
            self.fail_if_due()?;
            Ok(vec![])
        }
        async fn get_edge(&self, _id: &str) -> Result<Option<StoredEdge>> {
            Ok(None)
        }
        async fn query_edges(&self, _query: &EdgeQuery) -> Result<Vec<StoredEdge>> {
            Ok(vec![])
        }
        async fn outgoing(&self, _from: &EntityId) -> Result<Vec<StoredEdge>> {
            Ok(vec![])
        }
        async fn incoming(&self, _to: &EntityId) -> Result<Vec<StoredEdge>> {
            Ok(vec![])
        }
        async fn stats(&self) -> Result<StoreStats> {
            Ok(StoreStats::default())
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried_to_success() {
        let store = Arc::new(FlakyStore::new(2));
        let exec = GraphExecutor::new(store.clone(), Arc::new(EventBus::new()))
            .with_retry_config(fast_retry());
        let node = exec
            .get_node(&EntityId::new("x").unwrap(), ExecOptions::default())
            .await
            .unwrap();
        assert!(node.is_none());
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_are_bounded_and_error_propagates() {
        let store = Arc::new(FlakyStore::new(10));
        let exec = GraphExecutor::new(store.clone(), Arc::new(EventBus::new()))
            .with_retry_config(fast_retry());
        let err = exec
            .get_node(&EntityId::new("x").unwrap(), ExecOptions::default())
            .await
            .unwrap_err();
        assert!(is_transient_error(&err));
        // 1 initial + 3 retries
        assert_eq!(store.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn non_retryable_calls_fail_on_first_transient_error() {
        let store = Arc::new(FlakyStore::new(1));
        let exec = GraphExecutor::new(store.clone(), Arc::new(EventBus::new()))
            .with_retry_config(fast_retry());
        let result = exec
            .get_node(&EntityId::new("x").unwrap(), ExecOptions::default().no_retry())
            .await;
        assert!(result.is_err());
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closed_executor_fails_fast() {
        let store = Arc::new(FlakyStore::new(0));
        let events = Arc::new(EventBus::new());
        let recorder = Arc::new(crate::events::RecordingSubscriber::new());
        events.subscribe(recorder.clone()).unwrap();
        let exec = GraphExecutor::new(store, events);
        exec.close();
        assert!(exec
            .get_node(&EntityId::new("x").unwrap(), ExecOptions::default())
            .await
            .is_err());
        assert!(recorder.events().contains(&EngineEvent::ExecutorClosed));
    }
}
