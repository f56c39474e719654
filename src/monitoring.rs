//! Monitoring: operation lifecycle, health, alerts, and log retention
//!
//! The coordinator reports per-file outcomes here; consumers read derived
//! health and alert state. Alert and log storage are ring buffers, so
//! monitoring memory stays bounded no matter how long the engine runs.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::{EngineEvent, EventBus};

const MAX_ALERTS: usize = 100;
const MAX_LOGS_PER_SEVERITY: usize = 1000;
const RETENTION_HOURS: i64 = 24;
/// Cadence of the periodic health check.
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Counters accumulated by one sync operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationCounters {
    pub files_processed: usize,
    pub entities_created: usize,
    pub entities_updated: usize,
    pub entities_deleted: usize,
    pub relationships_created: usize,
    pub relationships_updated: usize,
    pub relationships_deleted: usize,
}

/// One tracked operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    pub id: String,
    pub started: DateTime<Utc>,
    pub completed: Option<DateTime<Utc>>,
    pub counters: OperationCounters,
    pub errors: Vec<String>,
    pub conflicts: Vec<String>,
    pub succeeded: Option<bool>,
}

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

/// One alert in the ring buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: String,
    pub severity: AlertSeverity,
    pub message: String,
    pub created: DateTime<Utc>,
    pub resolved: bool,
    pub resolution_note: Option<String>,
}

/// Log severities tracked in separate ring buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

/// One retained log line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub severity: LogSeverity,
    pub operation_id: Option<String>,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Derived engine health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

/// Phase timings averaged for performance reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Parse,
    GraphUpdate,
    Embedding,
}

/// Aggregate monitoring snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringSnapshot {
    pub operations_total: u64,
    pub operations_successful: u64,
    pub operations_failed: u64,
    pub active_operations: usize,
    pub error_rate: f64,
    pub throughput_files_per_minute: f64,
    pub average_phase_ms: HashMap<String, f64>,
    pub health: HealthStatus,
    pub queue_depth: usize,
    pub unresolved_alerts: usize,
}

#[derive(Default)]
struct PhaseStats {
    total_ms: f64,
    samples: u64,
}

#[derive(Default)]
struct State {
    active: HashMap<String, SyncOperation>,
    finished: VecDeque<SyncOperation>,
    operations_total: u64,
    operations_successful: u64,
    operations_failed: u64,
    consecutive_failures: u32,
    files_in_window: VecDeque<(DateTime<Utc>, usize)>,
    phases: HashMap<Phase, PhaseStats>,
    alerts: VecDeque<Alert>,
    logs: HashMap<LogSeverity, VecDeque<LogRecord>>,
    queue_depth: usize,
    health: Option<HealthStatus>,
}

/// Monitoring and alerting service.
pub struct MonitoringService {
    state: Mutex<State>,
    events: Arc<EventBus>,
}

impl MonitoringService {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            events,
        }
    }

    /// Begin tracking an operation; returns its id.
    pub fn record_operation_start(&self) -> String {
        let id = Uuid::new_v4().to_string();
        let op = SyncOperation {
            id: id.clone(),
            started: Utc::now(),
            completed: None,
            counters: OperationCounters::default(),
            errors: Vec::new(),
            conflicts: Vec::new(),
            succeeded: None,
        };
        {
            let mut state = self.state.lock();
            state.operations_total += 1;
            state.active.insert(id.clone(), op);
        }
        self.events.publish(EngineEvent::OperationStarted {
            operation_id: id.clone(),
        });
        id
    }

    /// Merge counters into an active operation.
    pub fn record_progress(&self, operation_id: &str, counters: &OperationCounters) {
        let mut state = self.state.lock();
        let files = counters.files_processed;
        if let Some(op) = state.active.get_mut(operation_id) {
            op.counters.files_processed += counters.files_processed;
            op.counters.entities_created += counters.entities_created;
            op.counters.entities_updated += counters.entities_updated;
            op.counters.entities_deleted += counters.entities_deleted;
            op.counters.relationships_created += counters.relationships_created;
            op.counters.relationships_updated += counters.relationships_updated;
            op.counters.relationships_deleted += counters.relationships_deleted;
        }
        if files > 0 {
            state.files_in_window.push_back((Utc::now(), files));
        }
    }

    pub fn record_operation_error(&self, operation_id: &str, error: impl Into<String>) {
        let mut state = self.state.lock();
        if let Some(op) = state.active.get_mut(operation_id) {
            op.errors.push(error.into());
        }
    }

    pub fn record_operation_conflict(&self, operation_id: &str, conflict: impl Into<String>) {
        let mut state = self.state.lock();
        if let Some(op) = state.active.get_mut(operation_id) {
            op.conflicts.push(conflict.into());
        }
    }

    /// Finish an operation successfully.
    pub fn record_operation_complete(&self, operation_id: &str) {
        self.finish(operation_id, true);
    }

    /// Finish an operation as failed.
    pub fn record_operation_failed(&self, operation_id: &str) {
        self.finish(operation_id, false);
    }

    fn finish(&self, operation_id: &str, success: bool) {
        {
            let mut state = self.state.lock();
            if let Some(mut op) = state.active.remove(operation_id) {
                op.completed = Some(Utc::now());
                op.succeeded = Some(success);
                state.finished.push_back(op);
                while state.finished.len() > 1000 {
                    state.finished.pop_front();
                }
            }
            if success {
                state.operations_successful += 1;
                state.consecutive_failures = 0;
            } else {
                state.operations_failed += 1;
                state.consecutive_failures += 1;
            }
        }
        self.events.publish(EngineEvent::OperationCompleted {
            operation_id: operation_id.to_string(),
            success,
        });
    }

    /// Record a phase duration for performance averaging.
    pub fn record_phase(&self, phase: Phase, duration: Duration) {
        let mut state = self.state.lock();
        let stats = state.phases.entry(phase).or_default();
        stats.total_ms += duration.as_secs_f64() * 1000.0;
        stats.samples += 1;
    }

    /// The coordinator publishes its queue depth for health derivation.
    pub fn set_queue_depth(&self, depth: usize) {
        self.state.lock().queue_depth = depth;
    }

    /// Trigger an alert; the buffer keeps the most recent 100.
    pub fn trigger_alert(&self, severity: AlertSeverity, message: impl Into<String>) -> String {
        let alert = Alert {
            id: Uuid::new_v4().to_string(),
            severity,
            message: message.into(),
            created: Utc::now(),
            resolved: false,
            resolution_note: None,
        };
        let id = alert.id.clone();
        {
            let mut state = self.state.lock();
            state.alerts.push_back(alert);
            while state.alerts.len() > MAX_ALERTS {
                state.alerts.pop_front();
            }
        }
        if matches!(severity, AlertSeverity::Error | AlertSeverity::Critical) {
            warn!(alert = %id, "alert triggered");
        }
        self.events.publish(EngineEvent::AlertTriggered {
            alert_id: id.clone(),
            severity: severity.as_str().to_string(),
        });
        id
    }

    /// Mark an alert resolved; it stays in the buffer for inspection.
    pub fn resolve_alert(&self, alert_id: &str, note: impl Into<String>) -> bool {
        let mut state = self.state.lock();
        for alert in state.alerts.iter_mut() {
            if alert.id == alert_id {
                alert.resolved = true;
                alert.resolution_note = Some(note.into());
                return true;
            }
        }
        false
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.state.lock().alerts.iter().cloned().collect()
    }

    /// Append a log record to its severity ring.
    pub fn log(
        &self,
        severity: LogSeverity,
        operation_id: Option<&str>,
        message: impl Into<String>,
    ) {
        let record = LogRecord {
            severity,
            operation_id: operation_id.map(str::to_string),
            message: message.into(),
            at: Utc::now(),
        };
        let mut state = self.state.lock();
        let ring = state.logs.entry(severity).or_default();
        ring.push_back(record);
        while ring.len() > MAX_LOGS_PER_SEVERITY {
            ring.pop_front();
        }
    }

    pub fn get_logs_by_operation(&self, operation_id: &str) -> Vec<LogRecord> {
        let state = self.state.lock();
        let mut records: Vec<LogRecord> = state
            .logs
            .values()
            .flatten()
            .filter(|r| r.operation_id.as_deref() == Some(operation_id))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.at.cmp(&b.at));
        records
    }

    /// Derive health from failure streaks, queue depth, and error rate.
    pub fn check_health(&self) -> HealthStatus {
        let status = {
            let mut state = self.state.lock();
            let error_rate = if state.operations_total > 0 {
                state.operations_failed as f64 / state.operations_total as f64
            } else {
                0.0
            };
            let status = if state.consecutive_failures >= 5 || error_rate > 0.5 {
                HealthStatus::Unhealthy
            } else if state.consecutive_failures >= 2
                || error_rate > 0.1
                || state.queue_depth > 1000
                || state.active.len() > 64
            {
                HealthStatus::Degraded
            } else {
                HealthStatus::Healthy
            };
            state.health = Some(status);
            status
        };
        self.events.publish(EngineEvent::HealthCheck {
            status: status.as_str().to_string(),
        });
        status
    }

    /// Spawn the periodic health check loop.
    pub fn start_health_monitor(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEALTH_CHECK_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let status = monitor.check_health();
                debug!(status = status.as_str(), "periodic health check");
            }
        })
    }

    /// Snapshot for status surfaces.
    pub fn snapshot(&self) -> MonitoringSnapshot {
        let state = self.state.lock();
        let error_rate = if state.operations_total > 0 {
            state.operations_failed as f64 / state.operations_total as f64
        } else {
            0.0
        };
        let window_start = Utc::now() - ChronoDuration::minutes(1);
        let files_last_minute: usize = state
            .files_in_window
            .iter()
            .filter(|(at, _)| *at >= window_start)
            .map(|(_, n)| n)
            .sum();
        let mut average_phase_ms = HashMap::new();
        for (phase, stats) in &state.phases {
            if stats.samples > 0 {
                let name = match phase {
                    Phase::Parse => "parse",
                    Phase::GraphUpdate => "graphUpdate",
                    Phase::Embedding => "embedding",
                };
                average_phase_ms.insert(name.to_string(), stats.total_ms / stats.samples as f64);
            }
        }
        MonitoringSnapshot {
            operations_total: state.operations_total,
            operations_successful: state.operations_successful,
            operations_failed: state.operations_failed,
            active_operations: state.active.len(),
            error_rate,
            throughput_files_per_minute: files_last_minute as f64,
            average_phase_ms,
            health: state.health.unwrap_or(HealthStatus::Healthy),
            queue_depth: state.queue_depth,
            unresolved_alerts: state.alerts.iter().filter(|a| !a.resolved).count(),
        }
    }

    /// Remove operations, logs, and unresolved alerts older than 24 hours.
    pub fn cleanup(&self) -> usize {
        let cutoff = Utc::now() - ChronoDuration::hours(RETENTION_HOURS);
        let mut removed = 0usize;
        let mut state = self.state.lock();
        let before = state.finished.len();
        state.finished.retain(|op| op.started >= cutoff);
        removed += before - state.finished.len();

        for ring in state.logs.values_mut() {
            let before = ring.len();
            ring.retain(|r| r.at >= cutoff);
            removed += before - ring.len();
        }

        let before = state.alerts.len();
        state
            .alerts
            .retain(|a| a.resolved || a.created >= cutoff);
        removed += before - state.alerts.len();
        info!(removed, "monitoring cleanup finished");
        removed
    }

    pub fn finished_operations(&self) -> Vec<SyncOperation> {
        self.state.lock().finished.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingSubscriber;

    fn service() -> (Arc<MonitoringService>, Arc<RecordingSubscriber>) {
        let events = Arc::new(EventBus::new());
        let recorder = Arc::new(RecordingSubscriber::new());
        events.subscribe(recorder.clone()).unwrap();
        (Arc::new(MonitoringService::new(events)), recorder)
    }

    #[test]
    fn operation_lifecycle_updates_totals() {
        let (monitor, recorder) = service();
        let id = monitor.record_operation_start();
        monitor.record_progress(
            &id,
            &OperationCounters {
                files_processed: 3,
                entities_created: 5,
                ..Default::default()
            },
        );
        monitor.record_operation_complete(&id);

        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.operations_total, 1);
        assert_eq!(snapshot.operations_successful, 1);
        assert_eq!(snapshot.active_operations, 0);
        assert!(recorder
            .events()
            .iter()
            .any(|e| matches!(e, EngineEvent::OperationCompleted { success: true, .. })));
    }

    #[test]
    fn consecutive_failures_degrade_health() {
        let (monitor, _) = service();
        for _ in 0..2 {
            let id = monitor.record_operation_start();
            monitor.record_operation_failed(&id);
        }
        assert_eq!(monitor.check_health(), HealthStatus::Degraded);
        for _ in 0..3 {
            let id = monitor.record_operation_start();
            monitor.record_operation_failed(&id);
        }
        assert_eq!(monitor.check_health(), HealthStatus::Unhealthy);
    }

    #[test]
    fn success_resets_failure_streak() {
        let (monitor, _) = service();
        for _ in 0..3 {
            let id = monitor.record_operation_start();
            monitor.record_operation_failed(&id);
        }
        let id = monitor.record_operation_start();
        monitor.record_operation_complete(&id);
        // Error rate is still high, so degraded rather than unhealthy
        assert_eq!(monitor.check_health(), HealthStatus::Degraded);
    }

    #[test]
    fn alert_ring_is_bounded_and_resolvable() {
        let (monitor, _) = service();
        let mut first_id = None;
        for i in 0..120 {
            let id = monitor.trigger_alert(AlertSeverity::Info, format!("alert {i}"));
            if i == 0 {
                first_id = Some(id);
            }
        }
        let alerts = monitor.alerts();
        assert_eq!(alerts.len(), MAX_ALERTS);
        // The first alert was evicted
        assert!(!alerts.iter().any(|a| Some(&a.id) == first_id.as_ref()));

        let last = alerts.last().unwrap().id.clone();
        assert!(monitor.resolve_alert(&last, "handled"));
        assert!(monitor
            .alerts()
            .iter()
            .any(|a| a.id == last && a.resolved));
    }

    #[test]
    fn logs_are_queryable_by_operation() {
        let (monitor, _) = service();
        let id = monitor.record_operation_start();
        monitor.log(LogSeverity::Info, Some(&id), "parsing file");
        monitor.log(LogSeverity::Error, Some(&id), "commit failed");
        monitor.log(LogSeverity::Info, None, "unrelated");

        let records = monitor.get_logs_by_operation(&id);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].message, "parsing file");
    }

    #[test]
    fn cleanup_removes_stale_unresolved_alerts_only() {
        let (monitor, _) = service();
        let stale = monitor.trigger_alert(AlertSeverity::Warning, "old");
        {
            let mut state = monitor.state.lock();
            if let Some(alert) = state.alerts.iter_mut().find(|a| a.id == stale) {
                alert.created = Utc::now() - ChronoDuration::hours(30);
            }
        }
        let resolved = monitor.trigger_alert(AlertSeverity::Warning, "old but resolved");
        {
            let mut state = monitor.state.lock();
            if let Some(alert) = state.alerts.iter_mut().find(|a| a.id == resolved) {
                alert.created = Utc::now() - ChronoDuration::hours(30);
                alert.resolved = true;
            }
        }
        let removed = monitor.cleanup();
        assert_eq!(removed, 1);
        let alerts = monitor.alerts();
        assert!(alerts.iter().any(|a| a.id == resolved));
        assert!(!alerts.iter().any(|a| a.id == stale));
    }

    #[test]
    fn phase_averages_accumulate() {
        let (monitor, _) = service();
        monitor.record_phase(Phase::Parse, Duration::from_millis(10));
        monitor.record_phase(Phase::Parse, Duration::from_millis(30));
        let snapshot = monitor.snapshot();
        let parse_avg = snapshot.average_phase_ms.get("parse").copied().unwrap();
        assert!((parse_avg - 20.0).abs() < 1.0);
    }
}
