//! Typed publish-subscribe contract between components
//!
//! Components communicate lifecycle signals through a small event bus with
//! bounded fan-out instead of ad-hoc listener graphs. Tests inject a
//! recording subscriber to assert on emitted events.

use parking_lot::RwLock;
use std::sync::Arc;

/// Maximum number of subscribers; registration beyond this is rejected.
const MAX_SUBSCRIBERS: usize = 64;

/// Events crossing component boundaries.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    // Executor
    ExecutorError { operation: String, message: String },
    TransactionError { statements: usize, message: String },
    ExecutorClosed,
    // Search
    SearchCompleted { strategy: String, results: usize, latency_ms: u64 },
    SearchCacheHit { key: String },
    CacheCleared,
    // Coordinator / monitoring
    OperationStarted { operation_id: String },
    OperationCompleted { operation_id: String, success: bool },
    ConflictDetected { entity_id: String, resolved: bool },
    AlertTriggered { alert_id: String, severity: String },
    HealthCheck { status: String },
    // Embedding
    EmbeddingProgress { processed: usize, total: usize },
}

/// Receives events synchronously on the publisher's thread. Implementations
/// must be cheap; anything slow should hand off internally.
pub trait Subscriber: Send + Sync {
    fn on_event(&self, event: &EngineEvent);
}

/// Bounded fan-out event bus.
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<Arc<dyn Subscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber>) -> anyhow::Result<()> {
        let mut subs = self.subscribers.write();
        anyhow::ensure!(
            subs.len() < MAX_SUBSCRIBERS,
            "subscriber limit of {} reached",
            MAX_SUBSCRIBERS
        );
        subs.push(subscriber);
        Ok(())
    }

    pub fn publish(&self, event: EngineEvent) {
        let subs = self.subscribers.read();
        for sub in subs.iter() {
            sub.on_event(&event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

/// Test helper: records every event it sees.
#[derive(Default)]
pub struct RecordingSubscriber {
    events: parking_lot::Mutex<Vec<EngineEvent>>,
}

impl RecordingSubscriber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().len()
    }
}

impl Subscriber for RecordingSubscriber {
    fn on_event(&self, event: &EngineEvent) {
        self.events.lock().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_fan_out_to_all_subscribers() {
        let bus = EventBus::new();
        let a = Arc::new(RecordingSubscriber::new());
        let b = Arc::new(RecordingSubscriber::new());
        bus.subscribe(a.clone()).unwrap();
        bus.subscribe(b.clone()).unwrap();

        bus.publish(EngineEvent::CacheCleared);
        assert_eq!(a.count(), 1);
        assert_eq!(b.count(), 1);
    }

    #[test]
    fn subscriber_limit_is_enforced() {
        let bus = EventBus::new();
        for _ in 0..MAX_SUBSCRIBERS {
            bus.subscribe(Arc::new(RecordingSubscriber::new())).unwrap();
        }
        assert!(bus.subscribe(Arc::new(RecordingSubscriber::new())).is_err());
    }
}
