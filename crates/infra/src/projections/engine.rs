//! The projector engine: dispatch, idempotency, retries, dead-lettering.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, warn};

use warden_events::StoredEvent;

use crate::event_store::{EventStore, EventStoreError};

use super::applied::ProjectorBookkeeping;

#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error("failed to deserialize payload: {0}")]
    Deserialize(String),
    #[error("read model store failure: {0}")]
    Store(String),
    #[error("handler failure: {0}")]
    Handler(String),
}

/// One read model's event handler.
pub trait Projector: Send + Sync {
    fn name(&self) -> &'static str;

    /// Cheap type-prefix filter evaluated before the idempotency guard.
    fn wants(&self, event_type: &str) -> bool;

    fn apply(&self, event: &StoredEvent) -> Result<(), ProjectionError>;
}

/// Retry schedule for failing handlers: exponential backoff with a small
/// deterministic jitter.
#[derive(Debug, Clone)]
pub struct ProjectorRetry {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ProjectorRetry {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl ProjectorRetry {
    /// Delay before the given retry attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let exp = 2_f64.powi((attempt - 1) as i32);
        let delay_ms = (base_ms * exp).min(max_ms);
        // Deterministic jitter keyed on the attempt number.
        let jitter = delay_ms * 0.1 * (((attempt as f64 * 17.0) % 100.0) / 100.0 - 0.5) * 2.0;
        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }
}

/// Drives registered projectors from events, exactly once per
/// (projector, event), with per-stream order preserved by feed order.
pub struct ProjectorEngine {
    projectors: Vec<Arc<dyn Projector>>,
    bookkeeping: Arc<dyn ProjectorBookkeeping>,
    retry: ProjectorRetry,
}

impl ProjectorEngine {
    pub fn new(bookkeeping: Arc<dyn ProjectorBookkeeping>) -> Self {
        Self {
            projectors: Vec::new(),
            bookkeeping,
            retry: ProjectorRetry::default(),
        }
    }

    pub fn with_retry(mut self, retry: ProjectorRetry) -> Self {
        self.retry = retry;
        self
    }

    pub fn register(mut self, projector: Arc<dyn Projector>) -> Self {
        self.projectors.push(projector);
        self
    }

    pub fn bookkeeping(&self) -> &Arc<dyn ProjectorBookkeeping> {
        &self.bookkeeping
    }

    /// Apply one event to every projector that wants it.
    ///
    /// A projector that keeps failing parks the event in the dead-letter
    /// projection; the engine never silently drops an event.
    pub async fn apply(&self, event: &StoredEvent) {
        for projector in &self.projectors {
            if !projector.wants(&event.event_type) {
                continue;
            }
            if !self.bookkeeping.mark_applied(projector.name(), &event.event_id) {
                debug!(
                    projector = projector.name(),
                    event_id = %event.event_id,
                    "already applied, skipping"
                );
                continue;
            }

            let mut attempt = 0u32;
            loop {
                match projector.apply(event) {
                    Ok(()) => {
                        self.bookkeeping.record_watermark(projector.name(), event);
                        self.bookkeeping
                            .record_workspace_watermark(&event.workspace_id, event.occurred_at);
                        break;
                    }
                    Err(err) => {
                        attempt += 1;
                        if attempt >= self.retry.max_attempts {
                            error!(
                                projector = projector.name(),
                                event_id = %event.event_id,
                                error = %err,
                                attempts = attempt,
                                "parking event in dead letters"
                            );
                            self.bookkeeping.park(
                                projector.name(),
                                &event.event_id,
                                &err.to_string(),
                                attempt,
                            );
                            break;
                        }
                        warn!(
                            projector = projector.name(),
                            event_id = %event.event_id,
                            error = %err,
                            attempt,
                            "projector apply failed, retrying"
                        );
                        tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
                    }
                }
            }
        }
    }

    /// Drain the change feed from a cursor; returns the new cursor.
    pub async fn drain_feed(
        &self,
        store: &dyn EventStore,
        mut after_global_seq: u64,
        batch: usize,
    ) -> Result<u64, EventStoreError> {
        loop {
            let events = store.read_feed(after_global_seq, batch).await?;
            if events.is_empty() {
                return Ok(after_global_seq);
            }
            for event in &events {
                self.apply(event).await;
                after_global_seq = event.global_seq;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::InMemoryEventStore;
    use crate::projections::applied::InMemoryProjectorBookkeeping;
    use std::sync::atomic::{AtomicU32, Ordering};
    use warden_core::{Actor, CorrelationId, WorkspaceId};
    use warden_events::{NewEvent, StreamRef};

    struct CountingProjector {
        applications: AtomicU32,
        fail_first: AtomicU32,
    }

    impl CountingProjector {
        fn new(failures: u32) -> Self {
            Self {
                applications: AtomicU32::new(0),
                fail_first: AtomicU32::new(failures),
            }
        }
    }

    impl Projector for CountingProjector {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn wants(&self, event_type: &str) -> bool {
            event_type.starts_with("run.")
        }

        fn apply(&self, _event: &StoredEvent) -> Result<(), ProjectionError> {
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(ProjectionError::Handler("transient".to_string()));
            }
            self.applications.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn appended_event(store: &InMemoryEventStore, ws: &WorkspaceId) -> StoredEvent {
        EventStore::append(
            store,
            NewEvent::new(
                ws.clone(),
                StreamRef::workspace(ws),
                "run.queued",
                Actor::service("test"),
                CorrelationId::new(),
                serde_json::json!({"run_id": "run_x"}),
            ),
        )
        .await
        .unwrap()
        .event
    }

    #[tokio::test]
    async fn applies_exactly_once() {
        let store = InMemoryEventStore::new();
        let ws = WorkspaceId::new();
        let projector = Arc::new(CountingProjector::new(0));
        let engine = ProjectorEngine::new(InMemoryProjectorBookkeeping::arc())
            .register(projector.clone());

        let event = appended_event(&store, &ws).await;
        engine.apply(&event).await;
        engine.apply(&event).await;

        assert_eq!(projector.applications.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_failure_retries_then_succeeds() {
        let store = InMemoryEventStore::new();
        let ws = WorkspaceId::new();
        let projector = Arc::new(CountingProjector::new(1));
        let bookkeeping = InMemoryProjectorBookkeeping::arc();
        let engine = ProjectorEngine::new(bookkeeping.clone())
            .with_retry(ProjectorRetry {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            })
            .register(projector.clone());

        let event = appended_event(&store, &ws).await;
        engine.apply(&event).await;

        assert_eq!(projector.applications.load(Ordering::SeqCst), 1);
        assert!(bookkeeping.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn persistent_failure_parks_event() {
        let store = InMemoryEventStore::new();
        let ws = WorkspaceId::new();
        let projector = Arc::new(CountingProjector::new(10));
        let bookkeeping = InMemoryProjectorBookkeeping::arc();
        let engine = ProjectorEngine::new(bookkeeping.clone())
            .with_retry(ProjectorRetry {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            })
            .register(projector.clone());

        let event = appended_event(&store, &ws).await;
        engine.apply(&event).await;

        let parked = bookkeeping.dead_letters();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].event_id, event.event_id);
        assert_eq!(projector.applications.load(Ordering::SeqCst), 0);

        // Operator reset makes the event applicable again.
        assert!(bookkeeping.reset("counting", &event.event_id));
        projector.fail_first.store(0, Ordering::SeqCst);
        engine.apply(&event).await;
        assert_eq!(projector.applications.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn drain_feed_advances_cursor() {
        let store = InMemoryEventStore::new();
        let ws = WorkspaceId::new();
        let projector = Arc::new(CountingProjector::new(0));
        let engine = ProjectorEngine::new(InMemoryProjectorBookkeeping::arc())
            .register(projector.clone());

        for _ in 0..3 {
            appended_event(&store, &ws).await;
        }

        let cursor = engine.drain_feed(&store, 0, 2).await.unwrap();
        assert_eq!(cursor, 3);
        assert_eq!(projector.applications.load(Ordering::SeqCst), 3);

        // Nothing new: cursor stays put.
        let cursor = engine.drain_feed(&store, cursor, 2).await.unwrap();
        assert_eq!(cursor, 3);
    }
}
