//! Projector bookkeeping: at-most-once application, watermarks, parking.
//!
//! Mirrors the projection-offset persistence pattern: the applied-events set
//! provides the idempotency guard, projector state + workspace watermarks
//! record progress, and the dead-letter set parks events a projector could
//! not apply after retries. Events are never silently dropped.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use warden_core::{EventId, WorkspaceId};
use warden_events::StoredEvent;

/// A parked (projector, event) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub projector: String,
    pub event_id: EventId,
    pub last_error: String,
    pub attempts: u32,
    pub parked_at: DateTime<Utc>,
}

/// Idempotency + progress + dead-letter bookkeeping for the engine.
pub trait ProjectorBookkeeping: Send + Sync {
    /// Record `(projector, event)` as applied. Returns false when it was
    /// already recorded (the engine must skip the event).
    fn mark_applied(&self, projector: &str, event_id: &EventId) -> bool;

    fn record_watermark(&self, projector: &str, event: &StoredEvent);

    fn watermark(&self, projector: &str) -> Option<(DateTime<Utc>, EventId)>;

    fn record_workspace_watermark(&self, workspace_id: &WorkspaceId, occurred_at: DateTime<Utc>);

    fn workspace_watermark(&self, workspace_id: &WorkspaceId) -> Option<DateTime<Utc>>;

    fn park(&self, projector: &str, event_id: &EventId, error: &str, attempts: u32);

    fn dead_letters(&self) -> Vec<DeadLetter>;

    /// Operator reset: unpark and clear the applied mark so the event can
    /// be re-applied.
    fn reset(&self, projector: &str, event_id: &EventId) -> bool;
}

#[derive(Default)]
struct BookkeepingInner {
    applied: HashSet<(String, EventId)>,
    watermarks: HashMap<String, (DateTime<Utc>, EventId)>,
    workspace_watermarks: HashMap<WorkspaceId, DateTime<Utc>>,
    dead_letters: HashMap<(String, EventId), DeadLetter>,
}

/// In-memory bookkeeping for tests/dev.
#[derive(Default)]
pub struct InMemoryProjectorBookkeeping {
    inner: RwLock<BookkeepingInner>,
}

impl InMemoryProjectorBookkeeping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl ProjectorBookkeeping for InMemoryProjectorBookkeeping {
    fn mark_applied(&self, projector: &str, event_id: &EventId) -> bool {
        let Ok(mut inner) = self.inner.write() else {
            return false;
        };
        inner.applied.insert((projector.to_string(), *event_id))
    }

    fn record_watermark(&self, projector: &str, event: &StoredEvent) {
        if let Ok(mut inner) = self.inner.write() {
            inner
                .watermarks
                .insert(projector.to_string(), (event.recorded_at, event.event_id));
        }
    }

    fn watermark(&self, projector: &str) -> Option<(DateTime<Utc>, EventId)> {
        self.inner.read().ok()?.watermarks.get(projector).copied()
    }

    fn record_workspace_watermark(
        &self,
        workspace_id: &WorkspaceId,
        occurred_at: DateTime<Utc>,
    ) {
        if let Ok(mut inner) = self.inner.write() {
            let entry = inner
                .workspace_watermarks
                .entry(workspace_id.clone())
                .or_insert(occurred_at);
            if *entry < occurred_at {
                *entry = occurred_at;
            }
        }
    }

    fn workspace_watermark(&self, workspace_id: &WorkspaceId) -> Option<DateTime<Utc>> {
        self.inner
            .read()
            .ok()?
            .workspace_watermarks
            .get(workspace_id)
            .copied()
    }

    fn park(&self, projector: &str, event_id: &EventId, error: &str, attempts: u32) {
        if let Ok(mut inner) = self.inner.write() {
            inner.dead_letters.insert(
                (projector.to_string(), *event_id),
                DeadLetter {
                    projector: projector.to_string(),
                    event_id: *event_id,
                    last_error: error.to_string(),
                    attempts,
                    parked_at: Utc::now(),
                },
            );
        }
    }

    fn dead_letters(&self) -> Vec<DeadLetter> {
        match self.inner.read() {
            Ok(inner) => inner.dead_letters.values().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    fn reset(&self, projector: &str, event_id: &EventId) -> bool {
        let Ok(mut inner) = self.inner.write() else {
            return false;
        };
        let key = (projector.to_string(), *event_id);
        let was_parked = inner.dead_letters.remove(&key).is_some();
        inner.applied.remove(&key);
        was_parked
    }
}

/// Postgres-backed bookkeeping.
///
/// The trait is synchronous (projector application is CPU-shaped); database
/// round-trips run on the ambient tokio runtime, which requires calling
/// from within one.
pub struct PgProjectorBookkeeping {
    pool: Arc<PgPool>,
}

impl PgProjectorBookkeeping {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    fn block_on<F: std::future::Future>(fut: F) -> Option<F::Output> {
        tokio::runtime::Handle::try_current()
            .ok()
            .map(|handle| handle.block_on(fut))
    }
}

impl ProjectorBookkeeping for PgProjectorBookkeeping {
    fn mark_applied(&self, projector: &str, event_id: &EventId) -> bool {
        let pool = self.pool.clone();
        let projector = projector.to_string();
        let event_id = *event_id.as_uuid();
        Self::block_on(async move {
            match sqlx::query(
                r#"
                INSERT INTO proj_applied_events (projector_name, event_id)
                VALUES ($1, $2)
                ON CONFLICT (projector_name, event_id) DO NOTHING
                "#,
            )
            .bind(&projector)
            .bind(event_id)
            .execute(&*pool)
            .await
            {
                Ok(result) => result.rows_affected() == 1,
                Err(_) => false,
            }
        })
        .unwrap_or(false)
    }

    fn record_watermark(&self, projector: &str, event: &StoredEvent) {
        let pool = self.pool.clone();
        let projector = projector.to_string();
        let event_id = *event.event_id.as_uuid();
        let recorded_at = event.recorded_at;
        Self::block_on(async move {
            let _ = sqlx::query(
                r#"
                INSERT INTO proj_projectors (projector_name, last_recorded_at, last_event_id)
                VALUES ($1, $2, $3)
                ON CONFLICT (projector_name)
                DO UPDATE SET last_recorded_at = EXCLUDED.last_recorded_at,
                              last_event_id = EXCLUDED.last_event_id
                "#,
            )
            .bind(&projector)
            .bind(recorded_at)
            .bind(event_id)
            .execute(&*pool)
            .await;
        });
    }

    fn watermark(&self, projector: &str) -> Option<(DateTime<Utc>, EventId)> {
        use sqlx::Row;
        let pool = self.pool.clone();
        let projector = projector.to_string();
        Self::block_on(async move {
            let row = sqlx::query(
                "SELECT last_recorded_at, last_event_id FROM proj_projectors WHERE projector_name = $1",
            )
            .bind(&projector)
            .fetch_optional(&*pool)
            .await
            .ok()??;
            let at: DateTime<Utc> = row.try_get("last_recorded_at").ok()?;
            let id: uuid::Uuid = row.try_get("last_event_id").ok()?;
            Some((at, EventId::from_uuid(id)))
        })?
    }

    fn record_workspace_watermark(
        &self,
        workspace_id: &WorkspaceId,
        occurred_at: DateTime<Utc>,
    ) {
        let pool = self.pool.clone();
        let workspace = workspace_id.to_string();
        Self::block_on(async move {
            let _ = sqlx::query(
                r#"
                INSERT INTO projector_watermarks (workspace_id, last_applied_event_occurred_at)
                VALUES ($1, $2)
                ON CONFLICT (workspace_id)
                DO UPDATE SET last_applied_event_occurred_at = EXCLUDED.last_applied_event_occurred_at
                WHERE projector_watermarks.last_applied_event_occurred_at < EXCLUDED.last_applied_event_occurred_at
                "#,
            )
            .bind(&workspace)
            .bind(occurred_at)
            .execute(&*pool)
            .await;
        });
    }

    fn workspace_watermark(&self, workspace_id: &WorkspaceId) -> Option<DateTime<Utc>> {
        use sqlx::Row;
        let pool = self.pool.clone();
        let workspace = workspace_id.to_string();
        Self::block_on(async move {
            let row = sqlx::query(
                "SELECT last_applied_event_occurred_at FROM projector_watermarks WHERE workspace_id = $1",
            )
            .bind(&workspace)
            .fetch_optional(&*pool)
            .await
            .ok()??;
            row.try_get("last_applied_event_occurred_at").ok()
        })?
    }

    fn park(&self, projector: &str, event_id: &EventId, error: &str, attempts: u32) {
        let pool = self.pool.clone();
        let projector = projector.to_string();
        let event_id = *event_id.as_uuid();
        let error = error.to_string();
        Self::block_on(async move {
            let _ = sqlx::query(
                r#"
                INSERT INTO proj_dead_letters (projector_name, event_id, last_error, attempts)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (projector_name, event_id)
                DO UPDATE SET last_error = EXCLUDED.last_error,
                              attempts = EXCLUDED.attempts,
                              parked_at = NOW()
                "#,
            )
            .bind(&projector)
            .bind(event_id)
            .bind(&error)
            .bind(attempts as i32)
            .execute(&*pool)
            .await;
        });
    }

    fn dead_letters(&self) -> Vec<DeadLetter> {
        use sqlx::Row;
        let pool = self.pool.clone();
        Self::block_on(async move {
            let rows = sqlx::query(
                "SELECT projector_name, event_id, last_error, attempts, parked_at FROM proj_dead_letters",
            )
            .fetch_all(&*pool)
            .await
            .unwrap_or_default();
            rows.into_iter()
                .filter_map(|row| {
                    Some(DeadLetter {
                        projector: row.try_get("projector_name").ok()?,
                        event_id: EventId::from_uuid(row.try_get("event_id").ok()?),
                        last_error: row.try_get("last_error").ok()?,
                        attempts: row.try_get::<i32, _>("attempts").ok()? as u32,
                        parked_at: row.try_get("parked_at").ok()?,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
    }

    fn reset(&self, projector: &str, event_id: &EventId) -> bool {
        let pool = self.pool.clone();
        let projector = projector.to_string();
        let event_id = *event_id.as_uuid();
        Self::block_on(async move {
            let deleted = sqlx::query(
                "DELETE FROM proj_dead_letters WHERE projector_name = $1 AND event_id = $2",
            )
            .bind(&projector)
            .bind(event_id)
            .execute(&*pool)
            .await
            .map(|r| r.rows_affected() > 0)
            .unwrap_or(false);
            let _ = sqlx::query(
                "DELETE FROM proj_applied_events WHERE projector_name = $1 AND event_id = $2",
            )
            .bind(&projector)
            .bind(event_id)
            .execute(&*pool)
            .await;
            deleted
        })
        .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_applied_is_at_most_once() {
        let bk = InMemoryProjectorBookkeeping::new();
        let event_id = EventId::new();
        assert!(bk.mark_applied("runs", &event_id));
        assert!(!bk.mark_applied("runs", &event_id));
        // A different projector may still apply the same event.
        assert!(bk.mark_applied("approvals", &event_id));
    }

    #[test]
    fn reset_unparks_and_clears_applied() {
        let bk = InMemoryProjectorBookkeeping::new();
        let event_id = EventId::new();
        assert!(bk.mark_applied("runs", &event_id));
        bk.park("runs", &event_id, "boom", 3);
        assert_eq!(bk.dead_letters().len(), 1);

        assert!(bk.reset("runs", &event_id));
        assert!(bk.dead_letters().is_empty());
        // Applied mark cleared: the event can be applied again.
        assert!(bk.mark_applied("runs", &event_id));
    }

    #[test]
    fn workspace_watermark_is_monotonic() {
        let bk = InMemoryProjectorBookkeeping::new();
        let ws = WorkspaceId::new();
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(5);

        bk.record_workspace_watermark(&ws, t1);
        bk.record_workspace_watermark(&ws, t0);
        assert_eq!(bk.workspace_watermark(&ws), Some(t1));
    }
}
