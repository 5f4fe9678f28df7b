//! Run claim/heartbeat/release protocol.
//!
//! Workers claim the oldest queued run (or one whose lease expired), fenced
//! by a `claim_token`. Heartbeats extend the lease; a heartbeat or release
//! carrying a stale token fails with `lease_lost` and the worker must
//! abandon the run.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use warden_core::{RunId, WorkspaceId};
use warden_events::data::RunStarted;
use warden_events::{EventData, StreamRef};

use crate::event_store::{EventStore, EventStoreError};
use crate::projections::runs::{RunReadModel, RunStatus};
use crate::projections::store::{InMemoryReadModelStore, ReadModelStore};

use super::cron_lock::LeaseError;

/// One execution attempt of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunAttempt {
    pub run_id: RunId,
    pub attempt_no: u32,
    pub claimed_by: String,
    pub claim_token: Uuid,
    pub started_at: DateTime<Utc>,
}

/// What a successful claim hands the worker.
#[derive(Debug, Clone)]
pub struct ClaimedRun {
    pub run: RunReadModel,
    pub attempt_no: u32,
    pub claim_token: Uuid,
    pub lease_expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait RunLeaseStore: Send + Sync {
    /// Claim the oldest claimable run: queued, or running with an expired
    /// lease (takeover).
    async fn claim_next(
        &self,
        workspace_id: &WorkspaceId,
        worker_id: &str,
        lease_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<ClaimedRun>, LeaseError>;

    /// Extend the lease; `LeaseLost` when the token no longer matches.
    async fn heartbeat(
        &self,
        workspace_id: &WorkspaceId,
        run_id: &RunId,
        claim_token: Uuid,
        lease_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, LeaseError>;

    /// Release the lease. With `terminal` the claim fields are cleared (a
    /// terminal event was persisted); without, the lease is expired in
    /// place so the run becomes claimable again.
    async fn release(
        &self,
        workspace_id: &WorkspaceId,
        run_id: &RunId,
        claim_token: Uuid,
        terminal: bool,
        now: DateTime<Utc>,
    ) -> Result<(), LeaseError>;

    async fn attempts(
        &self,
        workspace_id: &WorkspaceId,
        run_id: &RunId,
    ) -> Result<Vec<RunAttempt>, LeaseError>;
}

/// In-memory lease store sharing the runs read model.
pub struct InMemoryRunLeaseStore {
    runs: Arc<InMemoryReadModelStore<RunId, RunReadModel>>,
    attempts: Mutex<Vec<(WorkspaceId, RunAttempt)>>,
}

impl InMemoryRunLeaseStore {
    pub fn new(runs: Arc<InMemoryReadModelStore<RunId, RunReadModel>>) -> Self {
        Self {
            runs,
            attempts: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl RunLeaseStore for InMemoryRunLeaseStore {
    async fn claim_next(
        &self,
        workspace_id: &WorkspaceId,
        worker_id: &str,
        lease_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<ClaimedRun>, LeaseError> {
        let mut candidates: Vec<RunReadModel> = self
            .runs
            .list(workspace_id)
            .into_iter()
            .filter(|run| match run.status {
                RunStatus::Queued => true,
                RunStatus::Running => {
                    run.lease_expires_at.map_or(false, |expiry| expiry <= now)
                }
                _ => false,
            })
            .collect();
        candidates.sort_by_key(|run| run.queued_at);

        let Some(mut run) = candidates.into_iter().next() else {
            return Ok(None);
        };

        let mut attempts = self
            .attempts
            .lock()
            .map_err(|_| LeaseError::Storage("lock poisoned".to_string()))?;
        let attempt_no = attempts
            .iter()
            .filter(|(ws, a)| ws == workspace_id && a.run_id == run.run_id)
            .count() as u32
            + 1;

        let claim_token = Uuid::new_v4();
        let lease_expires_at = now + chrono::Duration::from_std(lease_ttl).unwrap_or_default();
        run.status = RunStatus::Running;
        run.claim_token = Some(claim_token);
        run.claimed_by_actor_id = Some(worker_id.to_string());
        run.lease_expires_at = Some(lease_expires_at);
        run.attempt_count = attempt_no;
        run.updated_at = now;

        attempts.push((
            workspace_id.clone(),
            RunAttempt {
                run_id: run.run_id.clone(),
                attempt_no,
                claimed_by: worker_id.to_string(),
                claim_token,
                started_at: now,
            },
        ));

        let run_id = run.run_id.clone();
        // Watermark-neutral write: lease bookkeeping must not outrun the
        // event fold, or the projector would drop the next run.* event.
        let watermark = run.last_event_occurred_at;
        self.runs.upsert(workspace_id, run_id, run.clone(), watermark);

        Ok(Some(ClaimedRun {
            run,
            attempt_no,
            claim_token,
            lease_expires_at,
        }))
    }

    async fn heartbeat(
        &self,
        workspace_id: &WorkspaceId,
        run_id: &RunId,
        claim_token: Uuid,
        lease_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, LeaseError> {
        let Some(mut run) = self.runs.get(workspace_id, run_id) else {
            return Err(LeaseError::LeaseLost);
        };
        if run.claim_token != Some(claim_token) {
            return Err(LeaseError::LeaseLost);
        }
        let expiry = now + chrono::Duration::from_std(lease_ttl).unwrap_or_default();
        run.lease_expires_at = Some(expiry);
        run.updated_at = now;
        let watermark = run.last_event_occurred_at;
        self.runs.upsert(workspace_id, run_id.clone(), run, watermark);
        Ok(expiry)
    }

    async fn release(
        &self,
        workspace_id: &WorkspaceId,
        run_id: &RunId,
        claim_token: Uuid,
        terminal: bool,
        now: DateTime<Utc>,
    ) -> Result<(), LeaseError> {
        let Some(mut run) = self.runs.get(workspace_id, run_id) else {
            return Err(LeaseError::LeaseLost);
        };
        if run.claim_token != Some(claim_token) {
            return Err(LeaseError::LeaseLost);
        }
        if terminal {
            run.claim_token = None;
            run.lease_expires_at = None;
        } else {
            // The run stays claimed on paper; expiring the lease makes it
            // immediately claimable and visible to the stuck sweep.
            run.lease_expires_at = Some(now);
        }
        run.updated_at = now;
        let watermark = run.last_event_occurred_at;
        self.runs.upsert(workspace_id, run_id.clone(), run, watermark);
        Ok(())
    }

    async fn attempts(
        &self,
        workspace_id: &WorkspaceId,
        run_id: &RunId,
    ) -> Result<Vec<RunAttempt>, LeaseError> {
        let attempts = self
            .attempts
            .lock()
            .map_err(|_| LeaseError::Storage("lock poisoned".to_string()))?;
        Ok(attempts
            .iter()
            .filter(|(ws, a)| ws == workspace_id && &a.run_id == run_id)
            .map(|(_, a)| a.clone())
            .collect())
    }
}

/// Postgres lease store over `proj_runs` + `run_attempts`.
///
/// The claim takes `FOR UPDATE SKIP LOCKED` so concurrent workers never
/// block each other, plus a hashed advisory lock so two processes on one
/// host cannot race the same candidate between select and update.
pub struct PgRunLeaseStore {
    pool: PgPool,
}

impl PgRunLeaseStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunLeaseStore for PgRunLeaseStore {
    #[instrument(skip(self), fields(workspace_id = %workspace_id, worker_id), err)]
    async fn claim_next(
        &self,
        workspace_id: &WorkspaceId,
        worker_id: &str,
        lease_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<ClaimedRun>, LeaseError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| LeaseError::Storage(e.to_string()))?;

        let row = sqlx::query(
            r#"
            SELECT run_id FROM proj_runs
            WHERE workspace_id = $1
              AND (status = 'queued'
                   OR (status = 'running' AND lease_expires_at <= $2))
            ORDER BY queued_at ASC
            FOR UPDATE SKIP LOCKED
            LIMIT 1
            "#,
        )
        .bind(workspace_id.as_str())
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| LeaseError::Storage(e.to_string()))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let run_id: String = row
            .try_get("run_id")
            .map_err(|e| LeaseError::Storage(e.to_string()))?;

        // Guard against same-host racers outside this transaction.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&run_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| LeaseError::Storage(e.to_string()))?;

        let claim_token = Uuid::new_v4();
        let lease_expires_at = now + chrono::Duration::from_std(lease_ttl).unwrap_or_default();

        let attempt_row = sqlx::query(
            r#"
            INSERT INTO run_attempts (workspace_id, run_id, attempt_no, claimed_by, claim_token, started_at)
            SELECT $1, $2, COALESCE(MAX(attempt_no), 0) + 1, $3, $4, $5
            FROM run_attempts WHERE workspace_id = $1 AND run_id = $2
            RETURNING attempt_no
            "#,
        )
        .bind(workspace_id.as_str())
        .bind(&run_id)
        .bind(worker_id)
        .bind(claim_token)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| LeaseError::Storage(e.to_string()))?;
        let attempt_no: i32 = attempt_row
            .try_get("attempt_no")
            .map_err(|e| LeaseError::Storage(e.to_string()))?;

        sqlx::query(
            r#"
            UPDATE proj_runs SET
                status = 'running',
                claim_token = $3,
                claimed_by_actor_id = $4,
                lease_expires_at = $5,
                attempt_count = $6,
                updated_at = $7
            WHERE workspace_id = $1 AND run_id = $2
            "#,
        )
        .bind(workspace_id.as_str())
        .bind(&run_id)
        .bind(claim_token)
        .bind(worker_id)
        .bind(lease_expires_at)
        .bind(attempt_no)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| LeaseError::Storage(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| LeaseError::Storage(e.to_string()))?;

        let run = RunReadModel {
            run_id: run_id
                .parse()
                .map_err(|_| LeaseError::Storage(format!("bad run_id '{run_id}'")))?,
            workspace_id: workspace_id.clone(),
            status: RunStatus::Running,
            agent_id: None,
            room_id: None,
            queued_at: now,
            claim_token: Some(claim_token),
            claimed_by_actor_id: Some(worker_id.to_string()),
            lease_expires_at: Some(lease_expires_at),
            attempt_count: attempt_no as u32,
            error_code: None,
            error_kind: None,
            risk_tier: None,
            correlation_id: warden_core::CorrelationId::new(),
            last_event_id: warden_core::EventId::new(),
            last_event_occurred_at: now,
            updated_at: now,
        };

        Ok(Some(ClaimedRun {
            run,
            attempt_no: attempt_no as u32,
            claim_token,
            lease_expires_at,
        }))
    }

    async fn heartbeat(
        &self,
        workspace_id: &WorkspaceId,
        run_id: &RunId,
        claim_token: Uuid,
        lease_ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, LeaseError> {
        let expiry = now + chrono::Duration::from_std(lease_ttl).unwrap_or_default();
        let result = sqlx::query(
            r#"
            UPDATE proj_runs SET lease_expires_at = $4, updated_at = $5
            WHERE workspace_id = $1 AND run_id = $2 AND claim_token = $3
            "#,
        )
        .bind(workspace_id.as_str())
        .bind(run_id.as_str())
        .bind(claim_token)
        .bind(expiry)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| LeaseError::Storage(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(LeaseError::LeaseLost);
        }
        Ok(expiry)
    }

    async fn release(
        &self,
        workspace_id: &WorkspaceId,
        run_id: &RunId,
        claim_token: Uuid,
        terminal: bool,
        now: DateTime<Utc>,
    ) -> Result<(), LeaseError> {
        let query = if terminal {
            r#"
            UPDATE proj_runs SET claim_token = NULL, lease_expires_at = NULL, updated_at = $4
            WHERE workspace_id = $1 AND run_id = $2 AND claim_token = $3
            "#
        } else {
            r#"
            UPDATE proj_runs SET lease_expires_at = $4, updated_at = $4
            WHERE workspace_id = $1 AND run_id = $2 AND claim_token = $3
            "#
        };
        let result = sqlx::query(query)
            .bind(workspace_id.as_str())
            .bind(run_id.as_str())
            .bind(claim_token)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| LeaseError::Storage(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(LeaseError::LeaseLost);
        }
        Ok(())
    }

    async fn attempts(
        &self,
        workspace_id: &WorkspaceId,
        run_id: &RunId,
    ) -> Result<Vec<RunAttempt>, LeaseError> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, attempt_no, claimed_by, claim_token, started_at
            FROM run_attempts
            WHERE workspace_id = $1 AND run_id = $2
            ORDER BY attempt_no ASC
            "#,
        )
        .bind(workspace_id.as_str())
        .bind(run_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| LeaseError::Storage(e.to_string()))?;

        rows.into_iter()
            .map(|row| {
                let run_id: String = row
                    .try_get("run_id")
                    .map_err(|e| LeaseError::Storage(e.to_string()))?;
                Ok(RunAttempt {
                    run_id: run_id
                        .parse()
                        .map_err(|_| LeaseError::Storage(format!("bad run_id '{run_id}'")))?,
                    attempt_no: row
                        .try_get::<i32, _>("attempt_no")
                        .map_err(|e| LeaseError::Storage(e.to_string()))?
                        as u32,
                    claimed_by: row
                        .try_get("claimed_by")
                        .map_err(|e| LeaseError::Storage(e.to_string()))?,
                    claim_token: row
                        .try_get("claim_token")
                        .map_err(|e| LeaseError::Storage(e.to_string()))?,
                    started_at: row
                        .try_get("started_at")
                        .map_err(|e| LeaseError::Storage(e.to_string()))?,
                })
            })
            .collect()
    }
}

/// Worker-facing protocol: claim + event emission, fenced heartbeat,
/// release.
pub struct RunLeaseManager {
    store: Arc<dyn RunLeaseStore>,
    events: Arc<dyn EventStore>,
    lease_ttl: Duration,
}

impl RunLeaseManager {
    pub fn new(
        store: Arc<dyn RunLeaseStore>,
        events: Arc<dyn EventStore>,
        lease_ttl: Duration,
    ) -> Self {
        Self {
            store,
            events,
            lease_ttl,
        }
    }

    /// Claim the next run and record `run.started`.
    pub async fn claim(
        &self,
        workspace_id: &WorkspaceId,
        worker_id: &str,
    ) -> Result<Option<ClaimedRun>, LeaseError> {
        let now = Utc::now();
        let Some(claimed) = self
            .store
            .claim_next(workspace_id, worker_id, self.lease_ttl, now)
            .await?
        else {
            return Ok(None);
        };

        let data = EventData::RunStarted(RunStarted {
            run_id: claimed.run.run_id.clone(),
            attempt_no: claimed.attempt_no,
            claimed_by: worker_id.to_string(),
        });
        let event = data
            .new_event(
                workspace_id.clone(),
                StreamRef::workspace(workspace_id),
                warden_core::Actor::service(worker_id),
                claimed.run.correlation_id.clone(),
            )
            .with_idempotency_key(format!(
                "claim:{}:{}",
                claimed.run.run_id, claimed.attempt_no
            ));
        self.events
            .append(event)
            .await
            .map_err(|e: EventStoreError| LeaseError::Storage(e.to_string()))?;

        Ok(Some(claimed))
    }

    pub async fn heartbeat(
        &self,
        workspace_id: &WorkspaceId,
        run_id: &RunId,
        claim_token: Uuid,
    ) -> Result<DateTime<Utc>, LeaseError> {
        self.store
            .heartbeat(workspace_id, run_id, claim_token, self.lease_ttl, Utc::now())
            .await
    }

    pub async fn release(
        &self,
        workspace_id: &WorkspaceId,
        run_id: &RunId,
        claim_token: Uuid,
        terminal: bool,
    ) -> Result<(), LeaseError> {
        self.store
            .release(workspace_id, run_id, claim_token, terminal, Utc::now())
            .await
    }

    pub async fn attempts(
        &self,
        workspace_id: &WorkspaceId,
        run_id: &RunId,
    ) -> Result<Vec<RunAttempt>, LeaseError> {
        self.store.attempts(workspace_id, run_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued_run(ws: &WorkspaceId, queued_at: DateTime<Utc>) -> RunReadModel {
        RunReadModel {
            run_id: RunId::new(),
            workspace_id: ws.clone(),
            status: RunStatus::Queued,
            agent_id: None,
            room_id: None,
            queued_at,
            claim_token: None,
            claimed_by_actor_id: None,
            lease_expires_at: None,
            attempt_count: 0,
            error_code: None,
            error_kind: None,
            risk_tier: None,
            correlation_id: warden_core::CorrelationId::new(),
            last_event_id: warden_core::EventId::new(),
            last_event_occurred_at: queued_at,
            updated_at: queued_at,
        }
    }

    fn store_with_runs(
        ws: &WorkspaceId,
        runs: &[RunReadModel],
    ) -> (Arc<InMemoryReadModelStore<RunId, RunReadModel>>, InMemoryRunLeaseStore) {
        let run_store = Arc::new(InMemoryReadModelStore::new());
        for run in runs {
            run_store.upsert_if_newer(ws, run.run_id.clone(), run.clone(), run.queued_at);
        }
        let lease_store = InMemoryRunLeaseStore::new(run_store.clone());
        (run_store, lease_store)
    }

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn claims_oldest_queued_first() {
        let ws = WorkspaceId::new();
        let t0 = Utc::now();
        let older = queued_run(&ws, t0 - chrono::Duration::seconds(10));
        let newer = queued_run(&ws, t0);
        let (_, store) = store_with_runs(&ws, &[newer.clone(), older.clone()]);

        let claimed = store
            .claim_next(&ws, "worker-a", TTL, t0)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.run.run_id, older.run_id);
        assert_eq!(claimed.attempt_no, 1);
    }

    #[tokio::test]
    async fn lease_takeover_after_expiry() {
        let ws = WorkspaceId::new();
        let t0 = Utc::now();
        let run = queued_run(&ws, t0);
        let (_, store) = store_with_runs(&ws, &[run.clone()]);

        let a = store
            .claim_next(&ws, "worker-a", TTL, t0)
            .await
            .unwrap()
            .unwrap();
        // A heartbeats twice, then stops.
        store
            .heartbeat(&ws, &run.run_id, a.claim_token, TTL, t0 + chrono::Duration::seconds(10))
            .await
            .unwrap();
        store
            .heartbeat(&ws, &run.run_id, a.claim_token, TTL, t0 + chrono::Duration::seconds(20))
            .await
            .unwrap();

        // Before expiry nobody else can claim.
        assert!(store
            .claim_next(&ws, "worker-b", TTL, t0 + chrono::Duration::seconds(30))
            .await
            .unwrap()
            .is_none());

        // After the TTL, B takes over; attempt_no increments.
        let b = store
            .claim_next(&ws, "worker-b", TTL, t0 + chrono::Duration::seconds(90))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(b.run.run_id, run.run_id);
        assert_eq!(b.attempt_no, 2);

        // A's next heartbeat is fenced out.
        let err = store
            .heartbeat(&ws, &run.run_id, a.claim_token, TTL, t0 + chrono::Duration::seconds(95))
            .await
            .unwrap_err();
        assert_eq!(err, LeaseError::LeaseLost);

        let attempts = store.attempts(&ws, &run.run_id).await.unwrap();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[1].claimed_by, "worker-b");
    }

    #[tokio::test]
    async fn voluntary_release_makes_run_claimable() {
        let ws = WorkspaceId::new();
        let t0 = Utc::now();
        let run = queued_run(&ws, t0);
        let (_, store) = store_with_runs(&ws, &[run.clone()]);

        let a = store
            .claim_next(&ws, "worker-a", TTL, t0)
            .await
            .unwrap()
            .unwrap();
        store
            .release(&ws, &run.run_id, a.claim_token, false, t0 + chrono::Duration::seconds(5))
            .await
            .unwrap();

        let b = store
            .claim_next(&ws, "worker-b", TTL, t0 + chrono::Duration::seconds(6))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(b.attempt_no, 2);
    }

    #[tokio::test]
    async fn stale_token_cannot_release() {
        let ws = WorkspaceId::new();
        let t0 = Utc::now();
        let run = queued_run(&ws, t0);
        let (_, store) = store_with_runs(&ws, &[run.clone()]);

        store.claim_next(&ws, "worker-a", TTL, t0).await.unwrap().unwrap();
        let err = store
            .release(&ws, &run.run_id, Uuid::new_v4(), true, t0)
            .await
            .unwrap_err();
        assert_eq!(err, LeaseError::LeaseLost);
    }
}
