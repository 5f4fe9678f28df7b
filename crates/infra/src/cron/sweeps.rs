//! Per-workspace sweeps: approval timeouts, stuck runs, stale failures.
//!
//! Each sweep discovers candidates from a projection, takes the candidate's
//! row lock (`FOR UPDATE NOWAIT` on the Postgres path) and emits
//! `incident.opened` through the event store under a window-anchored
//! idempotency key. A candidate whose lock a concurrent sweeper holds is
//! counted as `skipped_locked` and left for the next tick; re-running a
//! tick inside the same window collapses to the same set of incidents.

use std::any::Any;
use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use thiserror::Error;

use warden_core::{Actor, CorrelationId, IncidentId, WorkspaceId};
use warden_events::data::IncidentOpened;
use warden_events::{EventData, StreamRef};

use crate::config::CronConfig;
use crate::event_store::EventStore;
use crate::projections::approvals::{ApprovalReadModel, ApprovalStatus};
use crate::projections::incidents::{IncidentReadModel, IncidentStatus};
use crate::projections::runs::{RunReadModel, RunStatus};
use crate::projections::store::ReadModelStore;

use super::runtime::window_anchor;

/// Failure kinds the triage loop already owns; the stale sweep skips them.
const TRIAGED_ERROR_KINDS: &[&str] = &["approval_denied", "policy_blocked", "cancelled"];

/// Postgres SQLSTATE for `NOWAIT` hitting a held row lock.
const LOCK_NOT_AVAILABLE: &str = "55P03";

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("sweep aborted: lock lost")]
    LockLost,
    #[error("event store failure: {0}")]
    Events(String),
    #[error("storage failure: {0}")]
    Storage(String),
}

/// Counts from one sweep over one workspace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub examined: usize,
    pub emitted: usize,
    pub deduplicated: usize,
    /// Candidates whose row lock was unavailable (`FOR UPDATE NOWAIT`).
    pub skipped_locked: usize,
}

impl SweepOutcome {
    pub fn absorb(&mut self, other: SweepOutcome) {
        self.examined += other.examined;
        self.emitted += other.emitted;
        self.deduplicated += other.deduplicated;
        self.skipped_locked += other.skipped_locked;
    }
}

/// Which workspaces exist, for candidate discovery.
pub trait WorkspaceDirectory: Send + Sync {
    fn workspaces(&self) -> Vec<WorkspaceId>;
}

#[derive(Debug, Default)]
pub struct InMemoryWorkspaceDirectory {
    workspaces: RwLock<BTreeSet<WorkspaceId>>,
}

impl InMemoryWorkspaceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, workspace_id: WorkspaceId) {
        if let Ok(mut workspaces) = self.workspaces.write() {
            workspaces.insert(workspace_id);
        }
    }
}

impl WorkspaceDirectory for InMemoryWorkspaceDirectory {
    fn workspaces(&self) -> Vec<WorkspaceId> {
        match self.workspaces.read() {
            Ok(workspaces) => workspaces.iter().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }
}

/// Holding this keeps the candidate's row lock; dropping releases it.
pub struct CandidateGuard {
    _hold: Box<dyn Any + Send>,
}

impl CandidateGuard {
    fn new(hold: impl Any + Send) -> Self {
        Self {
            _hold: Box::new(hold),
        }
    }
}

/// The `FOR UPDATE NOWAIT` seam: take a candidate's row lock without
/// waiting, so two sweepers never double-process one entity.
#[async_trait]
pub trait CandidateLock: Send + Sync {
    /// `None` when a concurrent sweeper holds the row.
    async fn try_lock(
        &self,
        workspace_id: &WorkspaceId,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<CandidateGuard>, SweepError>;
}

/// In-memory simulation of the row lock for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryCandidateLocks {
    held: Arc<Mutex<HashSet<String>>>,
}

impl InMemoryCandidateLocks {
    pub fn new() -> Self {
        Self::default()
    }
}

struct HeldEntity {
    key: String,
    held: Arc<Mutex<HashSet<String>>>,
}

impl Drop for HeldEntity {
    fn drop(&mut self) {
        if let Ok(mut held) = self.held.lock() {
            held.remove(&self.key);
        }
    }
}

#[async_trait]
impl CandidateLock for InMemoryCandidateLocks {
    async fn try_lock(
        &self,
        workspace_id: &WorkspaceId,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<CandidateGuard>, SweepError> {
        let key = format!("{workspace_id}:{entity_type}:{entity_id}");
        let mut held = self
            .held
            .lock()
            .map_err(|_| SweepError::Storage("lock poisoned".to_string()))?;
        if !held.insert(key.clone()) {
            return Ok(None);
        }
        Ok(Some(CandidateGuard::new(HeldEntity {
            key,
            held: self.held.clone(),
        })))
    }
}

/// Postgres row locks over the projection tables.
///
/// The guard holds an open transaction; dropping it rolls back and releases
/// the row.
pub struct PgCandidateLocks {
    pool: PgPool,
}

impl PgCandidateLocks {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CandidateLock for PgCandidateLocks {
    async fn try_lock(
        &self,
        workspace_id: &WorkspaceId,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<CandidateGuard>, SweepError> {
        let (table, pk) = match entity_type {
            "approval" => ("proj_approvals", "approval_id"),
            "run" => ("proj_runs", "run_id"),
            other => {
                return Err(SweepError::Storage(format!(
                    "no lockable table for entity type '{other}'"
                )))
            }
        };

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SweepError::Storage(e.to_string()))?;

        let locked = sqlx::query(&format!(
            "SELECT 1 FROM {table} WHERE workspace_id = $1 AND {pk} = $2 FOR UPDATE NOWAIT"
        ))
        .bind(workspace_id.as_str())
        .bind(entity_id)
        .fetch_optional(&mut *tx)
        .await;

        match locked {
            Ok(_) => Ok(Some(CandidateGuard::new(tx))),
            Err(sqlx::Error::Database(db_err))
                if db_err.code().as_deref() == Some(LOCK_NOT_AVAILABLE) =>
            {
                Ok(None)
            }
            Err(err) => Err(SweepError::Storage(err.to_string())),
        }
    }
}

/// One sweep type, run per candidate workspace.
#[async_trait]
pub trait Sweep: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(
        &self,
        workspace_id: &WorkspaceId,
        now: DateTime<Utc>,
        config: &CronConfig,
    ) -> Result<SweepOutcome, SweepError>;
}

async fn emit_incident(
    events: &Arc<dyn EventStore>,
    workspace_id: &WorkspaceId,
    category: &str,
    entity_type: &str,
    entity_id: &str,
    idempotency_key: String,
    outcome: &mut SweepOutcome,
) -> Result<(), SweepError> {
    let data = EventData::IncidentOpened(IncidentOpened {
        incident_id: IncidentId::new(),
        category: category.to_string(),
        entity_type: Some(entity_type.to_string()),
        entity_id: Some(entity_id.to_string()),
        summary: None,
    });
    let event = data
        .new_event(
            workspace_id.clone(),
            StreamRef::workspace(workspace_id),
            Actor::service("heart-cron"),
            CorrelationId::from_string(idempotency_key.clone()),
        )
        .with_idempotency_key(idempotency_key);

    let appended = events
        .append(event)
        .await
        .map_err(|e| SweepError::Events(e.to_string()))?;
    if appended.deduplicated {
        outcome.deduplicated += 1;
    } else {
        outcome.emitted += 1;
    }
    Ok(())
}

/// Pending/held approvals older than the timeout.
pub struct ApprovalTimeoutSweep<S> {
    approvals: Arc<S>,
    events: Arc<dyn EventStore>,
    locks: Arc<dyn CandidateLock>,
}

impl<S> ApprovalTimeoutSweep<S> {
    pub fn new(
        approvals: Arc<S>,
        events: Arc<dyn EventStore>,
        locks: Arc<dyn CandidateLock>,
    ) -> Self {
        Self {
            approvals,
            events,
            locks,
        }
    }
}

#[async_trait]
impl<S> Sweep for ApprovalTimeoutSweep<S>
where
    S: ReadModelStore<warden_core::ApprovalId, ApprovalReadModel> + 'static,
{
    fn name(&self) -> &'static str {
        "approval_timeout"
    }

    async fn run(
        &self,
        workspace_id: &WorkspaceId,
        now: DateTime<Utc>,
        config: &CronConfig,
    ) -> Result<SweepOutcome, SweepError> {
        let timeout = chrono::Duration::from_std(config.approval_timeout).unwrap_or_default();
        let anchor = window_anchor(now, config.window_sec);
        let mut outcome = SweepOutcome::default();

        let candidates: Vec<ApprovalReadModel> = self
            .approvals
            .list(workspace_id)
            .into_iter()
            .filter(|row| {
                matches!(row.status, ApprovalStatus::Pending | ApprovalStatus::Held)
                    && row.updated_at < now - timeout
            })
            .take(config.batch_limit)
            .collect();

        for approval in candidates {
            let Some(_guard) = self
                .locks
                .try_lock(workspace_id, "approval", approval.approval_id.as_str())
                .await?
            else {
                outcome.skipped_locked += 1;
                continue;
            };

            outcome.examined += 1;
            let key = format!(
                "cron:approval_timeout:{}:approval:{}:{}",
                workspace_id, approval.approval_id, anchor
            );
            emit_incident(
                &self.events,
                workspace_id,
                "cron.approval_timeout",
                "approval",
                approval.approval_id.as_str(),
                key,
                &mut outcome,
            )
            .await?;
        }
        Ok(outcome)
    }
}

/// Queued/running runs that stopped making progress.
pub struct RunStuckSweep<S> {
    runs: Arc<S>,
    events: Arc<dyn EventStore>,
    locks: Arc<dyn CandidateLock>,
}

impl<S> RunStuckSweep<S> {
    pub fn new(runs: Arc<S>, events: Arc<dyn EventStore>, locks: Arc<dyn CandidateLock>) -> Self {
        Self {
            runs,
            events,
            locks,
        }
    }
}

#[async_trait]
impl<S> Sweep for RunStuckSweep<S>
where
    S: ReadModelStore<warden_core::RunId, RunReadModel> + 'static,
{
    fn name(&self) -> &'static str {
        "run_stuck"
    }

    async fn run(
        &self,
        workspace_id: &WorkspaceId,
        now: DateTime<Utc>,
        config: &CronConfig,
    ) -> Result<SweepOutcome, SweepError> {
        let timeout = chrono::Duration::from_std(config.run_stuck_timeout).unwrap_or_default();
        let anchor = window_anchor(now, config.window_sec);
        let mut outcome = SweepOutcome::default();

        let candidates: Vec<RunReadModel> = self
            .runs
            .list(workspace_id)
            .into_iter()
            .filter(|row| {
                matches!(row.status, RunStatus::Queued | RunStatus::Running)
                    && row.updated_at < now - timeout
            })
            .take(config.batch_limit)
            .collect();

        for run in candidates {
            let Some(_guard) = self
                .locks
                .try_lock(workspace_id, "run", run.run_id.as_str())
                .await?
            else {
                outcome.skipped_locked += 1;
                continue;
            };

            outcome.examined += 1;
            let key = format!(
                "cron:run_stuck:{}:run:{}:{}",
                workspace_id, run.run_id, anchor
            );
            emit_incident(
                &self.events,
                workspace_id,
                "cron.run_stuck",
                "run",
                run.run_id.as_str(),
                key,
                &mut outcome,
            )
            .await?;
        }
        Ok(outcome)
    }
}

/// Failed runs that sat untriaged past the stale window.
pub struct DemotedStaleSweep<S, I> {
    runs: Arc<S>,
    incidents: Arc<I>,
    events: Arc<dyn EventStore>,
    locks: Arc<dyn CandidateLock>,
}

impl<S, I> DemotedStaleSweep<S, I> {
    pub fn new(
        runs: Arc<S>,
        incidents: Arc<I>,
        events: Arc<dyn EventStore>,
        locks: Arc<dyn CandidateLock>,
    ) -> Self {
        Self {
            runs,
            incidents,
            events,
            locks,
        }
    }
}

#[async_trait]
impl<S, I> Sweep for DemotedStaleSweep<S, I>
where
    S: ReadModelStore<warden_core::RunId, RunReadModel> + 'static,
    I: ReadModelStore<IncidentId, IncidentReadModel> + 'static,
{
    fn name(&self) -> &'static str {
        "demoted_stale"
    }

    async fn run(
        &self,
        workspace_id: &WorkspaceId,
        now: DateTime<Utc>,
        config: &CronConfig,
    ) -> Result<SweepOutcome, SweepError> {
        let stale = chrono::Duration::from_std(config.demoted_stale).unwrap_or_default();
        let anchor = window_anchor(now, config.window_sec);
        let mut outcome = SweepOutcome::default();

        let open_incident_runs: BTreeSet<String> = self
            .incidents
            .list(workspace_id)
            .into_iter()
            .filter(|incident| {
                incident.status == IncidentStatus::Open
                    && incident.entity_type.as_deref() == Some("run")
            })
            .filter_map(|incident| incident.entity_id)
            .collect();

        let candidates: Vec<RunReadModel> = self
            .runs
            .list(workspace_id)
            .into_iter()
            .filter(|row| {
                row.status == RunStatus::Failed
                    && row.updated_at < now - stale
                    && !open_incident_runs.contains(row.run_id.as_str())
                    && row
                        .error_kind
                        .as_deref()
                        .map_or(true, |kind| !TRIAGED_ERROR_KINDS.contains(&kind))
                    && row
                        .error_code
                        .as_deref()
                        .map_or(true, |code| !TRIAGED_ERROR_KINDS.contains(&code))
            })
            .take(config.batch_limit)
            .collect();

        for run in candidates {
            let Some(_guard) = self
                .locks
                .try_lock(workspace_id, "run", run.run_id.as_str())
                .await?
            else {
                outcome.skipped_locked += 1;
                continue;
            };

            outcome.examined += 1;
            let key = format!(
                "cron:demoted_stale:{}:run:{}:{}",
                workspace_id, run.run_id, anchor
            );
            emit_incident(
                &self.events,
                workspace_id,
                "cron.demoted_stale",
                "run",
                run.run_id.as_str(),
                key,
                &mut outcome,
            )
            .await?;
        }
        Ok(outcome)
    }
}
