//! Run read model: queue state, lease bookkeeping, terminal outcomes.
//!
//! The row doubles as the work item workers claim (§ lease manager): claim
//! fields are written by the lease store at claim time, and the projector
//! preserves them when folding `run.*` events over the row.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use warden_core::{AgentId, CorrelationId, EventId, RoomId, RunId, WorkspaceId};
use warden_events::{EventData, StoredEvent};

use super::engine::{ProjectionError, Projector};
use super::store::ReadModelStore;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReadModel {
    pub run_id: RunId,
    pub workspace_id: WorkspaceId,
    pub status: RunStatus,
    pub agent_id: Option<AgentId>,
    pub room_id: Option<RoomId>,
    pub queued_at: DateTime<Utc>,
    pub claim_token: Option<Uuid>,
    pub claimed_by_actor_id: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    pub error_code: Option<String>,
    pub error_kind: Option<String>,
    pub risk_tier: Option<String>,
    pub correlation_id: CorrelationId,
    pub last_event_id: EventId,
    pub last_event_occurred_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub struct RunsProjection<S> {
    store: Arc<S>,
}

impl<S> RunsProjection<S>
where
    S: ReadModelStore<RunId, RunReadModel>,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn get(&self, workspace_id: &WorkspaceId, run_id: &RunId) -> Option<RunReadModel> {
        self.store.get(workspace_id, run_id)
    }

    pub fn list(&self, workspace_id: &WorkspaceId) -> Vec<RunReadModel> {
        self.store.list(workspace_id)
    }

    fn base_row(&self, event: &StoredEvent, run_id: &RunId) -> RunReadModel {
        self.store
            .get(&event.workspace_id, run_id)
            .unwrap_or_else(|| RunReadModel {
                run_id: run_id.clone(),
                workspace_id: event.workspace_id.clone(),
                status: RunStatus::Queued,
                agent_id: None,
                room_id: None,
                queued_at: event.occurred_at,
                claim_token: None,
                claimed_by_actor_id: None,
                lease_expires_at: None,
                attempt_count: 0,
                error_code: None,
                error_kind: None,
                risk_tier: None,
                correlation_id: event.correlation_id.clone(),
                last_event_id: event.event_id,
                last_event_occurred_at: event.occurred_at,
                updated_at: event.recorded_at,
            })
    }

    fn put(&self, event: &StoredEvent, mut row: RunReadModel) {
        row.last_event_id = event.event_id;
        row.last_event_occurred_at = event.occurred_at;
        row.updated_at = event.recorded_at;
        let run_id = row.run_id.clone();
        self.store
            .upsert_if_newer(&event.workspace_id, run_id, row, event.occurred_at);
    }
}

impl<S> Projector for RunsProjection<S>
where
    S: ReadModelStore<RunId, RunReadModel>,
{
    fn name(&self) -> &'static str {
        "runs"
    }

    fn wants(&self, event_type: &str) -> bool {
        event_type.starts_with("run.")
    }

    fn apply(&self, event: &StoredEvent) -> Result<(), ProjectionError> {
        match event.typed_data() {
            EventData::RunQueued(data) => {
                let mut row = self.base_row(event, &data.run_id);
                row.status = RunStatus::Queued;
                row.agent_id = data.agent_id;
                row.room_id = data.room_id;
                row.queued_at = event.occurred_at;
                self.put(event, row);
            }
            EventData::RunStarted(data) => {
                let mut row = self.base_row(event, &data.run_id);
                row.status = RunStatus::Running;
                row.attempt_count = data.attempt_no;
                // Claim fields were written at claim time; keep whatever the
                // lease store recorded and only fill the actor if missing.
                row.claimed_by_actor_id
                    .get_or_insert_with(|| data.claimed_by.clone());
                self.put(event, row);
            }
            EventData::RunCompleted(data) => {
                let mut row = self.base_row(event, &data.run_id);
                row.status = RunStatus::Completed;
                row.claim_token = None;
                row.lease_expires_at = None;
                self.put(event, row);
            }
            EventData::RunFailed(data) => {
                let mut row = self.base_row(event, &data.run_id);
                row.status = RunStatus::Failed;
                row.claim_token = None;
                row.lease_expires_at = None;
                row.error_code = data.error_code;
                row.error_kind = data.error_kind;
                row.risk_tier = data.risk_tier;
                self.put(event, row);
            }
            // Unknown run.* events are informational.
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projections::store::InMemoryReadModelStore;
    use warden_core::Actor;
    use warden_events::data::{RunFailed, RunQueued, RunStarted};
    use warden_events::{NewEvent, StreamRef};

    fn stored(ws: &WorkspaceId, data: EventData, occurred_at: DateTime<Utc>) -> StoredEvent {
        let event = NewEvent::new(
            ws.clone(),
            StreamRef::workspace(ws),
            data.event_type().to_string(),
            Actor::service("test"),
            CorrelationId::from_string("corr-runs"),
            data.to_value(),
        )
        .with_occurred_at(occurred_at);
        StoredEvent::from_new(event, 1, 1, occurred_at)
    }

    #[test]
    fn run_lifecycle_projects() {
        let store = Arc::new(InMemoryReadModelStore::new());
        let projection = RunsProjection::new(store.clone());
        let ws = WorkspaceId::new();
        let run_id = RunId::new();
        let t0 = Utc::now();

        projection
            .apply(&stored(
                &ws,
                EventData::RunQueued(RunQueued {
                    run_id: run_id.clone(),
                    room_id: None,
                    agent_id: None,
                }),
                t0,
            ))
            .unwrap();
        assert_eq!(projection.get(&ws, &run_id).unwrap().status, RunStatus::Queued);

        projection
            .apply(&stored(
                &ws,
                EventData::RunStarted(RunStarted {
                    run_id: run_id.clone(),
                    attempt_no: 1,
                    claimed_by: "worker-a".to_string(),
                }),
                t0 + chrono::Duration::seconds(1),
            ))
            .unwrap();
        let row = projection.get(&ws, &run_id).unwrap();
        assert_eq!(row.status, RunStatus::Running);
        assert_eq!(row.attempt_count, 1);
        assert_eq!(row.claimed_by_actor_id.as_deref(), Some("worker-a"));

        projection
            .apply(&stored(
                &ws,
                EventData::RunFailed(RunFailed {
                    run_id: run_id.clone(),
                    error_code: Some("timeout".to_string()),
                    error_kind: None,
                    risk_tier: None,
                    message: None,
                }),
                t0 + chrono::Duration::seconds(2),
            ))
            .unwrap();
        let row = projection.get(&ws, &run_id).unwrap();
        assert_eq!(row.status, RunStatus::Failed);
        assert_eq!(row.error_code.as_deref(), Some("timeout"));
        assert!(row.claim_token.is_none());
    }

    #[test]
    fn out_of_order_delivery_converges() {
        let store = Arc::new(InMemoryReadModelStore::new());
        let projection = RunsProjection::new(store.clone());
        let ws = WorkspaceId::new();
        let run_id = RunId::new();
        let t0 = Utc::now();

        // Terminal event arrives first.
        projection
            .apply(&stored(
                &ws,
                EventData::RunCompleted(warden_events::data::RunCompleted {
                    run_id: run_id.clone(),
                    outcome: None,
                }),
                t0 + chrono::Duration::seconds(2),
            ))
            .unwrap();
        // The stale start must not regress the row.
        projection
            .apply(&stored(
                &ws,
                EventData::RunStarted(RunStarted {
                    run_id: run_id.clone(),
                    attempt_no: 1,
                    claimed_by: "worker-a".to_string(),
                }),
                t0 + chrono::Duration::seconds(1),
            ))
            .unwrap();

        assert_eq!(
            projection.get(&ws, &run_id).unwrap().status,
            RunStatus::Completed
        );
    }
}
