//! Approval read model and the gate-facing lookup view.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use warden_core::{ApprovalId, CorrelationId, EventId, WorkspaceId};
use warden_events::data::{ApprovalScope, ApprovalVerdict};
use warden_events::{EventData, StoredEvent};
use warden_policy::{ApprovalLookup, PolicyStoreError};

use super::engine::{ProjectionError, Projector};
use super::store::ReadModelStore;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Held,
    Approved,
    Denied,
}

impl ApprovalStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ApprovalStatus::Approved | ApprovalStatus::Denied)
    }

    pub fn is_open(&self) -> bool {
        !self.is_terminal()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalReadModel {
    pub approval_id: ApprovalId,
    pub workspace_id: WorkspaceId,
    pub status: ApprovalStatus,
    pub action: String,
    pub scope: ApprovalScope,
    pub expires_at: Option<DateTime<Utc>>,
    pub requested_by: Option<String>,
    pub decided_by: Option<String>,
    pub decision: Option<ApprovalVerdict>,
    pub revoked: bool,
    pub correlation_id: CorrelationId,
    pub last_event_id: EventId,
    pub last_event_occurred_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub struct ApprovalsProjection<S> {
    store: Arc<S>,
}

impl<S> ApprovalsProjection<S>
where
    S: ReadModelStore<ApprovalId, ApprovalReadModel>,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn get(
        &self,
        workspace_id: &WorkspaceId,
        approval_id: &ApprovalId,
    ) -> Option<ApprovalReadModel> {
        self.store.get(workspace_id, approval_id)
    }

    pub fn list(&self, workspace_id: &WorkspaceId) -> Vec<ApprovalReadModel> {
        self.store.list(workspace_id)
    }

    fn put(&self, event: &StoredEvent, mut row: ApprovalReadModel) {
        row.last_event_id = event.event_id;
        row.last_event_occurred_at = event.occurred_at;
        row.updated_at = event.recorded_at;
        let approval_id = row.approval_id.clone();
        self.store
            .upsert_if_newer(&event.workspace_id, approval_id, row, event.occurred_at);
    }
}

impl<S> Projector for ApprovalsProjection<S>
where
    S: ReadModelStore<ApprovalId, ApprovalReadModel>,
{
    fn name(&self) -> &'static str {
        "approvals"
    }

    fn wants(&self, event_type: &str) -> bool {
        event_type.starts_with("approval.")
    }

    fn apply(&self, event: &StoredEvent) -> Result<(), ProjectionError> {
        match event.typed_data() {
            EventData::ApprovalRequested(data) => {
                let row = ApprovalReadModel {
                    approval_id: data.approval_id.clone(),
                    workspace_id: event.workspace_id.clone(),
                    status: if data.held {
                        ApprovalStatus::Held
                    } else {
                        ApprovalStatus::Pending
                    },
                    action: data.action,
                    scope: data.scope,
                    expires_at: data.expires_at,
                    requested_by: data.requested_by,
                    decided_by: None,
                    decision: None,
                    revoked: false,
                    correlation_id: event.correlation_id.clone(),
                    last_event_id: event.event_id,
                    last_event_occurred_at: event.occurred_at,
                    updated_at: event.recorded_at,
                };
                self.put(event, row);
            }
            EventData::ApprovalDecided(data) => {
                let Some(mut row) = self.store.get(&event.workspace_id, &data.approval_id)
                else {
                    // Decision before request in feed order: out-of-stream
                    // delivery. Drop; the watermark clause converges on
                    // replay.
                    return Ok(());
                };
                if row.status.is_terminal() {
                    return Ok(());
                }
                row.status = match data.verdict {
                    ApprovalVerdict::Approve => ApprovalStatus::Approved,
                    ApprovalVerdict::Deny => ApprovalStatus::Denied,
                    ApprovalVerdict::Hold => ApprovalStatus::Held,
                };
                row.decision = Some(data.verdict);
                row.decided_by = data.decided_by;
                self.put(event, row);
            }
            EventData::ApprovalRevoked(data) => {
                if let Some(mut row) = self.store.get(&event.workspace_id, &data.approval_id) {
                    row.revoked = true;
                    self.put(event, row);
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Gate-facing read view over the approvals projection.
pub struct ApprovalsReadView<S> {
    store: Arc<S>,
}

impl<S> ApprovalsReadView<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S> ApprovalLookup for ApprovalsReadView<S>
where
    S: ReadModelStore<ApprovalId, ApprovalReadModel> + 'static,
{
    async fn approved_for_correlation(
        &self,
        workspace_id: &WorkspaceId,
        correlation_id: &CorrelationId,
    ) -> Result<Option<ApprovalId>, PolicyStoreError> {
        Ok(self
            .store
            .list(workspace_id)
            .into_iter()
            .find(|row| {
                row.status == ApprovalStatus::Approved
                    && !row.revoked
                    && &row.correlation_id == correlation_id
            })
            .map(|row| row.approval_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projections::store::InMemoryReadModelStore;
    use warden_core::Actor;
    use warden_events::data::{ApprovalDecided, ApprovalRequested};
    use warden_events::{NewEvent, StreamRef};

    fn stored(
        ws: &WorkspaceId,
        correlation: &str,
        data: EventData,
        occurred_at: DateTime<Utc>,
    ) -> StoredEvent {
        let event = NewEvent::new(
            ws.clone(),
            StreamRef::workspace(ws),
            data.event_type().to_string(),
            Actor::user("owner"),
            CorrelationId::from_string(correlation),
            data.to_value(),
        )
        .with_occurred_at(occurred_at);
        StoredEvent::from_new(event, 1, 1, occurred_at)
    }

    fn request(approval_id: &ApprovalId, held: bool) -> EventData {
        EventData::ApprovalRequested(ApprovalRequested {
            approval_id: approval_id.clone(),
            action: "external.write".to_string(),
            scope: ApprovalScope::Once,
            expires_at: None,
            requested_by: Some("agent-1".to_string()),
            held,
        })
    }

    fn decide(approval_id: &ApprovalId, verdict: ApprovalVerdict) -> EventData {
        EventData::ApprovalDecided(ApprovalDecided {
            approval_id: approval_id.clone(),
            verdict,
            decided_by: Some("owner".to_string()),
            note: None,
        })
    }

    #[test]
    fn pending_to_held_to_approved() {
        let store = Arc::new(InMemoryReadModelStore::new());
        let projection = ApprovalsProjection::new(store.clone());
        let ws = WorkspaceId::new();
        let id = ApprovalId::new();
        let t0 = Utc::now();

        projection.apply(&stored(&ws, "c1", request(&id, false), t0)).unwrap();
        assert_eq!(projection.get(&ws, &id).unwrap().status, ApprovalStatus::Pending);

        projection
            .apply(&stored(
                &ws,
                "c1",
                decide(&id, ApprovalVerdict::Hold),
                t0 + chrono::Duration::seconds(1),
            ))
            .unwrap();
        assert_eq!(projection.get(&ws, &id).unwrap().status, ApprovalStatus::Held);

        projection
            .apply(&stored(
                &ws,
                "c1",
                decide(&id, ApprovalVerdict::Approve),
                t0 + chrono::Duration::seconds(2),
            ))
            .unwrap();
        let row = projection.get(&ws, &id).unwrap();
        assert_eq!(row.status, ApprovalStatus::Approved);
        assert_eq!(row.decision, Some(ApprovalVerdict::Approve));
    }

    #[test]
    fn terminal_status_is_sticky() {
        let store = Arc::new(InMemoryReadModelStore::new());
        let projection = ApprovalsProjection::new(store.clone());
        let ws = WorkspaceId::new();
        let id = ApprovalId::new();
        let t0 = Utc::now();

        projection.apply(&stored(&ws, "c1", request(&id, false), t0)).unwrap();
        projection
            .apply(&stored(
                &ws,
                "c1",
                decide(&id, ApprovalVerdict::Deny),
                t0 + chrono::Duration::seconds(1),
            ))
            .unwrap();
        projection
            .apply(&stored(
                &ws,
                "c1",
                decide(&id, ApprovalVerdict::Approve),
                t0 + chrono::Duration::seconds(2),
            ))
            .unwrap();

        assert_eq!(projection.get(&ws, &id).unwrap().status, ApprovalStatus::Denied);
    }

    #[tokio::test]
    async fn lookup_finds_approved_by_correlation() {
        let store = Arc::new(InMemoryReadModelStore::new());
        let projection = ApprovalsProjection::new(store.clone());
        let view = ApprovalsReadView::new(store.clone());
        let ws = WorkspaceId::new();
        let id = ApprovalId::new();
        let t0 = Utc::now();

        projection.apply(&stored(&ws, "deploy-1", request(&id, false), t0)).unwrap();
        assert!(view
            .approved_for_correlation(&ws, &CorrelationId::from_string("deploy-1"))
            .await
            .unwrap()
            .is_none());

        projection
            .apply(&stored(
                &ws,
                "deploy-1",
                decide(&id, ApprovalVerdict::Approve),
                t0 + chrono::Duration::seconds(1),
            ))
            .unwrap();
        assert_eq!(
            view.approved_for_correlation(&ws, &CorrelationId::from_string("deploy-1"))
                .await
                .unwrap(),
            Some(id)
        );
    }
}
