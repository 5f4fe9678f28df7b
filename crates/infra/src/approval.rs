//! Approval coordination: request + decide over the event log.
//!
//! The projection owns the state machine (`pending → held → approved |
//! denied`); the coordinator validates transitions against the read model
//! before appending, rejects decisions on closed approvals, and treats a
//! matching double-decide as a no-op.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use warden_core::{
    Actor, ApprovalId, ContractViolation, CorrelationId, ReasonCode, WorkspaceId, Zone,
};
use warden_events::data::{
    ApprovalDecided, ApprovalRequested, ApprovalScope, ApprovalVerdict,
};
use warden_events::{EventData, StoredEvent, StreamRef};
use warden_policy::ActionRegistry;

use crate::event_store::{EventStore, EventStoreError};
use crate::projections::approvals::{ApprovalReadModel, ApprovalStatus};
use crate::projections::store::ReadModelStore;

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error(transparent)]
    Contract(#[from] ContractViolation),
    #[error("approval not found: {0}")]
    NotFound(ApprovalId),
    #[error("event store failure: {0}")]
    Events(String),
}

impl From<EventStoreError> for ApprovalError {
    fn from(err: EventStoreError) -> Self {
        Self::Events(err.to_string())
    }
}

pub struct ApprovalCoordinator<S> {
    events: Arc<dyn EventStore>,
    approvals: Arc<S>,
    registry: ActionRegistry,
}

impl<S> ApprovalCoordinator<S>
where
    S: ReadModelStore<ApprovalId, ApprovalReadModel>,
{
    pub fn new(events: Arc<dyn EventStore>, approvals: Arc<S>, registry: ActionRegistry) -> Self {
        Self {
            events,
            approvals,
            registry,
        }
    }

    /// Open an approval request bound to `correlation_id`.
    ///
    /// Triage: a post-review, high-stakes action starts `held` instead of
    /// `pending`.
    pub async fn request(
        &self,
        workspace_id: &WorkspaceId,
        action: &str,
        scope: ApprovalScope,
        requested_by: Actor,
        correlation_id: CorrelationId,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(ApprovalId, StoredEvent), ApprovalError> {
        let spec = self.registry.resolve(action);
        let held = spec.post_review_required && spec.zone_required == Zone::HighStakes;

        let approval_id = ApprovalId::new();
        let data = EventData::ApprovalRequested(ApprovalRequested {
            approval_id: approval_id.clone(),
            action: action.to_string(),
            scope,
            expires_at,
            requested_by: Some(requested_by.id.clone()),
            held,
        });
        let event = data
            .new_event(
                workspace_id.clone(),
                StreamRef::workspace(workspace_id),
                requested_by,
                correlation_id.clone(),
            )
            .with_idempotency_key(format!("approval:request:{}", correlation_id));

        let outcome = self.events.append(event).await?;
        let approval_id = if outcome.deduplicated {
            // Replay: surface the originally minted id.
            match outcome.event.typed_data() {
                EventData::ApprovalRequested(original) => original.approval_id,
                _ => approval_id,
            }
        } else {
            approval_id
        };
        Ok((approval_id, outcome.event))
    }

    /// Decide an open approval.
    ///
    /// Terminal approvals reject with `approval_not_open`, except that
    /// re-submitting the decision already recorded is accepted as a no-op.
    pub async fn decide(
        &self,
        workspace_id: &WorkspaceId,
        approval_id: &ApprovalId,
        verdict: ApprovalVerdict,
        decided_by: Actor,
    ) -> Result<Option<StoredEvent>, ApprovalError> {
        let Some(row) = self.approvals.get(workspace_id, approval_id) else {
            return Err(ApprovalError::NotFound(approval_id.clone()));
        };

        if row.status.is_terminal() {
            if row.decision == Some(verdict) {
                // Idempotent double-decide.
                return Ok(None);
            }
            return Err(ContractViolation::new(ReasonCode::ApprovalNotOpen)
                .with_detail(format!(
                    "approval {} already {}",
                    approval_id,
                    match row.status {
                        ApprovalStatus::Approved => "approved",
                        ApprovalStatus::Denied => "denied",
                        _ => "closed",
                    }
                ))
                .into());
        }

        let data = EventData::ApprovalDecided(ApprovalDecided {
            approval_id: approval_id.clone(),
            verdict,
            decided_by: Some(decided_by.id.clone()),
            note: None,
        });
        let event = data.new_event(
            workspace_id.clone(),
            StreamRef::workspace(workspace_id),
            decided_by,
            row.correlation_id.clone(),
        );
        let outcome = self.events.append(event).await?;
        Ok(Some(outcome.event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::InMemoryEventStore;
    use crate::projections::approvals::ApprovalsProjection;
    use crate::projections::engine::Projector;
    use crate::projections::store::InMemoryReadModelStore;

    struct Fixture {
        coordinator: ApprovalCoordinator<InMemoryReadModelStore<ApprovalId, ApprovalReadModel>>,
        projection: ApprovalsProjection<InMemoryReadModelStore<ApprovalId, ApprovalReadModel>>,
        events: Arc<InMemoryEventStore>,
        ws: WorkspaceId,
    }

    fn fixture() -> Fixture {
        let events = Arc::new(InMemoryEventStore::new());
        let store = Arc::new(InMemoryReadModelStore::new());
        Fixture {
            coordinator: ApprovalCoordinator::new(
                events.clone(),
                store.clone(),
                ActionRegistry::seeded(),
            ),
            projection: ApprovalsProjection::new(store),
            events,
            ws: WorkspaceId::new(),
        }
    }

    async fn project_all(f: &Fixture) {
        for event in f.events.read_feed(0, 1000).await.unwrap() {
            if f.projection.wants(&event.event_type) {
                f.projection.apply(&event).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn request_then_approve() {
        let f = fixture();
        let (approval_id, _) = f
            .coordinator
            .request(
                &f.ws,
                "external.write",
                ApprovalScope::Once,
                Actor::agent("agent-1"),
                CorrelationId::from_string("c-1"),
                None,
            )
            .await
            .unwrap();
        project_all(&f).await;

        let decided = f
            .coordinator
            .decide(&f.ws, &approval_id, ApprovalVerdict::Approve, Actor::user("owner"))
            .await
            .unwrap();
        assert!(decided.is_some());
        project_all(&f).await;

        let row = f.projection.get(&f.ws, &approval_id).unwrap();
        assert_eq!(row.status, ApprovalStatus::Approved);
    }

    #[tokio::test]
    async fn high_stakes_post_review_starts_held() {
        let f = fixture();
        let (approval_id, event) = f
            .coordinator
            .request(
                &f.ws,
                "capability.grant",
                ApprovalScope::Once,
                Actor::agent("agent-1"),
                CorrelationId::from_string("c-2"),
                None,
            )
            .await
            .unwrap();
        assert!(matches!(
            event.typed_data(),
            EventData::ApprovalRequested(ApprovalRequested { held: true, .. })
        ));
        project_all(&f).await;
        assert_eq!(
            f.projection.get(&f.ws, &approval_id).unwrap().status,
            ApprovalStatus::Held
        );
    }

    #[tokio::test]
    async fn double_decide_matching_is_noop() {
        let f = fixture();
        let (approval_id, _) = f
            .coordinator
            .request(
                &f.ws,
                "external.write",
                ApprovalScope::Once,
                Actor::agent("agent-1"),
                CorrelationId::from_string("c-3"),
                None,
            )
            .await
            .unwrap();
        project_all(&f).await;

        f.coordinator
            .decide(&f.ws, &approval_id, ApprovalVerdict::Deny, Actor::user("owner"))
            .await
            .unwrap();
        project_all(&f).await;

        // Same decision again: accepted, nothing appended.
        let replay = f
            .coordinator
            .decide(&f.ws, &approval_id, ApprovalVerdict::Deny, Actor::user("owner"))
            .await
            .unwrap();
        assert!(replay.is_none());

        // A conflicting decision is rejected.
        let err = f
            .coordinator
            .decide(&f.ws, &approval_id, ApprovalVerdict::Approve, Actor::user("owner"))
            .await
            .unwrap_err();
        match err {
            ApprovalError::Contract(v) => assert_eq!(v.reason, ReasonCode::ApprovalNotOpen),
            other => panic!("expected contract violation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_request_replays_original_id() {
        let f = fixture();
        let correlation = CorrelationId::from_string("c-4");
        let (first, _) = f
            .coordinator
            .request(
                &f.ws,
                "external.write",
                ApprovalScope::Once,
                Actor::agent("agent-1"),
                correlation.clone(),
                None,
            )
            .await
            .unwrap();
        let (second, _) = f
            .coordinator
            .request(
                &f.ws,
                "external.write",
                ApprovalScope::Once,
                Actor::agent("agent-1"),
                correlation,
                None,
            )
            .await
            .unwrap();
        assert_eq!(first, second);
    }
}
