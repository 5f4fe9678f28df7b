//! Egress read model, keyed by correlation id: a request row updated with
//! its terminal outcome.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use warden_core::{EventId, ReasonCode, WorkspaceId};
use warden_events::{EventData, StoredEvent};

use super::engine::{ProjectionError, Projector};
use super::store::ReadModelStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EgressReadModel {
    pub correlation_key: String,
    pub workspace_id: WorkspaceId,
    pub domain: String,
    pub target_url: String,
    pub method: String,
    /// `allowed` / `blocked` once terminal.
    pub outcome: Option<String>,
    pub reason_code: Option<ReasonCode>,
    pub last_event_id: EventId,
    pub last_event_occurred_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub struct EgressProjection<S> {
    store: Arc<S>,
}

impl<S> EgressProjection<S>
where
    S: ReadModelStore<String, EgressReadModel>,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn get(&self, workspace_id: &WorkspaceId, correlation: &str) -> Option<EgressReadModel> {
        self.store.get(workspace_id, &correlation.to_string())
    }

    pub fn list(&self, workspace_id: &WorkspaceId) -> Vec<EgressReadModel> {
        self.store.list(workspace_id)
    }
}

impl<S> Projector for EgressProjection<S>
where
    S: ReadModelStore<String, EgressReadModel>,
{
    fn name(&self) -> &'static str {
        "egress"
    }

    fn wants(&self, event_type: &str) -> bool {
        event_type.starts_with("egress.")
    }

    fn apply(&self, event: &StoredEvent) -> Result<(), ProjectionError> {
        let key = event.correlation_id.to_string();
        match event.typed_data() {
            EventData::EgressRequested(data) => {
                let row = EgressReadModel {
                    correlation_key: key.clone(),
                    workspace_id: event.workspace_id.clone(),
                    domain: data.domain,
                    target_url: data.target_url,
                    method: data.method,
                    outcome: None,
                    reason_code: None,
                    last_event_id: event.event_id,
                    last_event_occurred_at: event.occurred_at,
                    updated_at: event.recorded_at,
                };
                self.store
                    .upsert_if_newer(&event.workspace_id, key, row, event.occurred_at);
            }
            EventData::EgressAllowed(data) => {
                if let Some(mut row) = self.store.get(&event.workspace_id, &key) {
                    row.outcome = Some("allowed".to_string());
                    row.reason_code = Some(data.reason_code);
                    row.last_event_id = event.event_id;
                    row.last_event_occurred_at = event.occurred_at;
                    row.updated_at = event.recorded_at;
                    self.store
                        .upsert_if_newer(&event.workspace_id, key, row, event.occurred_at);
                }
            }
            EventData::EgressBlocked(data) => {
                if let Some(mut row) = self.store.get(&event.workspace_id, &key) {
                    row.outcome = Some("blocked".to_string());
                    row.reason_code = Some(data.reason_code);
                    row.last_event_id = event.event_id;
                    row.last_event_occurred_at = event.occurred_at;
                    row.updated_at = event.recorded_at;
                    self.store
                        .upsert_if_newer(&event.workspace_id, key, row, event.occurred_at);
                }
            }
            _ => {}
        }
        Ok(())
    }
}
