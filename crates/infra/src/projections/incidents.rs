//! Incident read model.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use warden_core::{CorrelationId, EventId, IncidentId, WorkspaceId};
use warden_events::{EventData, StoredEvent};

use super::engine::{ProjectionError, Projector};
use super::store::ReadModelStore;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    Open,
    Resolved,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentReadModel {
    pub incident_id: IncidentId,
    pub workspace_id: WorkspaceId,
    pub status: IncidentStatus,
    pub category: String,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub summary: Option<String>,
    pub correlation_id: CorrelationId,
    pub opened_at: DateTime<Utc>,
    pub last_event_id: EventId,
    pub last_event_occurred_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub struct IncidentsProjection<S> {
    store: Arc<S>,
}

impl<S> IncidentsProjection<S>
where
    S: ReadModelStore<IncidentId, IncidentReadModel>,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn get(
        &self,
        workspace_id: &WorkspaceId,
        incident_id: &IncidentId,
    ) -> Option<IncidentReadModel> {
        self.store.get(workspace_id, incident_id)
    }

    pub fn list(&self, workspace_id: &WorkspaceId) -> Vec<IncidentReadModel> {
        self.store.list(workspace_id)
    }

    /// Open incidents touching one entity, for dedup checks.
    pub fn open_for_entity(
        &self,
        workspace_id: &WorkspaceId,
        entity_type: &str,
        entity_id: &str,
    ) -> Vec<IncidentReadModel> {
        self.store
            .list(workspace_id)
            .into_iter()
            .filter(|row| {
                row.status == IncidentStatus::Open
                    && row.entity_type.as_deref() == Some(entity_type)
                    && row.entity_id.as_deref() == Some(entity_id)
            })
            .collect()
    }
}

impl<S> Projector for IncidentsProjection<S>
where
    S: ReadModelStore<IncidentId, IncidentReadModel>,
{
    fn name(&self) -> &'static str {
        "incidents"
    }

    fn wants(&self, event_type: &str) -> bool {
        event_type.starts_with("incident.")
    }

    fn apply(&self, event: &StoredEvent) -> Result<(), ProjectionError> {
        match event.typed_data() {
            EventData::IncidentOpened(data) => {
                let row = IncidentReadModel {
                    incident_id: data.incident_id.clone(),
                    workspace_id: event.workspace_id.clone(),
                    status: IncidentStatus::Open,
                    category: data.category,
                    entity_type: data.entity_type,
                    entity_id: data.entity_id,
                    summary: data.summary,
                    correlation_id: event.correlation_id.clone(),
                    opened_at: event.occurred_at,
                    last_event_id: event.event_id,
                    last_event_occurred_at: event.occurred_at,
                    updated_at: event.recorded_at,
                };
                let incident_id = row.incident_id.clone();
                self.store.upsert_if_newer(
                    &event.workspace_id,
                    incident_id,
                    row,
                    event.occurred_at,
                );
            }
            EventData::IncidentResolved(data) => {
                if let Some(mut row) = self.store.get(&event.workspace_id, &data.incident_id) {
                    row.status = IncidentStatus::Resolved;
                    row.last_event_id = event.event_id;
                    row.last_event_occurred_at = event.occurred_at;
                    row.updated_at = event.recorded_at;
                    let incident_id = row.incident_id.clone();
                    self.store.upsert_if_newer(
                        &event.workspace_id,
                        incident_id,
                        row,
                        event.occurred_at,
                    );
                }
            }
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
    use warden_events::data::IncidentOpened;
    use warden_events::{NewEvent, StreamRef};

    #[test]
    fn open_and_query_by_entity() {
        let store = Arc::new(InMemoryReadModelStore::new());
        let projection = IncidentsProjection::new(store.clone());
        let ws = WorkspaceId::new();
        let incident_id = IncidentId::new();

        let data = EventData::IncidentOpened(IncidentOpened {
            incident_id: incident_id.clone(),
            category: "cron.approval_timeout".to_string(),
            entity_type: Some("approval".to_string()),
            entity_id: Some("apr_123".to_string()),
            summary: None,
        });
        let event = StoredEvent::from_new(
            NewEvent::new(
                ws.clone(),
                StreamRef::workspace(&ws),
                data.event_type().to_string(),
                Actor::service("cron"),
                CorrelationId::new(),
                data.to_value(),
            ),
            1,
            1,
            Utc::now(),
        );
        projection.apply(&event).unwrap();

        let open = projection.open_for_entity(&ws, "approval", "apr_123");
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].category, "cron.approval_timeout");
        assert!(projection.open_for_entity(&ws, "run", "apr_123").is_empty());
    }
}
