//! Tool-call read model.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use warden_core::{CorrelationId, EventId, RunId, WorkspaceId};
use warden_events::{EventData, StoredEvent};

use super::engine::{ProjectionError, Projector};
use super::store::ReadModelStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallReadModel {
    pub call_id: String,
    pub workspace_id: WorkspaceId,
    pub tool: String,
    pub run_id: Option<RunId>,
    pub status: Option<String>,
    pub actor_id: String,
    pub correlation_id: CorrelationId,
    pub last_event_id: EventId,
    pub last_event_occurred_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub struct ToolCallsProjection<S> {
    store: Arc<S>,
}

impl<S> ToolCallsProjection<S>
where
    S: ReadModelStore<String, ToolCallReadModel>,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn list(&self, workspace_id: &WorkspaceId) -> Vec<ToolCallReadModel> {
        self.store.list(workspace_id)
    }
}

impl<S> Projector for ToolCallsProjection<S>
where
    S: ReadModelStore<String, ToolCallReadModel>,
{
    fn name(&self) -> &'static str {
        "tool_calls"
    }

    fn wants(&self, event_type: &str) -> bool {
        event_type.starts_with("tool.")
    }

    fn apply(&self, event: &StoredEvent) -> Result<(), ProjectionError> {
        let EventData::ToolCalled(data) = event.typed_data() else {
            return Ok(());
        };
        let call_id = event.event_id.to_string();
        let row = ToolCallReadModel {
            call_id: call_id.clone(),
            workspace_id: event.workspace_id.clone(),
            tool: data.tool,
            run_id: data.run_id,
            status: data.status,
            actor_id: event.actor.id.clone(),
            correlation_id: event.correlation_id.clone(),
            last_event_id: event.event_id,
            last_event_occurred_at: event.occurred_at,
            updated_at: event.recorded_at,
        };
        self.store
            .upsert_if_newer(&event.workspace_id, call_id, row, event.occurred_at);
        Ok(())
    }
}
