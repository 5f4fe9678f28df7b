//! Lifecycle-state read model (one row per target).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use warden_core::{EventId, LifecycleState, WorkspaceId};
use warden_events::{EventData, StoredEvent};

use super::engine::{ProjectionError, Projector};
use super::store::ReadModelStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleReadModel {
    /// `<target_type>:<target_id>`
    pub target_key: String,
    pub workspace_id: WorkspaceId,
    pub target_type: String,
    pub target_id: String,
    pub state: LifecycleState,
    pub survival_score: Option<f64>,
    pub changed_at: DateTime<Utc>,
    pub last_event_id: EventId,
    pub last_event_occurred_at: DateTime<Utc>,
}

pub struct LifecycleProjection<S> {
    store: Arc<S>,
}

impl<S> LifecycleProjection<S>
where
    S: ReadModelStore<String, LifecycleReadModel>,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn get(
        &self,
        workspace_id: &WorkspaceId,
        target_type: &str,
        target_id: &str,
    ) -> Option<LifecycleReadModel> {
        self.store
            .get(workspace_id, &format!("{target_type}:{target_id}"))
    }
}

impl<S> Projector for LifecycleProjection<S>
where
    S: ReadModelStore<String, LifecycleReadModel>,
{
    fn name(&self) -> &'static str {
        "lifecycle"
    }

    fn wants(&self, event_type: &str) -> bool {
        event_type.starts_with("lifecycle.")
    }

    fn apply(&self, event: &StoredEvent) -> Result<(), ProjectionError> {
        let EventData::LifecycleStateChanged(data) = event.typed_data() else {
            return Ok(());
        };
        let target_key = format!("{}:{}", data.target_type, data.target_id);
        let row = LifecycleReadModel {
            target_key: target_key.clone(),
            workspace_id: event.workspace_id.clone(),
            target_type: data.target_type,
            target_id: data.target_id,
            state: data.to,
            survival_score: data.survival_score,
            changed_at: event.occurred_at,
            last_event_id: event.event_id,
            last_event_occurred_at: event.occurred_at,
        };
        self.store
            .upsert_if_newer(&event.workspace_id, target_key, row, event.occurred_at);
        Ok(())
    }
}
