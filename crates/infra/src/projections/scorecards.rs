//! Scorecard read model. The automation loop queries this for trailing
//! pass/fail windows per agent.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use warden_core::{AgentId, EventId, RunId, WorkspaceId};
use warden_events::{EventData, StoredEvent};

use super::engine::{ProjectionError, Projector};
use super::store::ReadModelStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScorecardReadModel {
    pub scorecard_id: String,
    pub workspace_id: WorkspaceId,
    pub agent_id: AgentId,
    pub run_id: Option<RunId>,
    pub decision: Option<String>,
    pub iterations: Option<u32>,
    pub max_iterations: Option<u32>,
    pub metrics: JsonValue,
    pub recorded_at: DateTime<Utc>,
    pub last_event_id: EventId,
    pub last_event_occurred_at: DateTime<Utc>,
}

pub struct ScorecardsProjection<S> {
    store: Arc<S>,
}

impl<S> ScorecardsProjection<S>
where
    S: ReadModelStore<String, ScorecardReadModel>,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn list(&self, workspace_id: &WorkspaceId) -> Vec<ScorecardReadModel> {
        self.store.list(workspace_id)
    }

    /// Scorecards for one agent with a given decision inside the trailing
    /// window.
    pub fn decisions_in_window(
        &self,
        workspace_id: &WorkspaceId,
        agent_id: &AgentId,
        decision: &str,
        window_days: i64,
        now: DateTime<Utc>,
    ) -> usize {
        let cutoff = now - Duration::days(window_days);
        self.store
            .list(workspace_id)
            .into_iter()
            .filter(|row| {
                &row.agent_id == agent_id
                    && row.decision.as_deref() == Some(decision)
                    && row.recorded_at >= cutoff
            })
            .count()
    }
}

impl<S> Projector for ScorecardsProjection<S>
where
    S: ReadModelStore<String, ScorecardReadModel>,
{
    fn name(&self) -> &'static str {
        "scorecards"
    }

    fn wants(&self, event_type: &str) -> bool {
        event_type == "scorecard.recorded"
    }

    fn apply(&self, event: &StoredEvent) -> Result<(), ProjectionError> {
        let EventData::ScorecardRecorded(data) = event.typed_data() else {
            return Ok(());
        };
        let scorecard_id = event.event_id.to_string();
        let row = ScorecardReadModel {
            scorecard_id: scorecard_id.clone(),
            workspace_id: event.workspace_id.clone(),
            agent_id: data.agent_id,
            run_id: data.run_id,
            decision: data.decision,
            iterations: data.iterations,
            max_iterations: data.max_iterations,
            metrics: data.metrics,
            recorded_at: event.occurred_at,
            last_event_id: event.event_id,
            last_event_occurred_at: event.occurred_at,
        };
        self.store
            .upsert_if_newer(&event.workspace_id, scorecard_id, row, event.occurred_at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projections::store::InMemoryReadModelStore;
    use warden_core::{Actor, CorrelationId};
    use warden_events::data::ScorecardRecorded;
    use warden_events::{NewEvent, StreamRef};

    #[test]
    fn window_counts_respect_cutoff() {
        let store = Arc::new(InMemoryReadModelStore::new());
        let projection = ScorecardsProjection::new(store.clone());
        let ws = WorkspaceId::new();
        let agent = AgentId::new();
        let now = Utc::now();

        for (i, age_days) in [0i64, 2, 10].iter().enumerate() {
            let data = EventData::ScorecardRecorded(ScorecardRecorded {
                agent_id: agent.clone(),
                run_id: None,
                decision: Some("fail".to_string()),
                iterations: None,
                max_iterations: None,
                metrics: JsonValue::Null,
            });
            let occurred = now - Duration::days(*age_days);
            let event = StoredEvent::from_new(
                NewEvent::new(
                    ws.clone(),
                    StreamRef::workspace(&ws),
                    data.event_type().to_string(),
                    Actor::service("assessor"),
                    CorrelationId::new(),
                    data.to_value(),
                )
                .with_occurred_at(occurred),
                i as u64 + 1,
                i as u64 + 1,
                occurred,
            );
            projection.apply(&event).unwrap();
        }

        assert_eq!(projection.decisions_in_window(&ws, &agent, "fail", 7, now), 2);
        assert_eq!(projection.decisions_in_window(&ws, &agent, "pass", 7, now), 0);
    }
}
