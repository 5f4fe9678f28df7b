//! Daily survival scoring and lifecycle transitions.
//!
//! Per `(workspace, target)` and day: fold the trailing window into a
//! ledger row, derive a recommended state, then move the current state
//! through a hysteresis ladder so one bad day cannot demote straight to
//! sunset and one good day cannot un-sunset an agent.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use warden_core::{Actor, CorrelationId, EventId, LifecycleState, WorkspaceId};
use warden_events::data::LifecycleStateChanged;
use warden_events::{EventData, StreamRef};

use crate::event_store::{EventStore, EventStoreError};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("event store failure: {0}")]
    Events(String),
    #[error("state store failure: {0}")]
    Store(String),
}

impl From<EventStoreError> for LifecycleError {
    fn from(err: EventStoreError) -> Self {
        Self::Events(err.to_string())
    }
}

/// Daily inputs folded from projections and events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurvivalLedgerRow {
    pub workspace_id: WorkspaceId,
    pub target_type: String,
    pub target_id: String,
    pub day: NaiveDate,
    pub successes: u32,
    pub failures: u32,
    pub budget_spent: f64,
    pub budget_limit: f64,
    pub violations: u32,
    pub repeated_mistakes: u32,
}

impl SurvivalLedgerRow {
    /// `budget_spent / budget_limit`; 0 when no budget is set.
    pub fn budget_utilization(&self) -> f64 {
        if self.budget_limit <= 0.0 {
            0.0
        } else {
            self.budget_spent / self.budget_limit
        }
    }
}

/// Derived health signal in `[0, 1]`.
///
/// Success ratio, penalized per violation and (more heavily) per repeated
/// mistake. No attempts counts as healthy.
pub fn survival_score(row: &SurvivalLedgerRow) -> f64 {
    let attempts = row.successes + row.failures;
    let base = if attempts == 0 {
        1.0
    } else {
        row.successes as f64 / attempts as f64
    };
    let penalty = 0.05 * row.violations as f64 + 0.10 * row.repeated_mistakes as f64;
    (base - penalty).clamp(0.0, 1.0)
}

/// What the day's signals say on their own, before hysteresis.
///
/// Budget pressure and failure patterns only ever escalate the score-based
/// recommendation, never soften it.
pub fn recommended_state(row: &SurvivalLedgerRow) -> LifecycleState {
    let score = survival_score(row);
    let mut recommended = if score < 0.30 {
        LifecycleState::Sunset
    } else if score < 0.55 {
        LifecycleState::Probation
    } else {
        LifecycleState::Active
    };

    let utilization = row.budget_utilization();
    if utilization > 1.2 {
        recommended = recommended.max(LifecycleState::Sunset);
    } else if utilization > 0.9 {
        recommended = recommended.max(LifecycleState::Probation);
    }

    if row.repeated_mistakes >= 4 {
        recommended = recommended.max(LifecycleState::Sunset);
    } else if row.failures > row.successes || row.repeated_mistakes >= 2 {
        recommended = recommended.max(LifecycleState::Probation);
    }

    recommended
}

/// Current state plus the consecutive-day counters hysteresis needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleStatus {
    pub state: LifecycleState,
    pub consecutive_healthy: u32,
    pub consecutive_sunset_recs: u32,
    pub last_event_id: Option<EventId>,
    pub updated_at: DateTime<Utc>,
}

impl Default for LifecycleStatus {
    fn default() -> Self {
        Self {
            state: LifecycleState::Active,
            consecutive_healthy: 0,
            consecutive_sunset_recs: 0,
            last_event_id: None,
            updated_at: Utc::now(),
        }
    }
}

/// A recorded transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleTransition {
    pub workspace_id: WorkspaceId,
    pub target_type: String,
    pub target_id: String,
    pub from: LifecycleState,
    pub to: LifecycleState,
    pub survival_score: f64,
    pub event_id: Option<EventId>,
    pub occurred_at: DateTime<Utc>,
}

pub trait LifecycleStateStore: Send + Sync {
    fn get(
        &self,
        workspace_id: &WorkspaceId,
        target_type: &str,
        target_id: &str,
    ) -> Option<LifecycleStatus>;

    fn put(
        &self,
        workspace_id: &WorkspaceId,
        target_type: &str,
        target_id: &str,
        status: LifecycleStatus,
    );

    fn record_transition(&self, transition: LifecycleTransition);

    fn transitions(&self, workspace_id: &WorkspaceId) -> Vec<LifecycleTransition>;

    /// Backfill the triggering event id onto the state row and the latest
    /// matching transition.
    fn backfill_event_id(
        &self,
        workspace_id: &WorkspaceId,
        target_type: &str,
        target_id: &str,
        event_id: EventId,
    );
}

type TargetKey = (WorkspaceId, String, String);

#[derive(Default)]
pub struct InMemoryLifecycleStateStore {
    states: Mutex<HashMap<TargetKey, LifecycleStatus>>,
    transitions: Mutex<Vec<LifecycleTransition>>,
}

impl InMemoryLifecycleStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LifecycleStateStore for InMemoryLifecycleStateStore {
    fn get(
        &self,
        workspace_id: &WorkspaceId,
        target_type: &str,
        target_id: &str,
    ) -> Option<LifecycleStatus> {
        self.states
            .lock()
            .ok()?
            .get(&(
                workspace_id.clone(),
                target_type.to_string(),
                target_id.to_string(),
            ))
            .cloned()
    }

    fn put(
        &self,
        workspace_id: &WorkspaceId,
        target_type: &str,
        target_id: &str,
        status: LifecycleStatus,
    ) {
        if let Ok(mut states) = self.states.lock() {
            states.insert(
                (
                    workspace_id.clone(),
                    target_type.to_string(),
                    target_id.to_string(),
                ),
                status,
            );
        }
    }

    fn record_transition(&self, transition: LifecycleTransition) {
        if let Ok(mut transitions) = self.transitions.lock() {
            transitions.push(transition);
        }
    }

    fn transitions(&self, workspace_id: &WorkspaceId) -> Vec<LifecycleTransition> {
        match self.transitions.lock() {
            Ok(transitions) => transitions
                .iter()
                .filter(|t| &t.workspace_id == workspace_id)
                .cloned()
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    fn backfill_event_id(
        &self,
        workspace_id: &WorkspaceId,
        target_type: &str,
        target_id: &str,
        event_id: EventId,
    ) {
        if let Ok(mut states) = self.states.lock() {
            if let Some(status) = states.get_mut(&(
                workspace_id.clone(),
                target_type.to_string(),
                target_id.to_string(),
            )) {
                status.last_event_id = Some(event_id);
            }
        }
        if let Ok(mut transitions) = self.transitions.lock() {
            if let Some(t) = transitions
                .iter_mut()
                .rev()
                .find(|t| {
                    &t.workspace_id == workspace_id
                        && t.target_type == target_type
                        && t.target_id == target_id
                })
            {
                t.event_id = Some(event_id);
            }
        }
    }
}

pub struct LifecycleEngine {
    states: Arc<dyn LifecycleStateStore>,
    events: Arc<dyn EventStore>,
}

impl LifecycleEngine {
    pub fn new(states: Arc<dyn LifecycleStateStore>, events: Arc<dyn EventStore>) -> Self {
        Self { states, events }
    }

    /// Fold one day's ledger row into the target's lifecycle state.
    ///
    /// Hysteresis:
    /// - active → probation immediately on any non-healthy recommendation
    /// - probation → active after ≥2 consecutive healthy days
    /// - probation → sunset after ≥2 consecutive sunset recommendations
    /// - sunset → probation after ≥3 consecutive healthy days
    pub async fn evaluate_day(
        &self,
        row: &SurvivalLedgerRow,
    ) -> Result<Option<LifecycleTransition>, LifecycleError> {
        let recommendation = recommended_state(row);
        let score = survival_score(row);
        let now = Utc::now();

        let mut status = self
            .states
            .get(&row.workspace_id, &row.target_type, &row.target_id)
            .unwrap_or_default();
        let previous = status.state;

        if recommendation == LifecycleState::Active {
            status.consecutive_healthy += 1;
            status.consecutive_sunset_recs = 0;
        } else {
            status.consecutive_healthy = 0;
            if recommendation == LifecycleState::Sunset {
                status.consecutive_sunset_recs += 1;
            } else {
                status.consecutive_sunset_recs = 0;
            }
        }

        let next = match previous {
            LifecycleState::Active => {
                if recommendation == LifecycleState::Active {
                    LifecycleState::Active
                } else {
                    LifecycleState::Probation
                }
            }
            LifecycleState::Probation => {
                if status.consecutive_healthy >= 2 {
                    LifecycleState::Active
                } else if status.consecutive_sunset_recs >= 2 {
                    LifecycleState::Sunset
                } else {
                    LifecycleState::Probation
                }
            }
            LifecycleState::Sunset => {
                if status.consecutive_healthy >= 3 {
                    LifecycleState::Probation
                } else {
                    LifecycleState::Sunset
                }
            }
        };

        if next != previous {
            // Counters restart in the new state.
            status.consecutive_healthy = 0;
            status.consecutive_sunset_recs = 0;
        }
        status.state = next;
        status.updated_at = now;
        self.states
            .put(&row.workspace_id, &row.target_type, &row.target_id, status);

        if next == previous {
            return Ok(None);
        }

        let mut transition = LifecycleTransition {
            workspace_id: row.workspace_id.clone(),
            target_type: row.target_type.clone(),
            target_id: row.target_id.clone(),
            from: previous,
            to: next,
            survival_score: score,
            event_id: None,
            occurred_at: now,
        };
        self.states.record_transition(transition.clone());

        let data = EventData::LifecycleStateChanged(LifecycleStateChanged {
            target_type: row.target_type.clone(),
            target_id: row.target_id.clone(),
            from: previous,
            to: next,
            survival_score: Some(score),
        });
        let event = data
            .new_event(
                row.workspace_id.clone(),
                StreamRef::workspace(&row.workspace_id),
                Actor::service("lifecycle"),
                CorrelationId::from_string(format!(
                    "lifecycle:{}:{}:{}",
                    row.target_type, row.target_id, row.day
                )),
            )
            .with_idempotency_key(format!(
                "lifecycle:{}:{}:{}:{}",
                row.workspace_id, row.target_type, row.target_id, row.day
            ));
        let appended = self.events.append(event).await?;

        // Both the state row and the transition point at the event.
        self.states.backfill_event_id(
            &row.workspace_id,
            &row.target_type,
            &row.target_id,
            appended.event.event_id,
        );
        transition.event_id = Some(appended.event.event_id);

        info!(
            target_type = %row.target_type,
            target_id = %row.target_id,
            from = %previous,
            to = %next,
            score,
            "lifecycle transition"
        );
        Ok(Some(transition))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::InMemoryEventStore;

    fn row(ws: &WorkspaceId, successes: u32, failures: u32, day_offset: i64) -> SurvivalLedgerRow {
        SurvivalLedgerRow {
            workspace_id: ws.clone(),
            target_type: "agent".to_string(),
            target_id: "agent_x".to_string(),
            day: Utc::now().date_naive() + chrono::Duration::days(day_offset),
            successes,
            failures,
            budget_spent: 0.0,
            budget_limit: 100.0,
            violations: 0,
            repeated_mistakes: 0,
        }
    }

    #[test]
    fn score_and_recommendation_thresholds() {
        let ws = WorkspaceId::new();
        // All successes: healthy.
        assert_eq!(recommended_state(&row(&ws, 10, 0, 0)), LifecycleState::Active);
        // score 0.5: probation band.
        assert_eq!(
            recommended_state(&row(&ws, 5, 5, 0)),
            LifecycleState::Probation
        );
        // score 0.2: sunset band.
        assert_eq!(recommended_state(&row(&ws, 1, 4, 0)), LifecycleState::Sunset);

        // Budget overruns escalate only.
        let mut r = row(&ws, 10, 0, 0);
        r.budget_spent = 95.0;
        assert_eq!(recommended_state(&r), LifecycleState::Probation);
        r.budget_spent = 130.0;
        assert_eq!(recommended_state(&r), LifecycleState::Sunset);

        // Repeated mistakes demote.
        let mut r = row(&ws, 10, 0, 0);
        r.repeated_mistakes = 2;
        assert_eq!(recommended_state(&r), LifecycleState::Probation);
        r.repeated_mistakes = 4;
        assert_eq!(recommended_state(&r), LifecycleState::Sunset);
    }

    #[tokio::test]
    async fn active_demotes_immediately_probation_needs_two_healthy() {
        let ws = WorkspaceId::new();
        let states = Arc::new(InMemoryLifecycleStateStore::new());
        let events = Arc::new(InMemoryEventStore::new());
        let engine = LifecycleEngine::new(states.clone(), events.clone());

        // Day 0: bad day → probation immediately.
        let t = engine.evaluate_day(&row(&ws, 2, 8, 0)).await.unwrap();
        assert_eq!(t.unwrap().to, LifecycleState::Probation);

        // Day 1: one healthy day is not enough.
        assert!(engine.evaluate_day(&row(&ws, 10, 0, 1)).await.unwrap().is_none());
        // Day 2: second healthy day promotes.
        let t = engine.evaluate_day(&row(&ws, 10, 0, 2)).await.unwrap().unwrap();
        assert_eq!(t.from, LifecycleState::Probation);
        assert_eq!(t.to, LifecycleState::Active);

        // The transition and the state row both carry the event id.
        assert!(t.event_id.is_some());
        let status = states.get(&ws, "agent", "agent_x").unwrap();
        assert_eq!(status.last_event_id, t.event_id);
    }

    #[tokio::test]
    async fn probation_to_sunset_needs_two_sunset_recs() {
        let ws = WorkspaceId::new();
        let states = Arc::new(InMemoryLifecycleStateStore::new());
        let events = Arc::new(InMemoryEventStore::new());
        let engine = LifecycleEngine::new(states, events);

        engine.evaluate_day(&row(&ws, 2, 8, 0)).await.unwrap(); // → probation
        // First sunset-grade day: stays in probation.
        assert!(engine.evaluate_day(&row(&ws, 0, 10, 1)).await.unwrap().is_none());
        // Second: demotes.
        let t = engine.evaluate_day(&row(&ws, 0, 10, 2)).await.unwrap().unwrap();
        assert_eq!(t.to, LifecycleState::Sunset);
    }

    #[tokio::test]
    async fn sunset_recovers_after_three_healthy_days() {
        let ws = WorkspaceId::new();
        let states = Arc::new(InMemoryLifecycleStateStore::new());
        let events = Arc::new(InMemoryEventStore::new());
        let engine = LifecycleEngine::new(states, events);

        engine.evaluate_day(&row(&ws, 0, 10, 0)).await.unwrap(); // → probation
        engine.evaluate_day(&row(&ws, 0, 10, 1)).await.unwrap();
        engine.evaluate_day(&row(&ws, 0, 10, 2)).await.unwrap(); // → sunset

        assert!(engine.evaluate_day(&row(&ws, 10, 0, 3)).await.unwrap().is_none());
        assert!(engine.evaluate_day(&row(&ws, 10, 0, 4)).await.unwrap().is_none());
        let t = engine.evaluate_day(&row(&ws, 10, 0, 5)).await.unwrap().unwrap();
        assert_eq!(t.from, LifecycleState::Sunset);
        assert_eq!(t.to, LifecycleState::Probation);
    }
}
