//! Reactive automation: `run.failed` and `scorecard.recorded` triggers.
//!
//! Handlers run after the event is projected. Every emission goes through
//! the event store under a deterministic idempotency key, so re-delivery
//! collapses. A handler that throws is retried once; a second failure is
//! converted into an `automation_internal_error` incident instead of
//! poisoning the loop.

use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;

use warden_core::{Actor, AgentId, ApprovalId, CorrelationId, IncidentId, RunId, WorkspaceId};
use warden_events::data::{
    AgentQuarantined, ApprovalRequested, ApprovalScope, ApprovalVerdict, IncidentOpened,
    MessageCreated, PromotionEvaluated, RunFailed, ScorecardRecorded,
};
use warden_events::{EventData, StoredEvent, StreamRef};

use crate::config::AutomationConfig;
use crate::event_store::EventStore;
use crate::projections::approvals::{ApprovalReadModel, ApprovalStatus};
use crate::projections::incidents::{IncidentReadModel, IncidentsProjection};
use crate::projections::scorecards::{ScorecardReadModel, ScorecardsProjection};
use crate::projections::store::ReadModelStore;

#[derive(Debug, Error)]
enum HandlerError {
    #[error("automation handler failed: {0}")]
    Internal(String),
}

/// `sha256(idempotency_key)` truncated to 26 hex chars: a stable,
/// human-sized id for synthesized messages.
pub fn deterministic_message_id(idempotency_key: &str) -> String {
    let digest = Sha256::digest(idempotency_key.as_bytes());
    hex::encode(digest)[..26].to_string()
}

pub struct AutomationLoop<A, I, S> {
    events: Arc<dyn EventStore>,
    approvals: Arc<A>,
    incidents: IncidentsProjection<I>,
    scorecards: ScorecardsProjection<S>,
    config: AutomationConfig,
}

impl<A, I, S> AutomationLoop<A, I, S>
where
    A: ReadModelStore<ApprovalId, ApprovalReadModel>,
    I: ReadModelStore<IncidentId, IncidentReadModel>,
    S: ReadModelStore<String, ScorecardReadModel>,
{
    pub fn new(
        events: Arc<dyn EventStore>,
        approvals: Arc<A>,
        incidents: Arc<I>,
        scorecards: Arc<S>,
        config: AutomationConfig,
    ) -> Self {
        Self {
            events,
            approvals,
            incidents: IncidentsProjection::new(incidents),
            scorecards: ScorecardsProjection::new(scorecards),
            config,
        }
    }

    /// Entry point: feed every projected event through here.
    pub async fn handle(&self, event: &StoredEvent) {
        let relevant = matches!(
            event.event_type.as_str(),
            "run.failed" | "scorecard.recorded"
        );
        if !relevant {
            return;
        }

        let mut last_error = None;
        for _ in 0..2 {
            match self.dispatch(event).await {
                Ok(()) => return,
                Err(err) => {
                    warn!(
                        event_type = %event.event_type,
                        event_id = %event.event_id,
                        error = %err,
                        "automation handler failed"
                    );
                    last_error = Some(err);
                }
            }
        }

        // A poison trigger must not halt the loop: fall back to an
        // incident keyed on the triggering event.
        let error = last_error.map(|e| e.to_string()).unwrap_or_default();
        let key = format!("auto:error:{}", event.event_id);
        self.emit(
            event,
            EventData::IncidentOpened(IncidentOpened {
                incident_id: IncidentId::new(),
                category: "automation_internal_error".to_string(),
                entity_type: Some("event".to_string()),
                entity_id: Some(event.event_id.to_string()),
                summary: Some(error),
            }),
            key,
        )
        .await;
    }

    async fn dispatch(&self, event: &StoredEvent) -> Result<(), HandlerError> {
        if self.config.fail_test {
            return Err(HandlerError::Internal(
                "AUTOMATION_FAIL_TEST is set".to_string(),
            ));
        }
        match event.typed_data() {
            EventData::RunFailed(data) => self.on_run_failed(event, data).await,
            EventData::ScorecardRecorded(data) => self.on_scorecard(event, data).await,
            _ => Ok(()),
        }
    }

    async fn on_run_failed(
        &self,
        event: &StoredEvent,
        data: RunFailed,
    ) -> Result<(), HandlerError> {
        let workspace_id = &event.workspace_id;
        let run_id = &data.run_id;

        // A deny/revoke on this workflow means a human already intervened.
        let human_already_decided = self
            .approvals
            .list(workspace_id)
            .into_iter()
            .any(|row| {
                row.correlation_id == event.correlation_id
                    && (row.revoked
                        || row.status == ApprovalStatus::Denied
                        || row.decision == Some(ApprovalVerdict::Deny))
            });
        if human_already_decided {
            return Ok(());
        }

        let had_open_incident = !self
            .incidents
            .open_for_entity(workspace_id, "run", run_id.as_str())
            .is_empty();

        self.emit(
            event,
            EventData::IncidentOpened(IncidentOpened {
                incident_id: IncidentId::new(),
                category: "run.failed".to_string(),
                entity_type: Some("run".to_string()),
                entity_id: Some(run_id.to_string()),
                summary: data.message.clone(),
            }),
            format!("auto:run_failed:{workspace_id}:run:{run_id}"),
        )
        .await;

        if data.risk_tier.as_deref() == Some("high") && !had_open_incident {
            let key = format!("auto:decision:{workspace_id}:run:{run_id}");
            let message_id = deterministic_message_id(&key);
            self.emit(
                event,
                EventData::MessageCreated(MessageCreated {
                    message_id: Some(message_id),
                    body: format!(
                        "High-risk run {run_id} failed ({}); a human decision is required.",
                        data.error_code.as_deref().unwrap_or("unknown")
                    ),
                    author: Some("automation".to_string()),
                    kind: Some("decision_request".to_string()),
                }),
                key,
            )
            .await;
        }
        Ok(())
    }

    async fn on_scorecard(
        &self,
        event: &StoredEvent,
        data: ScorecardRecorded,
    ) -> Result<(), HandlerError> {
        let workspace_id = &event.workspace_id;
        let agent_id = &data.agent_id;
        let now = Utc::now();

        // Iteration overflow opens an incident regardless of the verdict.
        if let (Some(iterations), Some(max)) = (data.iterations, data.max_iterations) {
            if iterations >= max {
                let entity = data
                    .run_id
                    .as_ref()
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| agent_id.to_string());
                self.emit(
                    event,
                    EventData::IncidentOpened(IncidentOpened {
                        incident_id: IncidentId::new(),
                        category: "loop.iteration_overflow".to_string(),
                        entity_type: Some("agent".to_string()),
                        entity_id: Some(agent_id.to_string()),
                        summary: Some(format!("{iterations}/{max} iterations")),
                    }),
                    format!("auto:iteration_overflow:{workspace_id}:{entity}"),
                )
                .await;
            }
        }

        match data.decision.as_deref() {
            Some("pass") => {
                self.emit(
                    event,
                    EventData::PromotionEvaluated(PromotionEvaluated {
                        agent_id: agent_id.clone(),
                        decision: "pass".to_string(),
                    }),
                    format!("auto:promotion_eval:{workspace_id}:{}", event.event_id),
                )
                .await;

                if self.config.promotion_enabled {
                    if let Some(run_id) = &data.run_id {
                        self.request_approval(
                            event,
                            "agent.promote",
                            ApprovalScope::Run,
                            format!("auto:promote:{workspace_id}:agent:{agent_id}:{run_id}"),
                        )
                        .await;
                    }
                }
            }
            Some("fail") => {
                let fails = self.scorecards.decisions_in_window(
                    workspace_id,
                    agent_id,
                    "fail",
                    self.config.window_days,
                    now,
                ) as u32;

                if fails >= self.config.quarantine_threshold {
                    self.emit(
                        event,
                        EventData::AgentQuarantined(AgentQuarantined {
                            agent_id: agent_id.clone(),
                            reason: Some(format!(
                                "{fails} failed assessments in {} days",
                                self.config.window_days
                            )),
                        }),
                        format!("auto:quarantine:{workspace_id}:agent:{agent_id}"),
                    )
                    .await;
                } else if fails >= self.config.severe_threshold {
                    self.request_approval(
                        event,
                        "capability.revoke",
                        ApprovalScope::Workspace,
                        format!("auto:revoke:{workspace_id}:agent:{agent_id}:{fails}"),
                    )
                    .await;
                } else if fails >= self.config.fail_threshold {
                    self.emit(
                        event,
                        EventData::IncidentOpened(IncidentOpened {
                            incident_id: IncidentId::new(),
                            category: "promotion.fail_streak".to_string(),
                            entity_type: Some("agent".to_string()),
                            entity_id: Some(agent_id.to_string()),
                            summary: Some(format!(
                                "{fails} failed assessments in {} days",
                                self.config.window_days
                            )),
                        }),
                        format!("auto:fail_streak:{workspace_id}:agent:{agent_id}:{fails}"),
                    )
                    .await;
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn request_approval(
        &self,
        event: &StoredEvent,
        action: &str,
        scope: ApprovalScope,
        idempotency_key: String,
    ) {
        self.emit(
            event,
            EventData::ApprovalRequested(ApprovalRequested {
                approval_id: ApprovalId::new(),
                action: action.to_string(),
                scope,
                expires_at: None,
                requested_by: Some("automation".to_string()),
                held: false,
            }),
            idempotency_key,
        )
        .await;
    }

    // Emissions replay idempotently; a storage failure is logged and left
    // for the next delivery of the trigger.
    async fn emit(&self, trigger: &StoredEvent, data: EventData, idempotency_key: String) {
        let event = data
            .new_event(
                trigger.workspace_id.clone(),
                StreamRef::workspace(&trigger.workspace_id),
                Actor::service("automation"),
                trigger.correlation_id.clone(),
            )
            .with_causation(trigger.event_id)
            .with_idempotency_key(idempotency_key);
        if let Err(err) = self.events.append(event).await {
            warn!(error = %err, "automation emission failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::{EventStore, InMemoryEventStore};
    use crate::projections::store::InMemoryReadModelStore;
    use serde_json::Value as JsonValue;

    type Fixture = (
        AutomationLoop<
            InMemoryReadModelStore<ApprovalId, ApprovalReadModel>,
            InMemoryReadModelStore<IncidentId, IncidentReadModel>,
            InMemoryReadModelStore<String, ScorecardReadModel>,
        >,
        Arc<InMemoryEventStore>,
        Arc<InMemoryReadModelStore<String, ScorecardReadModel>>,
        WorkspaceId,
    );

    fn fixture(config: AutomationConfig) -> Fixture {
        let events = Arc::new(InMemoryEventStore::new());
        let scorecards = Arc::new(InMemoryReadModelStore::new());
        let automation = AutomationLoop::new(
            events.clone(),
            Arc::new(InMemoryReadModelStore::new()),
            Arc::new(InMemoryReadModelStore::new()),
            scorecards.clone(),
            config,
        );
        (automation, events, scorecards, WorkspaceId::new())
    }

    async fn trigger(events: &InMemoryEventStore, ws: &WorkspaceId, data: EventData) -> StoredEvent {
        EventStore::append(
            events,
            data.new_event(
                ws.clone(),
                StreamRef::workspace(ws),
                Actor::service("runner"),
                CorrelationId::new(),
            ),
        )
        .await
        .unwrap()
        .event
    }

    async fn event_types(events: &InMemoryEventStore) -> Vec<String> {
        events
            .read_feed(0, 1000)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect()
    }

    #[tokio::test]
    async fn run_failed_opens_incident_once() {
        let (automation, events, _, ws) = fixture(AutomationConfig::default());
        let run_id = RunId::new();
        let failed = trigger(
            &events,
            &ws,
            EventData::RunFailed(RunFailed {
                run_id: run_id.clone(),
                error_code: Some("oom".to_string()),
                error_kind: None,
                risk_tier: None,
                message: None,
            }),
        )
        .await;

        automation.handle(&failed).await;
        automation.handle(&failed).await;

        let types = event_types(&events).await;
        assert_eq!(
            types.iter().filter(|t| *t == "incident.opened").count(),
            1
        );
    }

    #[tokio::test]
    async fn high_risk_failure_requests_human_decision() {
        let (automation, events, _, ws) = fixture(AutomationConfig::default());
        let run_id = RunId::new();
        let failed = trigger(
            &events,
            &ws,
            EventData::RunFailed(RunFailed {
                run_id: run_id.clone(),
                error_code: Some("policy".to_string()),
                error_kind: None,
                risk_tier: Some("high".to_string()),
                message: None,
            }),
        )
        .await;

        automation.handle(&failed).await;

        let feed = events.read_feed(0, 1000).await.unwrap();
        let message = feed
            .iter()
            .find(|e| e.event_type == "message.created")
            .expect("decision request message");
        let id = message.data["message_id"].as_str().unwrap();
        assert_eq!(id.len(), 26);
        assert_eq!(
            id,
            deterministic_message_id(&format!("auto:decision:{ws}:run:{run_id}"))
        );
    }

    #[tokio::test]
    async fn pass_scorecard_requests_promotion_approval() {
        let (automation, events, _, ws) = fixture(AutomationConfig::default());
        let agent = AgentId::new();
        let run = RunId::new();
        let scorecard = trigger(
            &events,
            &ws,
            EventData::ScorecardRecorded(ScorecardRecorded {
                agent_id: agent.clone(),
                run_id: Some(run.clone()),
                decision: Some("pass".to_string()),
                iterations: Some(2),
                max_iterations: Some(10),
                metrics: JsonValue::Null,
            }),
        )
        .await;

        automation.handle(&scorecard).await;

        let types = event_types(&events).await;
        assert!(types.contains(&"approval.requested".to_string()));
        assert!(types.contains(&"promotion.evaluated".to_string()));
    }

    #[tokio::test]
    async fn fail_streak_escalates_through_thresholds() {
        let config = AutomationConfig {
            fail_threshold: 2,
            severe_threshold: 3,
            quarantine_threshold: 4,
            ..Default::default()
        };
        let (automation, events, scorecards, ws) = fixture(config);
        let agent = AgentId::new();
        let now = Utc::now();

        for i in 0..4u32 {
            // Projection state the handler reads (the projector would have
            // applied the event by now).
            let scorecard_id = format!("sc-{i}");
            scorecards.upsert(
                &ws,
                scorecard_id.clone(),
                ScorecardReadModel {
                    scorecard_id,
                    workspace_id: ws.clone(),
                    agent_id: agent.clone(),
                    run_id: None,
                    decision: Some("fail".to_string()),
                    iterations: None,
                    max_iterations: None,
                    metrics: JsonValue::Null,
                    recorded_at: now,
                    last_event_id: warden_core::EventId::new(),
                    last_event_occurred_at: now,
                },
                now + chrono::Duration::milliseconds(i as i64),
            );

            let scorecard = trigger(
                &events,
                &ws,
                EventData::ScorecardRecorded(ScorecardRecorded {
                    agent_id: agent.clone(),
                    run_id: None,
                    decision: Some("fail".to_string()),
                    iterations: None,
                    max_iterations: None,
                    metrics: JsonValue::Null,
                }),
            )
            .await;
            automation.handle(&scorecard).await;
        }

        let types = event_types(&events).await;
        // 2 fails → incident, 3 fails → revoke approval, 4 → quarantine.
        assert!(types
            .iter()
            .any(|t| t == "incident.opened"));
        assert!(types.contains(&"approval.requested".to_string()));
        assert!(types.contains(&"agent.quarantined".to_string()));
    }

    #[tokio::test]
    async fn fail_test_kill_emits_fallback_incident() {
        let config = AutomationConfig {
            fail_test: true,
            ..Default::default()
        };
        let (automation, events, _, ws) = fixture(config);
        let failed = trigger(
            &events,
            &ws,
            EventData::RunFailed(RunFailed {
                run_id: RunId::new(),
                error_code: None,
                error_kind: None,
                risk_tier: None,
                message: None,
            }),
        )
        .await;

        automation.handle(&failed).await;
        automation.handle(&failed).await;

        let feed = events.read_feed(0, 1000).await.unwrap();
        let fallbacks: Vec<_> = feed
            .iter()
            .filter(|e| {
                e.event_type == "incident.opened"
                    && e.data["category"] == "automation_internal_error"
            })
            .collect();
        // Deterministic key: double delivery still one incident.
        assert_eq!(fallbacks.len(), 1);
    }
}
