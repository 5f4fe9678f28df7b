//! Typed catalog of event payloads.
//!
//! Payloads are polymorphic per `event_type`, so the catalog is a tagged
//! union over the types the control plane understands, with an `Unknown`
//! variant carrying the raw JSON for forward compatibility. Parsing never
//! fails: an unrecognized type, or a payload a variant cannot decode,
//! falls back to `Unknown` and is carried losslessly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use warden_core::{
    Actor, AgentId, ApprovalId, CorrelationId, EventId, IncidentId, LifecycleState, ReasonCode,
    RoomId, RunId, SubjectKey, WorkspaceId,
};

use crate::envelope::{NewEvent, StreamRef};

/// Binding of an approval to what it covers.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalScope {
    /// Bound to a single correlation id.
    Once,
    Run,
    Room,
    Workspace,
    Template,
}

/// Outcome of a human decision on an approval.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalVerdict {
    Approve,
    Deny,
    Hold,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunQueued {
    pub run_id: RunId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStarted {
    pub run_id: RunId,
    pub attempt_no: u32,
    pub claimed_by: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunCompleted {
    pub run_id: RunId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailed {
    pub run_id: RunId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_tier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequested {
    pub approval_id: ApprovalId,
    pub action: String,
    pub scope: ApprovalScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<String>,
    /// True when a triage rule parked the request in `held`.
    #[serde(default)]
    pub held: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalDecided {
    pub approval_id: ApprovalId,
    pub verdict: ApprovalVerdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRevoked {
    pub approval_id: ApprovalId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentOpened {
    pub incident_id: IncidentId,
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentResolved {
    pub incident_id: IncidentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EgressRequested {
    pub domain: String,
    pub target_url: String,
    pub method: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EgressAllowed {
    pub domain: String,
    pub target_url: String,
    pub reason_code: ReasonCode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EgressBlocked {
    pub domain: String,
    pub target_url: String,
    pub reason_code: ReasonCode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaExceeded {
    pub scope: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDenied {
    pub kind: String,
    pub action: String,
    pub reason_code: ReasonCode,
    #[serde(default)]
    pub blocked: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRequiresApproval {
    pub kind: String,
    pub action: String,
    pub reason_code: ReasonCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<ApprovalId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRedacted {
    pub target_event_id: EventId,
    pub rule_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretLeakDetected {
    pub rule_ids: Vec<String>,
    pub previews: Vec<String>,
    /// Set when a scan budget cap dropped further matches.
    #[serde(default)]
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageCreated {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// `heartbeat` messages are rate-limited separately.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCalled {
    pub tool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScorecardRecorded {
    pub agent_id: AgentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    /// `pass` / `fail` when the assessment reached a verdict.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    #[serde(default)]
    pub metrics: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleStateChanged {
    pub target_type: String,
    pub target_id: String,
    pub from: LifecycleState,
    pub to: LifecycleState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub survival_score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionEvaluated {
    pub agent_id: AgentId,
    pub decision: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintLearned {
    pub subject_key: SubjectKey,
    pub category: String,
    pub pattern_hash: String,
    pub reason_code: ReasonCode,
    pub seen_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MistakeRepeated {
    pub subject_key: SubjectKey,
    pub category: String,
    pub pattern_hash: String,
    pub repeat_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningFromFailure {
    pub subject_key: SubjectKey,
    pub category: String,
    pub reason_code: ReasonCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentQuarantined {
    pub agent_id: AgentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// The tagged union over known event payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum EventData {
    RunQueued(RunQueued),
    RunStarted(RunStarted),
    RunCompleted(RunCompleted),
    RunFailed(RunFailed),
    ApprovalRequested(ApprovalRequested),
    ApprovalDecided(ApprovalDecided),
    ApprovalRevoked(ApprovalRevoked),
    IncidentOpened(IncidentOpened),
    IncidentResolved(IncidentResolved),
    EgressRequested(EgressRequested),
    EgressAllowed(EgressAllowed),
    EgressBlocked(EgressBlocked),
    QuotaExceeded(QuotaExceeded),
    PolicyDenied(PolicyDenied),
    PolicyRequiresApproval(PolicyRequiresApproval),
    EventRedacted(EventRedacted),
    SecretLeakDetected(SecretLeakDetected),
    MessageCreated(MessageCreated),
    ToolCalled(ToolCalled),
    ScorecardRecorded(ScorecardRecorded),
    LifecycleStateChanged(LifecycleStateChanged),
    PromotionEvaluated(PromotionEvaluated),
    ConstraintLearned(ConstraintLearned),
    MistakeRepeated(MistakeRepeated),
    LearningFromFailure(LearningFromFailure),
    AgentQuarantined(AgentQuarantined),
    /// Anything the catalog does not know, kept verbatim.
    Unknown { event_type: String, data: JsonValue },
}

macro_rules! known_types {
    ($( $name:literal => $variant:ident ),+ $(,)?) => {
        impl EventData {
            /// Dotted event-type name of this payload.
            pub fn event_type(&self) -> &str {
                match self {
                    $( EventData::$variant(_) => $name, )+
                    EventData::Unknown { event_type, .. } => event_type,
                }
            }

            /// Decode a payload. Unknown types and undecodable payloads fall
            /// back to [`EventData::Unknown`].
            pub fn parse(event_type: &str, data: &JsonValue) -> Self {
                let fallback = || EventData::Unknown {
                    event_type: event_type.to_string(),
                    data: data.clone(),
                };
                match event_type {
                    $(
                        $name => serde_json::from_value(data.clone())
                            .map(EventData::$variant)
                            .unwrap_or_else(|_| fallback()),
                    )+
                    _ => fallback(),
                }
            }

            /// Serialize back into the `data` payload.
            pub fn to_value(&self) -> JsonValue {
                match self {
                    $(
                        // Payload structs serialize infallibly (no maps with
                        // non-string keys, no non-finite floats constructed).
                        EventData::$variant(p) => {
                            serde_json::to_value(p).unwrap_or(JsonValue::Null)
                        }
                    )+
                    EventData::Unknown { data, .. } => data.clone(),
                }
            }
        }
    };
}

known_types! {
    "run.queued" => RunQueued,
    "run.started" => RunStarted,
    "run.completed" => RunCompleted,
    "run.failed" => RunFailed,
    "approval.requested" => ApprovalRequested,
    "approval.decided" => ApprovalDecided,
    "approval.revoked" => ApprovalRevoked,
    "incident.opened" => IncidentOpened,
    "incident.resolved" => IncidentResolved,
    "egress.requested" => EgressRequested,
    "egress.allowed" => EgressAllowed,
    "egress.blocked" => EgressBlocked,
    "quota.exceeded" => QuotaExceeded,
    "policy.denied" => PolicyDenied,
    "policy.requires_approval" => PolicyRequiresApproval,
    "event.redacted" => EventRedacted,
    "secret.leaked.detected" => SecretLeakDetected,
    "message.created" => MessageCreated,
    "tool.called" => ToolCalled,
    "scorecard.recorded" => ScorecardRecorded,
    "lifecycle.state.changed" => LifecycleStateChanged,
    "promotion.evaluated" => PromotionEvaluated,
    "constraint.learned" => ConstraintLearned,
    "mistake.repeated" => MistakeRepeated,
    "learning.from_failure" => LearningFromFailure,
    "agent.quarantined" => AgentQuarantined,
}

impl EventData {
    /// Build an appendable envelope from this payload.
    pub fn new_event(
        &self,
        workspace_id: WorkspaceId,
        stream: StreamRef,
        actor: Actor,
        correlation_id: CorrelationId,
    ) -> NewEvent {
        NewEvent::new(
            workspace_id,
            stream,
            self.event_type().to_string(),
            actor,
            correlation_id,
            self.to_value(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn known_payload_round_trips() {
        let run_id = RunId::new();
        let payload = EventData::RunFailed(RunFailed {
            run_id: run_id.clone(),
            error_code: Some("timeout".to_string()),
            error_kind: None,
            risk_tier: Some("high".to_string()),
            message: None,
        });

        let value = payload.to_value();
        let back = EventData::parse("run.failed", &value);
        assert_eq!(back, payload);
        assert_eq!(back.event_type(), "run.failed");
    }

    #[test]
    fn unknown_type_is_lossless() {
        let data = json!({"anything": [1, 2, 3]});
        let parsed = EventData::parse("experiment.variant.assigned", &data);
        match &parsed {
            EventData::Unknown { event_type, data: d } => {
                assert_eq!(event_type, "experiment.variant.assigned");
                assert_eq!(d, &data);
            }
            other => panic!("expected Unknown, got {other:?}"),
        }
        assert_eq!(parsed.to_value(), data);
    }

    #[test]
    fn undecodable_known_type_falls_back() {
        // run.started without required fields must not fail parsing.
        let data = json!({"nope": true});
        let parsed = EventData::parse("run.started", &data);
        assert!(matches!(parsed, EventData::Unknown { .. }));
    }

    #[test]
    fn forward_additive_fields_are_tolerated() {
        let data = json!({
            "run_id": RunId::new(),
            "attempt_no": 1,
            "claimed_by": "worker-7",
            "added_in_v2": {"future": true}
        });
        let parsed = EventData::parse("run.started", &data);
        assert!(matches!(parsed, EventData::RunStarted(_)));
    }
}
