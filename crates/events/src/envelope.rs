//! Event envelopes: the append-side input and the persisted row.
//!
//! An envelope wraps a domain payload with the infrastructure metadata the
//! control plane needs: workspace isolation, stream identity + sequencing,
//! the acting identity, correlation/causation linkage, redaction state and
//! the hash chain. This split mirrors the unit-of-persistence pattern:
//!
//! - [`NewEvent`] is what callers hand to the event store. It carries no
//!   sequence number and no hashes; those are assigned under the stream-head
//!   lock at append time.
//! - [`StoredEvent`] is the immutable row the store returns and projectors
//!   consume. Once written it never changes; only a companion
//!   `event.redacted` event can alter how readers render its payload.
//!
//! ## Streams
//!
//! A stream is `(stream_type, stream_id)`. Within one stream, `stream_seq`
//! is strictly monotonic, gap-free, starting at 1. Across streams there is
//! no ordering guarantee and no shared hash chain.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use warden_core::{
    Actor, CorrelationId, EventId, MissionId, PrincipalId, RoomId, RunId, StepId, ThreadId,
    WorkspaceId, Zone,
};

/// Kind of stream an event belongs to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamType {
    Room,
    Thread,
    Workspace,
}

impl StreamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamType::Room => "room",
            StreamType::Thread => "thread",
            StreamType::Workspace => "workspace",
        }
    }
}

impl core::fmt::Display for StreamType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamRef {
    #[serde(rename = "type")]
    pub stream_type: StreamType,
    pub id: String,
}

impl StreamRef {
    pub fn room(id: &RoomId) -> Self {
        Self {
            stream_type: StreamType::Room,
            id: id.to_string(),
        }
    }

    pub fn thread(id: &ThreadId) -> Self {
        Self {
            stream_type: StreamType::Thread,
            id: id.to_string(),
        }
    }

    pub fn workspace(id: &WorkspaceId) -> Self {
        Self {
            stream_type: StreamType::Workspace,
            id: id.to_string(),
        }
    }
}

impl core::fmt::Display for StreamRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.stream_type, self.id)
    }
}

/// How much of the payload readers may render.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum RedactionLevel {
    #[default]
    None,
    Partial,
    Full,
}

impl RedactionLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RedactionLevel::None => "none",
            RedactionLevel::Partial => "partial",
            RedactionLevel::Full => "full",
        }
    }
}

/// Optional fine-grained scoping of an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EventScope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mission_id: Option<MissionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<ThreadId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<StepId>,
}

impl EventScope {
    pub fn is_empty(&self) -> bool {
        self.mission_id.is_none()
            && self.room_id.is_none()
            && self.thread_id.is_none()
            && self.run_id.is_none()
            && self.step_id.is_none()
    }
}

/// An event as handed to the store for appending.
///
/// Sequence number, hashes, `recorded_at` and redaction state are assigned
/// by the store; everything else is caller-supplied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    pub event_id: EventId,
    pub event_type: String,
    pub event_version: u32,
    /// Business time. Defaults to the append instant when absent.
    pub occurred_at: Option<DateTime<Utc>>,
    pub workspace_id: WorkspaceId,
    pub scope: EventScope,
    pub actor: Actor,
    pub actor_principal_id: Option<PrincipalId>,
    pub zone: Zone,
    pub stream: StreamRef,
    pub correlation_id: CorrelationId,
    pub causation_id: Option<EventId>,
    pub policy_context: JsonValue,
    pub model_context: JsonValue,
    pub display: JsonValue,
    pub data: JsonValue,
    pub idempotency_key: Option<String>,
}

impl NewEvent {
    pub fn new(
        workspace_id: WorkspaceId,
        stream: StreamRef,
        event_type: impl Into<String>,
        actor: Actor,
        correlation_id: CorrelationId,
        data: JsonValue,
    ) -> Self {
        Self {
            event_id: EventId::new(),
            event_type: event_type.into(),
            event_version: 1,
            occurred_at: None,
            workspace_id,
            scope: EventScope::default(),
            actor,
            actor_principal_id: None,
            zone: Zone::default(),
            stream,
            correlation_id,
            causation_id: None,
            policy_context: JsonValue::Null,
            model_context: JsonValue::Null,
            display: JsonValue::Null,
            data,
            idempotency_key: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_causation(mut self, causation_id: EventId) -> Self {
        self.causation_id = Some(causation_id);
        self
    }

    pub fn with_zone(mut self, zone: Zone) -> Self {
        self.zone = zone;
        self
    }

    pub fn with_occurred_at(mut self, at: DateTime<Utc>) -> Self {
        self.occurred_at = Some(at);
        self
    }

    pub fn with_scope(mut self, scope: EventScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_principal(mut self, principal_id: PrincipalId) -> Self {
        self.actor_principal_id = Some(principal_id);
        self
    }

    pub fn with_event_version(mut self, version: u32) -> Self {
        self.event_version = version;
        self
    }

    pub fn with_policy_context(mut self, ctx: JsonValue) -> Self {
        self.policy_context = ctx;
        self
    }
}

/// A persisted, immutable event row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: EventId,
    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
    pub workspace_id: WorkspaceId,
    pub scope: EventScope,
    pub actor: Actor,
    pub actor_principal_id: Option<PrincipalId>,
    pub zone: Zone,
    pub stream: StreamRef,
    pub stream_seq: u64,
    /// Position in the store-wide change feed (ascending recorded order).
    pub global_seq: u64,
    pub correlation_id: CorrelationId,
    pub causation_id: Option<EventId>,
    pub redaction_level: RedactionLevel,
    pub contains_secrets: bool,
    pub policy_context: JsonValue,
    pub model_context: JsonValue,
    pub display: JsonValue,
    pub data: JsonValue,
    pub idempotency_key: Option<String>,
    pub prev_event_hash: Option<String>,
    pub event_hash: String,
}

impl StoredEvent {
    /// Materialize a row from an accepted envelope.
    ///
    /// Hashes start empty and redaction state starts clean; the store fills
    /// both after sequence assignment and the DLP pass.
    pub fn from_new(
        event: NewEvent,
        stream_seq: u64,
        global_seq: u64,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: event.event_id,
            event_type: event.event_type,
            event_version: event.event_version,
            occurred_at: event.occurred_at.unwrap_or(recorded_at),
            recorded_at,
            workspace_id: event.workspace_id,
            scope: event.scope,
            actor: event.actor,
            actor_principal_id: event.actor_principal_id,
            zone: event.zone,
            stream: event.stream,
            stream_seq,
            global_seq,
            correlation_id: event.correlation_id,
            causation_id: event.causation_id,
            redaction_level: RedactionLevel::None,
            contains_secrets: false,
            policy_context: event.policy_context,
            model_context: event.model_context,
            display: event.display,
            data: event.data,
            idempotency_key: event.idempotency_key,
            prev_event_hash: None,
            event_hash: String::new(),
        }
    }

    /// Typed view of the payload (unknown types fall back losslessly).
    pub fn typed_data(&self) -> crate::data::EventData {
        crate::data::EventData::parse(&self.event_type, &self.data)
    }

    /// Payload as readers honouring `redaction_level` should render it.
    ///
    /// The raw payload is never rewritten (append-only); this re-runs the
    /// secret scanner and substitutes masked previews for any match.
    pub fn redacted_data(&self) -> JsonValue {
        if self.redaction_level == RedactionLevel::None {
            return self.data.clone();
        }
        if self.redaction_level == RedactionLevel::Full {
            return JsonValue::Null;
        }
        crate::dlp::DlpScanner::shared().redact_value(&self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> NewEvent {
        let ws = WorkspaceId::new();
        NewEvent::new(
            ws.clone(),
            StreamRef::workspace(&ws),
            "run.queued",
            Actor::service("api"),
            CorrelationId::new(),
            serde_json::json!({"run_id": "run_1"}),
        )
    }

    #[test]
    fn builder_defaults() {
        let e = sample();
        assert_eq!(e.event_version, 1);
        assert_eq!(e.zone, Zone::Sandbox);
        assert!(e.occurred_at.is_none());
        assert!(e.idempotency_key.is_none());
        assert!(e.scope.is_empty());
    }

    #[test]
    fn stream_ref_display() {
        let room = RoomId::new();
        let s = StreamRef::room(&room);
        assert_eq!(s.to_string(), format!("room/{room}"));
    }

    #[test]
    fn redaction_levels_are_ordered() {
        assert!(RedactionLevel::None < RedactionLevel::Partial);
        assert!(RedactionLevel::Partial < RedactionLevel::Full);
    }
}
