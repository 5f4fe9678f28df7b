//! Per-stream SHA-256 hash chaining and verification.
//!
//! Each event's hash covers a canonical document of its identity-bearing
//! fields plus the previous event's hash on the same stream. Chains are per
//! stream only; there is no cross-stream linkage.

use serde_json::{json, Value as JsonValue};
use sha2::{Digest, Sha256};

use crate::canonical::canonical_json;
use crate::envelope::StoredEvent;

/// Fields covered by the event hash, assembled after sequence assignment.
///
/// `prev_event_hash` is folded into the document itself, so a stored hash
/// commits to its chain position.
pub fn hashable_document(event: &StoredEvent) -> JsonValue {
    json!({
        "event_id": event.event_id,
        "event_type": event.event_type,
        "event_version": event.event_version,
        "occurred_at": event.occurred_at.to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
        "workspace_id": event.workspace_id,
        "stream": {
            "type": event.stream.stream_type.as_str(),
            "id": event.stream.id,
            "seq": event.stream_seq,
        },
        "actor": event.actor,
        "zone": event.zone,
        "correlation_id": event.correlation_id,
        "causation_id": event.causation_id,
        "data": event.data,
        "prev_event_hash": event.prev_event_hash,
    })
}

/// `"sha256:" + hex(SHA-256(canonical_json(document)))`.
pub fn compute_event_hash(document: &JsonValue) -> String {
    let canonical = canonical_json(document);
    let digest = Sha256::digest(canonical.as_bytes());
    format!("sha256:{}", hex::encode(digest))
}

/// Hash an already-stored event from its own fields.
pub fn event_hash_of(event: &StoredEvent) -> String {
    compute_event_hash(&hashable_document(event))
}

/// What went wrong at a chain position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainFaultKind {
    /// `prev_event_hash` does not equal the previous event's `event_hash`.
    PrevHashMismatch,
    /// Recomputed hash differs from the stored `event_hash`.
    EventHashMismatch,
    /// The stored `event_hash` is empty.
    EventHashMissing,
}

impl ChainFaultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainFaultKind::PrevHashMismatch => "prev_hash_mismatch",
            ChainFaultKind::EventHashMismatch => "event_hash_mismatch",
            ChainFaultKind::EventHashMissing => "event_hash_missing",
        }
    }
}

/// First fault found while verifying a stream slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainFault {
    pub kind: ChainFaultKind,
    /// Zero-based position within the verified slice.
    pub position: usize,
    pub stream_seq: u64,
}

impl core::fmt::Display for ChainFault {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{} at slice position {} (stream_seq {})",
            self.kind.as_str(),
            self.position,
            self.stream_seq
        )
    }
}

/// Verify a contiguous slice of one stream, in ascending `stream_seq`.
///
/// The first event's `prev_event_hash` is only checked against a caller
/// supplied anchor (`prev_hash_anchor`); pass `None` when the slice starts
/// at the beginning of the stream.
pub fn verify_slice(
    events: &[StoredEvent],
    prev_hash_anchor: Option<&str>,
) -> Result<(), ChainFault> {
    let mut expected_prev: Option<String> = prev_hash_anchor.map(str::to_string);

    for (position, event) in events.iter().enumerate() {
        let fault = |kind| ChainFault {
            kind,
            position,
            stream_seq: event.stream_seq,
        };

        if event.event_hash.is_empty() {
            return Err(fault(ChainFaultKind::EventHashMissing));
        }
        // Skip the anchor check when the caller starts mid-stream without one.
        let check_prev = position > 0 || prev_hash_anchor.is_some() || event.stream_seq == 1;
        if check_prev && event.prev_event_hash.as_deref() != expected_prev.as_deref() {
            return Err(fault(ChainFaultKind::PrevHashMismatch));
        }
        if event_hash_of(event) != event.event_hash {
            return Err(fault(ChainFaultKind::EventHashMismatch));
        }

        expected_prev = Some(event.event_hash.clone());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{EventScope, RedactionLevel, StreamRef, StreamType};
    use chrono::Utc;
    use warden_core::{Actor, CorrelationId, EventId, WorkspaceId, Zone};

    fn chained_events(n: u64) -> Vec<StoredEvent> {
        let ws = WorkspaceId::new();
        let occurred = Utc::now();
        let mut prev: Option<String> = None;
        let mut out = Vec::new();
        for seq in 1..=n {
            let mut e = StoredEvent {
                event_id: EventId::new(),
                event_type: "run.queued".to_string(),
                event_version: 1,
                occurred_at: occurred,
                recorded_at: occurred,
                workspace_id: ws.clone(),
                scope: EventScope::default(),
                actor: Actor::service("test"),
                actor_principal_id: None,
                zone: Zone::Sandbox,
                stream: StreamRef {
                    stream_type: StreamType::Workspace,
                    id: ws.to_string(),
                },
                stream_seq: seq,
                global_seq: seq,
                correlation_id: CorrelationId::from_string("c-1"),
                causation_id: None,
                redaction_level: RedactionLevel::None,
                contains_secrets: false,
                policy_context: serde_json::Value::Null,
                model_context: serde_json::Value::Null,
                display: serde_json::Value::Null,
                data: serde_json::json!({"seq": seq}),
                idempotency_key: None,
                prev_event_hash: prev.clone(),
                event_hash: String::new(),
            };
            e.event_hash = event_hash_of(&e);
            prev = Some(e.event_hash.clone());
            out.push(e);
        }
        out
    }

    #[test]
    fn valid_chain_verifies() {
        let events = chained_events(5);
        assert!(verify_slice(&events, None).is_ok());

        // Mid-stream slice verifies against its anchor.
        let anchor = events[1].event_hash.clone();
        assert!(verify_slice(&events[2..], Some(&anchor)).is_ok());
    }

    #[test]
    fn tampered_payload_is_detected() {
        let mut events = chained_events(3);
        events[1].data = serde_json::json!({"seq": "tampered"});

        let fault = verify_slice(&events, None).unwrap_err();
        assert_eq!(fault.kind, ChainFaultKind::EventHashMismatch);
        assert_eq!(fault.position, 1);
        assert_eq!(fault.stream_seq, 2);
    }

    #[test]
    fn broken_linkage_is_detected() {
        let mut events = chained_events(3);
        events[2].prev_event_hash = Some("sha256:deadbeef".to_string());
        // Re-hash so the event's own hash is self-consistent: the fault is
        // the linkage, not the payload.
        events[2].event_hash = event_hash_of(&events[2]);

        let fault = verify_slice(&events, None).unwrap_err();
        assert_eq!(fault.kind, ChainFaultKind::PrevHashMismatch);
        assert_eq!(fault.position, 2);
    }

    #[test]
    fn missing_hash_is_detected() {
        let mut events = chained_events(2);
        events[1].event_hash = String::new();

        let fault = verify_slice(&events, None).unwrap_err();
        assert_eq!(fault.kind, ChainFaultKind::EventHashMissing);
    }

    #[test]
    fn hash_is_prefixed_and_stable() {
        let events = chained_events(1);
        assert!(events[0].event_hash.starts_with("sha256:"));
        assert_eq!(event_hash_of(&events[0]), events[0].event_hash);
    }
}
