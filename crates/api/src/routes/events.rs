//! Stream reads, honouring redaction.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use warden_events::{verify_slice, StreamType};
use warden_infra::event_store::EventStore as _;

use crate::errors::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ReadQuery {
    #[serde(default = "default_from_seq")]
    pub from_seq: u64,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_from_seq() -> u64 {
    1
}

fn default_limit() -> usize {
    100
}

fn parse_stream_type(raw: &str) -> Result<StreamType, ApiError> {
    match raw {
        "room" => Ok(StreamType::Room),
        "thread" => Ok(StreamType::Thread),
        "workspace" => Ok(StreamType::Workspace),
        other => Err(ApiError::BadRequest(format!(
            "unknown stream type '{other}'"
        ))),
    }
}

pub async fn read_stream(
    State(state): State<Arc<AppState>>,
    Path((stream_type, stream_id)): Path<(String, String)>,
    Query(query): Query<ReadQuery>,
) -> Result<Response, ApiError> {
    let stream_type = parse_stream_type(&stream_type)?;

    let events = state
        .events
        .read_stream(
            stream_type,
            &stream_id,
            query.from_seq,
            query.limit.min(500),
        )
        .await?;

    // Readers get the redacted rendering, never the raw payload.
    let rows: Vec<_> = events
        .iter()
        .map(|event| {
            json!({
                "event_id": event.event_id,
                "event_type": event.event_type,
                "event_version": event.event_version,
                "stream_seq": event.stream_seq,
                "occurred_at": event.occurred_at,
                "recorded_at": event.recorded_at,
                "workspace_id": event.workspace_id,
                "actor": event.actor,
                "zone": event.zone,
                "correlation_id": event.correlation_id,
                "causation_id": event.causation_id,
                "redaction_level": event.redaction_level,
                "contains_secrets": event.contains_secrets,
                "data": event.redacted_data(),
                "event_hash": event.event_hash,
                "prev_event_hash": event.prev_event_hash,
            })
        })
        .collect();

    Ok(Json(json!({"events": rows})).into_response())
}

/// Audit: recompute the hash chain over a stream slice.
pub async fn verify_stream(
    State(state): State<Arc<AppState>>,
    Path((stream_type, stream_id)): Path<(String, String)>,
    Query(query): Query<ReadQuery>,
) -> Result<Response, ApiError> {
    let stream_type = parse_stream_type(&stream_type)?;

    let events = state
        .events
        .read_stream(stream_type, &stream_id, query.from_seq, query.limit.min(5_000))
        .await?;

    // A slice starting mid-stream anchors on the previous event's hash.
    let anchor = events.first().and_then(|e| e.prev_event_hash.clone());

    let body = match verify_slice(&events, anchor.as_deref()) {
        Ok(()) => json!({"valid": true, "checked": events.len()}),
        Err(fault) => json!({
            "valid": false,
            "checked": events.len(),
            "fault": fault.kind.as_str(),
            "position": fault.position,
            "stream_seq": fault.stream_seq,
        }),
    };
    Ok(Json(body).into_response())
}
