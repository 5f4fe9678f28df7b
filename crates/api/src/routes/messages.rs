//! Message posting: rate-limited, DLP-scanned at append.

use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use warden_core::{Actor, AgentId, CorrelationId};
use warden_events::data::MessageCreated;
use warden_events::{EventData, StreamRef};
use warden_infra::event_store::EventStore as _;
use warden_infra::rate_limit::MessageClass;

use crate::errors::ApiError;
use crate::state::AppState;

use super::parse_workspace;

#[derive(Debug, Deserialize)]
pub struct PostMessageRequest {
    pub agent_id: String,
    pub body: String,
    #[serde(default)]
    pub kind: Option<String>,
}

pub async fn create(
    State(state): State<Arc<AppState>>,
    Path(ws): Path<String>,
    Json(body): Json<PostMessageRequest>,
) -> Result<Response, ApiError> {
    let workspace_id = parse_workspace(&ws)?;
    let agent_id =
        AgentId::from_str(&body.agent_id).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let class = match body.kind.as_deref() {
        Some("heartbeat") => MessageClass::Heartbeat,
        Some("experiment") => MessageClass::Experiment,
        _ => MessageClass::Normal,
    };
    state
        .rate_limiter
        .check_message(&workspace_id, &agent_id, class, Utc::now())
        .await?;

    let data = EventData::MessageCreated(MessageCreated {
        message_id: None,
        body: body.body,
        author: Some(agent_id.to_string()),
        kind: body.kind,
    });
    let event = data.new_event(
        workspace_id.clone(),
        StreamRef::workspace(&workspace_id),
        Actor::agent(agent_id.to_string()),
        CorrelationId::new(),
    );
    let outcome = state.events.append(event).await?;
    state.pump().await;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "event_id": outcome.event.event_id,
            "contains_secrets": outcome.event.contains_secrets,
            "redaction_level": outcome.event.redaction_level,
        })),
    )
        .into_response())
}
