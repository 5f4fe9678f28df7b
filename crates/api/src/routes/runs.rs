//! Run lifecycle endpoints: create, claim, heartbeat, release, complete,
//! fail, read.

use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use warden_core::{Actor, AgentId, CorrelationId, RoomId, RunId};
use warden_events::data::{RunCompleted, RunFailed, RunQueued};
use warden_events::{EventData, StreamRef};
use warden_infra::event_store::EventStore as _;
use warden_infra::projections::ReadModelStore as _;

use crate::errors::ApiError;
use crate::state::AppState;

use super::parse_workspace;

#[derive(Debug, Deserialize)]
pub struct CreateRunRequest {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub room_id: Option<String>,
}

pub async fn create(
    State(state): State<Arc<AppState>>,
    Path(ws): Path<String>,
    Json(body): Json<CreateRunRequest>,
) -> Result<Response, ApiError> {
    let workspace_id = parse_workspace(&ws)?;
    state.directory.register(workspace_id.clone());

    let run_id = match body.run_id {
        Some(raw) => RunId::from_str(&raw).map_err(|e| ApiError::BadRequest(e.to_string()))?,
        None => RunId::new(),
    };
    let agent_id = body
        .agent_id
        .map(|raw| AgentId::from_str(&raw))
        .transpose()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let room_id = body
        .room_id
        .map(|raw| RoomId::from_str(&raw))
        .transpose()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let data = EventData::RunQueued(RunQueued {
        run_id: run_id.clone(),
        room_id,
        agent_id,
    });
    let event = data
        .new_event(
            workspace_id.clone(),
            StreamRef::workspace(&workspace_id),
            Actor::service("api"),
            CorrelationId::new(),
        )
        .with_idempotency_key(format!("run:create:{run_id}"));
    state.events.append(event).await?;
    state.pump().await;

    Ok((
        StatusCode::CREATED,
        Json(json!({"run_id": run_id, "status": "queued"})),
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
pub struct ClaimRequest {
    pub worker_id: String,
}

pub async fn claim(
    State(state): State<Arc<AppState>>,
    Path(ws): Path<String>,
    Json(body): Json<ClaimRequest>,
) -> Result<Response, ApiError> {
    let workspace_id = parse_workspace(&ws)?;
    let claimed = state
        .lease_manager
        .claim(&workspace_id, &body.worker_id)
        .await?;
    state.pump().await;

    match claimed {
        Some(claimed) => Ok((
            StatusCode::OK,
            Json(json!({
                "run_id": claimed.run.run_id,
                "claim_token": claimed.claim_token,
                "attempt_no": claimed.attempt_no,
                "lease_expires_at": claimed.lease_expires_at,
            })),
        )
            .into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

#[derive(Debug, Deserialize)]
pub struct LeaseRequest {
    pub claim_token: Uuid,
    #[serde(default)]
    pub terminal: Option<bool>,
}

pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Path((ws, run_id)): Path<(String, String)>,
    Json(body): Json<LeaseRequest>,
) -> Result<Response, ApiError> {
    let workspace_id = parse_workspace(&ws)?;
    let run_id = RunId::from_str(&run_id).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let expires_at = state
        .lease_manager
        .heartbeat(&workspace_id, &run_id, body.claim_token)
        .await?;
    Ok((StatusCode::OK, Json(json!({"lease_expires_at": expires_at}))).into_response())
}

pub async fn release(
    State(state): State<Arc<AppState>>,
    Path((ws, run_id)): Path<(String, String)>,
    Json(body): Json<LeaseRequest>,
) -> Result<Response, ApiError> {
    let workspace_id = parse_workspace(&ws)?;
    let run_id = RunId::from_str(&run_id).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    state
        .lease_manager
        .release(
            &workspace_id,
            &run_id,
            body.claim_token,
            body.terminal.unwrap_or(false),
        )
        .await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    pub claim_token: Uuid,
    #[serde(default)]
    pub outcome: Option<serde_json::Value>,
}

pub async fn complete(
    State(state): State<Arc<AppState>>,
    Path((ws, run_id)): Path<(String, String)>,
    Json(body): Json<CompleteRequest>,
) -> Result<Response, ApiError> {
    let workspace_id = parse_workspace(&ws)?;
    let run_id = RunId::from_str(&run_id).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let correlation = state
        .runs
        .get(&workspace_id, &run_id)
        .map(|run| run.correlation_id)
        .unwrap_or_default();

    let data = EventData::RunCompleted(RunCompleted {
        run_id: run_id.clone(),
        outcome: body.outcome,
    });
    let event = data
        .new_event(
            workspace_id.clone(),
            StreamRef::workspace(&workspace_id),
            Actor::service("api"),
            correlation,
        )
        .with_idempotency_key(format!("run:complete:{run_id}"));
    state.events.append(event).await?;

    state
        .lease_manager
        .release(&workspace_id, &run_id, body.claim_token, true)
        .await?;
    state.pump().await;
    Ok(StatusCode::OK.into_response())
}

#[derive(Debug, Deserialize)]
pub struct FailRequest {
    pub claim_token: Uuid,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_kind: Option<String>,
    #[serde(default)]
    pub risk_tier: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

pub async fn fail(
    State(state): State<Arc<AppState>>,
    Path((ws, run_id)): Path<(String, String)>,
    Json(body): Json<FailRequest>,
) -> Result<Response, ApiError> {
    let workspace_id = parse_workspace(&ws)?;
    let run_id = RunId::from_str(&run_id).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let correlation = state
        .runs
        .get(&workspace_id, &run_id)
        .map(|run| run.correlation_id)
        .unwrap_or_default();

    let data = EventData::RunFailed(RunFailed {
        run_id: run_id.clone(),
        error_code: body.error_code,
        error_kind: body.error_kind,
        risk_tier: body.risk_tier,
        message: body.message,
    });
    let event = data
        .new_event(
            workspace_id.clone(),
            StreamRef::workspace(&workspace_id),
            Actor::service("api"),
            correlation,
        )
        .with_idempotency_key(format!("run:fail:{run_id}"));
    state.events.append(event).await?;

    state
        .lease_manager
        .release(&workspace_id, &run_id, body.claim_token, true)
        .await?;
    state.pump().await;
    Ok(StatusCode::OK.into_response())
}

pub async fn get(
    State(state): State<Arc<AppState>>,
    Path((ws, run_id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let workspace_id = parse_workspace(&ws)?;
    let run_id = RunId::from_str(&run_id).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    match state.runs.get(&workspace_id, &run_id) {
        Some(run) => Ok(Json(run).into_response()),
        None => Err(ApiError::NotFound(run_id.to_string())),
    }
}
