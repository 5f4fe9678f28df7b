//! Approval endpoints.

use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use warden_core::{Actor, ApprovalId};
use warden_events::data::ApprovalVerdict;
use warden_infra::projections::ReadModelStore as _;

use crate::errors::ApiError;
use crate::state::AppState;

use super::parse_workspace;

#[derive(Debug, Deserialize)]
pub struct DecideRequest {
    pub verdict: ApprovalVerdict,
    #[serde(default)]
    pub decided_by: Option<String>,
}

pub async fn decide(
    State(state): State<Arc<AppState>>,
    Path((ws, approval_id)): Path<(String, String)>,
    Json(body): Json<DecideRequest>,
) -> Result<Response, ApiError> {
    let workspace_id = parse_workspace(&ws)?;
    let approval_id =
        ApprovalId::from_str(&approval_id).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let decider = Actor::user(body.decided_by.unwrap_or_else(|| "owner".to_string()));
    let appended = state
        .coordinator
        .decide(&workspace_id, &approval_id, body.verdict, decider)
        .await?;
    state.pump().await;

    let row = state
        .approvals
        .get(&workspace_id, &approval_id)
        .ok_or_else(|| ApiError::NotFound(approval_id.to_string()))?;
    Ok(Json(json!({
        "approval_id": approval_id,
        "status": row.status,
        "noop": appended.is_none(),
    }))
    .into_response())
}

pub async fn get(
    State(state): State<Arc<AppState>>,
    Path((ws, approval_id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let workspace_id = parse_workspace(&ws)?;
    let approval_id =
        ApprovalId::from_str(&approval_id).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    match state.approvals.get(&workspace_id, &approval_id) {
        Some(row) => Ok(Json(row).into_response()),
        None => Err(ApiError::NotFound(approval_id.to_string())),
    }
}

pub async fn list(
    State(state): State<Arc<AppState>>,
    Path(ws): Path<String>,
) -> Result<Response, ApiError> {
    let workspace_id = parse_workspace(&ws)?;
    Ok(Json(state.approvals.list(&workspace_id)).into_response())
}
