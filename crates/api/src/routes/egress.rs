//! Egress endpoint: gate + event trail for outbound HTTP intents.

use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use warden_core::{Actor, AgentId, CorrelationId, TokenId, Zone};
use warden_infra::egress::EgressRequest;
use warden_policy::Decision;

use crate::errors::ApiError;
use crate::state::AppState;

use super::parse_workspace;

#[derive(Debug, Deserialize)]
pub struct EgressBody {
    pub target_url: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub capability_token_id: Option<String>,
    #[serde(default)]
    pub zone: Option<Zone>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub context: Option<serde_json::Value>,
}

pub async fn request(
    State(state): State<Arc<AppState>>,
    Path(ws): Path<String>,
    Json(body): Json<EgressBody>,
) -> Result<Response, ApiError> {
    let workspace_id = parse_workspace(&ws)?;

    let actor = match &body.agent_id {
        Some(id) => Actor::agent(id.clone()),
        None => Actor::service("api"),
    };
    let correlation_id = body
        .correlation_id
        .map(CorrelationId::from_string)
        .unwrap_or_default();

    let mut request = EgressRequest::new(
        workspace_id,
        body.target_url,
        actor,
        correlation_id,
    );
    if let Some(method) = body.method {
        request.method = method;
    }
    request.agent_id = body
        .agent_id
        .map(|raw| AgentId::from_str(&raw))
        .transpose()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    request.capability_token_id = body
        .capability_token_id
        .map(|raw| TokenId::from_str(&raw))
        .transpose()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    request.zone = body.zone;
    request.context = body.context.unwrap_or(serde_json::Value::Null);

    let outcome = state.egress.request_egress(request).await?;
    state.pump().await;

    Ok(Json(json!({
        "decision": match outcome.outcome.decision {
            Decision::Allow => "allow",
            Decision::Deny => "deny",
            Decision::RequireApproval => "require_approval",
        },
        "reason_code": outcome.outcome.reason_code.as_str(),
        "blocked": outcome.outcome.blocked,
        "domain": outcome.domain,
        "approval_id": outcome.approval_id,
    }))
    .into_response())
}
