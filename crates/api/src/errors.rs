//! API error mapping: domain reason codes → HTTP statuses.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use warden_core::{ContractViolation, ReasonCode};
use warden_infra::approval::ApprovalError;
use warden_infra::egress::EgressError;
use warden_infra::event_store::EventStoreError;
use warden_infra::lease::LeaseError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Contract(#[from] ContractViolation),
    #[error("lease lost")]
    LeaseLost,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<LeaseError> for ApiError {
    fn from(err: LeaseError) -> Self {
        match err {
            LeaseError::LeaseLost | LeaseError::LockLost => ApiError::LeaseLost,
            LeaseError::Storage(detail) => ApiError::Internal(detail),
        }
    }
}

impl From<EventStoreError> for ApiError {
    fn from(err: EventStoreError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl From<ApprovalError> for ApiError {
    fn from(err: ApprovalError) -> Self {
        match err {
            ApprovalError::Contract(violation) => ApiError::Contract(violation),
            ApprovalError::NotFound(id) => ApiError::NotFound(id.to_string()),
            ApprovalError::Events(detail) => ApiError::Internal(detail),
        }
    }
}

impl From<EgressError> for ApiError {
    fn from(err: EgressError) -> Self {
        match err {
            EgressError::InvalidEgressTarget(detail) => ApiError::BadRequest(detail),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

fn contract_status(reason: ReasonCode) -> StatusCode {
    match reason {
        ReasonCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ReasonCode::ApprovalNotOpen => StatusCode::CONFLICT,
        ReasonCode::LeaseLost | ReasonCode::LockLost => StatusCode::CONFLICT,
        _ => StatusCode::FORBIDDEN,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Contract(violation) => {
                let status = contract_status(violation.reason);
                let body = Json(json!({
                    "error": violation.to_string(),
                    "reason_code": violation.reason.as_str(),
                    "retry_after_sec": violation.retry_after_sec,
                }));
                let mut response = (status, body).into_response();
                if let Some(retry) = violation.retry_after_sec {
                    if let Ok(value) = HeaderValue::from_str(&retry.to_string()) {
                        response.headers_mut().insert(header::RETRY_AFTER, value);
                    }
                }
                response
            }
            ApiError::LeaseLost => (
                StatusCode::CONFLICT,
                Json(json!({"error": "lease lost", "reason_code": "lease_lost"})),
            )
                .into_response(),
            ApiError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                Json(json!({"error": format!("not found: {what}")})),
            )
                .into_response(),
            ApiError::BadRequest(detail) => (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": detail})),
            )
                .into_response(),
            ApiError::Internal(detail) => {
                tracing::error!(error = %detail, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"error": "internal error"})),
                )
                    .into_response()
            }
        }
    }
}
