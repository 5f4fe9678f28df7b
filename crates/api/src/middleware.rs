//! Request context headers.
//!
//! Every response carries `x-request-id`, `x-correlation-id` and (when the
//! caller supplied one) `x-workspace-id`. Inbound values are honoured;
//! missing ones are minted.

use axum::extract::Request;
use axum::http::{HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use uuid::Uuid;

pub const REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");
pub const CORRELATION_ID: HeaderName = HeaderName::from_static("x-correlation-id");
pub const WORKSPACE_ID: HeaderName = HeaderName::from_static("x-workspace-id");

pub async fn context_headers(request: Request, next: Next) -> Response {
    let request_id = header_or_uuid(&request, &REQUEST_ID);
    let correlation_id = header_or_uuid(&request, &CORRELATION_ID);
    let workspace_id = request
        .headers()
        .get(&WORKSPACE_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let mut response = next.run(request).await;

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
        headers.insert(CORRELATION_ID, value);
    }
    if let Some(ws) = workspace_id {
        if let Ok(value) = HeaderValue::from_str(&ws) {
            headers.insert(WORKSPACE_ID, value);
        }
    }
    response
}

fn header_or_uuid(request: &Request, name: &HeaderName) -> String {
    request
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::now_v7().simple().to_string())
}
