//! Router assembly.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use crate::middleware::context_headers;
use crate::routes;
use crate::state::AppState;

pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(routes::system::health))
        .route("/workspaces/:ws/runs", post(routes::runs::create))
        .route("/workspaces/:ws/runs/claim", post(routes::runs::claim))
        .route(
            "/workspaces/:ws/runs/:run_id/lease/heartbeat",
            post(routes::runs::heartbeat),
        )
        .route(
            "/workspaces/:ws/runs/:run_id/lease/release",
            post(routes::runs::release),
        )
        .route(
            "/workspaces/:ws/runs/:run_id/complete",
            post(routes::runs::complete),
        )
        .route("/workspaces/:ws/runs/:run_id/fail", post(routes::runs::fail))
        .route("/workspaces/:ws/runs/:run_id", get(routes::runs::get))
        .route(
            "/workspaces/:ws/approvals",
            get(routes::approvals::list),
        )
        .route(
            "/workspaces/:ws/approvals/:approval_id",
            get(routes::approvals::get),
        )
        .route(
            "/workspaces/:ws/approvals/:approval_id/decide",
            post(routes::approvals::decide),
        )
        .route("/workspaces/:ws/egress", post(routes::egress::request))
        .route("/workspaces/:ws/messages", post(routes::messages::create))
        .route(
            "/events/:stream_type/:stream_id",
            get(routes::events::read_stream),
        )
        .route(
            "/events/:stream_type/:stream_id/verify",
            get(routes::events::verify_stream),
        )
        .layer(axum::middleware::from_fn(context_headers))
        .with_state(state)
}
