//! HTTP surface: request-scoped endpoints for runs, approvals, egress,
//! messages and event reads, plus the boot wiring for the control plane.

pub mod app;
pub mod auth;
pub mod errors;
pub mod middleware;
pub mod routes;
pub mod state;

pub use app::build_app;
pub use state::AppState;
