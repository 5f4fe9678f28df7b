//! Route handlers.

pub mod approvals;
pub mod egress;
pub mod events;
pub mod messages;
pub mod runs;
pub mod system;

use std::str::FromStr;

use warden_core::WorkspaceId;

use crate::errors::ApiError;

pub(crate) fn parse_workspace(raw: &str) -> Result<WorkspaceId, ApiError> {
    WorkspaceId::from_str(raw).map_err(|e| ApiError::BadRequest(e.to_string()))
}
