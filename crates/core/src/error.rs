//! Domain error model and the shared reason-code vocabulary.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic, business/domain failures (validation,
/// invariants, conflicts). Infrastructure concerns belong elsewhere.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A domain invariant was violated.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A requested resource was not found (domain-level).
    #[error("not found")]
    NotFound,

    /// A conflict occurred (e.g. stale version / optimistic concurrency).
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found() -> Self {
        Self::NotFound
    }
}

/// Machine-readable reason codes surfaced to callers on gated decisions.
///
/// These travel in events, projection rows, HTTP error bodies and the
/// learning ledger, so the wire form is the snake_case string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    DefaultAllow,
    KillSwitchActive,
    ZoneInsufficient,
    CapabilityMissing,
    ExternalWriteRequiresApproval,
    ConstraintLearnedBlock,
    EgressDomainBlocked,
    QuotaExceeded,
    RateLimited,
    ApprovalNotOpen,
    LeaseLost,
    LockLost,
    AutomationInternalError,
}

impl ReasonCode {
    /// Wire representation (matches the serde form).
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::DefaultAllow => "default_allow",
            ReasonCode::KillSwitchActive => "kill_switch_active",
            ReasonCode::ZoneInsufficient => "zone_insufficient",
            ReasonCode::CapabilityMissing => "capability_missing",
            ReasonCode::ExternalWriteRequiresApproval => "external_write_requires_approval",
            ReasonCode::ConstraintLearnedBlock => "constraint_learned_block",
            ReasonCode::EgressDomainBlocked => "egress_domain_blocked",
            ReasonCode::QuotaExceeded => "quota_exceeded",
            ReasonCode::RateLimited => "rate_limited",
            ReasonCode::ApprovalNotOpen => "approval_not_open",
            ReasonCode::LeaseLost => "lease_lost",
            ReasonCode::LockLost => "lock_lost",
            ReasonCode::AutomationInternalError => "automation_internal_error",
        }
    }
}

impl core::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A contract violation surfaced to the caller with a reason code.
///
/// Retryable violations (rate limits) carry `retry_after_sec`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("contract violation: {reason}")]
pub struct ContractViolation {
    pub reason: ReasonCode,
    pub detail: Option<String>,
    pub retry_after_sec: Option<u64>,
}

impl ContractViolation {
    pub fn new(reason: ReasonCode) -> Self {
        Self {
            reason,
            detail: None,
            retry_after_sec: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_retry_after(mut self, secs: u64) -> Self {
        self.retry_after_sec = Some(secs);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_codes_serialize_snake_case() {
        let json = serde_json::to_string(&ReasonCode::ExternalWriteRequiresApproval).unwrap();
        assert_eq!(json, "\"external_write_requires_approval\"");

        let back: ReasonCode = serde_json::from_str("\"rate_limited\"").unwrap();
        assert_eq!(back, ReasonCode::RateLimited);
        assert_eq!(back.as_str(), "rate_limited");
    }

    #[test]
    fn contract_violation_carries_retry_after() {
        let v = ContractViolation::new(ReasonCode::RateLimited).with_retry_after(42);
        assert_eq!(v.retry_after_sec, Some(42));
        assert_eq!(v.to_string(), "contract violation: rate_limited");
    }
}
