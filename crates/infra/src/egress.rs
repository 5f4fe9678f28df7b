//! Egress gateway: every outbound HTTP intent passes the policy gate and
//! leaves a full event trail plus a request-log row.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;
use url::Url;

use warden_core::{
    Actor, AgentId, ApprovalId, CorrelationId, PrincipalId, ReasonCode, TokenId, WorkspaceId,
    Zone,
};
use warden_events::data::{
    ApprovalScope, EgressAllowed, EgressBlocked, EgressRequested, QuotaExceeded,
};
use warden_events::{EventData, StreamRef};
use warden_policy::{
    AuthorizationKind, AuthorizeContext, Decision, EnforcementMode, PolicyGate, PolicyOutcome,
};

use crate::approval::{ApprovalCoordinator, ApprovalError};
use crate::event_store::{EventStore, EventStoreError};
use crate::projections::approvals::ApprovalReadModel;
use crate::projections::store::ReadModelStore;

#[derive(Debug, Error)]
pub enum EgressError {
    #[error("invalid egress target: {0}")]
    InvalidEgressTarget(String),
    #[error("event store failure: {0}")]
    Events(String),
    #[error("policy failure: {0}")]
    Policy(String),
    #[error("approval failure: {0}")]
    Approval(String),
}

impl From<EventStoreError> for EgressError {
    fn from(err: EventStoreError) -> Self {
        Self::Events(err.to_string())
    }
}

impl From<ApprovalError> for EgressError {
    fn from(err: ApprovalError) -> Self {
        Self::Approval(err.to_string())
    }
}

/// An outbound HTTP intent.
#[derive(Debug, Clone)]
pub struct EgressRequest {
    pub workspace_id: WorkspaceId,
    pub action: String,
    pub target_url: String,
    pub method: String,
    pub actor: Actor,
    pub principal_id: Option<PrincipalId>,
    pub agent_id: Option<AgentId>,
    pub capability_token_id: Option<TokenId>,
    pub zone: Option<Zone>,
    pub correlation_id: CorrelationId,
    pub context: JsonValue,
}

impl EgressRequest {
    pub fn new(
        workspace_id: WorkspaceId,
        target_url: impl Into<String>,
        actor: Actor,
        correlation_id: CorrelationId,
    ) -> Self {
        Self {
            workspace_id,
            action: "egress.http".to_string(),
            target_url: target_url.into(),
            method: "GET".to_string(),
            actor,
            principal_id: None,
            agent_id: None,
            capability_token_id: None,
            zone: None,
            correlation_id,
            context: JsonValue::Null,
        }
    }
}

/// Row in the egress request log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EgressLogRow {
    pub workspace_id: WorkspaceId,
    pub correlation_id: CorrelationId,
    pub domain: String,
    pub target_url: String,
    pub method: String,
    pub decision: Decision,
    pub reason_code: ReasonCode,
    pub blocked: bool,
    pub enforcement_mode: EnforcementMode,
    pub approval_id: Option<ApprovalId>,
    pub created_at: DateTime<Utc>,
}

/// Append-only request log owned by the gateway.
#[derive(Debug, Default)]
pub struct EgressLog {
    rows: Mutex<Vec<EgressLogRow>>,
}

impl EgressLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, row: EgressLogRow) {
        if let Ok(mut rows) = self.rows.lock() {
            rows.push(row);
        }
    }

    pub fn rows(&self, workspace_id: &WorkspaceId) -> Vec<EgressLogRow> {
        match self.rows.lock() {
            Ok(rows) => rows
                .iter()
                .filter(|row| &row.workspace_id == workspace_id)
                .cloned()
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

/// What the gateway decided.
#[derive(Debug, Clone)]
pub struct EgressOutcome {
    pub outcome: PolicyOutcome,
    pub domain: String,
    pub approval_id: Option<ApprovalId>,
}

pub struct EgressGateway<S> {
    gate: Arc<PolicyGate>,
    events: Arc<dyn EventStore>,
    approvals: Arc<ApprovalCoordinator<S>>,
    log: Arc<EgressLog>,
}

impl<S> EgressGateway<S>
where
    S: ReadModelStore<ApprovalId, ApprovalReadModel>,
{
    pub fn new(
        gate: Arc<PolicyGate>,
        events: Arc<dyn EventStore>,
        approvals: Arc<ApprovalCoordinator<S>>,
        log: Arc<EgressLog>,
    ) -> Self {
        Self {
            gate,
            events,
            approvals,
            log,
        }
    }

    pub async fn request_egress(
        &self,
        request: EgressRequest,
    ) -> Result<EgressOutcome, EgressError> {
        let domain = validate_target(&request.target_url)?;
        let stream = StreamRef::workspace(&request.workspace_id);

        // 1. Record the intent.
        let requested = EventData::EgressRequested(EgressRequested {
            domain: domain.clone(),
            target_url: request.target_url.clone(),
            method: request.method.clone(),
        });
        self.events
            .append(requested.new_event(
                request.workspace_id.clone(),
                stream.clone(),
                request.actor.clone(),
                request.correlation_id.clone(),
            ))
            .await?;

        // 2. Gate it.
        let mut ctx = AuthorizeContext::new(
            request.workspace_id.clone(),
            request.action.clone(),
            request.actor.clone(),
            request.correlation_id.clone(),
            stream.clone(),
        );
        ctx.principal_id = request.principal_id.clone();
        ctx.agent_id = request.agent_id.clone();
        ctx.capability_token_id = request.capability_token_id.clone();
        ctx.zone = request.zone;
        ctx.egress_domain = Some(domain.clone());
        ctx.context = request.context.clone();

        let outcome = self
            .gate
            .authorize(AuthorizationKind::Egress, &ctx)
            .await
            .map_err(|e| EgressError::Policy(e.to_string()))?;

        // 3. Escalate to a human when asked.
        let approval_id = if outcome.decision == Decision::RequireApproval {
            let (approval_id, _) = self
                .approvals
                .request(
                    &request.workspace_id,
                    &request.action,
                    ApprovalScope::Once,
                    request.actor.clone(),
                    request.correlation_id.clone(),
                    None,
                )
                .await?;
            Some(approval_id)
        } else {
            None
        };

        // 4. Log row.
        self.log.push(EgressLogRow {
            workspace_id: request.workspace_id.clone(),
            correlation_id: request.correlation_id.clone(),
            domain: domain.clone(),
            target_url: request.target_url.clone(),
            method: request.method.clone(),
            decision: outcome.decision,
            reason_code: outcome.reason_code,
            blocked: outcome.blocked,
            enforcement_mode: outcome.enforcement_mode,
            approval_id: approval_id.clone(),
            created_at: Utc::now(),
        });

        // 5. Terminal event (+ quota marker when that is the reason).
        let terminal = if outcome.is_allowed() {
            EventData::EgressAllowed(EgressAllowed {
                domain: domain.clone(),
                target_url: request.target_url.clone(),
                reason_code: outcome.reason_code,
            })
        } else {
            EventData::EgressBlocked(EgressBlocked {
                domain: domain.clone(),
                target_url: request.target_url.clone(),
                reason_code: outcome.reason_code,
            })
        };
        self.events
            .append(terminal.new_event(
                request.workspace_id.clone(),
                stream.clone(),
                request.actor.clone(),
                request.correlation_id.clone(),
            ))
            .await?;

        if outcome.reason_code == ReasonCode::QuotaExceeded {
            let quota = EventData::QuotaExceeded(QuotaExceeded {
                scope: "egress".to_string(),
                domain: Some(domain.clone()),
            });
            self.events
                .append(quota.new_event(
                    request.workspace_id.clone(),
                    stream,
                    request.actor.clone(),
                    request.correlation_id.clone(),
                ))
                .await?;
        }

        Ok(EgressOutcome {
            outcome,
            domain,
            approval_id,
        })
    }
}

/// `http`/`https`, non-empty host; returns the normalized domain.
fn validate_target(target_url: &str) -> Result<String, EgressError> {
    let url = Url::parse(target_url)
        .map_err(|e| EgressError::InvalidEgressTarget(format!("{target_url}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(EgressError::InvalidEgressTarget(format!(
            "unsupported scheme '{}'",
            url.scheme()
        )));
    }
    match url.host_str() {
        Some(host) if !host.is_empty() => Ok(host.to_ascii_lowercase()),
        _ => Err(EgressError::InvalidEgressTarget(
            "missing host".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_target_accepts_http_and_https() {
        assert_eq!(
            validate_target("https://Api.Example.COM/v1/x").unwrap(),
            "api.example.com"
        );
        assert_eq!(validate_target("http://localhost:8080/").unwrap(), "localhost");
    }

    #[test]
    fn validate_target_rejects_bad_urls() {
        assert!(matches!(
            validate_target("ftp://example.com/file"),
            Err(EgressError::InvalidEgressTarget(_))
        ));
        assert!(matches!(
            validate_target("not a url"),
            Err(EgressError::InvalidEgressTarget(_))
        ));
        assert!(matches!(
            validate_target("file:///etc/passwd"),
            Err(EgressError::InvalidEgressTarget(_))
        ));
    }
}
