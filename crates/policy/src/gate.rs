//! The policy gate: single entry point for authorizing tool calls, data
//! access, egress and generic actions.
//!
//! Evaluation short-circuits in a fixed order: kill switch, registry zone,
//! capability resolution, high-stakes approval gating, learned constraints,
//! egress allowlist/quota, default allow. Non-allow outcomes emit a policy
//! event and feed the learning ledger. In `shadow` enforcement the decision
//! is recorded but `blocked = false` and the action proceeds.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

use warden_core::{
    Actor, AgentId, ApprovalId, CorrelationId, PrincipalId, ReasonCode, RoomId, SubjectKey,
    TokenId, WorkspaceId, Zone,
};
use warden_events::data::{PolicyDenied, PolicyRequiresApproval};
use warden_events::{EventData, EventSink, StreamRef};

use crate::capability::{resolve_effective_scopes, PolicyStoreError, TokenStore};
use crate::learning::{context_hash, sanitize_context, FailureObservation, LearningLedger};
use crate::registry::{ActionRegistry, ActionSpec, EnforcementMode};

/// What kind of thing is being authorized.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum AuthorizationKind {
    ToolCall,
    DataAccess,
    Egress,
    Action,
}

impl AuthorizationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthorizationKind::ToolCall => "tool_call",
            AuthorizationKind::DataAccess => "data_access",
            AuthorizationKind::Egress => "egress",
            AuthorizationKind::Action => "action",
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DataAccessKind {
    Read,
    Write,
}

/// Everything the gate needs to evaluate one request.
#[derive(Debug, Clone)]
pub struct AuthorizeContext {
    pub workspace_id: WorkspaceId,
    pub action: String,
    pub actor: Actor,
    pub principal_id: Option<PrincipalId>,
    pub agent_id: Option<AgentId>,
    pub capability_token_id: Option<TokenId>,
    pub zone: Option<Zone>,
    pub correlation_id: CorrelationId,
    /// Stream policy events are appended to.
    pub stream: StreamRef,
    pub room_id: Option<RoomId>,
    pub tool: Option<String>,
    pub egress_domain: Option<String>,
    pub data_access: Option<DataAccessKind>,
    pub context: JsonValue,
}

impl AuthorizeContext {
    pub fn new(
        workspace_id: WorkspaceId,
        action: impl Into<String>,
        actor: Actor,
        correlation_id: CorrelationId,
        stream: StreamRef,
    ) -> Self {
        Self {
            workspace_id,
            action: action.into(),
            actor,
            principal_id: None,
            agent_id: None,
            capability_token_id: None,
            zone: None,
            correlation_id,
            stream,
            room_id: None,
            tool: None,
            egress_domain: None,
            data_access: None,
            context: JsonValue::Null,
        }
    }

    pub fn subject_key(&self) -> SubjectKey {
        SubjectKey::resolve(self.agent_id.as_ref(), self.principal_id.as_ref(), &self.actor)
    }

    /// The request shape the learning ledger fingerprints: the concrete
    /// facets exercised plus the caller-supplied context.
    pub fn facets(&self) -> JsonValue {
        serde_json::json!({
            "room": self.room_id,
            "tool": self.tool,
            "egress_domain": self.egress_domain,
            "data_access": self.data_access.map(|d| match d {
                DataAccessKind::Read => "read",
                DataAccessKind::Write => "write",
            }),
            "context": self.context,
        })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
    RequireApproval,
}

/// The gate's verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyOutcome {
    pub decision: Decision,
    pub reason_code: ReasonCode,
    pub reason: Option<String>,
    /// False under shadow enforcement even when the decision is non-allow.
    pub blocked: bool,
    pub enforcement_mode: EnforcementMode,
}

impl PolicyOutcome {
    fn allow(enforcement_mode: EnforcementMode) -> Self {
        Self {
            decision: Decision::Allow,
            reason_code: ReasonCode::DefaultAllow,
            reason: None,
            blocked: false,
            enforcement_mode,
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.decision == Decision::Allow || !self.blocked
    }
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error(transparent)]
    Store(#[from] PolicyStoreError),
}

/// Read-side view of approvals the gate needs.
#[async_trait]
pub trait ApprovalLookup: Send + Sync {
    /// An approved approval bound to this correlation id, if any.
    async fn approved_for_correlation(
        &self,
        workspace_id: &WorkspaceId,
        correlation_id: &CorrelationId,
    ) -> Result<Option<ApprovalId>, PolicyStoreError>;
}

/// Stub lookup that never finds an approval.
#[derive(Debug, Default)]
pub struct NoApprovals;

#[async_trait]
impl ApprovalLookup for NoApprovals {
    async fn approved_for_correlation(
        &self,
        _workspace_id: &WorkspaceId,
        _correlation_id: &CorrelationId,
    ) -> Result<Option<ApprovalId>, PolicyStoreError> {
        Ok(None)
    }
}

/// Egress volume probe: returns false once the quota is spent.
#[async_trait]
pub trait EgressQuotaProbe: Send + Sync {
    async fn admit(
        &self,
        workspace_id: &WorkspaceId,
        domain: &str,
    ) -> Result<bool, PolicyStoreError>;
}

/// Counting probe with a fixed per-workspace/domain budget.
#[derive(Debug)]
pub struct InMemoryQuotaProbe {
    limit: u64,
    counts: std::sync::RwLock<std::collections::HashMap<(WorkspaceId, String), u64>>,
}

impl InMemoryQuotaProbe {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            counts: std::sync::RwLock::new(std::collections::HashMap::new()),
        }
    }

    /// A probe that never exhausts.
    pub fn unlimited() -> Self {
        Self::new(u64::MAX)
    }
}

#[async_trait]
impl EgressQuotaProbe for InMemoryQuotaProbe {
    async fn admit(
        &self,
        workspace_id: &WorkspaceId,
        domain: &str,
    ) -> Result<bool, PolicyStoreError> {
        let mut counts = self
            .counts
            .write()
            .map_err(|_| PolicyStoreError::Storage("lock poisoned".to_string()))?;
        let count = counts
            .entry((workspace_id.clone(), domain.to_string()))
            .or_insert(0);
        *count += 1;
        Ok(*count <= self.limit)
    }
}

/// Gate-wide knobs resolved at boot.
#[derive(Debug, Clone, Default)]
pub struct PolicyGateConfig {
    /// Emergency stop: every request denies with `kill_switch_active`.
    pub kill_switch: bool,
    /// Workspaces evaluated in shadow mode regardless of registry metadata.
    pub shadow_workspaces: BTreeSet<WorkspaceId>,
    /// Allowed egress domains; `None` means no allowlist.
    pub egress_allowlist: Option<BTreeSet<String>>,
}

pub struct PolicyGate {
    registry: ActionRegistry,
    tokens: Arc<dyn TokenStore>,
    approvals: Arc<dyn ApprovalLookup>,
    quota: Arc<dyn EgressQuotaProbe>,
    ledger: LearningLedger,
    sink: Arc<dyn EventSink>,
    config: PolicyGateConfig,
}

impl PolicyGate {
    pub fn new(
        registry: ActionRegistry,
        tokens: Arc<dyn TokenStore>,
        approvals: Arc<dyn ApprovalLookup>,
        quota: Arc<dyn EgressQuotaProbe>,
        ledger: LearningLedger,
        sink: Arc<dyn EventSink>,
        config: PolicyGateConfig,
    ) -> Self {
        Self {
            registry,
            tokens,
            approvals,
            quota,
            ledger,
            sink,
            config,
        }
    }

    /// Evaluate one request and record the outcome.
    pub async fn authorize(
        &self,
        kind: AuthorizationKind,
        ctx: &AuthorizeContext,
    ) -> Result<PolicyOutcome, PolicyError> {
        let spec = self.registry.resolve(&ctx.action);
        let enforcement = self.enforcement_for(&spec, &ctx.workspace_id);

        let verdict = self.evaluate(kind, ctx, &spec).await?;

        let outcome = match verdict {
            Verdict::Allow => PolicyOutcome::allow(enforcement),
            Verdict::NonAllow {
                decision,
                reason_code,
                reason,
            } => {
                let blocked =
                    decision != Decision::Allow && enforcement == EnforcementMode::Enforce;
                let outcome = PolicyOutcome {
                    decision,
                    reason_code,
                    reason,
                    blocked,
                    enforcement_mode: enforcement,
                };
                self.record_non_allow(kind, ctx, &outcome).await;
                outcome
            }
        };

        debug!(
            kind = kind.as_str(),
            action = %ctx.action,
            decision = ?outcome.decision,
            reason = %outcome.reason_code,
            blocked = outcome.blocked,
            "policy decision"
        );
        Ok(outcome)
    }

    fn enforcement_for(&self, spec: &ActionSpec, workspace_id: &WorkspaceId) -> EnforcementMode {
        if self.config.shadow_workspaces.contains(workspace_id) {
            EnforcementMode::Shadow
        } else {
            spec.enforcement
        }
    }

    async fn evaluate(
        &self,
        kind: AuthorizationKind,
        ctx: &AuthorizeContext,
        spec: &ActionSpec,
    ) -> Result<Verdict, PolicyError> {
        // 1. Kill switch.
        if self.config.kill_switch {
            return Ok(Verdict::deny(ReasonCode::KillSwitchActive, None));
        }

        // 2. Zone gate from the registry.
        let zone = ctx.zone.unwrap_or_default();
        if !zone.satisfies(spec.zone_required) {
            return Ok(Verdict::deny(
                ReasonCode::ZoneInsufficient,
                Some(format!(
                    "action '{}' requires zone {}, request is {}",
                    ctx.action, spec.zone_required, zone
                )),
            ));
        }

        // 3. Capability resolution.
        if let Some(token_id) = &ctx.capability_token_id {
            let scopes =
                resolve_effective_scopes(&*self.tokens, &ctx.workspace_id, token_id, Utc::now())
                    .await?;
            let Some(scopes) = scopes else {
                return Ok(Verdict::deny(
                    ReasonCode::CapabilityMissing,
                    Some("capability token missing, expired or revoked".to_string()),
                ));
            };
            if let Some(reason) = scope_gap(kind, ctx, &scopes) {
                return Ok(Verdict::deny(ReasonCode::CapabilityMissing, Some(reason)));
            }
        } else if spec.zone_required >= Zone::Supervised {
            // Gated actions require a capability; sandbox ones do not.
            return Ok(Verdict::deny(
                ReasonCode::CapabilityMissing,
                Some(format!("action '{}' requires a capability token", ctx.action)),
            ));
        }

        // 4. High-stakes pre-approval bound to this correlation.
        if spec.requires_pre_approval {
            let approved = self
                .approvals
                .approved_for_correlation(&ctx.workspace_id, &ctx.correlation_id)
                .await?;
            if approved.is_none() {
                return Ok(Verdict::non_allow(
                    Decision::RequireApproval,
                    ReasonCode::ExternalWriteRequiresApproval,
                    None,
                ));
            }
        }

        // 5. Learned constraints (bypassed by a supplied approval).
        let subject = ctx.subject_key();
        let category = kind.as_str();
        let shape = context_hash(category, &ctx.action, &sanitize_context(&ctx.facets()));
        if let Some(constraint) = self
            .ledger_store_find(ctx, category, &subject, &shape)
            .await?
        {
            let approved = self
                .approvals
                .approved_for_correlation(&ctx.workspace_id, &ctx.correlation_id)
                .await?;
            if approved.is_none() {
                return Ok(Verdict::deny(
                    ReasonCode::ConstraintLearnedBlock,
                    Some(format!(
                        "constraint learned from {} prior denial(s)",
                        constraint.seen_count
                    )),
                ));
            }
        }

        // 6. Egress allowlist + quota.
        if kind == AuthorizationKind::Egress {
            let domain = ctx.egress_domain.as_deref().unwrap_or("");
            if let Some(allowlist) = &self.config.egress_allowlist {
                if !allowlist.contains(domain) {
                    return Ok(Verdict::deny(
                        ReasonCode::EgressDomainBlocked,
                        Some(format!("domain '{domain}' is not allowlisted")),
                    ));
                }
            }
            if !self.quota.admit(&ctx.workspace_id, domain).await? {
                return Ok(Verdict::deny(ReasonCode::QuotaExceeded, None));
            }
        }

        // 7. Default allow.
        Ok(Verdict::Allow)
    }

    async fn ledger_store_find(
        &self,
        ctx: &AuthorizeContext,
        category: &str,
        subject: &SubjectKey,
        context_hash: &str,
    ) -> Result<Option<crate::learning::Constraint>, PolicyError> {
        Ok(self
            .ledger
            .store()
            .find_live(&ctx.workspace_id, subject, category, context_hash)
            .await?)
    }

    async fn record_non_allow(
        &self,
        kind: AuthorizationKind,
        ctx: &AuthorizeContext,
        outcome: &PolicyOutcome,
    ) {
        let data = match outcome.decision {
            Decision::RequireApproval => EventData::PolicyRequiresApproval(PolicyRequiresApproval {
                kind: kind.as_str().to_string(),
                action: ctx.action.clone(),
                reason_code: outcome.reason_code,
                approval_id: None,
            }),
            _ => EventData::PolicyDenied(PolicyDenied {
                kind: kind.as_str().to_string(),
                action: ctx.action.clone(),
                reason_code: outcome.reason_code,
                blocked: outcome.blocked,
            }),
        };

        let event = data.new_event(
            ctx.workspace_id.clone(),
            ctx.stream.clone(),
            ctx.actor.clone(),
            ctx.correlation_id.clone(),
        );
        if let Err(err) = self.sink.append(event).await {
            warn!(error = %err, "failed to append policy decision event");
        }

        let observation = FailureObservation {
            workspace_id: ctx.workspace_id.clone(),
            subject_key: ctx.subject_key(),
            category: kind.as_str().to_string(),
            action: ctx.action.clone(),
            reason_code: outcome.reason_code,
            blocked: outcome.blocked,
            // Fingerprint the full request shape, so a different domain or
            // tool under the same action is a different pattern.
            context: ctx.facets(),
            actor: ctx.actor.clone(),
            correlation_id: ctx.correlation_id.clone(),
            stream: ctx.stream.clone(),
        };
        if let Err(err) = self.ledger.record_failure(observation).await {
            warn!(error = %err, "learning ledger update failed");
        }
    }
}

/// Which concrete scope the request exercises but the token lacks.
fn scope_gap(
    kind: AuthorizationKind,
    ctx: &AuthorizeContext,
    scopes: &crate::capability::Scopes,
) -> Option<String> {
    if !scopes.allows_action(&ctx.action) {
        return Some(format!("scope lacks action_type '{}'", ctx.action));
    }
    if let Some(room) = &ctx.room_id {
        if !scopes.allows_room(room.as_str()) {
            return Some(format!("scope lacks room '{room}'"));
        }
    }
    if let Some(tool) = &ctx.tool {
        if !scopes.allows_tool(tool) {
            return Some(format!("scope lacks tool '{tool}'"));
        }
    }
    if kind == AuthorizationKind::Egress {
        if let Some(domain) = &ctx.egress_domain {
            if !scopes.allows_egress_domain(domain) {
                return Some(format!("scope lacks egress domain '{domain}'"));
            }
        }
    }
    match ctx.data_access {
        Some(DataAccessKind::Read) if !scopes.data_read => {
            Some("scope lacks data read access".to_string())
        }
        Some(DataAccessKind::Write) if !scopes.data_write => {
            Some("scope lacks data write access".to_string())
        }
        _ => None,
    }
}

enum Verdict {
    Allow,
    NonAllow {
        decision: Decision,
        reason_code: ReasonCode,
        reason: Option<String>,
    },
}

impl Verdict {
    fn deny(reason_code: ReasonCode, reason: Option<String>) -> Self {
        Self::NonAllow {
            decision: Decision::Deny,
            reason_code,
            reason,
        }
    }

    fn non_allow(decision: Decision, reason_code: ReasonCode, reason: Option<String>) -> Self {
        Self::NonAllow {
            decision,
            reason_code,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CapabilityToken, InMemoryTokenStore, Scopes};
    use crate::learning::InMemoryConstraintStore;
    use std::sync::Mutex;
    use warden_events::{NewEvent, SinkError, StoredEvent};

    /// Sink that records appended envelopes for assertions.
    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<NewEvent>>,
    }

    impl RecordingSink {
        fn event_types(&self) -> Vec<String> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .map(|e| e.event_type.clone())
                .collect()
        }
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn append(&self, event: NewEvent) -> Result<StoredEvent, SinkError> {
            let stored =
                StoredEvent::from_new(event.clone(), 1, 1, Utc::now());
            self.events.lock().unwrap().push(event);
            Ok(stored)
        }
    }

    struct Fixture {
        gate: PolicyGate,
        sink: Arc<RecordingSink>,
        tokens: Arc<InMemoryTokenStore>,
        ws: WorkspaceId,
    }

    fn fixture(config: PolicyGateConfig) -> Fixture {
        let sink = Arc::new(RecordingSink::default());
        let tokens = Arc::new(InMemoryTokenStore::new());
        let constraints = Arc::new(InMemoryConstraintStore::new());
        let ledger = LearningLedger::new(constraints, sink.clone());
        let gate = PolicyGate::new(
            ActionRegistry::seeded(),
            tokens.clone(),
            Arc::new(NoApprovals),
            Arc::new(InMemoryQuotaProbe::unlimited()),
            ledger,
            sink.clone(),
            config,
        );
        Fixture {
            gate,
            sink,
            tokens,
            ws: WorkspaceId::new(),
        }
    }

    fn ctx(f: &Fixture, action: &str) -> AuthorizeContext {
        AuthorizeContext::new(
            f.ws.clone(),
            action,
            Actor::agent("agent-1"),
            CorrelationId::new(),
            StreamRef::workspace(&f.ws),
        )
    }

    async fn root_token(f: &Fixture) -> TokenId {
        let token = CapabilityToken {
            token_id: TokenId::new(),
            workspace_id: f.ws.clone(),
            issued_to_principal_id: PrincipalId::new(),
            granted_by_principal_id: PrincipalId::new(),
            parent_token_id: None,
            scopes: Scopes::all(),
            valid_until: None,
            revoked_at: None,
        };
        let id = token.token_id.clone();
        f.tokens.insert(token).await.unwrap();
        id
    }

    #[tokio::test]
    async fn sandbox_action_allows_by_default() {
        let f = fixture(PolicyGateConfig::default());
        let outcome = f
            .gate
            .authorize(AuthorizationKind::ToolCall, &ctx(&f, "tool.invoke"))
            .await
            .unwrap();
        assert_eq!(outcome.decision, Decision::Allow);
        assert_eq!(outcome.reason_code, ReasonCode::DefaultAllow);
        assert!(!outcome.blocked);
        assert!(f.sink.event_types().is_empty());
    }

    #[tokio::test]
    async fn kill_switch_denies_everything() {
        let f = fixture(PolicyGateConfig {
            kill_switch: true,
            ..Default::default()
        });
        let outcome = f
            .gate
            .authorize(AuthorizationKind::ToolCall, &ctx(&f, "tool.invoke"))
            .await
            .unwrap();
        assert_eq!(outcome.decision, Decision::Deny);
        assert_eq!(outcome.reason_code, ReasonCode::KillSwitchActive);
        assert!(outcome.blocked);
    }

    #[tokio::test]
    async fn zone_gate_denies_low_zone() {
        let f = fixture(PolicyGateConfig::default());
        let mut c = ctx(&f, "data.write");
        c.zone = Some(Zone::Sandbox);
        c.capability_token_id = Some(root_token(&f).await);

        let outcome = f
            .gate
            .authorize(AuthorizationKind::DataAccess, &c)
            .await
            .unwrap();
        assert_eq!(outcome.reason_code, ReasonCode::ZoneInsufficient);
        assert!(f.sink.event_types().contains(&"policy.denied".to_string()));
    }

    #[tokio::test]
    async fn gated_action_without_token_is_capability_missing() {
        let f = fixture(PolicyGateConfig::default());
        let mut c = ctx(&f, "data.write");
        c.zone = Some(Zone::Supervised);

        let outcome = f
            .gate
            .authorize(AuthorizationKind::DataAccess, &c)
            .await
            .unwrap();
        assert_eq!(outcome.reason_code, ReasonCode::CapabilityMissing);
    }

    #[tokio::test]
    async fn high_stakes_requires_approval() {
        let f = fixture(PolicyGateConfig::default());
        let mut c = ctx(&f, "external.write");
        c.zone = Some(Zone::HighStakes);
        c.capability_token_id = Some(root_token(&f).await);

        let outcome = f
            .gate
            .authorize(AuthorizationKind::Action, &c)
            .await
            .unwrap();
        assert_eq!(outcome.decision, Decision::RequireApproval);
        assert_eq!(
            outcome.reason_code,
            ReasonCode::ExternalWriteRequiresApproval
        );
        assert!(f
            .sink
            .event_types()
            .contains(&"policy.requires_approval".to_string()));
    }

    #[tokio::test]
    async fn repeat_denial_emits_mistake_repeated() {
        let f = fixture(PolicyGateConfig::default());
        let mut c = ctx(&f, "external.write");
        c.zone = Some(Zone::HighStakes);
        c.capability_token_id = Some(root_token(&f).await);

        f.gate
            .authorize(AuthorizationKind::Action, &c)
            .await
            .unwrap();
        f.gate
            .authorize(AuthorizationKind::Action, &c)
            .await
            .unwrap();

        let types = f.sink.event_types();
        assert_eq!(
            types
                .iter()
                .filter(|t| *t == "learning.from_failure")
                .count(),
            2
        );
        assert_eq!(
            types.iter().filter(|t| *t == "constraint.learned").count(),
            2
        );
        assert_eq!(
            types.iter().filter(|t| *t == "mistake.repeated").count(),
            1
        );
    }

    #[tokio::test]
    async fn egress_allowlist_blocks_unknown_domain() {
        let f = fixture(PolicyGateConfig {
            egress_allowlist: Some(BTreeSet::from(["api.example.com".to_string()])),
            ..Default::default()
        });
        let token = root_token(&f).await;

        let mut c = ctx(&f, "egress.http");
        c.zone = Some(Zone::Supervised);
        c.capability_token_id = Some(token.clone());
        c.egress_domain = Some("evil.example.net".to_string());

        let outcome = f.gate.authorize(AuthorizationKind::Egress, &c).await.unwrap();
        assert_eq!(outcome.reason_code, ReasonCode::EgressDomainBlocked);

        c.egress_domain = Some("api.example.com".to_string());
        let outcome = f.gate.authorize(AuthorizationKind::Egress, &c).await.unwrap();
        assert_eq!(outcome.decision, Decision::Allow);
    }

    #[tokio::test]
    async fn learned_constraint_blocks_identical_repeat() {
        let f = fixture(PolicyGateConfig {
            egress_allowlist: Some(BTreeSet::from(["api.example.com".to_string()])),
            ..Default::default()
        });
        let token = root_token(&f).await;

        let mut c = ctx(&f, "egress.http");
        c.zone = Some(Zone::Supervised);
        c.capability_token_id = Some(token);
        c.egress_domain = Some("evil.example.net".to_string());

        // First attempt learns the pattern at the allowlist.
        let outcome = f.gate.authorize(AuthorizationKind::Egress, &c).await.unwrap();
        assert_eq!(outcome.reason_code, ReasonCode::EgressDomainBlocked);

        // The identical retry trips the learned constraint first.
        let outcome = f.gate.authorize(AuthorizationKind::Egress, &c).await.unwrap();
        assert_eq!(outcome.reason_code, ReasonCode::ConstraintLearnedBlock);

        // A different domain is a different shape: judged on its own.
        c.egress_domain = Some("api.example.com".to_string());
        let outcome = f.gate.authorize(AuthorizationKind::Egress, &c).await.unwrap();
        assert_eq!(outcome.decision, Decision::Allow);
    }

    #[tokio::test]
    async fn egress_quota_exhausts() {
        let sink = Arc::new(RecordingSink::default());
        let tokens = Arc::new(InMemoryTokenStore::new());
        let constraints = Arc::new(InMemoryConstraintStore::new());
        let ledger = LearningLedger::new(constraints, sink.clone());
        let gate = PolicyGate::new(
            ActionRegistry::seeded(),
            tokens.clone(),
            Arc::new(NoApprovals),
            Arc::new(InMemoryQuotaProbe::new(2)),
            ledger,
            sink.clone(),
            PolicyGateConfig::default(),
        );
        let f = Fixture {
            gate,
            sink,
            tokens,
            ws: WorkspaceId::new(),
        };
        let token = root_token(&f).await;

        let mut c = ctx(&f, "egress.http");
        c.zone = Some(Zone::Supervised);
        c.capability_token_id = Some(token);
        c.egress_domain = Some("api.example.com".to_string());

        for _ in 0..2 {
            let outcome = f.gate.authorize(AuthorizationKind::Egress, &c).await.unwrap();
            assert_eq!(outcome.decision, Decision::Allow);
        }
        let outcome = f.gate.authorize(AuthorizationKind::Egress, &c).await.unwrap();
        assert_eq!(outcome.reason_code, ReasonCode::QuotaExceeded);
    }

    #[tokio::test]
    async fn shadow_workspace_records_without_blocking() {
        let ws = WorkspaceId::new();
        let f = {
            let mut f = fixture(PolicyGateConfig {
                shadow_workspaces: BTreeSet::from([ws.clone()]),
                ..Default::default()
            });
            f.ws = ws;
            f
        };
        let mut c = ctx(&f, "data.write");
        c.zone = Some(Zone::Sandbox);

        let outcome = f
            .gate
            .authorize(AuthorizationKind::DataAccess, &c)
            .await
            .unwrap();
        assert_eq!(outcome.decision, Decision::Deny);
        assert!(!outcome.blocked);
        assert_eq!(outcome.enforcement_mode, EnforcementMode::Shadow);
        assert!(outcome.is_allowed());
        // Decision is still recorded.
        assert!(f.sink.event_types().contains(&"policy.denied".to_string()));
    }

    #[tokio::test]
    async fn narrow_token_scope_is_enforced() {
        let f = fixture(PolicyGateConfig::default());
        let token = CapabilityToken {
            token_id: TokenId::new(),
            workspace_id: f.ws.clone(),
            issued_to_principal_id: PrincipalId::new(),
            granted_by_principal_id: PrincipalId::new(),
            parent_token_id: None,
            scopes: Scopes {
                action_types: BTreeSet::from(["message.post".to_string()]),
                ..Scopes::default()
            },
            valid_until: None,
            revoked_at: None,
        };
        let token_id = token.token_id.clone();
        f.tokens.insert(token).await.unwrap();

        let mut c = ctx(&f, "tool.invoke");
        c.capability_token_id = Some(token_id);

        let outcome = f
            .gate
            .authorize(AuthorizationKind::ToolCall, &c)
            .await
            .unwrap();
        assert_eq!(outcome.reason_code, ReasonCode::CapabilityMissing);
    }
}
