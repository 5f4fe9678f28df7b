//! Policy: capability tokens, the action registry, the gate, and the
//! learning ledger that turns denials into constraints.

pub mod capability;
pub mod gate;
pub mod learning;
pub mod registry;

pub use capability::{
    CapabilityToken, InMemoryTokenStore, PolicyStoreError, Scopes, TokenStore,
    MAX_DELEGATION_DEPTH,
};
pub use gate::{
    ApprovalLookup, AuthorizationKind, AuthorizeContext, DataAccessKind, Decision,
    EgressQuotaProbe, InMemoryQuotaProbe, NoApprovals, PolicyGate, PolicyGateConfig,
    PolicyOutcome,
};
pub use learning::{
    context_hash, pattern_hash, sanitize_context, Constraint, ConstraintStore,
    InMemoryConstraintStore, LearningLedger,
};
pub use registry::{ActionRegistry, ActionSpec, CostImpact, EnforcementMode, RecoveryDifficulty};
