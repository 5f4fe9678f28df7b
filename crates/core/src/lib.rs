//! Core domain: identifiers, zones, actors, reason codes.

pub mod actor;
pub mod error;
pub mod id;
pub mod lifecycle;
pub mod zone;

pub use actor::{Actor, ActorType, SubjectKey};
pub use error::{ContractViolation, DomainError, DomainResult, ReasonCode};
pub use id::{
    AgentId, ApprovalId, CorrelationId, EventId, IncidentId, MissionId, PrincipalId, RoomId,
    RunId, StepId, ThreadId, TokenId, WorkspaceId,
};
pub use lifecycle::LifecycleState;
pub use zone::Zone;
