//! Read models driven from the event log.
//!
//! Each projection owns its rows exclusively. Application is idempotent
//! (applied-events guard) and watermarked (`last_event_occurred_at` per
//! row), so replays and out-of-order deliveries converge.

pub mod applied;
pub mod approvals;
pub mod egress_log;
pub mod engine;
pub mod incidents;
pub mod lifecycle;
pub mod messages;
pub mod runs;
pub mod scorecards;
pub mod store;
pub mod tool_calls;

pub use applied::{DeadLetter, InMemoryProjectorBookkeeping, ProjectorBookkeeping};
pub use approvals::{ApprovalReadModel, ApprovalStatus, ApprovalsProjection, ApprovalsReadView};
pub use egress_log::{EgressProjection, EgressReadModel};
pub use engine::{ProjectionError, Projector, ProjectorEngine, ProjectorRetry};
pub use incidents::{IncidentReadModel, IncidentStatus, IncidentsProjection};
pub use lifecycle::{LifecycleProjection, LifecycleReadModel};
pub use messages::{MessageReadModel, MessagesProjection};
pub use runs::{RunReadModel, RunStatus, RunsProjection};
pub use scorecards::{ScorecardReadModel, ScorecardsProjection};
pub use store::{InMemoryReadModelStore, ReadModelStore};
pub use tool_calls::{ToolCallReadModel, ToolCallsProjection};
