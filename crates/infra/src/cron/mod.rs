//! The cron runtime: leader-elected, jittered, watchdog-guarded sweeps.

pub mod health;
pub mod runtime;
pub mod sweeps;

pub use health::{CronHealth, CronHealthStore, InMemoryCronHealthStore};
pub use runtime::{window_anchor, HeartCron, TickReport, SYSTEM_WORKSPACE};
pub use sweeps::{
    ApprovalTimeoutSweep, CandidateGuard, CandidateLock, DemotedStaleSweep,
    InMemoryCandidateLocks, InMemoryWorkspaceDirectory, PgCandidateLocks, RunStuckSweep, Sweep,
    SweepError, SweepOutcome, WorkspaceDirectory,
};
