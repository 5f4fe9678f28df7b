//! Leases: the cron leader lock, the background heartbeat worker, and the
//! run claim protocol. All writes are fenced by an opaque token; a stale
//! token never wins a conditional update.

pub mod cron_lock;
pub mod heartbeat;
pub mod run_lease;

pub use cron_lock::{CronLockStore, InMemoryCronLockStore, LeaseError, PgCronLockStore};
pub use heartbeat::{HeartbeatHandle, HeartbeatWorker};
pub use run_lease::{
    ClaimedRun, InMemoryRunLeaseStore, PgRunLeaseStore, RunAttempt, RunLeaseManager,
    RunLeaseStore,
};
