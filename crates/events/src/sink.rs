//! Minimal append seam for components that only emit events.
//!
//! The policy gate, the learning ledger and the automation loop need to
//! append events without depending on the storage crate. They hold an
//! `Arc<dyn EventSink>`; both event-store implementations satisfy it.

use async_trait::async_trait;
use thiserror::Error;

use crate::envelope::{NewEvent, StoredEvent};

#[derive(Debug, Error, Clone)]
pub enum SinkError {
    #[error("append rejected: {0}")]
    Rejected(String),
    #[error("storage failure: {0}")]
    Storage(String),
}

/// Append-only access to the event log.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Append one event.
    ///
    /// Idempotent replays (same stream + idempotency key) succeed and return
    /// the stored original.
    async fn append(&self, event: NewEvent) -> Result<StoredEvent, SinkError>;
}
