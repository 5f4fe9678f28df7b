//! Event store contract.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use warden_core::EventId;
use warden_events::{NewEvent, StoredEvent, StreamType};

/// What an append produced.
#[derive(Debug, Clone)]
pub struct AppendOutcome {
    pub event: StoredEvent,
    /// True when an idempotency replay returned the stored original instead
    /// of inserting.
    pub deduplicated: bool,
    /// DLP follow-ups (`event.redacted`, `secret.leaked.detected`) written
    /// in the same transaction.
    pub followups: Vec<StoredEvent>,
}

#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("append rejected: {0}")]
    InvalidAppend(String),

    /// An UPDATE/DELETE reached the event table. Always a bug.
    #[error("append-only violation: {0}")]
    AppendOnlyViolation(String),

    /// Persistent unique-violation on the stream sequence after retry.
    #[error("sequence contention on {stream}: {detail}")]
    SequenceContention { stream: String, detail: String },

    /// The idempotency unique index fired but the stored row could not be
    /// read back. Transient; callers may retry.
    #[error("idempotency conflict unresolved: {0}")]
    IdempotencyConflict(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

/// Row-level record of a redaction performed at append time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedactionLogEntry {
    pub event_id: EventId,
    pub rule_ids: Vec<String>,
    pub masked_previews: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// The append-only event log.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append one event, assigning its per-stream sequence and hash chain
    /// under the stream-head lock. Replays on an idempotency key return the
    /// stored original with `deduplicated = true`.
    async fn append(&self, event: NewEvent) -> Result<AppendOutcome, EventStoreError>;

    /// Events of one stream in strictly ascending `stream_seq`, starting at
    /// `from_seq` (inclusive).
    async fn read_stream(
        &self,
        stream_type: StreamType,
        stream_id: &str,
        from_seq: u64,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Change feed: events after `after_global_seq` in recorded order.
    async fn read_feed(
        &self,
        after_global_seq: u64,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    async fn get_by_id(&self, event_id: &EventId)
        -> Result<Option<StoredEvent>, EventStoreError>;
}

/// An infinite, lazy, restartable cursor over one stream.
///
/// `next()` suspends until the next event in sequence order exists.
pub struct Subscription {
    store: Arc<dyn EventStore>,
    stream_type: StreamType,
    stream_id: String,
    next_seq: u64,
    poll_interval: Duration,
}

impl Subscription {
    pub fn new(
        store: Arc<dyn EventStore>,
        stream_type: StreamType,
        stream_id: impl Into<String>,
        from_seq: u64,
    ) -> Self {
        Self {
            store,
            stream_type,
            stream_id: stream_id.into(),
            next_seq: from_seq.max(1),
            poll_interval: Duration::from_millis(50),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Restart the cursor from a new sequence.
    pub fn restart_from(&mut self, from_seq: u64) {
        self.next_seq = from_seq.max(1);
    }

    /// The next event in sequence order; waits for it to be appended.
    pub async fn next(&mut self) -> Result<StoredEvent, EventStoreError> {
        loop {
            let batch = self
                .store
                .read_stream(self.stream_type, &self.stream_id, self.next_seq, 1)
                .await?;
            if let Some(event) = batch.into_iter().next() {
                self.next_seq = event.stream_seq + 1;
                return Ok(event);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
