//! The append-only event store: trait, Postgres implementation, in-memory
//! twin for tests/dev, and the change-feed subscription handle.

pub mod in_memory;
pub mod postgres;
mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use r#trait::{
    AppendOutcome, EventStore, EventStoreError, RedactionLogEntry, Subscription,
};
