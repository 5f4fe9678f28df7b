//! Event envelopes, canonical serialization, hash chaining and DLP.
//!
//! This crate owns the shapes that cross every component boundary: the
//! append-side [`NewEvent`], the persisted [`StoredEvent`], the typed event
//! catalog [`EventData`], plus the pure machinery the stores share:
//! canonical JSON, the SHA-256 hash chain, and the secret scanner.

pub mod canonical;
pub mod chain;
pub mod data;
pub mod dlp;
pub mod envelope;
pub mod sink;

pub use canonical::canonical_json;
pub use chain::{compute_event_hash, verify_slice, ChainFault, ChainFaultKind};
pub use data::EventData;
pub use dlp::{DlpScan, DlpScanner};
pub use envelope::{
    EventScope, NewEvent, RedactionLevel, StoredEvent, StreamRef, StreamType,
};
pub use sink::{EventSink, SinkError};
