//! Core type definitions for FitCoach cloud sync.
//!
//! This crate defines the small, persistence-agnostic types shared by the
//! sync engine and its tooling:
//! - Entity and operation identifiers (UUID)
//! - The closed set of replicated record types
//! - Deterministic record keys derived from entity identifiers

mod ids;
mod record;

pub use ids::{EntityId, OperationId};
pub use record::{RecordKey, RecordType};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed record key: {0}")]
    MalformedKey(String),

    #[error("unknown record type: {0}")]
    UnknownRecordType(String),
}
