//! Error types for the sync layer.

use crate::codec::DecodeError;
use fitcoach_types::RecordType;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// No usable account/session on the remote side.
    #[error("remote account unavailable: {0}")]
    RemoteUnavailable(String),

    /// Network failure or service hiccup worth retrying.
    #[error("transient remote failure: {0}")]
    Transient(String),

    /// Timeout.
    #[error("operation timed out")]
    Timeout,

    /// The remote asked us to back off.
    #[error("rate limited: retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Remote and local versions of the same record diverged.
    #[error("conflicting versions of {key}")]
    Conflict { key: String },

    /// The remote rejected the payload; retrying cannot help.
    #[error("terminal failure: {0}")]
    Terminal(String),

    /// A record could not be decoded into an entity.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Invalid identifier or record type name.
    #[error("invalid key: {0}")]
    Key(#[from] fitcoach_types::Error),

    /// A record type has no zone mapping.
    #[error("no zone mapped for record type {0}")]
    NoZoneForType(RecordType),

    /// Zone creation hit an existing zone.
    #[error("zone already exists: {0}")]
    ZoneAlreadyExists(String),

    /// Zone not found on the remote.
    #[error("zone not found: {0}")]
    ZoneNotFound(String),

    /// Copy phase and delete phase of a zone migration disagree.
    #[error("partial migration from {from_zone} to {to_zone}: {reason}")]
    PartialMigration {
        from_zone: String,
        to_zone: String,
        reason: String,
    },

    /// The local store rejected a write or read.
    #[error("local store error: {0}")]
    LocalStore(String),

    /// Sync state database error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error (token file, config file).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Coarse classification used by the queue and the coordinator to decide
/// between retrying, dropping and halting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    RemoteUnavailable,
    Transient,
    Conflict,
    Terminal,
    /// The target zone is gone; recreating it lets the call succeed.
    MissingZone,
    PartialMigration,
    Local,
}

impl SyncError {
    /// Classifies this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::RemoteUnavailable(_) => ErrorClass::RemoteUnavailable,
            SyncError::Transient(_) | SyncError::Timeout | SyncError::RateLimited { .. } => {
                ErrorClass::Transient
            }
            SyncError::Conflict { .. } => ErrorClass::Conflict,
            SyncError::Terminal(_)
            | SyncError::Decode(_)
            | SyncError::Key(_)
            | SyncError::NoZoneForType(_)
            | SyncError::ZoneAlreadyExists(_)
            | SyncError::Serialization(_)
            | SyncError::Config(_) => ErrorClass::Terminal,
            SyncError::ZoneNotFound(_) => ErrorClass::MissingZone,
            SyncError::PartialMigration { .. } => ErrorClass::PartialMigration,
            SyncError::LocalStore(_) | SyncError::Storage(_) | SyncError::Io(_) => {
                ErrorClass::Local
            }
        }
    }

    /// Returns true if the failed call may succeed when repeated.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Returns true if the failed operation should be dropped, not retried.
    pub fn is_terminal(&self) -> bool {
        self.class() == ErrorClass::Terminal
    }

    /// Returns the server-requested backoff, if any.
    pub fn retry_after(&self) -> Option<std::time::Duration> {
        match self {
            SyncError::RateLimited { retry_after_secs } => {
                Some(std::time::Duration::from_secs(*retry_after_secs))
            }
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(e: rusqlite::Error) -> Self {
        SyncError::Storage(e.to_string())
    }
}
