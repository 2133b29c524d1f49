//! Coordinator state and pass reports.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where the coordinator is in its state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncPhase {
    Idle,
    FullSyncInProgress,
    IncrementalSyncInProgress,
    /// The remote account is unusable; every pass is refused until an
    /// authorization check succeeds again.
    DisabledUntilReauthorized,
}

impl SyncPhase {
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            SyncPhase::FullSyncInProgress | SyncPhase::IncrementalSyncInProgress
        )
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncPhase::Idle => "idle",
            SyncPhase::FullSyncInProgress => "full sync in progress",
            SyncPhase::IncrementalSyncInProgress => "incremental sync in progress",
            SyncPhase::DisabledUntilReauthorized => "disabled until reauthorized",
        };
        f.write_str(s)
    }
}

/// Kind of pass a report describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncKind {
    Full,
    Incremental,
}

/// What a sync pass did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub kind: SyncKind,
    /// Remote records applied locally.
    pub downloaded: usize,
    /// Remote deletions applied locally.
    pub deleted: usize,
    /// Local entities pushed during a full sync.
    pub uploaded: usize,
    /// Queued operations applied before the pass.
    pub pushed: usize,
    /// Queued operations dropped as unrecoverable.
    pub dropped: usize,
    /// Conflicts detected (resolved or parked).
    pub conflicts: usize,
    /// Remote records skipped (undecodable or parked as conflicts).
    pub skipped: usize,
    /// Stray copies removed from zones that do not own their type.
    pub reconciled: usize,
}

impl SyncReport {
    pub fn new(kind: SyncKind) -> Self {
        Self {
            kind,
            downloaded: 0,
            deleted: 0,
            uploaded: 0,
            pushed: 0,
            dropped: 0,
            conflicts: 0,
            skipped: 0,
            reconciled: 0,
        }
    }
}

/// Why a pass was requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncTrigger {
    /// A push notification arrived; optionally scoped to one zone.
    RemoteNotification { zone: Option<crate::zone::ZoneId> },
    /// The app came to the foreground.
    Foreground,
    /// The user asked for a sync.
    UserRequested,
}

/// Whether a trigger ran a pass or was folded into the running one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    Ran,
    Coalesced,
}
