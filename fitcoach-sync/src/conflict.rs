//! Conflict resolution.
//!
//! A conflict exists when a remote change arrives for an entity that also
//! changed locally since the last successful sync. The strategy picks a
//! winner; under [`ConflictStrategy::Manual`] both versions are parked in a
//! [`ConflictLedger`] until the app decides.

use crate::entity::Entity;
use crate::record::Record;
use chrono::{DateTime, Utc};
use fitcoach_types::RecordKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How conflicting versions are settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictStrategy {
    /// The remote version always wins.
    #[default]
    ServerWins,
    /// The local version always wins and is pushed again.
    ClientWins,
    /// The strictly newer version wins; ties go to the remote.
    NewestWins,
    /// Neither wins until the app calls `resolve_conflict`.
    Manual,
}

/// Outcome of applying a strategy to one conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictDecision {
    UseRemote,
    UseLocal,
    RequiresManualResolution,
}

/// Picks a winner.
///
/// `remote_modified` is the server modification time; a record without one
/// is treated as newer than anything local.
pub fn resolve(
    strategy: ConflictStrategy,
    local_modified: DateTime<Utc>,
    remote_modified: Option<DateTime<Utc>>,
) -> ConflictDecision {
    match strategy {
        ConflictStrategy::ServerWins => ConflictDecision::UseRemote,
        ConflictStrategy::ClientWins => ConflictDecision::UseLocal,
        ConflictStrategy::NewestWins => match remote_modified {
            Some(remote) if local_modified > remote => ConflictDecision::UseLocal,
            _ => ConflictDecision::UseRemote,
        },
        ConflictStrategy::Manual => ConflictDecision::RequiresManualResolution,
    }
}

/// Both sides of an unresolved conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictedEntity {
    pub key: RecordKey,
    /// Local version; `None` if the entity was deleted locally.
    pub local: Option<Entity>,
    /// Remote version; `None` if the record was deleted remotely.
    pub remote: Option<Record>,
    pub detected_at: DateTime<Utc>,
}

/// Conflicts waiting for a manual decision, by key.
#[derive(Debug, Default)]
pub struct ConflictLedger {
    entries: BTreeMap<RecordKey, ConflictedEntity>,
}

impl ConflictLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parks a conflict, replacing any earlier entry for the key.
    pub fn record(&mut self, conflict: ConflictedEntity) {
        self.entries.insert(conflict.key, conflict);
    }

    pub fn contains(&self, key: &RecordKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &RecordKey) -> Option<&ConflictedEntity> {
        self.entries.get(key)
    }

    /// Replaces the remote side of a parked conflict.
    pub fn update_remote(&mut self, key: &RecordKey, remote: Option<Record>) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.remote = remote;
        }
    }

    /// Replaces the local side of a parked conflict.
    pub fn update_local(&mut self, key: &RecordKey, local: Option<Entity>) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.local = local;
        }
    }

    pub fn take(&mut self, key: &RecordKey) -> Option<ConflictedEntity> {
        self.entries.remove(key)
    }

    pub fn list(&self) -> Vec<ConflictedEntity> {
        self.entries.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
