//! Local persistent store abstraction.
//!
//! The local store is the app's own database. The sync engine reads entities
//! out of it, writes remote changes into it through one transactional
//! primitive, and listens to its commit events to pick up user edits.

pub mod memory;

use crate::entity::Entity;
use crate::error::SyncResult;
use fitcoach_types::{RecordKey, RecordType};
use tokio::sync::broadcast;

pub use memory::InMemoryLocalStore;

/// Who produced a local commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// The user, through the app.
    Local,
    /// The sync engine applying remote changes.
    Sync,
}

/// One mutation inside a local transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalChange {
    Upsert(Entity),
    Delete(RecordKey),
}

impl LocalChange {
    pub fn key(&self) -> RecordKey {
        match self {
            LocalChange::Upsert(entity) => entity.key(),
            LocalChange::Delete(key) => *key,
        }
    }
}

/// What a committed transaction changed.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitEvent {
    pub origin: ChangeOrigin,
    pub inserted: Vec<Entity>,
    pub updated: Vec<Entity>,
    pub deleted: Vec<RecordKey>,
}

impl CommitEvent {
    pub fn empty(origin: ChangeOrigin) -> Self {
        Self {
            origin,
            inserted: Vec::new(),
            updated: Vec::new(),
            deleted: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Number of entities touched.
    pub fn len(&self) -> usize {
        self.inserted.len() + self.updated.len() + self.deleted.len()
    }
}

/// The app's local store, as seen by the sync engine.
///
/// Calls are synchronous and may block; the coordinator runs them on the
/// blocking pool.
pub trait LocalStore: Send + Sync {
    /// All entities of one type.
    fn fetch_all(&self, record_type: RecordType) -> SyncResult<Vec<Entity>>;

    /// One entity by key.
    fn fetch(&self, key: &RecordKey) -> SyncResult<Option<Entity>>;

    /// Applies a batch atomically: either every change lands or none does.
    ///
    /// An upsert identical to the stored entity is not reported as updated,
    /// and deleting a missing key is a no-op. A non-empty commit is broadcast
    /// to subscribers.
    fn apply(&self, origin: ChangeOrigin, changes: Vec<LocalChange>) -> SyncResult<CommitEvent>;

    /// Subscribes to commit events.
    fn subscribe(&self) -> broadcast::Receiver<CommitEvent>;
}
