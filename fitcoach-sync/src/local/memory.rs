//! In-memory local store.

use super::{ChangeOrigin, CommitEvent, LocalChange, LocalStore};
use crate::entity::Entity;
use crate::error::{SyncError, SyncResult};
use fitcoach_types::{RecordKey, RecordType};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

/// A [`LocalStore`] backed by a map, for tests and previews.
pub struct InMemoryLocalStore {
    entities: Mutex<BTreeMap<RecordKey, Entity>>,
    events: broadcast::Sender<CommitEvent>,
    fail_next_apply: AtomicBool,
    applies: AtomicUsize,
}

impl InMemoryLocalStore {
    pub fn new() -> Self {
        Self::with_event_capacity(EVENT_CAPACITY)
    }

    /// Creates a store whose commit channel holds `capacity` events.
    pub fn with_event_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            entities: Mutex::new(BTreeMap::new()),
            events,
            fail_next_apply: AtomicBool::new(false),
            applies: AtomicUsize::new(0),
        }
    }

    fn entities(&self) -> MutexGuard<'_, BTreeMap<RecordKey, Entity>> {
        self.entities.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the next `apply` fail without changing anything.
    pub fn fail_next_apply(&self) {
        self.fail_next_apply.store(true, Ordering::SeqCst);
    }

    /// Number of successful `apply` calls.
    pub fn apply_count(&self) -> usize {
        self.applies.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.entities().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities().is_empty()
    }

    /// Every stored entity, ordered by key.
    pub fn snapshot(&self) -> Vec<Entity> {
        self.entities().values().cloned().collect()
    }
}

impl Default for InMemoryLocalStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalStore for InMemoryLocalStore {
    fn fetch_all(&self, record_type: RecordType) -> SyncResult<Vec<Entity>> {
        Ok(self
            .entities()
            .values()
            .filter(|e| e.record_type() == record_type)
            .cloned()
            .collect())
    }

    fn fetch(&self, key: &RecordKey) -> SyncResult<Option<Entity>> {
        Ok(self.entities().get(key).cloned())
    }

    fn apply(&self, origin: ChangeOrigin, changes: Vec<LocalChange>) -> SyncResult<CommitEvent> {
        if self.fail_next_apply.swap(false, Ordering::SeqCst) {
            return Err(SyncError::LocalStore("injected write failure".into()));
        }

        let mut entities = self.entities();
        // Work on a copy so a failed batch leaves nothing behind.
        let mut next = entities.clone();
        let mut event = CommitEvent::empty(origin);
        for change in changes {
            match change {
                LocalChange::Upsert(entity) => {
                    let key = entity.key();
                    match next.insert(key, entity.clone()) {
                        None => event.inserted.push(entity),
                        Some(previous) if previous != entity => event.updated.push(entity),
                        Some(_) => {}
                    }
                }
                LocalChange::Delete(key) => {
                    if next.remove(&key).is_some() {
                        event.deleted.push(key);
                    }
                }
            }
        }
        *entities = next;
        drop(entities);

        self.applies.fetch_add(1, Ordering::SeqCst);
        if !event.is_empty() {
            // No subscribers is fine.
            let _ = self.events.send(event.clone());
        }
        Ok(event)
    }

    fn subscribe(&self) -> broadcast::Receiver<CommitEvent> {
        self.events.subscribe()
    }
}
