//! In-memory remote store.
//!
//! Behaves like a zoned record database with per-zone change feeds and
//! a database-level feed of changed zones. Every mutation advances one
//! global sequence number; change tokens are that number as big-endian
//! bytes. Failures can be injected per operation (optionally per zone) and
//! every call is counted, which is what the sync tests assert against.

use super::{
    AccountStatus, DatabaseChanges, DeletedRecord, QueryCursor, QueryPage, RecordQuery,
    RemoteStore, SavePolicy, Subscription, ZoneChanges,
};
use crate::error::{SyncError, SyncResult};
use crate::record::{DeletePolicy, FieldValue, Record};
use crate::tokens::ChangeToken;
use crate::zone::{DatabaseScope, ZoneId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fitcoach_types::RecordType;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

const DEFAULT_QUERY_PAGE: usize = 100;
const DEFAULT_CHANGES_PAGE: usize = 200;

/// Remote operations, for failure injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    AccountStatus,
    CreateZone,
    DeleteZone,
    ListZones,
    SaveRecords,
    DeleteRecords,
    QueryRecords,
    FetchDatabaseChanges,
    FetchZoneChanges,
    SaveSubscription,
    DeleteSubscription,
    FetchSubscriptionIds,
}

impl RemoteOp {
    /// Returns true for operations that mutate remote state.
    pub fn is_write(self) -> bool {
        matches!(
            self,
            RemoteOp::CreateZone
                | RemoteOp::DeleteZone
                | RemoteOp::SaveRecords
                | RemoteOp::DeleteRecords
                | RemoteOp::SaveSubscription
                | RemoteOp::DeleteSubscription
        )
    }
}

/// A failure to inject into the next matching call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Transient,
    Timeout,
    RateLimited { retry_after_secs: u64 },
    Terminal,
    Unavailable,
}

impl Failure {
    fn into_error(self, op: RemoteOp) -> SyncError {
        match self {
            Failure::Transient => SyncError::Transient(format!("injected failure in {op:?}")),
            Failure::Timeout => SyncError::Timeout,
            Failure::RateLimited { retry_after_secs } => SyncError::RateLimited { retry_after_secs },
            Failure::Terminal => SyncError::Terminal(format!("injected failure in {op:?}")),
            Failure::Unavailable => SyncError::RemoteUnavailable("not signed in".into()),
        }
    }
}

#[derive(Debug, Clone)]
struct ChangeEntry {
    seq: u64,
    record_type: RecordType,
    deleted: bool,
}

#[derive(Debug, Default)]
struct ZoneState {
    records: BTreeMap<String, Record>,
    /// Latest change per key.
    changes: BTreeMap<String, ChangeEntry>,
    last_change: u64,
}

#[derive(Debug)]
struct State {
    seq: u64,
    zones: BTreeMap<ZoneId, ZoneState>,
    deleted_zones: BTreeMap<ZoneId, u64>,
    subscriptions: BTreeMap<(DatabaseScope, String), Subscription>,
    account: AccountStatus,
    server_time: Option<DateTime<Utc>>,
    failures: HashMap<(RemoteOp, Option<ZoneId>), VecDeque<Failure>>,
    calls: HashMap<RemoteOp, usize>,
    query_page: usize,
    changes_page: usize,
}

impl State {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn now(&self) -> DateTime<Utc> {
        self.server_time.unwrap_or_else(Utc::now)
    }

    /// Counts the call and pops an injected failure, zone-specific first.
    fn enter(&mut self, op: RemoteOp, zone: Option<&ZoneId>) -> SyncResult<()> {
        *self.calls.entry(op).or_default() += 1;
        if let Some(zone) = zone
            && let Some(f) = self
                .failures
                .get_mut(&(op, Some(zone.clone())))
                .and_then(VecDeque::pop_front)
        {
            return Err(f.into_error(op));
        }
        if let Some(f) = self
            .failures
            .get_mut(&(op, None))
            .and_then(VecDeque::pop_front)
        {
            return Err(f.into_error(op));
        }
        Ok(())
    }

    fn zone_mut(&mut self, zone: &ZoneId) -> SyncResult<&mut ZoneState> {
        self.zones
            .get_mut(zone)
            .ok_or_else(|| SyncError::ZoneNotFound(zone.to_string()))
    }

    /// Records a change to `key` in `zone` at a fresh sequence number.
    fn touch(&mut self, zone: &ZoneId, key: &str, record_type: RecordType, deleted: bool) {
        let seq = self.next_seq();
        if let Some(z) = self.zones.get_mut(zone) {
            z.changes.insert(
                key.to_string(),
                ChangeEntry {
                    seq,
                    record_type,
                    deleted,
                },
            );
            z.last_change = seq;
        }
    }

    /// Deletes a record and applies reference delete policies of records
    /// pointing at it within the same zone.
    fn delete_with_policies(&mut self, zone: &ZoneId, key: &str) {
        let mut pending = vec![key.to_string()];
        while let Some(key) = pending.pop() {
            let Some(z) = self.zones.get_mut(zone) else {
                return;
            };
            let Some(removed) = z.records.remove(&key) else {
                continue;
            };
            let mut nullified = Vec::new();
            for (child_key, child) in z.records.iter_mut() {
                let referencing: Vec<(String, DeletePolicy)> = child
                    .fields
                    .iter()
                    .filter_map(|(name, value)| match value {
                        FieldValue::Reference(r) if r.key == key => {
                            Some((name.clone(), r.policy))
                        }
                        _ => None,
                    })
                    .collect();
                for (field, policy) in referencing {
                    match policy {
                        DeletePolicy::CascadeDeleteOwner => pending.push(child_key.clone()),
                        DeletePolicy::NullifyOnOwnerDelete => {
                            child.fields.remove(&field);
                            nullified.push((child_key.clone(), child.record_type));
                        }
                    }
                }
            }
            self.touch(zone, &key, removed.record_type, true);
            let now = self.now();
            for (child_key, record_type) in nullified {
                if let Some(child) = self
                    .zones
                    .get_mut(zone)
                    .and_then(|z| z.records.get_mut(&child_key))
                {
                    child.modified_at = Some(now);
                }
                self.touch(zone, &child_key, record_type, false);
            }
        }
    }
}

fn encode_token(seq: u64) -> ChangeToken {
    ChangeToken::new(seq.to_be_bytes().to_vec())
}

fn decode_token(token: Option<&ChangeToken>) -> SyncResult<u64> {
    let Some(token) = token else {
        return Ok(0);
    };
    let bytes: [u8; 8] = token
        .as_bytes()
        .try_into()
        .map_err(|_| SyncError::Terminal("unrecognized change token".into()))?;
    Ok(u64::from_be_bytes(bytes))
}

/// An in-memory [`RemoteStore`].
pub struct InMemoryRemoteStore {
    state: Mutex<State>,
}

impl InMemoryRemoteStore {
    /// Creates an empty store with an available account.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                seq: 0,
                zones: BTreeMap::new(),
                deleted_zones: BTreeMap::new(),
                subscriptions: BTreeMap::new(),
                account: AccountStatus::Available,
                server_time: None,
                failures: HashMap::new(),
                calls: HashMap::new(),
                query_page: DEFAULT_QUERY_PAGE,
                changes_page: DEFAULT_CHANGES_PAGE,
            }),
        }
    }

    /// Sets page sizes for queries and zone change feeds.
    pub fn with_page_sizes(self, query: usize, changes: usize) -> Self {
        {
            let mut state = self.state();
            state.query_page = query.max(1);
            state.changes_page = changes.max(1);
        }
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Changes the reported account status.
    pub fn set_account_status(&self, status: AccountStatus) {
        self.state().account = status;
    }

    /// Pins the server clock. `None` returns to wall-clock time.
    pub fn set_server_time(&self, time: Option<DateTime<Utc>>) {
        self.state().server_time = time;
    }

    /// Makes the next call of `op` fail.
    pub fn fail_next(&self, op: RemoteOp, failure: Failure) {
        self.state()
            .failures
            .entry((op, None))
            .or_default()
            .push_back(failure);
    }

    /// Makes the next call of `op` targeting `zone` fail.
    pub fn fail_next_in_zone(&self, op: RemoteOp, zone: &ZoneId, failure: Failure) {
        self.state()
            .failures
            .entry((op, Some(zone.clone())))
            .or_default()
            .push_back(failure);
    }

    /// Number of calls made to `op`, failed ones included.
    pub fn call_count(&self, op: RemoteOp) -> usize {
        self.state().calls.get(&op).copied().unwrap_or(0)
    }

    /// Number of mutating calls made so far.
    pub fn write_count(&self) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|(op, _)| op.is_write())
            .map(|(_, n)| n)
            .sum()
    }

    /// Resets all call counters.
    pub fn reset_counts(&self) {
        self.state().calls.clear();
    }

    /// Zones present in a scope.
    pub fn zones(&self, scope: DatabaseScope) -> Vec<ZoneId> {
        self.state()
            .zones
            .keys()
            .filter(|z| z.scope == scope)
            .cloned()
            .collect()
    }

    /// Looks up a stored record.
    pub fn record(&self, zone: &ZoneId, key: &str) -> Option<Record> {
        self.state()
            .zones
            .get(zone)
            .and_then(|z| z.records.get(key))
            .cloned()
    }

    /// All records stored in a zone, ordered by key.
    pub fn records(&self, zone: &ZoneId) -> Vec<Record> {
        self.state()
            .zones
            .get(zone)
            .map(|z| z.records.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Current value of the global change sequence.
    pub fn current_sequence(&self) -> u64 {
        self.state().seq
    }
}

impl Default for InMemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    fn provider_name(&self) -> &'static str {
        "In-Memory"
    }

    async fn account_status(&self) -> SyncResult<AccountStatus> {
        let mut state = self.state();
        state.enter(RemoteOp::AccountStatus, None)?;
        Ok(state.account)
    }

    async fn create_zone(&self, zone: &ZoneId) -> SyncResult<()> {
        let mut state = self.state();
        state.enter(RemoteOp::CreateZone, Some(zone))?;
        if state.zones.contains_key(zone) {
            return Err(SyncError::ZoneAlreadyExists(zone.to_string()));
        }
        let seq = state.next_seq();
        state.deleted_zones.remove(zone);
        state.zones.insert(
            zone.clone(),
            ZoneState {
                last_change: seq,
                ..ZoneState::default()
            },
        );
        Ok(())
    }

    async fn delete_zone(&self, zone: &ZoneId) -> SyncResult<()> {
        let mut state = self.state();
        state.enter(RemoteOp::DeleteZone, Some(zone))?;
        if state.zones.remove(zone).is_none() {
            return Err(SyncError::ZoneNotFound(zone.to_string()));
        }
        let seq = state.next_seq();
        state.deleted_zones.insert(zone.clone(), seq);
        Ok(())
    }

    async fn list_zones(&self, scope: DatabaseScope) -> SyncResult<Vec<ZoneId>> {
        let mut state = self.state();
        state.enter(RemoteOp::ListZones, None)?;
        Ok(state
            .zones
            .keys()
            .filter(|z| z.scope == scope)
            .cloned()
            .collect())
    }

    async fn save_records(
        &self,
        zone: &ZoneId,
        records: &[Record],
        policy: SavePolicy,
    ) -> SyncResult<Vec<Record>> {
        let mut state = self.state();
        state.enter(RemoteOp::SaveRecords, Some(zone))?;
        state.zone_mut(zone)?;
        let now = state.now();
        let mut saved = Vec::with_capacity(records.len());
        for incoming in records {
            let z = state.zone_mut(zone)?;
            let mut stored = match z.records.get(&incoming.key) {
                Some(existing)
                    if policy == SavePolicy::ChangedKeys
                        && existing.record_type == incoming.record_type =>
                {
                    let mut merged = existing.clone();
                    merged.merge_changed_keys(incoming);
                    merged
                }
                _ => {
                    let mut replaced = incoming.clone();
                    replaced.strip_nulls();
                    replaced
                }
            };
            stored.modified_at = Some(now);
            z.records.insert(stored.key.clone(), stored.clone());
            state.touch(zone, &stored.key, stored.record_type, false);
            saved.push(stored);
        }
        Ok(saved)
    }

    async fn delete_records(&self, zone: &ZoneId, keys: &[String]) -> SyncResult<()> {
        let mut state = self.state();
        state.enter(RemoteOp::DeleteRecords, Some(zone))?;
        state.zone_mut(zone)?;
        for key in keys {
            state.delete_with_policies(zone, key);
        }
        Ok(())
    }

    async fn query_records(&self, query: &RecordQuery) -> SyncResult<QueryPage> {
        let mut state = self.state();
        state.enter(RemoteOp::QueryRecords, Some(&query.zone))?;
        let page_size = state.query_page;
        let offset = match &query.cursor {
            None => 0,
            Some(QueryCursor(raw)) => raw
                .parse::<usize>()
                .map_err(|_| SyncError::Terminal(format!("invalid query cursor: {raw}")))?,
        };
        let z = state.zone_mut(&query.zone)?;
        let matching: Vec<&Record> = z
            .records
            .values()
            .filter(|r| r.record_type == query.record_type && query.predicate.matches(r))
            .collect();
        let end = (offset + page_size).min(matching.len());
        let records = matching
            .get(offset..end)
            .map(|page| page.iter().map(|r| (*r).clone()).collect())
            .unwrap_or_default();
        let cursor = (end < matching.len()).then(|| QueryCursor(end.to_string()));
        Ok(QueryPage { records, cursor })
    }

    async fn fetch_database_changes(
        &self,
        scope: DatabaseScope,
        token: Option<&ChangeToken>,
    ) -> SyncResult<DatabaseChanges> {
        let mut state = self.state();
        state.enter(RemoteOp::FetchDatabaseChanges, None)?;
        let since = decode_token(token)?;
        let changed_zones = state
            .zones
            .iter()
            .filter(|(id, z)| id.scope == scope && z.last_change > since)
            .map(|(id, _)| id.clone())
            .collect();
        let deleted_zones = state
            .deleted_zones
            .iter()
            .filter(|(id, seq)| id.scope == scope && **seq > since)
            .map(|(id, _)| id.clone())
            .collect();
        Ok(DatabaseChanges {
            changed_zones,
            deleted_zones,
            token: Some(encode_token(state.seq.max(since))),
            more_coming: false,
        })
    }

    async fn fetch_zone_changes(
        &self,
        zone: &ZoneId,
        token: Option<&ChangeToken>,
    ) -> SyncResult<ZoneChanges> {
        let mut state = self.state();
        state.enter(RemoteOp::FetchZoneChanges, Some(zone))?;
        let since = decode_token(token)?;
        let page_size = state.changes_page;
        let z = state.zone_mut(zone)?;

        let mut pending: Vec<(&String, &ChangeEntry)> =
            z.changes.iter().filter(|(_, c)| c.seq > since).collect();
        pending.sort_by_key(|(_, c)| c.seq);
        let more_coming = pending.len() > page_size;
        pending.truncate(page_size);

        let mut changes = ZoneChanges {
            more_coming,
            ..ZoneChanges::default()
        };
        let mut last_seq = since;
        for (key, entry) in pending {
            last_seq = entry.seq;
            if entry.deleted {
                changes.deleted.push(DeletedRecord {
                    record_type: entry.record_type,
                    key: key.clone(),
                });
            } else if let Some(record) = z.records.get(key) {
                changes.changed.push(record.clone());
            }
        }
        let next = if more_coming {
            last_seq
        } else {
            z.last_change.max(since)
        };
        changes.token = Some(encode_token(next));
        Ok(changes)
    }

    async fn save_subscription(&self, subscription: &Subscription) -> SyncResult<()> {
        let mut state = self.state();
        state.enter(RemoteOp::SaveSubscription, None)?;
        state
            .subscriptions
            .entry((subscription.scope, subscription.id.clone()))
            .or_insert_with(|| subscription.clone());
        Ok(())
    }

    async fn delete_subscription(&self, scope: DatabaseScope, id: &str) -> SyncResult<()> {
        let mut state = self.state();
        state.enter(RemoteOp::DeleteSubscription, None)?;
        state.subscriptions.remove(&(scope, id.to_string()));
        Ok(())
    }

    async fn fetch_subscription_ids(&self, scope: DatabaseScope) -> SyncResult<Vec<String>> {
        let mut state = self.state();
        state.enter(RemoteOp::FetchSubscriptionIds, None)?;
        Ok(state
            .subscriptions
            .keys()
            .filter(|(s, _)| *s == scope)
            .map(|(_, id)| id.clone())
            .collect())
    }
}
