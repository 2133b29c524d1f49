//! Zones and the zone manager.
//!
//! Every record type lives in exactly one zone. The mapping is a static
//! table validated at startup; the manager routes record saves, deletes and
//! queries to the right zone and owns zone lifecycle on the remote.

use crate::config::RetryPolicy;
use crate::error::{SyncError, SyncResult};
use crate::queue::{OperationApplier, OperationKind, PendingOperation};
use crate::record::Record;
use crate::remote::{Predicate, RecordQuery, RemoteStore, SavePolicy};
use crate::retry::with_retry;
use async_trait::async_trait;
use fitcoach_types::RecordType;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Database a zone lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DatabaseScope {
    Private,
    Shared,
    Public,
}

impl DatabaseScope {
    pub const ALL: [DatabaseScope; 3] = [
        DatabaseScope::Private,
        DatabaseScope::Shared,
        DatabaseScope::Public,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            DatabaseScope::Private => "private",
            DatabaseScope::Shared => "shared",
            DatabaseScope::Public => "public",
        }
    }
}

impl fmt::Display for DatabaseScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies a zone on the remote.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ZoneId {
    pub name: String,
    pub scope: DatabaseScope,
}

impl ZoneId {
    pub fn new(name: impl Into<String>, scope: DatabaseScope) -> Self {
        Self {
            name: name.into(),
            scope,
        }
    }

    pub fn private(name: impl Into<String>) -> Self {
        Self::new(name, DatabaseScope::Private)
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scope, self.name)
    }
}

/// A zone and the record types it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Zone {
    pub id: ZoneId,
    pub record_types: Vec<RecordType>,
}

impl Zone {
    pub fn new(id: ZoneId, record_types: impl Into<Vec<RecordType>>) -> Self {
        Self {
            id,
            record_types: record_types.into(),
        }
    }
}

/// Static record-type to zone mapping.
#[derive(Debug, Clone)]
pub struct ZoneTable {
    zones: Vec<Zone>,
}

impl ZoneTable {
    /// Builds a table without validating it.
    pub fn new(zones: Vec<Zone>) -> Self {
        Self { zones }
    }

    /// The FitCoach layout: exercise library, workouts, nutrition and progress.
    pub fn standard() -> Self {
        Self::new(vec![
            Zone::new(ZoneId::private("exerciseLibrary"), [RecordType::Exercise]),
            Zone::new(
                ZoneId::private("workouts"),
                [RecordType::WorkoutSession, RecordType::ExerciseSet],
            ),
            Zone::new(ZoneId::private("nutrition"), [RecordType::FoodEntry]),
            Zone::new(
                ZoneId::private("progress"),
                [RecordType::BodyMeasurement, RecordType::Goal],
            ),
        ])
    }

    /// Checks that zone names are unique and every known record type maps
    /// to exactly one zone.
    pub fn validate(&self) -> SyncResult<()> {
        let mut names = BTreeSet::new();
        let mut owners: BTreeMap<RecordType, &ZoneId> = BTreeMap::new();
        for zone in &self.zones {
            if !names.insert(&zone.id) {
                return Err(SyncError::Config(format!("zone {} declared twice", zone.id)));
            }
            for rt in &zone.record_types {
                if let Some(other) = owners.insert(*rt, &zone.id) {
                    return Err(SyncError::Config(format!(
                        "record type {rt} mapped to both {other} and {}",
                        zone.id
                    )));
                }
            }
        }
        for rt in RecordType::ALL {
            if !owners.contains_key(&rt) {
                return Err(SyncError::NoZoneForType(rt));
            }
        }
        Ok(())
    }

    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    /// Looks up the zone owning a record type.
    pub fn zone_for(&self, record_type: RecordType) -> SyncResult<&Zone> {
        self.zones
            .iter()
            .find(|z| z.record_types.contains(&record_type))
            .ok_or(SyncError::NoZoneForType(record_type))
    }

    pub fn get(&self, id: &ZoneId) -> Option<&Zone> {
        self.zones.iter().find(|z| &z.id == id)
    }

    /// Database scopes that hold at least one zone.
    pub fn scopes(&self) -> Vec<DatabaseScope> {
        let scopes: BTreeSet<DatabaseScope> = self.zones.iter().map(|z| z.id.scope).collect();
        scopes.into_iter().collect()
    }
}

impl Default for ZoneTable {
    fn default() -> Self {
        Self::standard()
    }
}

/// Routes record traffic to zones on a remote store.
pub struct ZoneManager {
    remote: Arc<dyn RemoteStore>,
    table: ZoneTable,
    retry: RetryPolicy,
}

impl ZoneManager {
    /// Creates a manager over a validated zone table.
    pub fn new(remote: Arc<dyn RemoteStore>, table: ZoneTable, retry: RetryPolicy) -> SyncResult<Self> {
        table.validate()?;
        Ok(Self {
            remote,
            table,
            retry,
        })
    }

    pub fn table(&self) -> &ZoneTable {
        &self.table
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }

    pub fn zone_for(&self, record_type: RecordType) -> SyncResult<&Zone> {
        self.table.zone_for(record_type)
    }

    /// Creates every zone in the table that the remote does not have yet.
    ///
    /// Returns the number of zones created. A zone that appears between the
    /// listing and the create call counts as present.
    pub async fn create_all(&self) -> SyncResult<usize> {
        let mut created = 0;
        for scope in self.table.scopes() {
            let existing: BTreeSet<ZoneId> = with_retry(&self.retry, "list zones", || {
                self.remote.list_zones(scope)
            })
            .await?
            .into_iter()
            .collect();

            for zone in self.table.zones().iter().filter(|z| z.id.scope == scope) {
                if existing.contains(&zone.id) {
                    continue;
                }
                match with_retry(&self.retry, "create zone", || self.remote.create_zone(&zone.id))
                    .await
                {
                    Ok(()) => {
                        info!("Created zone {}", zone.id);
                        created += 1;
                    }
                    Err(SyncError::ZoneAlreadyExists(_)) => {
                        debug!("Zone {} already exists", zone.id);
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(created)
    }

    /// Upserts one record into its zone, overwriting only present fields.
    /// Fields sent as cleared are removed.
    pub async fn save(&self, record: &Record) -> SyncResult<Record> {
        let zone = &self.zone_for(record.record_type)?.id;
        let saved = with_retry(&self.retry, "save record", || {
            self.remote
                .save_records(zone, std::slice::from_ref(record), SavePolicy::ChangedKeys)
        })
        .await?;
        saved
            .into_iter()
            .next()
            .ok_or_else(|| SyncError::Terminal(format!("remote did not return {}", record.key)))
    }

    /// Upserts records, one remote call per zone.
    pub async fn save_batch(&self, records: &[Record]) -> SyncResult<Vec<Record>> {
        let mut by_zone: BTreeMap<&ZoneId, Vec<Record>> = BTreeMap::new();
        for record in records {
            let zone = &self.zone_for(record.record_type)?.id;
            by_zone.entry(zone).or_default().push(record.clone());
        }
        let mut saved = Vec::with_capacity(records.len());
        for (zone, batch) in by_zone {
            debug!("Saving {} records to {}", batch.len(), zone);
            let stored = with_retry(&self.retry, "save records", || {
                self.remote.save_records(zone, &batch, SavePolicy::ChangedKeys)
            })
            .await?;
            saved.extend(stored);
        }
        Ok(saved)
    }

    /// Deletes one record from its zone.
    pub async fn delete(&self, record_type: RecordType, key: &str) -> SyncResult<()> {
        let zone = &self.zone_for(record_type)?.id;
        let keys = [key.to_string()];
        with_retry(&self.retry, "delete record", || {
            self.remote.delete_records(zone, &keys)
        })
        .await
    }

    /// Runs a query to exhaustion, following cursors.
    pub async fn fetch(
        &self,
        zone: &ZoneId,
        record_type: RecordType,
        predicate: Predicate,
    ) -> SyncResult<Vec<Record>> {
        let mut query = RecordQuery {
            zone: zone.clone(),
            record_type,
            predicate,
            cursor: None,
        };
        let mut records = Vec::new();
        loop {
            let page = with_retry(&self.retry, "query records", || {
                self.remote.query_records(&query)
            })
            .await?;
            records.extend(page.records);
            match page.cursor {
                Some(cursor) => query.cursor = Some(cursor),
                None => break,
            }
        }
        debug!("Fetched {} {} records from {}", records.len(), record_type, zone);
        Ok(records)
    }

    /// Copies records of the given types from `source` to `dest`, then
    /// deletes them from `source`.
    ///
    /// Not atomic. If the copy succeeds but the delete fails, the records
    /// exist in both zones and `PartialMigration` is returned; `fetch_owned`
    /// cleans up the copies left behind.
    pub async fn migrate(
        &self,
        source: &ZoneId,
        dest: &ZoneId,
        record_types: &[RecordType],
    ) -> SyncResult<usize> {
        let mut moved = 0;
        for &rt in record_types {
            let records = self.fetch(source, rt, Predicate::All).await?;
            if records.is_empty() {
                continue;
            }
            with_retry(&self.retry, "migrate copy", || {
                self.remote.save_records(dest, &records, SavePolicy::AllKeys)
            })
            .await?;

            let keys: Vec<String> = records.iter().map(|r| r.key.clone()).collect();
            if let Err(e) = with_retry(&self.retry, "migrate delete", || {
                self.remote.delete_records(source, &keys)
            })
            .await
            {
                warn!("Migration of {} from {} to {} left copies behind: {}", rt, source, dest, e);
                return Err(SyncError::PartialMigration {
                    from_zone: source.to_string(),
                    to_zone: dest.to_string(),
                    reason: e.to_string(),
                });
            }
            info!("Migrated {} {} records from {} to {}", records.len(), rt, source, dest);
            moved += records.len();
        }
        Ok(moved)
    }

    /// Fetches every record of `record_type` from its owning zone, folding in
    /// copies an interrupted migration left in the other `remote_zones`.
    ///
    /// Per key the copy with the latest server modification wins. A winner
    /// found outside the owning zone is written into it, then every stray
    /// copy is deleted. Returns the records and the number of strays removed.
    pub async fn fetch_owned(
        &self,
        record_type: RecordType,
        remote_zones: &[ZoneId],
    ) -> SyncResult<(Vec<Record>, usize)> {
        let owner = self.zone_for(record_type)?.id.clone();
        let mut latest: BTreeMap<String, (Record, bool)> = self
            .fetch(&owner, record_type, Predicate::All)
            .await?
            .into_iter()
            .map(|r| (r.key.clone(), (r, false)))
            .collect();

        let mut strays: BTreeMap<&ZoneId, Vec<String>> = BTreeMap::new();
        for zone in remote_zones.iter().filter(|z| **z != owner) {
            for record in self.fetch(zone, record_type, Predicate::All).await? {
                strays.entry(zone).or_default().push(record.key.clone());
                let newer = latest
                    .get(&record.key)
                    .is_none_or(|(current, _)| record.modified_at > current.modified_at);
                if newer {
                    latest.insert(record.key.clone(), (record, true));
                }
            }
        }
        if strays.is_empty() {
            return Ok((latest.into_values().map(|(r, _)| r).collect(), 0));
        }

        let promoted: Vec<Record> = latest
            .values()
            .filter(|(_, stray)| *stray)
            .map(|(r, _)| r.clone())
            .collect();
        if !promoted.is_empty() {
            let saved = with_retry(&self.retry, "reconcile copy", || {
                self.remote.save_records(&owner, &promoted, SavePolicy::AllKeys)
            })
            .await?;
            for record in saved {
                latest.insert(record.key.clone(), (record, false));
            }
        }

        let mut removed = 0;
        for (zone, keys) in &strays {
            with_retry(&self.retry, "reconcile delete", || {
                self.remote.delete_records(zone, keys)
            })
            .await?;
            info!(
                "Removed {} stray {} records from {} (owned by {})",
                keys.len(),
                record_type,
                zone,
                owner
            );
            removed += keys.len();
        }
        Ok((latest.into_values().map(|(r, _)| r).collect(), removed))
    }

    /// Creates a zone unless it already exists.
    pub async fn ensure_zone(&self, zone: &ZoneId) -> SyncResult<()> {
        match with_retry(&self.retry, "create zone", || self.remote.create_zone(zone)).await {
            Ok(()) => {
                info!("Created zone {}", zone);
                Ok(())
            }
            Err(SyncError::ZoneAlreadyExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn apply_once(&self, op: &PendingOperation) -> SyncResult<()> {
        match op.kind {
            OperationKind::Save | OperationKind::Modify => {
                let record = op.payload.as_ref().ok_or_else(|| {
                    SyncError::Terminal(format!("{} operation for {} has no payload", op.kind, op.key))
                })?;
                self.save(record).await.map(|_| ())
            }
            OperationKind::Delete => {
                self.delete(op.key.record_type(), &op.key.to_string())
                    .await
            }
        }
    }

    pub async fn delete_zone(&self, zone: &ZoneId) -> SyncResult<()> {
        with_retry(&self.retry, "delete zone", || self.remote.delete_zone(zone)).await?;
        info!("Deleted zone {}", zone);
        Ok(())
    }

    /// Lists remote zones across every scope the table uses.
    pub async fn list_zones(&self) -> SyncResult<Vec<ZoneId>> {
        let mut zones = Vec::new();
        for scope in self.table.scopes() {
            zones.extend(
                with_retry(&self.retry, "list zones", || self.remote.list_zones(scope)).await?,
            );
        }
        Ok(zones)
    }
}

#[async_trait]
impl OperationApplier for ZoneManager {
    /// Applies a queued operation. A save whose zone has disappeared
    /// recreates the zone and is tried once more; a delete from a missing
    /// zone has nothing left to remove.
    async fn apply(&self, op: &PendingOperation) -> SyncResult<()> {
        match self.apply_once(op).await {
            Err(SyncError::ZoneNotFound(zone)) if op.kind == OperationKind::Delete => {
                debug!("Zone {} is gone; delete of {} is moot", zone, op.key);
                Ok(())
            }
            Err(SyncError::ZoneNotFound(zone)) => {
                warn!("Zone {} missing while pushing {}; recreating it", zone, op.key);
                let owner = self.zone_for(op.key.record_type())?.id.clone();
                self.ensure_zone(&owner).await?;
                self.apply_once(op).await
            }
            result => result,
        }
    }
}
