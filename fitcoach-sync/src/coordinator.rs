//! Sync coordinator.
//!
//! Orchestrates full and incremental passes between the local store and the
//! remote, detects local changes and feeds them to the offline queue, and
//! settles conflicts. One pass runs at a time; triggers that arrive while a
//! pass is running are folded into a single re-run.

use crate::codec::CodecRegistry;
use crate::config::SyncConfig;
use crate::conflict::{self, ConflictDecision, ConflictLedger, ConflictStrategy, ConflictedEntity};
use crate::db::SyncDatabase;
use crate::entity::Entity;
use crate::error::{ErrorClass, SyncError, SyncResult};
use crate::local::{ChangeOrigin, CommitEvent, LocalChange, LocalStore};
use crate::queue::{DrainReport, OfflineQueue, PendingOperation};
use crate::record::Record;
use crate::remote::{DeletedRecord, RemoteStore};
use crate::retry::with_retry;
use crate::state::{SyncKind, SyncPhase, SyncReport, SyncTrigger, TriggerOutcome};
use crate::tokens::{ChangeToken, ChangeTokenStore, TokenScope};
use crate::zone::{ZoneId, ZoneManager, ZoneTable};
use chrono::{DateTime, Utc};
use fitcoach_types::{RecordKey, RecordType};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What to do with one incoming remote change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RemoteAction {
    Apply,
    Skip,
}

/// Net changes fetched from one zone.
#[derive(Debug, Default)]
struct ZoneDelta {
    changed: Vec<Record>,
    deleted: Vec<DeletedRecord>,
    token: Option<ChangeToken>,
}

enum ZoneEvent {
    Changed(Record),
    Deleted(DeletedRecord),
}

/// Coordinates sync between a local store and a remote store.
pub struct SyncCoordinator {
    config: SyncConfig,
    zones: Arc<ZoneManager>,
    local: Arc<dyn LocalStore>,
    codecs: Arc<CodecRegistry>,
    db: SyncDatabase,
    queue: OfflineQueue,
    tokens: Mutex<ChangeTokenStore>,
    /// Held for the duration of a pass.
    pass_lock: Mutex<()>,
    /// Held while the offline queue drains.
    drain_lock: Mutex<()>,
    rerun: AtomicBool,
    phase: watch::Sender<SyncPhase>,
    initial_sync: watch::Sender<bool>,
    strategy: RwLock<ConflictStrategy>,
    ledger: Mutex<ConflictLedger>,
}

impl SyncCoordinator {
    /// Opens a coordinator with the standard zone layout and codecs.
    ///
    /// State is persisted under `config.state_dir` when set, in memory
    /// otherwise.
    pub fn open(
        config: SyncConfig,
        remote: Arc<dyn RemoteStore>,
        local: Arc<dyn LocalStore>,
    ) -> SyncResult<Self> {
        config.validate()?;
        let (db, tokens) = match (&config.state_dir, config.state_db_path(), config.tokens_path()) {
            (Some(dir), Some(db_path), Some(tokens_path)) => {
                std::fs::create_dir_all(dir)?;
                (SyncDatabase::open(db_path)?, ChangeTokenStore::open(tokens_path)?)
            }
            _ => (SyncDatabase::open_in_memory()?, ChangeTokenStore::in_memory()),
        };
        let zones = ZoneManager::new(remote, ZoneTable::standard(), config.retry.clone())?;
        Self::with_parts(config, zones, local, CodecRegistry::standard(), db, tokens)
    }

    /// Assembles a coordinator from explicit parts.
    pub fn with_parts(
        config: SyncConfig,
        zones: ZoneManager,
        local: Arc<dyn LocalStore>,
        codecs: CodecRegistry,
        db: SyncDatabase,
        tokens: ChangeTokenStore,
    ) -> SyncResult<Self> {
        config.validate()?;
        let queue = OfflineQueue::new(db.clone());
        let initial_done = db.initial_sync_completed()?;
        let (phase, _) = watch::channel(SyncPhase::Idle);
        let (initial_sync, _) = watch::channel(initial_done);
        Ok(Self {
            strategy: RwLock::new(config.conflict_strategy),
            config,
            zones: Arc::new(zones),
            local,
            codecs: Arc::new(codecs),
            db,
            queue,
            tokens: Mutex::new(tokens),
            pass_lock: Mutex::new(()),
            drain_lock: Mutex::new(()),
            rerun: AtomicBool::new(false),
            phase,
            initial_sync,
            ledger: Mutex::new(ConflictLedger::new()),
        })
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn zones(&self) -> &ZoneManager {
        &self.zones
    }

    pub fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    pub fn codecs(&self) -> &CodecRegistry {
        &self.codecs
    }

    pub fn database(&self) -> &SyncDatabase {
        &self.db
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<SyncPhase> {
        self.phase.subscribe()
    }

    pub fn is_initial_sync_completed(&self) -> bool {
        *self.initial_sync.borrow()
    }

    /// Observes the initial-sync-completed flag.
    pub fn subscribe_initial_sync(&self) -> watch::Receiver<bool> {
        self.initial_sync.subscribe()
    }

    pub fn last_sync_timestamp(&self) -> SyncResult<Option<DateTime<Utc>>> {
        self.db.last_sync_timestamp()
    }

    pub async fn change_token(&self, scope: &TokenScope) -> Option<ChangeToken> {
        self.tokens.lock().await.token_for(scope).cloned()
    }

    pub async fn conflict_resolution_strategy(&self) -> ConflictStrategy {
        *self.strategy.read().await
    }

    pub async fn set_conflict_resolution_strategy(&self, strategy: ConflictStrategy) {
        *self.strategy.write().await = strategy;
        info!("Conflict resolution strategy set to {:?}", strategy);
    }

    /// Conflicts parked for a manual decision.
    pub async fn conflicted_entities(&self) -> Vec<ConflictedEntity> {
        self.ledger.lock().await.list()
    }

    fn set_phase(&self, phase: SyncPhase) {
        self.phase.send_replace(phase);
    }

    /// Returns to idle after a pass, or disables sync if the account went away.
    fn settle_phase<T>(&self, result: &SyncResult<T>) {
        match result {
            Err(e) if e.class() == ErrorClass::RemoteUnavailable => {
                self.set_phase(SyncPhase::DisabledUntilReauthorized)
            }
            _ => self.set_phase(SyncPhase::Idle),
        }
    }

    // ── Authorization ────────────────────────────────────────────

    /// Checks the remote account, entering or leaving the disabled state.
    pub async fn ensure_authorized(&self) -> SyncResult<()> {
        let remote = self.zones.remote();
        let status = match with_retry(&self.config.retry, "account status", || {
            remote.account_status()
        })
        .await
        {
            Ok(status) => status,
            Err(e) => {
                if e.class() == ErrorClass::RemoteUnavailable {
                    self.set_phase(SyncPhase::DisabledUntilReauthorized);
                }
                return Err(e);
            }
        };

        if !status.is_available() {
            warn!("Remote account unavailable ({:?}); sync disabled", status);
            self.set_phase(SyncPhase::DisabledUntilReauthorized);
            return Err(SyncError::RemoteUnavailable(format!("account status {status:?}")));
        }
        if self.phase() == SyncPhase::DisabledUntilReauthorized {
            info!("Remote account available again; sync re-enabled");
            self.set_phase(SyncPhase::Idle);
        }
        Ok(())
    }

    // ── Public passes ────────────────────────────────────────────

    /// Creates the zones and runs the first full sync.
    ///
    /// Failures are returned to the caller; the completed flag is set only
    /// on success.
    pub async fn perform_initial_sync(&self) -> SyncResult<SyncReport> {
        let _pass = self.pass_lock.lock().await;
        self.ensure_authorized().await?;
        let created = self.zones.create_all().await?;
        debug!("Initial sync created {} zones", created);

        let result = self.full_locked().await;
        if result.is_ok() {
            self.db
                .run_blocking(|db| db.set_initial_sync_completed(true))
                .await?;
            self.initial_sync.send_replace(true);
            info!("Initial sync completed");
        }
        self.run_reruns().await;
        result
    }

    /// Runs a full bidirectional sync.
    pub async fn perform_full_sync(&self) -> SyncResult<SyncReport> {
        let _pass = self.pass_lock.lock().await;
        self.ensure_authorized().await?;
        let result = self.full_locked().await;
        self.run_reruns().await;
        result
    }

    /// Runs an incremental sync over every zone.
    pub async fn perform_incremental_sync(&self) -> SyncResult<SyncReport> {
        let _pass = self.pass_lock.lock().await;
        self.ensure_authorized().await?;
        let result = self.incremental_locked(None).await;
        self.run_reruns().await;
        result
    }

    /// Runs an incremental sync of a single zone.
    ///
    /// The last sync timestamp is left alone, since other zones were not
    /// looked at.
    pub async fn sync_zone(&self, zone: &ZoneId) -> SyncResult<SyncReport> {
        let _pass = self.pass_lock.lock().await;
        self.ensure_authorized().await?;
        let result = self.incremental_locked(Some(zone)).await;
        self.run_reruns().await;
        result
    }

    /// Schedules an incremental pass for an external event.
    ///
    /// If a pass is already running the trigger only marks that one more
    /// pass is needed. Pass failures are logged, not returned.
    pub async fn trigger(&self, trigger: SyncTrigger) -> TriggerOutcome {
        let Ok(mut guard) = self.pass_lock.try_lock() else {
            self.rerun.store(true, Ordering::SeqCst);
            debug!("Sync already running; {:?} coalesced", trigger);
            return TriggerOutcome::Coalesced;
        };
        let mut zone = match trigger {
            SyncTrigger::RemoteNotification { zone } => zone,
            SyncTrigger::Foreground | SyncTrigger::UserRequested => None,
        };
        loop {
            self.rerun.store(false, Ordering::SeqCst);
            let result = match self.ensure_authorized().await {
                Ok(()) => self.incremental_locked(zone.as_ref()).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!("Triggered sync failed: {}", e);
            }
            self.run_reruns().await;
            drop(guard);

            // A trigger may have slipped in between the last check and the unlock.
            if !self.rerun.load(Ordering::SeqCst) {
                return TriggerOutcome::Ran;
            }
            zone = None;
            guard = match self.pass_lock.try_lock() {
                Ok(g) => g,
                Err(_) => return TriggerOutcome::Ran,
            };
        }
    }

    /// Runs the incremental passes requested while the lock was held.
    async fn run_reruns(&self) {
        while self.rerun.swap(false, Ordering::SeqCst) {
            debug!("Running coalesced sync");
            let result = match self.ensure_authorized().await {
                Ok(()) => self.incremental_locked(None).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!("Coalesced sync failed: {}", e);
                break;
            }
        }
    }

    // ── Full sync ────────────────────────────────────────────────

    async fn full_locked(&self) -> SyncResult<SyncReport> {
        self.set_phase(SyncPhase::FullSyncInProgress);
        let result = self.full_pass().await;
        self.settle_phase(&result);
        match &result {
            Ok(r) => info!(
                "Full sync complete: {} downloaded, {} deleted, {} uploaded, {} conflicts",
                r.downloaded, r.deleted, r.uploaded, r.conflicts
            ),
            Err(e) => warn!("Full sync failed: {}", e),
        }
        result
    }

    async fn full_pass(&self) -> SyncResult<SyncReport> {
        let started = Utc::now();
        let mut report = SyncReport::new(SyncKind::Full);
        self.push_pending_into(&mut report).await?;
        let last_sync = self.db.run_blocking(|db| db.last_sync_timestamp()).await?;

        let remote_zones = self.zones.list_zones().await?;
        for rt in self.codecs.record_types() {
            let (records, strays) = self.zones.fetch_owned(rt, &remote_zones).await?;
            report.reconciled += strays;
            debug!("Downloaded {} {} records", records.len(), rt);
            self.apply_remote(records, Vec::new(), last_sync, &mut report)
                .await?;
        }

        for rt in self.codecs.record_types() {
            let entities = self.local_fetch_all(rt).await?;
            let mut records = Vec::with_capacity(entities.len());
            {
                let ledger = self.ledger.lock().await;
                for entity in &entities {
                    if ledger.contains(&entity.key()) {
                        continue;
                    }
                    match self.codecs.encode(entity) {
                        Ok(record) => records.push(record),
                        Err(e) => warn!("Not uploading {}: {}", entity.key(), e),
                    }
                }
            }
            for chunk in records.chunks(self.config.batch_size) {
                let saved = self.zones.save_batch(chunk).await?;
                report.uploaded += saved.len();
            }
        }

        self.db
            .run_blocking(move |db| db.set_last_sync_timestamp(started))
            .await?;
        Ok(report)
    }

    // ── Incremental sync ─────────────────────────────────────────

    async fn incremental_locked(&self, only: Option<&ZoneId>) -> SyncResult<SyncReport> {
        let Some(last_sync) = self.db.run_blocking(|db| db.last_sync_timestamp()).await? else {
            info!("No completed sync on record; running full sync instead");
            return self.full_locked().await;
        };
        self.set_phase(SyncPhase::IncrementalSyncInProgress);
        let result = self.incremental_pass(only, last_sync).await;
        self.settle_phase(&result);
        match &result {
            Ok(r) => info!(
                "Incremental sync complete: {} downloaded, {} deleted, {} conflicts",
                r.downloaded, r.deleted, r.conflicts
            ),
            Err(e) => warn!("Incremental sync failed: {}", e),
        }
        result
    }

    async fn incremental_pass(
        &self,
        only: Option<&ZoneId>,
        last_sync: DateTime<Utc>,
    ) -> SyncResult<SyncReport> {
        let started = Utc::now();
        let mut report = SyncReport::new(SyncKind::Incremental);
        self.push_pending_into(&mut report).await?;
        let remote = self.zones.remote();
        let mut first_error: Option<SyncError> = None;

        for scope in self.zones.table().scopes() {
            let db_scope = TokenScope::Database(scope);
            let (changed_zones, deleted_zones, db_token) = match only {
                Some(zone) if zone.scope == scope => (vec![zone.clone()], Vec::new(), None),
                Some(_) => continue,
                None => {
                    let mut token = self.tokens.lock().await.token_for(&db_scope).cloned();
                    let mut changed = Vec::new();
                    let mut deleted = Vec::new();
                    loop {
                        let page = with_retry(&self.config.retry, "fetch database changes", || {
                            remote.fetch_database_changes(scope, token.as_ref())
                        })
                        .await?;
                        changed.extend(page.changed_zones);
                        deleted.extend(page.deleted_zones);
                        if page.token.is_some() {
                            token = page.token;
                        }
                        if !page.more_coming {
                            break;
                        }
                    }
                    (changed, deleted, token)
                }
            };

            if !deleted_zones.is_empty() {
                let mut tokens = self.tokens.lock().await;
                for zone in &deleted_zones {
                    if tokens.remove(&TokenScope::Zone(zone.clone())).is_some() {
                        info!("Zone {} was deleted remotely; dropped its change token", zone);
                    }
                }
                tokens.persist_all()?;
            }

            let targets: Vec<ZoneId> = changed_zones
                .into_iter()
                .filter(|z| self.zones.table().get(z).is_some())
                .collect();
            debug!("{} zones changed in {} database", targets.len(), scope);

            let fetched = join_all(targets.iter().map(|zone| self.fetch_zone_delta(zone))).await;

            let mut scope_ok = true;
            for (zone, result) in targets.iter().zip(fetched) {
                let outcome = match result {
                    Ok(delta) => {
                        let token = delta.token;
                        self.apply_remote(delta.changed, delta.deleted, Some(last_sync), &mut report)
                            .await
                            .map(|()| token)
                    }
                    Err(e) => Err(e),
                };
                match outcome {
                    Ok(Some(token)) => {
                        let mut tokens = self.tokens.lock().await;
                        tokens.update(&TokenScope::Zone(zone.clone()), token);
                        tokens.persist_all()?;
                        debug!("Advanced change token for {}", zone);
                    }
                    Ok(None) => {}
                    Err(e) if e.class() == ErrorClass::RemoteUnavailable => return Err(e),
                    Err(e) => {
                        warn!("Zone {} not synced; token kept: {}", zone, e);
                        scope_ok = false;
                        first_error.get_or_insert(e);
                    }
                }
            }

            if scope_ok && let Some(token) = db_token {
                let mut tokens = self.tokens.lock().await;
                tokens.update(&db_scope, token);
                tokens.persist_all()?;
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        // A single-zone pass says nothing about local edits in other zones.
        if only.is_none() {
            self.db
                .run_blocking(move |db| db.set_last_sync_timestamp(started))
                .await?;
        }
        Ok(report)
    }

    /// Fetches every change page of a zone since its stored token.
    ///
    /// Later pages supersede earlier ones, so each key appears at most once.
    async fn fetch_zone_delta(&self, zone: &ZoneId) -> SyncResult<ZoneDelta> {
        let remote = self.zones.remote();
        let scope = TokenScope::Zone(zone.clone());
        let mut token = self.tokens.lock().await.token_for(&scope).cloned();
        let mut events: BTreeMap<String, ZoneEvent> = BTreeMap::new();
        loop {
            let page = with_retry(&self.config.retry, "fetch zone changes", || {
                remote.fetch_zone_changes(zone, token.as_ref())
            })
            .await?;
            for deleted in page.deleted {
                events.insert(deleted.key.clone(), ZoneEvent::Deleted(deleted));
            }
            for record in page.changed {
                events.insert(record.key.clone(), ZoneEvent::Changed(record));
            }
            if page.token.is_some() {
                token = page.token;
            }
            if !page.more_coming {
                break;
            }
        }

        let mut delta = ZoneDelta {
            token,
            ..ZoneDelta::default()
        };
        for event in events.into_values() {
            match event {
                ZoneEvent::Changed(record) => delta.changed.push(record),
                ZoneEvent::Deleted(deleted) => delta.deleted.push(deleted),
            }
        }
        Ok(delta)
    }

    // ── Applying remote changes ──────────────────────────────────

    /// Applies remote deletions, then remote changes, in local batches.
    async fn apply_remote(
        &self,
        changed: Vec<Record>,
        deleted: Vec<DeletedRecord>,
        last_sync: Option<DateTime<Utc>>,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        let mut deletions = Vec::with_capacity(deleted.len());
        for d in deleted {
            let key = match RecordKey::parse(&d.key) {
                Ok(key) => key,
                Err(e) => {
                    warn!("Ignoring remote deletion of {}: {}", d.key, e);
                    report.skipped += 1;
                    continue;
                }
            };
            if self.check_conflict(key, None, None, last_sync, report).await? == RemoteAction::Apply {
                deletions.push(LocalChange::Delete(key));
            }
        }
        for chunk in deletions.chunks(self.config.batch_size) {
            let event = self.local_apply(chunk.to_vec()).await?;
            report.deleted += event.deleted.len();
        }

        let mut upserts = Vec::with_capacity(changed.len());
        for record in changed {
            let entity = match self.codecs.decode(&record) {
                Ok(entity) => entity,
                Err(e) => {
                    warn!("Skipping undecodable record {}: {}", record.key, e);
                    report.skipped += 1;
                    continue;
                }
            };
            let key = entity.key();
            if self
                .check_conflict(key, Some(&record), Some(&entity), last_sync, report)
                .await?
                == RemoteAction::Apply
            {
                upserts.push(LocalChange::Upsert(entity));
            }
        }
        for chunk in upserts.chunks(self.config.batch_size) {
            let event = self.local_apply(chunk.to_vec()).await?;
            report.downloaded += event.inserted.len() + event.updated.len();
            debug!("Applied batch of {} remote records", chunk.len());
        }
        Ok(())
    }

    /// Decides whether an incoming change may overwrite local state.
    ///
    /// `remote` and `incoming` are `None` for a remote deletion.
    async fn check_conflict(
        &self,
        key: RecordKey,
        remote: Option<&Record>,
        incoming: Option<&Entity>,
        last_sync: Option<DateTime<Utc>>,
        report: &mut SyncReport,
    ) -> SyncResult<RemoteAction> {
        {
            let mut ledger = self.ledger.lock().await;
            if ledger.contains(&key) {
                ledger.update_remote(&key, remote.cloned());
                report.skipped += 1;
                return Ok(RemoteAction::Skip);
            }
        }

        let pending = self.queue.run_blocking(move |q| q.pending_for(&key)).await?;
        let local = self.local_fetch(key).await?;

        // Same state on both sides: nothing to settle.
        if local.as_ref() == incoming {
            if pending.is_some() {
                self.discard_pending(key).await?;
            }
            return Ok(RemoteAction::Apply);
        }

        let locally_modified = pending.is_some()
            || matches!((&local, last_sync), (Some(l), Some(ls)) if l.modified_at() > ls);
        if !locally_modified {
            return Ok(RemoteAction::Apply);
        }

        report.conflicts += 1;
        let local_modified = local
            .as_ref()
            .map(Entity::modified_at)
            .or(pending.as_ref().map(|p| p.enqueued_at))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let remote_modified = remote.and_then(|r| r.modified_at);
        let strategy = *self.strategy.read().await;

        match conflict::resolve(strategy, local_modified, remote_modified) {
            ConflictDecision::UseRemote => {
                debug!("Conflict on {}: remote wins ({:?})", key, strategy);
                self.discard_pending(key).await?;
                Ok(RemoteAction::Apply)
            }
            ConflictDecision::UseLocal => {
                debug!("Conflict on {}: local wins ({:?})", key, strategy);
                self.requeue_local(key, local.as_ref()).await?;
                Ok(RemoteAction::Skip)
            }
            ConflictDecision::RequiresManualResolution => {
                info!("Conflict on {} parked for manual resolution", key);
                self.discard_pending(key).await?;
                self.ledger.lock().await.record(ConflictedEntity {
                    key,
                    local,
                    remote: remote.cloned(),
                    detected_at: Utc::now(),
                });
                report.skipped += 1;
                Ok(RemoteAction::Skip)
            }
        }
    }

    /// Queues the local version of an entity so it overwrites the remote.
    async fn requeue_local(&self, key: RecordKey, local: Option<&Entity>) -> SyncResult<()> {
        let op = match local {
            Some(entity) => PendingOperation::modify(self.codecs.encode(entity)?)?,
            None => PendingOperation::delete(key),
        };
        self.queue.run_blocking(move |q| q.enqueue(op)).await?;
        Ok(())
    }

    async fn discard_pending(&self, key: RecordKey) -> SyncResult<bool> {
        self.queue.run_blocking(move |q| q.remove_for(&key)).await
    }

    /// Settles a parked conflict. Returns false if none is parked for `key`.
    pub async fn resolve_conflict(
        &self,
        key: &RecordKey,
        decision: ConflictDecision,
    ) -> SyncResult<bool> {
        if decision == ConflictDecision::RequiresManualResolution {
            return Err(SyncError::Config(
                "a conflict must be resolved in favor of one side".into(),
            ));
        }
        let Some(conflict) = self.ledger.lock().await.get(key).cloned() else {
            return Ok(false);
        };

        match decision {
            ConflictDecision::UseRemote => {
                let change = match &conflict.remote {
                    Some(record) => LocalChange::Upsert(self.codecs.decode(record)?),
                    None => LocalChange::Delete(*key),
                };
                self.discard_pending(*key).await?;
                self.local_apply(vec![change]).await?;
            }
            ConflictDecision::UseLocal | ConflictDecision::RequiresManualResolution => {
                self.requeue_local(*key, conflict.local.as_ref()).await?;
            }
        }
        self.ledger.lock().await.take(key);
        info!("Resolved conflict on {}: {:?}", key, decision);

        if decision == ConflictDecision::UseLocal
            && let Err(e) = self.push_pending().await
        {
            warn!("Push after conflict resolution failed: {}", e);
        }
        Ok(true)
    }

    // ── Local changes ────────────────────────────────────────────

    /// Turns a local commit into queued operations and pushes them when
    /// online. Commits made by the sync engine itself are ignored.
    ///
    /// Returns the number of operations enqueued.
    pub async fn handle_local_commit(&self, event: CommitEvent) -> SyncResult<usize> {
        if event.origin == ChangeOrigin::Sync || event.is_empty() {
            return Ok(0);
        }

        let mut enqueued = 0;
        {
            let mut ledger = self.ledger.lock().await;
            let upserts = event
                .inserted
                .iter()
                .map(|e| (e, true))
                .chain(event.updated.iter().map(|e| (e, false)));
            for (entity, inserted) in upserts {
                let key = entity.key();
                if ledger.contains(&key) {
                    ledger.update_local(&key, Some(entity.clone()));
                    continue;
                }
                let record = match self.codecs.encode(entity) {
                    Ok(record) => record,
                    Err(e) => {
                        warn!("Not queueing {}: {}", key, e);
                        continue;
                    }
                };
                let op = if inserted {
                    PendingOperation::save(record)?
                } else {
                    PendingOperation::modify(record)?
                };
                self.queue.run_blocking(move |q| q.enqueue(op)).await?;
                enqueued += 1;
            }
            for key in &event.deleted {
                if ledger.contains(key) {
                    ledger.update_local(key, None);
                    continue;
                }
                let op = PendingOperation::delete(*key);
                self.queue.run_blocking(move |q| q.enqueue(op)).await?;
                enqueued += 1;
            }
        }
        debug!("Queued {} local changes", enqueued);

        if self.queue.is_online() {
            let report = self.push_pending().await?;
            if let Some(e) = report.halted {
                debug!("Push deferred: {}", e);
            }
        }
        Ok(enqueued)
    }

    /// Starts listening to local commits.
    ///
    /// If the listener falls behind and misses commits, the last sync
    /// timestamp is cleared so the next pass is a full sync.
    pub fn start_change_detection(self: &Arc<Self>) -> JoinHandle<()> {
        let mut commits = self.local.subscribe();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match commits.recv().await {
                    Ok(event) => {
                        if let Err(e) = this.handle_local_commit(event).await {
                            warn!("Failed to record local changes: {}", e);
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Missed {} local commits; forcing a full sync", missed);
                        if let Err(e) = this
                            .db
                            .run_blocking(|db| db.clear_last_sync_timestamp())
                            .await
                        {
                            warn!("Failed to clear last sync timestamp: {}", e);
                        }
                    }
                    Err(RecvError::Closed) => {
                        debug!("Local commit stream closed");
                        break;
                    }
                }
            }
        })
    }

    // ── Offline queue ────────────────────────────────────────────

    /// Drains the offline queue if online.
    pub async fn push_pending(&self) -> SyncResult<DrainReport> {
        if !self.queue.is_online() {
            return Ok(DrainReport::default());
        }
        let _drain = self.drain_lock.lock().await;
        self.queue
            .drain_all(self.zones.as_ref(), self.config.max_drain_batch)
            .await
    }

    async fn push_pending_into(&self, report: &mut SyncReport) -> SyncResult<()> {
        let drained = self.push_pending().await?;
        report.pushed += drained.applied;
        report.dropped += drained.dropped.len();
        match drained.halted {
            Some(e) if e.class() == ErrorClass::RemoteUnavailable => Err(e),
            Some(e) => {
                debug!("Pending operations left queued: {}", e);
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Updates connectivity. Going online pushes pending operations.
    pub async fn set_online(&self, online: bool) {
        self.queue.set_online(online);
        if online {
            match self.push_pending().await {
                Ok(report) if report.applied > 0 => {
                    debug!("Pushed {} operations after reconnecting", report.applied)
                }
                Ok(_) => {}
                Err(e) => warn!("Push after reconnecting failed: {}", e),
            }
        }
    }

    /// Forgets tokens, the last sync time and parked conflicts so the next
    /// pass starts from scratch. Queued local changes are kept.
    pub async fn reset_sync_state(&self) -> SyncResult<()> {
        let _pass = self.pass_lock.lock().await;
        {
            let mut tokens = self.tokens.lock().await;
            tokens.clear();
            tokens.persist_all()?;
        }
        self.db
            .run_blocking(|db| {
                db.clear_last_sync_timestamp()?;
                db.set_initial_sync_completed(false)
            })
            .await?;
        self.initial_sync.send_replace(false);
        self.ledger.lock().await.clear();
        info!("Sync state reset");
        Ok(())
    }

    // ── Local store access ───────────────────────────────────────

    async fn local_apply(&self, changes: Vec<LocalChange>) -> SyncResult<CommitEvent> {
        let local = Arc::clone(&self.local);
        tokio::task::spawn_blocking(move || local.apply(ChangeOrigin::Sync, changes))
            .await
            .map_err(|e| SyncError::LocalStore(format!("local store task failed: {e}")))?
    }

    async fn local_fetch(&self, key: RecordKey) -> SyncResult<Option<Entity>> {
        let local = Arc::clone(&self.local);
        tokio::task::spawn_blocking(move || local.fetch(&key))
            .await
            .map_err(|e| SyncError::LocalStore(format!("local store task failed: {e}")))?
    }

    async fn local_fetch_all(&self, record_type: RecordType) -> SyncResult<Vec<Entity>> {
        let local = Arc::clone(&self.local);
        tokio::task::spawn_blocking(move || local.fetch_all(record_type))
            .await
            .map_err(|e| SyncError::LocalStore(format!("local store task failed: {e}")))?
    }
}
