//! Offline inspection and repair of a FitCoach sync state directory.
//!
//! Everything here works on the files the sync engine leaves behind (the
//! state database and the change token document) and never talks to the
//! remote. Run it while the app is not syncing.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use fitcoach_sync::{
    ChangeTokenStore, OfflineQueue, OperationKind, PendingOperation, SyncConfig, SyncDatabase,
};
use fitcoach_types::OperationId;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Effective configuration for a state directory.
///
/// Reads `config` if given (missing keys take defaults); `state_dir` always
/// overrides whatever the file says.
pub fn load_config(state_dir: &Path, config: Option<&Path>) -> Result<SyncConfig> {
    let mut loaded = match config {
        Some(path) => SyncConfig::from_path(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => SyncConfig::default(),
    };
    loaded.state_dir = Some(state_dir.to_path_buf());
    Ok(loaded)
}

fn state_dir(config: &SyncConfig) -> Result<&Path> {
    let dir = config
        .state_dir
        .as_deref()
        .context("No state directory configured")?;
    if !dir.is_dir() {
        bail!("No sync state at {}", dir.display());
    }
    Ok(dir)
}

fn open_database(config: &SyncConfig) -> Result<SyncDatabase> {
    state_dir(config)?;
    let path = config
        .state_db_path()
        .context("No state directory configured")?;
    debug!("Opening sync state {}", path.display());
    SyncDatabase::open(&path).with_context(|| format!("Failed to open {}", path.display()))
}

fn open_tokens(config: &SyncConfig) -> Result<(PathBuf, ChangeTokenStore)> {
    state_dir(config)?;
    let path = config.tokens_path().context("No state directory configured")?;
    let store = ChangeTokenStore::open(&path)
        .with_context(|| format!("Failed to read change tokens from {}", path.display()))?;
    Ok((path, store))
}

// ── Status ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenEntry {
    pub scope: String,
    /// Base64 token bytes.
    pub token: String,
}

/// What the engine remembers about a state directory.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateSummary {
    pub initial_sync_completed: bool,
    pub last_sync: Option<DateTime<Utc>>,
    pub tokens: Vec<TokenEntry>,
    pub pending_operations: usize,
    pub subscriptions: Vec<String>,
}

pub fn summarize(config: &SyncConfig) -> Result<StateSummary> {
    let db = open_database(config)?;
    let (_, tokens) = open_tokens(config)?;
    let queue = OfflineQueue::new(db.clone());

    Ok(StateSummary {
        initial_sync_completed: db.initial_sync_completed()?,
        last_sync: db.last_sync_timestamp()?,
        tokens: tokens
            .entries()
            .map(|(scope, token)| TokenEntry {
                scope: scope.to_string(),
                token: token.to_base64(),
            })
            .collect(),
        pending_operations: queue.len()?,
        subscriptions: db.subscription_ids()?,
    })
}

// ── Queue ────────────────────────────────────────────────────────

/// One queued operation as shown to operators. Payloads are left out.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueEntry {
    pub id: String,
    pub kind: OperationKind,
    pub key: String,
    pub retry_count: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl From<PendingOperation> for QueueEntry {
    fn from(op: PendingOperation) -> Self {
        Self {
            id: op.id.to_string(),
            kind: op.kind,
            key: op.key.to_string(),
            retry_count: op.retry_count,
            enqueued_at: op.enqueued_at,
        }
    }
}

/// Pending operations in drain order.
pub fn list_queue(config: &SyncConfig) -> Result<Vec<QueueEntry>> {
    let queue = OfflineQueue::new(open_database(config)?);
    Ok(queue.list()?.into_iter().map(QueueEntry::from).collect())
}

/// Removes one pending operation. Unknown IDs are an error.
pub fn drop_operation(config: &SyncConfig, id: &str) -> Result<()> {
    let id = OperationId::parse(id).with_context(|| format!("Invalid operation ID: {id}"))?;
    let queue = OfflineQueue::new(open_database(config)?);
    if !queue.remove(id)? {
        bail!("No pending operation with ID {id}");
    }
    info!("Dropped pending operation {}", id);
    Ok(())
}

// ── Reset ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ResetReport {
    pub tokens_cleared: usize,
    pub operations_purged: usize,
}

/// Forgets change tokens, the last sync timestamp and the initial sync flag,
/// so the next launch performs a full sync. Queued operations survive unless
/// `purge_queue` is set.
pub fn reset_state(config: &SyncConfig, purge_queue: bool) -> Result<ResetReport> {
    let db = open_database(config)?;
    let (path, mut tokens) = open_tokens(config)?;

    let mut report = ResetReport {
        tokens_cleared: tokens.len(),
        ..ResetReport::default()
    };
    tokens.clear();
    tokens
        .persist_all()
        .with_context(|| format!("Failed to write {}", path.display()))?;
    db.clear_last_sync_timestamp()?;
    db.set_initial_sync_completed(false)?;

    if purge_queue {
        let queue = OfflineQueue::new(db);
        report.operations_purged = queue.clear()?;
    }
    info!(
        "Reset sync state: {} tokens cleared, {} operations purged",
        report.tokens_cleared, report.operations_purged
    );
    Ok(report)
}
