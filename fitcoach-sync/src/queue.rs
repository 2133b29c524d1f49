//! Offline operation queue.
//!
//! Local mutations waiting to reach the remote. The queue holds at most one
//! operation per record key: a new operation for a key already queued is
//! folded into the existing one (see [`OfflineQueue::enqueue`]). Operations
//! live in SQLite so they survive restarts.
//!
//! Draining applies operations in enqueue order. A transient failure stops
//! the round and leaves the operation queued with its retry count bumped;
//! a terminal failure drops the operation and reports it. Rows that can no
//! longer be read back are dropped the same way.

use crate::db::SyncDatabase;
use crate::error::{SyncError, SyncResult};
use crate::record::Record;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fitcoach_types::{OperationId, RecordKey};
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// What a queued operation does to its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// Create the record.
    Save,
    /// Update an existing record.
    Modify,
    /// Delete the record.
    Delete,
}

impl OperationKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Save => "save",
            OperationKind::Modify => "modify",
            OperationKind::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "save" => Ok(OperationKind::Save),
            "modify" => Ok(OperationKind::Modify),
            "delete" => Ok(OperationKind::Delete),
            other => Err(SyncError::Storage(format!("unknown operation kind: {other}"))),
        }
    }
}

/// A local mutation awaiting remote application.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOperation {
    pub id: OperationId,
    pub kind: OperationKind,
    pub key: RecordKey,
    /// Encoded record for saves and modifies; `None` for deletes.
    pub payload: Option<Record>,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
}

impl PendingOperation {
    fn new(kind: OperationKind, key: RecordKey, payload: Option<Record>) -> Self {
        Self {
            id: OperationId::new(),
            kind,
            key,
            payload,
            enqueued_at: Utc::now(),
            retry_count: 0,
        }
    }

    /// Creates a save carrying `record`.
    pub fn save(record: Record) -> SyncResult<Self> {
        let key = record.record_key()?;
        Ok(Self::new(OperationKind::Save, key, Some(record)))
    }

    /// Creates a modify carrying `record`.
    pub fn modify(record: Record) -> SyncResult<Self> {
        let key = record.record_key()?;
        Ok(Self::new(OperationKind::Modify, key, Some(record)))
    }

    /// Creates a delete for `key`.
    pub fn delete(key: RecordKey) -> Self {
        Self::new(OperationKind::Delete, key, None)
    }
}

/// Applies queued operations to the remote.
#[async_trait]
pub trait OperationApplier: Send + Sync {
    async fn apply(&self, op: &PendingOperation) -> SyncResult<()>;
}

/// Result of folding a new operation into the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Nothing was queued for the key; the operation went to the tail.
    Appended,
    /// An operation for the key was queued and has been merged.
    Coalesced,
    /// The operation is redundant with what is queued and was ignored.
    Discarded,
}

/// An operation removed from the queue without being applied.
#[derive(Debug, Clone)]
pub struct DroppedOperation {
    /// Record key, as stored.
    pub key: String,
    /// The operation, unless its row could not be decoded.
    pub op: Option<PendingOperation>,
    pub reason: String,
}

impl DroppedOperation {
    fn new(op: PendingOperation, reason: &SyncError) -> Self {
        Self {
            key: op.key.to_string(),
            op: Some(op),
            reason: reason.to_string(),
        }
    }
}

/// Outcome of a drain round.
#[derive(Debug, Default)]
pub struct DrainReport {
    pub applied: usize,
    pub dropped: Vec<DroppedOperation>,
    /// Error that stopped the round early, if any.
    pub halted: Option<SyncError>,
}

impl DrainReport {
    pub fn is_complete(&self) -> bool {
        self.halted.is_none()
    }
}

/// Durable FIFO of pending operations with per-key coalescing.
///
/// Clones share the database and the connectivity flag.
#[derive(Clone)]
pub struct OfflineQueue {
    db: SyncDatabase,
    online: Arc<AtomicBool>,
}

/// A queue row as stored, before decoding.
struct RawOperation {
    seq: i64,
    id: String,
    kind: String,
    key: String,
    payload: Option<String>,
    enqueued_at: String,
    retry_count: u32,
}

const SELECT_COLUMNS: &str = "SELECT seq, id, kind, record_key, payload, enqueued_at, retry_count
     FROM pending_operations";

impl RawOperation {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            id: row.get(1)?,
            kind: row.get(2)?,
            key: row.get(3)?,
            payload: row.get(4)?,
            enqueued_at: row.get(5)?,
            retry_count: row.get(6)?,
        })
    }

    fn decode(&self) -> SyncResult<PendingOperation> {
        Ok(PendingOperation {
            id: OperationId::parse(&self.id)
                .map_err(|e| SyncError::Storage(format!("bad operation id {}: {e}", self.id)))?,
            kind: self.kind.parse()?,
            key: RecordKey::parse(&self.key)?,
            payload: self
                .payload
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            enqueued_at: DateTime::parse_from_rfc3339(&self.enqueued_at)
                .map(|d| d.with_timezone(&Utc))
                .map_err(|e| SyncError::Storage(format!("bad enqueued_at: {e}")))?,
            retry_count: self.retry_count,
        })
    }

    /// Decodes the row, logging and skipping it if unreadable.
    fn decode_or_skip(self) -> Option<PendingOperation> {
        match self.decode() {
            Ok(op) => Some(op),
            Err(e) => {
                warn!("Unreadable queued operation for {}: {}", self.key, e);
                None
            }
        }
    }
}

fn encode_payload(payload: &Option<Record>) -> SyncResult<Option<String>> {
    let Some(record) = payload else {
        return Ok(None);
    };
    if let Some(field) = record.non_finite_field() {
        return Err(SyncError::Terminal(format!(
            "{}: field `{field}` is not a finite number",
            record.key
        )));
    }
    Ok(Some(serde_json::to_string(record)?))
}

impl OfflineQueue {
    /// Creates a queue over the given database. Starts online.
    pub fn new(db: SyncDatabase) -> Self {
        Self {
            db,
            online: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Runs blocking queue calls on the blocking thread pool.
    pub async fn run_blocking<T, F>(&self, f: F) -> SyncResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&OfflineQueue) -> SyncResult<T> + Send + 'static,
    {
        let queue = self.clone();
        tokio::task::spawn_blocking(move || f(&queue))
            .await
            .map_err(|e| SyncError::Storage(format!("queue task failed: {e}")))?
    }

    pub fn set_online(&self, online: bool) {
        let was = self.online.swap(online, Ordering::SeqCst);
        if was != online {
            info!("Connectivity changed: {}", if online { "online" } else { "offline" });
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Adds an operation, folding it into any operation queued for the same key.
    ///
    /// - A delete replaces whatever is queued and moves to the tail.
    /// - A modify after a queued delete is discarded.
    /// - A modify after a queued save keeps the save kind with the new payload.
    /// - A modify after a queued modify replaces the payload.
    /// - A save after a queued delete re-creates the record: it replaces the
    ///   delete at the tail with a fresh retry count.
    /// - A save after a queued save or modify replaces the payload as a save.
    ///
    /// In-place merges keep the original queue position and get a new
    /// operation ID, so a drain that is applying the old version cannot
    /// remove the merged one.
    pub fn enqueue(&self, op: PendingOperation) -> SyncResult<EnqueueOutcome> {
        let mut conn = self.db.conn()?;
        let tx = conn.transaction()?;
        let key = op.key.to_string();
        let existing: Option<String> = tx
            .query_row(
                "SELECT kind FROM pending_operations WHERE record_key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        let existing = existing.map(|k| k.parse::<OperationKind>()).transpose()?;
        let payload = encode_payload(&op.payload)?;

        let outcome = match (existing, op.kind) {
            (None, _) => {
                Self::insert(&tx, &op, &payload)?;
                EnqueueOutcome::Appended
            }
            (Some(_), OperationKind::Delete) | (Some(OperationKind::Delete), OperationKind::Save) => {
                tx.execute(
                    "DELETE FROM pending_operations WHERE record_key = ?1",
                    params![key],
                )?;
                Self::insert(&tx, &op, &payload)?;
                EnqueueOutcome::Coalesced
            }
            (Some(OperationKind::Delete), OperationKind::Modify) => EnqueueOutcome::Discarded,
            (Some(prior), new_kind) => {
                let kind = if prior == OperationKind::Save || new_kind == OperationKind::Save {
                    OperationKind::Save
                } else {
                    OperationKind::Modify
                };
                tx.execute(
                    "UPDATE pending_operations SET id = ?1, kind = ?2, payload = ?3
                     WHERE record_key = ?4",
                    params![op.id.to_string(), kind.as_str(), payload, key],
                )?;
                EnqueueOutcome::Coalesced
            }
        };
        tx.commit()?;
        debug!("Enqueued {} {}: {:?}", op.kind, op.key, outcome);
        Ok(outcome)
    }

    fn insert(
        tx: &rusqlite::Transaction<'_>,
        op: &PendingOperation,
        payload: &Option<String>,
    ) -> SyncResult<()> {
        tx.execute(
            "INSERT INTO pending_operations
                (id, kind, record_type, record_key, payload, enqueued_at, retry_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
            params![
                op.id.to_string(),
                op.kind.as_str(),
                op.key.record_type().as_str(),
                op.key.to_string(),
                payload,
                op.enqueued_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn peek_raw(&self, limit: usize) -> SyncResult<Vec<RawOperation>> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} ORDER BY seq LIMIT ?1"))?;
        let rows = stmt
            .query_map(params![limit as i64], RawOperation::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Up to `limit` operations from the head, in enqueue order.
    ///
    /// Rows that cannot be decoded are skipped; the next drain drops them.
    pub fn peek(&self, limit: usize) -> SyncResult<Vec<PendingOperation>> {
        Ok(self
            .peek_raw(limit)?
            .into_iter()
            .filter_map(RawOperation::decode_or_skip)
            .collect())
    }

    /// Every queued operation, in enqueue order.
    pub fn list(&self) -> SyncResult<Vec<PendingOperation>> {
        self.peek(i64::MAX as usize)
    }

    /// The operation queued for a key, if any.
    pub fn pending_for(&self, key: &RecordKey) -> SyncResult<Option<PendingOperation>> {
        let conn = self.db.conn()?;
        let raw = conn
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE record_key = ?1"),
                params![key.to_string()],
                RawOperation::from_row,
            )
            .optional()?;
        Ok(raw.and_then(RawOperation::decode_or_skip))
    }

    /// Removes the operation queued for a key. Returns true if one existed.
    pub fn remove_for(&self, key: &RecordKey) -> SyncResult<bool> {
        let conn = self.db.conn()?;
        let n = conn.execute(
            "DELETE FROM pending_operations WHERE record_key = ?1",
            params![key.to_string()],
        )?;
        Ok(n > 0)
    }

    /// Removes an operation by ID. Returns true if it existed.
    pub fn remove(&self, id: OperationId) -> SyncResult<bool> {
        let conn = self.db.conn()?;
        let n = conn.execute(
            "DELETE FROM pending_operations WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(n > 0)
    }

    pub fn len(&self) -> SyncResult<usize> {
        let conn = self.db.conn()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM pending_operations", [], |row| {
            row.get(0)
        })?;
        Ok(n as usize)
    }

    pub fn is_empty(&self) -> SyncResult<bool> {
        Ok(self.len()? == 0)
    }

    fn remove_row(&self, seq: i64) -> SyncResult<()> {
        let conn = self.db.conn()?;
        conn.execute("DELETE FROM pending_operations WHERE seq = ?1", params![seq])?;
        Ok(())
    }

    /// Drops every queued operation.
    pub fn clear(&self) -> SyncResult<usize> {
        let conn = self.db.conn()?;
        Ok(conn.execute("DELETE FROM pending_operations", [])?)
    }

    /// Bumps the retry count of an operation. Returns the new count, or
    /// `None` if the operation is no longer queued under that ID.
    fn bump_retry(&self, id: OperationId) -> SyncResult<Option<u32>> {
        let conn = self.db.conn()?;
        let count = conn
            .query_row(
                "UPDATE pending_operations SET retry_count = retry_count + 1
                 WHERE id = ?1 RETURNING retry_count",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(count)
    }

    /// Applies up to `max_batch` operations from the head of the queue.
    ///
    /// Queue I/O runs on the blocking pool between remote calls.
    pub async fn drain(
        &self,
        applier: &dyn OperationApplier,
        max_batch: usize,
    ) -> SyncResult<DrainReport> {
        let mut report = DrainReport::default();
        if max_batch == 0 {
            return Ok(report);
        }

        let rows = self.run_blocking(move |q| q.peek_raw(max_batch)).await?;
        for raw in rows {
            let op = match raw.decode() {
                Ok(op) => op,
                Err(e) => {
                    warn!("Dropping unreadable queued operation for {}: {}", raw.key, e);
                    let seq = raw.seq;
                    self.run_blocking(move |q| q.remove_row(seq)).await?;
                    report.dropped.push(DroppedOperation {
                        key: raw.key,
                        op: None,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            let id = op.id;
            match applier.apply(&op).await {
                Ok(()) => {
                    self.run_blocking(move |q| q.remove(id)).await?;
                    report.applied += 1;
                }
                Err(e) if e.is_terminal() => {
                    warn!("Dropping {} {}: {}", op.kind, op.key, e);
                    self.run_blocking(move |q| q.remove(id)).await?;
                    report.dropped.push(DroppedOperation::new(op, &e));
                }
                Err(e) if e.is_retryable() => {
                    let attempts = self.run_blocking(move |q| q.bump_retry(id)).await?;
                    debug!(
                        "{} {} failed ({} attempts), will retry: {}",
                        op.kind,
                        op.key,
                        attempts.unwrap_or_default(),
                        e
                    );
                    report.halted = Some(e);
                    break;
                }
                Err(e) => {
                    debug!("Drain halted at {} {}: {}", op.kind, op.key, e);
                    report.halted = Some(e);
                    break;
                }
            }
        }

        if report.applied > 0 || !report.dropped.is_empty() {
            info!(
                "Drained offline queue: {} applied, {} dropped",
                report.applied,
                report.dropped.len()
            );
        }
        Ok(report)
    }

    /// Drains in rounds of `max_batch` until the queue is empty or a round
    /// halts. Reports are merged.
    pub async fn drain_all(
        &self,
        applier: &dyn OperationApplier,
        max_batch: usize,
    ) -> SyncResult<DrainReport> {
        let mut total = DrainReport::default();
        loop {
            let round = self.drain(applier, max_batch).await?;
            let progressed = round.applied > 0 || !round.dropped.is_empty();
            total.applied += round.applied;
            total.dropped.extend(round.dropped);
            if round.halted.is_some() {
                total.halted = round.halted;
                break;
            }
            if !progressed || self.run_blocking(|q| q.is_empty()).await? {
                break;
            }
        }
        Ok(total)
    }
}
