//! Sync state database.
//!
//! One SQLite file holds everything the engine must remember across
//! restarts besides change tokens: the offline operation queue, sync
//! metadata (last successful sync) and registered subscription IDs.

use crate::error::{SyncError, SyncResult};
use crate::zone::DatabaseScope;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

const LAST_SYNC_KEY: &str = "last_sync_timestamp";
const INITIAL_SYNC_KEY: &str = "initial_sync_completed";

/// Shared handle to the sync state database.
#[derive(Clone)]
pub struct SyncDatabase {
    conn: Arc<Mutex<Connection>>,
}

impl SyncDatabase {
    /// Opens (or creates) the database at the given path.
    pub fn open(path: impl AsRef<Path>) -> SyncResult<Self> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| SyncError::Storage(format!("failed to open sync state: {e}")))?;
        Self::init(conn)
    }

    /// Opens an in-memory database (for testing).
    pub fn open_in_memory() -> SyncResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| SyncError::Storage(format!("failed to open in-memory sync state: {e}")))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> SyncResult<Self> {
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> SyncResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS pending_operations (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                kind TEXT NOT NULL,
                record_type TEXT NOT NULL,
                record_key TEXT NOT NULL UNIQUE,
                payload TEXT,
                enqueued_at TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS sync_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS subscriptions (
                scope TEXT NOT NULL,
                id TEXT NOT NULL,
                registered_at TEXT NOT NULL,
                PRIMARY KEY (scope, id)
            );
            ",
        )
        .map_err(|e| SyncError::Storage(format!("failed to init sync schema: {e}")))?;
        Ok(())
    }

    /// Runs blocking database calls on the blocking thread pool.
    pub async fn run_blocking<T, F>(&self, f: F) -> SyncResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&SyncDatabase) -> SyncResult<T> + Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| SyncError::Storage(format!("sync state task failed: {e}")))?
    }

    /// Locks the connection.
    pub(crate) fn conn(&self) -> SyncResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SyncError::Storage("sync state lock poisoned".into()))
    }

    // ── Metadata ─────────────────────────────────────────────────

    pub fn get_meta(&self, key: &str) -> SyncResult<Option<String>> {
        let conn = self.conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM sync_meta WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_meta(&self, key: &str, value: &str) -> SyncResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sync_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn delete_meta(&self, key: &str) -> SyncResult<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM sync_meta WHERE key = ?1", params![key])?;
        Ok(())
    }

    /// Start time of the last sync pass that completed.
    pub fn last_sync_timestamp(&self) -> SyncResult<Option<DateTime<Utc>>> {
        self.get_meta(LAST_SYNC_KEY)?
            .map(|raw| {
                DateTime::parse_from_rfc3339(&raw)
                    .map(|d| d.with_timezone(&Utc))
                    .map_err(|e| SyncError::Storage(format!("bad {LAST_SYNC_KEY}: {e}")))
            })
            .transpose()
    }

    pub fn set_last_sync_timestamp(&self, at: DateTime<Utc>) -> SyncResult<()> {
        self.set_meta(LAST_SYNC_KEY, &at.to_rfc3339())
    }

    pub fn clear_last_sync_timestamp(&self) -> SyncResult<()> {
        self.delete_meta(LAST_SYNC_KEY)
    }

    pub fn initial_sync_completed(&self) -> SyncResult<bool> {
        Ok(self.get_meta(INITIAL_SYNC_KEY)?.as_deref() == Some("true"))
    }

    pub fn set_initial_sync_completed(&self, done: bool) -> SyncResult<()> {
        if done {
            self.set_meta(INITIAL_SYNC_KEY, "true")
        } else {
            self.delete_meta(INITIAL_SYNC_KEY)
        }
    }

    // ── Subscriptions ────────────────────────────────────────────

    /// Records a registered subscription. Returns false if already known.
    pub fn insert_subscription(&self, scope: DatabaseScope, id: &str) -> SyncResult<bool> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO subscriptions (scope, id, registered_at) VALUES (?1, ?2, ?3)",
            params![scope.as_str(), id, Utc::now().to_rfc3339()],
        )?;
        Ok(inserted > 0)
    }

    pub fn has_subscription(&self, scope: DatabaseScope, id: &str) -> SyncResult<bool> {
        let conn = self.conn()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM subscriptions WHERE scope = ?1 AND id = ?2",
                params![scope.as_str(), id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn remove_subscription(&self, scope: DatabaseScope, id: &str) -> SyncResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM subscriptions WHERE scope = ?1 AND id = ?2",
            params![scope.as_str(), id],
        )?;
        Ok(())
    }

    /// Registered subscription IDs, ordered by registration.
    pub fn subscription_ids(&self) -> SyncResult<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id FROM subscriptions ORDER BY registered_at, id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }
}
