//! Sync configuration.

use crate::conflict::ConflictStrategy;
use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Number of records applied per local transaction and pushed per remote call.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// File name of the sync state database inside `state_dir`.
pub const STATE_DB_FILE: &str = "sync_state.db";

/// File name of the change token document inside `state_dir`.
pub const TOKENS_FILE: &str = "change_tokens.json";

/// Configuration for the sync coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Remote container identifier.
    pub container_id: String,
    /// Directory holding persisted sync state. `None` keeps everything in memory.
    pub state_dir: Option<PathBuf>,
    /// Records per local transaction / remote save call.
    pub batch_size: usize,
    /// Operations popped from the offline queue per drain round.
    pub max_drain_batch: usize,
    /// Strategy applied when both sides changed the same entity.
    pub conflict_strategy: ConflictStrategy,
    /// Backoff for individual remote calls.
    pub retry: RetryPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            container_id: "iCloud.com.fitcoach.app".to_string(),
            state_dir: None,
            batch_size: DEFAULT_BATCH_SIZE,
            max_drain_batch: 50,
            conflict_strategy: ConflictStrategy::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl SyncConfig {
    /// Loads a configuration from a JSON file. Missing keys take defaults.
    pub fn from_path(path: impl AsRef<Path>) -> SyncResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: SyncConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the coordinator cannot work with.
    pub fn validate(&self) -> SyncResult<()> {
        if self.batch_size == 0 {
            return Err(SyncError::Config("batch_size must be at least 1".into()));
        }
        if self.max_drain_batch == 0 {
            return Err(SyncError::Config("max_drain_batch must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(SyncError::Config("retry.max_attempts must be at least 1".into()));
        }
        Ok(())
    }

    /// Path of the sync state database, if state is persisted.
    pub fn state_db_path(&self) -> Option<PathBuf> {
        self.state_dir.as_ref().map(|d| d.join(STATE_DB_FILE))
    }

    /// Path of the change token file, if state is persisted.
    pub fn tokens_path(&self) -> Option<PathBuf> {
        self.state_dir.as_ref().map(|d| d.join(TOKENS_FILE))
    }
}

/// Exponential backoff for remote calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt (ms).
    pub base_delay_ms: u64,
    /// Upper bound on any single delay (ms).
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let ms = self.base_delay_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(ms.min(self.max_delay_ms))
    }
}
