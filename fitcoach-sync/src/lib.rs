//! Cloud sync engine for FitCoach.
//!
//! Keeps the app's local store and a zoned remote record database in step
//! in both directions.
//!
//! # Architecture
//!
//! Local entities (exercises, workout sessions and sets, food entries, body
//! measurements, goals) are converted to flat remote records by the codec
//! and routed to zones by the zone manager. Each zone has a change feed;
//! change tokens remember how far each feed has been read, so most passes
//! only transfer deltas.
//!
//! ## Components
//!
//! - **Codec**: Entity ⇄ record conversion
//! - **Zones**: Static record-type to zone table, zone lifecycle and routing
//! - **Tokens**: Crash-safe change token persistence
//! - **Queue**: Durable offline queue of local mutations with coalescing
//! - **Coordinator**: Full and incremental passes, local change detection,
//!   conflict resolution
//! - **Subscriptions**: Push subscription registration and dispatch
//!
//! ## Sync Process
//!
//! 1. **Authorize**: Check the remote account; disable sync if unavailable
//! 2. **Push**: Drain queued local changes
//! 3. **Pull**: Fetch changed zones, then each zone's changes since its token
//! 4. **Apply**: Deletions first, then changes, resolving conflicts
//! 5. **Commit**: Advance tokens and the last sync timestamp
//!
//! # Example
//!
//! ```
//! use fitcoach_sync::{InMemoryLocalStore, InMemoryRemoteStore, SyncConfig, SyncCoordinator};
//! use std::sync::Arc;
//!
//! let coordinator = SyncCoordinator::open(
//!     SyncConfig::default(),
//!     Arc::new(InMemoryRemoteStore::new()),
//!     Arc::new(InMemoryLocalStore::new()),
//! )?;
//! assert!(!coordinator.is_initial_sync_completed());
//! # Ok::<(), fitcoach_sync::SyncError>(())
//! ```

pub mod codec;
pub mod config;
pub mod conflict;
mod coordinator;
pub mod db;
pub mod entity;
mod error;
pub mod local;
pub mod queue;
pub mod record;
pub mod remote;
mod retry;
pub mod state;
pub mod subscriptions;
pub mod tokens;
pub mod zone;

pub use codec::{CodecRegistry, DecodeError, RecordCodec};
pub use config::{RetryPolicy, SyncConfig};
pub use conflict::{ConflictDecision, ConflictStrategy, ConflictedEntity};
pub use coordinator::SyncCoordinator;
pub use db::SyncDatabase;
pub use entity::{
    BodyMeasurement, Entity, Exercise, ExerciseSet, FoodEntry, Goal, GoalKind, MealType,
    WorkoutSession, WorkoutStatus,
};
pub use error::{ErrorClass, SyncError, SyncResult};
pub use local::{ChangeOrigin, CommitEvent, InMemoryLocalStore, LocalChange, LocalStore};
pub use queue::{
    DrainReport, EnqueueOutcome, OfflineQueue, OperationApplier, OperationKind, PendingOperation,
};
pub use record::{DeletePolicy, FieldValue, Record, RecordReference};
pub use remote::{AccountStatus, InMemoryRemoteStore, RemoteStore};
pub use retry::with_retry;
pub use state::{SyncKind, SyncPhase, SyncReport, SyncTrigger, TriggerOutcome};
pub use subscriptions::{AlertSink, Notification, SubscriptionDispatcher};
pub use tokens::{ChangeToken, ChangeTokenStore, TokenScope};
pub use zone::{DatabaseScope, Zone, ZoneId, ZoneManager, ZoneTable};
