//! Remote record store abstraction.
//!
//! The remote is a zoned record database: records live in named zones
//! inside a database scope, every zone keeps its own change feed, and the
//! database keeps a feed of which zones changed. Change feeds are resumed
//! from opaque [`ChangeToken`]s.

pub mod memory;

use crate::error::SyncResult;
use crate::record::{FieldValue, Record};
use crate::tokens::ChangeToken;
use crate::zone::{DatabaseScope, ZoneId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fitcoach_types::RecordType;
use serde::{Deserialize, Serialize};

pub use memory::{Failure, InMemoryRemoteStore, RemoteOp};

/// State of the user's remote account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountStatus {
    Available,
    NoAccount,
    Restricted,
    /// Credentials must be refreshed before any call can succeed.
    TemporarilyUnavailable,
    CouldNotDetermine,
}

impl AccountStatus {
    pub fn is_available(self) -> bool {
        self == AccountStatus::Available
    }
}

/// How a save treats fields already stored on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SavePolicy {
    /// Only fields present on the incoming record are overwritten;
    /// fields sent as [`FieldValue::Null`] are removed.
    #[default]
    ChangedKeys,
    /// The stored record is replaced wholesale.
    AllKeys,
}

/// Filter applied to a record query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Predicate {
    /// Matches every record.
    All,
    /// Field equals the given value.
    Equals { field: String, value: FieldValue },
    /// Date field is strictly after the given instant.
    After { field: String, date: DateTime<Utc> },
}

impl Predicate {
    /// Evaluates the predicate against a record.
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Predicate::All => true,
            Predicate::Equals { field, value } => record.get(field) == Some(value),
            Predicate::After { field, date } => {
                matches!(record.get(field), Some(FieldValue::Date(d)) if d > date)
            }
        }
    }
}

/// Opaque continuation of a paged query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryCursor(pub String);

/// A record query, either fresh or continued from a cursor.
#[derive(Debug, Clone)]
pub struct RecordQuery {
    pub zone: ZoneId,
    pub record_type: RecordType,
    pub predicate: Predicate,
    pub cursor: Option<QueryCursor>,
}

/// One page of query results.
#[derive(Debug, Clone, Default)]
pub struct QueryPage {
    pub records: Vec<Record>,
    /// Present when more results remain.
    pub cursor: Option<QueryCursor>,
}

/// Zones changed in a database since a token.
#[derive(Debug, Clone, Default)]
pub struct DatabaseChanges {
    pub changed_zones: Vec<ZoneId>,
    pub deleted_zones: Vec<ZoneId>,
    pub token: Option<ChangeToken>,
    pub more_coming: bool,
}

/// Key of a record deleted on the remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedRecord {
    pub record_type: RecordType,
    pub key: String,
}

/// Records changed in a zone since a token.
#[derive(Debug, Clone, Default)]
pub struct ZoneChanges {
    pub changed: Vec<Record>,
    pub deleted: Vec<DeletedRecord>,
    pub token: Option<ChangeToken>,
    pub more_coming: bool,
}

/// What a subscription watches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SubscriptionKind {
    /// Any change in the database. Delivered silently.
    Database,
    /// Any change in one zone.
    Zone { zone: ZoneId },
    /// Records of one type matching a predicate.
    Query {
        record_type: RecordType,
        predicate: Predicate,
    },
}

/// A server-side push subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub scope: DatabaseScope,
    pub kind: SubscriptionKind,
    /// Text of the user-visible alert, for subscriptions that raise one.
    pub alert_body: Option<String>,
}

/// Abstract remote record store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Returns the name of the remote provider.
    fn provider_name(&self) -> &'static str;

    /// Returns the state of the user's account.
    async fn account_status(&self) -> SyncResult<AccountStatus>;

    // ── Zones ──

    /// Creates a zone. Fails with `ZoneAlreadyExists` if present.
    async fn create_zone(&self, zone: &ZoneId) -> SyncResult<()>;

    /// Deletes a zone and every record in it.
    async fn delete_zone(&self, zone: &ZoneId) -> SyncResult<()>;

    /// Lists the zones present in a database scope.
    async fn list_zones(&self, scope: DatabaseScope) -> SyncResult<Vec<ZoneId>>;

    // ── Records ──

    /// Upserts records into a zone. Returns the stored versions, carrying
    /// the server modification time.
    async fn save_records(
        &self,
        zone: &ZoneId,
        records: &[Record],
        policy: SavePolicy,
    ) -> SyncResult<Vec<Record>>;

    /// Deletes records by key. Missing keys are not an error.
    async fn delete_records(&self, zone: &ZoneId, keys: &[String]) -> SyncResult<()>;

    /// Runs one page of a query.
    async fn query_records(&self, query: &RecordQuery) -> SyncResult<QueryPage>;

    // ── Change feeds ──

    /// Fetches zones changed in a scope since `token` (`None` = from the start).
    async fn fetch_database_changes(
        &self,
        scope: DatabaseScope,
        token: Option<&ChangeToken>,
    ) -> SyncResult<DatabaseChanges>;

    /// Fetches one page of record changes in a zone since `token`.
    async fn fetch_zone_changes(
        &self,
        zone: &ZoneId,
        token: Option<&ChangeToken>,
    ) -> SyncResult<ZoneChanges>;

    // ── Subscriptions ──

    /// Saves a subscription. Saving an existing ID succeeds without change.
    async fn save_subscription(&self, subscription: &Subscription) -> SyncResult<()>;

    /// Deletes a subscription. Missing IDs are not an error.
    async fn delete_subscription(&self, scope: DatabaseScope, id: &str) -> SyncResult<()>;

    /// Lists subscription IDs registered in a scope.
    async fn fetch_subscription_ids(&self, scope: DatabaseScope) -> SyncResult<Vec<String>>;
}
