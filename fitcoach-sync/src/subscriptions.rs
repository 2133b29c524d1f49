//! Push subscriptions and notification dispatch.
//!
//! Registers one silent database subscription plus query subscriptions the
//! app raises alerts for, and turns incoming push payloads into sync passes.

use crate::coordinator::SyncCoordinator;
use crate::db::SyncDatabase;
use crate::error::SyncResult;
use crate::record::FieldValue;
use crate::remote::{Predicate, RemoteStore, Subscription, SubscriptionKind};
use crate::retry::with_retry;
use crate::state::{SyncTrigger, TriggerOutcome};
use crate::zone::{DatabaseScope, ZoneId};
use chrono::{Duration, Utc};
use fitcoach_types::RecordType;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const ALL_CHANGES_SUBSCRIPTION: &str = "fitcoach-all-changes";
pub const COMPLETED_WORKOUTS_SUBSCRIPTION: &str = "completed-workouts";
pub const RECENT_FOOD_SUBSCRIPTION: &str = "recent-food-entries";

/// The subscriptions FitCoach registers.
pub fn standard_subscriptions() -> Vec<Subscription> {
    vec![
        Subscription {
            id: ALL_CHANGES_SUBSCRIPTION.to_string(),
            scope: DatabaseScope::Private,
            kind: SubscriptionKind::Database,
            alert_body: None,
        },
        Subscription {
            id: COMPLETED_WORKOUTS_SUBSCRIPTION.to_string(),
            scope: DatabaseScope::Private,
            kind: SubscriptionKind::Query {
                record_type: RecordType::WorkoutSession,
                predicate: Predicate::Equals {
                    field: "status".to_string(),
                    value: FieldValue::String("completed".to_string()),
                },
            },
            alert_body: Some("Workout completed on another device".to_string()),
        },
        Subscription {
            id: RECENT_FOOD_SUBSCRIPTION.to_string(),
            scope: DatabaseScope::Private,
            kind: SubscriptionKind::Query {
                record_type: RecordType::FoodEntry,
                predicate: Predicate::After {
                    field: "consumedAt".to_string(),
                    date: Utc::now() - Duration::hours(24),
                },
            },
            alert_body: Some("New food entry logged".to_string()),
        },
    ]
}

/// Why a query subscription fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueryReason {
    RecordCreated,
    RecordUpdated,
    RecordDeleted,
}

/// A decoded push payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Notification {
    /// Something changed somewhere in a database.
    #[serde(rename_all = "camelCase")]
    Database {
        subscription_id: String,
        scope: DatabaseScope,
    },
    /// Something changed in one zone.
    #[serde(rename_all = "camelCase")]
    RecordZone {
        subscription_id: String,
        zone: ZoneId,
    },
    /// A record matching a query subscription changed.
    #[serde(rename_all = "camelCase")]
    Query {
        subscription_id: String,
        record_type: RecordType,
        record_key: String,
        reason: QueryReason,
        #[serde(default)]
        alert_body: Option<String>,
    },
}

impl Notification {
    pub fn subscription_id(&self) -> &str {
        match self {
            Notification::Database { subscription_id, .. }
            | Notification::RecordZone { subscription_id, .. }
            | Notification::Query { subscription_id, .. } => subscription_id,
        }
    }
}

/// Presents local alerts. Implemented by the UI layer.
pub trait AlertSink: Send + Sync {
    fn show_alert(&self, body: &str, notification: &Notification);
}

/// Sink that drops every alert.
pub struct NoAlerts;

impl AlertSink for NoAlerts {
    fn show_alert(&self, _body: &str, _notification: &Notification) {}
}

/// Registers subscriptions and routes push payloads to the coordinator.
pub struct SubscriptionDispatcher {
    coordinator: Arc<SyncCoordinator>,
    alerts: Arc<dyn AlertSink>,
    subscriptions: Vec<Subscription>,
}

impl SubscriptionDispatcher {
    pub fn new(coordinator: Arc<SyncCoordinator>, alerts: Arc<dyn AlertSink>) -> Self {
        Self::with_subscriptions(coordinator, alerts, standard_subscriptions())
    }

    pub fn with_subscriptions(
        coordinator: Arc<SyncCoordinator>,
        alerts: Arc<dyn AlertSink>,
        subscriptions: Vec<Subscription>,
    ) -> Self {
        Self {
            coordinator,
            alerts,
            subscriptions,
        }
    }

    fn remote(&self) -> &Arc<dyn RemoteStore> {
        self.coordinator.zones().remote()
    }

    fn db(&self) -> &SyncDatabase {
        self.coordinator.database()
    }

    /// Registers every subscription not yet recorded locally.
    ///
    /// Returns the number registered by this call.
    pub async fn register_all(&self) -> SyncResult<usize> {
        let retry = &self.coordinator.config().retry;
        let mut registered = 0;
        for sub in &self.subscriptions {
            let (scope, id) = (sub.scope, sub.id.clone());
            if self
                .db()
                .run_blocking(move |db| db.has_subscription(scope, &id))
                .await?
            {
                debug!("Subscription {} already registered", sub.id);
                continue;
            }
            with_retry(retry, "save subscription", || self.remote().save_subscription(sub))
                .await?;
            let id = sub.id.clone();
            self.db()
                .run_blocking(move |db| db.insert_subscription(scope, &id))
                .await?;
            info!("Registered subscription {}", sub.id);
            registered += 1;
        }
        Ok(registered)
    }

    /// Removes every subscription from the remote and from local state.
    pub async fn unregister_all(&self) -> SyncResult<()> {
        let retry = &self.coordinator.config().retry;
        for sub in &self.subscriptions {
            with_retry(retry, "delete subscription", || {
                self.remote().delete_subscription(sub.scope, &sub.id)
            })
            .await?;
            let (scope, id) = (sub.scope, sub.id.clone());
            self.db()
                .run_blocking(move |db| db.remove_subscription(scope, &id))
                .await?;
        }
        info!("Unregistered {} subscriptions", self.subscriptions.len());
        Ok(())
    }

    /// Subscription IDs recorded as registered.
    pub fn registered_ids(&self) -> SyncResult<Vec<String>> {
        self.db().subscription_ids()
    }

    /// Dispatches a decoded notification.
    pub async fn handle_notification(&self, notification: &Notification) -> TriggerOutcome {
        debug!("Push received for {}", notification.subscription_id());
        match notification {
            Notification::Query {
                record_type,
                alert_body,
                ..
            } => {
                let zone = match self.coordinator.zones().zone_for(*record_type) {
                    Ok(zone) => Some(zone.id.clone()),
                    Err(e) => {
                        warn!("Query push for unmapped type: {}", e);
                        None
                    }
                };
                let outcome = self
                    .coordinator
                    .trigger(SyncTrigger::RemoteNotification { zone })
                    .await;
                if let Some(body) = alert_body {
                    self.alerts.show_alert(body, notification);
                }
                outcome
            }
            Notification::RecordZone { zone, .. } => {
                self.coordinator
                    .trigger(SyncTrigger::RemoteNotification {
                        zone: Some(zone.clone()),
                    })
                    .await
            }
            Notification::Database { .. } => {
                self.coordinator
                    .trigger(SyncTrigger::RemoteNotification { zone: None })
                    .await
            }
        }
    }

    /// Parses a JSON push payload and dispatches it.
    pub async fn handle_payload(&self, payload: &str) -> SyncResult<TriggerOutcome> {
        let notification: Notification = serde_json::from_str(payload)?;
        Ok(self.handle_notification(&notification).await)
    }
}
