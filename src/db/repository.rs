use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use super::enums::{MonitorStatus, UnknownVariant};
use super::models::{
    AlertLogEntry, CheckRecord, ConfigError, Incident, IncidentState, Monitor, MonitorCheckUpdate,
    NewCheckRecord, NewIncident, NewMonitor, NotificationChannel, TlsInfo,
};
use crate::notifications::encryption::EncryptionError;
use crate::notifications::models::ChannelConfig;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Invalid monitor: {0}")]
    Invalid(#[from] ConfigError),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Encryption error: {0}")]
    Encryption(#[from] EncryptionError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Corrupt stored value: {0}")]
    Decode(#[from] UnknownVariant),
}

impl StoreError {
    pub fn monitor_not_found(id: i32) -> Self {
        StoreError::NotFound {
            entity: "monitor",
            id: id as i64,
        }
    }

    pub fn incident_not_found(id: i32) -> Self {
        StoreError::NotFound {
            entity: "incident",
            id: id as i64,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Monitor records. Status fields are only written by a caller holding the monitor lock.
#[async_trait]
pub trait MonitorStore: Send + Sync {
    /// Validates and inserts a monitor. New monitors start in `unknown`.
    async fn create(&self, monitor: NewMonitor) -> StoreResult<Monitor>;

    async fn get(&self, id: i32) -> StoreResult<Option<Monitor>>;

    async fn find_by_push_token(&self, token: &str) -> StoreResult<Option<Monitor>>;

    /// Enabled, unpaused, actively probed monitors that were never scheduled
    /// or whose `next_check_at` is more than `grace` in the past. New monitors first.
    async fn list_due(&self, now: DateTime<Utc>, grace: Duration, limit: i64) -> StoreResult<Vec<Monitor>>;

    async fn record_check(&self, id: i32, update: MonitorCheckUpdate) -> StoreResult<()>;

    async fn set_status(&self, id: i32, status: MonitorStatus) -> StoreResult<()>;

    async fn set_next_check_at(&self, id: i32, at: DateTime<Utc>) -> StoreResult<()>;

    async fn set_enabled(&self, id: i32, enabled: bool) -> StoreResult<()>;

    async fn set_pause_until(&self, id: i32, until: Option<DateTime<Utc>>) -> StoreResult<()>;

    async fn set_tls_info(&self, id: i32, tls: TlsInfo) -> StoreResult<()>;

    async fn mark_critical_alert_sent(&self, id: i32, at: DateTime<Utc>) -> StoreResult<()>;

    async fn mark_notified(&self, id: i32, at: DateTime<Utc>) -> StoreResult<()>;

    async fn record_heartbeat(&self, id: i32, at: DateTime<Utc>) -> StoreResult<()>;

    /// Returns `false` when the monitor did not exist.
    async fn delete(&self, id: i32) -> StoreResult<bool>;
}

/// Incident records. At most one unresolved incident exists per monitor;
/// the alert log only ever grows.
#[async_trait]
pub trait IncidentStore: Send + Sync {
    async fn find_open(&self, monitor_id: i32) -> StoreResult<Option<Incident>>;

    async fn get(&self, id: i32) -> StoreResult<Option<Incident>>;

    async fn list_for_monitor(&self, monitor_id: i32) -> StoreResult<Vec<Incident>>;

    /// Fails with [`StoreError::Conflict`] if the monitor already has an unresolved incident.
    async fn create(&self, incident: NewIncident) -> StoreResult<Incident>;

    /// Writes status fields. Un-resolving fails with [`StoreError::Conflict`]
    /// when another unresolved incident exists for the monitor.
    async fn update_state(&self, id: i32, state: IncidentState) -> StoreResult<Incident>;

    async fn append_log(&self, id: i32, entry: AlertLogEntry) -> StoreResult<()>;
}

/// Append-only probe history.
#[async_trait]
pub trait CheckHistoryStore: Send + Sync {
    async fn append(&self, record: NewCheckRecord) -> StoreResult<CheckRecord>;

    async fn last_success_at(&self, monitor_id: i32) -> StoreResult<Option<DateTime<Utc>>>;

    /// Newest first.
    async fn recent(&self, monitor_id: i32, limit: i64) -> StoreResult<Vec<CheckRecord>>;
}

/// Notification channels. Read-only for the check pipeline.
#[async_trait]
pub trait ChannelStore: Send + Sync {
    async fn create(&self, name: &str, config: ChannelConfig, enabled: bool) -> StoreResult<NotificationChannel>;

    async fn get(&self, id: i32) -> StoreResult<Option<NotificationChannel>>;

    /// Channels in the order of `ids`; unknown ids are skipped.
    async fn list_by_ids(&self, ids: &[i32]) -> StoreResult<Vec<NotificationChannel>>;
}
