//! PostgreSQL-backed [`MonitorStore`].

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};

use crate::db::enums::MonitorStatus;
use crate::db::models::{Monitor, MonitorCheckUpdate, MonitorConfig, NewMonitor, TlsInfo};
use crate::db::repository::{MonitorStore, StoreError, StoreResult};

/// Corresponds to the `monitors` table.
#[derive(Debug, FromRow)]
struct MonitorRow {
    id: i32,
    name: String,
    target: String,
    config: Json<MonitorConfig>,
    interval_seconds: i32,
    timeout_seconds: i32,
    retries: i32,
    notify_after_retries: i32,
    enabled: bool,
    pause_until: Option<DateTime<Utc>>,
    last_status: String,
    consecutive_failures: i32,
    next_check_at: Option<DateTime<Utc>>,
    last_checked_at: Option<DateTime<Utc>>,
    last_critical_alert_sent_at: Option<DateTime<Utc>>,
    last_notified_at: Option<DateTime<Utc>>,
    last_heartbeat_at: Option<DateTime<Utc>>,
    push_token: Option<String>,
    ssl_expires_at: Option<DateTime<Utc>>,
    ssl_issuer: Option<String>,
    ssl_checked_at: Option<DateTime<Utc>>,
    channel_ids: Vec<i32>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<MonitorRow> for Monitor {
    type Error = StoreError;

    fn try_from(row: MonitorRow) -> Result<Self, Self::Error> {
        let tls = match (row.ssl_expires_at, row.ssl_issuer, row.ssl_checked_at) {
            (Some(expires_at), Some(issuer), Some(checked_at)) => Some(TlsInfo {
                expires_at,
                issuer,
                checked_at,
            }),
            _ => None,
        };
        Ok(Monitor {
            id: row.id,
            name: row.name,
            target: row.target,
            config: row.config.0,
            interval_seconds: row.interval_seconds,
            timeout_seconds: row.timeout_seconds,
            retries: row.retries,
            notify_after_retries: row.notify_after_retries,
            enabled: row.enabled,
            pause_until: row.pause_until,
            last_status: row.last_status.parse()?,
            consecutive_failures: row.consecutive_failures,
            next_check_at: row.next_check_at,
            last_checked_at: row.last_checked_at,
            last_critical_alert_sent_at: row.last_critical_alert_sent_at,
            last_notified_at: row.last_notified_at,
            last_heartbeat_at: row.last_heartbeat_at,
            push_token: row.push_token,
            tls,
            channel_ids: row.channel_ids,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Clone)]
pub struct PgMonitorStore {
    pool: PgPool,
}

impl PgMonitorStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn expect_updated(id: i32, result: sqlx::postgres::PgQueryResult) -> StoreResult<()> {
        if result.rows_affected() == 0 {
            return Err(StoreError::monitor_not_found(id));
        }
        Ok(())
    }
}

#[async_trait]
impl MonitorStore for PgMonitorStore {
    async fn create(&self, new: NewMonitor) -> StoreResult<Monitor> {
        new.validate()?;
        let push_token = new.generate_push_token();
        let row = sqlx::query_as::<_, MonitorRow>(
            "INSERT INTO monitors (name, monitor_type, target, config, interval_seconds, timeout_seconds, \
             retries, notify_after_retries, enabled, push_token, channel_ids) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) RETURNING *",
        )
        .bind(&new.name)
        .bind(new.config.monitor_type().as_str())
        .bind(&new.target)
        .bind(Json(&new.config))
        .bind(new.interval_seconds)
        .bind(new.timeout_seconds)
        .bind(new.retries)
        .bind(new.notify_after_retries)
        .bind(new.enabled)
        .bind(push_token)
        .bind(&new.channel_ids)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn get(&self, id: i32) -> StoreResult<Option<Monitor>> {
        sqlx::query_as::<_, MonitorRow>("SELECT * FROM monitors WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Monitor::try_from)
            .transpose()
    }

    async fn find_by_push_token(&self, token: &str) -> StoreResult<Option<Monitor>> {
        sqlx::query_as::<_, MonitorRow>("SELECT * FROM monitors WHERE push_token = $1")
            .bind(token)
            .fetch_optional(&self.pool)
            .await?
            .map(Monitor::try_from)
            .transpose()
    }

    async fn list_due(&self, now: DateTime<Utc>, grace: Duration, limit: i64) -> StoreResult<Vec<Monitor>> {
        let rows = sqlx::query_as::<_, MonitorRow>(
            "SELECT * FROM monitors \
             WHERE enabled \
               AND (pause_until IS NULL OR pause_until <= $1) \
               AND monitor_type <> 'push' \
               AND (next_check_at IS NULL OR next_check_at < $2) \
             ORDER BY next_check_at ASC NULLS FIRST, id \
             LIMIT $3",
        )
        .bind(now)
        .bind(now - grace)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Monitor::try_from).collect()
    }

    async fn record_check(&self, id: i32, update: MonitorCheckUpdate) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE monitors SET last_status = $2, consecutive_failures = $3, last_checked_at = $4, \
             next_check_at = $5, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(update.last_status.as_str())
        .bind(update.consecutive_failures)
        .bind(update.last_checked_at)
        .bind(update.next_check_at)
        .execute(&self.pool)
        .await?;
        Self::expect_updated(id, result)
    }

    async fn set_status(&self, id: i32, status: MonitorStatus) -> StoreResult<()> {
        let result = sqlx::query("UPDATE monitors SET last_status = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Self::expect_updated(id, result)
    }

    async fn set_next_check_at(&self, id: i32, at: DateTime<Utc>) -> StoreResult<()> {
        let result = sqlx::query("UPDATE monitors SET next_check_at = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Self::expect_updated(id, result)
    }

    async fn set_enabled(&self, id: i32, enabled: bool) -> StoreResult<()> {
        let result = sqlx::query("UPDATE monitors SET enabled = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(enabled)
            .execute(&self.pool)
            .await?;
        Self::expect_updated(id, result)
    }

    async fn set_pause_until(&self, id: i32, until: Option<DateTime<Utc>>) -> StoreResult<()> {
        let result = sqlx::query("UPDATE monitors SET pause_until = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(until)
            .execute(&self.pool)
            .await?;
        Self::expect_updated(id, result)
    }

    async fn set_tls_info(&self, id: i32, tls: TlsInfo) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE monitors SET ssl_expires_at = $2, ssl_issuer = $3, ssl_checked_at = $4, \
             updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(tls.expires_at)
        .bind(&tls.issuer)
        .bind(tls.checked_at)
        .execute(&self.pool)
        .await?;
        Self::expect_updated(id, result)
    }

    async fn mark_critical_alert_sent(&self, id: i32, at: DateTime<Utc>) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE monitors SET last_critical_alert_sent_at = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Self::expect_updated(id, result)
    }

    async fn mark_notified(&self, id: i32, at: DateTime<Utc>) -> StoreResult<()> {
        let result = sqlx::query("UPDATE monitors SET last_notified_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Self::expect_updated(id, result)
    }

    async fn record_heartbeat(&self, id: i32, at: DateTime<Utc>) -> StoreResult<()> {
        let result = sqlx::query("UPDATE monitors SET last_heartbeat_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Self::expect_updated(id, result)
    }

    async fn delete(&self, id: i32) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM monitors WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
