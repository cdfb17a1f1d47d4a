//! PostgreSQL-backed [`CheckHistoryStore`]. Rows are inserted, never updated.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};

use crate::db::models::{CheckRecord, NewCheckRecord};
use crate::db::repository::{CheckHistoryStore, StoreError, StoreResult};

/// Corresponds to the `check_results` table.
#[derive(Debug, FromRow)]
struct CheckResultRow {
    id: i64,
    monitor_id: i32,
    status: String,
    latency_ms: Option<i64>,
    status_code: Option<i32>,
    error_message: Option<String>,
    metadata: serde_json::Value,
    checked_at: DateTime<Utc>,
}

impl TryFrom<CheckResultRow> for CheckRecord {
    type Error = StoreError;

    fn try_from(row: CheckResultRow) -> Result<Self, Self::Error> {
        Ok(CheckRecord {
            id: row.id,
            monitor_id: row.monitor_id,
            status: row.status.parse()?,
            latency_ms: row.latency_ms,
            status_code: row.status_code,
            error_message: row.error_message,
            metadata: row.metadata,
            checked_at: row.checked_at,
        })
    }
}

#[derive(Clone)]
pub struct PgCheckHistoryStore {
    pool: PgPool,
}

impl PgCheckHistoryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CheckHistoryStore for PgCheckHistoryStore {
    async fn append(&self, record: NewCheckRecord) -> StoreResult<CheckRecord> {
        let row = sqlx::query_as::<_, CheckResultRow>(
            "INSERT INTO check_results (monitor_id, status, latency_ms, status_code, error_message, metadata, checked_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING *",
        )
        .bind(record.monitor_id)
        .bind(record.status.as_str())
        .bind(record.latency_ms)
        .bind(record.status_code)
        .bind(&record.error_message)
        .bind(&record.metadata)
        .bind(record.checked_at)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn last_success_at(&self, monitor_id: i32) -> StoreResult<Option<DateTime<Utc>>> {
        let at: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT MAX(checked_at) FROM check_results WHERE monitor_id = $1 AND status = 'up'",
        )
        .bind(monitor_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(at)
    }

    async fn recent(&self, monitor_id: i32, limit: i64) -> StoreResult<Vec<CheckRecord>> {
        let rows = sqlx::query_as::<_, CheckResultRow>(
            "SELECT * FROM check_results WHERE monitor_id = $1 ORDER BY checked_at DESC, id DESC LIMIT $2",
        )
        .bind(monitor_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(CheckRecord::try_from).collect()
    }
}
