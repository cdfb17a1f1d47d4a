//! PostgreSQL-backed [`IncidentStore`]. The at-most-one-unresolved rule is
//! enforced by the partial unique index `idx_incidents_one_unresolved`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};

use crate::db::models::{AlertLogEntry, Incident, IncidentState, NewIncident};
use crate::db::repository::{IncidentStore, StoreError, StoreResult};

/// Corresponds to the `incidents` table.
#[derive(Debug, FromRow)]
struct IncidentRow {
    id: i32,
    monitor_id: i32,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    resolved: bool,
    status: String,
    alert_status: String,
    description: String,
    alert_log: Json<Vec<AlertLogEntry>>,
}

impl TryFrom<IncidentRow> for Incident {
    type Error = StoreError;

    fn try_from(row: IncidentRow) -> Result<Self, Self::Error> {
        Ok(Incident {
            id: row.id,
            monitor_id: row.monitor_id,
            started_at: row.started_at,
            ended_at: row.ended_at,
            resolved: row.resolved,
            status: row.status.parse()?,
            alert_status: row.alert_status.parse()?,
            description: row.description,
            alert_log: row.alert_log.0,
        })
    }
}

fn map_unique_violation(e: sqlx::Error, monitor_id: Option<i32>) -> StoreError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict(match monitor_id {
            Some(id) => format!("monitor {id} already has an unresolved incident"),
            None => "monitor already has an unresolved incident".to_string(),
        }),
        _ => StoreError::Database(e),
    }
}

#[derive(Clone)]
pub struct PgIncidentStore {
    pool: PgPool,
}

impl PgIncidentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IncidentStore for PgIncidentStore {
    async fn find_open(&self, monitor_id: i32) -> StoreResult<Option<Incident>> {
        sqlx::query_as::<_, IncidentRow>("SELECT * FROM incidents WHERE monitor_id = $1 AND NOT resolved")
            .bind(monitor_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Incident::try_from)
            .transpose()
    }

    async fn get(&self, id: i32) -> StoreResult<Option<Incident>> {
        sqlx::query_as::<_, IncidentRow>("SELECT * FROM incidents WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Incident::try_from)
            .transpose()
    }

    async fn list_for_monitor(&self, monitor_id: i32) -> StoreResult<Vec<Incident>> {
        let rows = sqlx::query_as::<_, IncidentRow>(
            "SELECT * FROM incidents WHERE monitor_id = $1 ORDER BY started_at, id",
        )
        .bind(monitor_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Incident::try_from).collect()
    }

    async fn create(&self, new: NewIncident) -> StoreResult<Incident> {
        let row = sqlx::query_as::<_, IncidentRow>(
            "INSERT INTO incidents (monitor_id, started_at, status, alert_status, description, alert_log) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING *",
        )
        .bind(new.monitor_id)
        .bind(new.started_at)
        .bind(new.status.as_str())
        .bind(new.alert_status.as_str())
        .bind(&new.description)
        .bind(Json(vec![new.first_entry]))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_unique_violation(e, Some(new.monitor_id)))?;
        row.try_into()
    }

    async fn update_state(&self, id: i32, state: IncidentState) -> StoreResult<Incident> {
        let row = sqlx::query_as::<_, IncidentRow>(
            "UPDATE incidents SET status = $2, alert_status = $3, resolved = $4, ended_at = $5, \
             updated_at = NOW() WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(state.status.as_str())
        .bind(state.alert_status.as_str())
        .bind(state.resolved)
        .bind(state.ended_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_unique_violation(e, None))?
        .ok_or_else(|| StoreError::incident_not_found(id))?;
        row.try_into()
    }

    async fn append_log(&self, id: i32, entry: AlertLogEntry) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE incidents SET alert_log = alert_log || jsonb_build_array($2::jsonb), \
             updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(Json(entry))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::incident_not_found(id));
        }
        Ok(())
    }
}
