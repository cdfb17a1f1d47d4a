//! PostgreSQL-backed [`JobQueue`] over the `jobs` table. Workers claim rows
//! with `FOR UPDATE SKIP LOCKED`, so any number of processes can share it.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};

use crate::scheduler::queue::{Job, JobPayload, JobQueue, Lane, PruneReport, QueueError, QueueName, QueueStats};

/// Corresponds to the `jobs` table.
#[derive(Debug, FromRow)]
struct JobRow {
    id: i64,
    lane: i16,
    payload: Json<JobPayload>,
    attempts: i32,
    available_at: DateTime<Utc>,
}

impl From<JobRow> for Job {
    fn from(row: JobRow) -> Self {
        Job {
            id: row.id,
            lane: Lane::from_i16(row.lane),
            payload: row.payload.0,
            attempts: row.attempts,
            available_at: row.available_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct StatsRow {
    priority_ready: i64,
    regular_ready: i64,
    delayed: i64,
    reserved: i64,
    failed: i64,
}

#[derive(Clone)]
pub struct PgJobQueue {
    pool: PgPool,
}

impl PgJobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn expect_job(job_id: i64, rows_affected: u64) -> Result<(), QueueError> {
        if rows_affected == 0 {
            return Err(QueueError::JobNotFound(job_id));
        }
        Ok(())
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn push(&self, payload: JobPayload, lane: Lane, delay: Duration) -> Result<i64, QueueError> {
        let available_at = Utc::now() + delay;
        let mut tx = self.pool.begin().await?;

        if let JobPayload::CheckMonitor { monitor_id } = payload {
            // Serializes pushes for one monitor until commit.
            sqlx::query("SELECT pg_advisory_xact_lock(hashtext('jobs.checks'), $1)")
                .bind(monitor_id)
                .execute(&mut *tx)
                .await?;
            let merged: Option<i64> = sqlx::query_scalar(
                "UPDATE jobs SET available_at = LEAST(available_at, $2), lane = LEAST(lane, $3) \
                 WHERE reserved_at IS NULL AND failed_at IS NULL AND id = ( \
                     SELECT id FROM jobs \
                     WHERE queue = 'checks' AND monitor_id = $1 AND reserved_at IS NULL AND failed_at IS NULL \
                     ORDER BY available_at, id \
                     LIMIT 1 \
                 ) \
                 RETURNING id",
            )
            .bind(monitor_id)
            .bind(available_at)
            .bind(lane.as_i16())
            .fetch_optional(&mut *tx)
            .await?;
            if let Some(id) = merged {
                tx.commit().await?;
                return Ok(id);
            }
        }

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO jobs (queue, lane, payload, monitor_id, available_at) \
             VALUES ($1, $2, $3, $4, $5) RETURNING id",
        )
        .bind(payload.queue().as_str())
        .bind(lane.as_i16())
        .bind(Json(&payload))
        .bind(payload.monitor_id())
        .bind(available_at)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(id)
    }

    async fn reserve(&self, queue: QueueName, now: DateTime<Utc>) -> Result<Option<Job>, QueueError> {
        let row = sqlx::query_as::<_, JobRow>(
            "UPDATE jobs SET reserved_at = $2, attempts = attempts + 1 \
             WHERE id = ( \
                 SELECT id FROM jobs \
                 WHERE queue = $1 AND reserved_at IS NULL AND failed_at IS NULL AND available_at <= $2 \
                 ORDER BY lane, available_at, id \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING id, lane, payload, attempts, available_at",
        )
        .bind(queue.as_str())
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Job::from))
    }

    async fn complete(&self, job_id: i64) -> Result<(), QueueError> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Self::expect_job(job_id, result.rows_affected())
    }

    async fn retry(&self, job_id: i64, error: &str, delay: Duration) -> Result<(), QueueError> {
        let result = sqlx::query(
            "UPDATE jobs SET reserved_at = NULL, available_at = $2, last_error = $3 WHERE id = $1",
        )
        .bind(job_id)
        .bind(Utc::now() + delay)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Self::expect_job(job_id, result.rows_affected())
    }

    async fn fail(&self, job_id: i64, error: &str) -> Result<(), QueueError> {
        let result = sqlx::query(
            "UPDATE jobs SET reserved_at = NULL, failed_at = NOW(), last_error = $2 WHERE id = $1",
        )
        .bind(job_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Self::expect_job(job_id, result.rows_affected())
    }

    async fn pending_count(&self, queue: QueueName) -> Result<usize, QueueError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs WHERE queue = $1 AND reserved_at IS NULL AND failed_at IS NULL",
        )
        .bind(queue.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as usize)
    }

    async fn stats(&self, queue: QueueName, now: DateTime<Utc>) -> Result<QueueStats, QueueError> {
        let row = sqlx::query_as::<_, StatsRow>(
            "SELECT \
                COUNT(*) FILTER (WHERE failed_at IS NULL AND reserved_at IS NULL AND available_at <= $2 AND lane = 0) AS priority_ready, \
                COUNT(*) FILTER (WHERE failed_at IS NULL AND reserved_at IS NULL AND available_at <= $2 AND lane <> 0) AS regular_ready, \
                COUNT(*) FILTER (WHERE failed_at IS NULL AND reserved_at IS NULL AND available_at > $2) AS delayed, \
                COUNT(*) FILTER (WHERE failed_at IS NULL AND reserved_at IS NOT NULL) AS reserved, \
                COUNT(*) FILTER (WHERE failed_at IS NOT NULL) AS failed \
             FROM jobs WHERE queue = $1",
        )
        .bind(queue.as_str())
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(QueueStats {
            priority_ready: row.priority_ready as usize,
            regular_ready: row.regular_ready as usize,
            delayed: row.delayed as usize,
            reserved: row.reserved as usize,
            failed: row.failed as usize,
        })
    }

    async fn reclaim_stale(&self, now: DateTime<Utc>, older_than: Duration) -> Result<usize, QueueError> {
        let result = sqlx::query(
            "UPDATE jobs SET reserved_at = NULL WHERE failed_at IS NULL AND reserved_at < $1",
        )
        .bind(now - older_than)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn prune(&self, queue: QueueName, max_pending: usize) -> Result<PruneReport, QueueError> {
        let mut tx = self.pool.begin().await?;

        let duplicates = sqlx::query(
            "DELETE FROM jobs WHERE id IN ( \
                 SELECT id FROM ( \
                     SELECT id, ROW_NUMBER() OVER (PARTITION BY monitor_id ORDER BY available_at, lane, id) AS rn \
                     FROM jobs \
                     WHERE queue = $1 AND monitor_id IS NOT NULL \
                       AND reserved_at IS NULL AND failed_at IS NULL \
                       AND payload->>'kind' = 'check_monitor' \
                 ) ranked WHERE rn > 1 \
             )",
        )
        .bind(queue.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let trimmed = sqlx::query(
            "DELETE FROM jobs WHERE id IN ( \
                 SELECT id FROM jobs \
                 WHERE queue = $1 AND lane = $2 AND reserved_at IS NULL AND failed_at IS NULL \
                 ORDER BY available_at, id \
                 OFFSET $3 \
             )",
        )
        .bind(queue.as_str())
        .bind(Lane::Regular.as_i16())
        .bind(max_pending as i64)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        Ok(PruneReport {
            duplicates_removed: duplicates as usize,
            trimmed: trimmed as usize,
        })
    }
}
