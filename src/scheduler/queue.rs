//! Durable work queue abstraction with a priority lane for first checks and
//! a regular lane for periodic checks, plus the in-memory implementation.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::notifications::service::NotificationRequest;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Job not found: {0}")]
    JobNotFound(i64),
    #[error("Queue is full")]
    QueueFull,
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Invalid job payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Which worker pool consumes a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    Checks,
    Notifications,
}

impl QueueName {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Checks => "checks",
            QueueName::Notifications => "notifications",
        }
    }
}

/// Lower lanes are served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Lane {
    Priority = 0,
    Regular = 1,
}

impl Lane {
    pub fn as_i16(&self) -> i16 {
        *self as i16
    }

    pub fn from_i16(value: i16) -> Self {
        if value == 0 { Lane::Priority } else { Lane::Regular }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    CheckMonitor { monitor_id: i32 },
    SendNotification(NotificationRequest),
}

impl JobPayload {
    pub fn queue(&self) -> QueueName {
        match self {
            JobPayload::CheckMonitor { .. } => QueueName::Checks,
            JobPayload::SendNotification(_) => QueueName::Notifications,
        }
    }

    pub fn monitor_id(&self) -> Option<i32> {
        match self {
            JobPayload::CheckMonitor { monitor_id } => Some(*monitor_id),
            JobPayload::SendNotification(request) => Some(request.monitor_id),
        }
    }
}

/// A reserved job handed to a worker. `attempts` counts this reservation.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: i64,
    pub lane: Lane,
    pub payload: JobPayload,
    pub attempts: i32,
    pub available_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub priority_ready: usize,
    pub regular_ready: usize,
    pub delayed: usize,
    pub reserved: usize,
    pub failed: usize,
}

impl QueueStats {
    /// Jobs waiting to run, ready or delayed.
    pub fn pending(&self) -> usize {
        self.priority_ready + self.regular_ready + self.delayed
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub duplicates_removed: usize,
    pub trimmed: usize,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Adds a job that becomes available after `delay`. A check job for a
    /// monitor that already has one pending is merged into it instead: the
    /// pending job keeps the earlier of the two due times and the lower lane.
    async fn push(&self, payload: JobPayload, lane: Lane, delay: Duration) -> Result<i64, QueueError>;

    /// Claims the next available job: priority lane first, then oldest.
    async fn reserve(&self, queue: QueueName, now: DateTime<Utc>) -> Result<Option<Job>, QueueError>;

    async fn complete(&self, job_id: i64) -> Result<(), QueueError>;

    /// Releases a reserved job to run again after `delay`.
    async fn retry(&self, job_id: i64, error: &str, delay: Duration) -> Result<(), QueueError>;

    /// Keeps the job as failed for inspection; it is never reserved again.
    async fn fail(&self, job_id: i64, error: &str) -> Result<(), QueueError>;

    /// Number of unreserved, unfailed jobs.
    async fn pending_count(&self, queue: QueueName) -> Result<usize, QueueError>;

    async fn stats(&self, queue: QueueName, now: DateTime<Utc>) -> Result<QueueStats, QueueError>;

    /// Releases reservations older than `older_than`; returns how many were released.
    async fn reclaim_stale(&self, now: DateTime<Utc>, older_than: Duration) -> Result<usize, QueueError>;

    /// Drops duplicate pending check jobs per monitor, then trims the regular
    /// lane to `max_pending` jobs, keeping the earliest.
    async fn prune(&self, queue: QueueName, max_pending: usize) -> Result<PruneReport, QueueError>;
}

#[derive(Debug, Clone)]
struct StoredJob {
    id: i64,
    queue: QueueName,
    lane: Lane,
    payload: JobPayload,
    attempts: i32,
    available_at: DateTime<Utc>,
    reserved_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl StoredJob {
    fn is_pending(&self) -> bool {
        self.reserved_at.is_none() && self.failed_at.is_none()
    }

    fn order_key(&self) -> (Lane, DateTime<Utc>, i64) {
        (self.lane, self.available_at, self.id)
    }
}

#[derive(Default)]
struct JobTable {
    next_id: i64,
    jobs: BTreeMap<i64, StoredJob>,
}

/// In-process queue. Jobs are lost on restart.
#[derive(Default)]
pub struct MemoryJobQueue {
    inner: Mutex<JobTable>,
    max_size: Option<usize>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects pushes with [`QueueError::QueueFull`] once `max_size` jobs are pending.
    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            inner: Mutex::new(JobTable::default()),
            max_size: Some(max_size),
        }
    }

    /// Error recorded on a failed job, if any.
    pub async fn failed_error(&self, job_id: i64) -> Option<String> {
        let table = self.inner.lock().await;
        table
            .jobs
            .get(&job_id)
            .filter(|job| job.failed_at.is_some())
            .and_then(|job| job.last_error.clone())
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn push(&self, payload: JobPayload, lane: Lane, delay: Duration) -> Result<i64, QueueError> {
        let now = Utc::now();
        let mut table = self.inner.lock().await;
        if let JobPayload::CheckMonitor { monitor_id } = payload {
            let pending = table.jobs.values_mut().find(|j| {
                j.is_pending() && matches!(j.payload, JobPayload::CheckMonitor { monitor_id: m } if m == monitor_id)
            });
            if let Some(job) = pending {
                job.available_at = job.available_at.min(now + delay);
                job.lane = job.lane.min(lane);
                debug!(job_id = job.id, monitor_id, ?lane, "Check already pending; merged");
                return Ok(job.id);
            }
        }
        if let Some(max) = self.max_size {
            if table.jobs.values().filter(|j| j.is_pending()).count() >= max {
                return Err(QueueError::QueueFull);
            }
        }
        table.next_id += 1;
        let id = table.next_id;
        let queue = payload.queue();
        debug!(job_id = id, queue = queue.as_str(), ?lane, "Enqueueing job");
        table.jobs.insert(
            id,
            StoredJob {
                id,
                queue,
                lane,
                payload,
                attempts: 0,
                available_at: now + delay,
                reserved_at: None,
                failed_at: None,
                last_error: None,
            },
        );
        Ok(id)
    }

    async fn reserve(&self, queue: QueueName, now: DateTime<Utc>) -> Result<Option<Job>, QueueError> {
        let mut table = self.inner.lock().await;
        let next_id = table
            .jobs
            .values()
            .filter(|j| j.queue == queue && j.is_pending() && j.available_at <= now)
            .min_by_key(|j| j.order_key())
            .map(|j| j.id);
        let Some(id) = next_id else {
            return Ok(None);
        };
        let job = table.jobs.get_mut(&id).ok_or(QueueError::JobNotFound(id))?;
        job.reserved_at = Some(now);
        job.attempts += 1;
        Ok(Some(Job {
            id: job.id,
            lane: job.lane,
            payload: job.payload.clone(),
            attempts: job.attempts,
            available_at: job.available_at,
        }))
    }

    async fn complete(&self, job_id: i64) -> Result<(), QueueError> {
        let mut table = self.inner.lock().await;
        table.jobs.remove(&job_id).map(|_| ()).ok_or(QueueError::JobNotFound(job_id))
    }

    async fn retry(&self, job_id: i64, error: &str, delay: Duration) -> Result<(), QueueError> {
        let mut table = self.inner.lock().await;
        let job = table.jobs.get_mut(&job_id).ok_or(QueueError::JobNotFound(job_id))?;
        job.reserved_at = None;
        job.available_at = Utc::now() + delay;
        job.last_error = Some(error.to_string());
        Ok(())
    }

    async fn fail(&self, job_id: i64, error: &str) -> Result<(), QueueError> {
        let mut table = self.inner.lock().await;
        let job = table.jobs.get_mut(&job_id).ok_or(QueueError::JobNotFound(job_id))?;
        job.reserved_at = None;
        job.failed_at = Some(Utc::now());
        job.last_error = Some(error.to_string());
        info!(job_id, error, "Moving job to failed state");
        Ok(())
    }

    async fn pending_count(&self, queue: QueueName) -> Result<usize, QueueError> {
        let table = self.inner.lock().await;
        Ok(table
            .jobs
            .values()
            .filter(|j| j.queue == queue && j.is_pending())
            .count())
    }

    async fn stats(&self, queue: QueueName, now: DateTime<Utc>) -> Result<QueueStats, QueueError> {
        let table = self.inner.lock().await;
        let mut stats = QueueStats::default();
        for job in table.jobs.values().filter(|j| j.queue == queue) {
            if job.failed_at.is_some() {
                stats.failed += 1;
            } else if job.reserved_at.is_some() {
                stats.reserved += 1;
            } else if job.available_at > now {
                stats.delayed += 1;
            } else if job.lane == Lane::Priority {
                stats.priority_ready += 1;
            } else {
                stats.regular_ready += 1;
            }
        }
        Ok(stats)
    }

    async fn reclaim_stale(&self, now: DateTime<Utc>, older_than: Duration) -> Result<usize, QueueError> {
        let cutoff = now - older_than;
        let mut table = self.inner.lock().await;
        let mut reclaimed = 0;
        for job in table.jobs.values_mut() {
            if job.failed_at.is_none() && job.reserved_at.map(|at| at < cutoff).unwrap_or(false) {
                job.reserved_at = None;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn prune(&self, queue: QueueName, max_pending: usize) -> Result<PruneReport, QueueError> {
        let mut table = self.inner.lock().await;
        let mut pending: Vec<&StoredJob> = table
            .jobs
            .values()
            .filter(|j| j.queue == queue && j.is_pending())
            .collect();
        pending.sort_by_key(|j| (j.available_at, j.order_key()));

        let mut seen = HashSet::new();
        let mut duplicates = Vec::new();
        let mut regular_kept = Vec::new();
        for job in pending {
            let key = match &job.payload {
                JobPayload::CheckMonitor { monitor_id } => Some(*monitor_id),
                JobPayload::SendNotification(_) => None,
            };
            if let Some(monitor_id) = key {
                if !seen.insert(monitor_id) {
                    duplicates.push(job.id);
                    continue;
                }
            }
            if job.lane == Lane::Regular {
                regular_kept.push(job.id);
            }
        }
        let trimmed: Vec<i64> = regular_kept.into_iter().skip(max_pending).collect();

        for id in duplicates.iter().chain(trimmed.iter()) {
            table.jobs.remove(id);
        }
        Ok(PruneReport {
            duplicates_removed: duplicates.len(),
            trimmed: trimmed.len(),
        })
    }
}
