use async_trait::async_trait;
use chrono::{Duration, Utc};
use futures::future::join_all;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::queue::{Job, JobPayload, JobQueue, QueueError, QueueName};
use crate::monitoring::coordinator::{CheckCoordinator, CoordinatorError};
use crate::notifications::service::{NotificationDispatcher, NotificationError};

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Check failed: {0}")]
    Check(#[from] CoordinatorError),
    #[error("Notification failed: {0}")]
    Notification(#[from] NotificationError),
    #[error("Unexpected payload for the {0} queue")]
    UnexpectedPayload(&'static str),
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    fn queue(&self) -> QueueName;
    async fn handle(&self, payload: &JobPayload) -> Result<(), JobError>;
}

pub struct CheckJobHandler {
    coordinator: Arc<CheckCoordinator>,
}

impl CheckJobHandler {
    pub fn new(coordinator: Arc<CheckCoordinator>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl JobHandler for CheckJobHandler {
    fn queue(&self) -> QueueName {
        QueueName::Checks
    }

    async fn handle(&self, payload: &JobPayload) -> Result<(), JobError> {
        let JobPayload::CheckMonitor { monitor_id } = payload else {
            return Err(JobError::UnexpectedPayload(self.queue().as_str()));
        };
        let outcome = self.coordinator.run_check(*monitor_id).await?;
        debug!(monitor_id, ?outcome, "Check job handled.");
        Ok(())
    }
}

pub struct NotificationJobHandler {
    dispatcher: Arc<NotificationDispatcher>,
}

impl NotificationJobHandler {
    pub fn new(dispatcher: Arc<NotificationDispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl JobHandler for NotificationJobHandler {
    fn queue(&self) -> QueueName {
        QueueName::Notifications
    }

    async fn handle(&self, payload: &JobPayload) -> Result<(), JobError> {
        let JobPayload::SendNotification(request) = payload else {
            return Err(JobError::UnexpectedPayload(self.queue().as_str()));
        };
        self.dispatcher.handle(request).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub concurrency: usize,
    pub idle_poll: std::time::Duration,
    pub max_attempts: i32,
    pub retry_backoff: Duration,
}

/// What one poll of the queue did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Idle,
    Completed,
    Retried,
    Failed,
}

pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    settings: WorkerSettings,
}

impl WorkerPool {
    pub fn new(queue: Arc<dyn JobQueue>, handler: Arc<dyn JobHandler>, settings: WorkerSettings) -> Self {
        Self {
            queue,
            handler,
            settings,
        }
    }

    /// Reserves and handles at most one job.
    pub async fn run_once(&self) -> Result<JobOutcome, QueueError> {
        let Some(job) = self.queue.reserve(self.handler.queue(), Utc::now()).await? else {
            return Ok(JobOutcome::Idle);
        };
        match self.handler.handle(&job.payload).await {
            Ok(()) => {
                self.queue.complete(job.id).await?;
                Ok(JobOutcome::Completed)
            }
            Err(e) => self.settle_failure(&job, &e).await,
        }
    }

    async fn settle_failure(&self, job: &Job, e: &JobError) -> Result<JobOutcome, QueueError> {
        let message = e.to_string();
        if job.attempts < self.settings.max_attempts {
            warn!(
                job_id = job.id,
                monitor_id = job.payload.monitor_id(),
                attempts = job.attempts,
                error = %e,
                "Job failed; scheduling retry."
            );
            self.queue.retry(job.id, &message, self.settings.retry_backoff).await?;
            Ok(JobOutcome::Retried)
        } else {
            error!(
                job_id = job.id,
                monitor_id = job.payload.monitor_id(),
                attempts = job.attempts,
                error = %e,
                "Job exhausted its attempts; marking failed."
            );
            self.queue.fail(job.id, &message).await?;
            Ok(JobOutcome::Failed)
        }
    }

    /// Runs `concurrency` polling loops until `shutdown` flips to true.
    /// In-flight jobs finish before a loop exits.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        let queue = self.handler.queue().as_str();
        info!(queue, concurrency = self.settings.concurrency, "Worker pool started.");
        let loops = (0..self.settings.concurrency.max(1)).map(|worker| self.worker_loop(worker, shutdown.clone()));
        join_all(loops).await;
        info!(queue, "Worker pool stopped.");
    }

    async fn worker_loop(&self, worker: usize, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let idle = match self.run_once().await {
                Ok(JobOutcome::Idle) => true,
                Ok(_) => false,
                Err(e) => {
                    error!(worker, error = %e, "Queue operation failed.");
                    true
                }
            };
            if idle {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(self.settings.idle_poll) => {}
                }
            }
        }
    }
}
