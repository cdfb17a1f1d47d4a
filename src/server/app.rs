//! Builds the running components from a [`ServerConfig`].

use axum::Router;
use chrono::Duration;
use sqlx::PgPool;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use super::config::ServerConfig;
use crate::alerting::incident_service::IncidentService;
use crate::db::memory::{MemoryChannelStore, MemoryCheckHistoryStore, MemoryIncidentStore, MemoryMonitorStore};
use crate::db::repository::{ChannelStore, CheckHistoryStore, IncidentStore, MonitorStore};
use crate::db::services::{self as pg, PgChannelStore, PgCheckHistoryStore, PgIncidentStore, PgJobQueue, PgMonitorStore};
use crate::monitoring::coordinator::CheckCoordinator;
use crate::monitoring::lock::{LocalLockMap, MonitorLock, PgAdvisoryLock};
use crate::monitoring::probe::NetworkProbeExecutor;
use crate::monitoring::validation::ValidationGate;
use crate::notifications::encryption::{EncryptionError, EncryptionService};
use crate::notifications::senders::ChannelSenders;
use crate::notifications::service::{NotificationDispatcher, QueuedNotifier};
use crate::scheduler::queue::{JobQueue, MemoryJobQueue};
use crate::scheduler::service::{BackpressureGovernor, CheckScheduler, QueueScheduler, SchedulerService, SweepSettings};
use crate::scheduler::worker::{CheckJobHandler, NotificationJobHandler, WorkerPool, WorkerSettings};
use crate::web;

#[derive(Error, Debug)]
pub enum StartupError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Encryption key error: {0}")]
    Encryption(#[from] EncryptionError),
}

struct Stores {
    monitors: Arc<dyn MonitorStore>,
    incidents: Arc<dyn IncidentStore>,
    history: Arc<dyn CheckHistoryStore>,
    channels: Arc<dyn ChannelStore>,
    queue: Arc<dyn JobQueue>,
    locks: Arc<dyn MonitorLock>,
}

pub struct App {
    pub config: ServerConfig,
    pub pool: Option<PgPool>,
    pub monitors: Arc<dyn MonitorStore>,
    pub queue: Arc<dyn JobQueue>,
    pub incidents: Arc<IncidentService>,
    pub coordinator: Arc<CheckCoordinator>,
    pub dispatcher: Arc<NotificationDispatcher>,
    pub scheduler: Arc<SchedulerService>,
}

impl App {
    /// Wires every component. Uses PostgreSQL when a database URL is
    /// configured and `in_memory` is false.
    pub async fn build(config: ServerConfig, in_memory: bool) -> Result<Self, StartupError> {
        let (stores, pool) = match config.database_url.as_deref() {
            Some(url) if !in_memory => {
                let pool = pg::connect(url, config.database_max_connections).await?;
                pg::apply_schema(&pool).await?;
                let encryption = Arc::new(EncryptionService::from_hex(&config.notification_encryption_key)?);
                info!(max_connections = config.database_max_connections, "Connected to PostgreSQL.");
                (postgres_stores(pool.clone(), encryption, config.lock_namespace), Some(pool))
            }
            _ => {
                info!("Running with in-memory stores; state is lost on exit.");
                (memory_stores(), None)
            }
        };
        Ok(Self::assemble(config, stores, pool))
    }

    fn assemble(config: ServerConfig, stores: Stores, pool: Option<PgPool>) -> Self {
        let Stores {
            monitors,
            incidents,
            history,
            channels,
            queue,
            locks,
        } = stores;

        let incident_service = Arc::new(IncidentService::new(
            monitors.clone(),
            incidents.clone(),
            history.clone(),
            Arc::new(QueuedNotifier::new(queue.clone())),
        ));
        let check_scheduler: Arc<dyn CheckScheduler> = Arc::new(QueueScheduler::new(queue.clone()));
        let coordinator = Arc::new(CheckCoordinator::new(
            monitors.clone(),
            history,
            Arc::new(NetworkProbeExecutor::new()),
            Arc::new(ValidationGate::new(config.validation_timeout())),
            locks,
            incident_service.clone(),
            check_scheduler.clone(),
        ));
        let dispatcher = Arc::new(NotificationDispatcher::new(
            monitors.clone(),
            incidents,
            channels,
            Arc::new(ChannelSenders::new()),
        ));
        let scheduler = Arc::new(SchedulerService::new(
            monitors.clone(),
            check_scheduler,
            BackpressureGovernor::new(queue.clone(), config.queue_soft_cap),
            coordinator.clone(),
            SweepSettings {
                grace: Duration::seconds(config.sweep_grace_seconds),
                batch_size: config.sweep_batch_size,
            },
        ));

        Self {
            config,
            pool,
            monitors,
            queue,
            incidents: incident_service,
            coordinator,
            dispatcher,
            scheduler,
        }
    }

    fn worker_settings(&self, concurrency: usize) -> WorkerSettings {
        WorkerSettings {
            concurrency,
            idle_poll: self.config.idle_poll(),
            max_attempts: self.config.job_max_attempts,
            retry_backoff: Duration::seconds(self.config.job_retry_backoff_seconds),
        }
    }

    pub fn check_workers(&self, concurrency: Option<usize>) -> WorkerPool {
        WorkerPool::new(
            self.queue.clone(),
            Arc::new(CheckJobHandler::new(self.coordinator.clone())),
            self.worker_settings(concurrency.unwrap_or(self.config.check_workers)),
        )
    }

    pub fn notification_workers(&self, concurrency: Option<usize>) -> WorkerPool {
        WorkerPool::new(
            self.queue.clone(),
            Arc::new(NotificationJobHandler::new(self.dispatcher.clone())),
            self.worker_settings(concurrency.unwrap_or(self.config.notification_workers)),
        )
    }

    pub fn router(&self) -> Router {
        web::create_axum_router(self.coordinator.clone())
    }
}

fn memory_stores() -> Stores {
    Stores {
        monitors: Arc::new(MemoryMonitorStore::new()),
        incidents: Arc::new(MemoryIncidentStore::new()),
        history: Arc::new(MemoryCheckHistoryStore::new()),
        channels: Arc::new(MemoryChannelStore::new()),
        queue: Arc::new(MemoryJobQueue::new()),
        locks: Arc::new(LocalLockMap::new()),
    }
}

fn postgres_stores(pool: PgPool, encryption: Arc<EncryptionService>, lock_namespace: i32) -> Stores {
    Stores {
        monitors: Arc::new(PgMonitorStore::new(pool.clone())),
        incidents: Arc::new(PgIncidentStore::new(pool.clone())),
        history: Arc::new(PgCheckHistoryStore::new(pool.clone())),
        channels: Arc::new(PgChannelStore::new(pool.clone(), encryption)),
        queue: Arc::new(PgJobQueue::new(pool.clone())),
        locks: Arc::new(PgAdvisoryLock::new(pool, lock_namespace)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{HttpConfig, MonitorConfig, NewMonitor};
    use crate::scheduler::queue::QueueName;
    use crate::scheduler::service::FirstCheck;

    #[tokio::test]
    async fn test_in_memory_build_without_database() {
        let config = ServerConfig {
            database_url: Some("postgres://unused/db".to_string()),
            ..ServerConfig::default()
        };
        let app = App::build(config, true).await.unwrap();
        assert!(app.pool.is_none());

        let monitor = app
            .monitors
            .create(NewMonitor::new("api", "https://example.com", MonitorConfig::Https(HttpConfig::default())))
            .await
            .unwrap();
        assert_eq!(app.scheduler.submit_new(monitor.id).await.unwrap(), FirstCheck::Queued);
        assert_eq!(app.queue.pending_count(QueueName::Checks).await.unwrap(), 1);
    }
}
