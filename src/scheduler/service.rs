use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use super::queue::{JobPayload, JobQueue, Lane, QueueError, QueueName};
use crate::db::repository::{MonitorStore, StoreError};
use crate::monitoring::coordinator::{CheckCoordinator, CheckOutcome};

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Delayed resubmission of a monitor. The coordinator's only view of scheduling.
#[async_trait]
pub trait CheckScheduler: Send + Sync {
    async fn submit(&self, monitor_id: i32, delay: Duration, lane: Lane) -> Result<(), QueueError>;
}

/// Submits check jobs to the durable queue.
pub struct QueueScheduler {
    queue: Arc<dyn JobQueue>,
}

impl QueueScheduler {
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl CheckScheduler for QueueScheduler {
    async fn submit(&self, monitor_id: i32, delay: Duration, lane: Lane) -> Result<(), QueueError> {
        let job_id = self
            .queue
            .push(JobPayload::CheckMonitor { monitor_id }, lane, delay)
            .await?;
        debug!(monitor_id, job_id, delay_seconds = delay.num_seconds(), ?lane, "Check scheduled.");
        Ok(())
    }
}

/// Soft cap on outstanding check jobs.
pub struct BackpressureGovernor {
    queue: Arc<dyn JobQueue>,
    soft_cap: usize,
}

impl BackpressureGovernor {
    pub fn new(queue: Arc<dyn JobQueue>, soft_cap: usize) -> Self {
        Self { queue, soft_cap }
    }

    pub async fn is_saturated(&self) -> Result<bool, QueueError> {
        let pending = self.queue.pending_count(QueueName::Checks).await?;
        Ok(pending >= self.soft_cap)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SweepSettings {
    /// How overdue a scheduled monitor must be before the sweep picks it up.
    pub grace: Duration,
    pub batch_size: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub enqueued: usize,
    pub inline: usize,
    pub failed: usize,
}

/// How a new monitor's first check was started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirstCheck {
    Queued,
    Inline(CheckOutcome),
}

pub struct SchedulerService {
    monitors: Arc<dyn MonitorStore>,
    scheduler: Arc<dyn CheckScheduler>,
    governor: BackpressureGovernor,
    coordinator: Arc<CheckCoordinator>,
    settings: SweepSettings,
}

impl SchedulerService {
    pub fn new(
        monitors: Arc<dyn MonitorStore>,
        scheduler: Arc<dyn CheckScheduler>,
        governor: BackpressureGovernor,
        coordinator: Arc<CheckCoordinator>,
        settings: SweepSettings,
    ) -> Self {
        Self {
            monitors,
            scheduler,
            governor,
            coordinator,
            settings,
        }
    }

    /// Starts the first check of a just-created monitor. Runs it inline when
    /// the queue is over its soft cap.
    pub async fn submit_new(&self, monitor_id: i32) -> Result<FirstCheck, SchedulerError> {
        if self.governor.is_saturated().await? {
            info!(monitor_id, "Check queue saturated; running first check inline.");
            let outcome = self
                .coordinator
                .run_check(monitor_id)
                .await
                .map_err(|e| {
                    warn!(monitor_id, error = %e, "Inline first check failed.");
                    e
                })
                .unwrap_or(CheckOutcome::Skipped);
            return Ok(FirstCheck::Inline(outcome));
        }
        self.scheduler.submit(monitor_id, Duration::zero(), Lane::Priority).await?;
        Ok(FirstCheck::Queued)
    }

    /// Enqueues every monitor that is new or overdue past the grace window.
    /// The queue merges these into any check already pending for the monitor.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, SchedulerError> {
        let due = self
            .monitors
            .list_due(now, self.settings.grace, self.settings.batch_size)
            .await?;
        let mut report = SweepReport::default();
        if due.is_empty() {
            return Ok(report);
        }
        let saturated = self.governor.is_saturated().await?;

        for monitor in due {
            let first_check = monitor.next_check_at.is_none();
            if first_check && saturated {
                match self.coordinator.run_check(monitor.id).await {
                    Ok(_) => report.inline += 1,
                    Err(e) => {
                        warn!(monitor_id = monitor.id, error = %e, "Inline first check failed.");
                        report.failed += 1;
                    }
                }
                continue;
            }

            let lane = if first_check { Lane::Priority } else { Lane::Regular };
            match self.scheduler.submit(monitor.id, Duration::zero(), lane).await {
                Ok(()) => report.enqueued += 1,
                Err(e) => {
                    warn!(monitor_id = monitor.id, error = %e, "Failed to enqueue check.");
                    report.failed += 1;
                }
            }
        }

        info!(
            enqueued = report.enqueued,
            inline = report.inline,
            failed = report.failed,
            "Scheduler sweep finished."
        );
        Ok(report)
    }

    /// Sweeps every `poll_interval` until `shutdown` flips to true.
    pub async fn run(&self, poll_interval: std::time::Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_seconds = poll_interval.as_secs(), "Scheduler started.");
        let mut ticker = interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    debug!("Running scheduler sweep...");
                    if let Err(e) = self.sweep(Utc::now()).await {
                        error!(error = %e, "Error during scheduler sweep.");
                    }
                }
            }
        }
        info!("Scheduler stopped.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerting::incident_service::IncidentService;
    use crate::alerting::incident_service::test_support::RecordingNotifier;
    use crate::db::enums::MonitorStatus;
    use crate::db::memory::{MemoryCheckHistoryStore, MemoryIncidentStore, MemoryMonitorStore};
    use crate::db::models::{HttpConfig, MonitorConfig, NewMonitor, PushConfig};
    use crate::monitoring::coordinator::test_support::{FixedValidator, ScriptedProbe};
    use crate::monitoring::lock::LocalLockMap;
    use crate::scheduler::queue::MemoryJobQueue;
    use crate::scheduler::worker::{CheckJobHandler, JobOutcome, WorkerPool, WorkerSettings};

    struct Fixture {
        monitors: Arc<MemoryMonitorStore>,
        queue: Arc<MemoryJobQueue>,
        probe: Arc<ScriptedProbe>,
        coordinator: Arc<CheckCoordinator>,
        service: SchedulerService,
    }

    fn fixture(soft_cap: usize) -> Fixture {
        fixture_with(soft_cap, ScriptedProbe::up())
    }

    fn fixture_with(soft_cap: usize, probe: ScriptedProbe) -> Fixture {
        let monitors = Arc::new(MemoryMonitorStore::new());
        let history = Arc::new(MemoryCheckHistoryStore::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let probe = Arc::new(probe);
        let scheduler: Arc<dyn CheckScheduler> = Arc::new(QueueScheduler::new(queue.clone()));
        let incidents = Arc::new(IncidentService::new(
            monitors.clone(),
            Arc::new(MemoryIncidentStore::new()),
            history.clone(),
            Arc::new(RecordingNotifier::default()),
        ));
        let coordinator = Arc::new(CheckCoordinator::new(
            monitors.clone(),
            history,
            probe.clone(),
            Arc::new(FixedValidator(None)),
            Arc::new(LocalLockMap::new()),
            incidents,
            scheduler.clone(),
        ));
        let service = SchedulerService::new(
            monitors.clone(),
            scheduler,
            BackpressureGovernor::new(queue.clone(), soft_cap),
            coordinator.clone(),
            SweepSettings {
                grace: Duration::seconds(60),
                batch_size: 100,
            },
        );
        Fixture {
            monitors,
            queue,
            probe,
            coordinator,
            service,
        }
    }

    fn https(name: &str) -> NewMonitor {
        NewMonitor::new(name, "https://example.com", MonitorConfig::Https(HttpConfig::default()))
    }

    #[tokio::test]
    async fn test_sweep_enqueues_new_and_overdue_only() {
        let f = fixture(100);
        let now = Utc::now();
        let new = f.monitors.create(https("new")).await.unwrap();
        let overdue = f.monitors.create(https("overdue")).await.unwrap();
        let recent = f.monitors.create(https("recent")).await.unwrap();
        f.monitors.create(NewMonitor::new("cron", "", MonitorConfig::Push(PushConfig {}))).await.unwrap();
        f.monitors.set_next_check_at(overdue.id, now - Duration::minutes(5)).await.unwrap();
        f.monitors.set_next_check_at(recent.id, now - Duration::seconds(10)).await.unwrap();

        let report = f.service.sweep(now).await.unwrap();
        assert_eq!(report.enqueued, 2);

        let first = f.queue.reserve(QueueName::Checks, now).await.unwrap().unwrap();
        assert_eq!(first.lane, Lane::Priority);
        assert_eq!(first.payload, JobPayload::CheckMonitor { monitor_id: new.id });
        let second = f.queue.reserve(QueueName::Checks, now).await.unwrap().unwrap();
        assert_eq!(second.payload, JobPayload::CheckMonitor { monitor_id: overdue.id });

        // The recent monitor got no job.
        assert_eq!(f.queue.pending_count(QueueName::Checks).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_backlogged_monitor_keeps_a_single_chain() {
        let f = fixture_with(100, ScriptedProbe::refused());
        let monitor = f.monitors.create(https("slow")).await.unwrap();
        f.monitors.set_status(monitor.id, MonitorStatus::Up).await.unwrap();
        let now = Utc::now();
        f.monitors.set_next_check_at(monitor.id, now - Duration::minutes(5)).await.unwrap();
        // The chain job the last cycle left behind, still waiting for a worker.
        f.queue
            .push(JobPayload::CheckMonitor { monitor_id: monitor.id }, Lane::Regular, Duration::zero())
            .await
            .unwrap();

        let report = f.service.sweep(now).await.unwrap();
        assert_eq!(report.enqueued, 1);
        assert_eq!(f.queue.pending_count(QueueName::Checks).await.unwrap(), 1);

        let pool = WorkerPool::new(
            f.queue.clone(),
            Arc::new(CheckJobHandler::new(f.coordinator.clone())),
            WorkerSettings {
                concurrency: 1,
                idle_poll: std::time::Duration::from_millis(10),
                max_attempts: 3,
                retry_backoff: Duration::zero(),
            },
        );
        assert_eq!(pool.run_once().await.unwrap(), JobOutcome::Completed);
        assert_eq!(pool.run_once().await.unwrap(), JobOutcome::Idle);

        assert_eq!(f.probe.calls(), 1);
        let stored = f.monitors.get(monitor.id).await.unwrap().unwrap();
        assert_eq!(stored.consecutive_failures, 1);
        // Only the next-interval job remains.
        assert_eq!(f.queue.pending_count(QueueName::Checks).await.unwrap(), 1);
        let stats = f.queue.stats(QueueName::Checks, Utc::now()).await.unwrap();
        assert_eq!(stats.delayed, 1);

        // The next sweep finds nothing due.
        f.service.sweep(Utc::now()).await.unwrap();
        assert_eq!(f.queue.pending_count(QueueName::Checks).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_saturated_queue_runs_first_checks_inline() {
        let f = fixture(1);
        f.queue
            .push(JobPayload::CheckMonitor { monitor_id: 999 }, Lane::Regular, Duration::zero())
            .await
            .unwrap();
        let monitor = f.monitors.create(https("new")).await.unwrap();

        let report = f.service.sweep(Utc::now()).await.unwrap();
        assert_eq!(report.inline, 1);
        assert_eq!(report.enqueued, 0);
        let stored = f.monitors.get(monitor.id).await.unwrap().unwrap();
        assert_eq!(stored.last_status, MonitorStatus::Validating);
        assert_eq!(f.probe.calls(), 0);
    }

    #[tokio::test]
    async fn test_submit_new_respects_soft_cap() {
        let f = fixture(1);
        let a = f.monitors.create(https("a")).await.unwrap();
        assert_eq!(f.service.submit_new(a.id).await.unwrap(), FirstCheck::Queued);

        let b = f.monitors.create(https("b")).await.unwrap();
        assert_eq!(
            f.service.submit_new(b.id).await.unwrap(),
            FirstCheck::Inline(CheckOutcome::Validated)
        );
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let f = fixture(100);
        let (tx, rx) = watch::channel(false);
        let handle = async {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            tx.send(true).unwrap();
        };
        let run = f.service.run(std::time::Duration::from_millis(10), rx);
        tokio::time::timeout(std::time::Duration::from_secs(2), async { tokio::join!(run, handle) })
            .await
            .unwrap();
    }
}
