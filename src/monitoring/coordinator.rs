//! One check cycle for one monitor.
//!
//! Every write to a monitor's status fields happens here, under the monitor
//! lock. The cycle ends by resubmitting the monitor to the scheduler, so the
//! chain keeps running without the periodic sweep.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::classify::classify;
use super::lock::{LockError, MonitorLock};
use super::probe::{ProbeExecutor, ProbeResult};
use super::validation::TargetValidator;
use crate::alerting::incident_service::{Failure, IncidentService, StatusChange};
use crate::db::enums::{CheckStatus, MonitorStatus};
use crate::db::models::{Monitor, MonitorCheckUpdate, MonitorConfig, NewCheckRecord};
use crate::db::repository::{CheckHistoryStore, MonitorStore, StoreError};
use crate::scheduler::queue::{Lane, QueueError};
use crate::scheduler::service::CheckScheduler;

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),
    #[error("Failed to reschedule: {0}")]
    Schedule(#[from] QueueError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Another worker holds the monitor.
    Skipped,
    NotFound,
    /// Disabled, paused or a push monitor.
    Inactive,
    /// The monitor is, or just became, `invalid`.
    Invalid,
    /// Validation passed; probing starts with the next cycle.
    Validated,
    /// A newer cycle already ran; the job is pushed back to the due time.
    NotDue { next_check_at: DateTime<Utc> },
    Checked {
        status: CheckStatus,
        consecutive_failures: i32,
    },
}

/// Clock drift allowed between workers before a job counts as early.
const EARLY_TOLERANCE_SECONDS: i64 = 2;

enum Requeue {
    Now,
    AfterInterval,
    At(DateTime<Utc>),
}

impl CheckOutcome {
    fn requeue(&self) -> Option<(Lane, Requeue)> {
        match self {
            CheckOutcome::Validated => Some((Lane::Priority, Requeue::Now)),
            CheckOutcome::Checked { .. } => Some((Lane::Regular, Requeue::AfterInterval)),
            CheckOutcome::NotDue { next_check_at } => Some((Lane::Regular, Requeue::At(*next_check_at))),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Accepted { monitor_id: i32 },
    UnknownKey,
    Inactive,
    /// The monitor is mid-cycle on another worker.
    Busy,
}

/// Counter value after a check, given the status it replaces.
pub fn next_failure_count(previous: MonitorStatus, previous_count: i32, status: CheckStatus) -> i32 {
    match status {
        CheckStatus::Up => 0,
        CheckStatus::Down if previous == MonitorStatus::Down => previous_count + 1,
        CheckStatus::Down => 1,
    }
}

pub struct CheckCoordinator {
    monitors: Arc<dyn MonitorStore>,
    history: Arc<dyn CheckHistoryStore>,
    probe: Arc<dyn ProbeExecutor>,
    validator: Arc<dyn TargetValidator>,
    locks: Arc<dyn MonitorLock>,
    incidents: Arc<IncidentService>,
    scheduler: Arc<dyn CheckScheduler>,
}

impl CheckCoordinator {
    pub fn new(
        monitors: Arc<dyn MonitorStore>,
        history: Arc<dyn CheckHistoryStore>,
        probe: Arc<dyn ProbeExecutor>,
        validator: Arc<dyn TargetValidator>,
        locks: Arc<dyn MonitorLock>,
        incidents: Arc<IncidentService>,
        scheduler: Arc<dyn CheckScheduler>,
    ) -> Self {
        Self {
            monitors,
            history,
            probe,
            validator,
            locks,
            incidents,
            scheduler,
        }
    }

    pub async fn run_check(&self, monitor_id: i32) -> Result<CheckOutcome, CoordinatorError> {
        let Some(guard) = self.locks.try_acquire(monitor_id).await? else {
            debug!(monitor_id, "Monitor is locked by another worker; skipping.");
            return Ok(CheckOutcome::Skipped);
        };
        let result = self.run_locked(monitor_id).await;
        guard.release().await;

        let outcome = result?;
        if let Some((lane, when)) = outcome.requeue() {
            self.requeue(monitor_id, lane, when).await?;
        }
        Ok(outcome)
    }

    async fn run_locked(&self, monitor_id: i32) -> Result<CheckOutcome, CoordinatorError> {
        let Some(monitor) = self.monitors.get(monitor_id).await? else {
            debug!(monitor_id, "Monitor no longer exists.");
            return Ok(CheckOutcome::NotFound);
        };
        let now = Utc::now();
        if !monitor.is_schedulable(now) {
            debug!(monitor_id, enabled = monitor.enabled, "Monitor is not active; nothing to do.");
            return Ok(CheckOutcome::Inactive);
        }

        match monitor.last_status {
            MonitorStatus::Invalid => return Ok(CheckOutcome::Invalid),
            MonitorStatus::Unknown => return self.validate(&monitor, now).await,
            _ => {}
        }
        if let Some(next_check_at) = monitor.next_check_at {
            if next_check_at > now + chrono::Duration::seconds(EARLY_TOLERANCE_SECONDS) {
                debug!(monitor_id, %next_check_at, "Check job arrived early; deferring.");
                return Ok(CheckOutcome::NotDue { next_check_at });
            }
        }

        let started = Instant::now();
        let (result, attempts) = self.probe_with_retries(&monitor).await;
        let wall_clock = started.elapsed();
        let checked_at = Utc::now();

        let status = if result.is_ok() { CheckStatus::Up } else { CheckStatus::Down };
        let consecutive_failures = next_failure_count(monitor.last_status, monitor.consecutive_failures, status);
        // Once this commits the cycle counts. Later writes only log their errors, and
        // a retried job finds the monitor not yet due.
        self.monitors
            .record_check(
                monitor.id,
                MonitorCheckUpdate {
                    last_status: status.into(),
                    consecutive_failures,
                    last_checked_at: checked_at,
                    next_check_at: checked_at + monitor.chrono_interval(),
                },
            )
            .await?;

        let record = check_record(&monitor, &result, attempts, wall_clock, checked_at);
        if let Err(e) = self.history.append(record).await {
            error!(monitor_id, error = %e, "Failed to store check result.");
        }

        let report = match &result {
            Ok(report) => report,
            Err(e) => &e.report,
        };
        if let Some(tls) = &report.tls {
            if let Err(e) = self.monitors.set_tls_info(monitor.id, tls.clone()).await {
                warn!(monitor_id, error = %e, "Failed to store certificate details.");
            }
        }

        let failure = result.as_ref().err().map(|e| Failure {
            class: classify(e),
            message: e.message.clone(),
        });
        if monitor.last_status != MonitorStatus::from(status) {
            info!(monitor_id, from = %monitor.last_status, to = %status, "Monitor status changed.");
        }
        let change = StatusChange {
            previous: monitor.last_status,
            current: status,
            consecutive_failures,
            failure,
            at: checked_at,
        };
        if let Err(e) = self.incidents.apply(&monitor, &change).await {
            error!(monitor_id, error = %e, "Incident update failed.");
        }

        debug!(
            monitor_id,
            status = %status,
            consecutive_failures,
            attempts,
            latency_ms = wall_clock.as_millis() as u64,
            "Check cycle finished."
        );
        Ok(CheckOutcome::Checked {
            status,
            consecutive_failures,
        })
    }

    async fn validate(&self, monitor: &Monitor, now: DateTime<Utc>) -> Result<CheckOutcome, CoordinatorError> {
        match self.validator.validate(monitor).await {
            Ok(details) => {
                self.monitors.set_status(monitor.id, MonitorStatus::Validating).await?;
                info!(monitor_id = monitor.id, ?details, "Target validated.");
                Ok(CheckOutcome::Validated)
            }
            Err(failure) => {
                self.monitors.set_status(monitor.id, MonitorStatus::Invalid).await?;
                warn!(monitor_id = monitor.id, reason = %failure.reason, "Target failed validation.");
                if let Err(e) = self
                    .incidents
                    .record_validation_failure(monitor, &failure.reason, &failure.details, now)
                    .await
                {
                    error!(monitor_id = monitor.id, error = %e, "Failed to record validation incident.");
                }
                Ok(CheckOutcome::Invalid)
            }
        }
    }

    /// Runs up to `1 + retries` probes, stopping at the first success.
    async fn probe_with_retries(&self, monitor: &Monitor) -> (ProbeResult, i32) {
        let mut attempts = 1;
        loop {
            let result = self.probe.probe(monitor).await;
            if result.is_ok() || attempts > monitor.retries {
                return (result, attempts);
            }
            debug!(monitor_id = monitor.id, attempt = attempts, "Probe failed; retrying.");
            attempts += 1;
        }
    }

    /// Resubmits the monitor if a fresh read shows it still active.
    async fn requeue(&self, monitor_id: i32, lane: Lane, when: Requeue) -> Result<bool, CoordinatorError> {
        let Some(monitor) = self.monitors.get(monitor_id).await? else {
            return Ok(false);
        };
        if !monitor.is_schedulable(Utc::now()) {
            debug!(monitor_id, "Monitor deactivated during the cycle; not rescheduling.");
            return Ok(false);
        }
        let delay = match when {
            Requeue::Now => chrono::Duration::zero(),
            Requeue::AfterInterval => monitor.chrono_interval(),
            Requeue::At(at) => (at - Utc::now()).max(chrono::Duration::zero()),
        };
        self.scheduler.submit(monitor_id, delay, lane).await?;
        Ok(true)
    }

    /// Records a push monitor's heartbeat as a successful check.
    pub async fn run_heartbeat(&self, token: &str) -> Result<HeartbeatOutcome, CoordinatorError> {
        let Some(found) = self.monitors.find_by_push_token(token).await? else {
            return Ok(HeartbeatOutcome::UnknownKey);
        };
        let Some(guard) = self.locks.try_acquire(found.id).await? else {
            return Ok(HeartbeatOutcome::Busy);
        };
        let result = self.heartbeat_locked(found.id).await;
        guard.release().await;
        result
    }

    async fn heartbeat_locked(&self, monitor_id: i32) -> Result<HeartbeatOutcome, CoordinatorError> {
        let Some(monitor) = self.monitors.get(monitor_id).await? else {
            return Ok(HeartbeatOutcome::UnknownKey);
        };
        let now = Utc::now();
        if !monitor.enabled || monitor.is_paused(now) {
            return Ok(HeartbeatOutcome::Inactive);
        }

        let mut metadata = Map::new();
        metadata.insert("source".into(), "heartbeat".into());
        self.history
            .append(NewCheckRecord {
                monitor_id,
                status: CheckStatus::Up,
                latency_ms: None,
                status_code: None,
                error_message: None,
                metadata: Value::Object(metadata),
                checked_at: now,
            })
            .await?;
        self.monitors.record_heartbeat(monitor_id, now).await?;
        self.monitors
            .record_check(
                monitor_id,
                MonitorCheckUpdate {
                    last_status: MonitorStatus::Up,
                    consecutive_failures: 0,
                    last_checked_at: now,
                    next_check_at: now + monitor.chrono_interval(),
                },
            )
            .await?;

        let change = StatusChange {
            previous: monitor.last_status,
            current: CheckStatus::Up,
            consecutive_failures: 0,
            failure: None,
            at: now,
        };
        if let Err(e) = self.incidents.apply(&monitor, &change).await {
            error!(monitor_id, error = %e, "Incident update failed.");
        }
        debug!(monitor_id, "Heartbeat recorded.");
        Ok(HeartbeatOutcome::Accepted { monitor_id })
    }
}

fn check_record(
    monitor: &Monitor,
    result: &ProbeResult,
    attempts: i32,
    wall_clock: Duration,
    checked_at: DateTime<Utc>,
) -> NewCheckRecord {
    let (report, error) = match result {
        Ok(report) => (report, None),
        Err(e) => (&e.report, Some(e)),
    };
    // ICMP reports its own round-trip; everything else uses wall-clock time.
    let latency = match (&monitor.config, report.latency) {
        (MonitorConfig::Ping(_), Some(rtt)) => rtt,
        _ => wall_clock,
    };

    let mut metadata = report.metadata.clone();
    if attempts > 1 {
        metadata.insert("attempts".into(), attempts.into());
    }
    if let Some(e) = error {
        metadata.insert("error_kind".into(), e.kind.code().into());
    }

    NewCheckRecord {
        monitor_id: monitor.id,
        status: if error.is_none() { CheckStatus::Up } else { CheckStatus::Down },
        latency_ms: Some(latency.as_millis() as i64),
        status_code: report.status_code.map(i32::from),
        error_message: error.map(|e| e.message.clone()),
        metadata: Value::Object(metadata),
        checked_at,
    }
}
