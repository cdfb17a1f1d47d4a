use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use pulsekeeper::alerting::incident_service::IncidentService;
use pulsekeeper::db::enums::{CheckStatus, IncidentStatus, MonitorStatus};
use pulsekeeper::db::memory::{MemoryChannelStore, MemoryCheckHistoryStore, MemoryIncidentStore, MemoryMonitorStore};
use pulsekeeper::db::models::{HttpConfig, Monitor, MonitorConfig, NewMonitor};
use pulsekeeper::db::repository::{ChannelStore, CheckHistoryStore, IncidentStore, MonitorStore};
use pulsekeeper::monitoring::coordinator::{CheckCoordinator, CheckOutcome};
use pulsekeeper::monitoring::lock::LocalLockMap;
use pulsekeeper::monitoring::probe::{ProbeError, ProbeErrorKind, ProbeExecutor, ProbeReport, ProbeResult};
use pulsekeeper::monitoring::validation::{TargetValidator, ValidationResult};
use pulsekeeper::notifications::models::{AlertMessage, AlertType, ChannelConfig};
use pulsekeeper::notifications::senders::{NotificationSender, SenderError};
use pulsekeeper::notifications::service::NotificationDispatcher;
use pulsekeeper::scheduler::queue::{Lane, QueueError};
use pulsekeeper::scheduler::service::CheckScheduler;

/// Healthy until switched off, then refuses connections.
struct SwitchProbe {
    healthy: AtomicBool,
}

#[async_trait]
impl ProbeExecutor for SwitchProbe {
    async fn probe(&self, _monitor: &Monitor) -> ProbeResult {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(ProbeReport {
                status_code: Some(200),
                ..ProbeReport::default()
            })
        } else {
            Err(ProbeError::new(ProbeErrorKind::ConnectionRefused, "connection refused"))
        }
    }
}

struct AcceptAll;

#[async_trait]
impl TargetValidator for AcceptAll {
    async fn validate(&self, _monitor: &Monitor) -> ValidationResult {
        Ok(Default::default())
    }
}

#[derive(Default)]
struct CapturingSender {
    sent: Mutex<Vec<AlertType>>,
}

impl CapturingSender {
    fn count(&self, alert_type: AlertType) -> usize {
        self.sent.lock().unwrap().iter().filter(|t| **t == alert_type).count()
    }
}

#[async_trait]
impl NotificationSender for CapturingSender {
    async fn send(&self, _config: &ChannelConfig, message: &AlertMessage) -> Result<(), SenderError> {
        self.sent.lock().unwrap().push(message.alert_type);
        Ok(())
    }
}

#[derive(Default)]
struct CountingScheduler {
    submitted: Mutex<Vec<(i32, Lane)>>,
}

#[async_trait]
impl CheckScheduler for CountingScheduler {
    async fn submit(&self, monitor_id: i32, _delay: chrono::Duration, lane: Lane) -> Result<(), QueueError> {
        self.submitted.lock().unwrap().push((monitor_id, lane));
        Ok(())
    }
}

struct Pipeline {
    monitors: Arc<MemoryMonitorStore>,
    incidents: Arc<MemoryIncidentStore>,
    history: Arc<MemoryCheckHistoryStore>,
    channels: Arc<MemoryChannelStore>,
    sender: Arc<CapturingSender>,
    scheduler: Arc<CountingScheduler>,
    probe: Arc<SwitchProbe>,
    coordinator: CheckCoordinator,
}

fn pipeline() -> Pipeline {
    let monitors = Arc::new(MemoryMonitorStore::new());
    let incidents = Arc::new(MemoryIncidentStore::new());
    let history = Arc::new(MemoryCheckHistoryStore::new());
    let channels = Arc::new(MemoryChannelStore::new());
    let sender = Arc::new(CapturingSender::default());
    let scheduler = Arc::new(CountingScheduler::default());
    let probe = Arc::new(SwitchProbe {
        healthy: AtomicBool::new(true),
    });

    // Alerts are dispatched inline so every send is visible when run_check returns.
    let dispatcher = Arc::new(NotificationDispatcher::new(
        monitors.clone(),
        incidents.clone(),
        channels.clone(),
        sender.clone(),
    ));
    let incident_service = Arc::new(IncidentService::new(
        monitors.clone(),
        incidents.clone(),
        history.clone(),
        dispatcher,
    ));
    let coordinator = CheckCoordinator::new(
        monitors.clone(),
        history.clone(),
        probe.clone(),
        Arc::new(AcceptAll),
        Arc::new(LocalLockMap::new()),
        incident_service,
        scheduler.clone(),
    );
    Pipeline {
        monitors,
        incidents,
        history,
        channels,
        sender,
        scheduler,
        probe,
        coordinator,
    }
}

/// Runs the next cycle as if its interval had elapsed.
async fn next_cycle(p: &Pipeline, monitor_id: i32) -> CheckOutcome {
    p.monitors.set_next_check_at(monitor_id, Utc::now()).await.unwrap();
    p.coordinator.run_check(monitor_id).await.unwrap()
}

async fn https_monitor(p: &Pipeline) -> Monitor {
    let channel = p
        .channels
        .create(
            "ops-hook",
            ChannelConfig::Webhook {
                url: "https://hooks.example.com/ops".to_string(),
                method: "POST".to_string(),
                headers: None,
                body_template: None,
            },
            true,
        )
        .await
        .unwrap();
    p.monitors
        .create(
            NewMonitor::new("monitor-a", "https://status.example.com", MonitorConfig::Https(HttpConfig::default()))
                .with_channels(vec![channel.id]),
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn healthy_then_twenty_refused_checks_escalate_once() {
    let p = pipeline();
    let monitor = https_monitor(&p).await;

    // First contact validates; the next cycle probes.
    assert_eq!(p.coordinator.run_check(monitor.id).await.unwrap(), CheckOutcome::Validated);
    let outcome = next_cycle(&p, monitor.id).await;
    assert_eq!(
        outcome,
        CheckOutcome::Checked {
            status: CheckStatus::Up,
            consecutive_failures: 0
        }
    );
    let recent = p.history.recent(monitor.id, 10).await.unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].status, CheckStatus::Up);
    assert!(p.incidents.list_for_monitor(monitor.id).await.unwrap().is_empty());

    p.probe.healthy.store(false, Ordering::SeqCst);
    for expected in 1..=20 {
        let outcome = next_cycle(&p, monitor.id).await;
        assert_eq!(
            outcome,
            CheckOutcome::Checked {
                status: CheckStatus::Down,
                consecutive_failures: expected
            }
        );
        if expected == 1 {
            let open = p.incidents.find_open(monitor.id).await.unwrap().unwrap();
            assert_eq!(open.status, IncidentStatus::Open);
        }
    }

    let incidents = p.incidents.list_for_monitor(monitor.id).await.unwrap();
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].status, IncidentStatus::Pending);
    assert_eq!(p.sender.count(AlertType::CriticalDown), 1);
    assert_eq!(p.sender.count(AlertType::Down), 1);

    let stored = p.monitors.get(monitor.id).await.unwrap().unwrap();
    assert_eq!(stored.last_status, MonitorStatus::Down);
    assert_eq!(stored.consecutive_failures, 20);
    assert!(stored.last_critical_alert_sent_at.is_some());

    // Further failures never repeat the critical alert.
    for _ in 0..5 {
        next_cycle(&p, monitor.id).await;
    }
    assert_eq!(p.sender.count(AlertType::CriticalDown), 1);

    // Every cycle re-submitted the monitor for its next run.
    let submitted = p.scheduler.submitted.lock().unwrap().clone();
    assert_eq!(submitted.len(), 27);
    assert_eq!(submitted[0], (monitor.id, Lane::Priority));
    assert!(submitted[1..].iter().all(|s| *s == (monitor.id, Lane::Regular)));
}

#[tokio::test]
async fn recovery_resolves_the_incident() {
    let p = pipeline();
    let monitor = https_monitor(&p).await;
    p.coordinator.run_check(monitor.id).await.unwrap();
    next_cycle(&p, monitor.id).await;

    p.probe.healthy.store(false, Ordering::SeqCst);
    for _ in 0..3 {
        next_cycle(&p, monitor.id).await;
    }
    assert!(p.incidents.find_open(monitor.id).await.unwrap().is_some());

    p.probe.healthy.store(true, Ordering::SeqCst);
    next_cycle(&p, monitor.id).await;

    assert!(p.incidents.find_open(monitor.id).await.unwrap().is_none());
    let incidents = p.incidents.list_for_monitor(monitor.id).await.unwrap();
    assert_eq!(incidents.len(), 1);
    assert!(incidents[0].resolved);
    assert!(incidents[0].ended_at.is_some());
    assert_eq!(p.sender.count(AlertType::Up), 1);

    let stored = p.monitors.get(monitor.id).await.unwrap().unwrap();
    assert_eq!(stored.consecutive_failures, 0);
    assert!(stored.last_notified_at.is_some());
}

#[tokio::test]
async fn disabled_monitor_is_left_alone() {
    let p = pipeline();
    let monitor = https_monitor(&p).await;
    p.monitors.set_enabled(monitor.id, false).await.unwrap();

    assert_eq!(p.coordinator.run_check(monitor.id).await.unwrap(), CheckOutcome::Inactive);
    assert!(p.scheduler.submitted.lock().unwrap().is_empty());
    assert!(p.history.recent(monitor.id, 10).await.unwrap().is_empty());
}
