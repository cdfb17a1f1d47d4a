//! Opens, escalates and resolves incidents from status transitions, and
//! applies operator actions. The alert log is only ever appended to.

use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::db::enums::{AlertLogKind, AlertStatus, CheckStatus, IncidentStatus, MonitorStatus};
use crate::db::models::{AlertLogEntry, Incident, IncidentState, Monitor, NewIncident};
use crate::db::repository::{CheckHistoryStore, IncidentStore, MonitorStore, StoreError};
use crate::monitoring::classify::FailureClass;
use crate::notifications::models::AlertType;
use crate::notifications::service::{AlertNotifier, NotificationRequest};
use crate::notifications::templates::format_duration;

/// Consecutive failures needed before an ordinary `down` alert, whatever the
/// monitor's own `notify_after_retries` says.
pub const DOWN_ALERT_FLOOR: i32 = 10;
/// The failure count at which `critical_down` fires.
pub const CRITICAL_ALERT_THRESHOLD: i32 = 20;

fn critical_fallback_window() -> Duration {
    Duration::hours(1)
}

#[derive(Error, Debug)]
pub enum IncidentError {
    #[error("Incident not found: {0}")]
    NotFound(i32),
    #[error("Cannot {action} incident {id} while it is {status}")]
    InvalidTransition {
        id: i32,
        action: &'static str,
        status: IncidentStatus,
    },
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for IncidentError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(msg) => IncidentError::Conflict(msg),
            other => IncidentError::Store(other),
        }
    }
}

/// Why a check failed, as far as escalation cares.
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    pub class: FailureClass,
    pub message: String,
}

/// The result of one check cycle relative to the monitor's prior state.
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub previous: MonitorStatus,
    pub current: CheckStatus,
    /// Counter value after this check.
    pub consecutive_failures: i32,
    pub failure: Option<Failure>,
    pub at: DateTime<Utc>,
}

/// What the state machine did for one change.
#[derive(Debug, Clone, Default)]
pub struct IncidentUpdate {
    pub incident: Option<Incident>,
    pub alerts: Vec<AlertType>,
}

/// True when a critical alert already went out for the current outage.
///
/// The outage is taken to start after the latest successful check; a monitor
/// that never succeeded falls back to a one-hour window.
pub fn critical_alert_already_sent(
    last_sent: Option<DateTime<Utc>>,
    last_success: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    match (last_sent, last_success) {
        (None, _) => false,
        (Some(sent), Some(success)) => sent > success,
        (Some(sent), None) => now - sent < critical_fallback_window(),
    }
}

pub struct IncidentService {
    monitors: Arc<dyn MonitorStore>,
    incidents: Arc<dyn IncidentStore>,
    history: Arc<dyn CheckHistoryStore>,
    notifier: Arc<dyn AlertNotifier>,
}

impl IncidentService {
    pub fn new(
        monitors: Arc<dyn MonitorStore>,
        incidents: Arc<dyn IncidentStore>,
        history: Arc<dyn CheckHistoryStore>,
        notifier: Arc<dyn AlertNotifier>,
    ) -> Self {
        Self {
            monitors,
            incidents,
            history,
            notifier,
        }
    }

    /// Applies one check outcome. `monitor` is the state read at the start of the cycle.
    pub async fn apply(&self, monitor: &Monitor, change: &StatusChange) -> Result<IncidentUpdate, IncidentError> {
        match change.current {
            CheckStatus::Down => self.on_down(monitor, change).await,
            CheckStatus::Up => self.on_up(monitor, change).await,
        }
    }

    async fn on_down(&self, monitor: &Monitor, change: &StatusChange) -> Result<IncidentUpdate, IncidentError> {
        let mut update = IncidentUpdate::default();
        let critical = change
            .failure
            .as_ref()
            .map(|f| f.class.is_critical())
            .unwrap_or(false);
        let metadata = json!({
            "error": change.failure.as_ref().map(|f| f.message.clone()),
            "consecutive_failures": change.consecutive_failures,
        });
        let threshold = DOWN_ALERT_FLOOR.max(monitor.notify_after_retries);

        let mut incident = match self.incidents.find_open(monitor.id).await? {
            Some(incident) => incident,
            None if critical => {
                let incident = self.open(monitor, change, AlertStatus::Notified).await?;
                info!(monitor_id = monitor.id, incident_id = incident.id, "Critical failure; incident opened.");
                self.send(
                    NotificationRequest::new(monitor.id, AlertType::Down)
                        .with_incident(incident.id)
                        .with_metadata(metadata.clone()),
                    &mut update,
                )
                .await;
                self.incidents
                    .append_log(
                        incident.id,
                        AlertLogEntry::new(AlertLogKind::Notified, "Down alert sent for critical failure", change.at)
                            .with_metadata(metadata.clone()),
                    )
                    .await?;
                incident
            }
            None if change.previous != MonitorStatus::Down => {
                let incident = self.open(monitor, change, AlertStatus::None).await?;
                info!(monitor_id = monitor.id, incident_id = incident.id, "Monitor down; incident opened.");
                incident
            }
            None => {
                // The outage's incident was closed by hand; track the rest of it.
                // Past the threshold the down alert already went out.
                let alert_status = if change.consecutive_failures > threshold {
                    AlertStatus::Notified
                } else {
                    AlertStatus::None
                };
                let incident = self.open(monitor, change, alert_status).await?;
                info!(
                    monitor_id = monitor.id,
                    incident_id = incident.id,
                    consecutive_failures = change.consecutive_failures,
                    "Still down with no open incident; incident reopened."
                );
                incident
            }
        };

        if incident.alert_status == AlertStatus::None && change.consecutive_failures >= threshold {
            self.send(
                NotificationRequest::new(monitor.id, AlertType::Down)
                    .with_incident(incident.id)
                    .with_metadata(metadata.clone()),
                &mut update,
            )
            .await;
            self.incidents
                .append_log(
                    incident.id,
                    AlertLogEntry::new(
                        AlertLogKind::Notified,
                        format!("Down alert sent after {} consecutive failures", change.consecutive_failures),
                        change.at,
                    )
                    .with_metadata(metadata.clone()),
                )
                .await?;
            let mut state = IncidentState::from(&incident);
            state.alert_status = AlertStatus::Notified;
            incident = self.incidents.update_state(incident.id, state).await?;
        }

        if change.consecutive_failures == CRITICAL_ALERT_THRESHOLD {
            let last_success = self.history.last_success_at(monitor.id).await?;
            if critical_alert_already_sent(monitor.last_critical_alert_sent_at, last_success, change.at) {
                debug!(monitor_id = monitor.id, "Critical alert already sent for this outage.");
            } else {
                incident = self.escalate(monitor, incident, change, metadata, &mut update).await?;
            }
        }

        update.incident = Some(incident);
        Ok(update)
    }

    async fn escalate(
        &self,
        monitor: &Monitor,
        incident: Incident,
        change: &StatusChange,
        metadata: Value,
        update: &mut IncidentUpdate,
    ) -> Result<Incident, IncidentError> {
        self.send(
            NotificationRequest::new(monitor.id, AlertType::CriticalDown)
                .with_incident(incident.id)
                .with_metadata(metadata.clone()),
            update,
        )
        .await;
        self.monitors.mark_critical_alert_sent(monitor.id, change.at).await?;
        self.incidents
            .append_log(
                incident.id,
                AlertLogEntry::new(
                    AlertLogKind::CriticalAlert,
                    format!("Critical alert sent after {} consecutive failures", change.consecutive_failures),
                    change.at,
                )
                .with_metadata(metadata),
            )
            .await?;

        let mut state = IncidentState::from(&incident);
        if state.status == IncidentStatus::Open {
            state.status = IncidentStatus::Pending;
        }
        if state.alert_status != AlertStatus::Acknowledged {
            state.alert_status = AlertStatus::CriticalSent;
        }
        warn!(monitor_id = monitor.id, incident_id = incident.id, "Incident escalated.");
        Ok(self.incidents.update_state(incident.id, state).await?)
    }

    async fn on_up(&self, monitor: &Monitor, change: &StatusChange) -> Result<IncidentUpdate, IncidentError> {
        let mut update = IncidentUpdate::default();
        if change.previous == MonitorStatus::Up {
            return Ok(update);
        }
        let Some(incident) = self.incidents.find_open(monitor.id).await? else {
            return Ok(update);
        };

        let duration = change.at - incident.started_at;
        self.incidents
            .append_log(
                incident.id,
                AlertLogEntry::new(
                    AlertLogKind::AutoResolved,
                    format!("Recovered after {}", format_duration(duration)),
                    change.at,
                )
                .with_metadata(json!({ "duration_seconds": duration.num_seconds() })),
            )
            .await?;
        let state = IncidentState {
            status: IncidentStatus::Resolved,
            alert_status: incident.alert_status,
            resolved: true,
            ended_at: Some(change.at),
        };
        let resolved = self.incidents.update_state(incident.id, state).await?;
        info!(monitor_id = monitor.id, incident_id = incident.id, "Monitor recovered; incident resolved.");

        self.send(
            NotificationRequest::new(monitor.id, AlertType::Up).with_incident(incident.id),
            &mut update,
        )
        .await;
        update.incident = Some(resolved);
        Ok(update)
    }

    async fn open(
        &self,
        monitor: &Monitor,
        change: &StatusChange,
        alert_status: AlertStatus,
    ) -> Result<Incident, IncidentError> {
        let reason = change
            .failure
            .as_ref()
            .map(|f| f.message.clone())
            .unwrap_or_else(|| "check failed".to_string());
        let entry = AlertLogEntry::new(AlertLogKind::Opened, format!("Incident opened: {reason}"), change.at)
            .with_metadata(json!({ "consecutive_failures": change.consecutive_failures }));
        let new = NewIncident {
            monitor_id: monitor.id,
            started_at: change.at,
            status: IncidentStatus::Open,
            alert_status,
            description: format!("{} is down: {reason}", monitor.name),
            first_entry: entry,
        };
        match self.incidents.create(new).await {
            Ok(incident) => Ok(incident),
            Err(StoreError::Conflict(msg)) => self
                .incidents
                .find_open(monitor.id)
                .await?
                .ok_or(IncidentError::Conflict(msg)),
            Err(e) => Err(e.into()),
        }
    }

    async fn send(&self, request: NotificationRequest, update: &mut IncidentUpdate) {
        let alert_type = request.alert_type;
        let monitor_id = request.monitor_id;
        if let Err(e) = self.notifier.notify(request).await {
            warn!(monitor_id, alert_type = %alert_type, error = %e, "Failed to hand off alert.");
        }
        update.alerts.push(alert_type);
    }

    /// Records a failed validation on the monitor's open incident, opening one if needed.
    pub async fn record_validation_failure(
        &self,
        monitor: &Monitor,
        reason: &str,
        details: &Map<String, Value>,
        at: DateTime<Utc>,
    ) -> Result<Incident, IncidentError> {
        let entry = AlertLogEntry::new(AlertLogKind::ValidationFailed, format!("Validation failed: {reason}"), at)
            .with_metadata(Value::Object(details.clone()));

        let incident = match self.incidents.find_open(monitor.id).await? {
            Some(open) => {
                self.incidents.append_log(open.id, entry).await?;
                open
            }
            None => {
                self.incidents
                    .create(NewIncident {
                        monitor_id: monitor.id,
                        started_at: at,
                        status: IncidentStatus::Open,
                        alert_status: AlertStatus::Notified,
                        description: format!("{} failed validation: {reason}", monitor.name),
                        first_entry: entry,
                    })
                    .await?
            }
        };

        let mut update = IncidentUpdate::default();
        self.send(
            NotificationRequest::new(monitor.id, AlertType::ValidationFailed)
                .with_incident(incident.id)
                .with_metadata(json!({ "error": reason, "details": details })),
            &mut update,
        )
        .await;
        Ok(incident)
    }

    pub async fn acknowledge(&self, id: i32, actor: &str, reason: Option<&str>) -> Result<Incident, IncidentError> {
        self.transition(id, actor, reason, "acknowledge", AlertLogKind::Acknowledged, |incident| {
            require_unresolved(incident, "acknowledge")?;
            let mut state = IncidentState::from(incident);
            state.alert_status = AlertStatus::Acknowledged;
            Ok(state)
        })
        .await
    }

    pub async fn mark_pending(&self, id: i32, actor: &str, reason: Option<&str>) -> Result<Incident, IncidentError> {
        self.transition(id, actor, reason, "mark pending", AlertLogKind::MarkedPending, |incident| {
            require_unresolved(incident, "mark pending")?;
            let mut state = IncidentState::from(incident);
            state.status = IncidentStatus::Pending;
            Ok(state)
        })
        .await
    }

    pub async fn resolve(&self, id: i32, actor: &str, reason: Option<&str>) -> Result<Incident, IncidentError> {
        let now = Utc::now();
        self.transition(id, actor, reason, "resolve", AlertLogKind::ManuallyResolved, move |incident| {
            require_unresolved(incident, "resolve")?;
            let mut state = IncidentState::from(incident);
            state.status = IncidentStatus::Resolved;
            state.resolved = true;
            state.ended_at = Some(now);
            Ok(state)
        })
        .await
    }

    /// Fails with [`IncidentError::Conflict`] if the monitor has another unresolved incident.
    pub async fn reopen(&self, id: i32, actor: &str, reason: Option<&str>) -> Result<Incident, IncidentError> {
        self.transition(id, actor, reason, "reopen", AlertLogKind::Reopened, |incident| {
            if !incident.resolved {
                return Err(IncidentError::InvalidTransition {
                    id: incident.id,
                    action: "reopen",
                    status: incident.status,
                });
            }
            let mut state = IncidentState::from(incident);
            state.status = IncidentStatus::Open;
            state.resolved = false;
            state.ended_at = None;
            Ok(state)
        })
        .await
    }

    pub async fn add_note(&self, id: i32, actor: &str, note: &str) -> Result<Incident, IncidentError> {
        if self.incidents.get(id).await?.is_none() {
            return Err(IncidentError::NotFound(id));
        }
        self.incidents
            .append_log(id, AlertLogEntry::new(AlertLogKind::Note, note, Utc::now()).with_actor(actor))
            .await?;
        self.incidents.get(id).await?.ok_or(IncidentError::NotFound(id))
    }

    async fn transition<F>(
        &self,
        id: i32,
        actor: &str,
        reason: Option<&str>,
        action: &'static str,
        kind: AlertLogKind,
        next: F,
    ) -> Result<Incident, IncidentError>
    where
        F: FnOnce(&Incident) -> Result<IncidentState, IncidentError> + Send,
    {
        let incident = self.incidents.get(id).await?.ok_or(IncidentError::NotFound(id))?;
        let state = next(&incident)?;
        self.incidents.update_state(id, state).await?;

        let message = match reason {
            Some(reason) => format!("{actor} chose to {action}: {reason}"),
            None => format!("{actor} chose to {action}"),
        };
        let entry = AlertLogEntry::new(kind, message, Utc::now())
            .with_actor(actor)
            .with_metadata(json!({ "reason": reason, "previous_status": incident.status }));
        self.incidents.append_log(id, entry).await?;
        info!(incident_id = id, actor, action, "Incident updated by operator.");
        self.incidents.get(id).await?.ok_or(IncidentError::NotFound(id))
    }
}

fn require_unresolved(incident: &Incident, action: &'static str) -> Result<(), IncidentError> {
    if incident.resolved {
        return Err(IncidentError::InvalidTransition {
            id: incident.id,
            action,
            status: incident.status,
        });
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use async_trait::async_trait;
    use std::sync::Mutex;

    use crate::notifications::models::AlertType;
    use crate::notifications::service::{AlertNotifier, NotificationError, NotificationRequest};

    #[derive(Default)]
    pub struct RecordingNotifier {
        requests: Mutex<Vec<NotificationRequest>>,
    }

    impl RecordingNotifier {
        pub fn requests(&self) -> Vec<NotificationRequest> {
            self.requests.lock().unwrap().clone()
        }

        pub fn count(&self, alert_type: AlertType) -> usize {
            self.requests().iter().filter(|r| r.alert_type == alert_type).count()
        }
    }

    #[async_trait]
    impl AlertNotifier for RecordingNotifier {
        async fn notify(&self, request: NotificationRequest) -> Result<(), NotificationError> {
            self.requests.lock().unwrap().push(request);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::RecordingNotifier;
    use super::*;
    use crate::db::memory::{MemoryCheckHistoryStore, MemoryIncidentStore, MemoryMonitorStore};
    use crate::db::models::{HttpConfig, MonitorCheckUpdate, MonitorConfig, NewCheckRecord, NewMonitor};

    struct Fixture {
        monitors: Arc<MemoryMonitorStore>,
        incidents: Arc<MemoryIncidentStore>,
        history: Arc<MemoryCheckHistoryStore>,
        notifier: Arc<RecordingNotifier>,
        service: IncidentService,
        monitor_id: i32,
    }

    async fn fixture() -> Fixture {
        let monitors = Arc::new(MemoryMonitorStore::new());
        let incidents = Arc::new(MemoryIncidentStore::new());
        let history = Arc::new(MemoryCheckHistoryStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let service = IncidentService::new(monitors.clone(), incidents.clone(), history.clone(), notifier.clone());
        let monitor = monitors
            .create(NewMonitor::new("api", "https://example.com", MonitorConfig::Https(HttpConfig::default())))
            .await
            .unwrap();
        Fixture {
            monitors,
            incidents,
            history,
            notifier,
            service,
            monitor_id: monitor.id,
        }
    }

    impl Fixture {
        /// Applies one check the way a check cycle would.
        async fn check(&self, status: CheckStatus, class: FailureClass) -> IncidentUpdate {
            let monitor = self.monitors.get(self.monitor_id).await.unwrap().unwrap();
            let now = Utc::now();
            let failures = match status {
                CheckStatus::Up => 0,
                CheckStatus::Down if monitor.last_status == MonitorStatus::Down => monitor.consecutive_failures + 1,
                CheckStatus::Down => 1,
            };
            self.history
                .append(NewCheckRecord {
                    monitor_id: monitor.id,
                    status,
                    latency_ms: Some(5),
                    status_code: None,
                    error_message: None,
                    metadata: Value::Null,
                    checked_at: now,
                })
                .await
                .unwrap();
            self.monitors
                .record_check(
                    monitor.id,
                    MonitorCheckUpdate {
                        last_status: status.into(),
                        consecutive_failures: failures,
                        last_checked_at: now,
                        next_check_at: now,
                    },
                )
                .await
                .unwrap();
            let change = StatusChange {
                previous: monitor.last_status,
                current: status,
                consecutive_failures: failures,
                failure: (status == CheckStatus::Down).then(|| Failure {
                    class,
                    message: "boom".to_string(),
                }),
                at: now,
            };
            self.service.apply(&monitor, &change).await.unwrap()
        }
    }

    #[tokio::test]
    async fn test_transient_outage_escalates_once() {
        let f = fixture().await;
        f.check(CheckStatus::Up, FailureClass::Transient).await;

        for n in 1..=21 {
            let update = f.check(CheckStatus::Down, FailureClass::Transient).await;
            let incident = update.incident.unwrap();
            match n {
                1 => {
                    assert_eq!(incident.alert_status, AlertStatus::None);
                    assert!(update.alerts.is_empty());
                }
                10 => assert_eq!(update.alerts, vec![AlertType::Down]),
                20 => {
                    assert_eq!(update.alerts, vec![AlertType::CriticalDown]);
                    assert_eq!(incident.status, IncidentStatus::Pending);
                    assert_eq!(incident.alert_status, AlertStatus::CriticalSent);
                }
                _ => assert!(update.alerts.is_empty(), "unexpected alert at failure {n}"),
            }
        }

        assert_eq!(f.incidents.list_for_monitor(f.monitor_id).await.unwrap().len(), 1);
        assert_eq!(f.notifier.count(AlertType::Down), 1);
        assert_eq!(f.notifier.count(AlertType::CriticalDown), 1);
        let monitor = f.monitors.get(f.monitor_id).await.unwrap().unwrap();
        assert!(monitor.last_critical_alert_sent_at.is_some());
    }

    #[tokio::test]
    async fn test_critical_failure_alerts_immediately() {
        let f = fixture().await;
        let update = f.check(CheckStatus::Down, FailureClass::Critical).await;
        assert_eq!(update.alerts, vec![AlertType::Down]);
        assert_eq!(update.incident.unwrap().alert_status, AlertStatus::Notified);

        for _ in 2..=20 {
            f.check(CheckStatus::Down, FailureClass::Critical).await;
        }
        assert_eq!(f.notifier.count(AlertType::Down), 1);
        assert_eq!(f.notifier.count(AlertType::CriticalDown), 1);
        assert_eq!(f.incidents.list_for_monitor(f.monitor_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_manual_resolve_mid_outage_still_escalates() {
        let f = fixture().await;
        f.check(CheckStatus::Up, FailureClass::Transient).await;
        let mut first = None;
        for _ in 1..=3 {
            first = f.check(CheckStatus::Down, FailureClass::Transient).await.incident;
        }
        let first = first.unwrap();
        f.service.resolve(first.id, "alice", Some("ignoring")).await.unwrap();

        for n in 4..=20 {
            let update = f.check(CheckStatus::Down, FailureClass::Transient).await;
            let incident = update.incident.unwrap();
            assert_ne!(incident.id, first.id);
            if n == 20 {
                assert_eq!(update.alerts, vec![AlertType::CriticalDown]);
                assert_eq!(incident.alert_status, AlertStatus::CriticalSent);
            }
        }

        assert_eq!(f.notifier.count(AlertType::CriticalDown), 1);
        assert_eq!(f.notifier.count(AlertType::Down), 1);
        let incidents = f.incidents.list_for_monitor(f.monitor_id).await.unwrap();
        assert_eq!(incidents.len(), 2);
        assert_eq!(incidents.iter().filter(|i| !i.resolved).count(), 1);
    }

    #[tokio::test]
    async fn test_reopened_past_threshold_does_not_repeat_down_alert() {
        let f = fixture().await;
        let mut opened = None;
        for _ in 1..=12 {
            opened = f.check(CheckStatus::Down, FailureClass::Transient).await.incident;
        }
        assert_eq!(f.notifier.count(AlertType::Down), 1);
        f.service.resolve(opened.unwrap().id, "alice", None).await.unwrap();

        let update = f.check(CheckStatus::Down, FailureClass::Transient).await;
        assert!(update.alerts.is_empty());
        assert_eq!(update.incident.unwrap().alert_status, AlertStatus::Notified);
        assert_eq!(f.notifier.count(AlertType::Down), 1);
    }

    #[tokio::test]
    async fn test_recovery_resolves_and_notifies() {
        let f = fixture().await;
        f.check(CheckStatus::Down, FailureClass::Transient).await;
        f.check(CheckStatus::Down, FailureClass::Transient).await;

        let update = f.check(CheckStatus::Up, FailureClass::Transient).await;
        assert_eq!(update.alerts, vec![AlertType::Up]);
        let incident = update.incident.unwrap();
        assert!(incident.resolved);
        assert_eq!(incident.status, IncidentStatus::Resolved);
        assert!(incident.ended_at.is_some());
        assert_eq!(incident.alert_log.last().unwrap().kind, AlertLogKind::AutoResolved);

        let update = f.check(CheckStatus::Up, FailureClass::Transient).await;
        assert!(update.alerts.is_empty());
        assert_eq!(f.notifier.count(AlertType::Up), 1);
        assert!(f.incidents.find_open(f.monitor_id).await.unwrap().is_none());
    }

    #[test]
    fn test_critical_guard() {
        let now = Utc::now();
        assert!(!critical_alert_already_sent(None, Some(now), now));
        let success = now - Duration::minutes(30);
        assert!(critical_alert_already_sent(Some(now - Duration::minutes(5)), Some(success), now));
        assert!(!critical_alert_already_sent(Some(now - Duration::minutes(40)), Some(success), now));
        assert!(critical_alert_already_sent(Some(now - Duration::minutes(59)), None, now));
        assert!(!critical_alert_already_sent(Some(now - Duration::minutes(61)), None, now));
    }

    #[tokio::test]
    async fn test_operator_transitions() {
        let f = fixture().await;
        let opened = f.check(CheckStatus::Down, FailureClass::Transient).await.incident.unwrap();

        let acked = f.service.acknowledge(opened.id, "alice", Some("looking")).await.unwrap();
        assert_eq!(acked.alert_status, AlertStatus::Acknowledged);
        let entry = acked.alert_log.last().unwrap();
        assert_eq!(entry.kind, AlertLogKind::Acknowledged);
        assert_eq!(entry.actor.as_deref(), Some("alice"));

        let pending = f.service.mark_pending(opened.id, "alice", None).await.unwrap();
        assert_eq!(pending.status, IncidentStatus::Pending);

        let resolved = f.service.resolve(opened.id, "alice", Some("fixed")).await.unwrap();
        assert!(resolved.resolved);
        assert!(matches!(
            f.service.acknowledge(opened.id, "bob", None).await,
            Err(IncidentError::InvalidTransition { .. })
        ));

        // A new outage opens a second incident; reopening the first must conflict.
        f.check(CheckStatus::Up, FailureClass::Transient).await;
        f.check(CheckStatus::Down, FailureClass::Transient).await;
        assert!(matches!(
            f.service.reopen(opened.id, "bob", None).await,
            Err(IncidentError::Conflict(_))
        ));

        let noted = f.service.add_note(opened.id, "bob", "root cause: disk").await.unwrap();
        assert_eq!(noted.alert_log.last().unwrap().kind, AlertLogKind::Note);
        assert!(noted.alert_log.len() > resolved.alert_log.len());
        assert_eq!(f.incidents.list_for_monitor(f.monitor_id).await.unwrap().iter().filter(|i| !i.resolved).count(), 1);
    }

    #[tokio::test]
    async fn test_validation_failure_opens_incident() {
        let f = fixture().await;
        let monitor = f.monitors.get(f.monitor_id).await.unwrap().unwrap();
        let incident = f
            .service
            .record_validation_failure(&monitor, "could not resolve host", &Map::new(), Utc::now())
            .await
            .unwrap();
        assert_eq!(incident.alert_log[0].kind, AlertLogKind::ValidationFailed);
        assert_eq!(f.notifier.count(AlertType::ValidationFailed), 1);
    }
}
