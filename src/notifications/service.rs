use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::models::AlertType;
use super::senders::{NotificationSender, SenderError};
use super::templates;
use crate::db::models::{Incident, Monitor};
use crate::db::repository::{ChannelStore, IncidentStore, MonitorStore, StoreError};
use crate::scheduler::queue::{JobPayload, JobQueue, Lane, QueueError};

#[derive(Error, Debug)]
pub enum NotificationError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Channel not found: {0}")]
    ChannelNotFound(i32),
    #[error("Channel {0} is disabled")]
    ChannelDisabled(i32),
    #[error("Sender error: {0}")]
    Sender(#[from] SenderError),
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// A request to alert a monitor's channels. Serialized into notification jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub monitor_id: i32,
    pub alert_type: AlertType,
    #[serde(default)]
    pub incident_id: Option<i32>,
    #[serde(default)]
    pub custom_message: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl NotificationRequest {
    pub fn new(monitor_id: i32, alert_type: AlertType) -> Self {
        Self {
            monitor_id,
            alert_type,
            incident_id: None,
            custom_message: None,
            metadata: None,
        }
    }

    pub fn with_incident(mut self, incident_id: i32) -> Self {
        self.incident_id = Some(incident_id);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Per-channel delivery counts for one dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Fans one alert out to every enabled channel of a monitor.
pub struct NotificationDispatcher {
    monitors: Arc<dyn MonitorStore>,
    incidents: Arc<dyn IncidentStore>,
    channels: Arc<dyn ChannelStore>,
    sender: Arc<dyn NotificationSender>,
}

impl NotificationDispatcher {
    pub fn new(
        monitors: Arc<dyn MonitorStore>,
        incidents: Arc<dyn IncidentStore>,
        channels: Arc<dyn ChannelStore>,
        sender: Arc<dyn NotificationSender>,
    ) -> Self {
        Self {
            monitors,
            incidents,
            channels,
            sender,
        }
    }

    /// Sends to each enabled channel in the monitor's list.
    ///
    /// A failing channel is logged and skipped, except for `test` alerts where
    /// the first failure is returned to the caller.
    pub async fn dispatch(
        &self,
        monitor: &Monitor,
        alert_type: AlertType,
        incident: Option<&Incident>,
        custom_message: Option<&str>,
        metadata: Option<&serde_json::Value>,
    ) -> Result<DispatchReport, NotificationError> {
        let now = Utc::now();
        let message = templates::render(alert_type, Some(monitor), incident, custom_message, metadata, now);
        let channels = self.channels.list_by_ids(&monitor.channel_ids).await?;

        let mut report = DispatchReport::default();
        for channel in channels.iter().filter(|c| c.enabled) {
            match self.sender.send(&channel.config, &message).await {
                Ok(()) => {
                    debug!(monitor_id = monitor.id, channel_id = channel.id, alert_type = %alert_type, "Notification delivered.");
                    report.delivered += 1;
                }
                Err(e) if alert_type == AlertType::Test => return Err(e.into()),
                Err(e) => {
                    warn!(
                        monitor_id = monitor.id,
                        channel_id = channel.id,
                        channel_type = channel.config.channel_type(),
                        error = %e,
                        "Notification delivery failed."
                    );
                    report.failed += 1;
                }
            }
        }

        if alert_type != AlertType::Test {
            if let Err(e) = self.monitors.mark_notified(monitor.id, now).await {
                warn!(monitor_id = monitor.id, error = %e, "Failed to stamp last notification time.");
            }
        }
        info!(
            monitor_id = monitor.id,
            alert_type = %alert_type,
            delivered = report.delivered,
            failed = report.failed,
            "Alert dispatched."
        );
        Ok(report)
    }

    /// Loads the monitor and incident named by `request` and dispatches.
    /// A monitor deleted since the request was made is skipped.
    pub async fn handle(&self, request: &NotificationRequest) -> Result<DispatchReport, NotificationError> {
        let Some(monitor) = self.monitors.get(request.monitor_id).await? else {
            debug!(monitor_id = request.monitor_id, "Monitor gone; dropping notification.");
            return Ok(DispatchReport::default());
        };
        let incident = match request.incident_id {
            Some(id) => self.incidents.get(id).await?,
            None => None,
        };
        self.dispatch(
            &monitor,
            request.alert_type,
            incident.as_ref(),
            request.custom_message.as_deref(),
            request.metadata.as_ref(),
        )
        .await
    }

    /// Sends a `test` alert to a single channel and reports delivery failure.
    pub async fn test_channel(&self, channel_id: i32, custom_message: Option<&str>) -> Result<(), NotificationError> {
        let channel = self
            .channels
            .get(channel_id)
            .await?
            .ok_or(NotificationError::ChannelNotFound(channel_id))?;
        if !channel.enabled {
            return Err(NotificationError::ChannelDisabled(channel_id));
        }
        let message = templates::render(AlertType::Test, None, None, custom_message, None, Utc::now());
        self.sender.send(&channel.config, &message).await.map_err(|e| {
            error!(channel_id, error = %e, "Test notification failed.");
            NotificationError::from(e)
        })
    }
}

/// Where the incident machine hands its alerts.
#[async_trait]
pub trait AlertNotifier: Send + Sync {
    async fn notify(&self, request: NotificationRequest) -> Result<(), NotificationError>;
}

/// Sends inline, on the caller's task.
#[async_trait]
impl AlertNotifier for NotificationDispatcher {
    async fn notify(&self, request: NotificationRequest) -> Result<(), NotificationError> {
        self.handle(&request).await.map(|_| ())
    }
}

/// Hands alerts to the notification worker pool through the job queue.
pub struct QueuedNotifier {
    queue: Arc<dyn JobQueue>,
}

impl QueuedNotifier {
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl AlertNotifier for QueuedNotifier {
    async fn notify(&self, request: NotificationRequest) -> Result<(), NotificationError> {
        let monitor_id = request.monitor_id;
        let job_id = self
            .queue
            .push(JobPayload::SendNotification(request), Lane::Priority, chrono::Duration::zero())
            .await?;
        debug!(monitor_id, job_id, "Notification queued.");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::{MemoryChannelStore, MemoryIncidentStore, MemoryMonitorStore};
    use crate::db::models::{HttpConfig, MonitorConfig, NewMonitor};
    use crate::notifications::models::ChannelConfig;
    use crate::notifications::senders::test_support::RecordingSender;
    use crate::scheduler::queue::{MemoryJobQueue, QueueName};

    struct Fixture {
        monitors: Arc<MemoryMonitorStore>,
        channels: Arc<MemoryChannelStore>,
        sender: Arc<RecordingSender>,
        dispatcher: NotificationDispatcher,
    }

    fn fixture(sender: RecordingSender) -> Fixture {
        let monitors = Arc::new(MemoryMonitorStore::new());
        let channels = Arc::new(MemoryChannelStore::new());
        let sender = Arc::new(sender);
        let dispatcher = NotificationDispatcher::new(
            monitors.clone(),
            Arc::new(MemoryIncidentStore::new()),
            channels.clone(),
            sender.clone(),
        );
        Fixture {
            monitors,
            channels,
            sender,
            dispatcher,
        }
    }

    fn webhook(url: &str) -> ChannelConfig {
        ChannelConfig::Webhook {
            url: url.to_string(),
            method: "POST".to_string(),
            headers: None,
            body_template: None,
        }
    }

    async fn monitor_with_channels(f: &Fixture, enabled: &[bool]) -> Monitor {
        let mut ids = Vec::new();
        for (i, on) in enabled.iter().enumerate() {
            let url = format!("https://hooks.example.com/{i}");
            ids.push(f.channels.create(&format!("hook-{i}"), webhook(&url), *on).await.unwrap().id);
        }
        f.monitors
            .create(NewMonitor::new("api", "https://example.com", MonitorConfig::Https(HttpConfig::default())).with_channels(ids))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_failures_are_isolated_per_channel() {
        let f = fixture(RecordingSender::failing_for(&["https://hooks.example.com/0"]));
        let monitor = monitor_with_channels(&f, &[true, true, false]).await;

        let report = f
            .dispatcher
            .dispatch(&monitor, AlertType::Down, None, None, None)
            .await
            .unwrap();
        assert_eq!(report, DispatchReport { delivered: 1, failed: 1 });
        assert_eq!(f.sender.sent().len(), 1);

        let stored = f.monitors.get(monitor.id).await.unwrap().unwrap();
        assert!(stored.last_notified_at.is_some());
    }

    #[tokio::test]
    async fn test_test_alerts_propagate_failure() {
        let f = fixture(RecordingSender::failing_for(&["https://hooks.example.com/0"]));
        let monitor = monitor_with_channels(&f, &[true, true]).await;

        let result = f.dispatcher.dispatch(&monitor, AlertType::Test, None, None, None).await;
        assert!(matches!(result, Err(NotificationError::Sender(_))));
        let stored = f.monitors.get(monitor.id).await.unwrap().unwrap();
        assert!(stored.last_notified_at.is_none());

        assert!(f.dispatcher.test_channel(1, None).await.is_err());
        assert!(f.dispatcher.test_channel(2, Some("hello")).await.is_ok());
        assert!(matches!(
            f.dispatcher.test_channel(99, None).await,
            Err(NotificationError::ChannelNotFound(99))
        ));
    }

    #[tokio::test]
    async fn test_handle_skips_deleted_monitor() {
        let f = fixture(RecordingSender::default());
        let monitor = monitor_with_channels(&f, &[true]).await;
        f.monitors.delete(monitor.id).await.unwrap();

        let report = f
            .dispatcher
            .handle(&NotificationRequest::new(monitor.id, AlertType::Up))
            .await
            .unwrap();
        assert_eq!(report, DispatchReport::default());
        assert!(f.sender.sent().is_empty());
    }

    #[tokio::test]
    async fn test_queued_notifier_enqueues_job() {
        let queue = Arc::new(MemoryJobQueue::new());
        let notifier = QueuedNotifier::new(queue.clone());
        notifier
            .notify(NotificationRequest::new(4, AlertType::CriticalDown).with_incident(9))
            .await
            .unwrap();

        let job = queue.reserve(QueueName::Notifications, Utc::now()).await.unwrap().unwrap();
        match job.payload {
            JobPayload::SendNotification(request) => {
                assert_eq!(request.monitor_id, 4);
                assert_eq!(request.incident_id, Some(9));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }
}
