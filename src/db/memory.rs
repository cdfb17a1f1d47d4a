//! In-process stores for tests and single-node `--in-memory` runs.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use super::enums::{CheckStatus, MonitorStatus};
use super::models::{
    AlertLogEntry, CheckRecord, Incident, IncidentState, Monitor, MonitorCheckUpdate, NewCheckRecord,
    NewIncident, NewMonitor, NotificationChannel, TlsInfo,
};
use super::repository::{
    ChannelStore, CheckHistoryStore, IncidentStore, MonitorStore, StoreError, StoreResult,
};
use crate::notifications::models::ChannelConfig;

#[derive(Default)]
struct MonitorTable {
    next_id: i32,
    rows: BTreeMap<i32, Monitor>,
}

#[derive(Default)]
pub struct MemoryMonitorStore {
    inner: RwLock<MonitorTable>,
}

impl MemoryMonitorStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn update<F>(&self, id: i32, f: F) -> StoreResult<()>
    where
        F: FnOnce(&mut Monitor) + Send,
    {
        let mut table = self.inner.write().await;
        let monitor = table
            .rows
            .get_mut(&id)
            .ok_or_else(|| StoreError::monitor_not_found(id))?;
        f(monitor);
        monitor.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl MonitorStore for MemoryMonitorStore {
    async fn create(&self, new: NewMonitor) -> StoreResult<Monitor> {
        new.validate()?;
        let now = Utc::now();
        let push_token = new.generate_push_token();
        let mut table = self.inner.write().await;
        table.next_id += 1;
        let monitor = Monitor {
            id: table.next_id,
            name: new.name,
            target: new.target,
            config: new.config,
            interval_seconds: new.interval_seconds,
            timeout_seconds: new.timeout_seconds,
            retries: new.retries,
            notify_after_retries: new.notify_after_retries,
            enabled: new.enabled,
            pause_until: None,
            last_status: MonitorStatus::Unknown,
            consecutive_failures: 0,
            next_check_at: None,
            last_checked_at: None,
            last_critical_alert_sent_at: None,
            last_notified_at: None,
            last_heartbeat_at: None,
            push_token,
            tls: None,
            channel_ids: new.channel_ids,
            created_at: now,
            updated_at: now,
        };
        table.rows.insert(monitor.id, monitor.clone());
        Ok(monitor)
    }

    async fn get(&self, id: i32) -> StoreResult<Option<Monitor>> {
        Ok(self.inner.read().await.rows.get(&id).cloned())
    }

    async fn find_by_push_token(&self, token: &str) -> StoreResult<Option<Monitor>> {
        Ok(self
            .inner
            .read()
            .await
            .rows
            .values()
            .find(|m| m.push_token.as_deref() == Some(token))
            .cloned())
    }

    async fn list_due(&self, now: DateTime<Utc>, grace: Duration, limit: i64) -> StoreResult<Vec<Monitor>> {
        let cutoff = now - grace;
        let table = self.inner.read().await;
        let mut due: Vec<Monitor> = table
            .rows
            .values()
            .filter(|m| m.is_schedulable(now))
            .filter(|m| m.next_check_at.map(|at| at < cutoff).unwrap_or(true))
            .cloned()
            .collect();
        due.sort_by_key(|m| (m.next_check_at.is_some(), m.next_check_at, m.id));
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn record_check(&self, id: i32, update: MonitorCheckUpdate) -> StoreResult<()> {
        self.update(id, |m| {
            m.last_status = update.last_status;
            m.consecutive_failures = update.consecutive_failures;
            m.last_checked_at = Some(update.last_checked_at);
            m.next_check_at = Some(update.next_check_at);
        })
        .await
    }

    async fn set_status(&self, id: i32, status: MonitorStatus) -> StoreResult<()> {
        self.update(id, |m| m.last_status = status).await
    }

    async fn set_next_check_at(&self, id: i32, at: DateTime<Utc>) -> StoreResult<()> {
        self.update(id, |m| m.next_check_at = Some(at)).await
    }

    async fn set_enabled(&self, id: i32, enabled: bool) -> StoreResult<()> {
        self.update(id, |m| m.enabled = enabled).await
    }

    async fn set_pause_until(&self, id: i32, until: Option<DateTime<Utc>>) -> StoreResult<()> {
        self.update(id, |m| m.pause_until = until).await
    }

    async fn set_tls_info(&self, id: i32, tls: TlsInfo) -> StoreResult<()> {
        self.update(id, |m| m.tls = Some(tls)).await
    }

    async fn mark_critical_alert_sent(&self, id: i32, at: DateTime<Utc>) -> StoreResult<()> {
        self.update(id, |m| m.last_critical_alert_sent_at = Some(at)).await
    }

    async fn mark_notified(&self, id: i32, at: DateTime<Utc>) -> StoreResult<()> {
        self.update(id, |m| m.last_notified_at = Some(at)).await
    }

    async fn record_heartbeat(&self, id: i32, at: DateTime<Utc>) -> StoreResult<()> {
        self.update(id, |m| m.last_heartbeat_at = Some(at)).await
    }

    async fn delete(&self, id: i32) -> StoreResult<bool> {
        Ok(self.inner.write().await.rows.remove(&id).is_some())
    }
}

#[derive(Default)]
struct IncidentTable {
    next_id: i32,
    rows: BTreeMap<i32, Incident>,
}

#[derive(Default)]
pub struct MemoryIncidentStore {
    inner: RwLock<IncidentTable>,
}

impl MemoryIncidentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IncidentStore for MemoryIncidentStore {
    async fn find_open(&self, monitor_id: i32) -> StoreResult<Option<Incident>> {
        Ok(self
            .inner
            .read()
            .await
            .rows
            .values()
            .find(|i| i.monitor_id == monitor_id && !i.resolved)
            .cloned())
    }

    async fn get(&self, id: i32) -> StoreResult<Option<Incident>> {
        Ok(self.inner.read().await.rows.get(&id).cloned())
    }

    async fn list_for_monitor(&self, monitor_id: i32) -> StoreResult<Vec<Incident>> {
        Ok(self
            .inner
            .read()
            .await
            .rows
            .values()
            .filter(|i| i.monitor_id == monitor_id)
            .cloned()
            .collect())
    }

    async fn create(&self, new: NewIncident) -> StoreResult<Incident> {
        let mut table = self.inner.write().await;
        if table
            .rows
            .values()
            .any(|i| i.monitor_id == new.monitor_id && !i.resolved)
        {
            return Err(StoreError::Conflict(format!(
                "monitor {} already has an unresolved incident",
                new.monitor_id
            )));
        }
        table.next_id += 1;
        let incident = Incident {
            id: table.next_id,
            monitor_id: new.monitor_id,
            started_at: new.started_at,
            ended_at: None,
            resolved: false,
            status: new.status,
            alert_status: new.alert_status,
            description: new.description,
            alert_log: vec![new.first_entry],
        };
        table.rows.insert(incident.id, incident.clone());
        Ok(incident)
    }

    async fn update_state(&self, id: i32, state: IncidentState) -> StoreResult<Incident> {
        let mut table = self.inner.write().await;
        let monitor_id = table
            .rows
            .get(&id)
            .map(|i| i.monitor_id)
            .ok_or_else(|| StoreError::incident_not_found(id))?;
        if !state.resolved
            && table
                .rows
                .values()
                .any(|i| i.id != id && i.monitor_id == monitor_id && !i.resolved)
        {
            return Err(StoreError::Conflict(format!(
                "monitor {monitor_id} already has an unresolved incident"
            )));
        }
        let incident = table
            .rows
            .get_mut(&id)
            .ok_or_else(|| StoreError::incident_not_found(id))?;
        incident.status = state.status;
        incident.alert_status = state.alert_status;
        incident.resolved = state.resolved;
        incident.ended_at = state.ended_at;
        Ok(incident.clone())
    }

    async fn append_log(&self, id: i32, entry: AlertLogEntry) -> StoreResult<()> {
        let mut table = self.inner.write().await;
        let incident = table
            .rows
            .get_mut(&id)
            .ok_or_else(|| StoreError::incident_not_found(id))?;
        incident.alert_log.push(entry);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryCheckHistoryStore {
    inner: RwLock<HashMap<i32, Vec<CheckRecord>>>,
    next_id: RwLock<i64>,
}

impl MemoryCheckHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckHistoryStore for MemoryCheckHistoryStore {
    async fn append(&self, new: NewCheckRecord) -> StoreResult<CheckRecord> {
        let id = {
            let mut next_id = self.next_id.write().await;
            *next_id += 1;
            *next_id
        };
        let record = CheckRecord {
            id,
            monitor_id: new.monitor_id,
            status: new.status,
            latency_ms: new.latency_ms,
            status_code: new.status_code,
            error_message: new.error_message,
            metadata: new.metadata,
            checked_at: new.checked_at,
        };
        self.inner
            .write()
            .await
            .entry(record.monitor_id)
            .or_default()
            .push(record.clone());
        Ok(record)
    }

    async fn last_success_at(&self, monitor_id: i32) -> StoreResult<Option<DateTime<Utc>>> {
        Ok(self.inner.read().await.get(&monitor_id).and_then(|records| {
            records
                .iter()
                .filter(|r| r.status == CheckStatus::Up)
                .map(|r| r.checked_at)
                .max()
        }))
    }

    async fn recent(&self, monitor_id: i32, limit: i64) -> StoreResult<Vec<CheckRecord>> {
        Ok(self
            .inner
            .read()
            .await
            .get(&monitor_id)
            .map(|records| {
                records
                    .iter()
                    .rev()
                    .take(limit.max(0) as usize)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[derive(Default)]
pub struct MemoryChannelStore {
    inner: RwLock<BTreeMap<i32, NotificationChannel>>,
}

impl MemoryChannelStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChannelStore for MemoryChannelStore {
    async fn create(&self, name: &str, config: ChannelConfig, enabled: bool) -> StoreResult<NotificationChannel> {
        let mut rows = self.inner.write().await;
        let id = rows.keys().next_back().copied().unwrap_or(0) + 1;
        let channel = NotificationChannel {
            id,
            name: name.to_string(),
            config,
            enabled,
        };
        rows.insert(id, channel.clone());
        Ok(channel)
    }

    async fn get(&self, id: i32) -> StoreResult<Option<NotificationChannel>> {
        Ok(self.inner.read().await.get(&id).cloned())
    }

    async fn list_by_ids(&self, ids: &[i32]) -> StoreResult<Vec<NotificationChannel>> {
        let rows = self.inner.read().await;
        Ok(ids.iter().filter_map(|id| rows.get(id).cloned()).collect())
    }
}
