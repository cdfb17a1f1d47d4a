use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use super::enums::{AlertLogKind, AlertStatus, CheckStatus, IncidentStatus, MonitorStatus, MonitorType};
use crate::notifications::models::ChannelConfig;

pub const MIN_INTERVAL_SECONDS: i32 = 10;
pub const MAX_INTERVAL_SECONDS: i32 = 86_400;
pub const MIN_TIMEOUT_SECONDS: i32 = 1;
pub const MAX_TIMEOUT_SECONDS: i32 = 300;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid target: {0}")]
    InvalidTarget(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Check interval out of range: {0} seconds")]
    IntervalOutOfRange(i32),
    #[error("Timeout out of range: {0} seconds")]
    TimeoutOutOfRange(i32),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicAuth {
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// Request settings shared by `http`, `https` and `keyword` monitors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub method: String,
    pub headers: HashMap<String, String>,
    pub basic_auth: Option<BasicAuth>,
    pub body: Option<String>,
    pub verify_ssl: bool,
    pub follow_redirects: bool,
    pub expected_status_code: Option<u16>,
    pub expected_content: Option<String>,
    pub connect_timeout_seconds: Option<u64>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            method: "GET".to_string(),
            headers: HashMap::new(),
            basic_auth: None,
            body: None,
            verify_ssl: true,
            follow_redirects: true,
            expected_status_code: None,
            expected_content: None,
            connect_timeout_seconds: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordConfig {
    #[serde(flatten)]
    pub http: HttpConfig,
    pub keyword: String,
    #[serde(default)]
    pub case_sensitive: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpConfig {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PingConfig {
    pub payload_size: usize,
}

impl Default for PingConfig {
    fn default() -> Self {
        Self { payload_size: 56 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushConfig {}

/// Per-type monitor settings. The variant doubles as the monitor's type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorConfig {
    Http(HttpConfig),
    Https(HttpConfig),
    Tcp(TcpConfig),
    Ping(PingConfig),
    Keyword(KeywordConfig),
    Push(PushConfig),
}

impl MonitorConfig {
    pub fn monitor_type(&self) -> MonitorType {
        match self {
            MonitorConfig::Http(_) => MonitorType::Http,
            MonitorConfig::Https(_) => MonitorType::Https,
            MonitorConfig::Tcp(_) => MonitorType::Tcp,
            MonitorConfig::Ping(_) => MonitorType::Ping,
            MonitorConfig::Keyword(_) => MonitorType::Keyword,
            MonitorConfig::Push(_) => MonitorType::Push,
        }
    }

    /// The HTTP request settings, for the types that issue one.
    pub fn http(&self) -> Option<&HttpConfig> {
        match self {
            MonitorConfig::Http(c) | MonitorConfig::Https(c) => Some(c),
            MonitorConfig::Keyword(k) => Some(&k.http),
            _ => None,
        }
    }

    /// Checks that the target has the shape this monitor type needs.
    pub fn validate(&self, target: &str) -> Result<(), ConfigError> {
        match self {
            MonitorConfig::Http(http) => {
                parse_http_url(target, &["http", "https"])?;
                validate_http_config(http)
            }
            MonitorConfig::Https(http) => {
                parse_http_url(target, &["https"])?;
                validate_http_config(http)
            }
            MonitorConfig::Keyword(keyword) => {
                parse_http_url(target, &["http", "https"])?;
                if keyword.keyword.trim().is_empty() {
                    return Err(ConfigError::InvalidConfig(
                        "keyword monitors need a non-empty keyword".to_string(),
                    ));
                }
                validate_http_config(&keyword.http)
            }
            MonitorConfig::Tcp(_) => split_host_port(target).map(|_| ()),
            MonitorConfig::Ping(_) => {
                let host = target.trim();
                if host.is_empty() || host.contains("://") || host.contains('/') {
                    return Err(ConfigError::InvalidTarget(format!(
                        "ping target must be a bare host name or IP address: {target}"
                    )));
                }
                Ok(())
            }
            MonitorConfig::Push(_) => Ok(()),
        }
    }
}

fn validate_http_config(http: &HttpConfig) -> Result<(), ConfigError> {
    let method = http.method.to_uppercase();
    if !matches!(
        method.as_str(),
        "GET" | "HEAD" | "POST" | "PUT" | "PATCH" | "DELETE" | "OPTIONS"
    ) {
        return Err(ConfigError::InvalidConfig(format!(
            "unsupported HTTP method: {}",
            http.method
        )));
    }
    if let Some(code) = http.expected_status_code {
        if !(100..=599).contains(&code) {
            return Err(ConfigError::InvalidConfig(format!(
                "expected_status_code out of range: {code}"
            )));
        }
    }
    for name in http.headers.keys() {
        reqwest::header::HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ConfigError::InvalidConfig(format!("invalid header name {name}: {e}")))?;
    }
    Ok(())
}

/// Parses an HTTP(S) monitor target and checks its scheme.
pub fn parse_http_url(target: &str, schemes: &[&str]) -> Result<Url, ConfigError> {
    let url = Url::parse(target).map_err(|e| ConfigError::InvalidTarget(format!("{target}: {e}")))?;
    if !schemes.contains(&url.scheme()) {
        return Err(ConfigError::InvalidTarget(format!(
            "unsupported scheme '{}' in {target}",
            url.scheme()
        )));
    }
    if url.host_str().map(str::is_empty).unwrap_or(true) {
        return Err(ConfigError::InvalidTarget(format!("missing host in {target}")));
    }
    Ok(url)
}

/// Splits a `host:port` target. IPv6 hosts must be bracketed (`[::1]:443`).
pub fn split_host_port(target: &str) -> Result<(String, u16), ConfigError> {
    let target = target.trim();
    let (host, port) = if let Some(rest) = target.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| ConfigError::InvalidTarget(format!("unterminated IPv6 host: {target}")))?;
        let port = after
            .strip_prefix(':')
            .ok_or_else(|| ConfigError::InvalidTarget(format!("missing port: {target}")))?;
        (host, port)
    } else {
        target
            .rsplit_once(':')
            .ok_or_else(|| ConfigError::InvalidTarget(format!("expected host:port, got {target}")))?
    };

    if host.is_empty() || host.contains(':') && !target.starts_with('[') {
        return Err(ConfigError::InvalidTarget(format!("invalid host in {target}")));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| ConfigError::InvalidTarget(format!("invalid port in {target}")))?;
    if port == 0 {
        return Err(ConfigError::InvalidTarget("port 0 is not valid".to_string()));
    }
    Ok((host.to_string(), port))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsInfo {
    pub expires_at: DateTime<Utc>,
    pub issuer: String,
    pub checked_at: DateTime<Utc>,
}

impl TlsInfo {
    pub fn days_remaining(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_days()
    }
}

/// A target under observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Monitor {
    pub id: i32,
    pub name: String,
    pub target: String,
    pub config: MonitorConfig,
    pub interval_seconds: i32,
    pub timeout_seconds: i32,
    pub retries: i32,
    pub notify_after_retries: i32,
    pub enabled: bool,
    pub pause_until: Option<DateTime<Utc>>,
    pub last_status: MonitorStatus,
    pub consecutive_failures: i32,
    pub next_check_at: Option<DateTime<Utc>>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_critical_alert_sent_at: Option<DateTime<Utc>>,
    pub last_notified_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub push_token: Option<String>,
    pub tls: Option<TlsInfo>,
    pub channel_ids: Vec<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Monitor {
    pub fn monitor_type(&self) -> MonitorType {
        self.config.monitor_type()
    }

    pub fn is_paused(&self, now: DateTime<Utc>) -> bool {
        self.pause_until.map(|until| until > now).unwrap_or(false)
    }

    /// Enabled, not paused and of a type that gets probed.
    pub fn is_schedulable(&self, now: DateTime<Utc>) -> bool {
        self.enabled && !self.is_paused(now) && self.monitor_type().is_actively_probed()
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds.max(1) as u64)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.max(1) as u64)
    }

    pub fn chrono_interval(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.interval_seconds.max(1) as i64)
    }
}

/// Input for creating a monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMonitor {
    pub name: String,
    pub target: String,
    pub config: MonitorConfig,
    pub interval_seconds: i32,
    pub timeout_seconds: i32,
    pub retries: i32,
    pub notify_after_retries: i32,
    pub enabled: bool,
    pub channel_ids: Vec<i32>,
}

impl NewMonitor {
    pub fn new(name: impl Into<String>, target: impl Into<String>, config: MonitorConfig) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            config,
            interval_seconds: 60,
            timeout_seconds: 10,
            retries: 0,
            notify_after_retries: 3,
            enabled: true,
            channel_ids: Vec::new(),
        }
    }

    pub fn with_interval(mut self, seconds: i32) -> Self {
        self.interval_seconds = seconds;
        self
    }

    pub fn with_timeout(mut self, seconds: i32) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    pub fn with_channels(mut self, channel_ids: Vec<i32>) -> Self {
        self.channel_ids = channel_ids;
        self
    }

    pub fn with_notify_after_retries(mut self, retries: i32) -> Self {
        self.notify_after_retries = retries;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_INTERVAL_SECONDS..=MAX_INTERVAL_SECONDS).contains(&self.interval_seconds) {
            return Err(ConfigError::IntervalOutOfRange(self.interval_seconds));
        }
        if !(MIN_TIMEOUT_SECONDS..=MAX_TIMEOUT_SECONDS).contains(&self.timeout_seconds) {
            return Err(ConfigError::TimeoutOutOfRange(self.timeout_seconds));
        }
        if self.retries < 0 || self.notify_after_retries < 0 {
            return Err(ConfigError::InvalidConfig(
                "retry counts cannot be negative".to_string(),
            ));
        }
        self.config.validate(&self.target)
    }

    /// Push monitors get a random token for the heartbeat URL.
    pub fn generate_push_token(&self) -> Option<String> {
        matches!(self.config, MonitorConfig::Push(_))
            .then(|| uuid::Uuid::new_v4().simple().to_string())
    }
}

/// State written back after a check cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorCheckUpdate {
    pub last_status: MonitorStatus,
    pub consecutive_failures: i32,
    pub last_checked_at: DateTime<Utc>,
    pub next_check_at: DateTime<Utc>,
}

/// One probe outcome, appended to the check history and never modified.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRecord {
    pub id: i64,
    pub monitor_id: i32,
    pub status: CheckStatus,
    pub latency_ms: Option<i64>,
    pub status_code: Option<i32>,
    pub error_message: Option<String>,
    pub metadata: serde_json::Value,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCheckRecord {
    pub monitor_id: i32,
    pub status: CheckStatus,
    pub latency_ms: Option<i64>,
    pub status_code: Option<i32>,
    pub error_message: Option<String>,
    pub metadata: serde_json::Value,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertLogEntry {
    pub kind: AlertLogKind,
    pub message: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub actor: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl AlertLogEntry {
    pub fn new(kind: AlertLogKind, message: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind,
            message: message.into(),
            metadata: serde_json::Value::Object(Default::default()),
            actor: None,
            timestamp,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }
}

/// One continuous outage episode for a monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: i32,
    pub monitor_id: i32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub resolved: bool,
    pub status: IncidentStatus,
    pub alert_status: AlertStatus,
    pub description: String,
    pub alert_log: Vec<AlertLogEntry>,
}

impl Incident {
    pub fn duration(&self, now: DateTime<Utc>) -> ChronoDuration {
        self.ended_at.unwrap_or(now) - self.started_at
    }
}

#[derive(Debug, Clone)]
pub struct NewIncident {
    pub monitor_id: i32,
    pub started_at: DateTime<Utc>,
    pub status: IncidentStatus,
    pub alert_status: AlertStatus,
    pub description: String,
    pub first_entry: AlertLogEntry,
}

/// Mutable state of an incident; the alert log is written only through appends.
#[derive(Debug, Clone, PartialEq)]
pub struct IncidentState {
    pub status: IncidentStatus,
    pub alert_status: AlertStatus,
    pub resolved: bool,
    pub ended_at: Option<DateTime<Utc>>,
}

impl From<&Incident> for IncidentState {
    fn from(incident: &Incident) -> Self {
        Self {
            status: incident.status,
            alert_status: incident.alert_status,
            resolved: incident.resolved,
            ended_at: incident.ended_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationChannel {
    pub id: i32,
    pub name: String,
    pub config: ChannelConfig,
    pub enabled: bool,
}
