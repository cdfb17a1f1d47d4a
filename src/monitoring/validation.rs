//! First-contact checks for monitors still in `unknown`.
//!
//! A target is accepted when it is well formed, its host resolves and it
//! answers once. Timeouts here are deliberately looser than the monitor's own.

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde_json::{Map, Value, json};
use std::time::Duration;
use thiserror::Error;

use super::probe::{build_client, classify_reqwest_error, resolve_host};
use crate::db::models::{Monitor, MonitorConfig, parse_http_url, split_host_port};

/// Why a target was rejected.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{reason}")]
pub struct ValidationFailure {
    pub reason: String,
    pub details: Map<String, Value>,
}

impl ValidationFailure {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            details: Map::new(),
        }
    }

    fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

/// `Ok` carries details of the successful checks.
pub type ValidationResult = Result<Map<String, Value>, ValidationFailure>;

#[async_trait]
pub trait TargetValidator: Send + Sync {
    async fn validate(&self, monitor: &Monitor) -> ValidationResult;
}

pub struct ValidationGate {
    timeout: Duration,
}

impl ValidationGate {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn validate_http(&self, monitor: &Monitor) -> ValidationResult {
        let schemes: &[&str] = match monitor.config {
            MonitorConfig::Https(_) => &["https"],
            _ => &["http", "https"],
        };
        let url = parse_http_url(&monitor.target, schemes).map_err(|e| ValidationFailure::new(e.to_string()))?;
        let host = url.host_str().unwrap_or_default().to_string();
        let ip = resolve_host(&host, self.timeout)
            .await
            .map_err(|e| ValidationFailure::new(e.message).with_detail("host", host.clone()))?;

        let Some(http) = monitor.config.http() else {
            return Err(ValidationFailure::new("monitor type has no HTTP settings"));
        };
        let client = build_client(http, self.timeout).map_err(|e| ValidationFailure::new(e.message))?;

        // HEAD first; some servers reject it, so any failure falls back to GET.
        let head = client.request(Method::HEAD, url.clone()).send().await;
        let (method, response) = match head {
            Ok(response)
                if response.status() != StatusCode::METHOD_NOT_ALLOWED
                    && response.status() != StatusCode::NOT_IMPLEMENTED =>
            {
                ("HEAD", Ok(response))
            }
            _ => ("GET", client.get(url).send().await),
        };

        match response {
            Ok(response) => Ok(json!({
                "host": host,
                "ip": ip.to_string(),
                "method": method,
                "status_code": response.status().as_u16(),
            })
            .as_object()
            .cloned()
            .unwrap_or_default()),
            Err(e) => {
                let err = classify_reqwest_error(&e);
                Err(ValidationFailure::new(format!("target is not reachable: {}", err.message))
                    .with_detail("host", host)
                    .with_detail("error_kind", err.kind.code()))
            }
        }
    }

    async fn validate_tcp(&self, monitor: &Monitor) -> ValidationResult {
        let (host, port) = split_host_port(&monitor.target).map_err(|e| ValidationFailure::new(e.to_string()))?;
        let ip = resolve_host(&host, self.timeout)
            .await
            .map_err(|e| ValidationFailure::new(e.message).with_detail("host", host.clone()))?;
        match tokio::time::timeout(self.timeout, tokio::net::TcpStream::connect((ip, port))).await {
            Ok(Ok(_)) => {
                let mut details = Map::new();
                details.insert("host".into(), host.into());
                details.insert("ip".into(), ip.to_string().into());
                details.insert("port".into(), port.into());
                Ok(details)
            }
            Ok(Err(e)) => Err(ValidationFailure::new(format!("TCP connection to {host}:{port} failed: {e}"))
                .with_detail("host", host)
                .with_detail("port", port)),
            Err(_) => Err(ValidationFailure::new(format!("TCP connection to {host}:{port} timed out"))
                .with_detail("host", host)
                .with_detail("port", port)),
        }
    }

    async fn validate_ping(&self, monitor: &Monitor) -> ValidationResult {
        let host = monitor.target.trim();
        let ip = resolve_host(host, self.timeout)
            .await
            .map_err(|e| ValidationFailure::new(e.message).with_detail("host", host))?;

        let mut details = Map::new();
        details.insert("host".into(), host.into());
        details.insert("ip".into(), ip.to_string().into());

        let config = if ip.is_ipv6() {
            surge_ping::Config::builder().kind(surge_ping::ICMP::V6).build()
        } else {
            surge_ping::Config::default()
        };
        let client = match surge_ping::Client::new(&config) {
            Ok(client) => client,
            Err(e) => {
                // No ICMP socket (usually missing privileges): accept on DNS alone.
                details.insert("ping_skipped".into(), e.to_string().into());
                return Ok(details);
            }
        };
        let mut pinger = client.pinger(ip, surge_ping::PingIdentifier(rand::random())).await;
        pinger.timeout(self.timeout);
        match pinger.ping(surge_ping::PingSequence(0), &[]).await {
            Ok((_, rtt)) => {
                details.insert("rtt_ms".into(), (rtt.as_secs_f64() * 1000.0).into());
                Ok(details)
            }
            Err(e) => Err(ValidationFailure::new(format!("ping failed: {e}")).with_detail("host", host)),
        }
    }
}

#[async_trait]
impl TargetValidator for ValidationGate {
    async fn validate(&self, monitor: &Monitor) -> ValidationResult {
        monitor
            .config
            .validate(&monitor.target)
            .map_err(|e| ValidationFailure::new(e.to_string()).with_detail("target", monitor.target.clone()))?;
        match &monitor.config {
            MonitorConfig::Http(_) | MonitorConfig::Https(_) | MonitorConfig::Keyword(_) => {
                self.validate_http(monitor).await
            }
            MonitorConfig::Tcp(_) => self.validate_tcp(monitor).await,
            MonitorConfig::Ping(_) => self.validate_ping(monitor).await,
            MonitorConfig::Push(_) => Ok(Map::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::enums::MonitorStatus;
    use crate::db::models::{HttpConfig, TcpConfig};
    use chrono::Utc;
    use wiremock::{Mock, MockServer, ResponseTemplate, matchers};

    fn unknown_monitor(target: &str, config: MonitorConfig) -> Monitor {
        let now = Utc::now();
        Monitor {
            id: 3,
            name: "candidate".to_string(),
            target: target.to_string(),
            config,
            interval_seconds: 60,
            timeout_seconds: 5,
            retries: 0,
            notify_after_retries: 3,
            enabled: true,
            pause_until: None,
            last_status: MonitorStatus::Unknown,
            consecutive_failures: 0,
            next_check_at: None,
            last_checked_at: None,
            last_critical_alert_sent_at: None,
            last_notified_at: None,
            last_heartbeat_at: None,
            push_token: None,
            tls: None,
            channel_ids: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    fn gate() -> ValidationGate {
        ValidationGate::new(Duration::from_secs(3))
    }

    #[tokio::test]
    async fn test_head_rejected_falls_back_to_get() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("HEAD"))
            .respond_with(ResponseTemplate::new(405))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(matchers::method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let monitor = unknown_monitor(&server.uri(), MonitorConfig::Http(HttpConfig::default()));
        let details = gate().validate(&monitor).await.unwrap();
        assert_eq!(details["method"], "GET");
    }

    #[tokio::test]
    async fn test_error_status_still_counts_as_reachable() {
        let server = MockServer::start().await;
        Mock::given(matchers::any())
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let monitor = unknown_monitor(&server.uri(), MonitorConfig::Http(HttpConfig::default()));
        let details = gate().validate(&monitor).await.unwrap();
        assert_eq!(details["status_code"], 503);
    }

    #[tokio::test]
    async fn test_malformed_targets_rejected() {
        let monitor = unknown_monitor("not a url", MonitorConfig::Http(HttpConfig::default()));
        assert!(gate().validate(&monitor).await.is_err());

        let monitor = unknown_monitor("http://example.com", MonitorConfig::Https(HttpConfig::default()));
        assert!(gate().validate(&monitor).await.is_err());

        let monitor = unknown_monitor("example.com", MonitorConfig::Tcp(TcpConfig {}));
        assert!(gate().validate(&monitor).await.is_err());
    }

    #[tokio::test]
    async fn test_tcp_reachability() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let monitor = unknown_monitor(&addr.to_string(), MonitorConfig::Tcp(TcpConfig {}));
        assert!(gate().validate(&monitor).await.is_ok());

        drop(listener);
        let failure = gate().validate(&monitor).await.unwrap_err();
        assert!(failure.reason.contains("TCP connection"));
        assert_eq!(failure.details["port"], addr.port());
    }
}
