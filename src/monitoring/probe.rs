//! Protocol-specific checks. One call performs one check and never runs past
//! the monitor's timeout.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Method, redirect};
use serde_json::{Map, Value};
use std::error::Error as StdError;
use std::fmt;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

use super::tls::CertificateInspector;
use crate::db::models::{
    HttpConfig, KeywordConfig, Monitor, MonitorConfig, PingConfig, TlsInfo, parse_http_url, split_host_port,
};

const USER_AGENT: &str = concat!("pulsekeeper/", env!("CARGO_PKG_VERSION"));
const MAX_REDIRECTS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeErrorKind {
    ConnectionRefused,
    ConnectionFailed,
    ConnectTimeout,
    RequestTimeout,
    HostUnreachable,
    DnsFailure,
    TcpConnectionFailed,
    PingFailed,
    HttpServerError,
    HttpClientError,
    UnexpectedStatus,
    ContentMismatch,
    KeywordNotFound,
    Tls,
    InvalidTarget,
    Other,
}

impl ProbeErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            ProbeErrorKind::ConnectionRefused => "CONNECTION_REFUSED",
            ProbeErrorKind::ConnectionFailed => "CONNECTION_FAILED",
            ProbeErrorKind::ConnectTimeout => "CONNECT_TIMEOUT",
            ProbeErrorKind::RequestTimeout => "REQUEST_TIMEOUT",
            ProbeErrorKind::HostUnreachable => "HOST_UNREACHABLE",
            ProbeErrorKind::DnsFailure => "DNS_FAILURE",
            ProbeErrorKind::TcpConnectionFailed => "TCP_CONNECTION_FAILED",
            ProbeErrorKind::PingFailed => "PING_FAILED",
            ProbeErrorKind::HttpServerError => "HTTP_SERVER_ERROR",
            ProbeErrorKind::HttpClientError => "HTTP_CLIENT_ERROR",
            ProbeErrorKind::UnexpectedStatus => "UNEXPECTED_STATUS",
            ProbeErrorKind::ContentMismatch => "CONTENT_MISMATCH",
            ProbeErrorKind::KeywordNotFound => "KEYWORD_NOT_FOUND",
            ProbeErrorKind::Tls => "TLS_ERROR",
            ProbeErrorKind::InvalidTarget => "INVALID_TARGET",
            ProbeErrorKind::Other => "PROBE_ERROR",
        }
    }
}

impl fmt::Display for ProbeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// What a probe observed, whether or not the target was healthy.
#[derive(Debug, Clone, Default)]
pub struct ProbeReport {
    /// Latency measured by the protocol itself (e.g. ICMP round-trip).
    pub latency: Option<Duration>,
    pub status_code: Option<u16>,
    pub metadata: Map<String, Value>,
    pub tls: Option<TlsInfo>,
}

#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct ProbeError {
    pub kind: ProbeErrorKind,
    pub message: String,
    pub report: ProbeReport,
}

impl ProbeError {
    pub fn new(kind: ProbeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            report: ProbeReport::default(),
        }
    }

    pub fn with_report(mut self, report: ProbeReport) -> Self {
        self.report = report;
        self
    }
}

pub type ProbeResult = Result<ProbeReport, ProbeError>;

#[async_trait]
pub trait ProbeExecutor: Send + Sync {
    /// Runs one check. `Ok` means the target is up.
    async fn probe(&self, monitor: &Monitor) -> ProbeResult;
}

/// Probes targets over the network.
pub struct NetworkProbeExecutor {
    certificates: Option<CertificateInspector>,
}

impl Default for NetworkProbeExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkProbeExecutor {
    pub fn new() -> Self {
        Self {
            certificates: Some(CertificateInspector::new()),
        }
    }

    /// An executor that never performs the extra certificate handshake.
    pub fn without_certificate_lookup() -> Self {
        Self { certificates: None }
    }

    async fn run_http(&self, monitor: &Monitor, http: &HttpConfig, keyword: Option<&KeywordConfig>) -> ProbeResult {
        let url = parse_http_url(&monitor.target, &["http", "https"])
            .map_err(|e| ProbeError::new(ProbeErrorKind::InvalidTarget, e.to_string()))?;
        let timeout = monitor.timeout();

        let request = http_request(monitor, http, keyword, timeout);
        let certificate = async {
            match (&self.certificates, url.scheme(), url.host_str()) {
                (Some(inspector), "https", Some(host)) => {
                    let port = url.port_or_known_default().unwrap_or(443);
                    match inspector.inspect(host, port, timeout).await {
                        Ok(report) => Some(report),
                        Err(e) => {
                            debug!(monitor_id = monitor.id, error = %e, "Certificate lookup failed.");
                            None
                        }
                    }
                }
                _ => None,
            }
        };
        let (mut result, certificate) = tokio::join!(request, certificate);

        if let Some(certificate) = certificate {
            let report = match &mut result {
                Ok(report) => report,
                Err(e) => &mut e.report,
            };
            report.metadata.extend(certificate.metadata(Utc::now()));
            report.tls = Some(certificate.info);
        }
        result
    }

    async fn run_tcp(&self, monitor: &Monitor) -> ProbeResult {
        let (host, port) = split_host_port(&monitor.target)
            .map_err(|e| ProbeError::new(ProbeErrorKind::InvalidTarget, e.to_string()))?;
        let start = Instant::now();
        let result = tokio::time::timeout(monitor.timeout(), tokio::net::TcpStream::connect((host.as_str(), port))).await;
        let elapsed = start.elapsed();

        let mut metadata = Map::new();
        metadata.insert("host".into(), host.clone().into());
        metadata.insert("port".into(), port.into());
        let report = ProbeReport {
            latency: Some(elapsed),
            metadata,
            ..Default::default()
        };

        match result {
            Ok(Ok(_stream)) => Ok(report),
            Ok(Err(e)) => {
                let kind = if is_lookup_error(&e.to_string()) {
                    ProbeErrorKind::DnsFailure
                } else {
                    ProbeErrorKind::TcpConnectionFailed
                };
                Err(ProbeError::new(kind, format!("TCP connection to {host}:{port} failed: {e}")).with_report(report))
            }
            Err(_) => Err(ProbeError::new(
                ProbeErrorKind::TcpConnectionFailed,
                format!("TCP connection to {host}:{port} failed: connection timed out"),
            )
            .with_report(report)),
        }
    }

    /// Resolution and the echo share the monitor's timeout.
    async fn run_ping(&self, monitor: &Monitor, config: &PingConfig) -> ProbeResult {
        let timeout = monitor.timeout();
        within(timeout, ProbeErrorKind::PingFailed, "ping", self.ping_once(monitor, config, timeout)).await
    }

    async fn ping_once(&self, monitor: &Monitor, config: &PingConfig, timeout: Duration) -> ProbeResult {
        let ip = resolve_host(monitor.target.trim(), timeout).await?;
        let mut metadata = Map::new();
        metadata.insert("ip".into(), ip.to_string().into());

        let client_config = if ip.is_ipv6() {
            surge_ping::Config::builder().kind(surge_ping::ICMP::V6).build()
        } else {
            surge_ping::Config::default()
        };
        let client = surge_ping::Client::new(&client_config)
            .map_err(|e| ProbeError::new(ProbeErrorKind::PingFailed, format!("ping failed: {e}")))?;
        let mut pinger = client.pinger(ip, surge_ping::PingIdentifier(rand::random())).await;
        pinger.timeout(timeout);

        let payload = vec![0u8; config.payload_size];
        match pinger.ping(surge_ping::PingSequence(0), &payload).await {
            Ok((_reply, rtt)) => {
                metadata.insert("rtt_ms".into(), (rtt.as_secs_f64() * 1000.0).into());
                Ok(ProbeReport {
                    latency: Some(rtt),
                    metadata,
                    ..Default::default()
                })
            }
            Err(e) => Err(ProbeError::new(ProbeErrorKind::PingFailed, format!("ping failed: {e}")).with_report(
                ProbeReport {
                    metadata,
                    ..Default::default()
                },
            )),
        }
    }
}

#[async_trait]
impl ProbeExecutor for NetworkProbeExecutor {
    async fn probe(&self, monitor: &Monitor) -> ProbeResult {
        match &monitor.config {
            MonitorConfig::Http(http) | MonitorConfig::Https(http) => self.run_http(monitor, http, None).await,
            MonitorConfig::Keyword(keyword) => self.run_http(monitor, &keyword.http, Some(keyword)).await,
            MonitorConfig::Tcp(_) => self.run_tcp(monitor).await,
            MonitorConfig::Ping(config) => self.run_ping(monitor, config).await,
            MonitorConfig::Push(_) => Err(ProbeError::new(
                ProbeErrorKind::Other,
                "push monitors report through heartbeats and are not probed",
            )),
        }
    }
}

/// Builds a client honouring the monitor's connect and overall timeouts.
pub(crate) fn build_client(http: &HttpConfig, timeout: Duration) -> Result<Client, ProbeError> {
    let connect_timeout = http
        .connect_timeout_seconds
        .map(Duration::from_secs)
        .unwrap_or(timeout)
        .min(timeout);
    let policy = if http.follow_redirects {
        redirect::Policy::limited(MAX_REDIRECTS)
    } else {
        redirect::Policy::none()
    };
    Client::builder()
        .timeout(timeout)
        .connect_timeout(connect_timeout)
        .danger_accept_invalid_certs(!http.verify_ssl)
        .redirect(policy)
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| ProbeError::new(ProbeErrorKind::Other, format!("failed to build HTTP client: {e}")))
}

async fn http_request(
    monitor: &Monitor,
    http: &HttpConfig,
    keyword: Option<&KeywordConfig>,
    timeout: Duration,
) -> ProbeResult {
    let client = build_client(http, timeout)?;
    let method = Method::from_bytes(http.method.to_uppercase().as_bytes())
        .map_err(|e| ProbeError::new(ProbeErrorKind::InvalidTarget, format!("invalid HTTP method: {e}")))?;

    let mut request = client.request(method, &monitor.target);
    for (name, value) in &http.headers {
        request = request.header(name.as_str(), value.as_str());
    }
    if let Some(auth) = &http.basic_auth {
        request = request.basic_auth(&auth.username, Some(&auth.password));
    }
    if let Some(body) = &http.body {
        request = request.body(body.clone());
    }

    let start = Instant::now();
    let response = request.send().await.map_err(|e| classify_reqwest_error(&e))?;
    let status = response.status();
    let mut report = ProbeReport {
        latency: Some(start.elapsed()),
        status_code: Some(status.as_u16()),
        metadata: Map::new(),
        tls: None,
    };
    report.metadata.insert("status_code".into(), status.as_u16().into());
    report.metadata.insert("final_url".into(), response.url().to_string().into());

    let needs_body = http.expected_content.is_some() || keyword.is_some();
    let body = if needs_body {
        Some(response.text().await.map_err(|e| classify_reqwest_error(&e).with_report(report.clone()))?)
    } else {
        None
    };

    let code = status.as_u16();
    match http.expected_status_code {
        Some(expected) if expected != code => {
            let kind = if code >= 500 {
                ProbeErrorKind::HttpServerError
            } else {
                ProbeErrorKind::UnexpectedStatus
            };
            return Err(ProbeError::new(kind, format!("HTTP {code}, expected {expected}")).with_report(report));
        }
        None if code >= 500 => {
            return Err(ProbeError::new(ProbeErrorKind::HttpServerError, format!("HTTP {status}")).with_report(report));
        }
        None if code >= 400 => {
            return Err(ProbeError::new(ProbeErrorKind::HttpClientError, format!("HTTP {status}")).with_report(report));
        }
        _ => {}
    }

    let body = body.unwrap_or_default();
    if let Some(expected) = &http.expected_content {
        let found = body.contains(expected.as_str());
        report.metadata.insert("content_found".into(), found.into());
        if !found {
            return Err(ProbeError::new(
                ProbeErrorKind::ContentMismatch,
                format!("expected content {expected:?} not found in response"),
            )
            .with_report(report));
        }
    }

    if let Some(keyword) = keyword {
        let found = contains_keyword(&body, &keyword.keyword, keyword.case_sensitive);
        report.metadata.insert("keyword_found".into(), found.into());
        if !found {
            return Err(ProbeError::new(
                ProbeErrorKind::KeywordNotFound,
                format!("keyword {:?} not found in response", keyword.keyword),
            )
            .with_report(report));
        }
    }

    Ok(report)
}

pub fn contains_keyword(body: &str, keyword: &str, case_sensitive: bool) -> bool {
    if case_sensitive {
        body.contains(keyword)
    } else {
        body.to_lowercase().contains(&keyword.to_lowercase())
    }
}

/// Resolves a host name (or literal IP) to its first address within `timeout`.
pub async fn resolve_host(host: &str, timeout: Duration) -> Result<IpAddr, ProbeError> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    let lookup = tokio::time::timeout(timeout, tokio::net::lookup_host((host, 0)))
        .await
        .map_err(|_| ProbeError::new(ProbeErrorKind::DnsFailure, format!("could not resolve host {host}: timed out")))?;
    lookup
        .map_err(|e| ProbeError::new(ProbeErrorKind::DnsFailure, format!("could not resolve host {host}: {e}")))?
        .next()
        .map(|addr| addr.ip())
        .ok_or_else(|| ProbeError::new(ProbeErrorKind::DnsFailure, format!("could not resolve host {host}: no addresses")))
}

/// Fails with `kind` once `timeout` elapses, whatever stage `check` is in.
async fn within<F>(timeout: Duration, kind: ProbeErrorKind, what: &str, check: F) -> ProbeResult
where
    F: Future<Output = ProbeResult>,
{
    tokio::time::timeout(timeout, check).await.unwrap_or_else(|_| {
        Err(ProbeError::new(
            kind,
            format!("{what} failed: timed out after {}s", timeout.as_secs_f64()),
        ))
    })
}

/// Full text of an error and its sources.
pub(crate) fn error_chain(error: &(dyn StdError + 'static)) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(inner) = source {
        let text = inner.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = inner.source();
    }
    message
}

fn is_lookup_error(text: &str) -> bool {
    let text = text.to_lowercase();
    text.contains("dns error") || text.contains("failed to lookup address") || text.contains("name or service not known")
        || text.contains("nodename nor servname")
}

pub(crate) fn classify_reqwest_error(error: &reqwest::Error) -> ProbeError {
    let chain = error_chain(error);
    let lower = chain.to_lowercase();
    let kind = if error.is_timeout() {
        if error.is_connect() {
            ProbeErrorKind::ConnectTimeout
        } else {
            ProbeErrorKind::RequestTimeout
        }
    } else if is_lookup_error(&lower) {
        ProbeErrorKind::DnsFailure
    } else if lower.contains("certificate") || lower.contains("handshake") || lower.contains("tls") {
        ProbeErrorKind::Tls
    } else if lower.contains("connection refused") {
        ProbeErrorKind::ConnectionRefused
    } else if lower.contains("unreachable") || lower.contains("no route to host") {
        ProbeErrorKind::HostUnreachable
    } else if error.is_connect() {
        ProbeErrorKind::ConnectionFailed
    } else {
        ProbeErrorKind::Other
    };
    let message = match kind {
        ProbeErrorKind::ConnectTimeout => format!("connection timed out: {chain}"),
        ProbeErrorKind::RequestTimeout => format!("request timed out: {chain}"),
        ProbeErrorKind::DnsFailure => format!("could not resolve host: {chain}"),
        ProbeErrorKind::ConnectionFailed => format!("connection failed: {chain}"),
        _ => chain,
    };
    ProbeError::new(kind, message)
}
