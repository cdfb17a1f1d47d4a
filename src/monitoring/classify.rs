use super::probe::{ProbeError, ProbeErrorKind};

/// How a failed check escalates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Server errors and connection-level failures. Opens an incident at once.
    Critical,
    /// Counted toward consecutive failures with no special escalation.
    Transient,
}

impl FailureClass {
    pub fn is_critical(&self) -> bool {
        matches!(self, FailureClass::Critical)
    }
}

const CRITICAL_PATTERNS: &[&str] = &[
    "connection refused",
    "connection timed out",
    "connection failed",
    "host unreachable",
    "network unreachable",
    "no route to host",
    "could not resolve host",
    "ping failed",
];

pub fn classify(error: &ProbeError) -> FailureClass {
    match error.kind {
        ProbeErrorKind::HttpServerError
        | ProbeErrorKind::ConnectionRefused
        | ProbeErrorKind::ConnectionFailed
        | ProbeErrorKind::ConnectTimeout
        | ProbeErrorKind::HostUnreachable
        | ProbeErrorKind::DnsFailure
        | ProbeErrorKind::TcpConnectionFailed
        | ProbeErrorKind::PingFailed => FailureClass::Critical,
        ProbeErrorKind::Other => classify_message(&error.message, error.report.status_code),
        _ => FailureClass::Transient,
    }
}

/// Classifies an untyped failure from its message and optional HTTP status.
pub fn classify_message(message: &str, status_code: Option<u16>) -> FailureClass {
    if status_code.map(|code| (500..600).contains(&code)).unwrap_or(false) {
        return FailureClass::Critical;
    }
    let lower = message.to_lowercase();
    if CRITICAL_PATTERNS.iter().any(|pattern| lower.contains(pattern)) {
        FailureClass::Critical
    } else {
        FailureClass::Transient
    }
}
