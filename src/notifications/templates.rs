use chrono::{DateTime, Duration, Utc};

use super::models::{AlertMessage, AlertType, Severity};
use crate::db::models::{Incident, Monitor};

const COLOR_DOWN: u32 = 0xE74C3C;
const COLOR_CRITICAL: u32 = 0x992D22;
const COLOR_UP: u32 = 0x2ECC71;
const COLOR_TEST: u32 = 0x3498DB;
const COLOR_VALIDATION: u32 = 0xF39C12;

/// Builds the shared message for an alert type.
///
/// `custom_message` replaces the generated body. `metadata` may carry an
/// `error` string and, for escalations, `consecutive_failures`.
pub fn render(
    alert_type: AlertType,
    monitor: Option<&Monitor>,
    incident: Option<&Incident>,
    custom_message: Option<&str>,
    metadata: Option<&serde_json::Value>,
    now: DateTime<Utc>,
) -> AlertMessage {
    let name = monitor.map(|m| m.name.as_str()).unwrap_or("monitor");
    let target = monitor.map(|m| m.target.as_str()).unwrap_or("-");
    let error = metadata
        .and_then(|m| m.get("error"))
        .and_then(|e| e.as_str())
        .map(str::to_string);
    let failures = metadata
        .and_then(|m| m.get("consecutive_failures"))
        .and_then(|v| v.as_i64())
        .map(|v| v as i32)
        .or_else(|| monitor.map(|m| m.consecutive_failures));

    let (title, body, color, severity) = match alert_type {
        AlertType::Down => {
            let mut body = format!("{name} ({target}) is not responding.");
            if let Some(err) = &error {
                body.push_str(&format!("\nError: {err}"));
            }
            if let Some(count) = failures {
                body.push_str(&format!("\nConsecutive failures: {count}"));
            }
            (format!("🔴 {name} is DOWN"), body, COLOR_DOWN, Severity::Error)
        }
        AlertType::CriticalDown => {
            let count = failures.unwrap_or_default();
            let mut body = format!("{name} ({target}) has failed {count} consecutive checks.");
            if let Some(err) = &error {
                body.push_str(&format!("\nLast error: {err}"));
            }
            if let Some(incident) = incident {
                body.push_str(&format!(
                    "\nDown for {}",
                    format_duration(incident.duration(now))
                ));
            }
            (
                format!("🚨 CRITICAL: {name} is still DOWN"),
                body,
                COLOR_CRITICAL,
                Severity::Critical,
            )
        }
        AlertType::Up => {
            let body = match incident {
                Some(incident) => format!(
                    "{name} ({target}) is back up after {}.",
                    format_duration(incident.duration(now))
                ),
                None => format!("{name} ({target}) is back up."),
            };
            (format!("✅ {name} is UP"), body, COLOR_UP, Severity::Info)
        }
        AlertType::Test => (
            "🔔 Test notification".to_string(),
            "This is a test message from pulsekeeper.".to_string(),
            COLOR_TEST,
            Severity::Info,
        ),
        AlertType::ValidationFailed => {
            let reason = error.clone().unwrap_or_else(|| "target could not be validated".to_string());
            (
                format!("⚠️ {name} failed validation"),
                format!("{name} ({target}) was not accepted for monitoring: {reason}"),
                COLOR_VALIDATION,
                Severity::Warning,
            )
        }
    };

    let is_critical = alert_type == AlertType::CriticalDown;
    AlertMessage {
        alert_type,
        title,
        body: custom_message.map(str::to_string).unwrap_or(body),
        color,
        severity,
        timestamp: now,
        consecutive_failures: if is_critical { failures } else { None },
        priority: is_critical.then(|| "critical".to_string()),
        monitor_id: monitor.map(|m| m.id),
        monitor_name: monitor.map(|m| m.name.clone()),
        target: monitor.map(|m| m.target.clone()),
        metadata: metadata.cloned().unwrap_or(serde_json::Value::Null),
    }
}

/// Renders a duration as `1d 2h 3m 4s`, omitting leading zero units.
pub fn format_duration(duration: Duration) -> String {
    let total = duration.num_seconds().max(0);
    let (days, hours, minutes, seconds) = (
        total / 86_400,
        (total % 86_400) / 3_600,
        (total % 3_600) / 60,
        total % 60,
    );
    let mut parts = Vec::new();
    if days > 0 {
        parts.push(format!("{days}d"));
    }
    if hours > 0 || !parts.is_empty() {
        parts.push(format!("{hours}h"));
    }
    if minutes > 0 || !parts.is_empty() {
        parts.push(format!("{minutes}m"));
    }
    parts.push(format!("{seconds}s"));
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::seconds(42)), "42s");
        assert_eq!(format_duration(Duration::seconds(3_725)), "1h 2m 5s");
        assert_eq!(format_duration(Duration::seconds(90_061)), "1d 1h 1m 1s");
        assert_eq!(format_duration(Duration::seconds(-5)), "0s");
    }

    #[test]
    fn test_critical_message_carries_priority_and_count() {
        let metadata = serde_json::json!({ "consecutive_failures": 20, "error": "connection refused" });
        let message = render(AlertType::CriticalDown, None, None, None, Some(&metadata), Utc::now());
        assert_eq!(message.priority.as_deref(), Some("critical"));
        assert_eq!(message.consecutive_failures, Some(20));
        assert_eq!(message.severity, Severity::Critical);
        assert!(message.body.contains("connection refused"));
    }

    #[test]
    fn test_custom_message_replaces_body() {
        let message = render(AlertType::Test, None, None, Some("hello"), None, Utc::now());
        assert_eq!(message.body, "hello");
        assert!(message.priority.is_none());
        assert!(message.consecutive_failures.is_none());
        assert_eq!(message.color_hex(), "#3498DB");
    }
}
