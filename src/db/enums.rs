use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Error returned when a stored string does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

string_enum!(
    /// Protocol a monitor is checked with.
    MonitorType, "monitor type", {
        Http => "http",
        Https => "https",
        Tcp => "tcp",
        Ping => "ping",
        Keyword => "keyword",
        Push => "push",
    }
);

string_enum!(
    /// Last known health of a monitor.
    MonitorStatus, "monitor status", {
        Unknown => "unknown",
        Validating => "validating",
        Invalid => "invalid",
        Up => "up",
        Down => "down",
    }
);

string_enum!(
    /// Outcome of a single probe.
    CheckStatus, "check status", {
        Up => "up",
        Down => "down",
    }
);

string_enum!(
    IncidentStatus, "incident status", {
        Open => "open",
        Pending => "pending",
        Resolved => "resolved",
    }
);

string_enum!(
    /// How far alerting for an incident has progressed.
    AlertStatus, "alert status", {
        None => "none",
        Notified => "notified",
        CriticalSent => "critical_sent",
        Acknowledged => "acknowledged",
        Escalated => "escalated",
    }
);

string_enum!(
    /// Kind of an alert-log entry.
    AlertLogKind, "alert log kind", {
        Opened => "opened",
        Notified => "notified",
        CriticalAlert => "critical_alert",
        Escalated => "escalated",
        AutoResolved => "auto_resolved",
        ValidationFailed => "validation_failed",
        Acknowledged => "acknowledged",
        MarkedPending => "marked_pending",
        ManuallyResolved => "manually_resolved",
        Reopened => "reopened",
        Note => "note",
    }
);

impl MonitorType {
    /// Push monitors report in through the heartbeat endpoint and are never probed.
    pub fn is_actively_probed(&self) -> bool {
        !matches!(self, MonitorType::Push)
    }
}

impl From<CheckStatus> for MonitorStatus {
    fn from(status: CheckStatus) -> Self {
        match status {
            CheckStatus::Up => MonitorStatus::Up,
            CheckStatus::Down => MonitorStatus::Down,
        }
    }
}
