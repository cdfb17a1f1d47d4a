use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::db::enums::UnknownVariant;

/// Delivery settings for one notification channel.
/// Serialized to JSON and encrypted before it is stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ChannelConfig {
    Telegram {
        bot_token: String,
        chat_id: String,
    },
    Discord {
        webhook_url: String,
        #[serde(default)]
        username: Option<String>,
    },
    Slack {
        webhook_url: String,
        #[serde(default)]
        channel: Option<String>,
    },
    Webhook {
        url: String,
        method: String, // "GET" or "POST"
        #[serde(default)]
        headers: Option<HashMap<String, String>>,
        #[serde(default)]
        body_template: Option<String>,
    },
}

impl ChannelConfig {
    pub fn channel_type(&self) -> &'static str {
        match self {
            ChannelConfig::Telegram { .. } => "telegram",
            ChannelConfig::Discord { .. } => "discord",
            ChannelConfig::Slack { .. } => "slack",
            ChannelConfig::Webhook { .. } => "webhook",
        }
    }
}

/// The event a notification is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    Down,
    CriticalDown,
    Up,
    Test,
    ValidationFailed,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::Down => "down",
            AlertType::CriticalDown => "critical_down",
            AlertType::Up => "up",
            AlertType::Test => "test",
            AlertType::ValidationFailed => "validation_failed",
        }
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "down" => Ok(AlertType::Down),
            "critical_down" => Ok(AlertType::CriticalDown),
            "up" => Ok(AlertType::Up),
            "test" => Ok(AlertType::Test),
            "validation_failed" => Ok(AlertType::ValidationFailed),
            other => Err(UnknownVariant {
                kind: "alert type",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }
}

/// Channel-neutral rendering of one alert. Every sender derives its payload from this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertMessage {
    pub alert_type: AlertType,
    pub title: String,
    pub body: String,
    /// RGB colour, e.g. `0xE74C3C`.
    pub color: u32,
    pub severity: Severity,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consecutive_failures: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    pub monitor_id: Option<i32>,
    pub monitor_name: Option<String>,
    pub target: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl AlertMessage {
    pub fn color_hex(&self) -> String {
        format!("#{:06X}", self.color & 0xFF_FFFF)
    }

    /// Flat string map used as the tera context for webhook bodies.
    pub fn context(&self) -> HashMap<String, String> {
        let mut context = HashMap::new();
        context.insert("alert_type".to_string(), self.alert_type.to_string());
        context.insert("title".to_string(), self.title.clone());
        context.insert("body".to_string(), self.body.clone());
        context.insert("message".to_string(), self.body.clone());
        context.insert("color".to_string(), self.color_hex());
        context.insert("severity".to_string(), self.severity.as_str().to_string());
        context.insert("timestamp".to_string(), self.timestamp.to_rfc3339());
        if let Some(count) = self.consecutive_failures {
            context.insert("consecutive_failures".to_string(), count.to_string());
        }
        if let Some(priority) = &self.priority {
            context.insert("priority".to_string(), priority.clone());
        }
        if let Some(id) = self.monitor_id {
            context.insert("monitor_id".to_string(), id.to_string());
        }
        if let Some(name) = &self.monitor_name {
            context.insert("monitor_name".to_string(), name.clone());
        }
        if let Some(target) = &self.target {
            context.insert("target".to_string(), target.clone());
        }
        context
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_config_tags() {
        let config: ChannelConfig = serde_json::from_value(serde_json::json!({
            "type": "discord",
            "webhook_url": "https://discord.example/hook"
        }))
        .unwrap();
        assert_eq!(config.channel_type(), "discord");

        let webhook = ChannelConfig::Webhook {
            url: "https://example.com".to_string(),
            method: "POST".to_string(),
            headers: None,
            body_template: None,
        };
        let json = serde_json::to_value(&webhook).unwrap();
        assert_eq!(json["type"], "webhook");
    }

    #[test]
    fn test_alert_type_strings() {
        assert_eq!("critical_down".parse::<AlertType>().unwrap(), AlertType::CriticalDown);
        assert!("sideways".parse::<AlertType>().is_err());
        assert_eq!(AlertType::ValidationFailed.to_string(), "validation_failed");
    }
}
