use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use super::{NotificationSender, SenderError, ensure_success};
use crate::notifications::models::{AlertMessage, ChannelConfig};

/// Sends alerts to a Slack incoming webhook as a coloured attachment.
pub struct SlackSender {
    client: Client,
}

impl Default for SlackSender {
    fn default() -> Self {
        Self::new()
    }
}

impl SlackSender {
    pub fn new() -> Self {
        Self::with_client(Client::new())
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn build_payload(message: &AlertMessage, channel: Option<&str>) -> serde_json::Value {
        let mut fields = Vec::new();
        if let Some(count) = message.consecutive_failures {
            fields.push(json!({ "title": "Consecutive failures", "value": count.to_string(), "short": true }));
        }
        if let Some(priority) = &message.priority {
            fields.push(json!({ "title": "Priority", "value": priority, "short": true }));
        }

        let mut payload = json!({
            "text": message.title,
            "attachments": [{
                "color": message.color_hex(),
                "title": message.title,
                "text": message.body,
                "fields": fields,
                "footer": format!("severity: {}", message.severity.as_str()),
                "ts": message.timestamp.timestamp()
            }]
        });
        if let Some(channel) = channel {
            payload["channel"] = json!(channel);
        }
        payload
    }
}

#[async_trait]
impl NotificationSender for SlackSender {
    async fn send(&self, config: &ChannelConfig, message: &AlertMessage) -> Result<(), SenderError> {
        let (webhook_url, channel) = match config {
            ChannelConfig::Slack { webhook_url, channel } => (webhook_url, channel.as_deref()),
            _ => {
                return Err(SenderError::InvalidConfiguration(
                    "Expected Slack config, but found a different type.".to_string(),
                ));
            }
        };

        let payload = Self::build_payload(message, channel);
        let response = self.client.post(webhook_url).json(&payload).send().await?;
        ensure_success(response, "Slack webhook").await
    }
}
