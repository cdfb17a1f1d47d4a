use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use super::{NotificationSender, SenderError, ensure_success};
use crate::notifications::models::{AlertMessage, ChannelConfig};

/// Sends alerts to a Discord incoming webhook as a single embed.
pub struct DiscordSender {
    client: Client,
}

impl Default for DiscordSender {
    fn default() -> Self {
        Self::new()
    }
}

impl DiscordSender {
    pub fn new() -> Self {
        Self::with_client(Client::new())
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn build_payload(message: &AlertMessage, username: Option<&str>) -> serde_json::Value {
        let mut fields = vec![json!({
            "name": "Severity",
            "value": message.severity.as_str(),
            "inline": true
        })];
        if let Some(count) = message.consecutive_failures {
            fields.push(json!({ "name": "Consecutive failures", "value": count.to_string(), "inline": true }));
        }
        if let Some(priority) = &message.priority {
            fields.push(json!({ "name": "Priority", "value": priority, "inline": true }));
        }

        let mut payload = json!({
            "embeds": [{
                "title": message.title,
                "description": message.body,
                "color": message.color,
                "timestamp": message.timestamp.to_rfc3339(),
                "fields": fields
            }]
        });
        if let Some(username) = username {
            payload["username"] = json!(username);
        }
        payload
    }
}

#[async_trait]
impl NotificationSender for DiscordSender {
    async fn send(&self, config: &ChannelConfig, message: &AlertMessage) -> Result<(), SenderError> {
        let (webhook_url, username) = match config {
            ChannelConfig::Discord { webhook_url, username } => (webhook_url, username.as_deref()),
            _ => {
                return Err(SenderError::InvalidConfiguration(
                    "Expected Discord config, but found a different type.".to_string(),
                ));
            }
        };

        let payload = Self::build_payload(message, username);
        let response = self.client.post(webhook_url).json(&payload).send().await?;
        ensure_success(response, "Discord webhook").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::senders::test_support::critical_message;
    use wiremock::{Mock, MockServer, ResponseTemplate, matchers};

    #[test]
    fn test_embed_carries_color_and_priority() {
        let message = critical_message();
        let payload = DiscordSender::build_payload(&message, Some("pulse"));
        let embed = &payload["embeds"][0];
        assert_eq!(embed["color"], message.color);
        assert_eq!(payload["username"], "pulse");
        let fields = embed["fields"].as_array().unwrap();
        assert!(fields.iter().any(|f| f["name"] == "Priority" && f["value"] == "critical"));
        assert!(fields.iter().any(|f| f["name"] == "Consecutive failures" && f["value"] == "20"));
    }

    #[tokio::test]
    async fn test_send_posts_embed() {
        let mock_server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/api/webhooks/1/abc"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&mock_server)
            .await;

        let config = ChannelConfig::Discord {
            webhook_url: format!("{}/api/webhooks/1/abc", mock_server.uri()),
            username: None,
        };
        DiscordSender::new().send(&config, &critical_message()).await.unwrap();
    }
}
