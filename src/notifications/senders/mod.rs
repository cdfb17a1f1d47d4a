use async_trait::async_trait;
use reqwest::{Client, Response};
use std::time::Duration;
use thiserror::Error;

use super::models::{AlertMessage, ChannelConfig};

pub mod discord;
pub mod slack;
pub mod telegram;
pub mod webhook;

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum SenderError {
    #[error("Failed to send notification: {0}")]
    SendFailed(String),
    #[error("Invalid configuration for sender: {0}")]
    InvalidConfiguration(String),
    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),
    #[error("Templating error: {0}")]
    TemplatingError(String),
}

/// Delivers an alert to one kind of channel.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    /// Sends `message` using the decrypted channel configuration.
    async fn send(&self, config: &ChannelConfig, message: &AlertMessage) -> Result<(), SenderError>;
}

/// One sender per channel type, sharing an HTTP client.
pub struct ChannelSenders {
    telegram: telegram::TelegramSender,
    discord: discord::DiscordSender,
    slack: slack::SlackSender,
    webhook: webhook::WebhookSender,
}

impl Default for ChannelSenders {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelSenders {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            telegram: telegram::TelegramSender::with_client(client.clone()),
            discord: discord::DiscordSender::with_client(client.clone()),
            slack: slack::SlackSender::with_client(client.clone()),
            webhook: webhook::WebhookSender::with_client(client),
        }
    }

    pub fn for_config(&self, config: &ChannelConfig) -> &dyn NotificationSender {
        match config {
            ChannelConfig::Telegram { .. } => &self.telegram,
            ChannelConfig::Discord { .. } => &self.discord,
            ChannelConfig::Slack { .. } => &self.slack,
            ChannelConfig::Webhook { .. } => &self.webhook,
        }
    }
}

#[async_trait]
impl NotificationSender for ChannelSenders {
    async fn send(&self, config: &ChannelConfig, message: &AlertMessage) -> Result<(), SenderError> {
        self.for_config(config).send(config, message).await
    }
}

/// Turns a non-2xx response into [`SenderError::SendFailed`].
pub(crate) async fn ensure_success(response: Response, service: &str) -> Result<(), SenderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let error_body = response
        .text()
        .await
        .unwrap_or_else(|_| "Failed to read error body".to_string());
    Err(SenderError::SendFailed(format!(
        "{service} returned non-success status: {status}. Body: {error_body}"
    )))
}
