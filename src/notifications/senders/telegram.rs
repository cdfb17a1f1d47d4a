use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use super::{NotificationSender, SenderError, ensure_success};
use crate::notifications::models::{AlertMessage, ChannelConfig};

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Sends alerts through the Telegram Bot API.
pub struct TelegramSender {
    client: Client,
    api_base: String,
}

impl Default for TelegramSender {
    fn default() -> Self {
        Self::new()
    }
}

impl TelegramSender {
    pub fn new() -> Self {
        Self::with_client(Client::new())
    }

    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            api_base: TELEGRAM_API_BASE.to_string(),
        }
    }

    /// Points the sender at a different Bot API host.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn format_text(message: &AlertMessage) -> String {
        let mut text = format!(
            "*{}*\n{}",
            escape_markdown_v2(&message.title),
            escape_markdown_v2(&message.body)
        );
        if let Some(priority) = &message.priority {
            text.push_str(&format!("\nPriority: {}", escape_markdown_v2(priority)));
        }
        text.push_str(&format!(
            "\n_{}_",
            escape_markdown_v2(&message.timestamp.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        ));
        text
    }
}

/// Escapes text for Telegram MarkdownV2.
/// Characters to escape: _ * [ ] ( ) ~ ` > # + - = | { } . ! \
pub fn escape_markdown_v2(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '_' | '*' | '[' | ']' | '(' | ')' | '~' | '`' | '>' | '#' | '+' | '-' | '=' | '|'
            | '{' | '}' | '.' | '!' | '\\' => {
                escaped.push('\\');
                escaped.push(c);
            }
            _ => escaped.push(c),
        }
    }
    escaped
}

#[derive(Serialize)]
struct TelegramMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'a str,
}

#[async_trait]
impl NotificationSender for TelegramSender {
    async fn send(&self, config: &ChannelConfig, message: &AlertMessage) -> Result<(), SenderError> {
        let (bot_token, chat_id) = match config {
            ChannelConfig::Telegram { bot_token, chat_id } => (bot_token, chat_id),
            _ => {
                return Err(SenderError::InvalidConfiguration(
                    "Expected Telegram config, but found a different type.".to_string(),
                ));
            }
        };

        let api_url = format!("{}/bot{bot_token}/sendMessage", self.api_base);
        let text = Self::format_text(message);
        let payload = TelegramMessage {
            chat_id,
            text: &text,
            parse_mode: "MarkdownV2",
        };

        let response = self.client.post(&api_url).json(&payload).send().await?;
        ensure_success(response, "Telegram API").await
    }
}
