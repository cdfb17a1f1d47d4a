use async_trait::async_trait;
use reqwest::{Client, Method, header};
use tera::{Context, Tera};

use super::{NotificationSender, SenderError, ensure_success};
use crate::notifications::models::{AlertMessage, ChannelConfig};

/// Body used when a webhook channel has no `body_template` of its own.
pub const DEFAULT_BODY_TEMPLATE: &str = r#"{"alert_type": {{ alert_type | json_encode() }}, "title": {{ title | json_encode() }}, "message": {{ body | json_encode() }}, "color": {{ color | json_encode() }}, "severity": {{ severity | json_encode() }}, "timestamp": {{ timestamp | json_encode() }}{% if consecutive_failures %}, "consecutive_failures": {{ consecutive_failures }}{% endif %}{% if priority %}, "priority": {{ priority | json_encode() }}{% endif %}{% if monitor_id %}, "monitor_id": {{ monitor_id }}{% endif %}}"#;

/// Sends alerts to a user-defined HTTP endpoint.
pub struct WebhookSender {
    client: Client,
}

impl Default for WebhookSender {
    fn default() -> Self {
        Self::new()
    }
}

impl WebhookSender {
    pub fn new() -> Self {
        Self::with_client(Client::new())
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// Renders a body template against the alert's context.
    pub fn render_body(template: &str, message: &AlertMessage) -> Result<String, SenderError> {
        let mut tera_context = Context::new();
        for (key, value) in message.context() {
            tera_context.insert(key, &value);
        }
        Tera::one_off(template, &tera_context, false).map_err(|e| SenderError::TemplatingError(e.to_string()))
    }
}

#[async_trait]
impl NotificationSender for WebhookSender {
    async fn send(&self, config: &ChannelConfig, message: &AlertMessage) -> Result<(), SenderError> {
        let (url, method, headers, body_template) = match config {
            ChannelConfig::Webhook {
                url,
                method,
                headers,
                body_template,
            } => (url, method, headers, body_template),
            _ => {
                return Err(SenderError::InvalidConfiguration(
                    "Expected Webhook config, but found a different type.".to_string(),
                ));
            }
        };

        let http_method = match method.to_uppercase().as_str() {
            "POST" => Method::POST,
            "GET" => Method::GET,
            _ => {
                return Err(SenderError::InvalidConfiguration(format!(
                    "Unsupported HTTP method: {method}"
                )));
            }
        };

        let mut request_builder = self.client.request(http_method.clone(), url);

        if let Some(h) = headers {
            let mut header_map = header::HeaderMap::new();
            for (key, value) in h {
                let header_name = header::HeaderName::from_bytes(key.as_bytes())
                    .map_err(|e| SenderError::InvalidConfiguration(format!("Invalid header name: {e}")))?;
                let header_value = header::HeaderValue::from_str(value)
                    .map_err(|e| SenderError::InvalidConfiguration(format!("Invalid header value: {e}")))?;
                header_map.insert(header_name, header_value);
            }
            request_builder = request_builder.headers(header_map);
        }

        if http_method == Method::POST {
            let template = body_template.as_deref().unwrap_or(DEFAULT_BODY_TEMPLATE);
            let rendered_body = Self::render_body(template, message)?;
            request_builder = request_builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(rendered_body);
        } else {
            request_builder = request_builder.query(&[
                ("alert_type", message.alert_type.as_str()),
                ("title", message.title.as_str()),
            ]);
        }

        let response = request_builder.send().await?;
        ensure_success(response, "Webhook").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::senders::test_support::critical_message;
    use wiremock::{Mock, MockServer, ResponseTemplate, matchers};

    #[test]
    fn test_default_template_renders_valid_json() {
        let message = critical_message();
        let body = WebhookSender::render_body(DEFAULT_BODY_TEMPLATE, &message).unwrap();
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["alert_type"], "critical_down");
        assert_eq!(json["priority"], "critical");
        assert_eq!(json["consecutive_failures"], 20);
        assert_eq!(json["title"], message.title);
    }

    #[test]
    fn test_bad_template_is_a_templating_error() {
        let result = WebhookSender::render_body("{{ unclosed", &critical_message());
        assert!(matches!(result, Err(SenderError::TemplatingError(_))));
    }

    #[tokio::test]
    async fn test_send_post_with_custom_template_and_headers() {
        let mock_server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/hook"))
            .and(matchers::header("x-token", "abc"))
            .and(matchers::body_string("critical_down:critical"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock_server)
            .await;

        let config = ChannelConfig::Webhook {
            url: format!("{}/hook", mock_server.uri()),
            method: "POST".to_string(),
            headers: Some([("x-token".to_string(), "abc".to_string())].into_iter().collect()),
            body_template: Some("{{ alert_type }}:{{ priority }}".to_string()),
        };
        WebhookSender::new().send(&config, &critical_message()).await.unwrap();
    }

    #[tokio::test]
    async fn test_unsupported_method() {
        let config = ChannelConfig::Webhook {
            url: "http://127.0.0.1:9/hook".to_string(),
            method: "PATCH".to_string(),
            headers: None,
            body_template: None,
        };
        let err = WebhookSender::new().send(&config, &critical_message()).await.unwrap_err();
        assert!(matches!(err, SenderError::InvalidConfiguration(_)));
    }
}
