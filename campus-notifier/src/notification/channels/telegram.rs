//! Telegram Bot API transport.
//!
//! Sends messages via `POST /bot<token>/sendMessage`. Failures are classified
//! from the HTTP status and the API `error_code`, never from the description
//! text: 400 and 403 are permanent (chat gone, bot blocked), 429 is transient
//! with the `parameters.retry_after` hint, everything else is transient.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use super::{Transport, TransportError};
use crate::utils::http_client::build_client;
use crate::{Error, Result};

/// Telegram `sendMessage` text limit (UTF-8 characters).
const TELEGRAM_MESSAGE_LIMIT: usize = 4096;

/// Telegram transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    /// Telegram Bot API token.
    pub bot_token: String,
    /// API root, overridable for self-hosted Bot API servers.
    pub api_base_url: String,
    /// Optional parse mode (HTML, MarkdownV2). Plain text when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parse_mode: Option<String>,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            api_base_url: "https://api.telegram.org".to_string(),
            parse_mode: None,
            request_timeout_secs: 30,
            connect_timeout_secs: 10,
        }
    }
}

/// Response envelope of every Bot API method.
#[derive(Debug, Default, Deserialize)]
struct TelegramResponse {
    #[serde(default)]
    ok: bool,
    error_code: Option<u16>,
    description: Option<String>,
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Default, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

/// Telegram transport.
pub struct TelegramTransport {
    config: TelegramConfig,
    client: Client,
}

impl TelegramTransport {
    pub fn new(config: TelegramConfig) -> Result<Self> {
        let client = build_client(
            Duration::from_secs(config.request_timeout_secs),
            Duration::from_secs(config.connect_timeout_secs),
        )
        .map_err(|e| Error::config(format!("Failed to build Telegram HTTP client: {e}")))?;
        Ok(Self { config, client })
    }

    fn send_message_url(&self) -> String {
        format!(
            "{}/bot{}/sendMessage",
            self.config.api_base_url.trim_end_matches('/'),
            self.config.bot_token
        )
    }
}

#[async_trait]
impl Transport for TelegramTransport {
    fn transport_type(&self) -> &'static str {
        "telegram"
    }

    async fn send(&self, recipient_id: i64, text: &str) -> std::result::Result<(), TransportError> {
        let mut payload = json!({
            "chat_id": recipient_id,
            "text": truncate_message(text, TELEGRAM_MESSAGE_LIMIT),
        });
        if let Some(parse_mode) = &self.config.parse_mode {
            payload["parse_mode"] = json!(parse_mode);
        }

        let response = self
            .client
            .post(self.send_message_url())
            .json(&payload)
            .send()
            .await
            .map_err(|e| TransportError::transient(format!("Telegram request failed: {e}")))?;

        let status = response.status();
        // A body that fails to parse still classifies by HTTP status.
        let body: TelegramResponse = response.json().await.unwrap_or_default();

        if status.is_success() && body.ok {
            debug!(recipient_id, "Telegram message sent");
            return Ok(());
        }

        let err = classify_failure(status.as_u16(), &body);
        warn!(
            recipient_id,
            status = status.as_u16(),
            class = %err.class,
            "Telegram sendMessage failed: {}",
            err.message
        );
        Err(err)
    }
}

/// Classify a failed `sendMessage` by API `error_code`, falling back to the
/// HTTP status.
fn classify_failure(http_status: u16, body: &TelegramResponse) -> TransportError {
    let code = body.error_code.unwrap_or(http_status);
    let message = format!(
        "{} - {}",
        code,
        body.description.as_deref().unwrap_or("no description")
    );

    match code {
        400 | 403 => TransportError::permanent(message),
        429 => {
            let err = TransportError::transient(message);
            match body.parameters.as_ref().and_then(|p| p.retry_after) {
                Some(secs) => err.with_retry_after(Duration::from_secs(secs)),
                None => err,
            }
        }
        _ => TransportError::transient(message),
    }
}

/// Truncate a message to fit within the Telegram character limit.
fn truncate_message(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let suffix = "\n\n[truncated]";
    let budget = limit - suffix.len();
    let truncated: String = text.chars().take(budget).collect();
    format!("{truncated}{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::channels::FailureClass;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn response(body: &str) -> TelegramResponse {
        serde_json::from_str(body).unwrap()
    }

    /// Serve one canned HTTP response and return the base URL plus a handle
    /// resolving to the raw request.
    async fn one_shot_server(
        status_line: &'static str,
        body: &'static str,
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let content_length = text[..header_end]
                        .lines()
                        .find_map(|l| {
                            let (name, value) = l.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())?
                        })
                        .unwrap_or(0);
                    if request.len() >= header_end + 4 + content_length {
                        break;
                    }
                }
            }
            let reply = format!(
                "{status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(reply.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&request).into_owned()
        });
        (format!("http://{addr}"), handle)
    }

    fn transport(base: String) -> TelegramTransport {
        TelegramTransport::new(TelegramConfig {
            bot_token: "123:ABC".to_string(),
            api_base_url: base,
            request_timeout_secs: 5,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_telegram_config_default() {
        let config = TelegramConfig::default();
        assert!(config.bot_token.is_empty());
        assert_eq!(config.api_base_url, "https://api.telegram.org");
        assert!(config.parse_mode.is_none());
    }

    #[test]
    fn test_classify_by_error_code() {
        let blocked = response(
            r#"{"ok":false,"error_code":403,"description":"Forbidden: bot was blocked by the user"}"#,
        );
        assert_eq!(classify_failure(403, &blocked).class, FailureClass::Permanent);

        let missing = response(r#"{"ok":false,"error_code":400,"description":"Bad Request: chat not found"}"#);
        assert_eq!(classify_failure(400, &missing).class, FailureClass::Permanent);

        let limited = response(
            r#"{"ok":false,"error_code":429,"description":"Too Many Requests","parameters":{"retry_after":7}}"#,
        );
        let err = classify_failure(429, &limited);
        assert_eq!(err.class, FailureClass::Transient);
        assert_eq!(err.retry_after, Some(Duration::from_secs(7)));

        // No JSON body: HTTP status decides
        let err = classify_failure(502, &TelegramResponse::default());
        assert_eq!(err.class, FailureClass::Transient);
        assert_eq!(
            classify_failure(403, &TelegramResponse::default()).class,
            FailureClass::Permanent
        );
    }

    #[test]
    fn test_classification_ignores_description_text() {
        let body = response(r#"{"ok":false,"error_code":500,"description":"bot was blocked by the user"}"#);
        assert_eq!(classify_failure(500, &body).class, FailureClass::Transient);
    }

    #[test]
    fn test_truncate_message() {
        let short = "hello";
        assert_eq!(truncate_message(short, 100), "hello");

        let long: String = "a".repeat(5000);
        let truncated = truncate_message(&long, TELEGRAM_MESSAGE_LIMIT);
        assert!(truncated.chars().count() <= TELEGRAM_MESSAGE_LIMIT);
        assert!(truncated.ends_with("[truncated]"));
    }

    #[tokio::test]
    async fn test_send_success_posts_plain_text() {
        let (base, server) =
            one_shot_server("HTTP/1.1 200 OK", r#"{"ok":true,"result":{"message_id":1}}"#).await;
        transport(base).send(555, "hello").await.unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /bot123:ABC/sendMessage"));
        assert!(request.contains(r#""chat_id":555"#));
        assert!(!request.contains("parse_mode"));
    }

    #[tokio::test]
    async fn test_send_blocked_is_permanent() {
        let (base, server) = one_shot_server(
            "HTTP/1.1 403 Forbidden",
            r#"{"ok":false,"error_code":403,"description":"Forbidden: bot was blocked by the user"}"#,
        )
        .await;
        let err = transport(base).send(555, "hello").await.unwrap_err();
        assert!(err.is_permanent());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_send_connection_refused_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = transport(format!("http://{addr}"))
            .send(555, "hello")
            .await
            .unwrap_err();
        assert_eq!(err.class, FailureClass::Transient);
    }
}
