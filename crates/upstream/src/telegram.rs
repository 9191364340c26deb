use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use url::Url;

/// Minimal Telegram Bot API client used to deliver notifications.
#[derive(Clone)]
pub struct TelegramClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl TelegramClient {
    /// Creates a new client with the provided bot token and API base.
    pub fn new(token: impl Into<String>, base_url: Url, http: Client) -> Self {
        Self {
            http,
            base_url,
            token: token.into(),
        }
    }

    /// Sends a plain text message to the given chat.
    pub async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), TelegramError> {
        // Tokens contain ':' so the leading "./" keeps them from parsing as a scheme.
        let url = self
            .base_url
            .join(&format!("./bot{}/sendMessage", self.token))?;
        let body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
        });

        let response = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|err| TelegramError::Http(err.without_url()))?;

        let status = response.status();
        let raw = response
            .text()
            .await
            .map_err(|err| TelegramError::Http(err.without_url()))?;

        match serde_json::from_str::<ApiEnvelope>(&raw) {
            Ok(envelope) if envelope.ok && status.is_success() => Ok(()),
            Ok(envelope) => Err(TelegramError::Rejected {
                code: envelope.error_code.unwrap_or(i64::from(status.as_u16())),
                description: envelope
                    .description
                    .unwrap_or_else(|| String::from("<no description>")),
            }),
            Err(_) => Err(TelegramError::Status { status, body: raw }),
        }
    }
}

/// Response envelope shared by every Bot API method.
#[derive(Debug, Deserialize)]
struct ApiEnvelope {
    ok: bool,
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(default)]
    description: Option<String>,
}

/// Errors produced by the Telegram client. Messages never contain the bot token.
#[derive(Debug, Error)]
pub enum TelegramError {
    #[error("failed to build url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("telegram rejected the request ({code}): {description}")]
    Rejected { code: i64, description: String },
}
