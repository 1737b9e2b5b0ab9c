use crate::config::TelegramConfig;
use crate::error::app_error::AppError;
use crate::models::participant::ChatId;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("outbound channel is disabled")]
    Disabled,
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("rejected by channel ({status}): {description}")]
    Rejected { status: u16, description: String },
}

/// Outbound channel capability handed to the notifier and the scanner.
#[async_trait::async_trait]
pub trait Messenger: Send + Sync {
    /// `text` is already formatted for HTML parse mode.
    async fn send_message(&self, chat_id: ChatId, text: &str) -> Result<(), DeliveryError>;
}

#[derive(Serialize)]
struct SendMessageBody<'a> {
    chat_id: ChatId,
    text: &'a str,
    parse_mode: &'static str,
    disable_web_page_preview: bool,
}

#[derive(Deserialize)]
struct BotApiResponse {
    ok: bool,
    description: Option<String>,
}

/// Delivers messages through the Telegram Bot API `sendMessage` method.
pub struct TelegramMessenger {
    enabled: bool,
    endpoint: String,
    client: reqwest::Client,
}

impl TelegramMessenger {
    pub fn new(config: &TelegramConfig) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds.max(1)))
            .build()
            .map_err(|e| AppError::http_client("Failed to create Telegram HTTP client", e))?;

        let enabled = config.enabled && !config.bot_token.trim().is_empty();
        if config.enabled && !enabled {
            tracing::warn!("Telegram delivery is enabled but no bot token is configured; messages will not be sent");
        }

        Ok(Self {
            enabled,
            endpoint: format!("{}/bot{}/sendMessage", config.api_base_url.trim_end_matches('/'), config.bot_token.trim()),
            client,
        })
    }
}

#[async_trait::async_trait]
impl Messenger for TelegramMessenger {
    async fn send_message(&self, chat_id: ChatId, text: &str) -> Result<(), DeliveryError> {
        if !self.enabled {
            return Err(DeliveryError::Disabled);
        }

        let response = self
            .client
            .post(&self.endpoint)
            .json(&SendMessageBody {
                chat_id,
                text,
                parse_mode: "HTML",
                disable_web_page_preview: true,
            })
            .send()
            .await?;

        let status = response.status();
        let body: Option<BotApiResponse> = response.json().await.ok();

        match body {
            Some(BotApiResponse { ok: true, .. }) if status.is_success() => {
                debug!(chat_id, "message delivered");
                Ok(())
            }
            other => Err(DeliveryError::Rejected {
                status: status.as_u16(),
                description: other.and_then(|b| b.description).unwrap_or_else(|| "no description".to_string()),
            }),
        }
    }
}
