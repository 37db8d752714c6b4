//! Discord REST writes: interaction callbacks, webhook edits, channel replies.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

const DEFAULT_BASE_URL: &str = "https://discord.com/api/v10";

/// Platform ceiling for a single message, in characters.
pub const MAX_MESSAGE_LEN: usize = 2000;

const EPHEMERAL_FLAG: u64 = 64;

// Interaction callback types.
const PONG: u8 = 1;
const CHANNEL_MESSAGE_WITH_SOURCE: u8 = 4;
const DEFERRED_CHANNEL_MESSAGE_WITH_SOURCE: u8 = 5;

pub fn pong() -> serde_json::Value {
    json!({ "type": PONG })
}

pub fn channel_message(content: &str) -> serde_json::Value {
    json!({
        "type": CHANNEL_MESSAGE_WITH_SOURCE,
        "data": { "content": clip(content, MAX_MESSAGE_LEN) },
    })
}

pub fn ephemeral_message(content: &str) -> serde_json::Value {
    json!({
        "type": CHANNEL_MESSAGE_WITH_SOURCE,
        "data": { "content": clip(content, MAX_MESSAGE_LEN), "flags": EPHEMERAL_FLAG },
    })
}

pub fn deferred() -> serde_json::Value {
    json!({ "type": DEFERRED_CHANNEL_MESSAGE_WITH_SOURCE })
}

/// Errors from writes to the messaging platform. Callers log these and
/// continue; a failed write never unwinds the request.
#[derive(Debug)]
pub enum DeliveryError {
    Http(String),
    Api { status: u16, body: String },
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http(e) => write!(f, "channel write failed: {e}"),
            Self::Api { status, body } => write!(f, "channel write returned {status}: {body}"),
        }
    }
}

impl std::error::Error for DeliveryError {}

/// Webhook reference for one interaction, resolved once per request.
#[derive(Debug, Clone)]
pub struct InteractionTarget {
    pub application_id: String,
    pub token: String,
}

/// The writes a delivery strategy needs. Truncation to the platform
/// ceiling happens here, display-only; the authoritative text upstream is
/// never cut.
#[async_trait]
pub trait ChannelWriter: Send + Sync {
    async fn edit_original(&self, target: &InteractionTarget, text: &str)
    -> Result<(), DeliveryError>;
    async fn follow_up(&self, target: &InteractionTarget, text: &str)
    -> Result<(), DeliveryError>;
    async fn channel_reply(
        &self,
        channel_id: &str,
        message_id: &str,
        text: &str,
    ) -> Result<(), DeliveryError>;
}

pub struct DiscordClient {
    http: reqwest::Client,
    base_url: String,
    /// Pre-computed `"Bot <token>"` header value.
    auth_header: String,
}

impl DiscordClient {
    pub fn new(bot_token: &str) -> Self {
        Self::with_base_url(DEFAULT_BASE_URL, bot_token)
    }

    pub fn with_base_url(base_url: impl Into<String>, bot_token: &str) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_header: format!("Bot {bot_token}"),
        }
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    async fn execute(&self, request: reqwest::RequestBuilder) -> Result<(), DeliveryError> {
        let response = request
            .header("Authorization", &self.auth_header)
            .send()
            .await
            .map_err(|e| DeliveryError::Http(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        let preview: String = body.chars().take(256).collect();
        Err(DeliveryError::Api { status: status.as_u16(), body: preview })
    }
}

#[async_trait]
impl ChannelWriter for DiscordClient {
    async fn edit_original(
        &self,
        target: &InteractionTarget,
        text: &str,
    ) -> Result<(), DeliveryError> {
        let url = self.api_url(&format!(
            "webhooks/{}/{}/messages/@original",
            target.application_id, target.token
        ));
        self.execute(
            self.http
                .patch(url)
                .json(&json!({ "content": clip(text, MAX_MESSAGE_LEN) })),
        )
        .await
    }

    async fn follow_up(&self, target: &InteractionTarget, text: &str) -> Result<(), DeliveryError> {
        let url = self.api_url(&format!("webhooks/{}/{}", target.application_id, target.token));
        self.execute(
            self.http
                .post(url)
                .json(&json!({ "content": clip(text, MAX_MESSAGE_LEN) })),
        )
        .await
    }

    async fn channel_reply(
        &self,
        channel_id: &str,
        message_id: &str,
        text: &str,
    ) -> Result<(), DeliveryError> {
        let url = self.api_url(&format!("channels/{channel_id}/messages"));
        self.execute(self.http.post(url).json(&json!({
            "content": clip(text, MAX_MESSAGE_LEN),
            "message_reference": { "message_id": message_id },
        })))
        .await
    }
}

/// Splits text into ordered segments of at most `max_chars` characters.
/// Concatenating the segments reproduces the input exactly.
pub fn split_chunks(text: &str, max_chars: usize) -> Vec<String> {
    if text.is_empty() || max_chars == 0 {
        return Vec::new();
    }
    text.chars()
        .collect::<Vec<char>>()
        .chunks(max_chars)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

fn clip(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
