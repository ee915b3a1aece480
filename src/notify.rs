use anyhow::{Context, Result};
use reqwest::StatusCode;
use serde::Serialize;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::redact;
use crate::watch::Notification;

pub const MAX_RETRIES: u32 = 3;
pub const INITIAL_BACKOFF_MS: u64 = 1000;

/// Maximum backoff duration (60 seconds)
pub const MAX_BACKOFF_MS: u64 = 60_000;

/// Discord limit for message `content`
pub const MAX_CONTENT_LENGTH: usize = 2000;

/// Discord limit for an embed description
pub const MAX_DESCRIPTION_LENGTH: usize = 4096;

/// Outbound message sink.
///
/// Sinks that can show structured messages override `supports_rich` and
/// `notify_rich`; everyone else receives the flattened text.
#[allow(async_fn_in_trait)]
pub trait Notifier {
    async fn notify(&self, text: &str) -> Result<()>;

    fn supports_rich(&self) -> bool {
        false
    }

    async fn notify_rich(&self, message: &Notification) -> Result<()> {
        self.notify(&message.plain_text()).await
    }
}

/// Send `message` in the richest form the sink accepts.
pub async fn dispatch<N: Notifier>(notifier: &N, message: &Notification) -> Result<()> {
    if notifier.supports_rich() {
        notifier.notify_rich(message).await
    } else {
        notifier.notify(&message.plain_text()).await
    }
}

/// Writes notifications to the log instead of sending them (dry runs).
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    async fn notify(&self, text: &str) -> Result<()> {
        info!("Notification (dry run):\n{}", text);
        Ok(())
    }
}

#[derive(Debug, Serialize, PartialEq)]
pub struct Embed {
    pub title: String,
    pub description: String,
    pub color: u32,
    pub timestamp: String,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct MessagePayload {
    pub content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub embeds: Vec<Embed>,
}

impl MessagePayload {
    pub fn text(text: &str) -> Self {
        Self {
            content: truncate_message(text, MAX_CONTENT_LENGTH),
            embeds: Vec::new(),
        }
    }

    pub fn rich(message: &Notification) -> Self {
        Self {
            content: truncate_message(&message.content, MAX_CONTENT_LENGTH),
            embeds: vec![Embed {
                title: message.title.clone(),
                description: truncate_message(&message.body, MAX_DESCRIPTION_LENGTH),
                color: message.color,
                timestamp: message.timestamp.to_rfc3339(),
            }],
        }
    }
}

/// Truncate message to fit a length limit in bytes
/// Returns the original message if it fits, or a truncated version with "..." suffix,
/// preferring to cut at a line break so change lines stay whole
pub fn truncate_message(message: &str, limit: usize) -> String {
    if message.len() <= limit {
        return message.to_string();
    }
    if limit < 3 {
        return ".".repeat(limit);
    }

    // Leave room for "..." (3 chars)
    let mut truncate_at = limit - 3;
    while truncate_at > 0 && !message.is_char_boundary(truncate_at) {
        truncate_at -= 1;
    }

    let truncated = &message[..truncate_at];
    let truncated = truncated
        .rfind('\n')
        .filter(|&pos| pos > truncate_at / 2) // Don't cut too much
        .map(|pos| &truncated[..pos])
        .unwrap_or(truncated);

    format!("{}...", truncated)
}

/// Calculate backoff duration for a given attempt (0-indexed)
/// Attempt 0: no backoff, Attempt 1: base, Attempt 2: 2x base, etc.
/// Capped at MAX_BACKOFF_MS to prevent overflow and excessive waits.
#[inline]
pub fn calculate_backoff(attempt: u32, base_ms: u64) -> Duration {
    if attempt == 0 {
        Duration::ZERO
    } else {
        // Cap shift to prevent overflow (max safe shift for u64 is 63)
        let shift = (attempt - 1).min(30);
        let backoff_ms = base_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(backoff_ms.min(MAX_BACKOFF_MS))
    }
}

/// Delivery error types for retry decisions
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeliveryErrorKind {
    /// Transient error - safe to retry
    Transient,
    /// Permanent error - don't retry
    Permanent,
}

/// Rate limits and server errors pass; bad token, missing channel etc. do not.
pub fn classify_status(status: StatusCode) -> DeliveryErrorKind {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        DeliveryErrorKind::Transient
    } else {
        DeliveryErrorKind::Permanent
    }
}

#[derive(Debug)]
struct DeliveryError {
    kind: DeliveryErrorKind,
    error: anyhow::Error,
}

/// Posts to a Discord channel through the bot REST API.
pub struct DiscordNotifier {
    client: reqwest::Client,
    api_base: String,
    token: String,
    channel_id: String,
    backoff_base_ms: u64,
}

impl DiscordNotifier {
    /// `timeout` bounds each POST; a Discord endpoint that never answers
    /// counts as a transient failure.
    pub fn new(api_base: &str, token: &str, channel_id: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build Discord HTTP client")?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.to_string(),
            channel_id: channel_id.to_string(),
            backoff_base_ms: INITIAL_BACKOFF_MS,
        })
    }

    /// Override the retry base delay (tests use a few milliseconds)
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base_ms = base.as_millis() as u64;
        self
    }

    fn messages_url(&self) -> String {
        format!("{}/channels/{}/messages", self.api_base, self.channel_id)
    }

    async fn send(&self, payload: &MessagePayload) -> Result<()> {
        debug!(
            "Posting to Discord channel {} as bot {}",
            self.channel_id,
            redact::token(&self.token)
        );

        let mut last_error = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                let backoff = calculate_backoff(attempt, self.backoff_base_ms);
                warn!("Discord attempt {} failed, retrying in {:?}...", attempt, backoff);
                sleep(backoff).await;
            }

            match self.try_send(payload).await {
                Ok(()) => {
                    info!("Notification delivered");
                    return Ok(());
                }
                Err(e) if e.kind == DeliveryErrorKind::Permanent => {
                    error!("Permanent Discord error, not retrying: {:#}", e.error);
                    self.log_fallback(payload);
                    return Err(e.error);
                }
                Err(e) => last_error = Some(e.error),
            }
        }

        let err = last_error.unwrap_or_else(|| anyhow::anyhow!("no delivery attempt made"));
        error!("Failed to notify after {} attempts: {:#}", MAX_RETRIES, err);
        self.log_fallback(payload);
        Err(err)
    }

    async fn try_send(&self, payload: &MessagePayload) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(self.messages_url())
            .header(reqwest::header::AUTHORIZATION, format!("Bot {}", self.token))
            .json(payload)
            .send()
            .await
            .context("Failed to send Discord request")
            .map_err(|error| DeliveryError {
                kind: DeliveryErrorKind::Transient,
                error,
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(DeliveryError {
            kind: classify_status(status),
            error: anyhow::anyhow!(
                "Discord API error {}: {}",
                status,
                redact::body_preview(&body, 512)
            ),
        })
    }

    /// Keep the message visible when it cannot be delivered
    fn log_fallback(&self, payload: &MessagePayload) {
        error!("ALERT FALLBACK (Discord unavailable): {}", payload.content);
        for embed in &payload.embeds {
            error!("ALERT FALLBACK: {}\n{}", embed.title, embed.description);
        }
    }
}

impl Notifier for DiscordNotifier {
    async fn notify(&self, text: &str) -> Result<()> {
        self.send(&MessagePayload::text(text)).await
    }

    fn supports_rich(&self) -> bool {
        true
    }

    async fn notify_rich(&self, message: &Notification) -> Result<()> {
        self.send(&MessagePayload::rich(message)).await
    }
}
