use std::time::Duration;

use async_trait::async_trait;
use herald_core::{DeliverySink, SinkError};
use teloxide::{prelude::*, types::Recipient, RequestError};
use tracing::{debug, warn};

use crate::send::{split_chunks, CHUNK_MAX};

/// Pause between consecutive chunks of one text.
const CHUNK_SPACING: Duration = Duration::from_millis(100);

/// Delivers texts through the Telegram Bot API.
///
/// The credential passed to [`DeliverySink::send`] is the bot token, so one
/// sink serves every user. Bots built per send share one HTTP client.
pub struct TelegramSink {
    platform: String,
    /// Token-less bot holding the shared HTTP client.
    proto: Bot,
}

impl TelegramSink {
    pub fn new() -> Self {
        Self::with_platform(herald_core::config::DEFAULT_PLATFORM)
    }

    /// Sink answering to a custom platform name in `platforms.platform_name`.
    pub fn with_platform(platform: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            proto: Bot::with_client("", teloxide::net::client_from_env()),
        }
    }

    fn bot(&self, token: &str) -> Bot {
        Bot::with_client(token, self.proto.client().clone())
    }
}

impl Default for TelegramSink {
    fn default() -> Self {
        Self::new()
    }
}

/// Numeric channel ids are chat ids; anything else is a public username.
pub fn recipient(channel_id: &str) -> Recipient {
    let trimmed = channel_id.trim();
    match trimmed.parse::<i64>() {
        Ok(id) => Recipient::Id(ChatId(id)),
        Err(_) if trimmed.starts_with('@') => Recipient::ChannelUsername(trimmed.to_string()),
        Err(_) => Recipient::ChannelUsername(format!("@{trimmed}")),
    }
}

/// Rate limits and transport failures are worth retrying; API refusals are not.
fn classify(err: RequestError) -> SinkError {
    match err {
        RequestError::RetryAfter(_) | RequestError::Network(_) | RequestError::Io(_) => {
            SinkError::Unavailable(err.to_string())
        }
        other => SinkError::Rejected(other.to_string()),
    }
}

#[async_trait]
impl DeliverySink for TelegramSink {
    fn platform(&self) -> &str {
        &self.platform
    }

    async fn send(&self, channel_id: &str, credential: &str, text: &str) -> Result<(), SinkError> {
        if credential.trim().is_empty() {
            return Err(SinkError::Rejected(format!("empty bot token for {channel_id}")));
        }
        let bot = self.bot(credential);
        let chat = recipient(channel_id);
        let chunks = split_chunks(text, CHUNK_MAX);

        for (i, chunk) in chunks.iter().enumerate() {
            if let Err(e) = bot.send_message(chat.clone(), chunk.as_str()).await {
                warn!(channel_id, chunk_index = i, error = %e, "telegram send failed");
                return Err(classify(e));
            }
            if i + 1 < chunks.len() {
                tokio::time::sleep(CHUNK_SPACING).await;
            }
        }
        debug!(channel_id, chunks = chunks.len(), "telegram message sent");
        Ok(())
    }
}
