use async_trait::async_trait;

use crate::error::SinkError;

/// Outbound notification API of one external platform.
///
/// One call delivers one text to one channel using one credential. Only
/// success or failure is observed; response payloads are ignored.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    /// Platform name as stored in `platforms.platform_name` (e.g. `"Telegram"`).
    fn platform(&self) -> &str;

    async fn send(&self, channel_id: &str, credential: &str, text: &str)
        -> Result<(), SinkError>;
}
