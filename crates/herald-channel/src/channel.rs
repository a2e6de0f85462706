use async_trait::async_trait;
use chrono::{DateTime, Utc};
use herald_core::PublicationEvent;

use crate::error::ChannelError;

/// One record read back from the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

/// Where an acknowledged event landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivered {
    pub partition: i32,
    pub offset: i64,
}

/// Write side of the event channel.
///
/// Shared between tasks, hence `&self`.
#[async_trait]
pub trait EventProducer: Send + Sync {
    /// Append `event`, keyed by its content id.
    ///
    /// Returns only once the backend acknowledged the write; an `Err` means
    /// the event must be treated as not sent.
    async fn publish(&self, event: &PublicationEvent) -> Result<Delivered, ChannelError>;
}

/// Read side of the event channel, bound to one consumer group.
///
/// A fresh consumer resumes at the group's committed position, or at the
/// earliest retained offset when the group has never committed.
#[async_trait]
pub trait EventConsumer: Send {
    /// Wait for the next message.
    async fn recv(&mut self) -> Result<ChannelMessage, ChannelError>;

    /// Record `msg` as consumed for the group.
    async fn commit(&mut self, msg: &ChannelMessage) -> Result<(), ChannelError>;
}
