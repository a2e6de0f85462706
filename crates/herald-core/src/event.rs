//! The message that crosses the channel between discovery and delivery.
//!
//! Wire form (JSON):
//!
//! ```json
//! {"message_id":7,"timestamp":"2026-10-18T09:00:00Z","content_id":"12","social_account_id":"3","user_id":"5"}
//! ```
//!
//! Identifiers other than `message_id` travel as decimal strings. A payload
//! whose identifiers do not parse is rejected as a whole.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{DestinationId, DueDestination, PlatformId, PostId, UserId};

/// Publication-ready notice for one destination. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicationEvent {
    #[serde(rename = "message_id")]
    destination_id: DestinationId,
    #[serde(rename = "timestamp")]
    scheduled_for: DateTime<Utc>,
    #[serde(with = "id_string")]
    content_id: PostId,
    #[serde(rename = "social_account_id", with = "id_string")]
    platform_id: PlatformId,
    #[serde(with = "id_string")]
    user_id: UserId,
}

impl PublicationEvent {
    pub fn new(
        destination_id: DestinationId,
        scheduled_for: DateTime<Utc>,
        content_id: PostId,
        platform_id: PlatformId,
        user_id: UserId,
    ) -> Self {
        Self {
            destination_id,
            scheduled_for,
            content_id,
            platform_id,
            user_id,
        }
    }

    pub fn from_due(due: &DueDestination) -> Self {
        Self::new(
            due.destination_id,
            due.scheduled_for,
            due.post_id,
            due.platform_id,
            due.user_id,
        )
    }

    pub fn destination_id(&self) -> DestinationId {
        self.destination_id
    }

    pub fn scheduled_for(&self) -> DateTime<Utc> {
        self.scheduled_for
    }

    pub fn content_id(&self) -> PostId {
        self.content_id
    }

    pub fn platform_id(&self) -> PlatformId {
        self.platform_id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Partition key on the channel: events for the same content stay ordered.
    pub fn key(&self) -> String {
        self.content_id.to_string()
    }
}

mod id_string {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(id: &i64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(id)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.trim()
            .parse()
            .map_err(|_| de::Error::custom(format!("expected a numeric id, got {raw:?}")))
    }
}
