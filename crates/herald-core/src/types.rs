use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type PostId = i64;
pub type PlatformId = i64;
pub type DestinationId = i64;
pub type UserId = i64;

/// Lifecycle of a post as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostStatus {
    Draft,
    Scheduled,
    Published,
    Failed,
}

impl std::fmt::Display for PostStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PostStatus::Draft => "draft",
            PostStatus::Scheduled => "scheduled",
            PostStatus::Published => "published",
            PostStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for PostStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(PostStatus::Draft),
            "scheduled" => Ok(PostStatus::Scheduled),
            "published" => Ok(PostStatus::Published),
            "failed" => Ok(PostStatus::Failed),
            other => Err(format!("unknown post status: {other}")),
        }
    }
}

/// Lifecycle of one (post, platform) delivery unit.
///
/// ```text
/// scheduled ─claim─▶ processing ─event sent─▶ kafka_ready ─worker─▶ kafka_processed ─▶ published
///      ▲                 │                         │                     │
///      └──── requeue ────┴─────────────────────────┴─────────────────────┴──────────▶ failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationStatus {
    /// Waiting for `scheduled_for` to arrive.
    Scheduled,
    /// Claimed by a scheduler tick; the event has not been acknowledged yet.
    Processing,
    /// Event acknowledged by the channel (`event_sent = true`).
    KafkaReady,
    /// A worker has taken the event and is delivering it.
    KafkaProcessed,
    /// Delivered to every configured channel.
    Published,
    /// Gave up; `error_message` says why.
    Failed,
}

impl DestinationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, DestinationStatus::Published | DestinationStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DestinationStatus::Scheduled => "scheduled",
            DestinationStatus::Processing => "processing",
            DestinationStatus::KafkaReady => "kafka_ready",
            DestinationStatus::KafkaProcessed => "kafka_processed",
            DestinationStatus::Published => "published",
            DestinationStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for DestinationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DestinationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(DestinationStatus::Scheduled),
            "processing" => Ok(DestinationStatus::Processing),
            "kafka_ready" => Ok(DestinationStatus::KafkaReady),
            "kafka_processed" => Ok(DestinationStatus::KafkaProcessed),
            "published" => Ok(DestinationStatus::Published),
            "failed" => Ok(DestinationStatus::Failed),
            other => Err(format!("unknown destination status: {other}")),
        }
    }
}

/// A piece of content owned by a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub id: PostId,
    pub user_id: UserId,
    pub title: String,
    pub content: String,
    pub status: PostStatus,
    pub created_at: DateTime<Utc>,
}

/// A user's account on an external platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub id: PlatformId,
    pub user_id: UserId,
    /// Platform type, e.g. `"Telegram"`.
    pub name: String,
    /// Channel identifier → secret token. Ordered so deliveries are deterministic.
    pub credentials: BTreeMap<String, String>,
    pub is_active: bool,
}

/// One row of `post_destinations`: the unit of work of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostDestination {
    pub id: DestinationId,
    pub post_id: PostId,
    pub platform_id: PlatformId,
    pub scheduled_for: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub status: DestinationStatus,
    pub error_message: Option<String>,
    /// True only after the channel acknowledged the event.
    pub event_sent: bool,
    pub event_sent_at: Option<DateTime<Utc>>,
    /// Dispatch attempts that were requeued or abandoned.
    pub attempts: u32,
    pub claimed_at: Option<DateTime<Utc>>,
    /// Earliest time the destination may be claimed again after a requeue.
    pub retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A destination claimed by a scheduler tick, joined with its post and platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueDestination {
    pub destination_id: DestinationId,
    pub post_id: PostId,
    pub user_id: UserId,
    pub title: String,
    pub content: String,
    pub platform_id: PlatformId,
    pub platform_name: String,
    pub scheduled_for: DateTime<Utc>,
}

/// Result of resolving a user's platform credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformLookup {
    Found(Platform),
    /// The platform exists but has been switched off by its owner.
    Inactive(Platform),
    NotFound,
}

/// Title and body of a post, as delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostContent {
    pub title: String,
    pub body: String,
}

impl PostContent {
    /// The text sent to every channel: title, newline, body.
    pub fn text(&self) -> String {
        format!("{}\n{}", self.title, self.body)
    }
}

/// One send to one channel, successful or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub destination_id: DestinationId,
    pub channel_id: String,
    /// 1-based attempt number for this channel.
    pub attempt: u32,
    pub succeeded: bool,
    pub error: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

/// Input for registering a platform account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPlatform {
    pub user_id: UserId,
    pub name: String,
    #[serde(default)]
    pub credentials: BTreeMap<String, String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

/// Input for creating a post together with its destinations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPost {
    pub user_id: UserId,
    pub title: String,
    pub content: String,
    /// One destination is created per platform.
    #[serde(default)]
    pub platform_ids: Vec<PlatformId>,
    /// When absent the post stays a draft and no destination becomes due.
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
}

/// Posts grouped by lifecycle status.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PostsByStatus {
    pub draft: Vec<Post>,
    pub scheduled: Vec<Post>,
    pub published: Vec<Post>,
    pub failed: Vec<Post>,
}

impl PostsByStatus {
    pub fn push(&mut self, post: Post) {
        match post.status {
            PostStatus::Draft => self.draft.push(post),
            PostStatus::Scheduled => self.scheduled.push(post),
            PostStatus::Published => self.published.push(post),
            PostStatus::Failed => self.failed.push(post),
        }
    }
}
