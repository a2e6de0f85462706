use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    error::StoreError,
    retry::RetryPolicy,
    types::{
        DeliveryAttempt, DestinationId, DueDestination, PlatformId, PlatformLookup, PostContent,
        PostId, UserId,
    },
};

/// Status-transition surface of the publication store, as consumed by the pipeline.
///
/// Every transition is conditional on the row's current state. Methods that
/// return `bool` report whether the row actually moved; `false` means another
/// actor got there first (or the row is already terminal) and the caller must
/// treat the call as a no-op.
///
/// Correctness of "exactly one claimer" rests entirely on these methods being
/// atomic in the backend. Callers take no locks of their own.
#[async_trait]
pub trait PublicationStore: Send + Sync {
    /// Claim up to `limit` destinations due at `now`, earliest first.
    ///
    /// Each returned row has already been moved `scheduled → processing`;
    /// concurrent callers never receive the same destination.
    async fn fetch_due(&self, limit: usize, now: DateTime<Utc>)
        -> Result<Vec<DueDestination>, StoreError>;

    /// Resolve the account `platform_id`, provided it belongs to `user_id`
    /// and is on the named platform.
    async fn fetch_credentials(
        &self,
        platform_name: &str,
        user_id: UserId,
        platform_id: PlatformId,
    ) -> Result<PlatformLookup, StoreError>;

    /// Title and body of `post_id`, provided it belongs to `user_id`.
    async fn fetch_content(
        &self,
        user_id: UserId,
        post_id: PostId,
    ) -> Result<Option<PostContent>, StoreError>;

    /// `processing → kafka_ready`, setting `event_sent`. Call only after the
    /// channel acknowledged the event.
    async fn mark_kafka_ready(&self, id: DestinationId) -> Result<bool, StoreError>;

    /// `kafka_ready → kafka_processed`: a worker takes ownership of delivery.
    async fn mark_kafka_processed(&self, id: DestinationId) -> Result<bool, StoreError>;

    /// `kafka_processed → published`. Requires `event_sent`.
    async fn mark_sent(&self, id: DestinationId) -> Result<bool, StoreError>;

    /// Any non-terminal status `→ failed`, recording `error`.
    async fn mark_failed(&self, id: DestinationId, error: &str) -> Result<bool, StoreError>;

    /// Append one per-channel delivery outcome.
    async fn record_attempt(&self, attempt: &DeliveryAttempt) -> Result<(), StoreError>;

    /// Return stranded destinations to `scheduled` (or fail them once the
    /// retry budget is spent).
    async fn requeue_stale(
        &self,
        policy: &RequeuePolicy,
        now: DateTime<Utc>,
    ) -> Result<RequeueReport, StoreError>;
}

/// Thresholds for the reconciliation sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequeuePolicy {
    /// A claim without an acknowledged event older than this is stranded.
    pub claim_timeout: Duration,
    /// An acknowledged event not delivered within this window is re-emitted.
    pub redeliver_after: Duration,
    pub retry: RetryPolicy,
}

impl Default for RequeuePolicy {
    fn default() -> Self {
        Self {
            claim_timeout: Duration::from_secs(300),
            redeliver_after: Duration::from_secs(900),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequeueReport {
    pub requeued: Vec<DestinationId>,
    pub failed: Vec<DestinationId>,
}

impl RequeueReport {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.failed.is_empty()
    }
}
