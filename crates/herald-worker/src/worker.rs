use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use herald_core::{
    types::{DeliveryAttempt, DestinationId, Platform, PlatformLookup, PostContent},
    DeliverySink, PublicationEvent, PublicationStore, RetryPolicy, SinkError, StoreError,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// How long a claim is re-tried while the scheduler's acknowledgement write
/// may still be in flight.
const DEFAULT_CLAIM_GRACE: Duration = Duration::from_secs(1);
const CLAIM_RECHECK_PAUSE: Duration = Duration::from_millis(100);

/// How one event ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Delivered to every channel; the destination is `published`.
    Published,
    /// The destination is `failed` with this reason.
    Failed(String),
    /// Another worker owns the destination, or it already finished.
    Duplicate,
    /// Shutdown was already requested; nothing was touched.
    Skipped,
    /// A store write failed; the destination stays where it was for the reaper.
    Abandoned(String),
}

/// Everything needed to send one destination.
struct Job {
    platform: Platform,
    content: PostContent,
}

/// Delivers one publication event.
pub struct DeliveryWorker {
    store: Arc<dyn PublicationStore>,
    sink: Arc<dyn DeliverySink>,
    delay: Duration,
    retry: RetryPolicy,
    claim_grace: Duration,
}

impl DeliveryWorker {
    pub fn new(
        store: Arc<dyn PublicationStore>,
        sink: Arc<dyn DeliverySink>,
        delay: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            sink,
            delay,
            retry,
            claim_grace: DEFAULT_CLAIM_GRACE,
        }
    }

    /// Bound on re-trying a claim that found the destination not yet
    /// acknowledged. Zero treats the first miss as a duplicate.
    pub fn with_claim_grace(mut self, grace: Duration) -> Self {
        self.claim_grace = grace;
        self
    }

    /// Wait out the delay window, then deliver.
    ///
    /// A worker that starts after cancellation does nothing. Cancellation
    /// during the wait cuts it short and the worker delivers right away.
    #[instrument(skip(self, event, cancel), fields(destination_id = event.destination_id()))]
    pub async fn process(&self, event: PublicationEvent, cancel: CancellationToken) -> Outcome {
        if cancel.is_cancelled() {
            debug!("shutdown already requested, leaving event untouched");
            return Outcome::Skipped;
        }

        tokio::select! {
            _ = tokio::time::sleep(self.delay) => {}
            _ = cancel.cancelled() => {
                debug!("shutdown requested during delay, delivering now");
            }
        }

        self.deliver(&event).await
    }

    /// Claim, resolve, send and record, without any delay.
    pub async fn deliver(&self, event: &PublicationEvent) -> Outcome {
        let id = event.destination_id();

        match self.claim(id).await {
            Ok(true) => {}
            Ok(false) => {
                info!(destination_id = id, "destination not awaiting delivery, skipping duplicate");
                return Outcome::Duplicate;
            }
            Err(e) => {
                error!(destination_id = id, error = %e, "claiming destination failed");
                return Outcome::Abandoned(e.to_string());
            }
        }

        let job = match self.resolve(event).await {
            Ok(job) => job,
            Err(reason) => return self.fail(event, reason).await,
        };

        let text = job.content.text();
        let mut failures = Vec::new();
        for (channel_id, token) in &job.platform.credentials {
            if let Err(e) = self.send_with_retry(event, channel_id, token, &text).await {
                failures.push(format!("{channel_id}: {e}"));
            }
        }

        if !failures.is_empty() {
            return self.fail(event, failures.join("; ")).await;
        }

        match self.store.mark_sent(id).await {
            Ok(true) => {
                info!(
                    destination_id = id,
                    post_id = event.content_id(),
                    channels = job.platform.credentials.len(),
                    "publication delivered"
                );
                Outcome::Published
            }
            Ok(false) => {
                warn!(destination_id = id, "delivered, but destination was no longer in flight");
                Outcome::Duplicate
            }
            Err(e) => {
                error!(destination_id = id, error = %e, "recording publication failed");
                Outcome::Abandoned(e.to_string())
            }
        }
    }

    /// `mark_kafka_processed`, re-tried for up to `claim_grace`: with a short
    /// delay window the event can arrive before the scheduler records it.
    async fn claim(&self, id: DestinationId) -> Result<bool, StoreError> {
        let deadline = tokio::time::Instant::now() + self.claim_grace;
        loop {
            if self.store.mark_kafka_processed(id).await? {
                return Ok(true);
            }
            if tokio::time::Instant::now() + CLAIM_RECHECK_PAUSE > deadline {
                return Ok(false);
            }
            debug!(destination_id = id, "destination not yet acknowledged, re-checking");
            tokio::time::sleep(CLAIM_RECHECK_PAUSE).await;
        }
    }

    async fn resolve(&self, event: &PublicationEvent) -> Result<Job, String> {
        let platform_name = self.sink.platform();
        let platform = match self
            .store
            .fetch_credentials(platform_name, event.user_id(), event.platform_id())
            .await
        {
            Ok(PlatformLookup::Found(p)) => p,
            Ok(PlatformLookup::Inactive(p)) => {
                return Err(format!("{platform_name} account {} is inactive", p.id));
            }
            Ok(PlatformLookup::NotFound) => {
                return Err(format!(
                    "no {platform_name} account {} for user {}",
                    event.platform_id(),
                    event.user_id()
                ));
            }
            Err(e) => return Err(format!("credential lookup failed: {e}")),
        };

        if platform.credentials.is_empty() {
            return Err(format!(
                "{platform_name} account {} has no channels configured",
                platform.id
            ));
        }

        let content = match self
            .store
            .fetch_content(event.user_id(), event.content_id())
            .await
        {
            Ok(Some(content)) => content,
            Ok(None) => {
                return Err(format!(
                    "post {} not found for user {}",
                    event.content_id(),
                    event.user_id()
                ));
            }
            Err(e) => return Err(format!("content lookup failed: {e}")),
        };

        Ok(Job { platform, content })
    }

    async fn send_with_retry(
        &self,
        event: &PublicationEvent,
        channel_id: &str,
        token: &str,
        text: &str,
    ) -> Result<(), SinkError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self.sink.send(channel_id, token, text).await;
            self.record(event, channel_id, attempt, &result).await;

            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && !self.retry.is_exhausted(attempt) => {
                    let wait = self.retry.delay_after(attempt);
                    warn!(
                        destination_id = event.destination_id(),
                        channel_id,
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        error = %e,
                        "send failed, retrying"
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn record(
        &self,
        event: &PublicationEvent,
        channel_id: &str,
        attempt: u32,
        result: &Result<(), SinkError>,
    ) {
        let entry = DeliveryAttempt {
            destination_id: event.destination_id(),
            channel_id: channel_id.to_string(),
            attempt,
            succeeded: result.is_ok(),
            error: result.as_ref().err().map(ToString::to_string),
            attempted_at: Utc::now(),
        };
        if let Err(e) = self.store.record_attempt(&entry).await {
            warn!(destination_id = event.destination_id(), error = %e, "recording attempt failed");
        }
    }

    async fn fail(&self, event: &PublicationEvent, reason: String) -> Outcome {
        let id = event.destination_id();
        match self.store.mark_failed(id, &reason).await {
            Ok(_) => Outcome::Failed(reason),
            Err(e) => {
                error!(destination_id = id, error = %e, %reason, "recording failure failed");
                Outcome::Abandoned(e.to_string())
            }
        }
    }
}
