use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use herald_channel::{ChannelError, EventProducer};
use herald_core::{
    config::SchedulerConfig, types::DueDestination, PublicationEvent, PublicationStore,
};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Result;

/// Default bound on one publish acknowledgement.
const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of one scheduler tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Destinations claimed (`scheduled → processing`) this tick.
    pub claimed: usize,
    /// Events acknowledged by the channel and recorded as `kafka_ready`.
    pub emitted: usize,
    /// Claimed destinations whose event was not sent; the reaper recovers them.
    pub failed: usize,
}

/// Periodic discovery of due destinations.
///
/// Each tick claims up to `batch_size` rows and publishes one event per row.
/// A row is marked `kafka_ready` only after its publish was acknowledged.
pub struct SchedulerLoop {
    store: Arc<dyn PublicationStore>,
    producer: Arc<dyn EventProducer>,
    interval: Duration,
    batch_size: usize,
    send_timeout: Duration,
}

impl SchedulerLoop {
    pub fn new(
        store: Arc<dyn PublicationStore>,
        producer: Arc<dyn EventProducer>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            store,
            producer,
            interval: config.interval(),
            batch_size: config.batch_size.max(1),
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Tick until `cancel` fires. The first tick runs immediately; a tick in
    /// progress always runs to completion.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            batch_size = self.batch_size,
            "scheduler loop started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick(Utc::now()).await;
                }
            }
        }
        info!("scheduler loop stopped");
    }

    /// Claim and emit everything due at `now`.
    ///
    /// A failure on one destination is logged and does not stop the batch.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let due = match self.store.fetch_due(self.batch_size, now).await {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "fetching due destinations failed");
                return TickReport::default();
            }
        };

        let mut report = TickReport {
            claimed: due.len(),
            ..TickReport::default()
        };
        for destination in &due {
            match self.emit(destination).await {
                Ok(()) => report.emitted += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        destination_id = destination.destination_id,
                        post_id = destination.post_id,
                        error = %e,
                        "event not sent; destination left for requeue"
                    );
                }
            }
        }

        if report.claimed > 0 {
            info!(
                claimed = report.claimed,
                emitted = report.emitted,
                failed = report.failed,
                "scheduler tick"
            );
        }
        report
    }

    async fn emit(&self, destination: &DueDestination) -> Result<()> {
        let event = PublicationEvent::from_due(destination);
        let delivered = tokio::time::timeout(self.send_timeout, self.producer.publish(&event))
            .await
            .map_err(|_| ChannelError::Timeout {
                ms: self.send_timeout.as_millis() as u64,
            })??;

        if self.store.mark_kafka_ready(destination.destination_id).await? {
            debug!(
                destination_id = destination.destination_id,
                partition = delivered.partition,
                offset = delivered.offset,
                "event emitted"
            );
        } else {
            warn!(
                destination_id = destination.destination_id,
                "destination moved on before its event was recorded"
            );
        }
        Ok(())
    }
}
