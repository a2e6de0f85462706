use std::sync::Arc;
use std::time::Duration;

use herald_channel::{decode_event, ChannelMessage, EventConsumer};
use tokio::sync::Semaphore;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use crate::worker::DeliveryWorker;

/// Back-off after a failed receive before trying again.
const RECV_ERROR_PAUSE: Duration = Duration::from_secs(1);

/// Reads events from the channel and runs one worker task per event.
pub struct Dispatcher {
    worker: Arc<DeliveryWorker>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl Dispatcher {
    /// `tracker` is shared with whoever drains the workers on shutdown.
    pub fn new(worker: DeliveryWorker, max_concurrent: usize, tracker: TaskTracker) -> Self {
        Self {
            worker: Arc::new(worker),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            tracker,
        }
    }

    /// Consume until `cancel` fires.
    ///
    /// Returns without waiting for spawned workers; they finish on the
    /// tracker. An event is committed once its worker has been spawned, or
    /// immediately when the payload is malformed.
    pub async fn run(self, mut consumer: Box<dyn EventConsumer>, cancel: CancellationToken) {
        info!(
            max_concurrent = self.permits.available_permits(),
            "dispatcher started"
        );

        loop {
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                received = consumer.recv() => received,
            };
            let msg = match received {
                Ok(msg) => msg,
                Err(e) => {
                    error!(error = %e, "receiving from channel failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(RECV_ERROR_PAUSE) => continue,
                    }
                }
            };

            let event = match decode_event(&msg.payload) {
                Ok(event) => event,
                Err(e) => {
                    warn!(
                        partition = msg.partition,
                        offset = msg.offset,
                        error = %e,
                        "dropping malformed event"
                    );
                    commit(consumer.as_mut(), &msg).await;
                    continue;
                }
            };

            // Uncommitted if shutdown wins: the event is read again on restart.
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            debug!(
                destination_id = event.destination_id(),
                partition = msg.partition,
                offset = msg.offset,
                "dispatching event"
            );
            let worker = Arc::clone(&self.worker);
            let token = cancel.clone();
            self.tracker.spawn(async move {
                let _permit = permit;
                worker.process(event, token).await
            });
            commit(consumer.as_mut(), &msg).await;
        }

        info!(in_flight = self.tracker.len(), "dispatcher stopped");
    }
}

async fn commit(consumer: &mut dyn EventConsumer, msg: &ChannelMessage) {
    if let Err(e) = consumer.commit(msg).await {
        warn!(partition = msg.partition, offset = msg.offset, error = %e, "offset commit failed");
    }
}
