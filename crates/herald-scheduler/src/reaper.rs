use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use herald_core::{
    config::ReaperConfig,
    store::{RequeuePolicy, RequeueReport},
    PublicationStore,
};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Reconciliation sweep for destinations stranded mid-pipeline.
///
/// Recovers claims whose event was never acknowledged (scheduler crash,
/// channel outage) and acknowledged events no worker finished (worker crash).
/// Runs once at startup, then every `interval`.
pub struct ReaperLoop {
    store: Arc<dyn PublicationStore>,
    interval: Duration,
    policy: RequeuePolicy,
}

impl ReaperLoop {
    pub fn new(store: Arc<dyn PublicationStore>, interval: Duration, policy: RequeuePolicy) -> Self {
        Self {
            store,
            interval,
            policy,
        }
    }

    pub fn from_config(
        store: Arc<dyn PublicationStore>,
        config: &ReaperConfig,
        retry: &herald_core::config::RetryConfig,
    ) -> Self {
        Self::new(store, config.interval(), config.policy(retry))
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "reaper loop started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep(Utc::now()).await;
                }
            }
        }
        info!("reaper loop stopped");
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> RequeueReport {
        match self.store.requeue_stale(&self.policy, now).await {
            Ok(report) => {
                if !report.requeued.is_empty() {
                    info!(count = report.requeued.len(), ids = ?report.requeued, "stranded destinations requeued");
                }
                if !report.failed.is_empty() {
                    warn!(count = report.failed.len(), ids = ?report.failed, "destinations out of attempts");
                }
                report
            }
            Err(e) => {
                error!(error = %e, "requeue sweep failed");
                RequeueReport::default()
            }
        }
    }
}
