//! Lifecycle of the long-running pipeline tasks.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Work was still running when the shutdown budget ran out. It is not aborted.
    #[error("shutdown timed out after {timeout:?} with {remaining} task(s) still running")]
    ShutdownTimeout { timeout: Duration, remaining: usize },

    #[error("{task} task panicked: {reason}")]
    TaskPanicked { task: &'static str, reason: String },
}

/// Owns the cancellation token shared by every pipeline task and the tracker
/// delivery workers are spawned on.
pub struct Supervisor {
    cancel: CancellationToken,
    tracker: TaskTracker,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    shutdown_timeout: Duration,
}

impl Supervisor {
    pub fn new(shutdown_timeout: Duration) -> Self {
        Self {
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            tasks: Vec::new(),
            shutdown_timeout,
        }
    }

    /// Tracker for short-lived work that shutdown must drain.
    pub fn tracker(&self) -> TaskTracker {
        self.tracker.clone()
    }

    /// Token cancelled when shutdown begins.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Workers currently running on the tracker.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Start a long-lived task. It must return once its token is cancelled.
    pub fn spawn<F, Fut>(&mut self, name: &'static str, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task(self.cancel.clone()));
        info!(task = name, "pipeline task started");
        self.tasks.push((name, handle));
    }

    /// Cancel everything, then wait for the long-lived tasks and the
    /// in-flight workers, all within one shutdown budget.
    pub async fn shutdown(self) -> Result<(), SupervisorError> {
        info!(
            tasks = self.tasks.len(),
            in_flight = self.tracker.len(),
            timeout_secs = self.shutdown_timeout.as_secs(),
            "shutting down pipeline"
        );
        self.cancel.cancel();
        let deadline = Instant::now() + self.shutdown_timeout;
        let mut panicked = None;

        let mut remaining = self.tasks.len();
        for (name, handle) in self.tasks {
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(())) => debug!(task = name, "pipeline task stopped"),
                Ok(Err(e)) => {
                    error!(task = name, error = %e, "pipeline task panicked");
                    panicked.get_or_insert(SupervisorError::TaskPanicked {
                        task: name,
                        reason: e.to_string(),
                    });
                }
                Err(_) => {
                    error!(task = name, "pipeline task did not stop in time");
                    return Err(SupervisorError::ShutdownTimeout {
                        timeout: self.shutdown_timeout,
                        remaining: remaining + self.tracker.len(),
                    });
                }
            }
            remaining -= 1;
        }

        self.tracker.close();
        if tokio::time::timeout_at(deadline, self.tracker.wait())
            .await
            .is_err()
        {
            let remaining = self.tracker.len();
            error!(remaining, "delivery workers did not finish in time");
            return Err(SupervisorError::ShutdownTimeout {
                timeout: self.shutdown_timeout,
                remaining,
            });
        }

        info!("pipeline stopped");
        panicked.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_waits_for_tracked_work() {
        let mut supervisor = Supervisor::new(Duration::from_secs(2));
        supervisor.spawn("idle", |cancel| async move { cancel.cancelled().await });

        let tracker = supervisor.tracker();
        let done = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = done.clone();
        tracker.spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
        });

        supervisor.shutdown().await.unwrap();
        assert!(done.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn overrunning_work_is_reported() {
        let supervisor = Supervisor::new(Duration::from_millis(30));
        supervisor
            .tracker()
            .spawn(tokio::time::sleep(Duration::from_secs(5)));

        let err = supervisor.shutdown().await.unwrap_err();
        assert!(matches!(err, SupervisorError::ShutdownTimeout { remaining: 1, .. }));
    }

    #[tokio::test]
    async fn panicking_task_is_reported() {
        let mut supervisor = Supervisor::new(Duration::from_secs(1));
        supervisor.spawn("broken", |_| async { panic!("boom") });
        tokio::task::yield_now().await;

        let err = supervisor.shutdown().await.unwrap_err();
        assert!(matches!(err, SupervisorError::TaskPanicked { task: "broken", .. }));
    }
}
