//! `herald-worker`: delivery side of the pipeline.
//!
//! The [`Dispatcher`] reads publication events from the channel and hands each
//! one to a [`DeliveryWorker`] task. Workers wait out the configured delay,
//! claim the destination, resolve credentials and content, send to every
//! channel of the user's platform account and record the final status.
//!
//! Concurrency is bounded by a semaphore; workers run on a shared
//! `TaskTracker` so the supervisor can drain them on shutdown.

pub mod dispatcher;
pub mod worker;

pub use dispatcher::Dispatcher;
pub use worker::{DeliveryWorker, Outcome};
