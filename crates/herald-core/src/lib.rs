//! `herald-core`: shared building blocks for the publication dispatch pipeline.
//!
//! # Overview
//!
//! Every other crate depends on this one for the data model, the wire event,
//! the configuration tree and the two capability traits the pipeline is wired
//! through:
//!
//! | Trait                       | Implemented by      | Used by                      |
//! |-----------------------------|---------------------|------------------------------|
//! | [`store::PublicationStore`] | `herald-store`      | scheduler, reaper, workers   |
//! | [`sink::DeliverySink`]      | `herald-telegram`   | workers                      |
//!
//! The event channel traits live in `herald-channel` next to their backends.

pub mod config;
pub mod error;
pub mod event;
pub mod retry;
pub mod sink;
pub mod store;
pub mod types;

pub use error::{ConfigError, SinkError, StoreError};
pub use event::PublicationEvent;
pub use retry::RetryPolicy;
pub use sink::DeliverySink;
pub use store::PublicationStore;
