//! `herald-scheduler`: discovery side of the pipeline.
//!
//! [`SchedulerLoop`] claims due destinations on a fixed cadence and emits one
//! [`herald_core::PublicationEvent`] per destination. [`ReaperLoop`] returns
//! destinations stranded between claim and delivery to `scheduled`.

pub mod error;
pub mod reaper;
pub mod scheduler;

pub use error::{Result, SchedulerError};
pub use reaper::ReaperLoop;
pub use scheduler::{SchedulerLoop, TickReport};
