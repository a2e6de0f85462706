//! `herald-gateway`: process wiring for the publication dispatcher.
//!
//! Builds the store, channel and sink from [`herald_core::config::HeraldConfig`],
//! runs the pipeline under a [`Supervisor`] and serves the HTTP surface.

pub mod app;
pub mod http;
pub mod supervisor;

pub use app::{build_router, start_pipeline, AppState};
pub use supervisor::{Supervisor, SupervisorError};
