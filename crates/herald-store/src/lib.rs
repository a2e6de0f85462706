//! `herald-store`: SQLite-backed publication store.
//!
//! # Overview
//!
//! Posts, platform accounts and their per-platform destinations live in one
//! SQLite database. [`SqliteStore`] implements
//! [`herald_core::PublicationStore`] for the dispatch pipeline and also exposes
//! the small CRUD surface the HTTP gateway needs.
//!
//! Claims are made inside `BEGIN IMMEDIATE` transactions, so two stores
//! opened on the same file (or two processes) never claim the same row.

pub mod db;
pub mod error;
pub mod store;

pub use error::{DbError, Result};
pub use store::SqliteStore;
