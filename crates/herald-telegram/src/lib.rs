//! Telegram delivery sink for the publication pipeline.

pub mod send;
pub mod sink;

pub use sink::TelegramSink;
