use thiserror::Error;

/// Errors raised by event channel backends.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The local log (SQLite) failed.
    #[error("channel storage error: {0}")]
    Storage(String),

    /// The remote broker refused or lost the request.
    #[error("broker error: {0}")]
    Broker(String),

    /// A payload did not decode into a publication event.
    #[error("malformed event: {0}")]
    Malformed(String),

    #[error("publish timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// The backend cannot be built from the given configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<rusqlite::Error> for ChannelError {
    fn from(err: rusqlite::Error) -> Self {
        ChannelError::Storage(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ChannelError>;
