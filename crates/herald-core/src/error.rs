use thiserror::Error;

/// Configuration could not be assembled from defaults, file and environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Invalid(String),
}

/// Errors surfaced through the [`PublicationStore`](crate::store::PublicationStore) trait.
///
/// Backends convert their native errors into these variants so that callers
/// never depend on a concrete database crate.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The underlying database rejected or failed a statement.
    #[error("Database error: {0}")]
    Database(String),

    /// A stored value could not be decoded (bad timestamp, bad JSON config, ...).
    #[error("Corrupt row in {table}: {reason}")]
    Corrupt { table: &'static str, reason: String },

    /// A referenced row does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: i64 },

    /// The connection lock was poisoned by a panicking holder.
    #[error("Store connection lock poisoned")]
    Poisoned,

    /// Input rejected before reaching the database.
    #[error("Invalid input: {0}")]
    Invalid(String),
}

/// Outcome of a failed call to an external delivery platform.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SinkError {
    /// The platform refused the message (bad token, unknown chat, ...).
    /// Retrying the same call will not help.
    #[error("rejected by platform: {0}")]
    Rejected(String),

    /// Network failure, timeout or rate limit. Worth another attempt.
    #[error("platform unavailable: {0}")]
    Unavailable(String),
}

impl SinkError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SinkError::Unavailable(_))
    }
}
