use herald_core::StoreError;
use thiserror::Error;

/// Errors raised inside the SQLite store.
#[derive(Debug, Error)]
pub enum DbError {
    /// Underlying SQLite / rusqlite error.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A column held a value that does not decode (timestamp, status, JSON).
    #[error("corrupt value in {table}: {reason}")]
    Corrupt { table: &'static str, reason: String },

    /// A referenced row does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: i64 },

    /// Input rejected before touching the database.
    #[error("invalid input: {0}")]
    Invalid(String),

    #[error("connection lock poisoned")]
    Poisoned,
}

pub type Result<T> = std::result::Result<T, DbError>;

impl From<DbError> for StoreError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Sqlite(e) => StoreError::Database(e.to_string()),
            DbError::Corrupt { table, reason } => StoreError::Corrupt { table, reason },
            DbError::NotFound { entity, id } => StoreError::NotFound { entity, id },
            DbError::Invalid(reason) => StoreError::Invalid(reason),
            DbError::Poisoned => StoreError::Poisoned,
        }
    }
}
