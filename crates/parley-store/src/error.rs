use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Generic I/O error (e.g. creating the database directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The addressed record does not exist.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),

    /// The blocking database task failed or the connection lock was poisoned.
    #[error("Database unavailable: {0}")]
    Unavailable(String),

    /// JSON column encoding error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
