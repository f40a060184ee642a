use thiserror::Error;

/// Errors that can occur when reading or writing the transaction log.
#[derive(Debug, Error)]
pub enum LogError {
    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// The log file could not be read, written or synced.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored record could not be interpreted.
    #[error("Corrupt log record at line {line}: {reason}")]
    Corrupt { line: usize, reason: String },

    /// The log refused the write.
    #[error("Transaction log unavailable")]
    Unavailable,
}

/// Result type for transaction log operations.
pub type Result<T> = std::result::Result<T, LogError>;
