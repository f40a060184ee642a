//! Transaction manager error types.

use thiserror::Error;
use transaction_log::LogError;
use xa::XaError;

/// Errors that can occur when talking to or starting the transaction manager.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// The coordinator task is no longer running.
    #[error("Transaction manager has stopped")]
    Stopped,

    /// The coordinator dropped a request without replying.
    #[error("Transaction manager dropped the reply")]
    ReplyDropped,

    /// Transaction log error.
    #[error("Transaction log error: {0}")]
    Log(#[from] LogError),

    /// Resource setup error.
    #[error("Resource error: {0}")]
    Xa(#[from] XaError),

    /// The configuration cannot be used.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Convenience type alias for transaction manager results.
pub type Result<T> = std::result::Result<T, ManagerError>;
