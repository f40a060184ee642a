use thiserror::Error;

/// Errors raised while setting up resources.
///
/// Protocol outcomes are not errors; they are reported as
/// [`common::XaCode`] values.
#[derive(Debug, Error)]
pub enum XaError {
    /// No switch is registered under the configured key.
    #[error("No XA switch registered for key '{0}'")]
    UnknownSwitch(String),
}

/// Result type for resource setup.
pub type Result<T> = std::result::Result<T, XaError>;
