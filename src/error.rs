//! Error types for the Formguard service.

use thiserror::Error;

/// Main error type for Formguard operations.
///
/// Only startup paths return this. Request-time failures inside the
/// rate limiter are recovered locally and never reach a handler.
#[derive(Error, Debug)]
pub enum FormguardError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Formguard operations.
pub type Result<T> = std::result::Result<T, FormguardError>;
