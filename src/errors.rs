/*!
 * Error types for the corpus translator.
 *
 * This module contains custom error types for the different seams of the
 * application, using the thiserror crate for ergonomic error definitions.
 * Batch-level failures are not errors: they are attempt outcomes handled by
 * the orchestrator's retry loop. Only the conditions below cross module
 * boundaries.
 */

use thiserror::Error;

/// Errors that can occur when talking to a text generation backend
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    /// Error when making an API request fails
    #[error("API request failed: {0}")]
    RequestFailed(String),

    /// Error when parsing an API response fails
    #[error("Failed to parse API response: {0}")]
    ParseError(String),

    /// Error returned by the API itself
    #[error("API responded with error: {status_code} - {message}")]
    ApiError {
        /// HTTP status code
        status_code: u16,
        /// Error message from the API
        message: String,
    },

    /// Error establishing or maintaining a connection
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// The backend reported that the credential's quota is used up
    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    /// Error with authentication
    #[error("Authentication error: {0}")]
    AuthenticationError(String),
}

impl ProviderError {
    /// Whether this error means the credential used for the call is exhausted.
    ///
    /// Some backends report quota exhaustion inside a generic API error body,
    /// so the message is inspected as well.
    pub fn is_quota_exhausted(&self) -> bool {
        match self {
            Self::RateLimitExceeded(_) => true,
            Self::ApiError { status_code, message } => {
                *status_code == 429 || message.contains("RESOURCE_EXHAUSTED")
            }
            Self::RequestFailed(message) | Self::ConnectionError(message) => {
                message.contains("429 RESOURCE_EXHAUSTED")
            }
            _ => false,
        }
    }
}

/// Errors raised by the store reader and the persistence writer
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite returned an error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The store file or one of the auxiliary files could not be accessed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The store does not have the expected layout
    #[error("Store schema error: {0}")]
    Schema(String),

    /// The writer task is no longer accepting requests
    #[error("Persistence writer has stopped")]
    WriterStopped,

    /// The request could not be queued within the submission timeout
    #[error("Persistence writer queue is full")]
    QueueFull,

    /// The writer did not acknowledge the request within the acknowledgment timeout
    #[error("Persistence writer did not acknowledge within {0} seconds")]
    AckTimedOut(u64),

    /// The transaction was rolled back
    #[error("Write transaction rolled back: {0}")]
    RolledBack(String),
}

/// Conditions that abort the whole run
#[derive(Error, Debug)]
pub enum RunError {
    /// Every credential has been removed from the pool
    #[error("No usable credentials remain in the pool")]
    CredentialsExhausted,

    /// The store could not be read or the writer died
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The run was interrupted by the operator
    #[error("Run interrupted")]
    Interrupted,

    /// Invalid configuration detected at run time
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Main application error type that wraps all other errors
#[derive(Error, Debug)]
pub enum AppError {
    /// Error from a file operation
    #[error("File error: {0}")]
    File(String),

    /// Error from a provider
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Error from the store
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Run-fatal error
    #[error("Run error: {0}")]
    Run(#[from] RunError),

    /// Any other error
    #[error("Unknown error: {0}")]
    Unknown(String),
}

// Utility functions for error conversion
impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        Self::Unknown(error.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(error: std::io::Error) -> Self {
        Self::File(error.to_string())
    }
}
