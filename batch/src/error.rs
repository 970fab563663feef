//! Error types for batch scheduling

use thiserror::Error;

/// Result type for batch operations
pub type Result<T> = std::result::Result<T, Error>;

/// Batch driver errors
#[derive(Error, Debug)]
pub enum Error {
    /// Boundary call failed
    #[error("Substrate error: {0}")]
    Substrate(#[from] substrate_common::Error),

    /// Driver misuse (duplicate or empty batch name, zero interval)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Backend answered a batch call with its error flag set
    #[error("Batch call rejected ({code}): {message}")]
    Rejected {
        /// Backend error code
        code: i32,
        /// Backend error message
        message: String,
    },

    /// Handler ran but its outcome could not be recorded
    #[error("Failed to report batch request {request_id}: {source}")]
    Report {
        /// Entry whose outcome was lost
        request_id: String,
        /// Why the follow-up write failed
        source: Box<Error>,
    },

    /// Payload could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
