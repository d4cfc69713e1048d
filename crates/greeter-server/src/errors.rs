//! Server error types.

use greeter_transport::TransportError;
use thiserror::Error;

/// Errors that prevent the server from starting.
///
/// Everything after startup is handled inside the dispatch loops and never
/// surfaces here.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The transport could not be started (bind failure and the like).
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    /// The configuration cannot be served.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;
