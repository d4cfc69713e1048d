//! Transport error types.

use thiserror::Error;

/// Errors raised when issuing transport operations.
///
/// Operation failures after issue (peer gone, cancellation) are not errors:
/// they surface as `ok == false` completions.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The listening address could not be bound.
    #[error("failed to bind {address}: {source}")]
    Bind {
        /// Address that was requested.
        address: String,
        /// Underlying socket error.
        #[source]
        source: std::io::Error,
    },
    /// `build_and_start` was called without a listening port.
    #[error("no listening address configured")]
    NoListeningAddress,
    /// The server has been shut down.
    #[error("server is shut down")]
    ShutDown,
    /// The call was already handed to `request_call`.
    #[error("call has already been requested")]
    AlreadyRequested,
    /// The call has not been accepted yet, or is already over.
    #[error("call is not active")]
    NotActive,
    /// Only one read and one write may be outstanding per call.
    #[error("a {0} is already in flight")]
    OperationInFlight(&'static str),
    /// Socket-level failure outside of a tagged operation.
    #[error("transport i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
