//! Bus error types.

use thiserror::Error;

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors produced by bus sessions and transports.
#[derive(Debug, Error)]
pub enum BusError {
    /// The peer rejected our credentials.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// The underlying connection failed or dropped.
    #[error("transport failure: {0}")]
    Transport(String),

    /// An operation was attempted in the wrong session state.
    #[error("cannot {operation} while session is {state}")]
    State {
        /// The refused operation.
        operation: &'static str,
        /// The state the session was in.
        state: String,
    },

    /// A call did not complete within its deadline.
    #[error("call to '{procedure}' timed out after {secs}s")]
    Timeout {
        /// Procedure that timed out.
        procedure: String,
        /// Deadline in seconds.
        secs: u64,
    },

    /// The remote handler reported an application error.
    #[error("remote error from '{procedure}': {message}")]
    Remote {
        /// Procedure that failed.
        procedure: String,
        /// Error reported by the handler.
        message: String,
    },

    /// A frame or payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),
}
