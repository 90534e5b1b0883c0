//! Identity error types.

use thiserror::Error;

/// Result type for identity operations.
pub type Result<T> = std::result::Result<T, IdentityError>;

/// Errors produced while bootstrapping or loading a device identity.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// Reading or writing identity material failed.
    #[error("identity file i/o on '{path}': {reason}")]
    Io {
        /// Path that failed.
        path: String,
        /// Underlying reason.
        reason: String,
    },

    /// Keypair or CSR generation failed.
    #[error("certificate request generation failed: {0}")]
    Csr(String),

    /// The autosign endpoint rejected the request or was unreachable.
    #[error("autosign request failed: {0}")]
    Autosign(String),

    /// Persisted or returned certificate material could not be parsed.
    #[error("certificate parse error: {0}")]
    Parse(String),
}
