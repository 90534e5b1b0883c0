//! Error types for tunnel lifecycle operations.

use thiserror::Error;

/// Result type for tunnel operations.
pub type Result<T> = std::result::Result<T, TunnelError>;

/// Errors that can occur while managing tunnel interfaces.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// An interface with the same name exists with different parameters.
    #[error("interface '{name}' already exists with different parameters: {detail}")]
    Conflict {
        /// Interface name.
        name: String,
        /// Which parameter differs.
        detail: String,
    },

    /// The named interface does not exist.
    #[error("interface not found: {0}")]
    InterfaceNotFound(String),

    /// The underlying device operation failed.
    #[error("device operation failed: {0}")]
    Device(String),

    /// Invalid key length.
    #[error("invalid key length: expected 32, got {0}")]
    InvalidKeyLength(usize),

    /// Invalid base64 encoding.
    #[error("invalid base64 encoding: {0}")]
    InvalidBase64(String),

    /// Invalid CIDR notation.
    #[error("invalid CIDR: {0}")]
    InvalidCidr(String),

    /// Invalid endpoint address.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}
