//! Configuration error types.

use thiserror::Error;

/// Result type for configuration loading.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors produced while loading or validating configuration.
///
/// Configuration errors are fatal: callers are expected to surface them and
/// stop, not retry.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config file '{path}': {reason}")]
    Io {
        /// Path that failed.
        path: String,
        /// Underlying reason.
        reason: String,
    },

    /// The document is not valid TOML or has the wrong shape.
    #[error("invalid configuration document: {0}")]
    Parse(String),

    /// The document declares a schema version this build does not know.
    #[error("unsupported configuration version {0}")]
    UnsupportedVersion(u32),

    /// A mandatory field is missing.
    #[error("missing mandatory field '{0}'")]
    MissingField(&'static str),

    /// A field is present but invalid.
    #[error("invalid value for '{field}': {reason}")]
    Invalid {
        /// Field name.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}
