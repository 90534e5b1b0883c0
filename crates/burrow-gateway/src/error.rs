//! Gateway error types.

use thiserror::Error;

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Errors produced while serving provisioning calls.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// A device re-requested provisioning with different parameters.
    #[error("conflicting request for device '{device_id}': {detail}")]
    Conflict {
        /// Device the committed session belongs to.
        device_id: String,
        /// What diverged.
        detail: String,
    },

    /// The caller's authenticated identity does not cover the request.
    #[error("caller '{caller}' may not act for device '{device_id}'")]
    Forbidden {
        /// Authenticated bus identity.
        caller: String,
        /// Device named in the request.
        device_id: String,
    },

    /// The request payload was malformed.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Tunnel lifecycle failure.
    #[error(transparent)]
    Tunnel(#[from] burrow_tunnel::TunnelError),

    /// Routing or firewall failure.
    #[error(transparent)]
    Routing(#[from] burrow_routing::RoutingError),

    /// Bus endpoint failure.
    #[error(transparent)]
    Bus(#[from] burrow_bus::BusError),

    /// Configuration failure.
    #[error(transparent)]
    Config(#[from] burrow_settings::ConfigError),
}
