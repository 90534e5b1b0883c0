//! Provisioning error types.

use std::fmt;

use thiserror::Error;

/// The ordered provisioning stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Opening the authenticated bus connection.
    Connect,
    /// Attaching to the realm.
    Join,
    /// Negotiating gateway-side provisioning.
    RequestGateway,
    /// Creating the local tunnel interface and peer.
    Tunnel,
    /// Installing policy routing and NAT.
    Routing,
    /// Confirming gateway readiness.
    RequestStatus,
    /// Detaching from the bus.
    Leave,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connect => "connect",
            Self::Join => "join",
            Self::RequestGateway => "request_gateway",
            Self::Tunnel => "tunnel",
            Self::Routing => "routing",
            Self::RequestStatus => "request_status",
            Self::Leave => "leave",
        };
        f.write_str(name)
    }
}

/// A failed provisioning run.
///
/// Names the stage that failed and carries any rollback steps that could
/// not be undone, so the operator knows what is left on the host.
#[derive(Debug, Error)]
#[error("provisioning failed at stage '{stage}': {message}")]
pub struct ProvisioningError {
    /// Stage that aborted the run.
    pub stage: Stage,
    /// What went wrong.
    pub message: String,
    /// Rollback steps that failed, in attempt order.
    pub rollback_failures: Vec<String>,
}

impl ProvisioningError {
    /// Returns whether rollback left nothing behind.
    #[must_use]
    pub fn rollback_clean(&self) -> bool {
        self.rollback_failures.is_empty()
    }
}
