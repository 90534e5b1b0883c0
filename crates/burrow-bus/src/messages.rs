//! Wire contract between clients and gateways.
//!
//! Payloads are JSON objects; the procedure name selects the handler.

use serde::{Deserialize, Serialize};

/// Procedure names understood by gateway dispatchers.
pub mod procedures {
    /// Ask a gateway to provision its side of a tunnel.
    pub const REQUEST_GATEWAY: &str = "request_gateway";
    /// Query gateway-side tunnel state for a device.
    pub const REQUEST_STATUS: &str = "request_status";
    /// Explicitly provision the gateway-side interface.
    pub const OPEN_INTERFACE: &str = "open_interface";
    /// Tear down the gateway-side interface.
    pub const CLOSE_INTERFACE: &str = "close_interface";
}

/// Tunnel parameters a device presents when requesting a gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayRequest {
    /// Requesting device.
    pub device_id: String,
    /// Device tunnel public key, base64.
    pub public_key: String,
    /// Device tunnel address in CIDR notation.
    pub address: String,
    /// Logical network the device wants to join.
    pub network: String,
}

/// Gateway-side tunnel parameters returned to the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayResponse {
    /// Ephemeral gateway tunnel public key, base64.
    pub gateway_public_key: String,
    /// Host or address the gateway listens on.
    pub gateway_endpoint: String,
    /// UDP port the gateway listens on.
    pub gateway_listen_port: u16,
}

/// Gateway-side view of a device's tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Device the status concerns.
    pub device_id: String,
    /// Whether the gateway-side interface exists.
    pub present: bool,
    /// Number of peers on the gateway-side interface.
    pub peer_count: usize,
}

/// Teardown request for a device's gateway-side state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseRequest {
    /// Device whose interface should be removed.
    pub device_id: String,
}
