//! Gateway-side tunnel provisioning for Burrow.
//!
//! The gateway answers bus calls from devices: it opens its side of a
//! tunnel (interface, peer, forwarding and NAT rules), reports status, and
//! tears everything down again. Identical repeat requests replay the
//! committed result; diverging requests for the same device are conflicts.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod handler;

pub use config::GatewayConfig;
pub use dispatch::serve;
pub use error::{GatewayError, Result};
pub use handler::GatewayRpcHandler;
