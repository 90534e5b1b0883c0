//! Authenticated request bus for Burrow.
//!
//! Clients and gateways talk over a WebSocket bus secured with the
//! CA-issued device certificates from `burrow-identity`. This crate holds
//! the wire message types, the client-side session state machine, the
//! caller and endpoint transport traits, and their WebSocket
//! implementations. Fakes for both sides keep the rest of the workspace
//! testable without sockets.

pub mod auth;
pub mod endpoint;
pub mod error;
pub mod messages;
pub mod session;
pub mod transport;
pub mod ws;

pub use endpoint::{BusEndpoint, FakeBusCaller, FakeBusEndpoint, Invocation};
pub use error::{BusError, Result};
pub use session::{BusSession, SessionState};
pub use transport::{BusTransport, FakeBusTransport, TlsIdentity};
pub use ws::{WsEndpoint, WsTransport};
