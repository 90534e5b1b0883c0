//! Core types for tunnel interface configuration.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TunnelError};
use crate::keys::{PrivateKey, PublicKey};

/// A tunnel peer endpoint (IP and port).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    address: SocketAddr,
}

impl Endpoint {
    /// Creates a new endpoint from a socket address.
    #[must_use]
    pub fn new(address: SocketAddr) -> Self {
        Self { address }
    }

    /// Creates an endpoint from an IP address and port.
    #[must_use]
    pub fn from_ip_port(ip: IpAddr, port: u16) -> Self {
        Self {
            address: SocketAddr::new(ip, port),
        }
    }

    /// Returns the IP address.
    #[must_use]
    pub fn ip(&self) -> IpAddr {
        self.address.ip()
    }

    /// Returns the port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.address.port()
    }
}

impl FromStr for Endpoint {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self> {
        let address = s
            .parse::<SocketAddr>()
            .map_err(|e| TunnelError::InvalidEndpoint(e.to_string()))?;
        Ok(Self { address })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}

/// The full parameter set of a tunnel interface.
///
/// Two specs are considered identical when every field matches; creating an
/// interface whose name is taken by a spec that differs in any field is a
/// conflict, never a silent overwrite.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelSpec {
    /// Interface name, unique per host.
    pub name: String,
    /// Local address and mask bound to the interface.
    pub address: IpNet,
    /// The interface's private key.
    pub private_key: PrivateKey,
    /// UDP listen port.
    pub listen_port: u16,
}

impl TunnelSpec {
    /// Creates a new tunnel spec.
    #[must_use]
    pub fn new(name: impl Into<String>, address: IpNet, private_key: PrivateKey, listen_port: u16) -> Self {
        Self {
            name: name.into(),
            address,
            private_key,
            listen_port,
        }
    }

    /// Returns the public key derived from the interface private key.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        self.private_key.public_key()
    }

    /// Names the first field in which `other` differs from `self`.
    #[must_use]
    pub fn diff(&self, other: &Self) -> Option<&'static str> {
        if self.name != other.name {
            return Some("name");
        }
        if self.address != other.address {
            return Some("address");
        }
        if self.private_key != other.private_key {
            return Some("private_key");
        }
        if self.listen_port != other.listen_port {
            return Some("listen_port");
        }
        None
    }
}

impl fmt::Debug for TunnelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelSpec")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("private_key", &"[REDACTED]")
            .field("listen_port", &self.listen_port)
            .finish()
    }
}

/// A remote peer attached to a tunnel interface.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelPeer {
    /// The peer's public key.
    pub public_key: PublicKey,
    /// Networks the peer is allowed to route.
    pub allowed_ips: Vec<IpNet>,
    /// The peer's reachable endpoint, if it has a stable one.
    pub endpoint: Option<Endpoint>,
    /// Persistent keepalive interval in seconds.
    pub persistent_keepalive: Option<u16>,
}

impl TunnelPeer {
    /// Creates a new peer with the given public key.
    #[must_use]
    pub fn new(public_key: PublicKey) -> Self {
        Self {
            public_key,
            allowed_ips: Vec::new(),
            endpoint: None,
            persistent_keepalive: None,
        }
    }

    /// Adds an allowed network.
    #[must_use]
    pub fn with_allowed_ip(mut self, network: IpNet) -> Self {
        self.allowed_ips.push(network);
        self
    }

    /// Sets the endpoint.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Sets the persistent keepalive interval.
    #[must_use]
    pub fn with_persistent_keepalive(mut self, seconds: u16) -> Self {
        self.persistent_keepalive = Some(seconds);
        self
    }
}

/// Observable state of a managed tunnel interface.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TunnelStatus {
    /// Interface name.
    pub name: String,
    /// The interface's public key.
    pub public_key: PublicKey,
    /// Bound address.
    pub address: IpNet,
    /// UDP listen port.
    pub listen_port: u16,
    /// Attached peers.
    pub peers: Vec<TunnelPeer>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_keypair;

    fn net(s: &str) -> IpNet {
        s.parse().expect("valid cidr")
    }

    #[test]
    fn endpoint_parse_and_display() {
        let ep: Endpoint = "10.0.23.15:42001".parse().expect("valid endpoint");
        assert_eq!(ep.port(), 42001);
        assert_eq!(ep.to_string(), "10.0.23.15:42001");
    }

    #[test]
    fn endpoint_rejects_garbage() {
        assert!("not-an-endpoint".parse::<Endpoint>().is_err());
    }

    #[test]
    fn spec_diff_reports_first_difference() {
        let (private, _) = generate_keypair();
        let a = TunnelSpec::new("node-a", net("10.0.42.15/16"), private.clone(), 42001);
        assert_eq!(a.diff(&a.clone()), None);

        let mut b = a.clone();
        b.address = net("10.0.43.15/16");
        assert_eq!(a.diff(&b), Some("address"));

        let mut c = a.clone();
        c.listen_port = 42002;
        assert_eq!(a.diff(&c), Some("listen_port"));

        let mut d = a.clone();
        d.private_key = PrivateKey::generate();
        assert_eq!(a.diff(&d), Some("private_key"));
    }

    #[test]
    fn spec_debug_redacts_private_key() {
        let (private, _) = generate_keypair();
        let spec = TunnelSpec::new("node-a", net("10.0.42.15/16"), private, 42001);
        assert!(format!("{spec:?}").contains("REDACTED"));
    }

    #[test]
    fn peer_builder_accumulates() {
        let (_, public) = generate_keypair();
        let peer = TunnelPeer::new(public)
            .with_allowed_ip(net("0.0.0.0/0"))
            .with_endpoint("10.0.23.15:42001".parse().expect("valid endpoint"))
            .with_persistent_keepalive(10);

        assert_eq!(peer.allowed_ips.len(), 1);
        assert_eq!(peer.persistent_keepalive, Some(10));
        assert!(peer.endpoint.is_some());
    }
}
