//! Idempotent tunnel lifecycle management.
//!
//! The manager drives a [`TunnelDevice`] through the lifecycle
//! `Absent -> Created -> Peered -> Absent` and keeps its own record of every
//! interface it created, which is what makes the transitions idempotent:
//! re-creating an identical interface is a no-op, re-creating a different
//! one under the same name is a conflict, and destroying an absent one
//! succeeds.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::device::TunnelDevice;
use crate::error::{Result, TunnelError};
use crate::keys::PublicKey;
use crate::types::{TunnelPeer, TunnelSpec, TunnelStatus};

/// Lifecycle phase of a managed interface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TunnelPhase {
    /// No interface exists.
    Absent,
    /// Interface exists with no peers.
    Created,
    /// Interface exists with at least one peer.
    Peered,
}

#[derive(Clone, Debug)]
struct ManagedTunnel {
    spec: TunnelSpec,
    peers: HashMap<String, TunnelPeer>,
}

/// Tunnel lifecycle manager shared by client and gateway.
#[derive(Clone)]
pub struct TunnelManager<D: TunnelDevice + Clone> {
    device: D,
    tunnels: Arc<RwLock<HashMap<String, ManagedTunnel>>>,
}

impl<D: TunnelDevice + Clone> TunnelManager<D> {
    /// Creates a manager over the given device.
    pub fn new(device: D) -> Self {
        Self {
            device,
            tunnels: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Creates a tunnel interface, or reuses an identical existing one.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Conflict`] if an interface with the same name
    /// exists with different parameters; the existing interface is left
    /// untouched. Device failures are propagated.
    pub async fn create(&mut self, spec: &TunnelSpec) -> Result<()> {
        {
            let tunnels = self.tunnels.read().await;
            if let Some(existing) = tunnels.get(&spec.name) {
                return match existing.spec.diff(spec) {
                    None => {
                        debug!(interface = %spec.name, "interface already present, reusing");
                        Ok(())
                    }
                    Some(field) => Err(TunnelError::Conflict {
                        name: spec.name.clone(),
                        detail: format!("{field} differs"),
                    }),
                };
            }
        }

        self.device.create(spec).await?;

        self.tunnels.write().await.insert(
            spec.name.clone(),
            ManagedTunnel {
                spec: spec.clone(),
                peers: HashMap::new(),
            },
        );

        info!(interface = %spec.name, address = %spec.address, "created tunnel interface");
        Ok(())
    }

    /// Adds or replaces a peer, keyed by public key.
    ///
    /// Re-adding a known public key replaces its allowed networks, endpoint
    /// and keepalive rather than duplicating the peer.
    ///
    /// # Errors
    ///
    /// Returns an error if the interface does not exist or the device fails.
    pub async fn add_peer(&mut self, name: &str, peer: &TunnelPeer) -> Result<()> {
        {
            let tunnels = self.tunnels.read().await;
            if !tunnels.contains_key(name) {
                return Err(TunnelError::InterfaceNotFound(name.to_string()));
            }
        }

        self.device.set_peer(name, peer).await?;

        let mut tunnels = self.tunnels.write().await;
        if let Some(tunnel) = tunnels.get_mut(name) {
            tunnel.peers.insert(peer.public_key.to_base64(), peer.clone());
        }

        debug!(
            interface = name,
            peer = %&peer.public_key.to_base64()[..8],
            "attached peer"
        );
        Ok(())
    }

    /// Removes a peer by public key. Unknown keys are tolerated.
    ///
    /// # Errors
    ///
    /// Returns an error if the interface does not exist or the device fails.
    pub async fn remove_peer(&mut self, name: &str, public_key: &PublicKey) -> Result<()> {
        let known = {
            let tunnels = self.tunnels.read().await;
            let tunnel = tunnels
                .get(name)
                .ok_or_else(|| TunnelError::InterfaceNotFound(name.to_string()))?;
            tunnel.peers.contains_key(&public_key.to_base64())
        };

        if known {
            self.device.remove_peer(name, public_key).await?;
            let mut tunnels = self.tunnels.write().await;
            if let Some(tunnel) = tunnels.get_mut(name) {
                tunnel.peers.remove(&public_key.to_base64());
            }
        }
        Ok(())
    }

    /// Destroys an interface and all of its peers.
    ///
    /// Destroying an absent interface succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error only if the device fails to remove an existing
    /// interface.
    pub async fn destroy(&mut self, name: &str) -> Result<()> {
        let known = {
            let tunnels = self.tunnels.read().await;
            tunnels.contains_key(name)
        };

        if !known {
            debug!(interface = name, "destroy of absent interface, no-op");
            return Ok(());
        }

        self.device.destroy(name).await?;
        self.tunnels.write().await.remove(name);

        info!(interface = name, "destroyed tunnel interface");
        Ok(())
    }

    /// Returns the lifecycle phase of an interface.
    pub async fn phase(&self, name: &str) -> TunnelPhase {
        let tunnels = self.tunnels.read().await;
        match tunnels.get(name) {
            None => TunnelPhase::Absent,
            Some(t) if t.peers.is_empty() => TunnelPhase::Created,
            Some(_) => TunnelPhase::Peered,
        }
    }

    /// Returns the observable state of an interface.
    ///
    /// # Errors
    ///
    /// Returns an error if the interface does not exist.
    pub async fn status(&self, name: &str) -> Result<TunnelStatus> {
        let tunnels = self.tunnels.read().await;
        let tunnel = tunnels
            .get(name)
            .ok_or_else(|| TunnelError::InterfaceNotFound(name.to_string()))?;

        Ok(TunnelStatus {
            name: name.to_string(),
            public_key: tunnel.spec.public_key(),
            address: tunnel.spec.address,
            listen_port: tunnel.spec.listen_port,
            peers: tunnel.peers.values().cloned().collect(),
        })
    }

    /// Lists all managed interface names.
    pub async fn list(&self) -> Vec<String> {
        self.tunnels.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::FakeTunnelDevice;
    use crate::keys::{generate_keypair, PrivateKey};
    use ipnet::IpNet;

    fn net(s: &str) -> IpNet {
        s.parse().expect("valid cidr")
    }

    fn spec(name: &str) -> TunnelSpec {
        TunnelSpec::new(name, net("10.0.42.15/16"), PrivateKey::from_bytes_array([7u8; 32]), 42001)
    }

    fn manager() -> (TunnelManager<FakeTunnelDevice>, FakeTunnelDevice) {
        let device = FakeTunnelDevice::new();
        (TunnelManager::new(device.clone()), device)
    }

    #[tokio::test]
    async fn create_twice_identical_is_noop() {
        let (mut mgr, device) = manager();
        mgr.create(&spec("node-a")).await.expect("first create");
        mgr.create(&spec("node-a")).await.expect("second create");

        assert_eq!(device.interface_count().await, 1);
        assert_eq!(mgr.phase("node-a").await, TunnelPhase::Created);
    }

    #[tokio::test]
    async fn create_with_different_params_conflicts() {
        let (mut mgr, device) = manager();
        mgr.create(&spec("node-a")).await.expect("create");

        let mut other = spec("node-a");
        other.address = net("10.9.9.9/24");
        let result = mgr.create(&other).await;
        assert!(matches!(result, Err(TunnelError::Conflict { .. })));

        // Original state unchanged.
        assert_eq!(device.interface_count().await, 1);
        let status = mgr.status("node-a").await.expect("status");
        assert_eq!(status.address, net("10.0.42.15/16"));
    }

    #[tokio::test]
    async fn add_peer_is_idempotent_per_key() {
        let (mut mgr, device) = manager();
        mgr.create(&spec("node-a")).await.expect("create");

        let (_, public) = generate_keypair();
        let peer = TunnelPeer::new(public)
            .with_allowed_ip(net("0.0.0.0/0"))
            .with_persistent_keepalive(10);
        mgr.add_peer("node-a", &peer).await.expect("add");

        let replacement = TunnelPeer::new(public)
            .with_allowed_ip(net("10.0.0.0/8"))
            .with_persistent_keepalive(25);
        mgr.add_peer("node-a", &replacement).await.expect("replace");

        assert_eq!(device.peer_count("node-a").await, Some(1));
        let status = mgr.status("node-a").await.expect("status");
        assert_eq!(status.peers.len(), 1);
        assert_eq!(status.peers[0].persistent_keepalive, Some(25));
        assert_eq!(mgr.phase("node-a").await, TunnelPhase::Peered);
    }

    #[tokio::test]
    async fn add_peer_without_interface_fails() {
        let (mut mgr, _) = manager();
        let (_, public) = generate_keypair();
        let result = mgr.add_peer("node-a", &TunnelPeer::new(public)).await;
        assert!(matches!(result, Err(TunnelError::InterfaceNotFound(_))));
    }

    #[tokio::test]
    async fn destroy_absent_succeeds() {
        let (mut mgr, _) = manager();
        mgr.destroy("node-a").await.expect("destroy of absent");
        assert_eq!(mgr.phase("node-a").await, TunnelPhase::Absent);
    }

    #[tokio::test]
    async fn destroy_removes_interface_and_peers() {
        let (mut mgr, device) = manager();
        mgr.create(&spec("node-a")).await.expect("create");

        let (_, public) = generate_keypair();
        mgr.add_peer("node-a", &TunnelPeer::new(public).with_allowed_ip(net("0.0.0.0/0")))
            .await
            .expect("add");

        mgr.destroy("node-a").await.expect("destroy");
        assert_eq!(device.interface_count().await, 0);
        assert_eq!(mgr.phase("node-a").await, TunnelPhase::Absent);
    }

    #[tokio::test]
    async fn remove_unknown_peer_tolerated() {
        let (mut mgr, _) = manager();
        mgr.create(&spec("node-a")).await.expect("create");

        let (_, public) = generate_keypair();
        mgr.remove_peer("node-a", &public).await.expect("remove of unknown peer");
    }

    #[tokio::test]
    async fn device_failure_propagates_without_state_change() {
        let (mut mgr, device) = manager();
        device.fail_create(true).await;

        let result = mgr.create(&spec("node-a")).await;
        assert!(matches!(result, Err(TunnelError::Device(_))));
        assert_eq!(mgr.phase("node-a").await, TunnelPhase::Absent);
    }
}
