//! Kernel-facing tunnel device operations.
//!
//! The lifecycle manager drives a [`TunnelDevice`] for every side effect.
//! Production code wires in a real implementation (see [`crate::sys`]);
//! tests use [`FakeTunnelDevice`].

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::{Result, TunnelError};
use crate::keys::PublicKey;
use crate::types::{TunnelPeer, TunnelSpec};

/// Raw tunnel device operations.
///
/// Implementations mirror kernel semantics: creating an existing interface
/// or removing a missing one is an error. Idempotence is layered on top by
/// the [`crate::manager::TunnelManager`].
#[allow(async_fn_in_trait)]
pub trait TunnelDevice {
    /// Creates a new tunnel interface.
    async fn create(&mut self, spec: &TunnelSpec) -> Result<()>;

    /// Destroys a tunnel interface.
    async fn destroy(&mut self, name: &str) -> Result<()>;

    /// Adds or replaces a peer on an interface.
    async fn set_peer(&mut self, name: &str, peer: &TunnelPeer) -> Result<()>;

    /// Removes a peer from an interface.
    async fn remove_peer(&mut self, name: &str, public_key: &PublicKey) -> Result<()>;

    /// Checks whether an interface exists.
    async fn exists(&self, name: &str) -> bool;
}

#[derive(Clone, Debug, Default)]
struct FailureFlags {
    create: bool,
    destroy: bool,
    set_peer: bool,
}

#[derive(Clone, Debug)]
struct FakeInterface {
    spec: TunnelSpec,
    peers: HashMap<String, TunnelPeer>,
}

/// An in-memory tunnel device for tests.
#[derive(Clone)]
pub struct FakeTunnelDevice {
    interfaces: Arc<RwLock<HashMap<String, FakeInterface>>>,
    failures: Arc<RwLock<FailureFlags>>,
}

impl FakeTunnelDevice {
    /// Creates a new fake device with no interfaces.
    #[must_use]
    pub fn new() -> Self {
        Self {
            interfaces: Arc::new(RwLock::new(HashMap::new())),
            failures: Arc::new(RwLock::new(FailureFlags::default())),
        }
    }

    /// Makes subsequent `create` calls fail.
    pub async fn fail_create(&self, fail: bool) {
        self.failures.write().await.create = fail;
    }

    /// Makes subsequent `destroy` calls fail.
    pub async fn fail_destroy(&self, fail: bool) {
        self.failures.write().await.destroy = fail;
    }

    /// Makes subsequent `set_peer` calls fail.
    pub async fn fail_set_peer(&self, fail: bool) {
        self.failures.write().await.set_peer = fail;
    }

    /// Returns the number of interfaces currently present.
    pub async fn interface_count(&self) -> usize {
        self.interfaces.read().await.len()
    }

    /// Returns the number of peers on an interface.
    pub async fn peer_count(&self, name: &str) -> Option<usize> {
        self.interfaces.read().await.get(name).map(|i| i.peers.len())
    }
}

impl Default for FakeTunnelDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelDevice for FakeTunnelDevice {
    async fn create(&mut self, spec: &TunnelSpec) -> Result<()> {
        if self.failures.read().await.create {
            return Err(TunnelError::Device("injected create failure".to_string()));
        }

        let mut interfaces = self.interfaces.write().await;
        if interfaces.contains_key(&spec.name) {
            return Err(TunnelError::Device(format!(
                "interface '{}' already present on host",
                spec.name
            )));
        }

        interfaces.insert(
            spec.name.clone(),
            FakeInterface {
                spec: spec.clone(),
                peers: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn destroy(&mut self, name: &str) -> Result<()> {
        if self.failures.read().await.destroy {
            return Err(TunnelError::Device("injected destroy failure".to_string()));
        }

        let mut interfaces = self.interfaces.write().await;
        if interfaces.remove(name).is_none() {
            return Err(TunnelError::InterfaceNotFound(name.to_string()));
        }
        Ok(())
    }

    async fn set_peer(&mut self, name: &str, peer: &TunnelPeer) -> Result<()> {
        if self.failures.read().await.set_peer {
            return Err(TunnelError::Device("injected set_peer failure".to_string()));
        }

        let mut interfaces = self.interfaces.write().await;
        let interface = interfaces
            .get_mut(name)
            .ok_or_else(|| TunnelError::InterfaceNotFound(name.to_string()))?;

        interface
            .peers
            .insert(peer.public_key.to_base64(), peer.clone());
        Ok(())
    }

    async fn remove_peer(&mut self, name: &str, public_key: &PublicKey) -> Result<()> {
        let mut interfaces = self.interfaces.write().await;
        let interface = interfaces
            .get_mut(name)
            .ok_or_else(|| TunnelError::InterfaceNotFound(name.to_string()))?;

        interface.peers.remove(&public_key.to_base64());
        Ok(())
    }

    async fn exists(&self, name: &str) -> bool {
        self.interfaces.read().await.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{generate_keypair, PrivateKey};

    fn spec(name: &str) -> TunnelSpec {
        TunnelSpec::new(
            name,
            "10.0.42.15/16".parse().expect("valid cidr"),
            PrivateKey::generate(),
            42001,
        )
    }

    #[tokio::test]
    async fn create_and_exists() {
        let mut dev = FakeTunnelDevice::new();
        dev.create(&spec("node-a")).await.expect("create");
        assert!(dev.exists("node-a").await);
        assert_eq!(dev.interface_count().await, 1);
    }

    #[tokio::test]
    async fn duplicate_create_fails() {
        let mut dev = FakeTunnelDevice::new();
        dev.create(&spec("node-a")).await.expect("create");
        assert!(dev.create(&spec("node-a")).await.is_err());
    }

    #[tokio::test]
    async fn destroy_missing_fails() {
        let mut dev = FakeTunnelDevice::new();
        assert!(matches!(
            dev.destroy("node-a").await,
            Err(TunnelError::InterfaceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn set_peer_replaces_by_key() {
        let mut dev = FakeTunnelDevice::new();
        dev.create(&spec("node-a")).await.expect("create");

        let (_, public) = generate_keypair();
        let peer = TunnelPeer::new(public).with_persistent_keepalive(10);
        dev.set_peer("node-a", &peer).await.expect("set");
        dev.set_peer("node-a", &peer.clone().with_persistent_keepalive(25))
            .await
            .expect("replace");

        assert_eq!(dev.peer_count("node-a").await, Some(1));
    }

    #[tokio::test]
    async fn injected_failures_surface() {
        let mut dev = FakeTunnelDevice::new();
        dev.fail_create(true).await;
        assert!(matches!(
            dev.create(&spec("node-a")).await,
            Err(TunnelError::Device(_))
        ));
    }
}
