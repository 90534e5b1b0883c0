//! Tunnel interface lifecycle management for Burrow.
//!
//! This crate owns the idempotent create/destroy state transitions for
//! encrypted tunnel interfaces and their peer sets. The same lifecycle logic
//! runs on both the client and the gateway; the kernel-facing side effects
//! sit behind the [`TunnelDevice`] trait.

pub mod device;
pub mod error;
pub mod keys;
pub mod manager;
pub mod types;

#[cfg(unix)]
pub mod sys;

pub use device::{FakeTunnelDevice, TunnelDevice};
pub use error::{Result, TunnelError};
pub use keys::{generate_keypair, KeyPair, PrivateKey, PublicKey, KEY_SIZE};
pub use manager::{TunnelManager, TunnelPhase};
pub use types::{Endpoint, TunnelPeer, TunnelSpec, TunnelStatus};
