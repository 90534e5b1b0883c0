//! Policy routing and firewall application for Burrow.
//!
//! Forwarding traffic through a tunnel interface needs three kinds of host
//! state: a source-based policy rule, a route in the dedicated table, and
//! firewall entries (forward-accept, NAT masquerade). This crate applies
//! them in that order, reverses partially-applied sets on failure, and is
//! the sole writer of that host state.

pub mod applier;
pub mod error;
pub mod netops;
pub mod policy;

#[cfg(unix)]
pub mod sys;

pub use applier::{PolicyApplier, RevertOutcome};
pub use error::{Result, RoutingError};
pub use netops::{FakeNetOps, NetOps};
pub use policy::{
    FirewallChain, FirewallEntry, FirewallTarget, PolicyStep, RouteEntry, RoutingPolicy, RuleEntry,
};
