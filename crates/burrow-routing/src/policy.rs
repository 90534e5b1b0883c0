//! Routing policy data model.

use std::fmt;
use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

/// A source-based policy routing rule: traffic from `src` uses `table`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleEntry {
    /// Routing table id.
    pub table: u32,
    /// Source network the rule matches.
    pub src: IpNet,
}

impl fmt::Display for RuleEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rule(table {} src {})", self.table, self.src)
    }
}

/// A route inside a dedicated table.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteEntry {
    /// Routing table id.
    pub table: u32,
    /// Destination network.
    pub dst: IpNet,
    /// Next-hop gateway.
    pub gateway: IpAddr,
    /// Output interface.
    pub dev: String,
}

impl fmt::Display for RouteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "route(table {} dst {} via {} dev {})",
            self.table, self.dst, self.gateway, self.dev
        )
    }
}

/// Firewall chain a rule is inserted into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FirewallChain {
    /// filter/FORWARD.
    Forward,
    /// nat/POSTROUTING.
    NatPostrouting,
}

impl fmt::Display for FirewallChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forward => write!(f, "FORWARD"),
            Self::NatPostrouting => write!(f, "POSTROUTING"),
        }
    }
}

/// Firewall rule target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FirewallTarget {
    /// ACCEPT the matched traffic.
    Accept,
    /// Source-NAT the matched traffic behind the output interface.
    Masquerade,
}

impl fmt::Display for FirewallTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accept => write!(f, "ACCEPT"),
            Self::Masquerade => write!(f, "MASQUERADE"),
        }
    }
}

/// A firewall rule matched on output interface.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FirewallEntry {
    /// Chain the rule lives in.
    pub chain: FirewallChain,
    /// Output interface match.
    pub out_interface: String,
    /// Rule target.
    pub target: FirewallTarget,
}

impl FirewallEntry {
    /// A forward-accept rule for traffic egressing `dev`.
    #[must_use]
    pub fn forward_accept(dev: impl Into<String>) -> Self {
        Self {
            chain: FirewallChain::Forward,
            out_interface: dev.into(),
            target: FirewallTarget::Accept,
        }
    }

    /// A NAT masquerade rule for traffic egressing `dev`.
    #[must_use]
    pub fn masquerade(dev: impl Into<String>) -> Self {
        Self {
            chain: FirewallChain::NatPostrouting,
            out_interface: dev.into(),
            target: FirewallTarget::Masquerade,
        }
    }
}

impl fmt::Display for FirewallEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "firewall({} -o {} -j {})",
            self.chain, self.out_interface, self.target
        )
    }
}

/// A single installable step of a policy, in application order.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PolicyStep {
    /// Policy rule installation.
    Rule(RuleEntry),
    /// Route installation.
    Route(RouteEntry),
    /// Firewall rule installation.
    Firewall(FirewallEntry),
}

impl fmt::Display for PolicyStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rule(r) => write!(f, "{r}"),
            Self::Route(r) => write!(f, "{r}"),
            Self::Firewall(r) => write!(f, "{r}"),
        }
    }
}

/// An ordered set of routing state required to forward traffic through a
/// tunnel interface.
///
/// Steps apply rule-first, then routes, then firewall entries; within the
/// firewall set, forward-accept entries precede NAT entries. Reversal walks
/// the same sequence backwards.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingPolicy {
    /// Policy rules, in order.
    pub rules: Vec<RuleEntry>,
    /// Routes, in order.
    pub routes: Vec<RouteEntry>,
    /// Firewall entries, in order.
    pub firewall: Vec<FirewallEntry>,
}

impl RoutingPolicy {
    /// Creates an empty policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a policy rule.
    #[must_use]
    pub fn with_rule(mut self, table: u32, src: IpNet) -> Self {
        self.rules.push(RuleEntry { table, src });
        self
    }

    /// Adds a route.
    #[must_use]
    pub fn with_route(mut self, table: u32, dst: IpNet, gateway: IpAddr, dev: impl Into<String>) -> Self {
        self.routes.push(RouteEntry {
            table,
            dst,
            gateway,
            dev: dev.into(),
        });
        self
    }

    /// Adds a firewall entry.
    #[must_use]
    pub fn with_firewall(mut self, entry: FirewallEntry) -> Self {
        self.firewall.push(entry);
        self
    }

    /// Returns all steps in application order.
    #[must_use]
    pub fn steps(&self) -> Vec<PolicyStep> {
        self.rules
            .iter()
            .cloned()
            .map(PolicyStep::Rule)
            .chain(self.routes.iter().cloned().map(PolicyStep::Route))
            .chain(self.firewall.iter().cloned().map(PolicyStep::Firewall))
            .collect()
    }

    /// Returns the total number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len() + self.routes.len() + self.firewall.len()
    }

    /// Returns whether the policy has no steps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
