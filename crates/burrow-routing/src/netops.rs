//! Host network primitives behind a trait.
//!
//! The applier never touches the kernel directly; every rule, route and
//! firewall mutation goes through [`NetOps`]. Removal reports whether the
//! entry was actually present so callers can distinguish "removed" from
//! "already absent" (both are success).

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::{Result, RoutingError};
use crate::policy::{FirewallEntry, PolicyStep, RouteEntry, RuleEntry};

/// Side-effecting host network operations.
#[allow(async_fn_in_trait)]
pub trait NetOps {
    /// Installs a policy rule.
    async fn add_rule(&mut self, rule: &RuleEntry) -> Result<()>;

    /// Removes a policy rule. Returns `false` when it was already absent.
    async fn remove_rule(&mut self, rule: &RuleEntry) -> Result<bool>;

    /// Installs a route.
    async fn add_route(&mut self, route: &RouteEntry) -> Result<()>;

    /// Removes a route. Returns `false` when it was already absent.
    async fn remove_route(&mut self, route: &RouteEntry) -> Result<bool>;

    /// Installs a firewall rule.
    async fn add_firewall(&mut self, entry: &FirewallEntry) -> Result<()>;

    /// Removes a firewall rule. Returns `false` when it was already absent.
    async fn remove_firewall(&mut self, entry: &FirewallEntry) -> Result<bool>;
}

#[derive(Debug, Default)]
struct FakeState {
    installed: Vec<PolicyStep>,
    fail_add: HashSet<PolicyStep>,
    fail_remove: HashSet<PolicyStep>,
}

/// In-memory network operations for tests, with failure injection.
#[derive(Clone, Default)]
pub struct FakeNetOps {
    state: Arc<RwLock<FakeState>>,
}

impl FakeNetOps {
    /// Creates empty fake host state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes installing the given step fail.
    pub async fn fail_add(&self, step: PolicyStep) {
        self.state.write().await.fail_add.insert(step);
    }

    /// Makes removing the given step fail.
    pub async fn fail_remove(&self, step: PolicyStep) {
        self.state.write().await.fail_remove.insert(step);
    }

    /// Clears every injected failure.
    pub async fn clear_failures(&self) {
        let mut state = self.state.write().await;
        state.fail_add.clear();
        state.fail_remove.clear();
    }

    /// Returns the installed steps in installation order.
    pub async fn snapshot(&self) -> Vec<PolicyStep> {
        self.state.read().await.installed.clone()
    }

    /// Returns whether the given step is currently installed.
    pub async fn contains(&self, step: &PolicyStep) -> bool {
        self.state.read().await.installed.contains(step)
    }

    async fn install(&self, step: PolicyStep) -> Result<()> {
        let mut state = self.state.write().await;
        if state.fail_add.contains(&step) {
            return Err(RoutingError::Ops(format!("injected failure installing {step}")));
        }
        if !state.installed.contains(&step) {
            state.installed.push(step);
        }
        Ok(())
    }

    async fn uninstall(&self, step: &PolicyStep) -> Result<bool> {
        let mut state = self.state.write().await;
        if state.fail_remove.contains(step) {
            return Err(RoutingError::Ops(format!("injected failure removing {step}")));
        }
        let before = state.installed.len();
        state.installed.retain(|s| s != step);
        Ok(state.installed.len() != before)
    }
}

impl NetOps for FakeNetOps {
    async fn add_rule(&mut self, rule: &RuleEntry) -> Result<()> {
        self.install(PolicyStep::Rule(rule.clone())).await
    }

    async fn remove_rule(&mut self, rule: &RuleEntry) -> Result<bool> {
        self.uninstall(&PolicyStep::Rule(rule.clone())).await
    }

    async fn add_route(&mut self, route: &RouteEntry) -> Result<()> {
        self.install(PolicyStep::Route(route.clone())).await
    }

    async fn remove_route(&mut self, route: &RouteEntry) -> Result<bool> {
        self.uninstall(&PolicyStep::Route(route.clone())).await
    }

    async fn add_firewall(&mut self, entry: &FirewallEntry) -> Result<()> {
        self.install(PolicyStep::Firewall(entry.clone())).await
    }

    async fn remove_firewall(&mut self, entry: &FirewallEntry) -> Result<bool> {
        self.uninstall(&PolicyStep::Firewall(entry.clone())).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipnet::IpNet;

    fn rule() -> RuleEntry {
        RuleEntry {
            table: 10,
            src: "10.0.42.15/16".parse::<IpNet>().expect("valid cidr"),
        }
    }

    #[tokio::test]
    async fn add_then_remove() {
        let mut ops = FakeNetOps::new();
        ops.add_rule(&rule()).await.expect("add");
        assert!(ops.contains(&PolicyStep::Rule(rule())).await);

        let removed = ops.remove_rule(&rule()).await.expect("remove");
        assert!(removed);
        assert!(ops.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn remove_absent_reports_false() {
        let mut ops = FakeNetOps::new();
        let removed = ops.remove_rule(&rule()).await.expect("remove");
        assert!(!removed);
    }

    #[tokio::test]
    async fn injected_add_failure() {
        let mut ops = FakeNetOps::new();
        ops.fail_add(PolicyStep::Rule(rule())).await;
        assert!(ops.add_rule(&rule()).await.is_err());
        assert!(ops.snapshot().await.is_empty());
    }
}
