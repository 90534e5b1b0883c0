//! Ordered policy application with reverse-order rollback.

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, RoutingError};
use crate::netops::NetOps;
use crate::policy::{PolicyStep, RoutingPolicy};

/// Outcome of a [`PolicyApplier::revert`] call.
///
/// Already-absent entries count as removed; `failed` holds entries whose
/// removal errored and which may therefore still be installed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RevertOutcome {
    /// Entries removed from the host.
    pub removed: usize,
    /// Entries that were already gone.
    pub already_absent: usize,
    /// Entries whose removal failed.
    pub failed: Vec<PolicyStep>,
}

impl RevertOutcome {
    /// Returns whether every entry is confirmed gone.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

struct ApplierState<N> {
    ops: N,
    // Steps currently installed through this applier, in installation order.
    inventory: Vec<PolicyStep>,
}

/// Applies and reverts [`RoutingPolicy`] sets.
///
/// All mutations are serialized through one internal lock: the applier is
/// the sole writer of the host's rule/route/firewall state and never
/// interleaves two policy applications.
pub struct PolicyApplier<N: NetOps> {
    state: Mutex<ApplierState<N>>,
}

impl<N: NetOps> PolicyApplier<N> {
    /// Creates an applier over the given network operations.
    pub fn new(ops: N) -> Self {
        Self {
            state: Mutex::new(ApplierState {
                ops,
                inventory: Vec::new(),
            }),
        }
    }

    /// Installs the policy's steps in order (rules, routes, firewall).
    ///
    /// # Errors
    ///
    /// On the first failing step, every step already applied by this call is
    /// removed again in reverse order, and the returned
    /// [`RoutingError::PartialApply`] names the failing step plus any
    /// applied steps whose removal also failed.
    pub async fn apply(&self, policy: &RoutingPolicy) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut applied: Vec<PolicyStep> = Vec::new();

        for step in policy.steps() {
            match install(&mut state.ops, &step).await {
                Ok(()) => {
                    debug!(step = %step, "installed");
                    applied.push(step);
                }
                Err(e) => {
                    let cause = e.to_string();
                    warn!(step = %step, error = %cause, "policy step failed, rolling back");

                    let mut survivors = Vec::new();
                    for done in applied.iter().rev() {
                        if let Err(undo_err) = uninstall(&mut state.ops, done).await {
                            warn!(step = %done, error = %undo_err, "rollback step failed");
                            survivors.push(done.clone());
                        }
                    }
                    survivors.reverse();

                    return Err(RoutingError::PartialApply {
                        failed: step,
                        cause,
                        survivors,
                    });
                }
            }
        }

        state.inventory.extend(applied);
        info!(steps = policy.len(), "applied routing policy");
        Ok(())
    }

    /// Removes the policy's steps in reverse order.
    ///
    /// Entries that are already gone are tolerated; removal failures are
    /// collected in the outcome rather than aborting the rest of the
    /// teardown.
    pub async fn revert(&self, policy: &RoutingPolicy) -> RevertOutcome {
        let mut state = self.state.lock().await;
        let mut outcome = RevertOutcome::default();

        for step in policy.steps().into_iter().rev() {
            match uninstall_tolerant(&mut state.ops, &step).await {
                Ok(true) => outcome.removed += 1,
                Ok(false) => outcome.already_absent += 1,
                Err(e) => {
                    warn!(step = %step, error = %e, "revert step failed");
                    outcome.failed.push(step.clone());
                    continue;
                }
            }
            state.inventory.retain(|s| s != &step);
        }

        info!(
            removed = outcome.removed,
            already_absent = outcome.already_absent,
            failed = outcome.failed.len(),
            "reverted routing policy"
        );
        outcome
    }

    /// Returns the steps this applier currently believes are installed.
    pub async fn inventory(&self) -> Vec<PolicyStep> {
        self.state.lock().await.inventory.clone()
    }
}

async fn install<N: NetOps>(ops: &mut N, step: &PolicyStep) -> Result<()> {
    match step {
        PolicyStep::Rule(rule) => ops.add_rule(rule).await,
        PolicyStep::Route(route) => ops.add_route(route).await,
        PolicyStep::Firewall(entry) => ops.add_firewall(entry).await,
    }
}

async fn uninstall<N: NetOps>(ops: &mut N, step: &PolicyStep) -> Result<()> {
    uninstall_tolerant(ops, step).await.map(|_| ())
}

async fn uninstall_tolerant<N: NetOps>(ops: &mut N, step: &PolicyStep) -> Result<bool> {
    match step {
        PolicyStep::Rule(rule) => ops.remove_rule(rule).await,
        PolicyStep::Route(route) => ops.remove_route(route).await,
        PolicyStep::Firewall(entry) => ops.remove_firewall(entry).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netops::FakeNetOps;
    use crate::policy::{FirewallEntry, RoutingPolicy};
    use ipnet::IpNet;
    use std::net::IpAddr;

    fn net(s: &str) -> IpNet {
        s.parse().expect("valid cidr")
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().expect("valid ip")
    }

    fn client_policy() -> RoutingPolicy {
        RoutingPolicy::new()
            .with_rule(10, net("10.0.42.15/16"))
            .with_route(10, net("10.0.23.15/16"), ip("10.0.23.15"), "node-a")
            .with_firewall(FirewallEntry::masquerade("node-a"))
    }

    fn applier() -> (PolicyApplier<FakeNetOps>, FakeNetOps) {
        let ops = FakeNetOps::new();
        (PolicyApplier::new(ops.clone()), ops)
    }

    #[tokio::test]
    async fn apply_installs_in_order() {
        let (applier, ops) = applier();
        applier.apply(&client_policy()).await.expect("apply");

        let installed = ops.snapshot().await;
        assert_eq!(installed.len(), 3);
        assert!(matches!(installed[0], PolicyStep::Rule(_)));
        assert!(matches!(installed[1], PolicyStep::Route(_)));
        assert!(matches!(installed[2], PolicyStep::Firewall(_)));
        assert_eq!(applier.inventory().await, installed);
    }

    #[tokio::test]
    async fn failed_route_removes_installed_rule() {
        let (applier, ops) = applier();
        let policy = client_policy();
        ops.fail_add(PolicyStep::Route(policy.routes[0].clone())).await;

        let result = applier.apply(&policy).await;
        match result {
            Err(RoutingError::PartialApply { failed, survivors, .. }) => {
                assert!(matches!(failed, PolicyStep::Route(_)));
                assert!(survivors.is_empty());
            }
            other => panic!("expected PartialApply, got {other:?}"),
        }

        // The rule installed before the failing route is gone again.
        assert!(ops.snapshot().await.is_empty());
        assert!(applier.inventory().await.is_empty());
    }

    #[tokio::test]
    async fn rollback_failure_reports_survivors() {
        let (applier, ops) = applier();
        let policy = client_policy();
        ops.fail_add(PolicyStep::Firewall(policy.firewall[0].clone())).await;
        ops.fail_remove(PolicyStep::Rule(policy.rules[0].clone())).await;

        let result = applier.apply(&policy).await;
        match result {
            Err(RoutingError::PartialApply { survivors, .. }) => {
                assert_eq!(survivors.len(), 1);
                assert!(matches!(survivors[0], PolicyStep::Rule(_)));
            }
            other => panic!("expected PartialApply, got {other:?}"),
        }

        // Only the unremovable rule is left behind.
        let installed = ops.snapshot().await;
        assert_eq!(installed.len(), 1);
        assert!(matches!(installed[0], PolicyStep::Rule(_)));
    }

    #[tokio::test]
    async fn revert_restores_pre_apply_state() {
        let (applier, ops) = applier();
        let policy = client_policy();

        let before = ops.snapshot().await;
        applier.apply(&policy).await.expect("apply");
        let outcome = applier.revert(&policy).await;

        assert!(outcome.is_clean());
        assert_eq!(outcome.removed, 3);
        assert_eq!(ops.snapshot().await, before);
        assert!(applier.inventory().await.is_empty());
    }

    #[tokio::test]
    async fn revert_tolerates_missing_entries() {
        let (applier, _) = applier();
        let outcome = applier.revert(&client_policy()).await;
        assert!(outcome.is_clean());
        assert_eq!(outcome.already_absent, 3);
    }

    #[tokio::test]
    async fn revert_collects_failures_and_continues() {
        let (applier, ops) = applier();
        let policy = client_policy();
        applier.apply(&policy).await.expect("apply");

        ops.fail_remove(PolicyStep::Route(policy.routes[0].clone())).await;
        let outcome = applier.revert(&policy).await;

        assert!(!outcome.is_clean());
        assert_eq!(outcome.failed.len(), 1);
        // The rule behind the failing route was still removed.
        assert_eq!(outcome.removed, 2);
    }

    #[tokio::test]
    async fn apply_revert_roundtrip_various_sizes() {
        for extra_firewall in 0..5 {
            let (applier, ops) = applier();
            let mut policy = RoutingPolicy::new().with_rule(10, net("10.0.42.15/16"));
            for i in 0..extra_firewall {
                policy = policy.with_firewall(FirewallEntry::forward_accept(format!("dev{i}")));
            }

            applier.apply(&policy).await.expect("apply");
            let outcome = applier.revert(&policy).await;
            assert!(outcome.is_clean());
            assert!(ops.snapshot().await.is_empty());
        }
    }
}
