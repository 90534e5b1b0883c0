//! Host network operations backed by `ip` and `iptables`.
//!
//! Requires root (or CAP_NET_ADMIN). Removal treats "no such entry"
//! failures from the tools as already-absent.

use tokio::process::Command;
use tracing::debug;

use crate::error::{Result, RoutingError};
use crate::netops::NetOps;
use crate::policy::{FirewallChain, FirewallEntry, FirewallTarget, RouteEntry, RuleEntry};

/// Network operations that shell out to `ip` / `iptables`.
#[derive(Clone, Debug, Default)]
pub struct SysNetOps;

impl SysNetOps {
    /// Creates host-backed network operations.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

const ABSENT_MARKERS: [&str; 4] = [
    "No such file or directory",
    "No such process",
    "does not exist",
    "Bad rule",
];

async fn run(program: &str, args: &[String]) -> Result<()> {
    debug!(program, ?args, "running network command");
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| RoutingError::Ops(format!("failed to execute {program}: {e}")))?;

    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(RoutingError::Ops(format!(
            "{program} {} failed: {}",
            args.join(" "),
            stderr.trim()
        )))
    }
}

// Removal variant: absence of the entry counts as success.
async fn run_removal(program: &str, args: &[String]) -> Result<bool> {
    match run(program, args).await {
        Ok(()) => Ok(true),
        Err(RoutingError::Ops(msg)) if ABSENT_MARKERS.iter().any(|m| msg.contains(m)) => Ok(false),
        Err(e) => Err(e),
    }
}

fn rule_args(action: &str, rule: &RuleEntry) -> Vec<String> {
    vec![
        "rule".into(),
        action.into(),
        "table".into(),
        rule.table.to_string(),
        "from".into(),
        rule.src.to_string(),
    ]
}

fn route_args(action: &str, route: &RouteEntry) -> Vec<String> {
    vec![
        "route".into(),
        action.into(),
        route.dst.to_string(),
        "via".into(),
        route.gateway.to_string(),
        "dev".into(),
        route.dev.clone(),
        "table".into(),
        route.table.to_string(),
    ]
}

fn firewall_args(action: &str, entry: &FirewallEntry) -> Vec<String> {
    let (table, chain) = match entry.chain {
        FirewallChain::Forward => ("filter", "FORWARD"),
        FirewallChain::NatPostrouting => ("nat", "POSTROUTING"),
    };
    let target = match entry.target {
        FirewallTarget::Accept => "ACCEPT",
        FirewallTarget::Masquerade => "MASQUERADE",
    };
    vec![
        "-t".into(),
        table.into(),
        action.into(),
        chain.into(),
        "-o".into(),
        entry.out_interface.clone(),
        "-j".into(),
        target.into(),
    ]
}

impl NetOps for SysNetOps {
    async fn add_rule(&mut self, rule: &RuleEntry) -> Result<()> {
        run("ip", &rule_args("add", rule)).await
    }

    async fn remove_rule(&mut self, rule: &RuleEntry) -> Result<bool> {
        run_removal("ip", &rule_args("del", rule)).await
    }

    async fn add_route(&mut self, route: &RouteEntry) -> Result<()> {
        run("ip", &route_args("add", route)).await
    }

    async fn remove_route(&mut self, route: &RouteEntry) -> Result<bool> {
        run_removal("ip", &route_args("del", route)).await
    }

    async fn add_firewall(&mut self, entry: &FirewallEntry) -> Result<()> {
        run("iptables", &firewall_args("-I", entry)).await
    }

    async fn remove_firewall(&mut self, entry: &FirewallEntry) -> Result<bool> {
        run_removal("iptables", &firewall_args("-D", entry)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipnet::IpNet;

    #[test]
    fn rule_args_shape() {
        let rule = RuleEntry {
            table: 10,
            src: "10.0.42.15/16".parse::<IpNet>().expect("valid cidr"),
        };
        assert_eq!(
            rule_args("add", &rule),
            vec!["rule", "add", "table", "10", "from", "10.0.42.15/16"]
        );
    }

    #[test]
    fn firewall_args_pick_table_and_chain() {
        let nat = FirewallEntry::masquerade("node-a");
        assert_eq!(
            firewall_args("-I", &nat),
            vec!["-t", "nat", "-I", "POSTROUTING", "-o", "node-a", "-j", "MASQUERADE"]
        );

        let fwd = FirewallEntry::forward_accept("node-a");
        assert_eq!(
            firewall_args("-D", &fwd),
            vec!["-t", "filter", "-D", "FORWARD", "-o", "node-a", "-j", "ACCEPT"]
        );
    }
}
