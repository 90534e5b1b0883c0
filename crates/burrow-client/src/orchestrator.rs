//! The staged provisioning run.

use std::net::IpAddr;
use std::time::Duration;

use burrow_bus::messages::{
    procedures, CloseRequest, GatewayRequest, GatewayResponse, StatusResponse,
};
use burrow_bus::{BusSession, BusTransport, SessionState, TlsIdentity};
use burrow_routing::{FirewallEntry, NetOps, PolicyApplier, RoutingPolicy};
use burrow_settings::ResolvedSettings;
use burrow_tunnel::{Endpoint, PublicKey, TunnelDevice, TunnelManager, TunnelPeer, TunnelSpec};
use ipnet::IpNet;
use serde_json::json;
use tracing::{info, warn};

use crate::error::{ProvisioningError, Stage};

type StageResult<T> = std::result::Result<T, (Stage, String)>;

/// Runs the provisioning stages against a gateway and the local host.
pub struct Orchestrator<T: BusTransport, D: TunnelDevice + Clone, N: NetOps> {
    settings: ResolvedSettings,
    identity: TlsIdentity,
    session: BusSession<T>,
    tunnels: TunnelManager<D>,
    routing: PolicyApplier<N>,
    gateway_committed: bool,
    tunnel_created: bool,
    applied_policy: Option<RoutingPolicy>,
}

impl<T: BusTransport, D: TunnelDevice + Clone, N: NetOps> Orchestrator<T, D, N> {
    /// Creates an orchestrator over the given collaborators.
    pub fn new(
        settings: ResolvedSettings,
        identity: TlsIdentity,
        transport: T,
        device: D,
        ops: N,
    ) -> Self {
        Self {
            settings,
            identity,
            session: BusSession::new(transport),
            tunnels: TunnelManager::new(device),
            routing: PolicyApplier::new(ops),
            gateway_committed: false,
            tunnel_created: false,
            applied_policy: None,
        }
    }

    /// Runs all stages once.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisioningError`] naming the failed stage. Before the
    /// error surfaces, applied steps are rolled back in reverse order:
    /// routing is reverted, the local tunnel destroyed, and the gateway
    /// asked to close its side if it had committed. Rollback steps that
    /// fail are recorded in the error, never silently dropped.
    pub async fn provision(&mut self) -> std::result::Result<GatewayResponse, ProvisioningError> {
        match self.run().await {
            Ok(gateway) => {
                info!(
                    device_id = %self.settings.device_id,
                    gateway = %gateway.gateway_endpoint,
                    "provisioning complete"
                );
                Ok(gateway)
            }
            Err((stage, message)) => {
                warn!(%stage, message, "provisioning failed, rolling back");
                let rollback_failures = self.rollback().await;
                Err(ProvisioningError {
                    stage,
                    message,
                    rollback_failures,
                })
            }
        }
    }

    fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.provisioning.call_timeout_secs)
    }

    async fn run(&mut self) -> StageResult<GatewayResponse> {
        self.session
            .connect(&self.settings.bus.broker_url, &self.identity)
            .await
            .map_err(|e| (Stage::Connect, e.to_string()))?;

        self.session
            .join(&self.settings.bus.realm)
            .await
            .map_err(|e| (Stage::Join, e.to_string()))?;

        let gateway = self.request_gateway().await?;
        self.gateway_committed = true;

        let gateway_ip = self.build_tunnel(&gateway).await?;
        self.install_routing(gateway_ip).await?;
        self.verify_status().await?;

        self.session
            .leave()
            .await
            .map_err(|e| (Stage::Leave, e.to_string()))?;

        Ok(gateway)
    }

    async fn request_gateway(&mut self) -> StageResult<GatewayResponse> {
        let stage = Stage::RequestGateway;
        let wg = &self.settings.wireguard;
        let request = GatewayRequest {
            device_id: self.settings.device_id.clone(),
            public_key: wg.public_key.to_base64(),
            address: wg.address.to_string(),
            network: wg
                .network_name
                .clone()
                .unwrap_or_else(|| self.settings.bus.realm.clone()),
        };

        let args = serde_json::to_value(&request).map_err(|e| (stage, e.to_string()))?;
        let timeout = self.call_timeout();
        let reply = self
            .session
            .call(procedures::REQUEST_GATEWAY, args, timeout)
            .await
            .map_err(|e| (stage, e.to_string()))?;

        serde_json::from_value(reply)
            .map_err(|e| (stage, format!("malformed gateway response: {e}")))
    }

    /// Brings up the local interface and returns the gateway's tunnel IP.
    async fn build_tunnel(&mut self, gateway: &GatewayResponse) -> StageResult<IpAddr> {
        let stage = Stage::Tunnel;
        let wg = &self.settings.wireguard;

        let spec = TunnelSpec::new(
            &self.settings.device_id,
            wg.address,
            wg.private_key.clone(),
            self.settings.provisioning.listen_port,
        );
        self.tunnels
            .create(&spec)
            .await
            .map_err(|e| (stage, e.to_string()))?;
        self.tunnel_created = true;

        let gateway_ip: IpAddr = gateway.gateway_endpoint.parse().map_err(|_| {
            (
                stage,
                format!("gateway endpoint '{}' is not an address", gateway.gateway_endpoint),
            )
        })?;
        let gateway_key = PublicKey::from_base64(&gateway.gateway_public_key)
            .map_err(|e| (stage, e.to_string()))?;
        let default_net: IpNet = "0.0.0.0/0".parse().map_err(|_| {
            (stage, "default network literal".to_owned())
        })?;

        // All traffic is allowed through the gateway peer; selection of what
        // actually uses the tunnel happens in the routing stage.
        let peer = TunnelPeer::new(gateway_key)
            .with_allowed_ip(default_net)
            .with_endpoint(Endpoint::from_ip_port(gateway_ip, gateway.gateway_listen_port))
            .with_persistent_keepalive(self.settings.provisioning.keepalive_secs);
        self.tunnels
            .add_peer(&self.settings.device_id, &peer)
            .await
            .map_err(|e| (stage, e.to_string()))?;

        Ok(gateway_ip)
    }

    async fn install_routing(&mut self, gateway_ip: IpAddr) -> StageResult<()> {
        let stage = Stage::Routing;
        let wg = &self.settings.wireguard;
        let table = self.settings.provisioning.route_table;

        let gateway_net = IpNet::new(gateway_ip, wg.address.prefix_len())
            .map_err(|e| (stage, e.to_string()))?
            .trunc();

        let policy = RoutingPolicy::new()
            .with_rule(table, wg.address)
            .with_route(table, gateway_net, gateway_ip, &self.settings.device_id)
            .with_firewall(FirewallEntry::masquerade(&self.settings.device_id));

        self.routing
            .apply(&policy)
            .await
            .map_err(|e| (stage, e.to_string()))?;
        self.applied_policy = Some(policy);
        Ok(())
    }

    async fn verify_status(&mut self) -> StageResult<()> {
        let stage = Stage::RequestStatus;
        let timeout = self.call_timeout();
        let reply = self
            .session
            .call(procedures::REQUEST_STATUS, json!({}), timeout)
            .await
            .map_err(|e| (stage, e.to_string()))?;

        let status: StatusResponse = serde_json::from_value(reply)
            .map_err(|e| (stage, format!("malformed status response: {e}")))?;
        if status.present {
            Ok(())
        } else {
            Err((stage, "gateway reports no interface for this device".to_owned()))
        }
    }

    /// Reverse-order teardown of everything this run applied.
    async fn rollback(&mut self) -> Vec<String> {
        let mut failures = Vec::new();

        if let Some(policy) = self.applied_policy.take() {
            let outcome = self.routing.revert(&policy).await;
            for step in outcome.failed {
                failures.push(format!("routing: {step} still installed"));
            }
        }

        if self.tunnel_created {
            match self.tunnels.destroy(&self.settings.device_id).await {
                Ok(()) => self.tunnel_created = false,
                Err(e) => failures.push(format!("tunnel: {e}")),
            }
        }

        if self.gateway_committed {
            if self.session.state() == SessionState::Joined {
                let close = CloseRequest {
                    device_id: self.settings.device_id.clone(),
                };
                let timeout = self.call_timeout();
                let result = match serde_json::to_value(&close) {
                    Ok(args) => self
                        .session
                        .call(procedures::CLOSE_INTERFACE, args, timeout)
                        .await
                        .map(|_| ()),
                    Err(e) => Err(burrow_bus::BusError::Codec(e.to_string())),
                };
                match result {
                    Ok(()) => self.gateway_committed = false,
                    Err(e) => failures.push(format!("close_interface: {e}")),
                }
            } else {
                failures.push(
                    "close_interface: session no longer joined, gateway state left behind"
                        .to_owned(),
                );
            }
        }

        if self.session.state() == SessionState::Joined {
            let _ = self.session.leave().await;
        }

        failures
    }
}
