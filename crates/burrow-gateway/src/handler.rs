//! Provisioning call handlers.

use std::collections::HashMap;
use std::sync::Arc;

use burrow_bus::messages::{GatewayRequest, GatewayResponse, StatusResponse};
use burrow_routing::{FirewallEntry, NetOps, PolicyApplier, RoutingPolicy};
use burrow_tunnel::{
    generate_keypair, PublicKey, TunnelDevice, TunnelError, TunnelManager, TunnelPeer, TunnelSpec,
};
use ipnet::IpNet;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};

/// State committed for one device's open interface.
#[derive(Debug, Clone)]
struct DeviceSession {
    request: GatewayRequest,
    reply: GatewayResponse,
    policy: RoutingPolicy,
}

type SessionSlot = Arc<Mutex<Option<DeviceSession>>>;

/// Serves `open_interface`, `close_interface` and `request_status`.
///
/// Work for one device id is serialized through that device's session
/// slot; distinct devices proceed concurrently. A committed session is the
/// idempotency record: replaying the identical request returns the stored
/// reply, a diverging request is a conflict.
pub struct GatewayRpcHandler<D: TunnelDevice + Clone, N: NetOps> {
    config: GatewayConfig,
    tunnels: TunnelManager<D>,
    routing: PolicyApplier<N>,
    sessions: Mutex<HashMap<String, SessionSlot>>,
    uplink_nat: Mutex<bool>,
}

impl<D: TunnelDevice + Clone, N: NetOps> GatewayRpcHandler<D, N> {
    /// Creates a handler over the given side-effect implementations.
    pub fn new(config: GatewayConfig, device: D, ops: N) -> Self {
        Self {
            config,
            tunnels: TunnelManager::new(device),
            routing: PolicyApplier::new(ops),
            sessions: Mutex::new(HashMap::new()),
            uplink_nat: Mutex::new(false),
        }
    }

    async fn slot(&self, device_id: &str) -> SessionSlot {
        let mut sessions = self.sessions.lock().await;
        Arc::clone(
            sessions
                .entry(device_id.to_owned())
                .or_insert_with(|| Arc::new(Mutex::new(None))),
        )
    }

    /// Drops the device's slot from the map once no other task holds it.
    ///
    /// New handles are only cloned out of the map under the sessions lock,
    /// so the count check cannot race a concurrent `slot` call.
    async fn prune_slot(&self, device_id: &str, slot: &SessionSlot) {
        let mut sessions = self.sessions.lock().await;
        if let Some(entry) = sessions.get(device_id) {
            if Arc::ptr_eq(entry, slot) && Arc::strong_count(entry) == 2 {
                sessions.remove(device_id);
            }
        }
    }

    /// Installs the uplink masquerade once for the handler's lifetime.
    ///
    /// The NAT rule is shared by every provisioned device and therefore
    /// never part of a per-device session policy.
    async fn ensure_uplink_nat(&self) -> Result<()> {
        let mut installed = self.uplink_nat.lock().await;
        if *installed {
            return Ok(());
        }

        let nat = RoutingPolicy::new()
            .with_firewall(FirewallEntry::masquerade(&self.config.uplink_interface));
        self.routing.apply(&nat).await?;
        info!(uplink = %self.config.uplink_interface, "installed uplink masquerade");
        *installed = true;
        Ok(())
    }

    /// Opens the gateway side of a device's tunnel.
    ///
    /// Generates an ephemeral keypair for the interface (never the gateway's
    /// bus identity key), creates the interface named after the device, adds
    /// the device as its peer, and installs its forwarding rule. The shared
    /// uplink masquerade is ensured on first use and survives every close.
    /// Everything this call created is removed again if a later step fails.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Conflict`] when a committed session for the device
    /// has different parameters; tunnel and routing failures propagate.
    pub async fn open_interface(&self, request: GatewayRequest) -> Result<GatewayResponse> {
        let slot = self.slot(&request.device_id).await;
        let mut session = slot.lock().await;

        if let Some(committed) = session.as_ref() {
            if committed.request == request {
                debug!(device_id = %request.device_id, "identical request, replaying reply");
                return Ok(committed.reply.clone());
            }
            return Err(GatewayError::Conflict {
                device_id: request.device_id.clone(),
                detail: "parameters differ from the committed session".to_owned(),
            });
        }

        let peer_key = PublicKey::from_base64(&request.public_key)
            .map_err(|e| GatewayError::BadRequest(format!("public_key: {e}")))?;
        let peer_address: IpNet = request
            .address
            .parse()
            .map_err(|e| GatewayError::BadRequest(format!("address: {e}")))?;

        self.ensure_uplink_nat().await?;

        let (private, public) = generate_keypair();
        let spec = TunnelSpec::new(
            &request.device_id,
            self.config.tunnel_address,
            private,
            self.config.listen_port,
        );

        let mut tunnels = self.tunnels.clone();
        tunnels.create(&spec).await?;

        // Only the device's own host address is routable back through the
        // tunnel.
        let peer = TunnelPeer::new(peer_key)
            .with_allowed_ip(IpNet::from(peer_address.addr()))
            .with_persistent_keepalive(self.config.keepalive_secs);
        if let Err(e) = tunnels.add_peer(&request.device_id, &peer).await {
            warn!(device_id = %request.device_id, error = %e, "peer setup failed, rolling back");
            let _ = tunnels.destroy(&request.device_id).await;
            return Err(e.into());
        }

        let policy =
            RoutingPolicy::new().with_firewall(FirewallEntry::forward_accept(&request.device_id));
        if let Err(e) = self.routing.apply(&policy).await {
            warn!(device_id = %request.device_id, error = %e, "routing failed, rolling back");
            let _ = tunnels.destroy(&request.device_id).await;
            return Err(e.into());
        }

        let reply = GatewayResponse {
            gateway_public_key: public.to_base64(),
            gateway_endpoint: self.config.endpoint.clone(),
            gateway_listen_port: self.config.listen_port,
        };

        info!(
            device_id = %request.device_id,
            network = %request.network,
            "opened gateway interface"
        );
        *session = Some(DeviceSession {
            request,
            reply: reply.clone(),
            policy,
        });
        Ok(reply)
    }

    /// Tears down a device's gateway-side state. No-op when absent.
    ///
    /// # Errors
    ///
    /// Returns an error when the interface exists but cannot be removed;
    /// the session stays committed so a retry runs the teardown again.
    pub async fn close_interface(&self, device_id: &str) -> Result<()> {
        let slot = self.slot(device_id).await;
        let mut session = slot.lock().await;

        let Some(committed) = session.as_ref() else {
            debug!(device_id, "close of absent interface, no-op");
            self.prune_slot(device_id, &slot).await;
            return Ok(());
        };

        let outcome = self.routing.revert(&committed.policy).await;
        if !outcome.is_clean() {
            warn!(
                device_id,
                failed = outcome.failed.len(),
                "routing teardown left entries behind"
            );
        }

        self.tunnels.clone().destroy(device_id).await?;
        *session = None;
        self.prune_slot(device_id, &slot).await;

        info!(device_id, "closed gateway interface");
        Ok(())
    }

    /// Reports the gateway-side view of a device's tunnel.
    pub async fn status(&self, device_id: &str) -> Result<StatusResponse> {
        match self.tunnels.status(device_id).await {
            Ok(status) => Ok(StatusResponse {
                device_id: device_id.to_owned(),
                present: true,
                peer_count: status.peers.len(),
            }),
            Err(TunnelError::InterfaceNotFound(_)) => Ok(StatusResponse {
                device_id: device_id.to_owned(),
                present: false,
                peer_count: 0,
            }),
            Err(e) => Err(e.into()),
        }
    }
}
