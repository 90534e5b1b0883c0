//! Bus dispatcher loop.

use std::sync::Arc;

use burrow_bus::messages::{procedures, CloseRequest, GatewayRequest};
use burrow_bus::{BusEndpoint, Invocation};
use burrow_routing::NetOps;
use burrow_tunnel::TunnelDevice;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{GatewayError, Result};
use crate::handler::GatewayRpcHandler;

/// Serves invocations from `endpoint` until it shuts down.
///
/// # Errors
///
/// Returns an error when the endpoint itself fails; handler errors are
/// answered to the caller and do not stop the loop.
pub async fn serve<E, D, N>(
    mut endpoint: E,
    handler: Arc<GatewayRpcHandler<D, N>>,
) -> Result<()>
where
    E: BusEndpoint,
    D: TunnelDevice + Clone,
    N: NetOps,
{
    info!("gateway dispatcher running");
    while let Some(invocation) = endpoint.next_invocation().await? {
        dispatch(&handler, invocation).await;
    }
    info!("bus endpoint closed, dispatcher stopping");
    Ok(())
}

/// Routes one invocation to its handler and answers it.
pub async fn dispatch<D, N>(handler: &GatewayRpcHandler<D, N>, invocation: Invocation)
where
    D: TunnelDevice + Clone,
    N: NetOps,
{
    let caller = invocation.device_id.clone();
    let procedure = invocation.procedure.clone();
    let args = invocation.args.clone();
    debug!(caller = %caller, procedure = %procedure, "dispatching call");

    match route(handler, &caller, &procedure, args).await {
        Ok(reply) => invocation.succeed(reply),
        Err(e) => {
            warn!(caller = %caller, procedure = %procedure, error = %e, "call failed");
            invocation.fail(e.to_string());
        }
    }
}

async fn route<D, N>(
    handler: &GatewayRpcHandler<D, N>,
    caller: &str,
    procedure: &str,
    args: Value,
) -> Result<Value>
where
    D: TunnelDevice + Clone,
    N: NetOps,
{
    match procedure {
        procedures::REQUEST_GATEWAY | procedures::OPEN_INTERFACE => {
            let request: GatewayRequest = serde_json::from_value(args)
                .map_err(|e| GatewayError::BadRequest(e.to_string()))?;
            authorize(caller, &request.device_id)?;
            let reply = handler.open_interface(request).await?;
            serde_json::to_value(reply).map_err(|e| GatewayError::BadRequest(e.to_string()))
        }
        procedures::CLOSE_INTERFACE => {
            let request: CloseRequest = serde_json::from_value(args)
                .map_err(|e| GatewayError::BadRequest(e.to_string()))?;
            authorize(caller, &request.device_id)?;
            handler.close_interface(&request.device_id).await?;
            Ok(serde_json::json!({ "closed": true }))
        }
        procedures::REQUEST_STATUS => {
            // Status is always scoped to the authenticated caller.
            let status = handler.status(caller).await?;
            serde_json::to_value(status).map_err(|e| GatewayError::BadRequest(e.to_string()))
        }
        other => Err(GatewayError::BadRequest(format!(
            "unknown procedure '{other}'"
        ))),
    }
}

fn authorize(caller: &str, device_id: &str) -> Result<()> {
    if caller == device_id {
        Ok(())
    } else {
        Err(GatewayError::Forbidden {
            caller: caller.to_owned(),
            device_id: device_id.to_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_bus::{FakeBusCaller, FakeBusEndpoint};
    use burrow_bus::error::BusError;
    use burrow_routing::FakeNetOps;
    use burrow_tunnel::{generate_keypair, FakeTunnelDevice};
    use serde_json::json;

    fn spawn_gateway() -> (FakeBusCaller, Arc<GatewayRpcHandler<FakeTunnelDevice, FakeNetOps>>) {
        let config = crate::GatewayConfig {
            gateway_id: "gw-1".to_owned(),
            bind_addr: "0.0.0.0:8080".parse().unwrap(),
            realm: "burrow".to_owned(),
            cacert_path: "cacert-bus.pem".into(),
            endpoint: "203.0.113.10".to_owned(),
            listen_port: 42001,
            tunnel_address: "10.0.23.1/16".parse().unwrap(),
            uplink_interface: "eth0".to_owned(),
            keepalive_secs: 10,
        };
        let handler = Arc::new(GatewayRpcHandler::new(
            config,
            FakeTunnelDevice::new(),
            FakeNetOps::new(),
        ));
        let (endpoint, caller) = FakeBusEndpoint::pair();
        let served = Arc::clone(&handler);
        tokio::spawn(async move {
            let _ = serve(endpoint, served).await;
        });
        (caller, handler)
    }

    fn request_args(device_id: &str) -> Value {
        let (_, public) = generate_keypair();
        json!({
            "device_id": device_id,
            "public_key": public.to_base64(),
            "address": "10.0.42.15/16",
            "network": "field-net",
        })
    }

    #[tokio::test]
    async fn request_gateway_and_status_round_trip() {
        let (caller, _) = spawn_gateway();

        let reply = caller
            .call("router-7", procedures::REQUEST_GATEWAY, request_args("router-7"))
            .await
            .unwrap();
        assert_eq!(reply["gateway_listen_port"], json!(42001));

        let status = caller
            .call("router-7", procedures::REQUEST_STATUS, json!({}))
            .await
            .unwrap();
        assert_eq!(status["present"], json!(true));
        assert_eq!(status["peer_count"], json!(1));
    }

    #[tokio::test]
    async fn caller_cannot_act_for_another_device() {
        let (caller, _) = spawn_gateway();

        let err = caller
            .call("router-8", procedures::OPEN_INTERFACE, request_args("router-7"))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Remote { ref message, .. }
            if message.contains("may not act")));
    }

    #[tokio::test]
    async fn close_interface_round_trip() {
        let (caller, handler) = spawn_gateway();

        caller
            .call("router-7", procedures::OPEN_INTERFACE, request_args("router-7"))
            .await
            .unwrap();
        caller
            .call("router-7", procedures::CLOSE_INTERFACE, json!({"device_id": "router-7"}))
            .await
            .unwrap();

        let status = handler.status("router-7").await.unwrap();
        assert!(!status.present);
    }

    #[tokio::test]
    async fn unknown_procedure_is_refused() {
        let (caller, _) = spawn_gateway();
        let err = caller
            .call("router-7", "reboot_everything", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Remote { ref message, .. }
            if message.contains("unknown procedure")));
    }
}
