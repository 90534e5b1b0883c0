//! burrow-gateway - tunnel provisioning gateway.
//!
//! Listens for bus connections from devices and provisions the gateway
//! side of their tunnels.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use burrow_bus::WsEndpoint;
use burrow_gateway::{serve, GatewayConfig, GatewayRpcHandler};
use burrow_routing::sys::SysNetOps;
use burrow_tunnel::sys::SysTunnelDevice;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "burrow-gateway")]
#[command(about = "Burrow tunnel provisioning gateway")]
#[command(version)]
struct Cli {
    /// Path to the gateway configuration file
    #[arg(short, long, default_value = "/etc/burrow/gateway.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = GatewayConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let ca_certificate_pem = std::fs::read_to_string(&config.cacert_path)
        .with_context(|| format!("reading {}", config.cacert_path.display()))?;

    info!(
        gateway_id = %config.gateway_id,
        bind = %config.bind_addr,
        realm = %config.realm,
        "starting gateway"
    );

    let endpoint = WsEndpoint::bind(config.bind_addr, &config.realm, ca_certificate_pem)
        .await
        .context("binding bus endpoint")?;

    let handler = Arc::new(GatewayRpcHandler::new(
        config,
        SysTunnelDevice::new(),
        SysNetOps::new(),
    ));

    serve(endpoint, handler).await.context("dispatcher failed")?;
    Ok(())
}
