//! burrow - device-side tunnel provisioning CLI.

use std::path::PathBuf;

use anyhow::Context;
use burrow_bus::{TlsIdentity, WsTransport};
use burrow_client::Orchestrator;
use burrow_identity::{HttpAutosign, IdentityStore};
use burrow_routing::sys::SysNetOps;
use burrow_settings::ResolvedSettings;
use burrow_tunnel::sys::SysTunnelDevice;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

#[derive(Parser)]
#[command(name = "burrow")]
#[command(about = "Provision an encrypted tunnel to a Burrow gateway")]
#[command(version)]
struct Cli {
    /// Path to the device configuration file
    #[arg(short, long, default_value = "/etc/burrow/burrow.toml")]
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
    let settings = ResolvedSettings::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    info!(device_id = %settings.device_id, broker = %settings.bus.broker_url, "starting");

    let store = IdentityStore::new(
        &settings.device_id,
        &settings.bus.ca_name,
        &settings.bus.private_key_path,
        &settings.bus.certificate_path,
        chrono::Duration::days(settings.provisioning.renewal_margin_days),
        HttpAutosign::new(&settings.bus.ca_url),
    );
    let device_identity = store
        .ensure_identity()
        .await
        .context("ensuring device identity")?;

    let ca_certificate_pem = std::fs::read_to_string(&settings.bus.cacert_path)
        .with_context(|| format!("reading {}", settings.bus.cacert_path.display()))?;

    let identity = TlsIdentity::new(
        &settings.device_id,
        device_identity.certificate_pem.clone(),
        Zeroizing::new(device_identity.private_key_pem.to_string()),
        ca_certificate_pem,
    );

    let mut orchestrator = Orchestrator::new(
        settings,
        identity,
        WsTransport::new(),
        SysTunnelDevice::new(),
        SysNetOps::new(),
    );

    match orchestrator.provision().await {
        Ok(gateway) => {
            info!(
                endpoint = %gateway.gateway_endpoint,
                port = gateway.gateway_listen_port,
                "tunnel established"
            );
            Ok(())
        }
        Err(e) => {
            error!(stage = %e.stage, message = %e.message, "provisioning failed");
            for failure in &e.rollback_failures {
                error!(%failure, "rollback step failed");
            }
            std::process::exit(1);
        }
    }
}
