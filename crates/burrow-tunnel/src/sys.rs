//! Host tunnel device backed by the `ip` and `wg` command line tools.
//!
//! Requires root (or CAP_NET_ADMIN). Each operation is a thin invocation of
//! the host tooling; failures carry the tool's stderr.

use std::process::Output;

use tokio::process::Command;
use tracing::debug;

use crate::device::TunnelDevice;
use crate::error::{Result, TunnelError};
use crate::keys::PublicKey;
use crate::types::{TunnelPeer, TunnelSpec};

/// Tunnel device that shells out to `ip` / `wg`.
#[derive(Clone, Debug, Default)]
pub struct SysTunnelDevice;

impl SysTunnelDevice {
    /// Creates a new host-backed tunnel device.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

async fn run(program: &str, args: &[&str]) -> Result<Output> {
    debug!(program, ?args, "running network command");
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| TunnelError::Device(format!("failed to execute {program}: {e}")))?;

    if output.status.success() {
        Ok(output)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(TunnelError::Device(format!(
            "{program} {} failed: {}",
            args.join(" "),
            stderr.trim()
        )))
    }
}

impl TunnelDevice for SysTunnelDevice {
    async fn create(&mut self, spec: &TunnelSpec) -> Result<()> {
        run("ip", &["link", "add", &spec.name, "type", "wireguard"]).await?;
        run("ip", &["address", "add", &spec.address.to_string(), "dev", &spec.name]).await?;

        // wg(8) reads private keys from a file descriptor or file, not argv;
        // pass it via stdin through `wg set ... private-key /dev/stdin`.
        let mut child = Command::new("wg")
            .args([
                "set",
                &spec.name,
                "listen-port",
                &spec.listen_port.to_string(),
                "private-key",
                "/dev/stdin",
            ])
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| TunnelError::Device(format!("failed to execute wg: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            use tokio::io::AsyncWriteExt;
            stdin
                .write_all(spec.private_key.to_base64().as_bytes())
                .await
                .map_err(|e| TunnelError::Device(format!("failed to pass private key: {e}")))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| TunnelError::Device(format!("wg set failed: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TunnelError::Device(format!("wg set failed: {}", stderr.trim())));
        }

        run("ip", &["link", "set", &spec.name, "up"]).await?;
        Ok(())
    }

    async fn destroy(&mut self, name: &str) -> Result<()> {
        run("ip", &["link", "delete", name]).await.map_err(|e| match e {
            TunnelError::Device(msg) if msg.contains("Cannot find device") => {
                TunnelError::InterfaceNotFound(name.to_string())
            }
            other => other,
        })?;
        Ok(())
    }

    async fn set_peer(&mut self, name: &str, peer: &TunnelPeer) -> Result<()> {
        let public_key = peer.public_key.to_base64();
        let allowed = peer
            .allowed_ips
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");

        let mut args = vec!["set", name, "peer", &public_key, "allowed-ips", &allowed];

        let endpoint;
        if let Some(ep) = &peer.endpoint {
            endpoint = ep.to_string();
            args.push("endpoint");
            args.push(&endpoint);
        }

        let keepalive;
        if let Some(secs) = peer.persistent_keepalive {
            keepalive = secs.to_string();
            args.push("persistent-keepalive");
            args.push(&keepalive);
        }

        run("wg", &args).await?;
        Ok(())
    }

    async fn remove_peer(&mut self, name: &str, public_key: &PublicKey) -> Result<()> {
        let key = public_key.to_base64();
        run("wg", &["set", name, "peer", &key, "remove"]).await?;
        Ok(())
    }

    async fn exists(&self, name: &str) -> bool {
        Command::new("ip")
            .args(["link", "show", name])
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }
}
