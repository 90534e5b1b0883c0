//! Gateway configuration document.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use burrow_settings::ConfigError;
use ipnet::IpNet;
use serde::Deserialize;

use crate::error::Result;

const SCHEMA_VERSION: u32 = 1;

const DEFAULT_BIND: &str = "0.0.0.0:8080";
const DEFAULT_REALM: &str = "burrow";
const DEFAULT_LISTEN_PORT: u16 = 42001;
const DEFAULT_UPLINK: &str = "eth0";
const DEFAULT_KEEPALIVE_SECS: u16 = 10;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawGatewayConfig {
    version: u32,
    gateway_id: String,
    bus: RawBusSection,
    wireguard: RawTunnelSection,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawBusSection {
    bind: Option<String>,
    realm: Option<String>,
    cacert: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTunnelSection {
    endpoint: String,
    listen_port: Option<u16>,
    address: String,
    uplink: Option<String>,
    keepalive: Option<u16>,
}

/// Fully-resolved gateway configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GatewayConfig {
    /// Gateway identifier, used in logs.
    pub gateway_id: String,
    /// Socket the bus endpoint listens on.
    pub bind_addr: SocketAddr,
    /// Realm devices must present to be admitted.
    pub realm: String,
    /// CA certificate used to verify device certificates.
    pub cacert_path: PathBuf,
    /// Externally reachable address advertised to devices.
    pub endpoint: String,
    /// UDP port tunnel interfaces listen on.
    pub listen_port: u16,
    /// Gateway-side tunnel address and mask.
    pub tunnel_address: IpNet,
    /// Interface carrying masqueraded device traffic upstream.
    pub uplink_interface: String,
    /// Persistent keepalive set on device peers, in seconds.
    pub keepalive_secs: u16,
}

impl GatewayConfig {
    /// Loads and resolves a gateway configuration from disk.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on unreadable, malformed or invalid input.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml(&content, path)
    }

    /// Parses and resolves a configuration document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on malformed or invalid input.
    pub fn from_toml(content: &str, path: impl AsRef<Path>) -> Result<Self> {
        let raw: RawGatewayConfig =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        if raw.version != SCHEMA_VERSION {
            return Err(ConfigError::UnsupportedVersion(raw.version).into());
        }
        if raw.gateway_id.trim().is_empty() {
            return Err(ConfigError::MissingField("gateway_id").into());
        }
        if raw.wireguard.endpoint.trim().is_empty() {
            return Err(ConfigError::MissingField("wireguard.endpoint").into());
        }

        let bind_addr: SocketAddr = raw
            .bus
            .bind
            .as_deref()
            .unwrap_or(DEFAULT_BIND)
            .parse()
            .map_err(|e| ConfigError::Invalid {
                field: "bus.bind",
                reason: format!("{e}"),
            })?;

        let tunnel_address: IpNet =
            raw.wireguard
                .address
                .parse()
                .map_err(|e| ConfigError::Invalid {
                    field: "wireguard.address",
                    reason: format!("{e}"),
                })?;

        let config_dir = path
            .as_ref()
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let cacert = raw
            .bus
            .cacert
            .unwrap_or_else(|| PathBuf::from("cacert-bus.pem"));
        let cacert_path = if cacert.is_absolute() {
            cacert
        } else {
            config_dir.join(cacert)
        };

        Ok(Self {
            gateway_id: raw.gateway_id,
            bind_addr,
            realm: raw.bus.realm.unwrap_or_else(|| DEFAULT_REALM.to_owned()),
            cacert_path,
            endpoint: raw.wireguard.endpoint,
            listen_port: raw.wireguard.listen_port.unwrap_or(DEFAULT_LISTEN_PORT),
            tunnel_address,
            uplink_interface: raw
                .wireguard
                .uplink
                .unwrap_or_else(|| DEFAULT_UPLINK.to_owned()),
            keepalive_secs: raw.wireguard.keepalive.unwrap_or(DEFAULT_KEEPALIVE_SECS),
        })
    }
}
