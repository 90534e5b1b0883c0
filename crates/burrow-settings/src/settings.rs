//! Settings document parsing and resolution.

use std::path::{Path, PathBuf};

use ipnet::IpNet;
use serde::Deserialize;
use tracing::debug;

use burrow_tunnel::{PrivateKey, PublicKey};

use crate::error::{ConfigError, Result};

/// The configuration schema version this build understands.
pub const SCHEMA_VERSION: u32 = 1;

/// Default UDP listen port for tunnel interfaces.
const DEFAULT_LISTEN_PORT: u16 = 42001;
/// Default persistent keepalive in seconds.
const DEFAULT_KEEPALIVE_SECS: u16 = 10;
/// Default policy routing table id.
const DEFAULT_ROUTE_TABLE: u32 = 10;
/// Default remote call timeout in seconds.
const DEFAULT_CALL_TIMEOUT_SECS: u64 = 30;
/// Default certificate renewal margin in days.
const DEFAULT_RENEWAL_MARGIN_DAYS: i64 = 30;
/// Default bus realm.
const DEFAULT_REALM: &str = "burrow";

#[derive(Debug, Deserialize)]
struct RawSettings {
    version: Option<u32>,
    device_id: Option<String>,
    bus: Option<RawBus>,
    wireguard: Option<RawWireGuard>,
    provisioning: Option<RawProvisioning>,
}

#[derive(Debug, Default, Deserialize)]
struct RawBus {
    ca_url: Option<String>,
    ca_name: Option<String>,
    broker: Option<String>,
    realm: Option<String>,
    key: Option<String>,
    cert: Option<String>,
    cacert: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawWireGuard {
    endpoint: Option<String>,
    private_key: Option<String>,
    public_key: Option<String>,
    address: Option<String>,
    network: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawProvisioning {
    listen_port: Option<u16>,
    keepalive_secs: Option<u16>,
    route_table: Option<u32>,
    call_timeout_secs: Option<u64>,
    renewal_margin_days: Option<i64>,
}

/// Bus connection settings, fully resolved.
///
/// Unset paths are substituted with deterministic defaults derived from the
/// config file name, so no path is ever null downstream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BusSettings {
    /// URL of the CSR autosign endpoint.
    pub ca_url: String,
    /// Name of the signing CA, used in the certificate subject.
    pub ca_name: String,
    /// Broker URL to connect to.
    pub broker_url: String,
    /// Logical realm to join.
    pub realm: String,
    /// Path of the device's bus private key.
    pub private_key_path: PathBuf,
    /// Path of the device's bus certificate.
    pub certificate_path: PathBuf,
    /// Path of the CA certificate used to verify the broker.
    pub cacert_path: PathBuf,
}

/// Tunnel endpoint settings for this device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TunnelEndpointSettings {
    /// Externally reachable `host:port` advertised to the gateway.
    pub endpoint: String,
    /// The device's long-lived tunnel private key.
    pub private_key: PrivateKey,
    /// The matching public key.
    pub public_key: PublicKey,
    /// The device's tunnel address and mask.
    pub address: IpNet,
    /// Logical network name.
    pub network_name: Option<String>,
}

/// Provisioning behaviour knobs with defaults.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvisioningSettings {
    /// UDP listen port for the local tunnel interface.
    pub listen_port: u16,
    /// Persistent keepalive toward the gateway, in seconds.
    pub keepalive_secs: u16,
    /// Dedicated policy routing table id.
    pub route_table: u32,
    /// Timeout for each remote call, in seconds.
    pub call_timeout_secs: u64,
    /// Renew the identity certificate when it expires within this margin.
    pub renewal_margin_days: i64,
}

/// A fully-resolved configuration object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedSettings {
    /// Absolute path of the source document.
    pub path: PathBuf,
    /// Directory the document lives in; relative paths resolve against it.
    pub config_dir: PathBuf,
    /// Mandatory device identifier, also used as the interface name.
    pub device_id: String,
    /// Bus settings.
    pub bus: BusSettings,
    /// Tunnel endpoint settings.
    pub wireguard: TunnelEndpointSettings,
    /// Provisioning knobs.
    pub provisioning: ProvisioningSettings,
}

impl ResolvedSettings {
    /// Loads and resolves a configuration document from disk.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on unreadable files, malformed documents,
    /// unsupported versions, or invalid field values.
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
    /// `path` is the document's notional location; defaults for unset file
    /// paths are derived from its base name and directory.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on malformed documents, unsupported versions,
    /// or invalid field values.
    pub fn from_toml(content: &str, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let raw: RawSettings =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        let version = raw.version.unwrap_or(SCHEMA_VERSION);
        if version != SCHEMA_VERSION {
            return Err(ConfigError::UnsupportedVersion(version));
        }

        let device_id = raw
            .device_id
            .filter(|id| !id.is_empty())
            .ok_or(ConfigError::MissingField("device_id"))?;

        let config_dir = path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let stem = path
            .file_stem()
            .map_or_else(|| "burrow".to_string(), |s| s.to_string_lossy().into_owned());

        let bus = resolve_bus(raw.bus.unwrap_or_default(), &config_dir, &stem)?;
        let wireguard = resolve_wireguard(raw.wireguard.unwrap_or_default())?;
        let provisioning = resolve_provisioning(raw.provisioning.unwrap_or_default());

        debug!(device_id = %device_id, path = %path.display(), "resolved settings");

        Ok(Self {
            path,
            config_dir,
            device_id,
            bus,
            wireguard,
            provisioning,
        })
    }
}

fn resolve_path(config_dir: &Path, value: Option<String>, default_name: String) -> PathBuf {
    match value {
        Some(v) => {
            let p = PathBuf::from(v);
            if p.is_absolute() { p } else { config_dir.join(p) }
        }
        None => config_dir.join(default_name),
    }
}

fn resolve_bus(raw: RawBus, config_dir: &Path, stem: &str) -> Result<BusSettings> {
    let ca_url = raw
        .ca_url
        .filter(|u| !u.is_empty())
        .ok_or(ConfigError::MissingField("bus.ca_url"))?;
    let broker_url = raw
        .broker
        .filter(|u| !u.is_empty())
        .ok_or(ConfigError::MissingField("bus.broker"))?;

    Ok(BusSettings {
        ca_url,
        ca_name: raw.ca_name.unwrap_or_else(|| "burrow-ca".to_string()),
        broker_url,
        realm: raw.realm.unwrap_or_else(|| DEFAULT_REALM.to_string()),
        private_key_path: resolve_path(config_dir, raw.key, format!("{stem}-bus.key")),
        certificate_path: resolve_path(config_dir, raw.cert, format!("{stem}-bus.pem")),
        cacert_path: resolve_path(config_dir, raw.cacert, "cacert-bus.pem".to_string()),
    })
}

fn resolve_wireguard(raw: RawWireGuard) -> Result<TunnelEndpointSettings> {
    let endpoint = raw
        .endpoint
        .filter(|e| !e.is_empty())
        .ok_or(ConfigError::MissingField("wireguard.endpoint"))?;
    validate_endpoint(&endpoint)?;

    let private_key = raw
        .private_key
        .ok_or(ConfigError::MissingField("wireguard.private_key"))
        .and_then(|k| {
            PrivateKey::from_base64(&k).map_err(|e| ConfigError::Invalid {
                field: "wireguard.private_key",
                reason: e.to_string(),
            })
        })?;

    let public_key = raw
        .public_key
        .ok_or(ConfigError::MissingField("wireguard.public_key"))
        .and_then(|k| {
            PublicKey::from_base64(&k).map_err(|e| ConfigError::Invalid {
                field: "wireguard.public_key",
                reason: e.to_string(),
            })
        })?;

    let address = raw
        .address
        .ok_or(ConfigError::MissingField("wireguard.address"))
        .and_then(|a| {
            a.parse::<IpNet>().map_err(|e| ConfigError::Invalid {
                field: "wireguard.address",
                reason: e.to_string(),
            })
        })?;

    Ok(TunnelEndpointSettings {
        endpoint,
        private_key,
        public_key,
        address,
        network_name: raw.network,
    })
}

fn validate_endpoint(endpoint: &str) -> Result<()> {
    let invalid = |reason: &str| ConfigError::Invalid {
        field: "wireguard.endpoint",
        reason: reason.to_string(),
    };

    let (host, port) = endpoint
        .rsplit_once(':')
        .ok_or_else(|| invalid("expected host:port"))?;
    if host.is_empty() {
        return Err(invalid("empty host"));
    }
    port.parse::<u16>()
        .map_err(|_| invalid("port must be 0-65535"))?;
    Ok(())
}

fn resolve_provisioning(raw: RawProvisioning) -> ProvisioningSettings {
    ProvisioningSettings {
        listen_port: raw.listen_port.unwrap_or(DEFAULT_LISTEN_PORT),
        keepalive_secs: raw.keepalive_secs.unwrap_or(DEFAULT_KEEPALIVE_SECS),
        route_table: raw.route_table.unwrap_or(DEFAULT_ROUTE_TABLE),
        call_timeout_secs: raw.call_timeout_secs.unwrap_or(DEFAULT_CALL_TIMEOUT_SECS),
        renewal_margin_days: raw.renewal_margin_days.unwrap_or(DEFAULT_RENEWAL_MARGIN_DAYS),
    }
}
