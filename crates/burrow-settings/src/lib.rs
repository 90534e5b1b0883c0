//! Versioned configuration model for Burrow nodes.
//!
//! Parses the TOML configuration document, validates it, and produces a
//! fully-resolved settings object: every path, port and key consumed
//! downstream is present and valid after [`ResolvedSettings::load`]
//! succeeds.

pub mod error;
mod settings;

pub use error::{ConfigError, Result};
pub use settings::{
    BusSettings, ProvisioningSettings, ResolvedSettings, TunnelEndpointSettings, SCHEMA_VERSION,
};
