//! Client-side tunnel provisioning for Burrow.
//!
//! The orchestrator runs the provisioning stages strictly in order:
//! connect, join, request a gateway, bring up the local tunnel, install
//! routing, confirm status, leave. A failing stage aborts the rest, rolls
//! back whatever was already applied in reverse order, and reports the
//! stage that failed.

pub mod error;
pub mod orchestrator;

pub use error::{ProvisioningError, Stage};
pub use orchestrator::Orchestrator;
