//! Device identity bootstrap and persistence for Burrow.
//!
//! A device authenticates to the bus with an X.509 certificate signed by
//! the network's CA. This crate owns that material: it generates a keypair
//! and CSR on first use, submits the CSR to the autosign endpoint, persists
//! key and certificate atomically, and renews them when the certificate
//! approaches expiry.

pub mod autosign;
pub mod error;
mod store;

pub use autosign::{AutosignClient, FakeAutosign, HttpAutosign};
pub use error::{IdentityError, Result};
pub use store::{DeviceIdentity, IdentityStore};
