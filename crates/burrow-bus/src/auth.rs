//! Application-level verification of device certificates.
//!
//! The endpoint authenticates each caller by checking the certificate it
//! presents in its hello frame: signed by the realm CA, currently valid,
//! and bound to the claimed device id through the common name.

use x509_parser::pem::parse_x509_pem;

use crate::error::{BusError, Result};

/// Verify that `certificate_pem` authenticates `device_id` under the CA in
/// `ca_certificate_pem`.
pub fn verify_client_certificate(
    certificate_pem: &str,
    ca_certificate_pem: &str,
    device_id: &str,
) -> Result<()> {
    let (_, ca_pem) = parse_x509_pem(ca_certificate_pem.as_bytes())
        .map_err(|e| BusError::Auth(format!("bad CA certificate: {e}")))?;
    let ca = ca_pem
        .parse_x509()
        .map_err(|e| BusError::Auth(format!("bad CA certificate: {e}")))?;

    let (_, device_pem) = parse_x509_pem(certificate_pem.as_bytes())
        .map_err(|e| BusError::Auth(format!("bad device certificate: {e}")))?;
    let certificate = device_pem
        .parse_x509()
        .map_err(|e| BusError::Auth(format!("bad device certificate: {e}")))?;

    certificate
        .verify_signature(Some(ca.public_key()))
        .map_err(|_| BusError::Auth("certificate not signed by realm CA".to_owned()))?;

    if !certificate.validity().is_valid() {
        return Err(BusError::Auth("certificate outside validity window".to_owned()));
    }

    let common_name = certificate
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .ok_or_else(|| BusError::Auth("certificate has no common name".to_owned()))?;

    if common_name != device_id {
        return Err(BusError::Auth(format!(
            "certificate common name '{common_name}' does not match device '{device_id}'"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_identity::{FakeAutosign, IdentityStore};
    use std::path::PathBuf;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "burrow-bus-auth-{tag}-{}-{}",
            std::process::id(),
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    async fn issue(ca: &FakeAutosign, device_id: &str, tag: &str) -> String {
        let dir = temp_dir(tag);
        let store = IdentityStore::new(
            device_id,
            "burrow-ca",
            dir.join(format!("{device_id}.key")),
            dir.join(format!("{device_id}.pem")),
            chrono::Duration::days(30),
            ca.clone(),
        );
        store.ensure_identity().await.unwrap().certificate_pem
    }

    #[tokio::test]
    async fn accepts_certificate_from_realm_ca() {
        let ca = FakeAutosign::new("burrow-ca", 365);
        let cert = issue(&ca, "router-7", "accept").await;

        verify_client_certificate(&cert, &ca.ca_certificate_pem(), "router-7").unwrap();
    }

    #[tokio::test]
    async fn rejects_certificate_from_other_ca() {
        let realm_ca = FakeAutosign::new("burrow-ca", 365);
        let rogue_ca = FakeAutosign::new("rogue-ca", 365);
        let cert = issue(&rogue_ca, "router-7", "rogue").await;

        let err =
            verify_client_certificate(&cert, &realm_ca.ca_certificate_pem(), "router-7")
                .unwrap_err();
        assert!(matches!(err, BusError::Auth(_)));
    }

    #[tokio::test]
    async fn rejects_device_id_mismatch() {
        let ca = FakeAutosign::new("burrow-ca", 365);
        let cert = issue(&ca, "router-7", "mismatch").await;

        let err = verify_client_certificate(&cert, &ca.ca_certificate_pem(), "router-8")
            .unwrap_err();
        assert!(matches!(err, BusError::Auth(ref m) if m.contains("does not match")));
    }

    #[test]
    fn rejects_garbage_pem() {
        let err = verify_client_certificate("not a pem", "also not a pem", "router-7")
            .unwrap_err();
        assert!(matches!(err, BusError::Auth(_)));
    }
}
