//! On-disk identity store with expiry-driven renewal.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use rcgen::{CertificateParams, DnType, KeyPair};
use zeroize::Zeroizing;

use crate::autosign::AutosignClient;
use crate::error::{IdentityError, Result};

/// A device's bus credentials, loaded or freshly issued.
pub struct DeviceIdentity {
    /// Device identifier, also the certificate common name.
    pub device_id: String,
    /// PEM-encoded private key. Zeroized on drop.
    pub private_key_pem: Zeroizing<String>,
    /// PEM-encoded certificate.
    pub certificate_pem: String,
    /// Path the private key is persisted at.
    pub key_path: PathBuf,
    /// Path the certificate is persisted at.
    pub certificate_path: PathBuf,
}

impl fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("device_id", &self.device_id)
            .field("private_key_pem", &"[REDACTED]")
            .field("key_path", &self.key_path)
            .field("certificate_path", &self.certificate_path)
            .finish_non_exhaustive()
    }
}

/// Loads the persisted identity when valid, otherwise enrolls a new one
/// through the autosign endpoint.
pub struct IdentityStore<A> {
    device_id: String,
    ca_name: String,
    key_path: PathBuf,
    certificate_path: PathBuf,
    renewal_margin: Duration,
    autosign: A,
}

impl<A: AutosignClient> IdentityStore<A> {
    /// Create a store persisting at `key_path` / `certificate_path`.
    pub fn new(
        device_id: impl Into<String>,
        ca_name: impl Into<String>,
        key_path: impl Into<PathBuf>,
        certificate_path: impl Into<PathBuf>,
        renewal_margin: Duration,
        autosign: A,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            ca_name: ca_name.into(),
            key_path: key_path.into(),
            certificate_path: certificate_path.into(),
            renewal_margin,
            autosign,
        }
    }

    /// Return a usable identity, enrolling or renewing as needed.
    ///
    /// The persisted identity is reused when both files exist and the
    /// certificate remains valid past the renewal margin. Otherwise a fresh
    /// keypair and CSR are generated, signed by the CA, and persisted before
    /// the previous material is replaced. A failed enrollment leaves any
    /// existing files untouched.
    pub async fn ensure_identity(&self) -> Result<DeviceIdentity> {
        if let Some(existing) = self.load_existing()? {
            let not_after = certificate_not_after(&existing.certificate_pem)?;
            let renew_at = not_after - self.renewal_margin;
            if Utc::now() < renew_at {
                tracing::debug!(
                    device_id = %self.device_id,
                    %not_after,
                    "reusing persisted identity"
                );
                return Ok(existing);
            }
            tracing::info!(
                device_id = %self.device_id,
                %not_after,
                "certificate within renewal margin, re-enrolling"
            );
        } else {
            tracing::info!(device_id = %self.device_id, "no persisted identity, enrolling");
        }

        self.enroll().await
    }

    fn load_existing(&self) -> Result<Option<DeviceIdentity>> {
        if !self.key_path.exists() || !self.certificate_path.exists() {
            return Ok(None);
        }

        let private_key_pem = Zeroizing::new(read_file(&self.key_path)?);
        let certificate_pem = read_file(&self.certificate_path)?;

        Ok(Some(DeviceIdentity {
            device_id: self.device_id.clone(),
            private_key_pem,
            certificate_pem,
            key_path: self.key_path.clone(),
            certificate_path: self.certificate_path.clone(),
        }))
    }

    async fn enroll(&self) -> Result<DeviceIdentity> {
        let key_pair = KeyPair::generate().map_err(|e| IdentityError::Csr(e.to_string()))?;

        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, self.device_id.clone());
        params
            .distinguished_name
            .push(DnType::OrganizationName, self.ca_name.clone());

        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| IdentityError::Csr(e.to_string()))?;
        let csr_pem = csr.pem().map_err(|e| IdentityError::Csr(e.to_string()))?;

        let certificate_pem = self.autosign.sign(&csr_pem).await?;
        certificate_not_after(&certificate_pem)?;

        let private_key_pem = Zeroizing::new(key_pair.serialize_pem());
        persist_pair(
            &self.key_path,
            &private_key_pem,
            &self.certificate_path,
            &certificate_pem,
        )?;

        tracing::info!(
            device_id = %self.device_id,
            certificate = %self.certificate_path.display(),
            "identity enrolled"
        );

        Ok(DeviceIdentity {
            device_id: self.device_id.clone(),
            private_key_pem,
            certificate_pem,
            key_path: self.key_path.clone(),
            certificate_path: self.certificate_path.clone(),
        })
    }
}

/// Parse the not-after instant out of a PEM certificate.
fn certificate_not_after(certificate_pem: &str) -> Result<DateTime<Utc>> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(certificate_pem.as_bytes())
        .map_err(|e| IdentityError::Parse(e.to_string()))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| IdentityError::Parse(e.to_string()))?;
    let ts = cert.validity().not_after.timestamp();
    DateTime::from_timestamp(ts, 0)
        .ok_or_else(|| IdentityError::Parse(format!("not-after timestamp {ts} out of range")))
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| IdentityError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

/// Write the key and certificate as a pair.
///
/// Both files are staged as sibling temp files first; the final paths are
/// only touched once both writes succeeded, so a failure while staging
/// leaves whatever identity was on disk intact.
fn persist_pair(key_path: &Path, key: &str, cert_path: &Path, cert: &str) -> Result<()> {
    let key_tmp = stage(key_path, key, 0o600)?;
    let cert_tmp = match stage(cert_path, cert, 0o644) {
        Ok(tmp) => tmp,
        Err(e) => {
            let _ = std::fs::remove_file(&key_tmp);
            return Err(e);
        }
    };

    if let Err(e) = commit(&key_tmp, key_path) {
        let _ = std::fs::remove_file(&key_tmp);
        let _ = std::fs::remove_file(&cert_tmp);
        return Err(e);
    }
    if let Err(e) = commit(&cert_tmp, cert_path) {
        let _ = std::fs::remove_file(&cert_tmp);
        return Err(e);
    }
    Ok(())
}

/// Appends `.tmp` to the full file name, keeping `node.key` and `node.pem`
/// staged under distinct siblings.
fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn stage(path: &Path, content: &str, mode: u32) -> Result<PathBuf> {
    let io_err = |e: std::io::Error| IdentityError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    };

    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() && !dir.exists() {
            std::fs::create_dir_all(dir).map_err(io_err)?;
            set_mode(dir, 0o700)?;
        }
    }

    let tmp = tmp_path(path);
    std::fs::write(&tmp, content).map_err(io_err)?;
    set_mode(&tmp, mode)?;
    Ok(tmp)
}

fn commit(tmp: &Path, path: &Path) -> Result<()> {
    std::fs::rename(tmp, path).map_err(|e| IdentityError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(|e| {
        IdentityError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        }
    })
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autosign::FakeAutosign;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "burrow-identity-{tag}-{}-{}",
            std::process::id(),
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn store(dir: &Path, ca: FakeAutosign, margin_days: i64) -> IdentityStore<FakeAutosign> {
        IdentityStore::new(
            "router-7",
            "burrow-ca",
            dir.join("router-7-bus.key"),
            dir.join("router-7-bus.pem"),
            Duration::days(margin_days),
            ca,
        )
    }

    #[tokio::test]
    async fn bootstrap_enrolls_and_persists() {
        let dir = temp_dir("bootstrap");
        let ca = FakeAutosign::new("burrow-ca", 365);
        let identity = store(&dir, ca.clone(), 30).ensure_identity().await.unwrap();

        assert_eq!(identity.device_id, "router-7");
        assert!(identity.private_key_pem.contains("PRIVATE KEY"));
        assert!(identity.certificate_pem.contains("BEGIN CERTIFICATE"));
        assert!(identity.key_path.exists());
        assert!(identity.certificate_path.exists());
        assert_eq!(ca.signed_count(), 1);
    }

    #[tokio::test]
    async fn valid_identity_is_reused() {
        let dir = temp_dir("reuse");
        let ca = FakeAutosign::new("burrow-ca", 365);
        let store = store(&dir, ca.clone(), 30);

        let first = store.ensure_identity().await.unwrap();
        let second = store.ensure_identity().await.unwrap();

        assert_eq!(ca.signed_count(), 1);
        assert_eq!(first.certificate_pem, second.certificate_pem);
        assert_eq!(*first.private_key_pem, *second.private_key_pem);
    }

    #[tokio::test]
    async fn expiring_certificate_is_renewed() {
        let dir = temp_dir("renew");
        // Issued for 5 days with a 30-day margin: already inside the window.
        let ca = FakeAutosign::new("burrow-ca", 5);
        let store = store(&dir, ca.clone(), 30);

        let first = store.ensure_identity().await.unwrap();
        let second = store.ensure_identity().await.unwrap();

        assert_eq!(ca.signed_count(), 2);
        assert_ne!(first.certificate_pem, second.certificate_pem);
    }

    #[tokio::test]
    async fn failed_enrollment_leaves_no_files() {
        let dir = temp_dir("fail");
        let ca = FakeAutosign::new("burrow-ca", 365);
        ca.fail_signing(true);
        let store = store(&dir, ca, 30);

        let err = store.ensure_identity().await.unwrap_err();
        assert!(matches!(err, IdentityError::Autosign(_)));
        assert!(!dir.join("router-7-bus.key").exists());
        assert!(!dir.join("router-7-bus.pem").exists());
    }

    #[tokio::test]
    async fn failed_renewal_keeps_previous_identity_on_disk() {
        let dir = temp_dir("keep");
        let ca = FakeAutosign::new("burrow-ca", 5);
        let store = store(&dir, ca.clone(), 30);

        let first = store.ensure_identity().await.unwrap();
        ca.fail_signing(true);
        let _ = store.ensure_identity().await.unwrap_err();

        let on_disk = std::fs::read_to_string(dir.join("router-7-bus.pem")).unwrap();
        assert_eq!(on_disk, first.certificate_pem);
    }

    #[tokio::test]
    async fn certificate_persist_failure_leaves_no_key() {
        let dir = temp_dir("stage");
        // A non-empty directory squatting on the certificate's staging path
        // makes its write fail after the key was already staged.
        let blocker = dir.join("router-7-bus.pem.tmp");
        std::fs::create_dir_all(blocker.join("occupied")).unwrap();

        let ca = FakeAutosign::new("burrow-ca", 365);
        let err = store(&dir, ca, 30).ensure_identity().await.unwrap_err();
        assert!(matches!(err, IdentityError::Io { .. }));

        assert!(!dir.join("router-7-bus.key").exists());
        assert!(!dir.join("router-7-bus.pem").exists());
        assert!(!dir.join("router-7-bus.key.tmp").exists());
    }

    #[tokio::test]
    async fn certificate_persist_failure_keeps_previous_pair() {
        let dir = temp_dir("stagekeep");
        let ca = FakeAutosign::new("burrow-ca", 5);
        let store = store(&dir, ca.clone(), 30);
        let first = store.ensure_identity().await.unwrap();

        let blocker = dir.join("router-7-bus.pem.tmp");
        std::fs::create_dir_all(blocker.join("occupied")).unwrap();
        let _ = store.ensure_identity().await.unwrap_err();

        // Key and certificate on disk still form the original pair.
        let key = std::fs::read_to_string(dir.join("router-7-bus.key")).unwrap();
        let cert = std::fs::read_to_string(dir.join("router-7-bus.pem")).unwrap();
        assert_eq!(key, *first.private_key_pem);
        assert_eq!(cert, first.certificate_pem);
    }

    #[test]
    fn temp_paths_preserve_file_suffixes() {
        assert_eq!(
            tmp_path(Path::new("/etc/burrow/node.key")),
            PathBuf::from("/etc/burrow/node.key.tmp")
        );
        assert_ne!(
            tmp_path(Path::new("/etc/burrow/node.key")),
            tmp_path(Path::new("/etc/burrow/node.pem"))
        );
    }

    #[test]
    fn not_after_parses_issued_certificate() {
        let ca = FakeAutosign::new("burrow-ca", 365);
        let pem = ca.ca_certificate_pem();
        let not_after = certificate_not_after(&pem).unwrap();
        assert!(not_after > Utc::now());
    }

    #[test]
    fn debug_redacts_private_key() {
        let identity = DeviceIdentity {
            device_id: "router-7".to_owned(),
            private_key_pem: Zeroizing::new("secret".to_owned()),
            certificate_pem: String::new(),
            key_path: PathBuf::from("k"),
            certificate_path: PathBuf::from("c"),
        };
        let rendered = format!("{identity:?}");
        assert!(rendered.contains("[REDACTED]"));
        assert!(!rendered.contains("secret"));
    }
}
