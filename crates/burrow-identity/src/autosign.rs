//! Clients for the CA autosign endpoint.
//!
//! The autosign endpoint accepts a PEM-encoded certificate signing request
//! and returns a PEM-encoded certificate signed by the network CA. The
//! [`FakeAutosign`] implementation runs an in-process CA for tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use rcgen::{Certificate, CertificateParams, CertificateSigningRequestParams, DnType, KeyPair};

use crate::error::{IdentityError, Result};

/// A client capable of exchanging a CSR for a signed certificate.
#[allow(async_fn_in_trait)]
pub trait AutosignClient {
    /// Submit a PEM-encoded CSR and return the signed certificate PEM.
    async fn sign(&self, csr_pem: &str) -> Result<String>;
}

/// Autosign client that posts the CSR to the CA's HTTP endpoint.
#[derive(Debug, Clone)]
pub struct HttpAutosign {
    url: String,
    http: reqwest::Client,
}

impl HttpAutosign {
    /// Create a client for the autosign endpoint at `url`.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            http: reqwest::Client::new(),
        }
    }
}

impl AutosignClient for HttpAutosign {
    async fn sign(&self, csr_pem: &str) -> Result<String> {
        tracing::debug!(url = %self.url, "submitting certificate signing request");

        let response = self
            .http
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/x-pem-file")
            .body(csr_pem.to_owned())
            .send()
            .await
            .map_err(|e| IdentityError::Autosign(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| IdentityError::Autosign(e.to_string()))?;

        if !status.is_success() {
            return Err(IdentityError::Autosign(format!(
                "endpoint returned {status}: {}",
                body.trim()
            )));
        }

        if !body.contains("BEGIN CERTIFICATE") {
            return Err(IdentityError::Parse(
                "autosign response is not a PEM certificate".to_owned(),
            ));
        }

        Ok(body)
    }
}

struct FakeAutosignInner {
    ca_cert: Certificate,
    ca_key: KeyPair,
    validity: time::Duration,
    signed: AtomicUsize,
    fail: AtomicBool,
}

/// In-process CA for tests. Signs every CSR it receives with a
/// freshly-generated CA certificate.
#[derive(Clone)]
pub struct FakeAutosign {
    inner: Arc<FakeAutosignInner>,
}

impl FakeAutosign {
    /// Create a fake CA named `ca_name` issuing certificates valid for
    /// `validity_days`.
    ///
    /// # Panics
    ///
    /// Panics if CA material cannot be generated. Test-only helper.
    #[must_use]
    #[allow(clippy::unwrap_used, clippy::missing_panics_doc)]
    pub fn new(ca_name: &str, validity_days: i64) -> Self {
        let ca_key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, ca_name.to_owned());
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let ca_cert = params.self_signed(&ca_key).unwrap();

        Self {
            inner: Arc::new(FakeAutosignInner {
                ca_cert,
                ca_key,
                validity: time::Duration::days(validity_days),
                signed: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
            }),
        }
    }

    /// Make subsequent `sign` calls fail.
    pub fn fail_signing(&self, fail: bool) {
        self.inner.fail.store(fail, Ordering::SeqCst);
    }

    /// Number of CSRs signed so far.
    #[must_use]
    pub fn signed_count(&self) -> usize {
        self.inner.signed.load(Ordering::SeqCst)
    }

    /// PEM of the fake CA certificate.
    #[must_use]
    pub fn ca_certificate_pem(&self) -> String {
        self.inner.ca_cert.pem()
    }
}

impl AutosignClient for FakeAutosign {
    async fn sign(&self, csr_pem: &str) -> Result<String> {
        if self.inner.fail.load(Ordering::SeqCst) {
            return Err(IdentityError::Autosign("injected failure".to_owned()));
        }

        let mut csr = CertificateSigningRequestParams::from_pem(csr_pem)
            .map_err(|e| IdentityError::Parse(e.to_string()))?;

        let now = time::OffsetDateTime::now_utc();
        csr.params.not_before = now;
        csr.params.not_after = now + self.inner.validity;

        let cert = csr
            .signed_by(&self.inner.ca_cert, &self.inner.ca_key)
            .map_err(|e| IdentityError::Autosign(e.to_string()))?;

        self.inner.signed.fetch_add(1, Ordering::SeqCst);
        Ok(cert.pem())
    }
}
