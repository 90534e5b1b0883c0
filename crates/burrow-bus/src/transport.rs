//! Client-side transport abstraction.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use zeroize::Zeroizing;

use crate::error::{BusError, Result};

/// TLS client credentials presented to the bus.
#[derive(Clone)]
pub struct TlsIdentity {
    /// Device identifier bound to the certificate's common name.
    pub device_id: String,
    /// PEM-encoded device certificate.
    pub certificate_pem: String,
    /// PEM-encoded private key. Zeroized on drop.
    pub private_key_pem: Zeroizing<String>,
    /// PEM-encoded CA certificate used to verify the remote side.
    pub ca_certificate_pem: String,
}

impl TlsIdentity {
    /// Bundle credentials for a device.
    #[must_use]
    pub fn new(
        device_id: impl Into<String>,
        certificate_pem: impl Into<String>,
        private_key_pem: Zeroizing<String>,
        ca_certificate_pem: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            certificate_pem: certificate_pem.into(),
            private_key_pem,
            ca_certificate_pem: ca_certificate_pem.into(),
        }
    }
}

impl fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("device_id", &self.device_id)
            .field("private_key_pem", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

/// Low-level bus connection used by [`crate::BusSession`].
///
/// Implementations carry the raw connection; the session layers the state
/// machine on top. `call` resolves once the remote handler replies or the
/// timeout elapses.
#[allow(async_fn_in_trait)]
pub trait BusTransport {
    /// Open an authenticated connection to `broker_url`.
    async fn connect(&mut self, broker_url: &str, identity: &TlsIdentity) -> Result<()>;

    /// Attach to the logical realm.
    async fn join(&mut self, realm: &str) -> Result<()>;

    /// Invoke a remote procedure and wait for its reply.
    async fn call(&mut self, procedure: &str, args: Value, timeout: Duration) -> Result<Value>;

    /// Close the connection.
    async fn leave(&mut self) -> Result<()>;

    /// Whether the connection is currently usable.
    fn is_connected(&self) -> bool;
}

#[derive(Debug, Default)]
struct FakeTransportState {
    connected: bool,
    joined_realm: Option<String>,
    responses: HashMap<String, VecDeque<Value>>,
    remote_failures: HashMap<String, String>,
    connect_failure: Option<String>,
    drop_after: Option<String>,
    calls: Vec<(String, Value)>,
}

/// Scripted in-memory transport for session and orchestrator tests.
#[derive(Debug, Clone, Default)]
pub struct FakeBusTransport {
    state: Arc<Mutex<FakeTransportState>>,
}

impl FakeBusTransport {
    /// Create a transport with no scripted behaviour.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeTransportState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Script the next reply for `procedure`.
    pub fn respond_with(&self, procedure: &str, reply: Value) {
        self.lock()
            .responses
            .entry(procedure.to_owned())
            .or_default()
            .push_back(reply);
    }

    /// Make every call to `procedure` fail with a remote error.
    pub fn fail_with(&self, procedure: &str, message: &str) {
        self.lock()
            .remote_failures
            .insert(procedure.to_owned(), message.to_owned());
    }

    /// Make `connect` fail.
    pub fn fail_connect(&self, message: &str) {
        self.lock().connect_failure = Some(message.to_owned());
    }

    /// Drop the connection right after `procedure` completes.
    pub fn drop_connection_after(&self, procedure: &str) {
        self.lock().drop_after = Some(procedure.to_owned());
    }

    /// Procedures invoked so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.lock().calls.clone()
    }

    /// Realm passed to the last successful `join`.
    #[must_use]
    pub fn joined_realm(&self) -> Option<String> {
        self.lock().joined_realm.clone()
    }
}

impl BusTransport for FakeBusTransport {
    async fn connect(&mut self, _broker_url: &str, _identity: &TlsIdentity) -> Result<()> {
        let mut state = self.lock();
        if let Some(message) = state.connect_failure.clone() {
            return Err(BusError::Transport(message));
        }
        state.connected = true;
        Ok(())
    }

    async fn join(&mut self, realm: &str) -> Result<()> {
        let mut state = self.lock();
        if !state.connected {
            return Err(BusError::Transport("not connected".to_owned()));
        }
        state.joined_realm = Some(realm.to_owned());
        Ok(())
    }

    async fn call(&mut self, procedure: &str, args: Value, _timeout: Duration) -> Result<Value> {
        let mut state = self.lock();
        if !state.connected {
            return Err(BusError::Transport("not connected".to_owned()));
        }
        state.calls.push((procedure.to_owned(), args));

        if let Some(message) = state.remote_failures.get(procedure).cloned() {
            return Err(BusError::Remote {
                procedure: procedure.to_owned(),
                message,
            });
        }

        let reply = state
            .responses
            .get_mut(procedure)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| BusError::Remote {
                procedure: procedure.to_owned(),
                message: "no handler registered".to_owned(),
            })?;

        if state.drop_after.as_deref() == Some(procedure) {
            state.connected = false;
        }
        Ok(reply)
    }

    async fn leave(&mut self) -> Result<()> {
        let mut state = self.lock();
        state.connected = false;
        state.joined_realm = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.lock().connected
    }
}
