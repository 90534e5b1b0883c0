//! Client session state machine.

use std::fmt;
use std::time::Duration;

use serde_json::Value;

use crate::error::{BusError, Result};
use crate::transport::{BusTransport, TlsIdentity};

/// Lifecycle of a bus session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No connection.
    Disconnected,
    /// Connection attempt in progress.
    Connecting,
    /// Connected and authenticated, not yet in a realm.
    Authenticated,
    /// Attached to a realm; calls are allowed.
    Joined,
    /// Graceful shutdown in progress.
    Leaving,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticated => "authenticated",
            Self::Joined => "joined",
            Self::Leaving => "leaving",
        };
        f.write_str(name)
    }
}

/// Bus session enforcing connect / join / call / leave ordering on top of a
/// [`BusTransport`].
///
/// Calls are only permitted while `Joined`, one at a time. A transport
/// failure during a call drops the session back to `Disconnected` and every
/// later operation except `connect` is refused, so callers observe the
/// disconnect before any state they created through the session goes stale.
#[derive(Debug)]
pub struct BusSession<T> {
    transport: T,
    state: SessionState,
}

impl<T: BusTransport> BusSession<T> {
    /// Wrap a transport in a fresh session.
    #[must_use]
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            state: SessionState::Disconnected,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    fn expect(&self, operation: &'static str, expected: SessionState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(BusError::State {
                operation,
                state: self.state.to_string(),
            })
        }
    }

    /// Open the authenticated connection.
    pub async fn connect(&mut self, broker_url: &str, identity: &TlsIdentity) -> Result<()> {
        self.expect("connect", SessionState::Disconnected)?;
        self.state = SessionState::Connecting;
        tracing::debug!(broker_url, device_id = %identity.device_id, "connecting to bus");

        match self.transport.connect(broker_url, identity).await {
            Ok(()) => {
                self.state = SessionState::Authenticated;
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Disconnected;
                Err(e)
            }
        }
    }

    /// Attach to `realm`.
    pub async fn join(&mut self, realm: &str) -> Result<()> {
        self.expect("join", SessionState::Authenticated)?;
        match self.transport.join(realm).await {
            Ok(()) => {
                tracing::debug!(realm, "joined realm");
                self.state = SessionState::Joined;
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Disconnected;
                Err(e)
            }
        }
    }

    /// Invoke `procedure` and wait for the reply.
    pub async fn call(&mut self, procedure: &str, args: Value, timeout: Duration) -> Result<Value> {
        self.expect("call", SessionState::Joined)?;
        let result = self.transport.call(procedure, args, timeout).await;

        if !self.transport.is_connected() {
            tracing::warn!(procedure, "connection lost during call");
            self.state = SessionState::Disconnected;
        }
        if matches!(result, Err(BusError::Transport(_))) {
            self.state = SessionState::Disconnected;
        }
        result
    }

    /// Detach and close the connection.
    pub async fn leave(&mut self) -> Result<()> {
        self.expect("leave", SessionState::Joined)?;
        self.state = SessionState::Leaving;
        let result = self.transport.leave().await;
        self.state = SessionState::Disconnected;
        result
    }
}
