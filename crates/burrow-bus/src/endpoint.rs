//! Server-side endpoint abstraction.
//!
//! A gateway consumes [`Invocation`]s from a [`BusEndpoint`] and answers
//! each through its reply handle. The fake pair wires a caller directly to
//! an endpoint for dispatcher tests.

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::error::{BusError, Result};

/// One pending remote procedure call.
#[derive(Debug)]
pub struct Invocation {
    /// Authenticated identity of the caller.
    pub device_id: String,
    /// Requested procedure.
    pub procedure: String,
    /// JSON arguments.
    pub args: Value,
    reply: oneshot::Sender<std::result::Result<Value, String>>,
}

impl Invocation {
    /// Build an invocation and the receiver its answer arrives on.
    #[must_use]
    pub fn new(
        device_id: impl Into<String>,
        procedure: impl Into<String>,
        args: Value,
    ) -> (Self, oneshot::Receiver<std::result::Result<Value, String>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                device_id: device_id.into(),
                procedure: procedure.into(),
                args,
                reply: tx,
            },
            rx,
        )
    }

    /// Answer with a successful result. The caller may have gone away;
    /// that is not an error for the handler.
    pub fn succeed(self, value: Value) {
        let _ = self.reply.send(Ok(value));
    }

    /// Answer with an application error.
    pub fn fail(self, message: impl Into<String>) {
        let _ = self.reply.send(Err(message.into()));
    }
}

/// Source of invocations for a dispatcher loop.
#[allow(async_fn_in_trait)]
pub trait BusEndpoint {
    /// Wait for the next invocation. `None` means the endpoint shut down.
    async fn next_invocation(&mut self) -> Result<Option<Invocation>>;
}

/// In-process endpoint fed by [`FakeBusCaller`]s.
#[derive(Debug)]
pub struct FakeBusEndpoint {
    rx: mpsc::Receiver<Invocation>,
}

/// Caller handle for driving a [`FakeBusEndpoint`] in tests.
#[derive(Debug, Clone)]
pub struct FakeBusCaller {
    tx: mpsc::Sender<Invocation>,
}

impl FakeBusEndpoint {
    /// Create an endpoint and a caller connected to it.
    #[must_use]
    pub fn pair() -> (Self, FakeBusCaller) {
        let (tx, rx) = mpsc::channel(64);
        (Self { rx }, FakeBusCaller { tx })
    }
}

impl BusEndpoint for FakeBusEndpoint {
    async fn next_invocation(&mut self) -> Result<Option<Invocation>> {
        Ok(self.rx.recv().await)
    }
}

impl FakeBusCaller {
    /// Invoke `procedure` as `device_id` and wait for the handler's answer.
    pub async fn call(&self, device_id: &str, procedure: &str, args: Value) -> Result<Value> {
        let (invocation, reply) = Invocation::new(device_id, procedure, args);
        self.tx
            .send(invocation)
            .await
            .map_err(|_| BusError::Transport("endpoint closed".to_owned()))?;

        match reply.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(BusError::Remote {
                procedure: procedure.to_owned(),
                message,
            }),
            Err(_) => Err(BusError::Transport("handler dropped reply".to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn caller_receives_handler_reply() {
        let (mut endpoint, caller) = FakeBusEndpoint::pair();

        let server = tokio::spawn(async move {
            let invocation = endpoint.next_invocation().await.unwrap().unwrap();
            assert_eq!(invocation.device_id, "router-7");
            assert_eq!(invocation.procedure, "request_status");
            invocation.succeed(json!({"present": false}));
        });

        let reply = caller
            .call("router-7", "request_status", json!({}))
            .await
            .unwrap();
        assert_eq!(reply, json!({"present": false}));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn handler_failure_surfaces_as_remote_error() {
        let (mut endpoint, caller) = FakeBusEndpoint::pair();

        tokio::spawn(async move {
            let invocation = endpoint.next_invocation().await.unwrap().unwrap();
            invocation.fail("device busy");
        });

        let err = caller
            .call("router-7", "open_interface", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Remote { ref message, .. } if message == "device busy"));
    }
}
