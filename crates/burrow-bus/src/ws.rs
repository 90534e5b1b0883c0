//! WebSocket implementations of the transport and endpoint traits.
//!
//! Frames are JSON text messages. The client opens with a hello frame
//! carrying its realm, device id and certificate; the endpoint verifies the
//! certificate against the realm CA before admitting calls. Over `wss://`
//! the socket itself is TLS with the device certificate as client identity.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{
    accept_async, connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use crate::auth::verify_client_certificate;
use crate::endpoint::{BusEndpoint, Invocation};
use crate::error::{BusError, Result};
use crate::transport::{BusTransport, TlsIdentity};

/// Wire frames exchanged on the bus socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Frame {
    Hello {
        realm: String,
        device_id: String,
        certificate_pem: String,
    },
    Welcome {
        session: u64,
    },
    Abort {
        reason: String,
    },
    Call {
        id: u64,
        procedure: String,
        args: Value,
    },
    Reply {
        id: u64,
        result: Value,
    },
    CallError {
        id: u64,
        message: String,
    },
    Goodbye,
}

async fn send_frame<S>(stream: &mut S, frame: &Frame) -> Result<()>
where
    S: futures::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let text = serde_json::to_string(frame).map_err(|e| BusError::Codec(e.to_string()))?;
    stream
        .send(WsMessage::Text(text))
        .await
        .map_err(|e| BusError::Transport(e.to_string()))
}

async fn recv_frame<S>(stream: &mut S) -> Result<Frame>
where
    S: futures::Stream<Item = tokio_tungstenite::tungstenite::Result<WsMessage>> + Unpin,
{
    loop {
        match stream.next().await {
            None => return Err(BusError::Transport("connection closed".to_owned())),
            Some(Err(e)) => return Err(BusError::Transport(e.to_string())),
            Some(Ok(WsMessage::Text(text))) => {
                return serde_json::from_str(&text).map_err(|e| BusError::Codec(e.to_string()));
            }
            Some(Ok(WsMessage::Close(_))) => {
                return Err(BusError::Transport("closed by peer".to_owned()));
            }
            // Pings are answered by the websocket layer on the next send.
            Some(Ok(_)) => {}
        }
    }
}

type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket [`BusTransport`].
#[derive(Debug, Default)]
pub struct WsTransport {
    stream: Option<ClientStream>,
    identity: Option<TlsIdentity>,
    next_call_id: u64,
}

impl WsTransport {
    /// Create a disconnected transport.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn tls_connector(identity: &TlsIdentity) -> Result<Connector> {
        let client_identity = native_tls::Identity::from_pkcs8(
            identity.certificate_pem.as_bytes(),
            identity.private_key_pem.as_bytes(),
        )
        .map_err(|e| BusError::Auth(format!("bad client identity: {e}")))?;
        let ca = native_tls::Certificate::from_pem(identity.ca_certificate_pem.as_bytes())
            .map_err(|e| BusError::Auth(format!("bad CA certificate: {e}")))?;

        let connector = native_tls::TlsConnector::builder()
            .identity(client_identity)
            .add_root_certificate(ca)
            .build()
            .map_err(|e| BusError::Transport(e.to_string()))?;
        Ok(Connector::NativeTls(connector))
    }

    fn stream_mut(&mut self) -> Result<&mut ClientStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| BusError::Transport("not connected".to_owned()))
    }
}

impl BusTransport for WsTransport {
    async fn connect(&mut self, broker_url: &str, identity: &TlsIdentity) -> Result<()> {
        let connector = if broker_url.starts_with("wss://") {
            Some(Self::tls_connector(identity)?)
        } else {
            None
        };

        let (stream, _response) =
            connect_async_tls_with_config(broker_url, None, false, connector)
                .await
                .map_err(|e| BusError::Transport(e.to_string()))?;

        debug!(broker_url, "bus socket established");
        self.stream = Some(stream);
        self.identity = Some(identity.clone());
        Ok(())
    }

    async fn join(&mut self, realm: &str) -> Result<()> {
        let identity = self
            .identity
            .clone()
            .ok_or_else(|| BusError::Transport("not connected".to_owned()))?;
        let hello = Frame::Hello {
            realm: realm.to_owned(),
            device_id: identity.device_id.clone(),
            certificate_pem: identity.certificate_pem.clone(),
        };

        let stream = self.stream_mut()?;
        send_frame(stream, &hello).await?;
        match recv_frame(stream).await? {
            Frame::Welcome { session } => {
                debug!(session, realm, "admitted to realm");
                Ok(())
            }
            Frame::Abort { reason } => {
                self.stream = None;
                Err(BusError::Auth(reason))
            }
            other => Err(BusError::Codec(format!("unexpected frame {other:?}"))),
        }
    }

    async fn call(&mut self, procedure: &str, args: Value, timeout: Duration) -> Result<Value> {
        self.next_call_id += 1;
        let call_id = self.next_call_id;
        let frame = Frame::Call {
            id: call_id,
            procedure: procedure.to_owned(),
            args,
        };

        let stream = self.stream_mut()?;
        send_frame(stream, &frame).await?;

        let outcome = tokio::time::timeout(timeout, async {
            loop {
                match recv_frame(stream).await? {
                    Frame::Reply { id, result } if id == call_id => return Ok(result),
                    Frame::CallError { id, message } if id == call_id => {
                        return Err(BusError::Remote {
                            procedure: procedure.to_owned(),
                            message,
                        });
                    }
                    other => warn!(?other, "ignoring out-of-band frame"),
                }
            }
        })
        .await;

        match outcome {
            Ok(result) => {
                if matches!(result, Err(BusError::Transport(_))) {
                    self.stream = None;
                }
                result
            }
            Err(_elapsed) => {
                // Reply correlation is lost; drop the connection.
                self.stream = None;
                Err(BusError::Timeout {
                    procedure: procedure.to_owned(),
                    secs: timeout.as_secs(),
                })
            }
        }
    }

    async fn leave(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = send_frame(&mut stream, &Frame::Goodbye).await;
            let _ = stream.close(None).await;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

/// Listening WebSocket [`BusEndpoint`].
///
/// Each accepted connection is served by its own task; invocations from all
/// connections funnel into one queue for the dispatcher.
#[derive(Debug)]
pub struct WsEndpoint {
    rx: mpsc::Receiver<Invocation>,
    local_addr: SocketAddr,
}

impl WsEndpoint {
    /// Bind the endpoint and start accepting connections.
    pub async fn bind(
        addr: SocketAddr,
        realm: impl Into<String>,
        ca_certificate_pem: impl Into<String>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| BusError::Transport(format!("bind {addr}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| BusError::Transport(e.to_string()))?;

        info!(addr = %local_addr, "bus endpoint listening");

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(accept_loop(
            listener,
            realm.into(),
            ca_certificate_pem.into(),
            tx,
        ));

        Ok(Self { rx, local_addr })
    }

    /// Address the endpoint is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl BusEndpoint for WsEndpoint {
    async fn next_invocation(&mut self) -> Result<Option<Invocation>> {
        Ok(self.rx.recv().await)
    }
}

async fn accept_loop(
    listener: TcpListener,
    realm: String,
    ca_certificate_pem: String,
    tx: mpsc::Sender<Invocation>,
) {
    let session_counter = Arc::new(AtomicU64::new(0));
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "accepted bus connection");
                let realm = realm.clone();
                let ca = ca_certificate_pem.clone();
                let tx = tx.clone();
                let counter = Arc::clone(&session_counter);
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(stream, &realm, &ca, &counter, tx).await {
                        debug!(%peer, error = %e, "bus connection ended");
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    realm: &str,
    ca_certificate_pem: &str,
    session_counter: &AtomicU64,
    tx: mpsc::Sender<Invocation>,
) -> Result<()> {
    let mut ws = accept_async(stream)
        .await
        .map_err(|e| BusError::Transport(e.to_string()))?;

    let (device_id, certificate_pem) = match recv_frame(&mut ws).await? {
        Frame::Hello {
            realm: client_realm,
            device_id,
            certificate_pem,
        } => {
            if client_realm != realm {
                let reason = format!("unknown realm '{client_realm}'");
                send_frame(&mut ws, &Frame::Abort { reason: reason.clone() }).await?;
                return Err(BusError::Auth(reason));
            }
            (device_id, certificate_pem)
        }
        other => {
            return Err(BusError::Codec(format!(
                "expected hello, got {other:?}"
            )));
        }
    };

    if let Err(e) = verify_client_certificate(&certificate_pem, ca_certificate_pem, &device_id) {
        warn!(device_id, error = %e, "rejecting bus client");
        send_frame(
            &mut ws,
            &Frame::Abort {
                reason: e.to_string(),
            },
        )
        .await?;
        return Err(e);
    }

    let session = session_counter.fetch_add(1, Ordering::SeqCst) + 1;
    info!(device_id, session, "bus client admitted");
    send_frame(&mut ws, &Frame::Welcome { session }).await?;

    loop {
        match recv_frame(&mut ws).await {
            Ok(Frame::Call {
                id,
                procedure,
                args,
            }) => {
                let (invocation, reply) = Invocation::new(&device_id, &procedure, args);
                if tx.send(invocation).await.is_err() {
                    send_frame(
                        &mut ws,
                        &Frame::CallError {
                            id,
                            message: "endpoint shutting down".to_owned(),
                        },
                    )
                    .await?;
                    break;
                }

                let answer = match reply.await {
                    Ok(Ok(result)) => Frame::Reply { id, result },
                    Ok(Err(message)) => Frame::CallError { id, message },
                    Err(_) => Frame::CallError {
                        id,
                        message: "handler abandoned the call".to_owned(),
                    },
                };
                send_frame(&mut ws, &answer).await?;
            }
            Ok(Frame::Goodbye) => {
                debug!(device_id, session, "bus client left");
                let _ = ws.close(None).await;
                break;
            }
            Ok(other) => {
                warn!(device_id, ?other, "protocol violation, closing");
                break;
            }
            Err(_) => break,
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::procedures;
    use crate::session::BusSession;
    use burrow_identity::{FakeAutosign, IdentityStore};
    use serde_json::json;
    use std::path::PathBuf;
    use zeroize::Zeroizing;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "burrow-bus-ws-{tag}-{}-{}",
            std::process::id(),
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    async fn identity_for(ca: &FakeAutosign, device_id: &str, tag: &str) -> TlsIdentity {
        let dir = temp_dir(tag);
        let store = IdentityStore::new(
            device_id,
            "burrow-ca",
            dir.join(format!("{device_id}.key")),
            dir.join(format!("{device_id}.pem")),
            chrono::Duration::days(30),
            ca.clone(),
        );
        let identity = store.ensure_identity().await.unwrap();
        TlsIdentity::new(
            device_id,
            identity.certificate_pem.clone(),
            Zeroizing::new(identity.private_key_pem.to_string()),
            ca.ca_certificate_pem(),
        )
    }

    #[test]
    fn frames_round_trip_as_tagged_json() {
        let frame = Frame::Call {
            id: 3,
            procedure: "request_status".to_owned(),
            args: json!({"device_id": "router-7"}),
        };
        let text = serde_json::to_string(&frame).unwrap();
        assert!(text.contains("\"type\":\"call\""));
        let back: Frame = serde_json::from_str(&text).unwrap();
        assert!(matches!(back, Frame::Call { id: 3, .. }));
    }

    #[tokio::test]
    async fn call_round_trips_through_endpoint() {
        let ca = FakeAutosign::new("burrow-ca", 365);
        let mut endpoint = WsEndpoint::bind(
            "127.0.0.1:0".parse().unwrap(),
            "burrow",
            ca.ca_certificate_pem(),
        )
        .await
        .unwrap();
        let url = format!("ws://{}", endpoint.local_addr());

        tokio::spawn(async move {
            while let Ok(Some(invocation)) = endpoint.next_invocation().await {
                assert_eq!(invocation.device_id, "router-7");
                assert_eq!(invocation.procedure, procedures::REQUEST_STATUS);
                invocation.succeed(json!({"present": false, "peer_count": 0}));
            }
        });

        let identity = identity_for(&ca, "router-7", "roundtrip").await;
        let mut session = BusSession::new(WsTransport::new());
        session.connect(&url, &identity).await.unwrap();
        session.join("burrow").await.unwrap();

        let reply = session
            .call(
                procedures::REQUEST_STATUS,
                json!({"device_id": "router-7"}),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(reply["present"], json!(false));

        session.leave().await.unwrap();
    }

    #[tokio::test]
    async fn foreign_certificate_is_aborted_at_join() {
        let realm_ca = FakeAutosign::new("burrow-ca", 365);
        let rogue_ca = FakeAutosign::new("rogue-ca", 365);

        let endpoint = WsEndpoint::bind(
            "127.0.0.1:0".parse().unwrap(),
            "burrow",
            realm_ca.ca_certificate_pem(),
        )
        .await
        .unwrap();
        let url = format!("ws://{}", endpoint.local_addr());

        let identity = identity_for(&rogue_ca, "router-7", "rogue-join").await;
        let mut session = BusSession::new(WsTransport::new());
        session.connect(&url, &identity).await.unwrap();

        let err = session.join("burrow").await.unwrap_err();
        assert!(matches!(err, BusError::Auth(_)));
    }

    #[tokio::test]
    async fn wrong_realm_is_aborted_at_join() {
        let ca = FakeAutosign::new("burrow-ca", 365);
        let endpoint = WsEndpoint::bind(
            "127.0.0.1:0".parse().unwrap(),
            "burrow",
            ca.ca_certificate_pem(),
        )
        .await
        .unwrap();
        let url = format!("ws://{}", endpoint.local_addr());

        let identity = identity_for(&ca, "router-7", "wrong-realm").await;
        let mut session = BusSession::new(WsTransport::new());
        session.connect(&url, &identity).await.unwrap();

        let err = session.join("other-realm").await.unwrap_err();
        assert!(matches!(err, BusError::Auth(ref reason) if reason.contains("realm")));
    }

    #[tokio::test]
    async fn handler_error_surfaces_as_remote() {
        let ca = FakeAutosign::new("burrow-ca", 365);
        let mut endpoint = WsEndpoint::bind(
            "127.0.0.1:0".parse().unwrap(),
            "burrow",
            ca.ca_certificate_pem(),
        )
        .await
        .unwrap();
        let url = format!("ws://{}", endpoint.local_addr());

        tokio::spawn(async move {
            while let Ok(Some(invocation)) = endpoint.next_invocation().await {
                invocation.fail("tunnel already exists with different parameters");
            }
        });

        let identity = identity_for(&ca, "router-7", "remote-err").await;
        let mut session = BusSession::new(WsTransport::new());
        session.connect(&url, &identity).await.unwrap();
        session.join("burrow").await.unwrap();

        let err = session
            .call(procedures::OPEN_INTERFACE, json!({}), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Remote { ref message, .. }
            if message.contains("different parameters")));
    }
}
