//! WebSocket transport to the gateway.
//!
//! One [`TransportSession`] carries exactly one forwarded byte stream. The
//! session is opened by connecting to the gateway's tunnel URL and sending a
//! `handshake` control frame; the gateway answers with `handshake_ok` or
//! `handshake_reject`. After a successful handshake every `DATA` frame is
//! opaque tunnel payload.
//!
//! For concurrent forwarding the session is split into a [`TransportWriter`]
//! and a [`TransportReader`], each owned by one direction of the relay.

use std::future::Future;
use std::pin::Pin;
use std::sync::Once;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use bastun_core::codec::{control_frame, data_frame, decode_frame, Frame};
use bastun_core::messages::{ControlMessage, PROTOCOL_TCP_TUNNEL, PROTOCOL_VERSION};
use bastun_core::{AccessToken, TargetSpec, TunnelError, TunnelResult};

use crate::config::RelayConfig;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Everything a transport needs to authorize one tunnel session.
#[derive(Debug, Clone)]
pub struct HandshakeRequest {
    /// Tunnel endpoint (`wss://…`).
    pub url: String,
    pub session_id: String,
    pub target: TargetSpec,
    pub token: AccessToken,
}

impl HandshakeRequest {
    fn to_message(&self) -> ControlMessage {
        ControlMessage::Handshake {
            version: PROTOCOL_VERSION,
            protocol: PROTOCOL_TCP_TUNNEL.to_string(),
            session_id: self.session_id.clone(),
            target_resource_id: self.target.resource_id().to_string(),
            target_port: self.target.port(),
            access_token: self.token.secret().to_string(),
        }
    }
}

/// Opens authenticated transport sessions to the gateway.
///
/// The relay only talks to the gateway through this trait, so tests can
/// count or intercept outbound connection attempts.
pub trait GatewayConnector: Send + Sync {
    fn connect<'a>(
        &'a self,
        request: &'a HandshakeRequest,
        config: &'a RelayConfig,
    ) -> Pin<Box<dyn Future<Output = TunnelResult<TransportSession>> + Send + 'a>>;
}

/// The production connector: WebSocket (over TLS for `wss://`).
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

impl GatewayConnector for WebSocketConnector {
    fn connect<'a>(
        &'a self,
        request: &'a HandshakeRequest,
        config: &'a RelayConfig,
    ) -> Pin<Box<dyn Future<Output = TunnelResult<TransportSession>> + Send + 'a>> {
        Box::pin(TransportSession::connect(request, config.handshake_timeout))
    }
}

/// Install the process-wide rustls crypto provider once.
fn ensure_crypto_provider() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        // Err means another component already installed one, which is fine.
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// An authenticated connection to the gateway carrying one byte stream.
pub struct TransportSession {
    ws: WsStream,
    session_id: String,
    node_id: Option<String>,
}

impl TransportSession {
    /// Connect to the gateway and perform the handshake.
    ///
    /// Connecting and the handshake together must finish within
    /// `handshake_timeout`. A refusal from the gateway surfaces as
    /// [`TunnelError::TunnelRejected`].
    pub async fn connect(request: &HandshakeRequest, handshake_timeout: Duration) -> TunnelResult<Self> {
        if request.url.to_ascii_lowercase().starts_with("wss://") {
            ensure_crypto_provider();
        }

        let attempt = async {
            let (ws, _response) = connect_async(request.url.as_str())
                .await
                .map_err(|e| TunnelError::Transport(format!("WebSocket connect error: {e}")))?;
            debug!(session_id = %request.session_id, url = %request.url, "WebSocket connected");

            let mut session = Self {
                ws,
                session_id: request.session_id.clone(),
                node_id: None,
            };
            session.handshake(request).await?;
            Ok::<_, TunnelError>(session)
        };

        time::timeout(handshake_timeout, attempt)
            .await
            .map_err(|_| TunnelError::Timeout)?
    }

    async fn handshake(&mut self, request: &HandshakeRequest) -> TunnelResult<()> {
        let frame = control_frame(&request.to_message())?;
        self.ws
            .send(Message::Binary(frame))
            .await
            .map_err(|e| TunnelError::Transport(format!("handshake send error: {e}")))?;

        loop {
            let data = match self.ws.next().await {
                Some(Ok(Message::Binary(data))) => data,
                Some(Ok(Message::Close(_))) | None => {
                    return Err(TunnelError::Transport(
                        "gateway closed the connection during handshake".into(),
                    ));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Err(TunnelError::Transport(format!("handshake read error: {e}")));
                }
            };

            match decode_frame(&data)? {
                Frame::Control(ControlMessage::HandshakeOk { node_id, .. }) => {
                    info!(
                        session_id = %self.session_id,
                        node_id = node_id.as_deref().unwrap_or("-"),
                        target_port = request.target.port(),
                        token = %request.token,
                        "gateway accepted tunnel"
                    );
                    self.node_id = node_id;
                    return Ok(());
                }
                Frame::Control(ControlMessage::HandshakeReject { code, reason }) => {
                    return Err(TunnelError::TunnelRejected { code, reason });
                }
                Frame::Control(ControlMessage::Close { reason }) => {
                    return Err(TunnelError::TunnelRejected {
                        code: 0,
                        reason: reason.unwrap_or_else(|| "closed by gateway".into()),
                    });
                }
                Frame::Control(other) => {
                    warn!(session_id = %self.session_id, ?other, "unexpected control message during handshake");
                }
                Frame::Data(_) => {
                    return Err(TunnelError::Transport(
                        "gateway sent data before acknowledging the handshake".into(),
                    ));
                }
            }
        }
    }

    /// Gateway node serving this session, if the gateway reported one.
    pub fn node_id(&self) -> Option<&str> {
        self.node_id.as_deref()
    }

    /// Split into independently owned write and read halves.
    pub fn split(self) -> (TransportWriter, TransportReader) {
        let (sink, stream) = self.ws.split();
        (
            TransportWriter {
                sink,
                session_id: self.session_id.clone(),
                closed: false,
            },
            TransportReader {
                stream,
                session_id: self.session_id,
            },
        )
    }
}

/// Write half: sends data frames, keepalive pings, and the final close.
pub struct TransportWriter {
    sink: SplitSink<WsStream, Message>,
    session_id: String,
    closed: bool,
}

impl TransportWriter {
    pub async fn send(&mut self, data: &[u8]) -> TunnelResult<()> {
        self.sink
            .send(Message::Binary(data_frame(data)))
            .await
            .map_err(|e| TunnelError::Forwarding(format!("gateway write error: {e}")))
    }

    pub async fn ping(&mut self) -> TunnelResult<()> {
        self.sink
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(|e| TunnelError::Forwarding(format!("keepalive ping failed: {e}")))
    }

    /// Tell the gateway the tunnel is over and close the WebSocket.
    /// Safe to call more than once; only the first call sends anything.
    pub async fn close(&mut self, reason: &str) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Ok(frame) = control_frame(&ControlMessage::close(reason)) {
            let _ = self.sink.send(Message::Binary(frame)).await;
        }
        let _ = self.sink.send(Message::Close(None)).await;
        let _ = self.sink.close().await;
        debug!(session_id = %self.session_id, reason, "transport closed");
    }
}

/// Read half: yields tunnel payloads until the gateway ends the stream.
pub struct TransportReader {
    stream: SplitStream<WsStream>,
    session_id: String,
}

impl TransportReader {
    /// Next chunk of tunnel bytes. `Ok(None)` is EOF: a close frame, a
    /// `close` control message, or the end of the stream.
    pub async fn recv(&mut self) -> TunnelResult<Option<Vec<u8>>> {
        loop {
            let data = match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => data,
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                // Pongs for incoming pings are queued by tungstenite itself.
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Err(TunnelError::Forwarding(format!("gateway read error: {e}")));
                }
            };

            match decode_frame(&data).map_err(|e| TunnelError::Forwarding(e.to_string()))? {
                Frame::Data(payload) if payload.is_empty() => continue,
                Frame::Data(payload) => return Ok(Some(payload)),
                Frame::Control(ControlMessage::Close { reason }) => {
                    debug!(
                        session_id = %self.session_id,
                        reason = reason.as_deref().unwrap_or("-"),
                        "gateway closed tunnel"
                    );
                    return Ok(None);
                }
                Frame::Control(other) => {
                    warn!(session_id = %self.session_id, ?other, "ignoring control message while forwarding");
                }
            }
        }
    }
}
