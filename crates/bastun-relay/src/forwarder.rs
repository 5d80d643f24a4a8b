//! Connection forwarder: pairs one accepted local TCP connection with one
//! gateway transport session and relays bytes both ways.
//!
//! The forwarder owns both ends exclusively. It drives the session through
//! `Handshaking → Forwarding → Closing`; the server marks it `Closed` when it
//! deregisters the session after [`ConnectionForwarder::run`] returns.
//!
//! While forwarding, two directional copies run concurrently:
//! - **local → gateway**: reads the local socket, sends `DATA` frames, and
//!   pings the gateway on the keepalive interval.
//! - **gateway → local**: receives `DATA` frames and writes them to the
//!   local socket.
//!
//! The first direction to finish (EOF or error), or cancellation, ends the
//! session; the other direction is dropped at that point, so a stalled read
//! never holds up teardown.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use bastun_core::{CredentialProvider, TargetSpec, TunnelError, TunnelResult};

use crate::config::RelayConfig;
use crate::session::{SessionId, SessionState, SessionStatus, TunnelEvent};
use crate::transport::{
    GatewayConnector, HandshakeRequest, TransportReader, TransportSession, TransportWriter,
};

/// Per-server settings shared by every forwarder.
#[derive(Clone)]
pub(crate) struct ForwardContext {
    pub url: String,
    pub target: TargetSpec,
    pub connector: Arc<dyn GatewayConnector>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub config: RelayConfig,
    pub events: broadcast::Sender<TunnelEvent>,
}

impl ForwardContext {
    pub fn emit(&self, event: TunnelEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Why a forwarding session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseCause {
    LocalEof,
    GatewayEof,
    Cancelled,
}

impl CloseCause {
    fn reason(self) -> &'static str {
        match self {
            CloseCause::LocalEof => "local connection closed",
            CloseCause::GatewayEof => "gateway closed",
            CloseCause::Cancelled => "relay shutting down",
        }
    }
}

/// Drives one tunnel session from handshake to teardown.
pub struct ConnectionForwarder {
    id: SessionId,
    local: TcpStream,
    peer: SocketAddr,
    status: Arc<SessionStatus>,
    cancel: CancellationToken,
    ctx: Arc<ForwardContext>,
}

impl ConnectionForwarder {
    pub(crate) fn new(
        id: SessionId,
        local: TcpStream,
        peer: SocketAddr,
        status: Arc<SessionStatus>,
        cancel: CancellationToken,
        ctx: Arc<ForwardContext>,
    ) -> Self {
        Self {
            id,
            local,
            peer,
            status,
            cancel,
            ctx,
        }
    }

    /// Run the session to completion. Both the local socket and the
    /// transport are closed by the time this returns, whatever the outcome.
    ///
    /// Errors are session-local: a rejected handshake returns
    /// [`TunnelError::TunnelRejected`], a relay failure
    /// [`TunnelError::Forwarding`]. Cancellation is not an error.
    pub async fn run(self) -> TunnelResult<()> {
        let Self {
            id,
            local,
            peer,
            status,
            cancel,
            ctx,
        } = self;

        // Handshaking
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(session_id = %id, "cancelled during handshake");
                return Ok(());
            }
            result = open_transport(&id, &ctx) => result,
        };

        let transport = match opened {
            Ok(transport) => transport,
            Err(TunnelError::TunnelRejected { code, reason }) => {
                warn!(session_id = %id, peer = %peer, code, reason = %reason, "gateway rejected tunnel");
                ctx.emit(TunnelEvent::SessionRejected {
                    session_id: id.clone(),
                    code,
                    reason: reason.clone(),
                });
                // Dropping `local` closes it without relaying a byte.
                return Err(TunnelError::TunnelRejected { code, reason });
            }
            Err(e) => {
                warn!(session_id = %id, peer = %peer, error = %e, "failed to open tunnel");
                ctx.emit(TunnelEvent::SessionFailed {
                    session_id: id.clone(),
                    error: e.to_string(),
                });
                return Err(e);
            }
        };

        // Forwarding
        let node_id = transport.node_id().map(str::to_owned);
        status.set_state(SessionState::Forwarding);
        ctx.emit(TunnelEvent::SessionForwarding {
            session_id: id.clone(),
            node_id,
        });
        info!(session_id = %id, peer = %peer, "forwarding");

        let (mut writer, mut reader) = transport.split();
        let (mut local_read, mut local_write) = local.into_split();

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Ok(CloseCause::Cancelled),
            result = local_to_gateway(&mut local_read, &mut writer, &status, &ctx.config) => {
                result.map(|()| CloseCause::LocalEof)
            }
            result = gateway_to_local(&mut reader, &mut local_write, &status) => {
                result.map(|()| CloseCause::GatewayEof)
            }
        };

        // Closing
        status.set_state(SessionState::Closing);
        let reason = match &outcome {
            Ok(cause) => cause.reason(),
            Err(_) => "forwarding error",
        };
        let grace = ctx.config.close_grace;
        if time::timeout(grace, writer.close(reason)).await.is_err() {
            debug!(session_id = %id, "gateway close timed out");
        }
        let _ = time::timeout(grace, local_write.shutdown()).await;
        drop(reader);
        drop(local_read);

        match outcome {
            Ok(cause) => {
                debug!(
                    session_id = %id,
                    reason = cause.reason(),
                    sent = status.bytes_sent(),
                    received = status.bytes_received(),
                    "session finished"
                );
                Ok(())
            }
            Err(e) => {
                warn!(session_id = %id, error = %e, "forwarding failed");
                ctx.emit(TunnelEvent::SessionFailed {
                    session_id: id.clone(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }
}

async fn open_transport(id: &SessionId, ctx: &ForwardContext) -> TunnelResult<TransportSession> {
    let token = ctx.credentials.access_token().await?;
    let request = HandshakeRequest {
        url: ctx.url.clone(),
        session_id: id.to_string(),
        target: ctx.target.clone(),
        token,
    };
    ctx.connector.connect(&request, &ctx.config).await
}

async fn local_to_gateway(
    local: &mut OwnedReadHalf,
    writer: &mut TransportWriter,
    status: &SessionStatus,
    config: &RelayConfig,
) -> TunnelResult<()> {
    let mut buf = vec![0u8; config.buffer_size.max(1)];
    let mut keepalive = config.keepalive_interval.filter(|every| !every.is_zero()).map(|every| {
        let mut ticker = time::interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });

    loop {
        tokio::select! {
            result = local.read(&mut buf) => {
                let n = result.map_err(|e| TunnelError::Forwarding(format!("local read error: {e}")))?;
                if n == 0 {
                    return Ok(());
                }
                writer.send(&buf[..n]).await?;
                status.add_sent(n);
            }
            _ = next_tick(&mut keepalive) => {
                writer.ping().await?;
            }
        }
    }
}

async fn gateway_to_local(
    reader: &mut TransportReader,
    local: &mut OwnedWriteHalf,
    status: &SessionStatus,
) -> TunnelResult<()> {
    while let Some(data) = reader.recv().await? {
        local
            .write_all(&data)
            .await
            .map_err(|e| TunnelError::Forwarding(format!("local write error: {e}")))?;
        status.add_received(data.len());
    }
    Ok(())
}

/// Wait for the next keepalive tick; never resolves when keepalive is off.
async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
