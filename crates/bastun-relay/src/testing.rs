//! In-process gateway used by the relay tests.
//!
//! Speaks the server side of the tunnel protocol over plain `ws://` on an
//! ephemeral loopback port and records every handshake it receives.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

use bastun_core::codec::{control_frame, data_frame, decode_frame, Frame};
use bastun_core::gateway::{GatewayDescriptor, Sku};
use bastun_core::messages::{ControlMessage, RejectCode};

/// How the fake gateway answers a handshake.
#[derive(Debug, Clone)]
pub(crate) enum GatewayMode {
    /// Accept, then echo every data frame back.
    Echo,
    /// Refuse the handshake.
    Reject { code: u32, reason: String },
    /// Never answer the handshake.
    Silent,
    /// Accept, then immediately close the tunnel.
    CloseAfterAck,
}

impl GatewayMode {
    pub fn reject(reason: &str) -> Self {
        GatewayMode::Reject {
            code: RejectCode::AuthFailed.into(),
            reason: reason.to_string(),
        }
    }
}

pub(crate) struct FakeGateway {
    addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    handshakes: Arc<Mutex<Vec<ControlMessage>>>,
    task: JoinHandle<()>,
}

impl FakeGateway {
    pub async fn start(mode: GatewayMode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let handshakes = Arc::new(Mutex::new(Vec::new()));

        let task = {
            let connections = connections.clone();
            let handshakes = handshakes.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    connections.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(stream, mode.clone(), handshakes.clone()));
                }
            })
        };

        Self {
            addr,
            connections,
            handshakes,
            task,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/webtunnelv2", self.addr)
    }

    /// A tunneling-enabled descriptor pointing at this gateway.
    pub fn descriptor(&self) -> GatewayDescriptor {
        GatewayDescriptor {
            id: "/subscriptions/s/resourceGroups/rg/providers/Microsoft.Network/bastionHosts/fake"
                .into(),
            name: "fake".into(),
            dns_name: self.url(),
            sku: Sku {
                name: "Standard".into(),
            },
            enable_tunneling: Some(true),
        }
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn handshakes(&self) -> Vec<ControlMessage> {
        self.handshakes.lock().unwrap().clone()
    }
}

impl Drop for FakeGateway {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn send_control(ws: &mut WebSocketStream<TcpStream>, msg: &ControlMessage) {
    let frame = control_frame(msg).unwrap();
    let _ = ws.send(Message::Binary(frame)).await;
}

async fn serve(stream: TcpStream, mode: GatewayMode, handshakes: Arc<Mutex<Vec<ControlMessage>>>) {
    let Ok(mut ws) = accept_async(stream).await else {
        return;
    };

    let first = match ws.next().await {
        Some(Ok(Message::Binary(data))) => data,
        _ => return,
    };
    match decode_frame(&first) {
        Ok(Frame::Control(msg @ ControlMessage::Handshake { .. })) => {
            handshakes.lock().unwrap().push(msg);
        }
        _ => return,
    }

    let ok = ControlMessage::HandshakeOk {
        node_id: Some("node-1".into()),
        tunnel_token: None,
    };

    match mode {
        GatewayMode::Silent => while let Some(Ok(_)) = ws.next().await {},
        GatewayMode::Reject { code, reason } => {
            send_control(&mut ws, &ControlMessage::HandshakeReject { code, reason }).await;
            let _ = ws.close(None).await;
        }
        GatewayMode::CloseAfterAck => {
            send_control(&mut ws, &ok).await;
            send_control(&mut ws, &ControlMessage::close("done")).await;
            let _ = ws.close(None).await;
        }
        GatewayMode::Echo => {
            send_control(&mut ws, &ok).await;
            while let Some(Ok(msg)) = ws.next().await {
                let data = match msg {
                    Message::Binary(data) => data,
                    Message::Close(_) => break,
                    _ => continue,
                };
                match decode_frame(&data) {
                    Ok(Frame::Data(payload)) => {
                        if ws.send(Message::Binary(data_frame(&payload))).await.is_err() {
                            break;
                        }
                    }
                    Ok(Frame::Control(ControlMessage::Close { .. })) => break,
                    _ => {}
                }
            }
        }
    }
}
