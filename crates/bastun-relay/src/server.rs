//! Local tunnel server.
//!
//! Binds a TCP listener on the caller's host and port (0 picks an ephemeral
//! port), accepts local clients, and hands each one to a
//! [`ConnectionForwarder`] that relays it through the gateway to the target.
//!
//! The accept loop runs in its own task whose handle the server keeps.
//! [`TunnelServer::cleanup`] is the single teardown path: it stops the accept
//! loop, closes the listener, and closes every active session. The session
//! registry is guarded by one lock, so a connection accepted while cleanup
//! runs is either registered (and closed by cleanup) or dropped by the
//! accept loop itself.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use bastun_core::{CredentialProvider, GatewayDescriptor, TargetSpec, TunnelError, TunnelResult};

use crate::config::RelayConfig;
use crate::forwarder::{ConnectionForwarder, ForwardContext};
use crate::session::{SessionId, SessionInfo, SessionState, SessionStatus, TunnelEvent};
use crate::transport::{GatewayConnector, WebSocketConnector};

/// Pause after a failed `accept()` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

struct SessionEntry {
    peer: SocketAddr,
    opened_at: Instant,
    status: Arc<SessionStatus>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Registry {
    shutting_down: bool,
    sessions: HashMap<SessionId, SessionEntry>,
}

/// Local TCP listener that forwards every accepted connection through the
/// gateway to one target resource port.
pub struct TunnelServer {
    host: String,
    requested_port: u16,
    gateway: GatewayDescriptor,
    ctx: Arc<ForwardContext>,
    registry: Arc<Mutex<Registry>>,
    shutdown: CancellationToken,
    local_port: OnceLock<u16>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    cleaned_up: Mutex<bool>,
}

impl TunnelServer {
    /// Create a server. Nothing is bound until [`start_server`](Self::start_server).
    ///
    /// Fails with [`TunnelError::Configuration`] when the gateway does not
    /// permit native-client tunneling; no network activity happens first.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        gateway: GatewayDescriptor,
        target: TargetSpec,
        credentials: Arc<dyn CredentialProvider>,
    ) -> TunnelResult<Self> {
        gateway.ensure_tunneling_supported()?;

        let config = RelayConfig::default();
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let ctx = ForwardContext {
            url: gateway.tunnel_url(),
            target,
            connector: Arc::new(WebSocketConnector),
            credentials,
            config,
            events,
        };

        Ok(Self {
            host: host.into(),
            requested_port: port,
            gateway,
            ctx: Arc::new(ctx),
            registry: Arc::new(Mutex::new(Registry::default())),
            shutdown: CancellationToken::new(),
            local_port: OnceLock::new(),
            accept_task: Mutex::new(None),
            cleaned_up: Mutex::new(false),
        })
    }

    /// Replace the gateway connector.
    pub fn with_connector(mut self, connector: Arc<dyn GatewayConnector>) -> Self {
        Arc::make_mut(&mut self.ctx).connector = connector;
        self
    }

    /// Replace the relay configuration. Resets the event channel, so call
    /// this before [`subscribe`](Self::subscribe).
    pub fn with_config(mut self, config: RelayConfig) -> Self {
        let ctx = Arc::make_mut(&mut self.ctx);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        ctx.events = events;
        ctx.config = config;
        self
    }

    /// Subscribe to session and server events.
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.ctx.events.subscribe()
    }

    pub fn gateway(&self) -> &GatewayDescriptor {
        &self.gateway
    }

    pub fn target(&self) -> &TargetSpec {
        &self.ctx.target
    }

    /// Bind the listener, publish the resolved port, and spawn the accept
    /// loop. Returns the port clients should connect to.
    ///
    /// A port that cannot be bound is fatal and surfaces as
    /// [`TunnelError::Bind`]. Starting twice, or after cleanup, is a
    /// configuration error.
    pub async fn start_server(&self) -> TunnelResult<u16> {
        let mut accept_task = self.accept_task.lock().await;
        if self.shutdown.is_cancelled() {
            return Err(TunnelError::Configuration("tunnel server was cleaned up".into()));
        }
        if accept_task.is_some() {
            return Err(TunnelError::Configuration("tunnel server already started".into()));
        }

        let addr = format!("{}:{}", self.host, self.requested_port);
        debug!(addr = %addr, "binding tunnel listener");
        let listener = TcpListener::bind(&addr).await.map_err(|source| {
            warn!(addr = %addr, error = %source, "bind failed");
            TunnelError::Bind {
                addr: addr.clone(),
                source,
            }
        })?;
        let port = listener
            .local_addr()
            .map(|a| a.port())
            .map_err(|source| TunnelError::Bind {
                addr: addr.clone(),
                source,
            })?;

        // Published before the accept loop exists.
        let _ = self.local_port.set(port);
        self.ctx.emit(TunnelEvent::Listening { port });

        let registry = self.registry.clone();
        let ctx = self.ctx.clone();
        let shutdown = self.shutdown.clone();
        *accept_task = Some(tokio::spawn(async move {
            accept_loop(listener, registry, ctx, shutdown).await;
            debug!(port, "accept loop ended");
        }));

        info!(port, "tunnel listening");
        Ok(port)
    }

    /// The bound port, once [`start_server`](Self::start_server) has bound it.
    pub fn local_port(&self) -> Option<u16> {
        self.local_port.get().copied()
    }

    /// Whether the accept loop is still running.
    pub async fn is_accepting(&self) -> bool {
        self.accept_task
            .lock()
            .await
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    /// Snapshot of the sessions currently registered.
    pub async fn active_sessions(&self) -> Vec<SessionInfo> {
        let registry = self.registry.lock().await;
        registry
            .sessions
            .iter()
            .map(|(id, entry)| SessionInfo::snapshot(id, entry.peer, entry.opened_at, &entry.status))
            .collect()
    }

    /// Stop accepting, close the listener, and close every active session.
    ///
    /// Idempotent and safe to call from any task, including concurrently:
    /// only the first call does any work, later calls wait for it and
    /// return.
    pub async fn cleanup(&self) {
        let mut cleaned_up = self.cleaned_up.lock().await;
        if *cleaned_up {
            return;
        }
        *cleaned_up = true;

        self.shutdown.cancel();

        // The listener is owned by the accept task; joining it closes the socket.
        let accept_task = self.accept_task.lock().await.take();
        if let Some(task) = accept_task {
            if let Err(e) = task.await {
                warn!(error = %e, "accept loop task failed");
            }
        }

        let drained: Vec<(SessionId, SessionEntry)> = {
            let mut registry = self.registry.lock().await;
            registry.shutting_down = true;
            registry.sessions.drain().collect()
        };

        let count = drained.len();
        let join_limit = self.ctx.config.close_grace * 2;
        for (id, entry) in drained {
            entry.cancel.cancel();
            let mut task = entry.task;
            if time::timeout(join_limit, &mut task).await.is_err() {
                warn!(session_id = %id, "session did not close in time, aborting");
                task.abort();
            }
            entry.status.set_state(SessionState::Closed);
        }

        self.ctx.emit(TunnelEvent::ServerStopped);
        info!(sessions = count, "tunnel server stopped");
    }
}

impl Drop for TunnelServer {
    fn drop(&mut self) {
        // Stops the accept loop, which owns the listener, and every session.
        self.shutdown.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    registry: Arc<Mutex<Registry>>,
    ctx: Arc<ForwardContext>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                debug!("accept loop cancelled");
                break;
            }
            result = listener.accept() => match result {
                Ok((stream, peer)) => admit(stream, peer, &registry, &ctx, &shutdown).await,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = time::sleep(ACCEPT_BACKOFF) => {}
                    }
                }
            }
        }
    }
}

/// Register an accepted connection and spawn its forwarder.
async fn admit(
    stream: TcpStream,
    peer: SocketAddr,
    registry: &Arc<Mutex<Registry>>,
    ctx: &Arc<ForwardContext>,
    shutdown: &CancellationToken,
) {
    let mut guard = registry.lock().await;
    if guard.shutting_down {
        debug!(peer = %peer, "dropping connection accepted during shutdown");
        return;
    }

    let id = SessionId::generate();
    let status = Arc::new(SessionStatus::new());
    let cancel = shutdown.child_token();
    info!(session_id = %id, peer = %peer, "accepted connection");
    ctx.emit(TunnelEvent::SessionOpened {
        session_id: id.clone(),
        peer,
    });

    let forwarder = ConnectionForwarder::new(
        id.clone(),
        stream,
        peer,
        status.clone(),
        cancel.clone(),
        ctx.clone(),
    );
    let task = {
        let id = id.clone();
        let status = status.clone();
        let registry = registry.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            // A panic in the forwarder must not leave the session registered.
            let mut run = AbortOnDrop(tokio::spawn(forwarder.run()));
            if let Err(e) = (&mut run.0).await {
                warn!(session_id = %id, error = %e, "session task failed");
            }
            finish_session(&id, &status, &registry, &ctx).await;
        })
    };

    guard.sessions.insert(
        id,
        SessionEntry {
            peer,
            opened_at: Instant::now(),
            status,
            cancel,
            task,
        },
    );
}

/// Aborts the forwarder task when the session task itself is aborted.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn finish_session(
    id: &SessionId,
    status: &SessionStatus,
    registry: &Mutex<Registry>,
    ctx: &ForwardContext,
) {
    registry.lock().await.sessions.remove(id);
    status.set_state(SessionState::Closed);
    debug!(session_id = %id, "session deregistered");
    ctx.emit(TunnelEvent::SessionClosed {
        session_id: id.clone(),
        bytes_sent: status.bytes_sent(),
        bytes_received: status.bytes_received(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeGateway, GatewayMode};
    use crate::transport::{HandshakeRequest, TransportSession};
    use bastun_core::gateway::Sku;
    use bastun_core::{AccessToken, ControlMessage, StaticCredential};
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const VM_ID: &str =
        "/subscriptions/s/resourceGroups/rg/providers/Microsoft.Compute/virtualMachines/vm1";

    fn credentials() -> Arc<dyn CredentialProvider> {
        Arc::new(StaticCredential::new(AccessToken::new("secret-token").unwrap()))
    }

    fn test_config() -> RelayConfig {
        RelayConfig {
            handshake_timeout: Duration::from_millis(500),
            close_grace: Duration::from_millis(500),
            ..RelayConfig::default()
        }
    }

    fn server_for(gateway: &FakeGateway) -> TunnelServer {
        TunnelServer::new(
            "127.0.0.1",
            0,
            gateway.descriptor(),
            TargetSpec::new(VM_ID, 22).unwrap(),
            credentials(),
        )
        .unwrap()
        .with_config(test_config())
    }

    /// Connector that only counts calls.
    #[derive(Default)]
    struct CountingConnector {
        calls: AtomicUsize,
    }

    impl GatewayConnector for CountingConnector {
        fn connect<'a>(
            &'a self,
            _request: &'a HandshakeRequest,
            _config: &'a RelayConfig,
        ) -> Pin<Box<dyn Future<Output = TunnelResult<TransportSession>> + Send + 'a>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Err(TunnelError::Transport("not connected".into())) })
        }
    }

    /// Connector that panics on the session task.
    struct PanickingConnector;

    impl GatewayConnector for PanickingConnector {
        fn connect<'a>(
            &'a self,
            _request: &'a HandshakeRequest,
            _config: &'a RelayConfig,
        ) -> Pin<Box<dyn Future<Output = TunnelResult<TransportSession>> + Send + 'a>> {
            panic!("connector blew up");
        }
    }

    async fn wait_for_no_sessions(server: &TunnelServer) {
        for _ in 0..100 {
            if server.active_sessions().await.is_empty() {
                return;
            }
            time::sleep(Duration::from_millis(20)).await;
        }
        panic!("sessions still active");
    }

    #[tokio::test]
    async fn ephemeral_port_is_connectable_until_cleanup() {
        let gateway = FakeGateway::start(GatewayMode::Echo).await;
        let server = server_for(&gateway);
        assert_eq!(server.local_port(), None);

        let port = server.start_server().await.unwrap();
        assert_ne!(port, 0);
        assert_eq!(server.local_port(), Some(port));
        assert!(server.is_accepting().await);
        TcpStream::connect(("127.0.0.1", port)).await.unwrap();

        server.cleanup().await;
        assert!(!server.is_accepting().await);
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    }

    #[tokio::test]
    async fn disabled_tunneling_fails_before_any_connect() {
        let connector = Arc::new(CountingConnector::default());
        let mut descriptor = FakeGateway::start(GatewayMode::Echo).await.descriptor();
        descriptor.enable_tunneling = Some(false);

        let result = TunnelServer::new(
            "127.0.0.1",
            0,
            descriptor.clone(),
            TargetSpec::new(VM_ID, 22).unwrap(),
            credentials(),
        );
        assert!(matches!(result, Err(TunnelError::Configuration(_))));

        descriptor.enable_tunneling = Some(true);
        descriptor.sku = Sku {
            name: "Basic".into(),
        };
        let result = TunnelServer::new(
            "127.0.0.1",
            0,
            descriptor,
            TargetSpec::new(VM_ID, 22).unwrap(),
            credentials(),
        )
        .map(|s| s.with_connector(connector.clone()));
        assert!(matches!(result, Err(TunnelError::Configuration(_))));
        assert_eq!(connector.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invalid_port_never_reaches_the_server() {
        for bad in ["abc", "0", "70000", ""] {
            let err = TargetSpec::parse(VM_ID, bad).unwrap_err();
            assert!(matches!(err, TunnelError::Configuration(_)), "{bad}");
        }
    }

    #[tokio::test]
    async fn echo_round_trip_then_session_ends() {
        let gateway = FakeGateway::start(GatewayMode::Echo).await;
        let server = server_for(&gateway);
        let port = server.start_server().await.unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(b"PING").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PING");

        let sessions = server.active_sessions().await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].state, SessionState::Forwarding);

        drop(client);
        wait_for_no_sessions(&server).await;
        server.cleanup().await;
    }

    #[tokio::test]
    async fn handshake_carries_target_and_token() {
        let gateway = FakeGateway::start(GatewayMode::Echo).await;
        let server = server_for(&gateway);
        let port = server.start_server().await.unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(b"x").await.unwrap();
        let mut buf = [0u8; 1];
        client.read_exact(&mut buf).await.unwrap();

        let handshakes = gateway.handshakes();
        assert_eq!(handshakes.len(), 1);
        match &handshakes[0] {
            ControlMessage::Handshake {
                target_resource_id,
                target_port,
                access_token,
                protocol,
                ..
            } => {
                assert_eq!(target_resource_id, VM_ID);
                assert_eq!(*target_port, 22);
                assert_eq!(access_token, "secret-token");
                assert_eq!(protocol, "tcptunnel");
            }
            other => panic!("unexpected {other:?}"),
        }
        server.cleanup().await;
    }

    #[tokio::test]
    async fn rejected_session_closes_without_bytes() {
        let gateway = FakeGateway::start(GatewayMode::reject("auth-failed")).await;
        let server = server_for(&gateway);
        let mut events = server.subscribe();
        let port = server.start_server().await.unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut buf = [0u8; 16];
        let n = time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);

        let mut rejected = None;
        while let Ok(Ok(event)) = time::timeout(Duration::from_secs(5), events.recv()).await {
            match event {
                TunnelEvent::SessionRejected { reason, .. } => rejected = Some(reason),
                TunnelEvent::SessionClosed {
                    bytes_sent,
                    bytes_received,
                    ..
                } => {
                    assert_eq!(bytes_sent + bytes_received, 0);
                    break;
                }
                _ => {}
            }
        }
        assert_eq!(rejected.as_deref(), Some("auth-failed"));

        // The server keeps accepting after a rejection.
        assert!(server.is_accepting().await);
        server.cleanup().await;
    }

    #[tokio::test]
    async fn concurrent_clients_do_not_cross_talk() {
        let gateway = FakeGateway::start(GatewayMode::Echo).await;
        let server = server_for(&gateway);
        let port = server.start_server().await.unwrap();

        let mut clients = Vec::new();
        for i in 0..20u32 {
            clients.push(tokio::spawn(async move {
                let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
                let payload = format!("client-{i:02}-payload").into_bytes();
                for _ in 0..3 {
                    stream.write_all(&payload).await.unwrap();
                    let mut buf = vec![0u8; payload.len()];
                    stream.read_exact(&mut buf).await.unwrap();
                    assert_eq!(buf, payload);
                }
            }));
        }
        for client in clients {
            client.await.unwrap();
        }
        assert_eq!(gateway.connections(), 20);

        wait_for_no_sessions(&server).await;
        server.cleanup().await;
    }

    #[tokio::test]
    async fn cleanup_closes_active_sessions() {
        let gateway = FakeGateway::start(GatewayMode::Echo).await;
        let server = server_for(&gateway);
        let port = server.start_server().await.unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).await.unwrap();

        server.cleanup().await;
        assert!(server.active_sessions().await.is_empty());
        let n = time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() {
        let gateway = FakeGateway::start(GatewayMode::Echo).await;
        let server = Arc::new(server_for(&gateway));
        let mut events = server.subscribe();
        server.start_server().await.unwrap();

        let a = tokio::spawn({
            let server = server.clone();
            async move { server.cleanup().await }
        });
        let b = tokio::spawn({
            let server = server.clone();
            async move { server.cleanup().await }
        });
        a.await.unwrap();
        b.await.unwrap();
        server.cleanup().await;

        let mut stopped = 0;
        while let Ok(event) = events.try_recv() {
            if event == TunnelEvent::ServerStopped {
                stopped += 1;
            }
        }
        assert_eq!(stopped, 1);
        assert!(server.start_server().await.is_err());
    }

    #[tokio::test]
    async fn occupied_port_is_a_bind_error() {
        let holder = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = holder.local_addr().unwrap().port();
        let gateway = FakeGateway::start(GatewayMode::Echo).await;
        let server = TunnelServer::new(
            "127.0.0.1",
            port,
            gateway.descriptor(),
            TargetSpec::new(VM_ID, 22).unwrap(),
            credentials(),
        )
        .unwrap();

        assert!(matches!(server.start_server().await, Err(TunnelError::Bind { .. })));
        assert_eq!(server.local_port(), None);
        server.cleanup().await;
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let gateway = FakeGateway::start(GatewayMode::Echo).await;
        let server = server_for(&gateway);
        server.start_server().await.unwrap();
        assert!(matches!(
            server.start_server().await,
            Err(TunnelError::Configuration(_))
        ));
        server.cleanup().await;
    }

    #[tokio::test]
    async fn silent_gateway_fails_the_session() {
        let gateway = FakeGateway::start(GatewayMode::Silent).await;
        let server = server_for(&gateway);
        let mut events = server.subscribe();
        let port = server.start_server().await.unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut buf = [0u8; 4];
        let n = time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);

        let mut failed = false;
        while let Ok(Ok(event)) = time::timeout(Duration::from_secs(2), events.recv()).await {
            if let TunnelEvent::SessionFailed { .. } = event {
                failed = true;
                break;
            }
        }
        assert!(failed);
        server.cleanup().await;
    }

    #[tokio::test]
    async fn zero_keepalive_session_is_deregistered() {
        let gateway = FakeGateway::start(GatewayMode::Echo).await;
        let server = server_for(&gateway).with_config(RelayConfig {
            keepalive_interval: Some(Duration::ZERO),
            ..test_config()
        });
        let port = server.start_server().await.unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(b"PING").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PING");

        drop(client);
        wait_for_no_sessions(&server).await;
        server.cleanup().await;
    }

    #[tokio::test]
    async fn panicking_session_is_still_deregistered() {
        let gateway = FakeGateway::start(GatewayMode::Echo).await;
        let server = server_for(&gateway).with_connector(Arc::new(PanickingConnector));
        let mut events = server.subscribe();
        let port = server.start_server().await.unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut buf = [0u8; 4];
        let n = time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        wait_for_no_sessions(&server).await;

        let mut closed = false;
        while let Ok(Ok(event)) = time::timeout(Duration::from_secs(2), events.recv()).await {
            if let TunnelEvent::SessionClosed { .. } = event {
                closed = true;
                break;
            }
        }
        assert!(closed);
        assert!(server.is_accepting().await);
        server.cleanup().await;
    }

    #[tokio::test]
    async fn concurrent_cleanup_closes_every_session_once() {
        let gateway = FakeGateway::start(GatewayMode::Echo).await;
        let server = Arc::new(server_for(&gateway));
        let mut events = server.subscribe();
        let port = server.start_server().await.unwrap();

        let mut clients = Vec::new();
        for _ in 0..10 {
            let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            client.write_all(b"PING").await.unwrap();
            let mut buf = [0u8; 4];
            client.read_exact(&mut buf).await.unwrap();
            clients.push(client);
        }
        assert_eq!(server.active_sessions().await.len(), 10);

        let a = tokio::spawn({
            let server = server.clone();
            async move { server.cleanup().await }
        });
        let b = tokio::spawn({
            let server = server.clone();
            async move { server.cleanup().await }
        });
        a.await.unwrap();
        b.await.unwrap();

        assert!(server.active_sessions().await.is_empty());
        let (mut closed, mut stopped) = (0, 0);
        while let Ok(event) = events.try_recv() {
            match event {
                TunnelEvent::SessionClosed { .. } => closed += 1,
                TunnelEvent::ServerStopped => stopped += 1,
                _ => {}
            }
        }
        assert_eq!(closed, 10);
        assert_eq!(stopped, 1);

        for mut client in clients {
            let mut buf = [0u8; 4];
            let n = time::timeout(Duration::from_secs(5), client.read(&mut buf))
                .await
                .unwrap()
                .unwrap_or(0);
            assert_eq!(n, 0);
        }
    }

    #[tokio::test]
    async fn connect_during_cleanup_is_never_leaked() {
        let gateway = FakeGateway::start(GatewayMode::Echo).await;
        let server = Arc::new(server_for(&gateway));
        let mut events = server.subscribe();
        let port = server.start_server().await.unwrap();

        let connecting = tokio::spawn(async move {
            let mut streams = Vec::new();
            for _ in 0..50 {
                match TcpStream::connect(("127.0.0.1", port)).await {
                    Ok(stream) => streams.push(stream),
                    Err(_) => break,
                }
                tokio::task::yield_now().await;
            }
            streams
        });
        time::sleep(Duration::from_millis(5)).await;
        server.cleanup().await;
        let streams = connecting.await.unwrap();

        assert!(server.active_sessions().await.is_empty());
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
        for mut stream in streams {
            let mut buf = [0u8; 4];
            let n = time::timeout(Duration::from_secs(5), stream.read(&mut buf))
                .await
                .unwrap()
                .unwrap_or(0);
            assert_eq!(n, 0);
        }

        let (mut opened, mut closed) = (0, 0);
        while let Ok(event) = events.try_recv() {
            match event {
                TunnelEvent::SessionOpened { .. } => opened += 1,
                TunnelEvent::SessionClosed { .. } => closed += 1,
                _ => {}
            }
        }
        assert_eq!(opened, closed);
    }

    #[tokio::test]
    async fn dropping_the_server_closes_the_listener() {
        let gateway = FakeGateway::start(GatewayMode::Echo).await;
        let server = server_for(&gateway);
        let port = server.start_server().await.unwrap();
        drop(server);

        let mut refused = false;
        for _ in 0..50 {
            if TcpStream::connect(("127.0.0.1", port)).await.is_err() {
                refused = true;
                break;
            }
            time::sleep(Duration::from_millis(20)).await;
        }
        assert!(refused);
    }
}
