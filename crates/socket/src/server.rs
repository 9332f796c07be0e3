//! Server socket.
//!
//! Listens on a TCP port, admits WebSocket clients during the upgrade
//! handshake and relays every frame a client sends to the other admitted
//! connections. Each identity may hold one connection at a time.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use javelin_protocol::codec::frame_kind;
use javelin_protocol::constants::{AUTHORIZATION_HEADER, DEFAULT_PORT, DEFAULT_WORKERS, FrameKind};
use javelin_protocol::message::rewrite_receiver;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::{AdmissionError, Authenticator, authorize, is_local};
use crate::bus::EventBus;
use crate::connection::{
    ConnectionId, FrameHandler, LocalFrame, LocalQueue, Outbound, spawn_connection, ws_config,
};
use crate::messaging::ReceiverRegistry;
use crate::pool::WorkerPool;
use crate::status::{Status, StatusCell};
use crate::{
    FrameEncoder, MessageEncoder, Socket, SocketError, SocketFuture, ready, spawn_lifecycle,
};

const ANONYMOUS: &str = "<anonymous>";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interface to bind.
    pub bind_address: IpAddr,
    /// TCP port to listen on (0 = OS-assigned).
    pub port: u16,
    /// Worker pool size.
    pub workers: usize,
    /// Admit loopback peers without checking their credentials.
    pub always_allow_local_connections: bool,
    /// Also deliver frames relayed between clients to this server's own
    /// bus and receivers.
    pub local_broadcast: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            workers: DEFAULT_WORKERS,
            always_allow_local_connections: false,
            local_broadcast: true,
        }
    }
}

/// The hub every client connects to.
///
/// Created `CLOSED`; `start` binds the listener, `close` drops every
/// connection and returns to `CLOSED`, after which the server may be
/// started again.
pub struct ServerSocket {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    config: ServerConfig,
    authenticator: Arc<dyn Authenticator>,
    status: Arc<StatusCell>,
    bus: EventBus,
    receivers: ReceiverRegistry,
    pool: WorkerPool,
    registry: Mutex<Registry>,
    session: Mutex<Option<Session>>,
}

/// A running listener.
struct Session {
    cancel: CancellationToken,
    acceptor: JoinHandle<()>,
    local_addr: SocketAddr,
}

#[derive(Default)]
struct Registry {
    identities: HashMap<String, ConnectionId>,
    peers: HashMap<ConnectionId, Peer>,
}

struct Peer {
    identity: Option<String>,
    addr: SocketAddr,
    outbound: Outbound,
    cancel: CancellationToken,
}

impl ServerSocket {
    pub fn new<A: Authenticator>(config: ServerConfig, authenticator: A) -> Self {
        Self::with_shared_authenticator(config, Arc::new(authenticator))
    }

    pub fn with_shared_authenticator(
        config: ServerConfig,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        let pool = WorkerPool::new(config.workers);
        Self {
            inner: Arc::new(ServerInner {
                config,
                authenticator,
                status: StatusCell::new(Status::Closed),
                bus: EventBus::new(),
                receivers: ReceiverRegistry::new(),
                pool,
                registry: Mutex::new(Registry::default()),
                session: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Returns the bound address while the server is open.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.inner.session).as_ref().map(|s| s.local_addr)
    }

    /// Returns the bound port (0 if not listening).
    pub fn port(&self) -> u16 {
        self.local_addr().map_or(0, |addr| addr.port())
    }

    /// Returns the identities currently admitted, sorted.
    pub fn identities(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.inner.registry)
            .identities
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Number of admitted connections, anonymous ones included.
    pub fn connection_count(&self) -> usize {
        lock(&self.inner.registry).peers.len()
    }
}

impl Socket for ServerSocket {
    fn start(&self) -> SocketFuture {
        let guard = match self.inner.status.begin() {
            Ok(guard) => guard,
            Err(e) => return ready(Err(e)),
        };
        if !self.inner.status.transition(Status::Closed, Status::Opening) {
            return ready(Err(SocketError::IllegalState(format!(
                "cannot start a server socket that is {}",
                self.inner.status.get()
            ))));
        }

        let inner = Arc::clone(&self.inner);
        spawn_lifecycle(async move {
            let _guard = guard;
            match inner.bind().await {
                Ok(local_addr) => {
                    inner.status.set(Status::Open);
                    info!(
                        %local_addr,
                        workers = inner.pool.size(),
                        "server socket listening"
                    );
                    Ok(())
                }
                Err(e) => {
                    inner.status.set(Status::Closed);
                    error!("failed to bind server socket: {e}");
                    Err(e)
                }
            }
        })
    }

    fn close(&self) -> SocketFuture {
        let guard = match self.inner.status.begin() {
            Ok(guard) => guard,
            Err(e) => return ready(Err(e)),
        };
        if !self.inner.status.transition(Status::Open, Status::Closing) {
            return ready(Err(SocketError::IllegalState(format!(
                "cannot close a server socket that is {}",
                self.inner.status.get()
            ))));
        }

        let inner = Arc::clone(&self.inner);
        spawn_lifecycle(async move {
            let _guard = guard;
            let session = lock(&inner.session).take();
            if let Some(session) = session {
                session.cancel.cancel();
                if let Err(e) = session.acceptor.await {
                    warn!("accept loop ended abnormally: {e}");
                }
            }

            let peers: Vec<Peer> = {
                let mut registry = lock(&inner.registry);
                registry.identities.clear();
                registry.peers.drain().map(|(_, peer)| peer).collect()
            };
            for peer in &peers {
                peer.cancel.cancel();
            }

            inner.status.set(Status::Closed);
            info!(connections = peers.len(), "server socket closed");
            Ok(())
        })
    }

    fn status(&self) -> Status {
        self.inner.status.get()
    }

    fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    fn receivers(&self) -> &ReceiverRegistry {
        &self.inner.receivers
    }

    /// Sends the event to every admitted connection and to this server's
    /// own subscribers.
    fn publish(&self, encoder: FrameEncoder) -> SocketFuture {
        if self.inner.status.get() != Status::Open {
            return ready(Err(SocketError::NotOpen));
        }
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            let frame = inner.pool.execute(encoder).await??;
            let targets = inner.outbounds(|_| true);
            inner.deliver(&targets, &frame);
            inner.bus.dispatch(&inner.pool, frame).await;
            Ok(())
        })
    }

    /// Messages from the server carry no sender identity.
    fn route_message(&self, receiver: Option<String>, encoder: MessageEncoder) -> SocketFuture {
        if self.inner.status.get() != Status::Open {
            return ready(Err(SocketError::NotOpen));
        }
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            let frame = inner.pool.execute(move || encoder(None)).await??;
            match receiver {
                Some(name) => match inner.outbound_for(&name) {
                    Some(target) => inner.deliver(&[target], &frame),
                    None => debug!(receiver = %name, "no connection for message receiver"),
                },
                None => {
                    let targets = inner.outbounds(|_| true);
                    inner.deliver(&targets, &frame);
                }
            }
            Ok(())
        })
    }
}

impl ServerInner {
    async fn bind(self: &Arc<Self>) -> Result<SocketAddr, SocketError> {
        let addr = SocketAddr::new(self.config.bind_address, self.config.port);
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let cancel = CancellationToken::new();
        let acceptor = tokio::spawn(accept_loop(
            Arc::downgrade(self),
            listener,
            cancel.clone(),
        ));
        *lock(&self.session) = Some(Session {
            cancel,
            acceptor,
            local_addr,
        });
        Ok(local_addr)
    }

    /// Upgrades one TCP connection, running admission inside the
    /// handshake so rejected peers never see a WebSocket.
    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer_addr: SocketAddr,
        cancel: CancellationToken,
    ) -> Result<(), SocketError> {
        let id = Uuid::new_v4();
        let (outbound, rx) = Outbound::channel();
        let mut lease: Option<IdentityLease> = None;

        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            let header = request
                .headers()
                .get(AUTHORIZATION_HEADER)
                .map(|value| value.to_str().unwrap_or_default());
            match self.admit(id, header, peer_addr, outbound.clone(), cancel.clone()) {
                Ok(admitted) => {
                    lease = Some(admitted);
                    Ok(response)
                }
                Err(reason) => {
                    warn!(%peer_addr, %reason, "rejecting connection");
                    Err(rejection(&reason))
                }
            }
        };
        let ws_stream = accept_hdr_async_with_config(stream, callback, Some(ws_config())).await?;

        let Some(lease) = lease else {
            return Err(SocketError::IllegalState(
                "handshake completed without admission".into(),
            ));
        };
        let identity = lease.identity.clone();
        let handler = Arc::new(PeerHandler {
            server: Arc::downgrade(&self),
            identity: identity.clone(),
            local: LocalQueue::spawn(
                self.bus.clone(),
                self.receivers.clone(),
                self.pool.clone(),
            ),
        });
        spawn_connection(ws_stream, id, outbound, rx, handler, cancel);
        lease.commit();

        info!(
            %peer_addr,
            identity = identity.as_deref().unwrap_or(ANONYMOUS),
            "connection admitted"
        );
        Ok(())
    }

    /// Authenticates a peer and reserves its identity in one step under
    /// the registry lock.
    fn admit(
        self: &Arc<Self>,
        id: ConnectionId,
        header: Option<&str>,
        addr: SocketAddr,
        outbound: Outbound,
        cancel: CancellationToken,
    ) -> Result<IdentityLease, AdmissionError> {
        let trusted = self.config.always_allow_local_connections && is_local(&addr);
        let identity = authorize(header, self.authenticator.as_ref(), trusted)?;

        let mut registry = lock(&self.registry);
        if let Some(name) = &identity {
            if registry.identities.contains_key(name) {
                return Err(AdmissionError::AlreadyConnected);
            }
            registry.identities.insert(name.clone(), id);
        }
        registry.peers.insert(
            id,
            Peer {
                identity: identity.clone(),
                addr,
                outbound,
                cancel,
            },
        );
        drop(registry);

        Ok(IdentityLease {
            server: Arc::clone(self),
            id,
            identity,
            committed: false,
        })
    }

    fn unregister(&self, id: ConnectionId) -> Option<Peer> {
        let mut registry = lock(&self.registry);
        let peer = registry.peers.remove(&id)?;
        if let Some(name) = &peer.identity {
            if registry.identities.get(name) == Some(&id) {
                registry.identities.remove(name);
            }
        }
        Some(peer)
    }

    fn outbounds(&self, filter: impl Fn(&ConnectionId) -> bool) -> Vec<(ConnectionId, Outbound)> {
        lock(&self.registry)
            .peers
            .iter()
            .filter(|(id, _)| filter(id))
            .map(|(id, peer)| (*id, peer.outbound.clone()))
            .collect()
    }

    fn outbound_for(&self, identity: &str) -> Option<(ConnectionId, Outbound)> {
        let registry = lock(&self.registry);
        let id = registry.identities.get(identity)?;
        registry
            .peers
            .get(id)
            .map(|peer| (*id, peer.outbound.clone()))
    }

    fn deliver(&self, targets: &[(ConnectionId, Outbound)], frame: &[u8]) {
        for (id, outbound) in targets {
            if let Err(e) = outbound.send_binary(frame.to_vec()) {
                warn!(connection = %id, "dropping frame: {e}");
            }
        }
    }

    /// Relays an event to every other connection, then queues it for
    /// this server's own subscribers.
    fn relay_event(&self, from: ConnectionId, frame: Vec<u8>, local: &LocalQueue) {
        let targets = self.outbounds(|id| *id != from);
        self.deliver(&targets, &frame);
        if self.config.local_broadcast {
            local.push(LocalFrame::Event(frame));
        }
    }

    /// Stamps the sender identity on a message and routes it to its
    /// receiver, or to every other connection when it has none.
    fn relay_message(
        &self,
        from: ConnectionId,
        sender: Option<&str>,
        frame: Vec<u8>,
        local: &LocalQueue,
    ) {
        let (target, rewritten) = match rewrite_receiver(&frame, sender) {
            Ok(rewritten) => rewritten,
            Err(e) => {
                warn!(connection = %from, "dropping malformed message: {e}");
                return;
            }
        };

        match target {
            Some(name) => match self.outbound_for(&name) {
                Some(target) => self.deliver(&[target], &rewritten),
                None => debug!(receiver = %name, "no connection for message receiver"),
            },
            None => {
                let targets = self.outbounds(|id| *id != from);
                self.deliver(&targets, &rewritten);
                if self.config.local_broadcast {
                    local.push(LocalFrame::Message(rewritten));
                }
            }
        }
    }
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        let session = self
            .session
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(session) = session {
            session.cancel.cancel();
        }
    }
}

/// Identity reservation made during the handshake. Released on drop
/// unless the upgrade completed.
struct IdentityLease {
    server: Arc<ServerInner>,
    id: ConnectionId,
    identity: Option<String>,
    committed: bool,
}

impl IdentityLease {
    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for IdentityLease {
    fn drop(&mut self) {
        if !self.committed {
            self.server.unregister(self.id);
        }
    }
}

struct PeerHandler {
    server: Weak<ServerInner>,
    identity: Option<String>,
    local: LocalQueue,
}

impl FrameHandler for PeerHandler {
    fn on_frame(&self, id: ConnectionId, frame: Vec<u8>) {
        let Some(server) = self.server.upgrade() else {
            return;
        };
        match frame_kind(&frame) {
            Ok(FrameKind::Event) => server.relay_event(id, frame, &self.local),
            Ok(FrameKind::Message) => {
                server.relay_message(id, self.identity.as_deref(), frame, &self.local)
            }
            Err(e) => warn!(connection = %id, "dropping malformed frame: {e}"),
        }
    }

    fn on_disconnect(&self, id: ConnectionId) {
        let Some(server) = self.server.upgrade() else {
            return;
        };
        if let Some(peer) = server.unregister(id) {
            info!(
                peer_addr = %peer.addr,
                identity = peer.identity.as_deref().unwrap_or(ANONYMOUS),
                "connection closed"
            );
        }
    }
}

async fn accept_loop(server: Weak<ServerInner>, listener: TcpListener, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        let Some(inner) = server.upgrade() else {
                            break;
                        };
                        let conn_cancel = cancel.child_token();
                        tokio::spawn(async move {
                            if let Err(e) = inner.handle_connection(stream, peer_addr, conn_cancel).await {
                                debug!(%peer_addr, "handshake failed: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        error!("accept error: {e}");
                    }
                }
            }
        }
    }
    debug!("accept loop stopped");
}

/// Builds the 403 answer carrying the rejection reason.
fn rejection(reason: &AdmissionError) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = StatusCode::FORBIDDEN;
    response
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
