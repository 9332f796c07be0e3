//! Client socket: one outbound connection to a server.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use javelin_protocol::Credentials;
use javelin_protocol::codec::frame_kind;
use javelin_protocol::constants::{DEFAULT_ADDRESS, DEFAULT_WORKERS, FrameKind};
use javelin_protocol::message::rewrite_receiver;
use tokio_tungstenite::connect_async_with_config;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::EventBus;
use crate::connection::{
    Connection, ConnectionId, FrameHandler, LocalFrame, LocalQueue, Outbound, spawn_connection,
    ws_config,
};
use crate::messaging::ReceiverRegistry;
use crate::pool::WorkerPool;
use crate::status::{Status, StatusCell};
use crate::{
    FrameEncoder, MessageEncoder, Socket, SocketError, SocketFuture, ready, spawn_lifecycle,
};

/// How long a disconnect waits for the server to answer the close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server URL, e.g. `ws://localhost:8080`.
    pub address: String,
    /// `None` connects anonymously (only admitted by servers trusting
    /// local connections).
    pub credentials: Option<Credentials>,
    /// Worker pool size.
    pub workers: usize,
    /// Deliver this client's own events and broadcast messages to its
    /// local subscribers too.
    pub local_broadcast: bool,
    /// Upper bound on TCP connect plus handshake.
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            credentials: None,
            workers: DEFAULT_WORKERS,
            local_broadcast: false,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// A connection to a [`ServerSocket`](crate::ServerSocket).
///
/// Losing the connection moves the socket to `CLOSED`; nothing reconnects
/// on its own, call [`restart`](Socket::restart). [`close`](Socket::close)
/// releases the worker pool and leaves the socket `UNUSABLE`.
pub struct ClientSocket {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    status: Arc<StatusCell>,
    bus: EventBus,
    receivers: ReceiverRegistry,
    pool: WorkerPool,
    connection: Mutex<Option<Connection>>,
    /// Set once a connection has been attempted.
    attempted: AtomicBool,
}

impl ClientSocket {
    pub fn new(config: ClientConfig) -> Self {
        let pool = WorkerPool::new(config.workers);
        Self {
            inner: Arc::new(ClientInner {
                config,
                status: StatusCell::new(Status::Closed),
                bus: EventBus::new(),
                receivers: ReceiverRegistry::new(),
                pool,
                connection: Mutex::new(None),
                attempted: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Identity this client presents, `None` when anonymous.
    pub fn username(&self) -> Option<&str> {
        self.inner.config.credentials.as_ref().map(|c| c.username())
    }
}

impl Socket for ClientSocket {
    fn start(&self) -> SocketFuture {
        let guard = match self.inner.status.begin() {
            Ok(guard) => guard,
            Err(e) => return ready(Err(e)),
        };
        if self.inner.status.get() == Status::Unusable {
            return ready(Err(released()));
        }
        if !self.inner.status.transition(Status::Closed, Status::Opening) {
            return ready(Err(SocketError::IllegalState(format!(
                "cannot start a client socket that is {}",
                self.inner.status.get()
            ))));
        }

        let inner = Arc::clone(&self.inner);
        spawn_lifecycle(async move {
            let _guard = guard;
            inner.open().await
        })
    }

    fn restart(&self) -> SocketFuture {
        let guard = match self.inner.status.begin() {
            Ok(guard) => guard,
            Err(e) => return ready(Err(e)),
        };
        match self.inner.status.get() {
            Status::Unusable => return ready(Err(released())),
            Status::Closing => {
                return ready(Err(SocketError::IllegalState(
                    "cannot restart a client socket that is CLOSING".into(),
                )));
            }
            _ => {}
        }

        let inner = Arc::clone(&self.inner);
        spawn_lifecycle(async move {
            let _guard = guard;
            let previous = lock(&inner.connection).take();
            inner.status.set(Status::Opening);
            if let Some(connection) = previous {
                debug!(connection = %connection.id, "disconnecting before restart");
                connection.shutdown(CLOSE_GRACE).await;
            }
            inner.open().await
        })
    }

    fn close(&self) -> SocketFuture {
        let guard = match self.inner.status.begin() {
            Ok(guard) => guard,
            Err(e) => return ready(Err(e)),
        };
        let current = self.inner.status.get();
        let closable = current == Status::Open
            || (current == Status::Closed && self.inner.attempted.load(Ordering::SeqCst));
        if !closable {
            return ready(Err(SocketError::IllegalState(format!(
                "cannot close a client socket that is {current}"
            ))));
        }
        self.inner.status.set(Status::Closing);

        let inner = Arc::clone(&self.inner);
        spawn_lifecycle(async move {
            let _guard = guard;
            let previous = lock(&inner.connection).take();
            if let Some(connection) = previous {
                connection.shutdown(CLOSE_GRACE).await;
            }
            inner.pool.close();
            inner.status.set(Status::Unusable);
            info!(address = %inner.config.address, "client socket released");
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

    fn publish(&self, encoder: FrameEncoder) -> SocketFuture {
        let Some(outbound) = self.inner.open_outbound() else {
            return ready(Err(SocketError::NotOpen));
        };
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            let frame = inner.pool.execute(encoder).await??;
            if inner.config.local_broadcast {
                outbound.send_binary(frame.clone())?;
                inner.bus.dispatch(&inner.pool, frame).await;
            } else {
                outbound.send_binary(frame)?;
            }
            Ok(())
        })
    }

    fn route_message(&self, receiver: Option<String>, encoder: MessageEncoder) -> SocketFuture {
        let Some(outbound) = self.inner.open_outbound() else {
            return ready(Err(SocketError::NotOpen));
        };
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            let field = receiver.clone();
            let frame = inner
                .pool
                .execute(move || encoder(field.as_deref()))
                .await??;

            if receiver.is_none() && inner.config.local_broadcast {
                outbound.send_binary(frame.clone())?;
                let sender = inner.config.credentials.as_ref().map(|c| c.username());
                let (_, looped) = rewrite_receiver(&frame, sender)?;
                inner.receivers.dispatch(&inner.pool, looped).await;
            } else {
                outbound.send_binary(frame)?;
            }
            Ok(())
        })
    }
}

impl ClientInner {
    /// Connects from `OPENING`; any failure leaves the socket `CLOSED`.
    async fn open(self: &Arc<Self>) -> Result<(), SocketError> {
        self.attempted.store(true, Ordering::SeqCst);
        match self.connect().await {
            Ok(id) => {
                info!(address = %self.config.address, connection = %id, "client socket connected");
                Ok(())
            }
            Err(e) => {
                self.status.set(Status::Closed);
                warn!(address = %self.config.address, "client socket failed to connect: {e}");
                Err(e)
            }
        }
    }

    async fn connect(self: &Arc<Self>) -> Result<ConnectionId, SocketError> {
        let request = self.request()?;
        let handshake = connect_async_with_config(request, Some(ws_config()), false);
        let (ws_stream, _response) =
            match tokio::time::timeout(self.config.connect_timeout, handshake).await {
                Ok(Ok(pair)) => pair,
                Ok(Err(tungstenite::Error::Http(response))) => {
                    let reason = response
                        .body()
                        .as_ref()
                        .map(|body| String::from_utf8_lossy(body).into_owned())
                        .unwrap_or_default();
                    return Err(SocketError::Rejected {
                        status: response.status().as_u16(),
                        reason,
                    });
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("no handshake within {:?}", self.config.connect_timeout),
                    )
                    .into());
                }
            };

        let id = Uuid::new_v4();
        let (outbound, rx) = Outbound::channel();
        let handler = Arc::new(ClientHandler {
            client: Arc::downgrade(self),
            local: LocalQueue::spawn(
                self.bus.clone(),
                self.receivers.clone(),
                self.pool.clone(),
            ),
        });

        // Held across the spawn so an immediate disconnect sees the
        // connection registered and the socket OPEN.
        let mut slot = lock(&self.connection);
        let connection = spawn_connection(
            ws_stream,
            id,
            outbound,
            rx,
            handler,
            CancellationToken::new(),
        );
        *slot = Some(connection);
        self.status.set(Status::Open);
        Ok(id)
    }

    fn request(&self) -> Result<Request, SocketError> {
        let mut request = self.config.address.as_str().into_client_request()?;
        if let Some(credentials) = &self.config.credentials {
            let value = HeaderValue::from_str(&credentials.to_header_value())
                .map_err(|e| tungstenite::Error::HttpFormat(e.into()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        Ok(request)
    }

    fn open_outbound(&self) -> Option<Outbound> {
        if self.status.get() != Status::Open || self.pool.is_closed() {
            return None;
        }
        lock(&self.connection)
            .as_ref()
            .map(|connection| connection.outbound.clone())
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        let connection = self
            .connection
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(connection) = connection {
            connection.close();
        }
    }
}

struct ClientHandler {
    client: Weak<ClientInner>,
    local: LocalQueue,
}

impl FrameHandler for ClientHandler {
    fn on_frame(&self, id: ConnectionId, frame: Vec<u8>) {
        match frame_kind(&frame) {
            Ok(FrameKind::Event) => self.local.push(LocalFrame::Event(frame)),
            Ok(FrameKind::Message) => self.local.push(LocalFrame::Message(frame)),
            Err(e) => warn!(connection = %id, "dropping malformed frame: {e}"),
        }
    }

    fn on_disconnect(&self, id: ConnectionId) {
        let Some(client) = self.client.upgrade() else {
            return;
        };
        let mut slot = lock(&client.connection);
        if !slot.as_ref().is_some_and(|connection| connection.id == id) {
            return;
        }
        slot.take();
        drop(slot);

        if client.status.transition(Status::Open, Status::Closed) {
            warn!(address = %client.config.address, "connection to server lost");
        }
    }
}

fn released() -> SocketError {
    SocketError::IllegalState("client socket has been released".into())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SocketExt;
    use javelin_protocol::JsonEvent;

    fn unreachable_config() -> ClientConfig {
        ClientConfig {
            // Port 1 on loopback refuses connections.
            address: "ws://127.0.0.1:1".into(),
            credentials: Some(Credentials::new("bob", "secret").unwrap()),
            workers: 1,
            connect_timeout: Duration::from_secs(2),
            ..ClientConfig::default()
        }
    }

    #[test]
    fn default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.address, "ws://localhost:8080");
        assert!(config.credentials.is_none());
        assert!(!config.local_broadcast);
    }

    #[test]
    fn request_carries_basic_header() {
        let client = ClientSocket::new(unreachable_config());
        let request = client.inner.request().unwrap();
        assert_eq!(
            request.headers().get(AUTHORIZATION).unwrap(),
            "Basic Ym9iOnNlY3JldA=="
        );
    }

    #[test]
    fn anonymous_request_has_no_header() {
        let client = ClientSocket::new(ClientConfig {
            credentials: None,
            ..unreachable_config()
        });
        assert!(client.username().is_none());
        let request = client.inner.request().unwrap();
        assert!(request.headers().get(AUTHORIZATION).is_none());
    }

    #[tokio::test]
    async fn close_fresh_client_is_illegal() {
        let client = ClientSocket::new(unreachable_config());
        assert!(matches!(
            client.close().await,
            Err(SocketError::IllegalState(_))
        ));
        assert_eq!(client.status(), Status::Closed);
    }

    #[tokio::test]
    async fn failed_start_returns_to_closed() {
        let client = ClientSocket::new(unreachable_config());
        assert!(client.start().await.is_err());
        assert_eq!(client.status(), Status::Closed);
    }

    #[tokio::test]
    async fn client_that_never_connected_can_be_released() {
        let client = ClientSocket::new(unreachable_config());
        assert!(client.start().await.is_err());
        assert!(client.restart().await.is_err());
        assert_eq!(client.status(), Status::Closed);

        client.close().await.unwrap();
        assert_eq!(client.status(), Status::Unusable);
        assert!(client.inner.pool.is_closed());
        assert!(matches!(
            client.start().await,
            Err(SocketError::IllegalState(_))
        ));
    }

    #[tokio::test]
    async fn send_requires_open() {
        let client = ClientSocket::new(unreachable_config());
        let result = client.send_event(JsonEvent::new("ping", "{}")).await;
        assert!(matches!(result, Err(SocketError::NotOpen)));
    }
}
