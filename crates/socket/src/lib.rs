//! Authenticated broadcast sockets over WebSocket.
//!
//! A [`ServerSocket`] admits clients during the WebSocket handshake
//! (`Authorization: Basic`), relays every event it receives to all other
//! connections and routes addressed messages by identity. A
//! [`ClientSocket`] keeps one outbound connection to a server. Both share
//! the [`EventBus`] and [`ReceiverRegistry`] used for local delivery.

mod auth;
mod bus;
mod client;
mod connection;
mod messaging;
mod noop;
mod pool;
mod server;
mod status;

use std::future::Future;
use std::pin::Pin;

use javelin_protocol::{CodecError, Event, MessageContext, Payload, codec, message};
use tokio_tungstenite::tungstenite;

pub use auth::{AdmissionError, Authenticator, UserAuthenticator};
pub use bus::{EventBus, Subscription};
pub use client::{ClientConfig, ClientSocket};
pub use connection::SendError;
pub use messaging::ReceiverRegistry;
pub use noop::NoopSocket;
pub use server::{ServerConfig, ServerSocket};
pub use status::Status;

/// Send buffer capacity per connection.
pub const SEND_BUFFER_SIZE: usize = 256;

/// Errors produced by sockets.
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("socket is not open")]
    NotOpen,

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("handshake rejected ({status}): {reason}")]
    Rejected { status: u16, reason: String },

    #[error("WebSocket error: {0}")]
    Transport(#[from] tungstenite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Send(#[from] SendError),

    #[error("worker pool has been released")]
    PoolClosed,

    #[error("{0} is not supported by this socket")]
    Unsupported(&'static str),

    #[error("worker failed: {0}")]
    Worker(String),
}

/// Future returned by socket operations.
pub type SocketFuture = Pin<Box<dyn Future<Output = Result<(), SocketError>> + Send + 'static>>;

/// Produces an encoded event frame. Runs on the socket's worker pool.
pub type FrameEncoder = Box<dyn FnOnce() -> Result<Vec<u8>, CodecError> + Send>;

/// Produces an encoded message frame given the value of its receiver
/// field. Runs on the socket's worker pool.
pub type MessageEncoder = Box<dyn FnOnce(Option<&str>) -> Result<Vec<u8>, CodecError> + Send>;

/// Common surface of server, client and no-op sockets.
///
/// Lifecycle futures run on a spawned task: dropping the future only
/// stops waiting, the socket still settles in a consistent status. A
/// tokio runtime must be running when these methods are called.
pub trait Socket: Send + Sync {
    fn start(&self) -> SocketFuture;

    fn restart(&self) -> SocketFuture {
        ready(Err(SocketError::Unsupported("restart")))
    }

    fn close(&self) -> SocketFuture;

    fn status(&self) -> Status;

    fn bus(&self) -> &EventBus;

    fn receivers(&self) -> &ReceiverRegistry;

    /// Sends an event frame built by `encoder`. Fails with
    /// [`SocketError::NotOpen`] unless the socket is open.
    fn publish(&self, encoder: FrameEncoder) -> SocketFuture;

    /// Sends a message frame to `receiver`, or to every other party when
    /// `receiver` is `None`.
    fn route_message(&self, receiver: Option<String>, encoder: MessageEncoder) -> SocketFuture;
}

/// Typed helpers over [`Socket`].
pub trait SocketExt: Socket {
    /// Broadcasts `event`. Encoding happens on the worker pool; frames
    /// larger than the protocol limit fail before anything is sent.
    fn send_event<E: Event>(&self, event: E) -> SocketFuture {
        self.publish(Box::new(move || codec::encode_event(&event)))
    }

    fn subscribe<E, F>(&self, callback: F) -> Subscription
    where
        E: Event,
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.bus().subscribe(callback)
    }

    /// Sends `payload` to the party identified as `receiver`.
    fn send_message<T: Payload>(
        &self,
        context: &MessageContext,
        payload: T,
        receiver: &str,
    ) -> SocketFuture {
        let context = context.clone();
        self.route_message(
            Some(receiver.to_owned()),
            Box::new(move |field: Option<&str>| {
                message::encode_message(field, &context, &payload)
            }),
        )
    }

    /// Sends `payload` to every other party.
    fn broadcast_message<T: Payload>(&self, context: &MessageContext, payload: T) -> SocketFuture {
        let context = context.clone();
        self.route_message(
            None,
            Box::new(move |field: Option<&str>| {
                message::encode_message(field, &context, &payload)
            }),
        )
    }

    fn bind_receiver<T, F>(&self, context: MessageContext, receiver: F) -> Result<(), SocketError>
    where
        T: Payload,
        F: Fn(T, Option<String>) + Send + Sync + 'static,
    {
        self.receivers().bind(context, receiver)
    }

    fn unbind_receiver(&self, context: &MessageContext) -> bool {
        self.receivers().unbind(context)
    }
}

impl<S: Socket + ?Sized> SocketExt for S {}

pub(crate) fn ready(result: Result<(), SocketError>) -> SocketFuture {
    Box::pin(std::future::ready(result))
}

/// Runs lifecycle work on its own task so a dropped caller cannot leave
/// the socket half-transitioned.
pub(crate) fn spawn_lifecycle<F>(work: F) -> SocketFuture
where
    F: Future<Output = Result<(), SocketError>> + Send + 'static,
{
    let handle = tokio::spawn(work);
    Box::pin(async move {
        handle
            .await
            .map_err(|e| SocketError::Worker(e.to_string()))?
    })
}
