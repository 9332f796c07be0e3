//! Connection pumps shared by both socket roles: read/write loops,
//! ping/pong keepalive and send buffering.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use javelin_protocol::constants::{WS_MAX_MESSAGE_SIZE, WS_PING_PERIOD, WS_PONG_WAIT};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::SEND_BUFFER_SIZE;
use crate::bus::EventBus;
use crate::messaging::ReceiverRegistry;
use crate::pool::WorkerPool;

pub(crate) type ConnectionId = Uuid;

/// Receives inbound binary frames of one connection.
pub(crate) trait FrameHandler: Send + Sync + 'static {
    /// Called for every binary frame, in arrival order, on the read
    /// pump. Must not wait on subscribers; hand local delivery to a
    /// [`LocalQueue`].
    fn on_frame(&self, id: ConnectionId, frame: Vec<u8>);

    /// Called once when the connection ends, before the write side closes.
    fn on_disconnect(&self, id: ConnectionId);
}

/// Transport limits applied to both roles.
pub(crate) fn ws_config() -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
    config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
    config
}

/// Error returned when the send buffer is full or the connection closed.
#[derive(Debug, thiserror::Error)]
#[error("send failed: buffer full or connection closed")]
pub struct SendError;

/// Cloneable handle queueing frames on a connection's write pump.
#[derive(Debug, Clone)]
pub(crate) struct Outbound {
    tx: mpsc::Sender<WsMessage>,
}

impl Outbound {
    /// Creates the send buffer ahead of the handshake so frames can be
    /// queued for a peer before its pumps are running.
    pub(crate) fn channel() -> (Self, mpsc::Receiver<WsMessage>) {
        let (tx, rx) = mpsc::channel(SEND_BUFFER_SIZE);
        (Self { tx }, rx)
    }

    pub(crate) fn send_binary(&self, frame: Vec<u8>) -> Result<(), SendError> {
        self.tx
            .try_send(WsMessage::Binary(frame.into()))
            .map_err(|_| SendError)
    }
}

/// Inbound frame bound for this socket's own subscribers or receivers.
#[derive(Debug)]
pub(crate) enum LocalFrame {
    Event(Vec<u8>),
    Message(Vec<u8>),
}

/// Per-connection FIFO feeding local delivery.
///
/// One task drains the queue, awaiting each dispatch before the next, so
/// frames from one connection reach subscribers in arrival order while
/// the read pump keeps reading. The task ends once every handle is
/// dropped and the queue is empty.
#[derive(Debug, Clone)]
pub(crate) struct LocalQueue {
    tx: mpsc::UnboundedSender<LocalFrame>,
}

impl LocalQueue {
    pub(crate) fn spawn(bus: EventBus, receivers: ReceiverRegistry, pool: WorkerPool) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                match frame {
                    LocalFrame::Event(frame) => bus.dispatch(&pool, frame).await,
                    LocalFrame::Message(frame) => receivers.dispatch(&pool, frame).await,
                }
            }
        });
        Self { tx }
    }

    pub(crate) fn push(&self, frame: LocalFrame) {
        if self.tx.send(frame).is_err() {
            debug!("local delivery stopped, dropping frame");
        }
    }
}

/// A live connection: its send handle, cancel token and read task.
#[derive(Debug)]
pub(crate) struct Connection {
    pub(crate) id: ConnectionId,
    pub(crate) outbound: Outbound,
    cancel: CancellationToken,
    reader: JoinHandle<()>,
}

impl Connection {
    /// Stops both pumps immediately. The write pump still tries to send a
    /// close frame on its way out.
    pub(crate) fn close(&self) {
        self.cancel.cancel();
    }

    /// Starts the close handshake and waits up to `grace` for the peer to
    /// answer it before cancelling the pumps.
    pub(crate) async fn shutdown(self, grace: Duration) {
        let Connection {
            id,
            outbound,
            cancel,
            mut reader,
        } = self;
        if outbound.tx.try_send(WsMessage::Close(None)).is_ok()
            && tokio::time::timeout(grace, &mut reader).await.is_err()
        {
            debug!(connection = %id, "peer did not answer close, cancelling");
        }
        cancel.cancel();
    }
}

/// Spawns the read and write pumps for an upgraded WebSocket.
///
/// `cancel` stops both pumps. When the read pump exits, for whatever
/// reason, the handler is told and the write pump is cancelled.
pub(crate) fn spawn_connection<S, H>(
    ws_stream: S,
    id: ConnectionId,
    outbound: Outbound,
    rx: mpsc::Receiver<WsMessage>,
    handler: Arc<H>,
    cancel: CancellationToken,
) -> Connection
where
    S: Stream<Item = Result<WsMessage, tungstenite::Error>>
        + Sink<WsMessage, Error = tungstenite::Error>
        + Send
        + 'static,
    H: FrameHandler,
{
    let (ws_sink, ws_stream) = ws_stream.split();

    tokio::spawn(write_pump(ws_sink, rx, cancel.clone()));

    let read_cancel = cancel.clone();
    let read_outbound = outbound.clone();
    let reader = tokio::spawn(async move {
        read_pump(ws_stream, id, read_outbound, &handler, read_cancel.clone()).await;
        handler.on_disconnect(id);
        read_cancel.cancel();
    });

    Connection {
        id,
        outbound,
        cancel,
        reader,
    }
}

/// Write pump: drains the send buffer and pings the peer.
async fn write_pump<S>(mut sink: S, mut rx: mpsc::Receiver<WsMessage>, cancel: CancellationToken)
where
    S: Sink<WsMessage, Error = tungstenite::Error> + Send + Unpin,
{
    let mut ping_interval = tokio::time::interval(WS_PING_PERIOD);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping_interval.reset();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            msg = rx.recv() => {
                match msg {
                    Some(ws_msg) => {
                        if let Err(e) = sink.send(ws_msg).await {
                            debug!("write pump send error: {e}");
                            break;
                        }
                    }
                    None => break,
                }
            }

            _ = ping_interval.tick() => {
                if let Err(e) = sink.send(WsMessage::Ping(Vec::new().into())).await {
                    debug!("write pump ping error: {e}");
                    break;
                }
            }
        }
    }

    // Best-effort close frame.
    let _ = sink.close().await;
}

/// Read pump: forwards binary frames to the handler.
///
/// Any inbound traffic resets the read deadline; a connection silent for
/// [`WS_PONG_WAIT`] is dropped.
async fn read_pump<S, H>(
    mut stream: S,
    id: ConnectionId,
    outbound: Outbound,
    handler: &Arc<H>,
    cancel: CancellationToken,
) where
    S: Stream<Item = Result<WsMessage, tungstenite::Error>> + Send + Unpin,
    H: FrameHandler,
{
    let deadline = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            () = &mut deadline => {
                warn!(connection = %id, "read deadline expired, closing connection");
                break;
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(ws_msg)) => {
                        deadline.as_mut().reset(tokio::time::Instant::now() + WS_PONG_WAIT);
                        match ws_msg {
                            WsMessage::Binary(data) => {
                                handler.on_frame(id, data.to_vec());
                            }
                            WsMessage::Text(_) => {
                                debug!(connection = %id, "ignoring text frame");
                            }
                            WsMessage::Ping(data) => {
                                let _ = outbound.tx.try_send(WsMessage::Pong(data));
                            }
                            WsMessage::Pong(_) => {
                                trace!(connection = %id, "received pong");
                            }
                            WsMessage::Close(_) => {
                                debug!(connection = %id, "received close frame");
                                break;
                            }
                            WsMessage::Frame(_) => {}
                        }
                    }
                    Some(Err(e)) => {
                        debug!(connection = %id, "read pump error: {e}");
                        break;
                    }
                    None => break,
                }
            }
        }
    }
}
