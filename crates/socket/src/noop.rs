//! Socket used when a node runs with networking disabled.

use tracing::trace;

use crate::bus::EventBus;
use crate::messaging::ReceiverRegistry;
use crate::status::Status;
use crate::{FrameEncoder, MessageEncoder, Socket, SocketFuture, ready};

/// Always `CLOSED`. Lifecycle calls succeed and sends are dropped, so code
/// written against [`Socket`] runs unchanged without a network.
#[derive(Debug, Default)]
pub struct NoopSocket {
    bus: EventBus,
    receivers: ReceiverRegistry,
}

impl NoopSocket {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Socket for NoopSocket {
    fn start(&self) -> SocketFuture {
        ready(Ok(()))
    }

    fn restart(&self) -> SocketFuture {
        ready(Ok(()))
    }

    fn close(&self) -> SocketFuture {
        ready(Ok(()))
    }

    fn status(&self) -> Status {
        Status::Closed
    }

    fn bus(&self) -> &EventBus {
        &self.bus
    }

    fn receivers(&self) -> &ReceiverRegistry {
        &self.receivers
    }

    fn publish(&self, _encoder: FrameEncoder) -> SocketFuture {
        trace!("no-op socket dropped an event");
        ready(Ok(()))
    }

    fn route_message(&self, _receiver: Option<String>, _encoder: MessageEncoder) -> SocketFuture {
        trace!("no-op socket dropped a message");
        ready(Ok(()))
    }
}
