use std::time::Duration;

/// Maximum size of an encoded event or message frame, in bytes.
pub const MAX_FRAME_SIZE: usize = 8192;

/// Maximum WebSocket message size accepted by the transport.
///
/// Covers a [`MAX_FRAME_SIZE`] frame whose receiver field the server
/// rewrote to the longest encodable identity.
pub const WS_MAX_MESSAGE_SIZE: usize = 128 * 1024;

/// How often the server pings admitted connections.
pub const WS_PING_PERIOD: Duration = Duration::from_secs(20);

/// Read deadline: a connection silent for this long is considered dead.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(60);

/// Handshake header carrying the client credentials.
pub const AUTHORIZATION_HEADER: &str = "Authorization";

/// Authentication scheme prefix of the [`AUTHORIZATION_HEADER`] value.
pub const BASIC_SCHEME: &str = "Basic ";

/// Default server port.
pub const DEFAULT_PORT: u16 = 8080;

/// Default worker pool size.
pub const DEFAULT_WORKERS: usize = 4;

/// Default server address used by clients.
pub const DEFAULT_ADDRESS: &str = "ws://localhost:8080";

/// Leading tag byte of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    Event = 0x01,
    Message = 0x02,
}

impl FrameKind {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Event),
            0x02 => Some(Self::Message),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}
