/// Errors produced while encoding or decoding frames.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("string too long: {0} bytes (max 65535)")]
    StringTooLong(usize),

    #[error("unexpected end of frame")]
    Truncated,

    #[error("unknown frame kind: {0:#04x}")]
    UnknownKind(u8),

    #[error("invalid namespace {0:?}: must not contain ':'")]
    InvalidNamespace(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("protocol error: {0}")]
    Protocol(String),
}
