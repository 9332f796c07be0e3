//! Bounded binary frame codec.
//!
//! # Frame layout
//!
//! ```text
//! [1 byte: frame kind]
//! strings:          [2 bytes BE: len][len bytes: UTF-8]
//! nullable strings: [1 byte: 0x00 absent | 0x01 present][string if present]
//! payload:          [remaining bytes: JSON]
//!
//! EVENT (0x01): [type id][payload]
//! ```
//!
//! The message layout lives in [`crate::message`].

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::constants::{FrameKind, MAX_FRAME_SIZE};
use crate::error::CodecError;

/// A value that can travel inside a frame.
///
/// `TYPE_ID` is the stable discriminator written on the wire; two
/// processes exchange a payload only when both agree on it.
pub trait Payload: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TYPE_ID: &'static str;
}

/// A payload broadcast through the event bus.
pub trait Event: Payload {}

/// Writes a frame into a buffer bounded by a size limit.
///
/// Every `put_*` call fails with [`CodecError::FrameTooLarge`] before
/// growing the buffer past the limit.
#[derive(Debug)]
pub struct FrameWriter {
    buf: Vec<u8>,
    limit: usize,
}

impl FrameWriter {
    /// Starts a frame of the given kind bounded by [`MAX_FRAME_SIZE`].
    pub fn new(kind: FrameKind) -> Self {
        Self::with_limit(kind, MAX_FRAME_SIZE)
    }

    pub fn with_limit(kind: FrameKind, limit: usize) -> Self {
        let mut buf = Vec::with_capacity(128);
        buf.push(kind.as_byte());
        Self { buf, limit }
    }

    fn reserve(&self, extra: usize) -> Result<(), CodecError> {
        let size = self.buf.len() + extra;
        if size > self.limit {
            return Err(CodecError::FrameTooLarge {
                size,
                max: self.limit,
            });
        }
        Ok(())
    }

    pub fn put_u8(&mut self, value: u8) -> Result<(), CodecError> {
        self.reserve(1)?;
        self.buf.push(value);
        Ok(())
    }

    pub fn put_str(&mut self, value: &str) -> Result<(), CodecError> {
        let len = value.len();
        let prefix = u16::try_from(len).map_err(|_| CodecError::StringTooLong(len))?;
        self.reserve(2 + len)?;
        self.buf.extend_from_slice(&prefix.to_be_bytes());
        self.buf.extend_from_slice(value.as_bytes());
        Ok(())
    }

    pub fn put_opt_str(&mut self, value: Option<&str>) -> Result<(), CodecError> {
        match value {
            Some(s) => {
                self.put_u8(1)?;
                self.put_str(s)
            }
            None => self.put_u8(0),
        }
    }

    /// Appends raw bytes (the trailing payload section).
    pub fn put_bytes(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        self.reserve(bytes.len())?;
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Serializes `value` as JSON and appends it.
    pub fn put_json<T: Serialize>(&mut self, value: &T) -> Result<(), CodecError> {
        let json = serde_json::to_vec(value)?;
        self.put_bytes(&json)
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Reads fields from a frame, front to back.
#[derive(Debug, Clone)]
pub struct FrameReader<'a> {
    buf: &'a [u8],
}

impl<'a> FrameReader<'a> {
    pub fn new(frame: &'a [u8]) -> Self {
        Self { buf: frame }
    }

    pub fn kind(&mut self) -> Result<FrameKind, CodecError> {
        let byte = self.get_u8()?;
        FrameKind::from_byte(byte).ok_or(CodecError::UnknownKind(byte))
    }

    pub fn get_u8(&mut self) -> Result<u8, CodecError> {
        let (&byte, rest) = self.buf.split_first().ok_or(CodecError::Truncated)?;
        self.buf = rest;
        Ok(byte)
    }

    pub fn get_str(&mut self) -> Result<&'a str, CodecError> {
        if self.buf.len() < 2 {
            return Err(CodecError::Truncated);
        }
        let len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
        let rest = &self.buf[2..];
        if rest.len() < len {
            return Err(CodecError::Truncated);
        }
        let (bytes, rest) = rest.split_at(len);
        self.buf = rest;
        std::str::from_utf8(bytes)
            .map_err(|e| CodecError::Protocol(format!("invalid UTF-8 string: {e}")))
    }

    pub fn get_opt_str(&mut self) -> Result<Option<&'a str>, CodecError> {
        match self.get_u8()? {
            0 => Ok(None),
            1 => self.get_str().map(Some),
            other => Err(CodecError::Protocol(format!(
                "invalid presence byte: {other:#04x}"
            ))),
        }
    }

    /// Consumes the reader and returns the unread bytes.
    pub fn remaining(self) -> &'a [u8] {
        self.buf
    }
}

/// Returns the kind tag of a frame without parsing the rest.
pub fn frame_kind(frame: &[u8]) -> Result<FrameKind, CodecError> {
    FrameReader::new(frame).kind()
}

/// Encodes an event as `[0x01][type id][payload]`.
pub fn encode_event<E: Event>(event: &E) -> Result<Vec<u8>, CodecError> {
    let mut writer = FrameWriter::new(FrameKind::Event);
    writer.put_str(E::TYPE_ID)?;
    writer.put_json(event)?;
    Ok(writer.finish())
}

/// Decodes a JSON payload section.
pub fn decode_payload<T: Payload>(bytes: &[u8]) -> Result<T, CodecError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// A parsed event frame whose payload has not been decoded yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventFrame<'a> {
    pub type_id: &'a str,
    pub payload: &'a [u8],
}

impl<'a> EventFrame<'a> {
    /// Reads the discriminator. The payload is left untouched so frames
    /// nobody listens to are never deserialized.
    pub fn parse(frame: &'a [u8]) -> Result<Self, CodecError> {
        let mut reader = FrameReader::new(frame);
        let kind = reader.kind()?;
        if kind != FrameKind::Event {
            return Err(CodecError::Protocol(format!(
                "expected event frame, got {kind:?}"
            )));
        }
        let type_id = reader.get_str()?;
        Ok(Self {
            type_id,
            payload: reader.remaining(),
        })
    }

    pub fn decode<T: Payload>(&self) -> Result<T, CodecError> {
        decode_payload(self.payload)
    }
}
