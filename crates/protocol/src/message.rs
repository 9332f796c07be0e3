//! Addressed messages.
//!
//! # Frame layout
//!
//! ```text
//! MESSAGE (0x02):
//!   [nullable string: receiver]
//!   [string: namespace]
//!   [string: subject]
//!   [string: payload type id]
//!   [payload JSON]
//! ```
//!
//! A client writes the target identity in the receiver field (or null
//! to broadcast). The server replaces it with the sender identity before
//! relaying, so receivers always see who the message came from.

use std::fmt;

use crate::codec::{FrameReader, FrameWriter, Payload, decode_payload};
use crate::constants::FrameKind;
use crate::error::CodecError;

/// Routing key of an addressed message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageContext {
    namespace: String,
    subject: String,
    payload_type: String,
}

impl MessageContext {
    /// Builds a context for payload type `T`.
    pub fn of<T: Payload>(
        namespace: impl Into<String>,
        subject: impl Into<String>,
    ) -> Result<Self, CodecError> {
        Self::new(namespace, subject, T::TYPE_ID)
    }

    pub fn new(
        namespace: impl Into<String>,
        subject: impl Into<String>,
        payload_type: impl Into<String>,
    ) -> Result<Self, CodecError> {
        let namespace = namespace.into();
        if namespace.contains(':') {
            return Err(CodecError::InvalidNamespace(namespace));
        }
        Ok(Self {
            namespace,
            subject: subject.into(),
            payload_type: payload_type.into(),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn payload_type(&self) -> &str {
        &self.payload_type
    }
}

impl fmt::Display for MessageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}<{}>", self.namespace, self.subject, self.payload_type)
    }
}

/// Encodes a message frame.
///
/// Fails with [`CodecError::Protocol`] if `T` does not match the payload
/// type recorded in `context`.
pub fn encode_message<T: Payload>(
    receiver: Option<&str>,
    context: &MessageContext,
    payload: &T,
) -> Result<Vec<u8>, CodecError> {
    if context.payload_type != T::TYPE_ID {
        return Err(CodecError::Protocol(format!(
            "payload type {} does not match context {context}",
            T::TYPE_ID
        )));
    }
    let mut writer = FrameWriter::new(FrameKind::Message);
    writer.put_opt_str(receiver)?;
    writer.put_str(&context.namespace)?;
    writer.put_str(&context.subject)?;
    writer.put_str(&context.payload_type)?;
    writer.put_json(payload)?;
    Ok(writer.finish())
}

/// A parsed message frame whose payload has not been decoded yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageFrame<'a> {
    pub receiver: Option<&'a str>,
    pub context: MessageContext,
    pub payload: &'a [u8],
}

impl<'a> MessageFrame<'a> {
    pub fn parse(frame: &'a [u8]) -> Result<Self, CodecError> {
        let mut reader = FrameReader::new(frame);
        expect_message(&mut reader)?;
        let receiver = reader.get_opt_str()?;
        let namespace = reader.get_str()?;
        let subject = reader.get_str()?;
        let payload_type = reader.get_str()?;
        Ok(Self {
            receiver,
            context: MessageContext::new(namespace, subject, payload_type)?,
            payload: reader.remaining(),
        })
    }

    pub fn decode<T: Payload>(&self) -> Result<T, CodecError> {
        decode_payload(self.payload)
    }
}

/// Replaces the receiver field of a message frame.
///
/// Returns the previous receiver and the rewritten frame. The rest of the
/// frame is copied verbatim.
pub fn rewrite_receiver(
    frame: &[u8],
    receiver: Option<&str>,
) -> Result<(Option<String>, Vec<u8>), CodecError> {
    let mut reader = FrameReader::new(frame);
    expect_message(&mut reader)?;
    let previous = reader.get_opt_str()?.map(str::to_owned);

    let mut writer = FrameWriter::with_limit(FrameKind::Message, usize::MAX);
    writer.put_opt_str(receiver)?;
    writer.put_bytes(reader.remaining())?;
    Ok((previous, writer.finish()))
}

fn expect_message(reader: &mut FrameReader<'_>) -> Result<(), CodecError> {
    let kind = reader.kind()?;
    if kind != FrameKind::Message {
        return Err(CodecError::Protocol(format!(
            "expected message frame, got {kind:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Note(String);

    impl Payload for Note {
        const TYPE_ID: &'static str = "note";
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Other(u32);

    impl Payload for Other {
        const TYPE_ID: &'static str = "other";
    }

    fn context() -> MessageContext {
        MessageContext::of::<Note>("chat", "whisper").unwrap()
    }

    #[test]
    fn context_rejects_colon_in_namespace() {
        assert!(matches!(
            MessageContext::of::<Note>("bad:ns", "subject"),
            Err(CodecError::InvalidNamespace(ns)) if ns == "bad:ns"
        ));
    }

    #[test]
    fn context_allows_colon_in_subject() {
        let ctx = MessageContext::of::<Note>("chat", "a:b").unwrap();
        assert_eq!(ctx.subject(), "a:b");
    }

    #[test]
    fn context_equality_covers_all_fields() {
        let a = context();
        assert_eq!(a, MessageContext::new("chat", "whisper", "note").unwrap());
        assert_ne!(a, MessageContext::of::<Other>("chat", "whisper").unwrap());
        assert_ne!(a, MessageContext::of::<Note>("chat", "shout").unwrap());
        assert_ne!(a, MessageContext::of::<Note>("game", "whisper").unwrap());
    }

    #[test]
    fn context_display() {
        assert_eq!(context().to_string(), "chat:whisper<note>");
    }

    #[test]
    fn parse_addressed_message() {
        let frame = encode_message(Some("alice"), &context(), &Note("hey".into())).unwrap();
        let parsed = MessageFrame::parse(&frame).unwrap();
        assert_eq!(parsed.receiver, Some("alice"));
        assert_eq!(parsed.context, context());
        assert_eq!(parsed.decode::<Note>().unwrap(), Note("hey".into()));
    }

    #[test]
    fn parse_broadcast_message() {
        let frame = encode_message(None, &context(), &Note("all".into())).unwrap();
        assert_eq!(frame[1], 0x00);
        let parsed = MessageFrame::parse(&frame).unwrap();
        assert_eq!(parsed.receiver, None);
    }

    #[test]
    fn payload_type_must_match_context() {
        let result = encode_message(None, &context(), &Other(1));
        assert!(matches!(result, Err(CodecError::Protocol(_))));
    }

    #[test]
    fn rewrite_swaps_receiver_for_sender() {
        let frame = encode_message(Some("alice"), &context(), &Note("hey".into())).unwrap();
        let (previous, rewritten) = rewrite_receiver(&frame, Some("bob")).unwrap();
        assert_eq!(previous.as_deref(), Some("alice"));

        let parsed = MessageFrame::parse(&rewritten).unwrap();
        assert_eq!(parsed.receiver, Some("bob"));
        assert_eq!(parsed.context, context());
        assert_eq!(parsed.decode::<Note>().unwrap(), Note("hey".into()));
    }

    #[test]
    fn rewrite_to_anonymous_sender() {
        let frame = encode_message(None, &context(), &Note("x".into())).unwrap();
        let (previous, rewritten) = rewrite_receiver(&frame, None).unwrap();
        assert_eq!(previous, None);
        assert_eq!(rewritten, frame);
    }

    #[test]
    fn rewrite_to_longest_sender_fits_transport() {
        use crate::constants::{MAX_FRAME_SIZE, WS_MAX_MESSAGE_SIZE};

        let frame = encode_message(None, &context(), &Note("x".repeat(8000))).unwrap();
        assert!(frame.len() <= MAX_FRAME_SIZE);

        let sender = "s".repeat(u16::MAX as usize);
        let (_, rewritten) = rewrite_receiver(&frame, Some(&sender)).unwrap();
        assert!(rewritten.len() > MAX_FRAME_SIZE);
        assert!(rewritten.len() <= WS_MAX_MESSAGE_SIZE);
        assert_eq!(MessageFrame::parse(&rewritten).unwrap().receiver, Some(sender.as_str()));
    }

    #[test]
    fn rewrite_rejects_event_frames() {
        assert!(rewrite_receiver(&[0x01, 0x00, 0x00], None).is_err());
    }
}
