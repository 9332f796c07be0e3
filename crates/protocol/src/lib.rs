//! Wire protocol for Javelin sockets.
//!
//! Defines the binary frame layout shared by servers and clients, the
//! [`Payload`] / [`Event`] traits that give every payload type a stable
//! discriminator, the addressed message frame, and the `Authorization`
//! header used during the WebSocket handshake.

pub mod codec;
pub mod constants;
pub mod credentials;
pub mod error;
pub mod event;
pub mod message;

pub use codec::{Event, EventFrame, Payload};
pub use credentials::{Credentials, CredentialsError};
pub use error::CodecError;
pub use event::JsonEvent;
pub use message::{MessageContext, MessageFrame};
