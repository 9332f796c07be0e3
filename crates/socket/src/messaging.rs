//! Message receivers keyed by [`MessageContext`].

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, RwLock};

use javelin_protocol::codec::decode_payload;
use javelin_protocol::{CodecError, MessageContext, MessageFrame, Payload};
use tracing::{error, trace, warn};

use crate::SocketError;
use crate::bus::panic_message;
use crate::pool::WorkerPool;

type Receiver = Arc<dyn Fn(&[u8], Option<String>) -> Result<(), CodecError> + Send + Sync>;

/// Registry of message receivers. At most one receiver per context.
#[derive(Clone, Default)]
pub struct ReceiverRegistry {
    receivers: Arc<RwLock<HashMap<MessageContext, Receiver>>>,
}

impl ReceiverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `receiver` to `context`, replacing any previous binding.
    ///
    /// The receiver is called with the decoded payload and the identity of
    /// the sender (`None` for anonymous senders and the server itself).
    pub fn bind<T, F>(&self, context: MessageContext, receiver: F) -> Result<(), SocketError>
    where
        T: Payload,
        F: Fn(T, Option<String>) + Send + Sync + 'static,
    {
        if context.payload_type() != T::TYPE_ID {
            return Err(SocketError::Codec(CodecError::Protocol(format!(
                "receiver for {} cannot be bound to {context}",
                T::TYPE_ID
            ))));
        }

        let erased: Receiver = Arc::new(move |payload: &[u8], sender: Option<String>| {
            let value = decode_payload::<T>(payload)?;
            receiver(value, sender);
            Ok(())
        });
        let previous = write_lock(&self.receivers).insert(context.clone(), erased);
        if previous.is_some() {
            trace!(%context, "replaced message receiver");
        }
        Ok(())
    }

    /// Removes the receiver bound to `context`. Returns `true` if one existed.
    pub fn unbind(&self, context: &MessageContext) -> bool {
        write_lock(&self.receivers).remove(context).is_some()
    }

    pub fn is_bound(&self, context: &MessageContext) -> bool {
        read_lock(&self.receivers).contains_key(context)
    }

    /// Delivers a message frame to the receiver bound to its context.
    ///
    /// Frames without a bound receiver are accepted and dropped; only the
    /// address section is read.
    pub(crate) async fn dispatch<B>(&self, pool: &WorkerPool, frame: B)
    where
        B: AsRef<[u8]> + Send + 'static,
    {
        let receiver = match MessageFrame::parse(frame.as_ref()) {
            Ok(parsed) => match read_lock(&self.receivers).get(&parsed.context) {
                Some(receiver) => Arc::clone(receiver),
                None => {
                    trace!(context = %parsed.context, "no receiver bound, dropping message");
                    return;
                }
            },
            Err(e) => {
                warn!("dropping malformed message frame: {e}");
                return;
            }
        };

        let result = pool
            .execute(move || {
                let Ok(parsed) = MessageFrame::parse(frame.as_ref()) else {
                    return;
                };
                let sender = parsed.receiver.map(str::to_owned);
                let context = &parsed.context;
                match catch_unwind(AssertUnwindSafe(|| receiver(parsed.payload, sender))) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(%context, "failed to decode message: {e}"),
                    Err(panic) => error!(
                        %context,
                        "message receiver panicked: {}",
                        panic_message(panic.as_ref())
                    ),
                }
            })
            .await;
        if let Err(e) = result {
            warn!("message dispatch failed: {e}");
        }
    }
}

impl std::fmt::Debug for ReceiverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let receivers = read_lock(&self.receivers);
        f.debug_struct("ReceiverRegistry")
            .field("contexts", &receivers.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
