//! Per-socket event bus: typed subscriptions keyed by event discriminator.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use javelin_protocol::codec::{self, EventFrame};
use javelin_protocol::{CodecError, Event};
use tracing::{error, trace, warn};

use crate::pool::WorkerPool;

type Decoded = Arc<dyn Any + Send + Sync>;
type Decoder = fn(&[u8]) -> Result<Decoded, CodecError>;
type Callback = Arc<dyn Fn(&(dyn Any + Send + Sync)) + Send + Sync>;

#[derive(Clone)]
struct Entry {
    id: u64,
    rust_type: TypeId,
    decode: Decoder,
    callback: Callback,
}

#[derive(Default)]
struct BusInner {
    topics: RwLock<HashMap<&'static str, Vec<Entry>>>,
    next_id: AtomicU64,
}

/// Registry of event subscribers.
///
/// Cloning is cheap and yields a handle to the same registry.
/// Subscribing and unsubscribing are safe while frames are being
/// dispatched; a dispatch works on a snapshot taken when the frame
/// arrived.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` for events of type `E`.
    pub fn subscribe<E, F>(&self, callback: F) -> Subscription
    where
        E: Event,
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Entry {
            id,
            rust_type: TypeId::of::<E>(),
            decode: decode_as::<E>,
            callback: Arc::new(move |value: &(dyn Any + Send + Sync)| {
                if let Some(event) = value.downcast_ref::<E>() {
                    callback(event);
                }
            }),
        };

        let mut topics = write_lock(&self.inner.topics);
        topics.entry(E::TYPE_ID).or_default().push(entry);
        trace!(type_id = E::TYPE_ID, subscriber = id, "subscribed");

        Subscription {
            bus: Arc::downgrade(&self.inner),
            type_id: E::TYPE_ID,
            id,
            active: AtomicBool::new(true),
        }
    }

    pub fn has_subscribers(&self, type_id: &str) -> bool {
        self.subscriber_count(type_id) > 0
    }

    pub fn subscriber_count(&self, type_id: &str) -> usize {
        read_lock(&self.inner.topics)
            .get(type_id)
            .map_or(0, Vec::len)
    }

    fn snapshot(&self, type_id: &str) -> Vec<Entry> {
        read_lock(&self.inner.topics)
            .get(type_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Delivers an event frame to the subscribers of its type.
    ///
    /// Frames whose type has no subscriber are dropped without decoding
    /// the payload. Decoding and callbacks run on `pool`; a panicking
    /// subscriber is logged and does not affect the others.
    pub(crate) async fn dispatch<B>(&self, pool: &WorkerPool, frame: B)
    where
        B: AsRef<[u8]> + Send + 'static,
    {
        let entries = match EventFrame::parse(frame.as_ref()) {
            Ok(parsed) => {
                let entries = self.snapshot(parsed.type_id);
                if entries.is_empty() {
                    trace!(type_id = parsed.type_id, "no subscribers, dropping event");
                    return;
                }
                entries
            }
            Err(e) => {
                warn!("dropping malformed event frame: {e}");
                return;
            }
        };

        let result = pool
            .execute(move || {
                if let Ok(parsed) = EventFrame::parse(frame.as_ref()) {
                    invoke(parsed, entries);
                }
            })
            .await;
        if let Err(e) = result {
            warn!("event dispatch failed: {e}");
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let topics = read_lock(&self.inner.topics);
        f.debug_struct("EventBus")
            .field("topics", &topics.len())
            .finish()
    }
}

fn invoke(frame: EventFrame<'_>, entries: Vec<Entry>) {
    let mut decoded: Vec<(TypeId, Decoded)> = Vec::with_capacity(1);
    for entry in entries {
        let value = match decoded.iter().find(|(t, _)| *t == entry.rust_type) {
            Some((_, value)) => Arc::clone(value),
            None => match (entry.decode)(frame.payload) {
                Ok(value) => {
                    decoded.push((entry.rust_type, Arc::clone(&value)));
                    value
                }
                Err(e) => {
                    warn!(type_id = frame.type_id, "failed to decode event: {e}");
                    continue;
                }
            },
        };

        let callback = &entry.callback;
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(value.as_ref()))) {
            error!(
                type_id = frame.type_id,
                subscriber = entry.id,
                "event subscriber panicked: {}",
                panic_message(panic.as_ref())
            );
        }
    }
}

fn decode_as<E: Event>(bytes: &[u8]) -> Result<Decoded, CodecError> {
    Ok(Arc::new(codec::decode_payload::<E>(bytes)?))
}

/// Extracts the message of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Handle to a single subscription.
///
/// Dropping the handle keeps the subscription alive; call
/// [`Subscription::unsubscribe`] to remove it.
#[derive(Debug)]
pub struct Subscription {
    bus: Weak<BusInner>,
    type_id: &'static str,
    id: u64,
    active: AtomicBool,
}

impl Subscription {
    /// Removes exactly this subscription. Returns `false` if it was
    /// already removed.
    pub fn unsubscribe(&self) -> bool {
        if !self.active.swap(false, Ordering::AcqRel) {
            return false;
        }
        let Some(bus) = self.bus.upgrade() else {
            return false;
        };

        let mut topics = write_lock(&bus.topics);
        let Some(entries) = topics.get_mut(self.type_id) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|entry| entry.id != self.id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            topics.remove(self.type_id);
        }
        trace!(type_id = self.type_id, subscriber = self.id, "unsubscribed");
        removed
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn type_id(&self) -> &'static str {
        self.type_id
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use javelin_protocol::Payload;
    use javelin_protocol::codec::encode_event;
    use serde::{Deserialize, Serialize};
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Chat(String);

    impl Payload for Chat {
        const TYPE_ID: &'static str = "chat";
    }

    impl Event for Chat {}

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Score(u32);

    impl Payload for Score {
        const TYPE_ID: &'static str = "score";
    }

    impl Event for Score {}

    fn frame(text: &str) -> Vec<u8> {
        encode_event(&Chat(text.into())).unwrap()
    }

    #[tokio::test]
    async fn dispatch_reaches_every_subscriber() {
        let bus = EventBus::new();
        let pool = WorkerPool::new(2);
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b"] {
            let seen = Arc::clone(&seen);
            bus.subscribe::<Chat, _>(move |chat| {
                seen.lock().unwrap().push(format!("{tag}:{}", chat.0));
            });
        }

        bus.dispatch(&pool, frame("hi")).await;
        let mut seen = seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec!["a:hi", "b:hi"]);
    }

    #[tokio::test]
    async fn other_types_are_not_delivered() {
        let bus = EventBus::new();
        let pool = WorkerPool::new(1);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        bus.subscribe::<Score, _>(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        bus.dispatch(&pool, frame("hi")).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_type_is_dropped_without_decoding() {
        let bus = EventBus::new();
        let pool = WorkerPool::new(1);
        // Payload is not valid JSON; a decode attempt would be logged and
        // skipped, but no subscriber exists so nothing is decoded at all.
        let mut raw = vec![0x01, 0x00, 0x03];
        raw.extend_from_slice(b"zzz{{{");
        bus.dispatch(&pool, raw).await;
        assert!(!bus.has_subscribers("zzz"));
    }

    #[tokio::test]
    async fn unsubscribe_removes_only_that_binding() {
        let bus = EventBus::new();
        let pool = WorkerPool::new(1);
        let hits = Arc::new(AtomicUsize::new(0));

        let h1 = Arc::clone(&hits);
        let first = bus.subscribe::<Chat, _>(move |_| {
            h1.fetch_add(1, Ordering::SeqCst);
        });
        let h2 = Arc::clone(&hits);
        let _second = bus.subscribe::<Chat, _>(move |_| {
            h2.fetch_add(10, Ordering::SeqCst);
        });
        assert_eq!(bus.subscriber_count("chat"), 2);

        assert!(first.unsubscribe());
        assert!(!first.unsubscribe());
        assert!(!first.is_active());
        assert_eq!(bus.subscriber_count("chat"), 1);

        bus.dispatch(&pool, frame("x")).await;
        assert_eq!(hits.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn panicking_subscriber_is_isolated() {
        let bus = EventBus::new();
        let pool = WorkerPool::new(1);
        let hits = Arc::new(AtomicUsize::new(0));

        bus.subscribe::<Chat, _>(|_| panic!("subscriber failure"));
        let h = Arc::clone(&hits);
        bus.subscribe::<Chat, _>(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        bus.dispatch(&pool, frame("x")).await;
        bus.dispatch(&pool, frame("y")).await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn malformed_frame_is_dropped() {
        let bus = EventBus::new();
        let pool = WorkerPool::new(1);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        bus.subscribe::<Chat, _>(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        bus.dispatch(&pool, vec![0x01, 0x00]).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unsubscribe_after_bus_dropped() {
        let bus = EventBus::new();
        let sub = bus.subscribe::<Chat, _>(|_| {});
        drop(bus);
        assert!(!sub.unsubscribe());
        assert_eq!(sub.type_id(), "chat");
    }

    #[test]
    fn panic_message_extraction() {
        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(payload.as_ref()), "static");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }
}
