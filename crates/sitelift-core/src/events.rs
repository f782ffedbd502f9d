//! Typed subscription registry for realtime events.
//!
//! Handlers are keyed by [`Topic`] and invoked in registration order. A
//! panicking handler is logged and does not stop the remaining handlers.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::models::Envelope;

/// What a handler subscribes to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Lifecycle changes of the connection.
    Connection,
    /// Non-fatal transport errors.
    Error,
    /// Every inbound message, after the type-specific handlers.
    AnyMessage,
    /// Inbound messages of one `type`.
    Message(String),
}

impl Topic {
    pub fn message(kind: impl Into<String>) -> Self {
        Topic::Message(kind.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    /// `permanent` is set once reconnection has given up.
    Disconnected {
        permanent: bool,
        reason: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionError {
    pub message: String,
    pub recoverable: bool,
}

impl ConnectionError {
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            recoverable: true,
        }
    }
}

/// Payload delivered to handlers.
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEvent {
    Connection(ConnectionEvent),
    Error(ConnectionError),
    Message(Envelope),
}

/// Identifies one registration, returned by [`EventRegistry::on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandlerId(u64);

pub type Handler = Arc<dyn Fn(&RealtimeEvent) + Send + Sync>;

/// Handlers of one topic in registration order.
///
/// Removal leaves a tombstone found through `index`; the slots are compacted
/// once tombstones outnumber live handlers, so `on` and `off` stay O(1)
/// amortized.
#[derive(Default)]
struct HandlerList {
    slots: Vec<Option<(HandlerId, Handler)>>,
    index: HashMap<HandlerId, usize>,
}

impl HandlerList {
    fn push(&mut self, id: HandlerId, handler: Handler) {
        self.index.insert(id, self.slots.len());
        self.slots.push(Some((id, handler)));
    }

    fn remove(&mut self, id: HandlerId) -> bool {
        let Some(slot) = self.index.remove(&id) else {
            return false;
        };
        self.slots[slot] = None;
        if self.slots.len() > 2 * self.index.len() {
            self.compact();
        }
        true
    }

    fn compact(&mut self) {
        self.slots.retain(Option::is_some);
        for (slot, entry) in self.slots.iter().enumerate() {
            if let Some((id, _)) = entry {
                self.index.insert(*id, slot);
            }
        }
    }

    fn len(&self) -> usize {
        self.index.len()
    }

    fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    fn iter(&self) -> impl Iterator<Item = &(HandlerId, Handler)> {
        self.slots.iter().flatten()
    }
}

/// Topic → handlers in registration order.
#[derive(Default)]
pub struct EventRegistry {
    next_id: AtomicU64,
    handlers: Mutex<HashMap<Topic, HandlerList>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_handlers(&self) -> MutexGuard<'_, HashMap<Topic, HandlerList>> {
        self.handlers.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned event registry mutex");
            poisoned.into_inner()
        })
    }

    pub fn on<F>(&self, topic: Topic, handler: F) -> HandlerId
    where
        F: Fn(&RealtimeEvent) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock_handlers()
            .entry(topic)
            .or_default()
            .push(id, Arc::new(handler));
        id
    }

    /// Remove one handler. Returns false if it was not registered under `topic`.
    pub fn off(&self, topic: &Topic, id: HandlerId) -> bool {
        let mut handlers = self.lock_handlers();
        let Some(entry) = handlers.get_mut(topic) else {
            return false;
        };
        let removed = entry.remove(id);
        if entry.is_empty() {
            handlers.remove(topic);
        }
        removed
    }

    /// Invoke every handler of `topic` with `event`. Returns how many ran
    /// to completion.
    ///
    /// Handlers are cloned out first so a handler may call `on`/`off`
    /// without deadlocking.
    pub fn dispatch(&self, topic: &Topic, event: &RealtimeEvent) -> usize {
        let handlers: Vec<(HandlerId, Handler)> = match self.lock_handlers().get(topic) {
            Some(entry) => entry.iter().cloned().collect(),
            None => return 0,
        };

        let mut delivered = 0;
        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    tracing::error!(?topic, handler = id.0, "Event handler panicked");
                }
            }
        }
        delivered
    }

    pub fn handler_count(&self, topic: &Topic) -> usize {
        self.lock_handlers().get(topic).map_or(0, HandlerList::len)
    }

    pub fn has_topic(&self, topic: &Topic) -> bool {
        self.lock_handlers().contains_key(topic)
    }

    pub fn clear(&self) {
        self.lock_handlers().clear();
    }
}

impl std::fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.lock_handlers();
        f.debug_struct("EventRegistry")
            .field("topics", &handlers.len())
            .finish()
    }
}
