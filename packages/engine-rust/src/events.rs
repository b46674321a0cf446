//! Queue lifecycle events and listener registration.
//!
//! Hosts register per-queue callbacks; the store fires them on message and
//! queue transitions. Listener panics are the host's problem to avoid --
//! callbacks run on engine threads and are invoked outside queue locks.

use ahash::AHashMap;
use parking_lot::RwLock;
use quiver_core::types::MessageId;
use std::sync::Arc;

/// Something observable happened to a queue.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// A message was accepted into the pending sequence.
    MessageEnqueued {
        /// Owning queue.
        queue: String,
        /// The message.
        id: MessageId,
    },
    /// A message was handed to a consumer.
    MessageDelivered {
        /// Owning queue.
        queue: String,
        /// The message.
        id: MessageId,
        /// Consumer tag supplied to receive.
        consumer: String,
    },
    /// A message was acknowledged and removed.
    MessageAcknowledged {
        /// Owning queue.
        queue: String,
        /// The message.
        id: MessageId,
    },
    /// A message was routed to a dead-letter queue or dropped.
    MessageDeadLettered {
        /// Queue the message lived on.
        queue: String,
        /// The message's id on that queue.
        id: MessageId,
        /// `EXPIRED`, `MAX_RETRIES`, or `OVERFLOW`.
        reason: &'static str,
        /// Whether a dead-letter copy was enqueued (false = dropped).
        routed: bool,
    },
    /// A queue was created.
    QueueCreated {
        /// The queue.
        queue: String,
    },
    /// A queue was deleted.
    QueueDeleted {
        /// The queue.
        queue: String,
    },
    /// A queue was purged.
    QueuePurged {
        /// The queue.
        queue: String,
        /// Messages removed.
        removed: usize,
    },
}

impl QueueEvent {
    /// The queue this event concerns.
    #[must_use]
    pub fn queue(&self) -> &str {
        match self {
            Self::MessageEnqueued { queue, .. }
            | Self::MessageDelivered { queue, .. }
            | Self::MessageAcknowledged { queue, .. }
            | Self::MessageDeadLettered { queue, .. }
            | Self::QueueCreated { queue }
            | Self::QueueDeleted { queue }
            | Self::QueuePurged { queue, .. } => queue,
        }
    }
}

/// A registered queue listener.
pub type QueueListener = Arc<dyn Fn(&QueueEvent) + Send + Sync>;

/// Per-queue listener table.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: RwLock<AHashMap<String, Vec<QueueListener>>>,
}

impl ListenerRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback for one queue's events.
    pub fn register(&self, queue: &str, listener: QueueListener) {
        self.listeners
            .write()
            .entry(queue.to_owned())
            .or_default()
            .push(listener);
    }

    /// Drops all callbacks for a queue.
    pub fn unregister(&self, queue: &str) {
        self.listeners.write().remove(queue);
    }

    /// Fires an event to the listeners of its queue.
    pub fn emit(&self, event: &QueueEvent) {
        let listeners = self.listeners.read();
        if let Some(registered) = listeners.get(event.queue()) {
            for listener in registered {
                listener(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn listeners_receive_only_their_queue() {
        let registry = ListenerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        registry.register(
            "mine",
            Arc::new(move |_| {
                hits_clone.fetch_add(1, Ordering::Relaxed);
            }),
        );

        registry.emit(&QueueEvent::QueueCreated { queue: "mine".into() });
        registry.emit(&QueueEvent::QueueCreated { queue: "other".into() });
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn unregister_silences_listeners() {
        let registry = ListenerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        registry.register(
            "q",
            Arc::new(move |_| {
                hits_clone.fetch_add(1, Ordering::Relaxed);
            }),
        );
        registry.unregister("q");
        registry.emit(&QueueEvent::QueuePurged { queue: "q".into(), removed: 3 });
        assert_eq!(hits.load(Ordering::Relaxed), 0);
    }
}
