//! Object pool for [`Message`] instances.
//!
//! Message construction is cheap but not free (a header, a property map, a
//! payload handle); on hot producer paths the pool hands back a reset,
//! previously used message instead. The pool is bounded: recycles past
//! `max_size` drop the object.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use quiver_core::{Message, MessageType};

/// Point-in-time counters for the message pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessagePoolStats {
    /// Messages created fresh because the pool was empty.
    pub created: u64,
    /// Messages served from the pool.
    pub reused: u64,
    /// Messages returned to the pool.
    pub recycled: u64,
    /// Messages dropped on return because the pool was full.
    pub dropped: u64,
    /// Messages currently pooled.
    pub pooled: usize,
}

/// Bounded pool of reusable message objects.
pub struct MessagePool {
    pool: Mutex<Vec<Box<Message>>>,
    max_size: usize,
    created: AtomicU64,
    reused: AtomicU64,
    recycled: AtomicU64,
    dropped: AtomicU64,
}

impl MessagePool {
    /// Creates a pool bounded at `max_size`, warmed with `preallocate`
    /// blank messages.
    #[must_use]
    pub fn new(preallocate: usize, max_size: usize) -> Self {
        let warm = preallocate.min(max_size);
        let pool = (0..warm).map(|_| Box::new(Message::default())).collect();
        Self {
            pool: Mutex::new(pool),
            max_size: max_size.max(1),
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            recycled: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Returns a reset message of the given type carrying `payload`.
    #[must_use]
    pub fn create(&self, message_type: MessageType, payload: impl Into<Bytes>) -> Box<Message> {
        let recycled = self.pool.lock().pop();
        let mut msg = if let Some(mut msg) = recycled {
            self.reused.fetch_add(1, Ordering::Relaxed);
            msg.reset();
            msg
        } else {
            self.created.fetch_add(1, Ordering::Relaxed);
            Box::new(Message::default())
        };
        *msg = Message::new(message_type, payload);
        msg
    }

    /// Returns a message to the pool, or drops it if the pool is full.
    pub fn recycle(&self, mut msg: Box<Message>) {
        msg.reset();
        let mut pool = self.pool.lock();
        if pool.len() < self.max_size {
            pool.push(msg);
            self.recycled.fetch_add(1, Ordering::Relaxed);
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> MessagePoolStats {
        MessagePoolStats {
            created: self.created.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            recycled: self.recycled.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            pooled: self.pool.lock().len(),
        }
    }
}
