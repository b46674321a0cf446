//! The message model: header, payload, user properties, and the well-known
//! property keys the engine stamps during dead-lettering and transactions.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::types::{
    now_millis, DeliveryMode, MessageId, MessagePriority, MessageStatus, MessageType,
    INVALID_MESSAGE_ID,
};

/// Well-known property keys stamped by the engine.
///
/// User code may read these; the engine owns writing them.
pub mod properties {
    /// Why a message was dead-lettered: `EXPIRED`, `MAX_RETRIES`, `OVERFLOW`.
    pub const DEAD_LETTER_REASON: &str = "dl.reason";
    /// Queue the message lived on before dead-lettering.
    pub const DEAD_LETTER_ORIGIN_QUEUE: &str = "dl.origin-queue";
    /// Message id on the origin queue.
    pub const DEAD_LETTER_ORIGIN_ID: &str = "dl.origin-id";
    /// Creation timestamp (ms) of the original message.
    pub const DEAD_LETTER_ORIGIN_TIMESTAMP: &str = "dl.origin-timestamp";
    /// Two-phase transaction marker: `false` while staged, `true` once
    /// the owning transaction committed.
    pub const TRANSACTION_COMMITTED: &str = "tx.committed";
    /// Id of the transaction that produced the message.
    pub const TRANSACTION_ID: &str = "tx.id";
    /// Producer-supplied idempotency key for exactly-once hints.
    pub const IDEMPOTENCY_KEY: &str = "idempotency-key";
    /// Compression algorithm applied to the payload.
    pub const COMPRESSION_ALGORITHM: &str = "codec.compression";
    /// Payload size before compression, decimal string.
    pub const COMPRESSION_ORIGINAL_SIZE: &str = "codec.original-size";
    /// Encryption algorithm applied to the payload.
    pub const ENCRYPTION_ALGORITHM: &str = "codec.encryption";
}

/// Header flag bit: payload is compressed.
pub const FLAG_COMPRESSED: u8 = 0b0000_0001;
/// Header flag bit: payload is encrypted.
pub const FLAG_ENCRYPTED: u8 = 0b0000_0010;

/// Fixed metadata carried by every message.
///
/// Serialized field-by-field in declared order by the binary codec; adding a
/// field here is a format change. The `queue` reference makes index rebuilds
/// possible from the message log alone.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessageHeader {
    /// Process-wide unique id, assigned at send time.
    pub id: MessageId,
    /// Name of the owning queue.
    pub queue: String,
    /// Payload classification.
    pub message_type: MessageType,
    /// Delivery priority.
    pub priority: MessagePriority,
    /// Reliability contract.
    pub delivery: DeliveryMode,
    /// Bit set of `FLAG_*` values.
    pub flags: u8,
    /// Creation wall-clock time, ms since epoch.
    pub created_ms: u64,
    /// Absolute expiry time, ms since epoch. 0 = never expires.
    pub expire_ms: u64,
    /// Times this message has been negatively acknowledged or timed out.
    pub retry_count: u32,
    /// Retry budget before dead-lettering. 0 = use the queue's configured max.
    pub max_retries: u32,
    /// User properties. Ordered map so serialization is deterministic.
    pub properties: BTreeMap<String, String>,
}

/// A message owned by exactly one queue at a time.
///
/// The payload is a refcounted [`Bytes`] buffer, so cloning a message for
/// delivery shares the payload bytes rather than copying them.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    /// Fixed metadata.
    pub header: MessageHeader,
    /// Current lifecycle state.
    pub status: MessageStatus,
    /// Payload bytes.
    pub payload: Bytes,
}

impl Message {
    /// Creates a pending message of the given type with the given payload.
    ///
    /// The id stays [`INVALID_MESSAGE_ID`] until the queue store assigns one
    /// at send time.
    #[must_use]
    pub fn new(message_type: MessageType, payload: impl Into<Bytes>) -> Self {
        Self {
            header: MessageHeader {
                id: INVALID_MESSAGE_ID,
                message_type,
                created_ms: now_millis(),
                ..MessageHeader::default()
            },
            status: MessageStatus::Pending,
            payload: payload.into(),
        }
    }

    /// Creates a text message from a string payload.
    #[must_use]
    pub fn text(payload: impl Into<String>) -> Self {
        Self::new(MessageType::Text, Bytes::from(payload.into()))
    }

    /// Sets the delivery priority, builder style.
    #[must_use]
    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.header.priority = priority;
        self
    }

    /// Sets the delivery mode, builder style.
    #[must_use]
    pub fn with_delivery(mut self, delivery: DeliveryMode) -> Self {
        self.header.delivery = delivery;
        self
    }

    /// Sets an absolute expiry time (ms since epoch), builder style.
    #[must_use]
    pub fn with_expiry(mut self, expire_ms: u64) -> Self {
        self.header.expire_ms = expire_ms;
        self
    }

    /// Sets a user property, builder style.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.header.properties.insert(key.into(), value.into());
        self
    }

    /// Returns a user property value if present.
    #[must_use]
    pub fn property(&self, key: &str) -> Option<&str> {
        self.header.properties.get(key).map(String::as_str)
    }

    /// Inserts or replaces a user property.
    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.header.properties.insert(key.into(), value.into());
    }

    /// Whether the given header flag bit is set.
    #[must_use]
    pub fn has_flag(&self, flag: u8) -> bool {
        self.header.flags & flag != 0
    }

    /// Sets or clears a header flag bit.
    pub fn set_flag(&mut self, flag: u8, on: bool) {
        if on {
            self.header.flags |= flag;
        } else {
            self.header.flags &= !flag;
        }
    }

    /// Whether the message's expiry time has passed as of `now_ms`.
    ///
    /// A zero expiry means the message never expires.
    #[must_use]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.header.expire_ms != 0 && now_ms > self.header.expire_ms
    }

    /// Estimated in-memory footprint: payload plus header strings.
    ///
    /// Used for queue byte-capacity accounting; intentionally cheap rather
    /// than exact.
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        let props: usize = self
            .header
            .properties
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum();
        (self.payload.len() + self.header.queue.len() + props) as u64
    }

    /// Resets the message to a blank pending state for object-pool reuse.
    pub fn reset(&mut self) {
        self.header = MessageHeader::default();
        self.status = MessageStatus::Pending;
        self.payload = Bytes::new();
    }
}
