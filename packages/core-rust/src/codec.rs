//! Little-endian binary codec for message and queue-metadata records.
//!
//! The on-disk message record is the header fields in declared order as
//! fixed-width integers, the property map as `{u32 count, {u32 len, bytes} x
//! 2 per entry}`, the status byte, and the payload as `{u32 len, bytes}`.
//! Decoding validates every length against a hard bound before allocating,
//! so a corrupt or truncated record fails cleanly instead of looping or
//! exhausting memory.

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::config::{PersistenceMode, QueueConfig, QueueStats, QueueType};
use crate::error::QueueError;
use crate::message::{Message, MessageHeader};
use crate::types::{DeliveryMode, MessagePriority, MessageStatus, MessageType};

/// Longest queue name accepted by the codec, in bytes.
pub const MAX_NAME_LEN: usize = 1024;
/// Most properties a single message record may carry.
pub const MAX_PROPERTY_COUNT: usize = 10_000;
/// Longest property key or value, in bytes.
pub const MAX_STRING_LEN: usize = 1024 * 1024;
/// Largest payload a single record may carry, in bytes.
pub const MAX_PAYLOAD_LEN: usize = 256 * 1024 * 1024;

/// Decode failure. Converted to [`QueueError::Internal`] at component edges.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The buffer ended before the record did.
    #[error("unexpected end of record while reading {0}")]
    UnexpectedEof(&'static str),
    /// A length field exceeded its validation bound.
    #[error("{field} length {len} exceeds limit {max}")]
    LimitExceeded {
        /// Which field was oversized.
        field: &'static str,
        /// The length found in the record.
        len: usize,
        /// The validation bound.
        max: usize,
    },
    /// An enum byte held an unknown value.
    #[error("unknown {field} discriminant {value}")]
    BadDiscriminant {
        /// Which enum field was malformed.
        field: &'static str,
        /// The byte found in the record.
        value: u8,
    },
}

impl From<CodecError> for QueueError {
    fn from(err: CodecError) -> Self {
        Self::Internal(format!("decode: {err}"))
    }
}

/// Bounds-checked little-endian reader over a byte slice.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize, field: &'static str) -> Result<&'a [u8], CodecError> {
        let end = self
            .pos
            .checked_add(n)
            .ok_or(CodecError::UnexpectedEof(field))?;
        if end > self.buf.len() {
            return Err(CodecError::UnexpectedEof(field));
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, CodecError> {
        Ok(self.take(1, field)?[0])
    }

    fn u32(&mut self, field: &'static str) -> Result<u32, CodecError> {
        let bytes = self.take(4, field)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn u64(&mut self, field: &'static str) -> Result<u64, CodecError> {
        let bytes = self.take(8, field)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(raw))
    }

    fn f64(&mut self, field: &'static str) -> Result<f64, CodecError> {
        Ok(f64::from_bits(self.u64(field)?))
    }

    fn sized_bytes(
        &mut self,
        field: &'static str,
        max: usize,
    ) -> Result<&'a [u8], CodecError> {
        let len = self.u32(field)? as usize;
        if len > max {
            return Err(CodecError::LimitExceeded { field, len, max });
        }
        self.take(len, field)
    }

    fn string(&mut self, field: &'static str, max: usize) -> Result<String, CodecError> {
        let bytes = self.sized_bytes(field, max)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::UnexpectedEof(field))
    }
}

fn put_str(buf: &mut BytesMut, value: &str) {
    buf.put_u32_le(u32::try_from(value.len()).unwrap_or(u32::MAX));
    buf.put_slice(value.as_bytes());
}

// ---------------------------------------------------------------------------
// Message records
// ---------------------------------------------------------------------------

/// Serializes a message into its on-disk record form.
#[must_use]
pub fn encode_message(msg: &Message) -> Bytes {
    let mut buf = BytesMut::with_capacity(64 + msg.payload.len());
    buf.put_u64_le(msg.header.id);
    put_str(&mut buf, &msg.header.queue);
    buf.put_u8(msg.header.message_type.as_u8());
    buf.put_u8(msg.header.priority.as_u8());
    buf.put_u8(msg.header.delivery.as_u8());
    buf.put_u8(msg.header.flags);
    buf.put_u64_le(msg.header.created_ms);
    buf.put_u64_le(msg.header.expire_ms);
    buf.put_u32_le(msg.header.retry_count);
    buf.put_u32_le(msg.header.max_retries);

    buf.put_u32_le(u32::try_from(msg.header.properties.len()).unwrap_or(u32::MAX));
    for (key, value) in &msg.header.properties {
        put_str(&mut buf, key);
        put_str(&mut buf, value);
    }

    buf.put_u8(msg.status.as_u8());
    buf.put_u32_le(u32::try_from(msg.payload.len()).unwrap_or(u32::MAX));
    buf.put_slice(&msg.payload);
    buf.freeze()
}

/// Decodes a message record produced by [`encode_message`].
pub fn decode_message(data: &[u8]) -> Result<Message, CodecError> {
    let mut reader = Reader::new(data);

    let id = reader.u64("id")?;
    let queue = reader.string("queue", MAX_NAME_LEN)?;
    let type_byte = reader.u8("message_type")?;
    let message_type = MessageType::from_u8(type_byte).ok_or(CodecError::BadDiscriminant {
        field: "message_type",
        value: type_byte,
    })?;
    let prio_byte = reader.u8("priority")?;
    let priority = MessagePriority::from_u8(prio_byte).ok_or(CodecError::BadDiscriminant {
        field: "priority",
        value: prio_byte,
    })?;
    let delivery_byte = reader.u8("delivery")?;
    let delivery = DeliveryMode::from_u8(delivery_byte).ok_or(CodecError::BadDiscriminant {
        field: "delivery",
        value: delivery_byte,
    })?;
    let flags = reader.u8("flags")?;
    let created_ms = reader.u64("created_ms")?;
    let expire_ms = reader.u64("expire_ms")?;
    let retry_count = reader.u32("retry_count")?;
    let max_retries = reader.u32("max_retries")?;

    let property_count = reader.u32("property_count")? as usize;
    if property_count > MAX_PROPERTY_COUNT {
        return Err(CodecError::LimitExceeded {
            field: "property_count",
            len: property_count,
            max: MAX_PROPERTY_COUNT,
        });
    }
    let mut properties = BTreeMap::new();
    for _ in 0..property_count {
        let key = reader.string("property_key", MAX_STRING_LEN)?;
        let value = reader.string("property_value", MAX_STRING_LEN)?;
        properties.insert(key, value);
    }

    let status_byte = reader.u8("status")?;
    let status = MessageStatus::from_u8(status_byte).ok_or(CodecError::BadDiscriminant {
        field: "status",
        value: status_byte,
    })?;
    let payload = Bytes::copy_from_slice(reader.sized_bytes("payload", MAX_PAYLOAD_LEN)?);

    Ok(Message {
        header: MessageHeader {
            id,
            queue,
            message_type,
            priority,
            delivery,
            flags,
            created_ms,
            expire_ms,
            retry_count,
            max_retries,
            properties,
        },
        status,
        payload,
    })
}

// ---------------------------------------------------------------------------
// Queue metadata records
// ---------------------------------------------------------------------------

/// Serializes a queue-metadata record: name, configuration, statistics, and
/// the dirty flag.
#[must_use]
pub fn encode_queue_record(config: &QueueConfig, stats: &QueueStats, dirty: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(160 + config.name.len());
    put_str(&mut buf, &config.name);

    buf.put_u8(match config.queue_type {
        QueueType::Standard => 0,
        QueueType::Priority => 1,
    });
    buf.put_u8(match config.persistence {
        PersistenceMode::MemoryOnly => 0,
        PersistenceMode::DiskPersistent => 1,
    });
    buf.put_u64_le(config.max_size);
    buf.put_u64_le(config.max_size_bytes);
    buf.put_u64_le(config.message_ttl_ms);
    buf.put_u64_le(config.visibility_timeout_ms);
    buf.put_u8(u8::from(config.enable_dead_letter));
    put_str(&mut buf, &config.dead_letter_queue);
    buf.put_u32_le(config.max_retries);
    buf.put_u64_le(config.retry_delay_ms);
    buf.put_u8(u8::from(config.enable_retry_backoff));
    buf.put_u64_le(config.retry_backoff_multiplier.to_bits());
    buf.put_u64_le(config.max_retry_delay_ms);
    buf.put_u64_le(config.dead_letter_ttl_ms);
    buf.put_u8(u8::from(config.enable_batching));
    buf.put_u32_le(config.batch_size);

    buf.put_u64_le(stats.total_sent);
    buf.put_u64_le(stats.total_delivered);
    buf.put_u64_le(stats.total_acknowledged);
    buf.put_u64_le(stats.total_retried);
    buf.put_u64_le(stats.total_dead_lettered);
    buf.put_u64_le(stats.total_dropped);
    buf.put_u64_le(stats.pending_count);
    buf.put_u64_le(stats.pending_bytes);
    buf.put_u64_le(stats.inflight_count);
    buf.put_u64_le(stats.retry_scheduled_count);
    buf.put_u64_le(stats.created_ms);
    buf.put_u64_le(stats.last_enqueue_ms);
    buf.put_u64_le(stats.last_dequeue_ms);

    buf.put_u8(u8::from(dirty));
    buf.freeze()
}

/// Decodes a queue-metadata record produced by [`encode_queue_record`].
pub fn decode_queue_record(data: &[u8]) -> Result<(QueueConfig, QueueStats, bool), CodecError> {
    let mut reader = Reader::new(data);
    read_queue_record(&mut reader)
}

/// Parses concatenated queue-metadata records until the buffer is exhausted.
///
/// Used to load the queue metadata file, which is a plain concatenation of
/// records. Parsing stops at the first malformed record; everything read up
/// to that point is returned along with the error that stopped the scan.
#[must_use]
pub fn decode_queue_records(
    data: &[u8],
) -> (Vec<(QueueConfig, QueueStats, bool)>, Option<CodecError>) {
    let mut reader = Reader::new(data);
    let mut records = Vec::new();
    while reader.pos < data.len() {
        match read_queue_record(&mut reader) {
            Ok(record) => records.push(record),
            Err(err) => return (records, Some(err)),
        }
    }
    (records, None)
}

fn read_queue_record(
    reader: &mut Reader<'_>,
) -> Result<(QueueConfig, QueueStats, bool), CodecError> {
    let name = reader.string("queue_name", MAX_NAME_LEN)?;

    let type_byte = reader.u8("queue_type")?;
    let queue_type = match type_byte {
        0 => QueueType::Standard,
        1 => QueueType::Priority,
        value => {
            return Err(CodecError::BadDiscriminant {
                field: "queue_type",
                value,
            })
        }
    };
    let persistence_byte = reader.u8("persistence")?;
    let persistence = match persistence_byte {
        0 => PersistenceMode::MemoryOnly,
        1 => PersistenceMode::DiskPersistent,
        value => {
            return Err(CodecError::BadDiscriminant {
                field: "persistence",
                value,
            })
        }
    };

    let config = QueueConfig {
        name,
        queue_type,
        persistence,
        max_size: reader.u64("max_size")?,
        max_size_bytes: reader.u64("max_size_bytes")?,
        message_ttl_ms: reader.u64("message_ttl_ms")?,
        visibility_timeout_ms: reader.u64("visibility_timeout_ms")?,
        enable_dead_letter: reader.u8("enable_dead_letter")? != 0,
        dead_letter_queue: reader.string("dead_letter_queue", MAX_NAME_LEN)?,
        max_retries: reader.u32("max_retries")?,
        retry_delay_ms: reader.u64("retry_delay_ms")?,
        enable_retry_backoff: reader.u8("enable_retry_backoff")? != 0,
        retry_backoff_multiplier: reader.f64("retry_backoff_multiplier")?,
        max_retry_delay_ms: reader.u64("max_retry_delay_ms")?,
        dead_letter_ttl_ms: reader.u64("dead_letter_ttl_ms")?,
        enable_batching: reader.u8("enable_batching")? != 0,
        batch_size: reader.u32("batch_size")?,
    };

    let stats = QueueStats {
        total_sent: reader.u64("total_sent")?,
        total_delivered: reader.u64("total_delivered")?,
        total_acknowledged: reader.u64("total_acknowledged")?,
        total_retried: reader.u64("total_retried")?,
        total_dead_lettered: reader.u64("total_dead_lettered")?,
        total_dropped: reader.u64("total_dropped")?,
        pending_count: reader.u64("pending_count")?,
        pending_bytes: reader.u64("pending_bytes")?,
        inflight_count: reader.u64("inflight_count")?,
        retry_scheduled_count: reader.u64("retry_scheduled_count")?,
        created_ms: reader.u64("created_ms")?,
        last_enqueue_ms: reader.u64("last_enqueue_ms")?,
        last_dequeue_ms: reader.u64("last_dequeue_ms")?,
    };

    let dirty = reader.u8("dirty")? != 0;
    Ok((config, stats, dirty))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::message::{properties, FLAG_COMPRESSED};
    use crate::types::INVALID_MESSAGE_ID;

    fn sample_message() -> Message {
        let mut msg = Message::new(MessageType::Json, Bytes::from_static(b"{\"k\":1}"))
            .with_priority(MessagePriority::High)
            .with_delivery(DeliveryMode::ExactlyOnce)
            .with_expiry(9_999_999)
            .with_property(properties::IDEMPOTENCY_KEY, "abc-123")
            .with_property("tenant", "blue");
        msg.header.id = 77;
        msg.header.queue = "orders".into();
        msg.header.retry_count = 2;
        msg.header.max_retries = 5;
        msg.set_flag(FLAG_COMPRESSED, true);
        msg.status = MessageStatus::Inflight;
        msg
    }

    #[test]
    fn message_round_trip_is_identity() {
        let msg = sample_message();
        let encoded = encode_message(&msg);
        let decoded = decode_message(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn zero_length_payload_round_trips() {
        let mut msg = Message::new(MessageType::Binary, Bytes::new());
        msg.header.queue = "q".into();
        let decoded = decode_message(&encode_message(&msg)).unwrap();
        assert!(decoded.payload.is_empty());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn truncated_record_fails_without_panic() {
        let encoded = encode_message(&sample_message());
        for cut in [0, 1, 8, 12, encoded.len() - 1] {
            let err = decode_message(&encoded[..cut]).unwrap_err();
            assert!(matches!(err, CodecError::UnexpectedEof(_)), "cut at {cut}");
        }
    }

    #[test]
    fn oversized_property_count_rejected() {
        // Header for an otherwise-valid record claiming u32::MAX properties.
        let mut msg = Message::text("x");
        msg.header.queue = "q".into();
        let encoded = encode_message(&msg);
        let mut raw = encoded.to_vec();
        // Property count sits right after the fixed header fields:
        // 8 id + 4+1 queue + 4 enum/flag bytes + 8 + 8 + 4 + 4.
        let count_at = 8 + 4 + 1 + 4 + 8 + 8 + 4 + 4;
        raw[count_at..count_at + 4].copy_from_slice(&u32::MAX.to_le_bytes());
        let err = decode_message(&raw).unwrap_err();
        assert!(matches!(
            err,
            CodecError::LimitExceeded {
                field: "property_count",
                ..
            }
        ));
    }

    #[test]
    fn bad_status_discriminant_rejected() {
        let encoded = encode_message(&sample_message());
        let mut raw = encoded.to_vec();
        // Status byte precedes the 4-byte payload length and payload bytes.
        let payload_len = 7;
        let status_at = raw.len() - payload_len - 4 - 1;
        raw[status_at] = 250;
        let err = decode_message(&raw).unwrap_err();
        assert!(matches!(
            err,
            CodecError::BadDiscriminant { field: "status", .. }
        ));
    }

    #[test]
    fn queue_record_round_trip_is_identity() {
        let mut config = QueueConfig::named("billing");
        config.queue_type = QueueType::Priority;
        config.persistence = PersistenceMode::DiskPersistent;
        config.enable_dead_letter = true;
        config.dead_letter_queue = "billing.dead".into();
        config.retry_backoff_multiplier = 1.75;
        let stats = QueueStats {
            total_sent: 10,
            total_delivered: 8,
            total_acknowledged: 7,
            pending_count: 2,
            pending_bytes: 2_048,
            created_ms: 1_700_000_000_000,
            ..QueueStats::default()
        };

        let encoded = encode_queue_record(&config, &stats, true);
        let (decoded_config, decoded_stats, dirty) = decode_queue_record(&encoded).unwrap();
        assert_eq!(decoded_config, config);
        assert_eq!(decoded_stats, stats);
        assert!(dirty);
    }

    #[test]
    fn concatenated_queue_records_parse_sequentially() {
        let a = QueueConfig::named("alpha");
        let b = QueueConfig::named("beta");
        let stats = QueueStats::default();
        let mut data = encode_queue_record(&a, &stats, false).to_vec();
        data.extend_from_slice(&encode_queue_record(&b, &stats, true));

        let (records, err) = decode_queue_records(&data);
        assert!(err.is_none());
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].0.name, "alpha");
        assert_eq!(records[1].0.name, "beta");
        assert!(records[1].2);
    }

    #[test]
    fn truncated_queue_record_tail_keeps_parsed_prefix() {
        let a = QueueConfig::named("alpha");
        let stats = QueueStats::default();
        let mut data = encode_queue_record(&a, &stats, false).to_vec();
        data.extend_from_slice(&[9, 0, 0]); // garbage tail, too short for a record

        let (records, err) = decode_queue_records(&data);
        assert_eq!(records.len(), 1);
        assert!(err.is_some());
    }

    proptest! {
        #[test]
        fn arbitrary_messages_round_trip(
            id in any::<u64>(),
            queue in "[a-z]{1,16}",
            payload in proptest::collection::vec(any::<u8>(), 0..512),
            created in any::<u64>(),
            expire in any::<u64>(),
            retries in any::<u32>(),
            props in proptest::collection::btree_map("[a-z]{1,8}", "[a-z0-9]{0,16}", 0..8),
        ) {
            let msg = Message {
                header: MessageHeader {
                    id,
                    queue,
                    message_type: MessageType::Binary,
                    priority: MessagePriority::Low,
                    delivery: DeliveryMode::AtLeastOnce,
                    flags: 0,
                    created_ms: created,
                    expire_ms: expire,
                    retry_count: retries,
                    max_retries: retries.wrapping_add(1),
                    properties: props,
                },
                status: MessageStatus::Pending,
                payload: Bytes::from(payload),
            };
            let decoded = decode_message(&encode_message(&msg)).unwrap();
            prop_assert_eq!(decoded, msg);
        }

        #[test]
        fn decode_never_panics_on_noise(data in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = decode_message(&data);
        }
    }

    #[test]
    fn unassigned_id_encodes() {
        let mut msg = Message::text("x");
        msg.header.queue = "q".into();
        assert_eq!(msg.header.id, INVALID_MESSAGE_ID);
        let decoded = decode_message(&encode_message(&msg)).unwrap();
        assert_eq!(decoded.header.id, INVALID_MESSAGE_ID);
    }
}
