//! Scalar types shared across the engine: identifiers, message enums, and
//! time helpers.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Process-wide unique, monotonically increasing message identifier.
///
/// Assigned by the queue store at send time; never reused once assigned.
pub type MessageId = u64;

/// Sentinel for "no id assigned yet".
pub const INVALID_MESSAGE_ID: MessageId = 0;

/// Coarse classification of a message's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum MessageType {
    /// UTF-8 text payload.
    #[default]
    Text,
    /// Opaque binary payload.
    Binary,
    /// JSON document payload.
    Json,
    /// Engine-internal control message.
    Control,
}

impl MessageType {
    /// Stable wire discriminant (little-endian byte in the binary codec).
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Text => 0,
            Self::Binary => 1,
            Self::Json => 2,
            Self::Control => 3,
        }
    }

    /// Decodes a wire discriminant, `None` for unknown values.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Text),
            1 => Some(Self::Binary),
            2 => Some(Self::Json),
            3 => Some(Self::Control),
            _ => None,
        }
    }
}

/// Delivery priority. Higher priorities are delivered first on priority
/// queues; ties break by ascending [`MessageId`] (insertion order).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum MessagePriority {
    /// Delivered after all other priorities.
    Low,
    /// Default priority.
    #[default]
    Normal,
    /// Delivered before normal and low priority messages.
    High,
}

impl MessagePriority {
    /// Stable wire discriminant.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Low => 0,
            Self::Normal => 1,
            Self::High => 2,
        }
    }

    /// Decodes a wire discriminant, `None` for unknown values.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Low),
            1 => Some(Self::Normal),
            2 => Some(Self::High),
            _ => None,
        }
    }
}

/// Reliability contract for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DeliveryMode {
    /// Fire-and-forget: no redelivery after a failed consumer.
    AtMostOnce,
    /// Redelivered until acknowledged (the engine default).
    #[default]
    AtLeastOnce,
    /// Best-effort exactly-once hint; producers supply idempotency keys.
    ExactlyOnce,
}

impl DeliveryMode {
    /// Stable wire discriminant.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::AtMostOnce => 0,
            Self::AtLeastOnce => 1,
            Self::ExactlyOnce => 2,
        }
    }

    /// Decodes a wire discriminant, `None` for unknown values.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::AtMostOnce),
            1 => Some(Self::AtLeastOnce),
            2 => Some(Self::ExactlyOnce),
            _ => None,
        }
    }
}

/// Lifecycle state of a message. A message is in exactly one state at a
/// time; transitions are serialized by the owning queue's lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum MessageStatus {
    /// Enqueued, not yet delivered to any consumer.
    #[default]
    Pending,
    /// Delivered to a consumer, awaiting acknowledgement.
    Inflight,
    /// Acknowledged by a consumer.
    Acked,
    /// Delivery failed; scheduled for retry.
    Failed,
    /// Routed to a dead-letter queue or dropped.
    Dead,
}

impl MessageStatus {
    /// Stable wire discriminant.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Inflight => 1,
            Self::Acked => 2,
            Self::Failed => 3,
            Self::Dead => 4,
        }
    }

    /// Decodes a wire discriminant, `None` for unknown values.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Pending),
            1 => Some(Self::Inflight),
            2 => Some(Self::Acked),
            3 => Some(Self::Failed),
            4 => Some(Self::Dead),
            _ => None,
        }
    }
}

/// Wall-clock milliseconds since the Unix epoch.
///
/// Returns 0 if the system clock reports a time before the epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_discriminants_round_trip() {
        for ty in [
            MessageType::Text,
            MessageType::Binary,
            MessageType::Json,
            MessageType::Control,
        ] {
            assert_eq!(MessageType::from_u8(ty.as_u8()), Some(ty));
        }
        for prio in [
            MessagePriority::Low,
            MessagePriority::Normal,
            MessagePriority::High,
        ] {
            assert_eq!(MessagePriority::from_u8(prio.as_u8()), Some(prio));
        }
        for mode in [
            DeliveryMode::AtMostOnce,
            DeliveryMode::AtLeastOnce,
            DeliveryMode::ExactlyOnce,
        ] {
            assert_eq!(DeliveryMode::from_u8(mode.as_u8()), Some(mode));
        }
        for status in [
            MessageStatus::Pending,
            MessageStatus::Inflight,
            MessageStatus::Acked,
            MessageStatus::Failed,
            MessageStatus::Dead,
        ] {
            assert_eq!(MessageStatus::from_u8(status.as_u8()), Some(status));
        }
    }

    #[test]
    fn unknown_discriminants_rejected() {
        assert_eq!(MessageType::from_u8(99), None);
        assert_eq!(MessagePriority::from_u8(3), None);
        assert_eq!(DeliveryMode::from_u8(255), None);
        assert_eq!(MessageStatus::from_u8(5), None);
    }

    #[test]
    fn priority_ordering_high_beats_normal_beats_low() {
        assert!(MessagePriority::High > MessagePriority::Normal);
        assert!(MessagePriority::Normal > MessagePriority::Low);
    }

    #[test]
    fn now_millis_is_monotonic_enough() {
        let a = now_millis();
        let b = now_millis();
        assert!(b >= a);
        // Sanity: we are well past 2020 (1577836800000 ms).
        assert!(a > 1_577_836_800_000);
    }
}
