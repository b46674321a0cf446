//! Configuration types: per-queue behavior, compression and encryption
//! options, performance-substrate tuning, and live queue statistics.

use serde::{Deserialize, Serialize};

use crate::error::{QueueError, QueueResult};

/// Ordering discipline of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueType {
    /// Strict FIFO in send order.
    #[default]
    Standard,
    /// Higher priority first; ties break by ascending message id.
    Priority,
}

/// Durability discipline of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PersistenceMode {
    /// Messages live only in memory and are lost on restart.
    #[default]
    MemoryOnly,
    /// Messages are appended to the durable log before acceptance.
    DiskPersistent,
}

/// Per-queue configuration. All durations are milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueConfig {
    /// Unique queue name. Must be non-empty.
    pub name: String,
    /// Ordering discipline.
    pub queue_type: QueueType,
    /// Durability discipline.
    pub persistence: PersistenceMode,
    /// Maximum messages the queue may hold (pending + inflight +
    /// retry-scheduled). 0 = unlimited.
    pub max_size: u64,
    /// Maximum total payload bytes the queue may hold. 0 = unlimited.
    pub max_size_bytes: u64,
    /// Default message time-to-live. 0 = never expires.
    pub message_ttl_ms: u64,
    /// How long a delivered message stays inflight before it is treated as
    /// negatively acknowledged. 0 = fall back to `message_ttl_ms`, or
    /// 30 000 ms if that is also 0.
    pub visibility_timeout_ms: u64,
    /// Whether expired / exhausted / overflowing messages are routed to the
    /// dead-letter queue instead of being dropped.
    pub enable_dead_letter: bool,
    /// Name of the dead-letter target queue.
    pub dead_letter_queue: String,
    /// Retry budget before a message is dead-lettered or dropped.
    pub max_retries: u32,
    /// Base delay before a retried message becomes deliverable again.
    pub retry_delay_ms: u64,
    /// Whether retry delays grow exponentially.
    pub enable_retry_backoff: bool,
    /// Multiplier applied per retry when backoff is enabled.
    pub retry_backoff_multiplier: f64,
    /// Upper bound on the backoff delay.
    pub max_retry_delay_ms: u64,
    /// Time-to-live stamped onto messages this queue routes to its
    /// dead-letter target. 0 = dead letters never expire.
    pub dead_letter_ttl_ms: u64,
    /// Whether the manager may auto-flush bound batches to this queue.
    pub enable_batching: bool,
    /// Preferred batch size for aggregated sends.
    pub batch_size: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            queue_type: QueueType::Standard,
            persistence: PersistenceMode::MemoryOnly,
            max_size: 10_000,
            max_size_bytes: 0,
            message_ttl_ms: 0,
            visibility_timeout_ms: 0,
            enable_dead_letter: false,
            dead_letter_queue: String::new(),
            max_retries: 3,
            retry_delay_ms: 1_000,
            enable_retry_backoff: false,
            retry_backoff_multiplier: 2.0,
            max_retry_delay_ms: 60_000,
            dead_letter_ttl_ms: 0,
            enable_batching: false,
            batch_size: 100,
        }
    }
}

impl QueueConfig {
    /// Fallback visibility timeout when neither the visibility timeout nor
    /// the message TTL is configured.
    pub const DEFAULT_VISIBILITY_TIMEOUT_MS: u64 = 30_000;

    /// Creates a configuration with the given name and defaults otherwise.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// The visibility timeout actually applied to deliveries.
    #[must_use]
    pub fn effective_visibility_timeout_ms(&self) -> u64 {
        if self.visibility_timeout_ms != 0 {
            self.visibility_timeout_ms
        } else if self.message_ttl_ms != 0 {
            self.message_ttl_ms
        } else {
            Self::DEFAULT_VISIBILITY_TIMEOUT_MS
        }
    }

    /// Validates caller-supplied configuration before queue creation.
    pub fn validate(&self) -> QueueResult<()> {
        if self.name.is_empty() {
            return Err(QueueError::InvalidParameter("queue name is empty".into()));
        }
        if self.enable_dead_letter && self.dead_letter_queue.is_empty() {
            return Err(QueueError::InvalidParameter(
                "dead-letter enabled without a target queue".into(),
            ));
        }
        if self.enable_dead_letter && self.dead_letter_queue == self.name {
            return Err(QueueError::InvalidParameter(
                "queue cannot be its own dead-letter target".into(),
            ));
        }
        if self.enable_retry_backoff && self.retry_backoff_multiplier < 1.0 {
            return Err(QueueError::InvalidParameter(
                "retry backoff multiplier must be >= 1.0".into(),
            ));
        }
        Ok(())
    }

    /// Serializes the configuration to a JSON string.
    pub fn export_to_json(&self) -> QueueResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| QueueError::Internal(format!("config to json: {e}")))
    }

    /// Parses a configuration previously produced by [`export_to_json`].
    ///
    /// [`export_to_json`]: QueueConfig::export_to_json
    pub fn parse_json(json: &str) -> QueueResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| QueueError::InvalidParameter(format!("config from json: {e}")))
    }
}

/// Live counters for a queue. Persisted alongside the configuration so
/// totals survive restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueStats {
    /// Messages accepted by `send` since creation.
    pub total_sent: u64,
    /// Messages handed to consumers since creation.
    pub total_delivered: u64,
    /// Messages acknowledged since creation.
    pub total_acknowledged: u64,
    /// Negative acknowledgements and visibility timeouts since creation.
    pub total_retried: u64,
    /// Messages routed to the dead-letter target since creation.
    pub total_dead_lettered: u64,
    /// Messages dropped (expired or exhausted with no dead-letter target).
    pub total_dropped: u64,
    /// Messages currently awaiting delivery.
    pub pending_count: u64,
    /// Total payload bytes currently awaiting delivery.
    pub pending_bytes: u64,
    /// Messages currently delivered but unacknowledged.
    pub inflight_count: u64,
    /// Messages currently waiting out a retry delay.
    pub retry_scheduled_count: u64,
    /// Wall-clock ms of queue creation.
    pub created_ms: u64,
    /// Wall-clock ms of the most recent successful send.
    pub last_enqueue_ms: u64,
    /// Wall-clock ms of the most recent delivery.
    pub last_dequeue_ms: u64,
}

impl QueueStats {
    /// Messages the queue currently owns in any live state.
    #[must_use]
    pub fn current_count(&self) -> u64 {
        self.pending_count + self.inflight_count + self.retry_scheduled_count
    }
}

/// Supported payload compression algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompressionAlgorithm {
    /// No compression.
    #[default]
    None,
    /// DEFLATE with gzip framing.
    Gzip,
    /// LZ4 block format.
    Lz4,
    /// Zstandard.
    Zstd,
    /// Snappy raw format.
    Snappy,
}

/// Per-queue compression options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompressionConfig {
    /// Algorithm applied to qualifying payloads.
    pub algorithm: CompressionAlgorithm,
    /// Effort level, 1 (fastest) to 9 (smallest). Ignored by LZ4/Snappy.
    pub level: u32,
    /// Only compress payloads at least this large, in bytes.
    pub min_size: usize,
    /// Whether the manager compresses qualifying payloads automatically.
    pub enable_auto_compression: bool,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            algorithm: CompressionAlgorithm::None,
            level: 6,
            min_size: 1024,
            enable_auto_compression: false,
        }
    }
}

/// Supported payload encryption algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EncryptionAlgorithm {
    /// No encryption.
    #[default]
    None,
    /// AES-256 in GCM mode; authentication tag appended to the ciphertext.
    Aes256Gcm,
    /// AES-256 in CTR mode; no authentication.
    Aes256Ctr,
    /// ChaCha20-Poly1305; authentication tag appended to the ciphertext.
    ChaCha20Poly1305,
}

/// Per-queue encryption options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct EncryptionConfig {
    /// Algorithm applied to payloads.
    pub algorithm: EncryptionAlgorithm,
    /// Symmetric key. Must be 32 bytes for the supported algorithms.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub key: Vec<u8>,
    /// Base nonce / IV. Mixed with the message id so nonces are unique
    /// per message. 12 bytes for GCM/ChaCha, 16 for CTR.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub iv: Vec<u8>,
    /// Whether the manager encrypts payloads automatically.
    pub enable_auto_encryption: bool,
}

/// Tuning for the performance substrate: pools, batching, zero-copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PerformanceConfig {
    /// Bytes preallocated into the fixed-block buffer pool.
    pub memory_pool_bytes: usize,
    /// Size of each pooled block.
    pub block_size: usize,
    /// Hard cap on outstanding pool-tracked bytes; allocations beyond this
    /// fail with `OUT_OF_MEMORY`.
    pub max_pool_bytes: usize,
    /// Whether the buffer pool is used at all.
    pub enable_memory_pool: bool,
    /// Message objects kept warm in the object pool.
    pub message_pool_size: usize,
    /// Hard cap on pooled message objects; recycles beyond this are dropped.
    pub message_pool_max_size: usize,
    /// Whether the message object pool is used.
    pub enable_message_pool: bool,
    /// Message objects constructed eagerly at startup.
    pub preallocated_messages: usize,
    /// Messages per aggregated batch before the manager flushes it.
    pub batch_size: u32,
    /// Age at which a bound, non-empty batch is auto-flushed.
    pub batch_timeout_ms: u64,
    /// Whether batch aggregation and auto-flush are enabled.
    pub enable_batching: bool,
    /// Payloads at least this large use zero-copy buffers.
    pub zero_copy_threshold: usize,
    /// Whether zero-copy buffers are handed out.
    pub enable_zero_copy: bool,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            memory_pool_bytes: 64 * 1024 * 1024,
            block_size: 4096,
            max_pool_bytes: 512 * 1024 * 1024,
            enable_memory_pool: true,
            message_pool_size: 10_000,
            message_pool_max_size: 100_000,
            enable_message_pool: true,
            preallocated_messages: 1_000,
            batch_size: 100,
            batch_timeout_ms: 100,
            enable_batching: true,
            zero_copy_threshold: 1024,
            enable_zero_copy: true,
        }
    }
}
