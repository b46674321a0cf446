//! The engine facade: one [`QueueManager`] owns the performance substrate,
//! the persistence engine, the queue registry, the transaction
//! coordinator, and the health checker, and exposes the producer /
//! consumer / admin API the host embeds.

mod compression;
mod encryption;

pub use compression::{algorithm_from_name, algorithm_name, compress, decompress};
pub use encryption::{decrypt, encrypt, validate as validate_encryption};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use quiver_core::message::properties;
use quiver_core::types::{now_millis, MessageId, MessageType};
use quiver_core::{
    CompressionAlgorithm, CompressionConfig, EncryptionAlgorithm, EncryptionConfig, Message,
    PerformanceConfig, QueueConfig, QueueError, QueueResult, FLAG_COMPRESSED, FLAG_ENCRYPTED,
};
use tracing::{info, warn};

use crate::events::{ListenerRegistry, QueueListener};
use crate::health::{
    DiskSpaceProbe, HealthCheckConfig, HealthCheckKind, HealthChecker, MemoryPoolProbe,
    PersistenceProbe, QueueDepthProbe,
};
use crate::persistence::{FileStore, MessageStore, PersistenceSettings, PersistenceStatsSnapshot};
use crate::store::{QueueInfo, QueueStore};
use crate::substrate::{BatchId, CommitOutcome, PerformanceSubstrate, ZeroCopyBuffer};
use crate::transaction::{TransactionCoordinator, TransactionId, TransactionStatsSnapshot};
use crate::worker::Worker;

/// Top-level engine configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Persistence settings. `None` runs the whole engine memory-only.
    pub persistence: Option<PersistenceSettings>,
    /// Performance substrate tuning.
    pub performance: PerformanceConfig,
    /// Default transaction timeout when `begin_transaction` passes 0.
    pub default_transaction_timeout_ms: u64,
    /// Interval of the visibility / retry / expiry sweeper.
    pub sweep_interval_ms: u64,
    /// Budget for worker teardown at shutdown.
    pub shutdown_grace_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            persistence: Some(PersistenceSettings::default()),
            performance: PerformanceConfig::default(),
            default_transaction_timeout_ms: 30_000,
            sweep_interval_ms: 100,
            shutdown_grace_ms: 30_000,
        }
    }
}

impl ManagerConfig {
    /// A memory-only engine (tests, caches, ephemeral brokers).
    #[must_use]
    pub fn memory_only() -> Self {
        Self {
            persistence: None,
            ..Self::default()
        }
    }

    /// A disk-backed engine rooted at `data_dir`.
    #[must_use]
    pub fn at(data_dir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            persistence: Some(PersistenceSettings::at(data_dir)),
            ..Self::default()
        }
    }
}

/// The engine facade. Construct with [`QueueManager::new`], call
/// [`initialize`](QueueManager::initialize), use, then
/// [`shutdown`](QueueManager::shutdown) (also run by `Drop`).
///
/// All methods are safe for concurrent callers. Producer and consumer
/// paths hold at most one queue lock at a time.
pub struct QueueManager {
    config: ManagerConfig,
    substrate: Arc<PerformanceSubstrate>,
    store: Option<Arc<dyn MessageStore>>,
    queues: Arc<QueueStore>,
    transactions: Arc<TransactionCoordinator>,
    health: Arc<HealthChecker>,
    events: Arc<ListenerRegistry>,
    compression: Arc<RwLock<AHashMap<String, CompressionConfig>>>,
    encryption: Arc<RwLock<AHashMap<String, EncryptionConfig>>>,
    sweeper: Mutex<Option<Worker>>,
    initialized: AtomicBool,
}

impl QueueManager {
    /// Builds an engine. No files are opened and no threads started until
    /// [`initialize`](QueueManager::initialize).
    #[must_use]
    pub fn new(config: ManagerConfig) -> Self {
        let substrate = Arc::new(PerformanceSubstrate::new(config.performance.clone()));
        let store: Option<Arc<dyn MessageStore>> = config.persistence.as_ref().map(|settings| {
            Arc::new(FileStore::with_pool(settings.clone(), substrate.memory_pool()))
                as Arc<dyn MessageStore>
        });
        let events = Arc::new(ListenerRegistry::new());
        let queues = Arc::new(QueueStore::new(store.clone(), Arc::clone(&events)));
        let transactions = Arc::new(TransactionCoordinator::new(
            Arc::clone(&queues),
            config.default_transaction_timeout_ms,
        ));
        Self {
            substrate,
            store,
            queues,
            transactions,
            health: Arc::new(HealthChecker::new()),
            events,
            compression: Arc::new(RwLock::new(AHashMap::new())),
            encryption: Arc::new(RwLock::new(AHashMap::new())),
            sweeper: Mutex::new(None),
            initialized: AtomicBool::new(false),
            config,
        }
    }

    /// Convenience: build and initialize in one call.
    pub fn open(config: ManagerConfig) -> QueueResult<Self> {
        let manager = Self::new(config);
        manager.initialize()?;
        Ok(manager)
    }

    /// Opens persistence, recovers queues, and starts the background
    /// workers. Idempotent.
    pub fn initialize(&self) -> QueueResult<()> {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("initializing queue manager");
        if let Some(store) = &self.store {
            store.initialize()?;
        }
        self.queues.recover()?;
        self.transactions.start();
        self.start_sweeper();
        self.register_builtin_health_checks();
        self.health.start();
        Ok(())
    }

    /// Stops workers, flushes metadata and the index, closes files.
    /// Idempotent.
    pub fn shutdown(&self) {
        if !self.initialized.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("shutting down queue manager");
        let started = Instant::now();
        if let Some(mut sweeper) = self.sweeper.lock().take() {
            sweeper.shutdown();
        }
        self.transactions.stop();
        self.health.stop();
        self.queues.flush_metadata();
        if let Some(store) = &self.store {
            store.shutdown();
        }
        let elapsed = started.elapsed();
        if elapsed > Duration::from_millis(self.config.shutdown_grace_ms) {
            warn!(?elapsed, grace_ms = self.config.shutdown_grace_ms,
                  "shutdown exceeded its grace period");
        }
    }

    /// Whether [`initialize`](QueueManager::initialize) has completed.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn ensure_initialized(&self) -> QueueResult<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(QueueError::InvalidState("manager not initialized".into()))
        }
    }

    fn start_sweeper(&self) {
        let queues = Arc::clone(&self.queues);
        let substrate = Arc::clone(&self.substrate);
        let compression = Arc::clone(&self.compression);
        let encryption = Arc::clone(&self.encryption);
        let interval = Duration::from_millis(self.config.sweep_interval_ms.max(10));
        let batching = self.config.performance.enable_batching;
        let batch_timeout_ms = self.config.performance.batch_timeout_ms;
        *self.sweeper.lock() = Some(Worker::spawn("quiver-sweeper", move |signal| {
            while !signal.wait(interval) {
                let now = now_millis();
                queues.sweep(now);
                if batching {
                    for id in substrate.batches().due(now, batch_timeout_ms) {
                        // Auto-flush is per-queue opt-in.
                        let wants_flush = substrate
                            .batches()
                            .info(id)
                            .ok()
                            .and_then(|info| info.queue)
                            .and_then(|q| queues.queue_info(&q).ok())
                            .is_some_and(|info| info.config.enable_batching);
                        if !wants_flush {
                            continue;
                        }
                        if let Err(err) = Self::flush_batch(
                            &queues,
                            &substrate,
                            &compression,
                            &encryption,
                            id,
                        ) {
                            warn!(batch = id, error = %err, "batch auto-flush failed");
                        }
                    }
                }
            }
        }));
    }

    // --- Queue administration ---

    /// Creates a queue from the given configuration.
    pub fn create_queue(&self, config: QueueConfig) -> QueueResult<()> {
        self.ensure_initialized()?;
        self.queues.create_queue(config)
    }

    /// Deletes a queue and everything it owns.
    pub fn delete_queue(&self, name: &str) -> QueueResult<()> {
        self.ensure_initialized()?;
        self.compression.write().remove(name);
        self.encryption.write().remove(name);
        self.events.unregister(name);
        self.queues.delete_queue(name)
    }

    /// Removes all messages from a queue. Returns how many were removed.
    pub fn purge_queue(&self, name: &str) -> QueueResult<usize> {
        self.ensure_initialized()?;
        self.queues.purge_queue(name)
    }

    /// Configuration, statistics, and latency quantiles for one queue.
    pub fn get_queue_info(&self, name: &str) -> QueueResult<QueueInfo> {
        self.ensure_initialized()?;
        self.queues.queue_info(name)
    }

    /// Names of all queues.
    #[must_use]
    pub fn list_queues(&self) -> Vec<String> {
        self.queues.list_queues()
    }

    // --- Producer ---

    /// Sends a message, applying the queue's automatic compression and
    /// encryption. Returns the assigned id.
    pub fn send_message(&self, queue: &str, mut message: Message) -> QueueResult<MessageId> {
        self.ensure_initialized()?;
        message.header.id = self.queues.allocate_id();
        Self::apply_outbound(&self.compression, &self.encryption, queue, &mut message)?;
        self.queues.send_message(queue, message)
    }

    /// Sends a payload held in a shared zero-copy buffer.
    pub fn send_message_zero_copy(
        &self,
        queue: &str,
        message_type: MessageType,
        buffer: &ZeroCopyBuffer,
    ) -> QueueResult<MessageId> {
        self.ensure_initialized()?;
        let message = self
            .substrate
            .create_message_from_zero_copy(message_type, buffer);
        self.send_message(queue, *message)
    }

    /// Sends a group of messages with contiguous ids and one persistence
    /// write.
    pub fn send_batch(&self, queue: &str, messages: Vec<Message>) -> QueueResult<Vec<MessageId>> {
        self.ensure_initialized()?;
        Self::send_batch_inner(
            &self.queues,
            &self.compression,
            &self.encryption,
            queue,
            messages,
        )
    }

    fn send_batch_inner(
        queues: &Arc<QueueStore>,
        compression: &Arc<RwLock<AHashMap<String, CompressionConfig>>>,
        encryption: &Arc<RwLock<AHashMap<String, EncryptionConfig>>>,
        queue: &str,
        mut messages: Vec<Message>,
    ) -> QueueResult<Vec<MessageId>> {
        for message in &mut messages {
            message.header.id = queues.allocate_id();
            Self::apply_outbound(compression, encryption, queue, message)?;
        }
        queues.send_batch(queue, messages)
    }

    // --- Consumer ---

    /// Receives the next message, blocking up to `timeout`. Payloads are
    /// decrypted and decompressed transparently.
    pub fn receive_message(&self, queue: &str, timeout: Duration) -> QueueResult<Message> {
        self.receive_message_as(queue, timeout, "consumer")
    }

    /// [`receive_message`](QueueManager::receive_message) with an explicit
    /// consumer tag for the inflight set.
    pub fn receive_message_as(
        &self,
        queue: &str,
        timeout: Duration,
        consumer: &str,
    ) -> QueueResult<Message> {
        self.ensure_initialized()?;
        let mut message = self.queues.receive_message(queue, timeout, consumer)?;
        self.apply_inbound(queue, &mut message)?;
        Ok(message)
    }

    /// Acknowledges a delivered message.
    pub fn ack_message(&self, queue: &str, id: MessageId) -> QueueResult<()> {
        self.ensure_initialized()?;
        self.queues.acknowledge(queue, id)
    }

    /// Negatively acknowledges a delivered message. With `requeue` the
    /// message retries after its backoff; otherwise it dead-letters.
    pub fn nack_message(&self, queue: &str, id: MessageId, requeue: bool) -> QueueResult<()> {
        self.ensure_initialized()?;
        self.queues.negative_acknowledge(queue, id, requeue)
    }

    // --- Transactions ---

    /// Opens a transaction. A zero timeout uses the manager default.
    pub fn begin_transaction(&self, description: &str, timeout_ms: u64) -> QueueResult<TransactionId> {
        self.ensure_initialized()?;
        Ok(self.transactions.begin(description, timeout_ms))
    }

    /// Buffers a send inside a transaction. Compression is applied now;
    /// encryption (which needs the id assigned at commit) is not.
    pub fn send_message_in_transaction(
        &self,
        tx: TransactionId,
        queue: &str,
        mut message: Message,
    ) -> QueueResult<()> {
        self.ensure_initialized()?;
        Self::apply_compression(&self.compression, queue, &mut message)?;
        self.transactions.send_in_transaction(tx, queue, message)
    }

    /// Buffers an acknowledgement inside a transaction.
    pub fn ack_message_in_transaction(
        &self,
        tx: TransactionId,
        queue: &str,
        id: MessageId,
    ) -> QueueResult<()> {
        self.ensure_initialized()?;
        self.transactions.ack_in_transaction(tx, queue, id)
    }

    /// Commits a transaction atomically.
    pub fn commit_transaction(&self, tx: TransactionId) -> QueueResult<()> {
        self.ensure_initialized()?;
        self.transactions.commit(tx)
    }

    /// Rolls a transaction back, discarding its buffered operations.
    pub fn rollback_transaction(&self, tx: TransactionId, reason: &str) -> QueueResult<()> {
        self.ensure_initialized()?;
        self.transactions.rollback(tx, reason)
    }

    /// Aggregate transaction counters.
    #[must_use]
    pub fn get_transaction_stats(&self) -> TransactionStatsSnapshot {
        self.transactions.stats()
    }

    // --- Batches ---

    /// Opens a batch, optionally bound to a queue.
    pub fn create_batch(&self, queue: Option<&str>) -> QueueResult<BatchId> {
        self.ensure_initialized()?;
        Ok(self.substrate.batches().create(queue))
    }

    /// Appends a message to an open batch.
    pub fn add_to_batch(&self, batch: BatchId, message: Message) -> QueueResult<()> {
        self.ensure_initialized()?;
        self.substrate.batches().add(batch, message)
    }

    /// Commits a batch: its messages are delivered to their queue in
    /// insertion order. Idempotent; a repeated commit delivers nothing and
    /// returns an empty id list.
    pub fn commit_batch(&self, batch: BatchId) -> QueueResult<Vec<MessageId>> {
        self.ensure_initialized()?;
        Self::commit_batch_inner(
            &self.queues,
            &self.substrate,
            &self.compression,
            &self.encryption,
            batch,
        )
    }

    fn commit_batch_inner(
        queues: &Arc<QueueStore>,
        substrate: &Arc<PerformanceSubstrate>,
        compression: &Arc<RwLock<AHashMap<String, CompressionConfig>>>,
        encryption: &Arc<RwLock<AHashMap<String, EncryptionConfig>>>,
        batch: BatchId,
    ) -> QueueResult<Vec<MessageId>> {
        match substrate.batches().commit(batch)? {
            CommitOutcome::AlreadyCommitted => Ok(Vec::new()),
            CommitOutcome::Committed { queue, messages } => {
                if messages.is_empty() {
                    return Ok(Vec::new());
                }
                match queue {
                    Some(queue) => Self::send_batch_inner(
                        queues,
                        compression,
                        encryption,
                        &queue,
                        messages,
                    ),
                    None => {
                        // Unbound batch: each message names its own queue.
                        let mut ids = Vec::with_capacity(messages.len());
                        for mut message in messages {
                            let target = message.header.queue.clone();
                            if target.is_empty() {
                                return Err(QueueError::InvalidParameter(
                                    "unbound batch message has no queue".into(),
                                ));
                            }
                            message.header.id = queues.allocate_id();
                            Self::apply_outbound(compression, encryption, &target, &mut message)?;
                            ids.push(queues.send_message(&target, message)?);
                        }
                        Ok(ids)
                    }
                }
            }
        }
    }

    fn flush_batch(
        queues: &Arc<QueueStore>,
        substrate: &Arc<PerformanceSubstrate>,
        compression: &Arc<RwLock<AHashMap<String, CompressionConfig>>>,
        encryption: &Arc<RwLock<AHashMap<String, EncryptionConfig>>>,
        batch: BatchId,
    ) -> QueueResult<()> {
        Self::commit_batch_inner(queues, substrate, compression, encryption, batch).map(|_| ())
    }

    /// Aborts a batch, discarding its messages. Idempotent.
    pub fn abort_batch(&self, batch: BatchId) -> QueueResult<()> {
        self.ensure_initialized()?;
        self.substrate.batches().abort(batch).map(|_| ())
    }

    /// Empties a batch and restores it to the open state.
    pub fn reset_batch(&self, batch: BatchId, queue: Option<&str>) -> QueueResult<()> {
        self.ensure_initialized()?;
        self.substrate.batches().reset(batch, queue)
    }

    // --- Compression and encryption ---

    /// Sets the compression options for a queue.
    pub fn set_compression_config(
        &self,
        queue: &str,
        config: CompressionConfig,
    ) -> QueueResult<()> {
        self.ensure_initialized()?;
        if !self.queues.contains(queue) {
            return Err(QueueError::QueueNotFound(queue.to_owned()));
        }
        self.compression.write().insert(queue.to_owned(), config);
        Ok(())
    }

    /// Sets the encryption options for a queue. Key and IV lengths are
    /// validated here so misconfiguration fails fast.
    pub fn set_encryption_config(&self, queue: &str, config: EncryptionConfig) -> QueueResult<()> {
        self.ensure_initialized()?;
        if !self.queues.contains(queue) {
            return Err(QueueError::QueueNotFound(queue.to_owned()));
        }
        encryption::validate(&config)?;
        self.encryption.write().insert(queue.to_owned(), config);
        Ok(())
    }

    // --- Metrics, events, subsystem access ---

    /// Metrics for one queue (same shape as
    /// [`get_queue_info`](QueueManager::get_queue_info)).
    pub fn get_queue_metrics(&self, queue: &str) -> QueueResult<QueueInfo> {
        self.get_queue_info(queue)
    }

    /// Persistence timing counters. Zeroed counters when the engine runs
    /// memory-only.
    #[must_use]
    pub fn get_persistence_stats(&self) -> PersistenceStatsSnapshot {
        self.store
            .as_ref()
            .map(|s| s.stats())
            .unwrap_or_default()
    }

    /// Zeroes the persistence timing counters.
    pub fn reset_persistence_stats(&self) {
        if let Some(store) = &self.store {
            store.reset_stats();
        }
    }

    /// Registers a callback for one queue's events.
    pub fn register_queue_listener(&self, queue: &str, listener: QueueListener) -> QueueResult<()> {
        self.ensure_initialized()?;
        if !self.queues.contains(queue) {
            return Err(QueueError::QueueNotFound(queue.to_owned()));
        }
        self.events.register(queue, listener);
        Ok(())
    }

    /// The performance substrate (pools, zero-copy buffers, batch table).
    #[must_use]
    pub fn substrate(&self) -> &PerformanceSubstrate {
        &self.substrate
    }

    /// The health checker.
    #[must_use]
    pub fn health(&self) -> Arc<HealthChecker> {
        Arc::clone(&self.health)
    }

    // --- Internal transforms ---

    fn apply_compression(
        compression: &Arc<RwLock<AHashMap<String, CompressionConfig>>>,
        queue: &str,
        message: &mut Message,
    ) -> QueueResult<()> {
        let Some(config) = compression.read().get(queue).cloned() else {
            return Ok(());
        };
        if !config.enable_auto_compression
            || config.algorithm == CompressionAlgorithm::None
            || message.payload.len() < config.min_size
            || message.has_flag(FLAG_COMPRESSED)
        {
            return Ok(());
        }
        let original_size = message.payload.len();
        let compressed = compression::compress(config.algorithm, config.level, &message.payload)?;
        message.set_property(
            properties::COMPRESSION_ALGORITHM,
            compression::algorithm_name(config.algorithm),
        );
        message.set_property(
            properties::COMPRESSION_ORIGINAL_SIZE,
            original_size.to_string(),
        );
        message.set_flag(FLAG_COMPRESSED, true);
        message.payload = Bytes::from(compressed);
        Ok(())
    }

    fn apply_encryption(
        encryption: &Arc<RwLock<AHashMap<String, EncryptionConfig>>>,
        queue: &str,
        message: &mut Message,
    ) -> QueueResult<()> {
        let Some(config) = encryption.read().get(queue).cloned() else {
            return Ok(());
        };
        if !config.enable_auto_encryption
            || config.algorithm == EncryptionAlgorithm::None
            || message.has_flag(FLAG_ENCRYPTED)
        {
            return Ok(());
        }
        let sealed = encryption::encrypt(&config, message.header.id, &message.payload)?;
        message.set_property(
            properties::ENCRYPTION_ALGORITHM,
            encryption::algorithm_name(config.algorithm),
        );
        message.set_flag(FLAG_ENCRYPTED, true);
        message.payload = Bytes::from(sealed);
        Ok(())
    }

    fn apply_outbound(
        compression: &Arc<RwLock<AHashMap<String, CompressionConfig>>>,
        encryption: &Arc<RwLock<AHashMap<String, EncryptionConfig>>>,
        queue: &str,
        message: &mut Message,
    ) -> QueueResult<()> {
        Self::apply_compression(compression, queue, message)?;
        Self::apply_encryption(encryption, queue, message)
    }

    /// Decrypts then decompresses a delivered message in place.
    fn apply_inbound(&self, queue: &str, message: &mut Message) -> QueueResult<()> {
        if message.has_flag(FLAG_ENCRYPTED) {
            let config = self.encryption.read().get(queue).cloned().ok_or_else(|| {
                QueueError::EncryptionFailed(format!("no encryption key configured for {queue}"))
            })?;
            let opened = encryption::decrypt(&config, message.header.id, &message.payload)?;
            message.payload = Bytes::from(opened);
            message.set_flag(FLAG_ENCRYPTED, false);
        }
        if message.has_flag(FLAG_COMPRESSED) {
            let algorithm = message
                .property(properties::COMPRESSION_ALGORITHM)
                .map_or(Ok(CompressionAlgorithm::None), compression::algorithm_from_name)?;
            let original_size = message
                .property(properties::COMPRESSION_ORIGINAL_SIZE)
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            let restored =
                compression::decompress(algorithm, &message.payload, original_size)?;
            message.payload = Bytes::from(restored);
            message.set_flag(FLAG_COMPRESSED, false);
        }
        Ok(())
    }

    fn register_builtin_health_checks(&self) {
        self.health.register(
            HealthCheckConfig::new(HealthCheckKind::Queue),
            Arc::new(QueueDepthProbe::new(Arc::clone(&self.queues))),
        );
        self.health.register(
            HealthCheckConfig::new(HealthCheckKind::Memory),
            Arc::new(MemoryPoolProbe::new(Arc::clone(&self.substrate))),
        );
        if let (Some(store), Some(settings)) = (&self.store, &self.config.persistence) {
            self.health.register(
                HealthCheckConfig::new(HealthCheckKind::Persistence),
                Arc::new(PersistenceProbe::new(Arc::clone(store))),
            );
            self.health.register(
                HealthCheckConfig::new(HealthCheckKind::Disk),
                Arc::new(DiskSpaceProbe::new(settings.data_dir.clone())),
            );
        }
    }
}

impl Drop for QueueManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use quiver_core::{MessagePriority, PersistenceMode};
    use tempfile::TempDir;

    use super::*;

    fn memory_manager() -> QueueManager {
        QueueManager::open(ManagerConfig::memory_only()).unwrap()
    }

    #[test]
    fn initialize_shutdown_idempotent() {
        let manager = memory_manager();
        manager.initialize().unwrap();
        assert!(manager.is_initialized());
        manager.shutdown();
        manager.shutdown();
        assert!(!manager.is_initialized());
    }

    #[test]
    fn uninitialized_manager_rejects_calls() {
        let manager = QueueManager::new(ManagerConfig::memory_only());
        assert!(matches!(
            manager.create_queue(QueueConfig::named("q")),
            Err(QueueError::InvalidState(_))
        ));
    }

    #[test]
    fn send_receive_through_facade() {
        let manager = memory_manager();
        manager.create_queue(QueueConfig::named("q")).unwrap();
        let id = manager.send_message("q", Message::text("hi")).unwrap();
        let msg = manager
            .receive_message("q", Duration::from_millis(200))
            .unwrap();
        assert_eq!(msg.header.id, id);
        manager.ack_message("q", id).unwrap();
    }

    #[test]
    fn auto_compression_is_transparent() {
        let manager = memory_manager();
        manager.create_queue(QueueConfig::named("q")).unwrap();
        manager
            .set_compression_config(
                "q",
                CompressionConfig {
                    algorithm: CompressionAlgorithm::Zstd,
                    min_size: 16,
                    enable_auto_compression: true,
                    ..CompressionConfig::default()
                },
            )
            .unwrap();

        let payload = "squeeze me ".repeat(100);
        manager.send_message("q", Message::text(payload.clone())).unwrap();
        let msg = manager
            .receive_message("q", Duration::from_millis(200))
            .unwrap();
        assert_eq!(msg.payload.as_ref(), payload.as_bytes());
        assert!(!msg.has_flag(FLAG_COMPRESSED));
        // The stored form really was compressed.
        assert_eq!(
            msg.property(properties::COMPRESSION_ALGORITHM),
            Some("ZSTD")
        );
    }

    #[test]
    fn small_payloads_skip_compression() {
        let manager = memory_manager();
        manager.create_queue(QueueConfig::named("q")).unwrap();
        manager
            .set_compression_config(
                "q",
                CompressionConfig {
                    algorithm: CompressionAlgorithm::Gzip,
                    min_size: 1_000,
                    enable_auto_compression: true,
                    ..CompressionConfig::default()
                },
            )
            .unwrap();
        manager.send_message("q", Message::text("tiny")).unwrap();
        let msg = manager
            .receive_message("q", Duration::from_millis(200))
            .unwrap();
        assert_eq!(msg.property(properties::COMPRESSION_ALGORITHM), None);
    }

    #[test]
    fn auto_encryption_is_transparent() {
        let manager = memory_manager();
        manager.create_queue(QueueConfig::named("q")).unwrap();
        manager
            .set_encryption_config(
                "q",
                EncryptionConfig {
                    algorithm: EncryptionAlgorithm::ChaCha20Poly1305,
                    key: vec![7u8; 32],
                    iv: vec![9u8; 12],
                    enable_auto_encryption: true,
                },
            )
            .unwrap();

        manager
            .send_message("q", Message::text("classified"))
            .unwrap();
        let msg = manager
            .receive_message("q", Duration::from_millis(200))
            .unwrap();
        assert_eq!(msg.payload.as_ref(), b"classified");
        assert_eq!(
            msg.property(properties::ENCRYPTION_ALGORITHM),
            Some("CHACHA20_POLY1305")
        );
    }

    #[test]
    fn bad_encryption_config_rejected() {
        let manager = memory_manager();
        manager.create_queue(QueueConfig::named("q")).unwrap();
        let result = manager.set_encryption_config(
            "q",
            EncryptionConfig {
                algorithm: EncryptionAlgorithm::Aes256Gcm,
                key: vec![1; 8],
                iv: vec![2; 12],
                enable_auto_encryption: true,
            },
        );
        assert!(matches!(result, Err(QueueError::InvalidParameter(_))));
    }

    #[test]
    fn zero_copy_send_shares_payload_bytes() {
        let manager = memory_manager();
        manager.create_queue(QueueConfig::named("q")).unwrap();
        let buffer = manager
            .substrate()
            .create_zero_copy_owned(vec![5u8; 4096])
            .unwrap();
        manager
            .send_message_zero_copy("q", MessageType::Binary, &buffer)
            .unwrap();
        let msg = manager
            .receive_message("q", Duration::from_millis(200))
            .unwrap();
        assert_eq!(msg.payload.len(), 4096);
        assert_eq!(msg.payload.as_ptr(), buffer.as_slice().as_ptr());
    }

    #[test]
    fn batch_commit_delivers_in_insertion_order() {
        let manager = memory_manager();
        manager.create_queue(QueueConfig::named("q")).unwrap();
        let batch = manager.create_batch(Some("q")).unwrap();
        for i in 0..5 {
            manager
                .add_to_batch(batch, Message::text(format!("b{i}")))
                .unwrap();
        }
        let ids = manager.commit_batch(batch).unwrap();
        assert_eq!(ids.len(), 5);

        for i in 0..5 {
            let msg = manager
                .receive_message("q", Duration::from_millis(200))
                .unwrap();
            assert_eq!(msg.payload.as_ref(), format!("b{i}").as_bytes());
        }

        // Idempotent: nothing more is delivered.
        assert!(manager.commit_batch(batch).unwrap().is_empty());
        assert!(matches!(
            manager.receive_message("q", Duration::from_millis(40)),
            Err(QueueError::Timeout)
        ));
    }

    #[test]
    fn aged_batches_auto_flush_to_opted_in_queues() {
        let mut config = ManagerConfig::memory_only();
        config.sweep_interval_ms = 20;
        config.performance.batch_timeout_ms = 30;
        let manager = QueueManager::open(config).unwrap();
        manager
            .create_queue(QueueConfig {
                enable_batching: true,
                ..QueueConfig::named("q")
            })
            .unwrap();

        let batch = manager.create_batch(Some("q")).unwrap();
        manager.add_to_batch(batch, Message::text("auto")).unwrap();

        // Never committed explicitly; the sweeper flushes it once aged.
        let msg = manager
            .receive_message("q", Duration::from_millis(2_000))
            .unwrap();
        assert_eq!(msg.payload.as_ref(), b"auto");
    }

    #[test]
    fn batches_on_default_queues_are_not_auto_flushed() {
        let mut config = ManagerConfig::memory_only();
        config.sweep_interval_ms = 20;
        config.performance.batch_timeout_ms = 30;
        let manager = QueueManager::open(config).unwrap();
        manager.create_queue(QueueConfig::named("q")).unwrap();

        let batch = manager.create_batch(Some("q")).unwrap();
        manager.add_to_batch(batch, Message::text("held")).unwrap();
        assert!(matches!(
            manager.receive_message("q", Duration::from_millis(200)),
            Err(QueueError::Timeout)
        ));
        // Still there for an explicit commit.
        assert_eq!(manager.commit_batch(batch).unwrap().len(), 1);
    }

    #[test]
    fn queue_metrics_reflect_traffic() {
        let manager = memory_manager();
        manager
            .create_queue(QueueConfig {
                queue_type: quiver_core::QueueType::Priority,
                ..QueueConfig::named("q")
            })
            .unwrap();
        manager
            .send_message("q", Message::text("a").with_priority(MessagePriority::High))
            .unwrap();
        manager.send_message("q", Message::text("b")).unwrap();

        let info = manager.get_queue_metrics("q").unwrap();
        assert_eq!(info.stats.total_sent, 2);
        assert_eq!(info.stats.pending_count, 2);
    }

    #[test]
    fn persistence_stats_pass_through() {
        let dir = TempDir::new().unwrap();
        let manager = QueueManager::open(ManagerConfig::at(dir.path())).unwrap();
        manager
            .create_queue(QueueConfig {
                persistence: PersistenceMode::DiskPersistent,
                ..QueueConfig::named("q")
            })
            .unwrap();
        manager.send_message("q", Message::text("x")).unwrap();
        assert!(manager.get_persistence_stats().write_count >= 1);
        manager.reset_persistence_stats();
        assert_eq!(manager.get_persistence_stats().write_count, 0);
    }

    #[test]
    fn listener_sees_enqueue_events() {
        use std::sync::atomic::AtomicUsize;
        let manager = memory_manager();
        manager.create_queue(QueueConfig::named("q")).unwrap();
        let enqueued = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&enqueued);
        manager
            .register_queue_listener(
                "q",
                Arc::new(move |event| {
                    if matches!(event, crate::events::QueueEvent::MessageEnqueued { .. }) {
                        counter.fetch_add(1, Ordering::Relaxed);
                    }
                }),
            )
            .unwrap();
        manager.send_message("q", Message::text("x")).unwrap();
        assert_eq!(enqueued.load(Ordering::Relaxed), 1);
    }
}
