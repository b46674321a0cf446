//! Performance substrate: allocation amortization for the engine's hot
//! paths.
//!
//! Bundles the three pools the engine leans on:
//!
//! - [`MemoryPool`]: fixed-block buffer pool for I/O scratch space
//! - [`MessagePool`]: recycled message objects
//! - [`BatchAggregator`]: client-assembled message batches
//!
//! plus [`ZeroCopyBuffer`] construction. Every operation is safe for
//! concurrent callers; each pool has its own lock.

mod batch;
mod memory_pool;
mod message_pool;
mod zero_copy;

pub use batch::{
    AbortOutcome, BatchAggregator, BatchId, BatchInfo, BatchState, CommitOutcome,
};
pub use memory_pool::{MemoryPool, MemoryPoolStats, PooledBuf};
pub use message_pool::{MessagePool, MessagePoolStats};
pub use zero_copy::ZeroCopyBuffer;

use std::sync::Arc;

use bytes::Bytes;
use quiver_core::{Message, MessageType, PerformanceConfig, QueueError, QueueResult};

/// Combined point-in-time counters for the substrate.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubstrateStats {
    /// Buffer pool counters.
    pub memory: MemoryPoolStats,
    /// Message object pool counters.
    pub messages: MessagePoolStats,
    /// Open batches.
    pub open_batches: usize,
}

/// The performance substrate owned by a queue manager.
pub struct PerformanceSubstrate {
    config: PerformanceConfig,
    memory: Arc<MemoryPool>,
    messages: MessagePool,
    batches: BatchAggregator,
}

impl PerformanceSubstrate {
    /// Builds the substrate from its tuning configuration.
    #[must_use]
    pub fn new(config: PerformanceConfig) -> Self {
        let memory = Arc::new(MemoryPool::new(
            config.block_size,
            if config.enable_memory_pool {
                config.memory_pool_bytes
            } else {
                0
            },
            config.max_pool_bytes,
        ));
        let messages = MessagePool::new(
            if config.enable_message_pool {
                config.preallocated_messages
            } else {
                0
            },
            config.message_pool_max_size,
        );
        Self {
            config,
            memory,
            messages,
            batches: BatchAggregator::new(),
        }
    }

    /// The tuning configuration the substrate was built with.
    #[must_use]
    pub fn config(&self) -> &PerformanceConfig {
        &self.config
    }

    /// Shared handle to the buffer pool, for components that read through it.
    #[must_use]
    pub fn memory_pool(&self) -> Arc<MemoryPool> {
        Arc::clone(&self.memory)
    }

    /// Leases a scratch buffer. See [`MemoryPool::allocate`].
    pub fn allocate(&self, size: usize) -> QueueResult<PooledBuf> {
        self.memory.allocate(size)
    }

    /// Returns a scratch buffer. See [`MemoryPool::deallocate`].
    pub fn deallocate(&self, buf: PooledBuf) {
        self.memory.deallocate(buf);
    }

    /// Returns a reset message from the object pool.
    #[must_use]
    pub fn create_message(&self, message_type: MessageType, payload: impl Into<Bytes>) -> Box<Message> {
        self.messages.create(message_type, payload)
    }

    /// Returns a message to the object pool.
    pub fn recycle_message(&self, msg: Box<Message>) {
        self.messages.recycle(msg);
    }

    /// Creates a shared payload buffer, taking ownership of the bytes.
    pub fn create_zero_copy_owned(&self, data: impl Into<Bytes>) -> QueueResult<ZeroCopyBuffer> {
        let data = data.into();
        self.check_zero_copy_cap(data.len())?;
        Ok(ZeroCopyBuffer::from_owned(data))
    }

    /// Creates a shared payload buffer by copying the bytes once.
    pub fn create_zero_copy(&self, data: &[u8]) -> QueueResult<ZeroCopyBuffer> {
        self.check_zero_copy_cap(data.len())?;
        Ok(ZeroCopyBuffer::copied(data))
    }

    /// Releases one owner's reference to a shared buffer. The storage is
    /// freed once every owner (handles and payloads) has released.
    pub fn release_zero_copy(&self, buffer: ZeroCopyBuffer) {
        drop(buffer);
    }

    /// Builds a message whose payload shares a zero-copy buffer's storage.
    #[must_use]
    pub fn create_message_from_zero_copy(
        &self,
        message_type: MessageType,
        buffer: &ZeroCopyBuffer,
    ) -> Box<Message> {
        self.messages.create(message_type, buffer.payload())
    }

    /// Whether a payload of `len` bytes qualifies for the zero-copy path.
    #[must_use]
    pub fn wants_zero_copy(&self, len: usize) -> bool {
        self.config.enable_zero_copy && len >= self.config.zero_copy_threshold
    }

    /// Batch table access.
    #[must_use]
    pub fn batches(&self) -> &BatchAggregator {
        &self.batches
    }

    /// Combined counters across the pools.
    #[must_use]
    pub fn stats(&self) -> SubstrateStats {
        SubstrateStats {
            memory: self.memory.stats(),
            messages: self.messages.stats(),
            open_batches: self.batches.open_count(),
        }
    }

    fn check_zero_copy_cap(&self, len: usize) -> QueueResult<()> {
        let cap = self.config.max_pool_bytes;
        if cap != 0 && len > cap {
            return Err(QueueError::OutOfMemory(format!(
                "zero-copy buffer of {len} bytes exceeds pool cap {cap}"
            )));
        }
        Ok(())
    }
}
