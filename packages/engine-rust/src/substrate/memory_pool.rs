//! Fixed-block buffer pool for hot-path allocations.
//!
//! The pool keeps a free list of recycled block buffers of a single
//! configured size. Requests that fit a block reuse a recycled buffer when
//! one is available; oversize requests fall back to a direct allocation.
//! Either way the pool tracks outstanding bytes against a hard cap and
//! refuses allocations beyond it, so a runaway producer fails with
//! `OUT_OF_MEMORY` instead of exhausting the process.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use quiver_core::{QueueError, QueueResult};

/// A buffer leased from the [`MemoryPool`].
///
/// Return it with [`MemoryPool::deallocate`] so block-sized buffers can be
/// recycled. Dropping it without returning is safe; the buffer's bytes are
/// freed but the pool's outstanding accounting is only settled on return,
/// which is what [`MemoryPool::release_untracked`] is for in the rare paths
/// that hand buffer ownership away.
#[derive(Debug)]
pub struct PooledBuf {
    data: Vec<u8>,
    from_pool: bool,
}

impl PooledBuf {
    /// The buffer contents.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Mutable access for fill-in reads.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Requested length of the lease.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the lease is zero-length.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Consumes the lease, taking the underlying buffer.
    #[must_use]
    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

/// Point-in-time counters for the pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryPoolStats {
    /// Allocations served from a recycled block.
    pub pool_hits: u64,
    /// Block-sized allocations that had to allocate fresh.
    pub pool_misses: u64,
    /// Allocations larger than the block size.
    pub oversize_allocations: u64,
    /// Allocations refused because the cap would be exceeded.
    pub refused_allocations: u64,
    /// Blocks currently sitting in the free list.
    pub free_blocks: usize,
    /// Bytes currently leased out.
    pub outstanding_bytes: usize,
    /// The configured hard cap.
    pub max_bytes: usize,
}

struct FreeList {
    blocks: Vec<Vec<u8>>,
    outstanding_bytes: usize,
}

/// Fixed-block buffer pool guarded by a single mutex over the free list.
pub struct MemoryPool {
    block_size: usize,
    max_bytes: usize,
    max_free_blocks: usize,
    free: Mutex<FreeList>,
    pool_hits: AtomicU64,
    pool_misses: AtomicU64,
    oversize_allocations: AtomicU64,
    refused_allocations: AtomicU64,
}

impl MemoryPool {
    /// Creates a pool of `block_size`-byte blocks, preallocating
    /// `preallocate_bytes / block_size` blocks, with a hard cap of
    /// `max_bytes` outstanding.
    #[must_use]
    pub fn new(block_size: usize, preallocate_bytes: usize, max_bytes: usize) -> Self {
        let block_size = block_size.max(64);
        let prealloc_blocks = preallocate_bytes / block_size;
        let blocks = (0..prealloc_blocks).map(|_| vec![0u8; block_size]).collect();
        Self {
            block_size,
            max_bytes,
            max_free_blocks: prealloc_blocks.max(1),
            free: Mutex::new(FreeList {
                blocks,
                outstanding_bytes: 0,
            }),
            pool_hits: AtomicU64::new(0),
            pool_misses: AtomicU64::new(0),
            oversize_allocations: AtomicU64::new(0),
            refused_allocations: AtomicU64::new(0),
        }
    }

    /// The configured block size.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Leases a buffer of exactly `size` bytes (zero-filled).
    ///
    /// Sizes up to the block size are served from the free list when
    /// possible; larger sizes allocate directly. Fails with `OUT_OF_MEMORY`
    /// when the lease would push outstanding bytes past the cap.
    pub fn allocate(&self, size: usize) -> QueueResult<PooledBuf> {
        let charged = self.charged_size(size);
        let mut free = self.free.lock();
        if self.max_bytes != 0 && free.outstanding_bytes.saturating_add(charged) > self.max_bytes {
            self.refused_allocations.fetch_add(1, Ordering::Relaxed);
            return Err(QueueError::OutOfMemory(format!(
                "pool cap {} bytes reached ({} outstanding, {} requested)",
                self.max_bytes, free.outstanding_bytes, size
            )));
        }
        free.outstanding_bytes += charged;

        if size > self.block_size {
            drop(free);
            self.oversize_allocations.fetch_add(1, Ordering::Relaxed);
            return Ok(PooledBuf {
                data: vec![0u8; size],
                from_pool: false,
            });
        }

        let recycled = free.blocks.pop();
        drop(free);
        let mut data = if let Some(block) = recycled {
            self.pool_hits.fetch_add(1, Ordering::Relaxed);
            block
        } else {
            self.pool_misses.fetch_add(1, Ordering::Relaxed);
            vec![0u8; self.block_size]
        };
        data.resize(self.block_size, 0);
        data.truncate(size);
        Ok(PooledBuf {
            data,
            from_pool: true,
        })
    }

    /// Returns a lease to the pool.
    ///
    /// Block-sized buffers go back on the free list (up to the preallocated
    /// high-water mark); oversize buffers are simply freed.
    pub fn deallocate(&self, buf: PooledBuf) {
        let charged = self.charged_size(buf.len());
        let mut free = self.free.lock();
        free.outstanding_bytes = free.outstanding_bytes.saturating_sub(charged);
        if buf.from_pool && free.blocks.len() < self.max_free_blocks {
            let mut data = buf.data;
            data.clear();
            data.resize(self.block_size, 0);
            free.blocks.push(data);
        }
    }

    /// Settles the accounting for a lease whose buffer was handed away with
    /// [`PooledBuf::into_vec`].
    pub fn release_untracked(&self, size: usize) {
        let charged = self.charged_size(size);
        let mut free = self.free.lock();
        free.outstanding_bytes = free.outstanding_bytes.saturating_sub(charged);
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> MemoryPoolStats {
        let free = self.free.lock();
        MemoryPoolStats {
            pool_hits: self.pool_hits.load(Ordering::Relaxed),
            pool_misses: self.pool_misses.load(Ordering::Relaxed),
            oversize_allocations: self.oversize_allocations.load(Ordering::Relaxed),
            refused_allocations: self.refused_allocations.load(Ordering::Relaxed),
            free_blocks: free.blocks.len(),
            outstanding_bytes: free.outstanding_bytes,
            max_bytes: self.max_bytes,
        }
    }

    // Block-sized requests are charged a whole block since that is what the
    // free list will hold on return.
    fn charged_size(&self, size: usize) -> usize {
        if size > self.block_size {
            size
        } else {
            self.block_size
        }
    }
}
