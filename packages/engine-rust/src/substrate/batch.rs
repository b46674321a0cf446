//! Batch aggregation: client-assembled groups of messages committed to a
//! queue as one unit.
//!
//! Finalization is idempotent. Re-committing a committed batch (or
//! re-aborting an aborted one) succeeds without side effects; committing an
//! aborted batch, or vice versa, fails. The finalized-state table lives in
//! the same critical section as the active table so the idempotency check
//! and the state transition are atomic.

use std::sync::atomic::{AtomicU32, Ordering};

use ahash::AHashMap;
use parking_lot::Mutex;
use quiver_core::{now_millis, Message, QueueError, QueueResult};

/// Identifier of a batch, unique within one aggregator.
pub type BatchId = u32;

/// Lifecycle state of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    /// Accepting messages.
    Open,
    /// Finalized; messages were handed to the committer.
    Committed,
    /// Finalized; messages were discarded.
    Aborted,
}

/// Snapshot of a batch's identity and progress.
#[derive(Debug, Clone)]
pub struct BatchInfo {
    /// The batch id.
    pub id: BatchId,
    /// Queue the batch is bound to, if any.
    pub queue: Option<String>,
    /// Wall-clock ms when the batch was created or last reset.
    pub created_ms: u64,
    /// Messages currently assembled.
    pub message_count: usize,
    /// Current lifecycle state.
    pub state: BatchState,
}

/// Result of a commit call.
#[derive(Debug)]
pub enum CommitOutcome {
    /// First commit: the assembled messages, in insertion order.
    Committed {
        /// Queue binding carried by the batch.
        queue: Option<String>,
        /// The messages, in the order they were added.
        messages: Vec<Message>,
    },
    /// The batch was already committed; nothing to deliver.
    AlreadyCommitted,
}

/// Result of an abort call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortOutcome {
    /// First abort: how many assembled messages were discarded.
    Aborted {
        /// Messages thrown away.
        discarded: usize,
    },
    /// The batch was already aborted.
    AlreadyAborted,
}

struct BatchEntry {
    queue: Option<String>,
    created_ms: u64,
    messages: Vec<Message>,
}

struct BatchTable {
    active: AHashMap<BatchId, BatchEntry>,
    finalized: AHashMap<BatchId, BatchState>,
}

/// The batch table. One mutex guards both the open batches and the
/// finalized-state records.
pub struct BatchAggregator {
    table: Mutex<BatchTable>,
    next_id: AtomicU32,
}

impl BatchAggregator {
    /// Creates an empty aggregator.
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: Mutex::new(BatchTable {
                active: AHashMap::new(),
                finalized: AHashMap::new(),
            }),
            next_id: AtomicU32::new(1),
        }
    }

    /// Opens a new batch, optionally bound to a queue.
    pub fn create(&self, queue: Option<&str>) -> BatchId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut table = self.table.lock();
        table.active.insert(
            id,
            BatchEntry {
                queue: queue.map(str::to_owned),
                created_ms: now_millis(),
                messages: Vec::new(),
            },
        );
        id
    }

    /// Appends a message to an open batch.
    pub fn add(&self, id: BatchId, message: Message) -> QueueResult<()> {
        let mut table = self.table.lock();
        if let Some(entry) = table.active.get_mut(&id) {
            entry.messages.push(message);
            return Ok(());
        }
        if table.finalized.contains_key(&id) {
            return Err(QueueError::InvalidState(format!("batch {id} is finalized")));
        }
        Err(QueueError::InvalidParameter(format!("unknown batch id {id}")))
    }

    /// Commits a batch, returning its messages in insertion order.
    ///
    /// Idempotent: committing an already-committed id succeeds with
    /// [`CommitOutcome::AlreadyCommitted`]. Committing an aborted id fails.
    pub fn commit(&self, id: BatchId) -> QueueResult<CommitOutcome> {
        let mut table = self.table.lock();
        if let Some(entry) = table.active.remove(&id) {
            table.finalized.insert(id, BatchState::Committed);
            return Ok(CommitOutcome::Committed {
                queue: entry.queue,
                messages: entry.messages,
            });
        }
        match table.finalized.get(&id) {
            Some(BatchState::Committed) => Ok(CommitOutcome::AlreadyCommitted),
            Some(_) => Err(QueueError::InvalidState(format!(
                "batch {id} was aborted; cannot commit"
            ))),
            None => Err(QueueError::InvalidParameter(format!("unknown batch id {id}"))),
        }
    }

    /// Aborts a batch, discarding its messages.
    ///
    /// Idempotent in the same way as [`commit`](BatchAggregator::commit).
    pub fn abort(&self, id: BatchId) -> QueueResult<AbortOutcome> {
        let mut table = self.table.lock();
        if let Some(entry) = table.active.remove(&id) {
            table.finalized.insert(id, BatchState::Aborted);
            return Ok(AbortOutcome::Aborted {
                discarded: entry.messages.len(),
            });
        }
        match table.finalized.get(&id) {
            Some(BatchState::Aborted) => Ok(AbortOutcome::AlreadyAborted),
            Some(_) => Err(QueueError::InvalidState(format!(
                "batch {id} was committed; cannot abort"
            ))),
            None => Err(QueueError::InvalidParameter(format!("unknown batch id {id}"))),
        }
    }

    /// Empties a batch and restores it to the open state.
    ///
    /// A finalized id is reopened fresh; an open batch is cleared in place.
    /// A non-empty `queue` replaces the binding.
    pub fn reset(&self, id: BatchId, queue: Option<&str>) -> QueueResult<()> {
        let mut table = self.table.lock();
        if let Some(entry) = table.active.get_mut(&id) {
            entry.messages.clear();
            entry.created_ms = now_millis();
            if queue.is_some() {
                entry.queue = queue.map(str::to_owned);
            }
            return Ok(());
        }
        if table.finalized.remove(&id).is_some() {
            table.active.insert(
                id,
                BatchEntry {
                    queue: queue.map(str::to_owned),
                    created_ms: now_millis(),
                    messages: Vec::new(),
                },
            );
            return Ok(());
        }
        Err(QueueError::InvalidParameter(format!("unknown batch id {id}")))
    }

    /// Snapshot of a batch's state.
    pub fn info(&self, id: BatchId) -> QueueResult<BatchInfo> {
        let table = self.table.lock();
        if let Some(entry) = table.active.get(&id) {
            return Ok(BatchInfo {
                id,
                queue: entry.queue.clone(),
                created_ms: entry.created_ms,
                message_count: entry.messages.len(),
                state: BatchState::Open,
            });
        }
        if let Some(&state) = table.finalized.get(&id) {
            return Ok(BatchInfo {
                id,
                queue: None,
                created_ms: 0,
                message_count: 0,
                state,
            });
        }
        Err(QueueError::InvalidParameter(format!("unknown batch id {id}")))
    }

    /// Open, queue-bound, non-empty batches older than `timeout_ms`.
    ///
    /// The manager's sweeper commits these to implement batch auto-flush.
    #[must_use]
    pub fn due(&self, now_ms: u64, timeout_ms: u64) -> Vec<BatchId> {
        let table = self.table.lock();
        table
            .active
            .iter()
            .filter(|(_, entry)| {
                entry.queue.is_some()
                    && !entry.messages.is_empty()
                    && now_ms.saturating_sub(entry.created_ms) >= timeout_ms
            })
            .map(|(&id, _)| id)
            .collect()
    }

    /// Number of open batches.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.table.lock().active.len()
    }
}

impl Default for BatchAggregator {
    fn default() -> Self {
        Self::new()
    }
}
