//! Transaction coordination: atomic application of buffered send / ack /
//! nack operations across queues.
//!
//! Operations buffer in the coordinator until commit; queue state is
//! untouched before that. Commit is two-phase:
//!
//! 1. every buffered send is *staged* -- persisted with a
//!    `tx.committed=false` marker and held invisible in its queue;
//! 2. buffered acks and nacks are applied, then each staged message has
//!    its marker flipped and becomes visible.
//!
//! A failure in either phase discards the staged messages and reports the
//! transaction rolled back. Recovery discards any `tx.committed=false`
//! record it finds, which closes the crash window between the phases.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use parking_lot::Mutex;
use quiver_core::message::properties;
use quiver_core::types::{now_millis, MessageId};
use quiver_core::{Message, QueueError, QueueResult};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::store::QueueStore;
use crate::worker::Worker;

/// Unique transaction identifier.
pub type TransactionId = Uuid;

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Accepting buffered operations.
    Active,
    /// Commit in progress.
    Committing,
    /// Commit completed; all operations applied.
    Committed,
    /// Explicitly rolled back, or commit failed and was cleaned up.
    RolledBack,
    /// The timer expired before commit. Equivalent to a rollback.
    TimedOut,
}

#[derive(Debug)]
enum BufferedOperation {
    Send { queue: String, message: Message },
    Ack { queue: String, id: MessageId },
    Nack { queue: String, id: MessageId, requeue: bool },
}

struct TransactionRecord {
    description: String,
    created_ms: u64,
    timeout_ms: u64,
    state: TransactionState,
    ops: Vec<BufferedOperation>,
}

/// Aggregate transaction counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct TransactionStatsSnapshot {
    /// Transactions begun.
    pub begun: u64,
    /// Transactions committed.
    pub committed: u64,
    /// Transactions rolled back (explicitly or by commit failure).
    pub rolled_back: u64,
    /// Transactions expired by the timer.
    pub timed_out: u64,
    /// Sum of commit durations, ms.
    pub total_commit_ms: u64,
}

impl TransactionStatsSnapshot {
    /// Mean commit duration in ms, 0.0 before the first commit.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn average_commit_ms(&self) -> f64 {
        if self.committed == 0 {
            0.0
        } else {
            self.total_commit_ms as f64 / self.committed as f64
        }
    }
}

/// The transaction coordinator owned by a queue manager.
pub struct TransactionCoordinator {
    queues: Arc<QueueStore>,
    transactions: Mutex<AHashMap<TransactionId, TransactionRecord>>,
    default_timeout_ms: u64,
    begun: AtomicU64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
    timed_out: AtomicU64,
    total_commit_ms: AtomicU64,
    timer: Mutex<Option<Worker>>,
}

impl TransactionCoordinator {
    /// Expiry scan interval for the timer thread.
    const TIMER_INTERVAL: Duration = Duration::from_millis(100);

    /// Creates a coordinator over the given queue store.
    #[must_use]
    pub fn new(queues: Arc<QueueStore>, default_timeout_ms: u64) -> Self {
        Self {
            queues,
            transactions: Mutex::new(AHashMap::new()),
            default_timeout_ms,
            begun: AtomicU64::new(0),
            committed: AtomicU64::new(0),
            rolled_back: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            total_commit_ms: AtomicU64::new(0),
            timer: Mutex::new(None),
        }
    }

    /// Starts the expiry timer thread.
    pub fn start(self: &Arc<Self>) {
        let mut timer = self.timer.lock();
        if timer.is_some() {
            return;
        }
        let coordinator = Arc::clone(self);
        *timer = Some(Worker::spawn("quiver-tx-timer", move |signal| {
            while !signal.wait(Self::TIMER_INTERVAL) {
                coordinator.expire_overdue(now_millis());
            }
        }));
    }

    /// Stops the timer thread.
    pub fn stop(&self) {
        if let Some(mut worker) = self.timer.lock().take() {
            worker.shutdown();
        }
    }

    /// Opens a transaction. A zero timeout uses the coordinator default.
    pub fn begin(&self, description: &str, timeout_ms: u64) -> TransactionId {
        let id = Uuid::new_v4();
        let timeout_ms = if timeout_ms == 0 {
            self.default_timeout_ms
        } else {
            timeout_ms
        };
        self.transactions.lock().insert(
            id,
            TransactionRecord {
                description: description.to_owned(),
                created_ms: now_millis(),
                timeout_ms,
                state: TransactionState::Active,
                ops: Vec::new(),
            },
        );
        self.begun.fetch_add(1, Ordering::Relaxed);
        debug!(tx = %id, description, timeout_ms, "transaction begun");
        id
    }

    /// Buffers a send. Queue state is untouched until commit.
    pub fn send_in_transaction(
        &self,
        tx: TransactionId,
        queue: &str,
        message: Message,
    ) -> QueueResult<()> {
        self.buffer(tx, BufferedOperation::Send {
            queue: queue.to_owned(),
            message,
        })
    }

    /// Buffers an acknowledgement.
    pub fn ack_in_transaction(
        &self,
        tx: TransactionId,
        queue: &str,
        id: MessageId,
    ) -> QueueResult<()> {
        self.buffer(tx, BufferedOperation::Ack {
            queue: queue.to_owned(),
            id,
        })
    }

    /// Buffers a negative acknowledgement.
    pub fn nack_in_transaction(
        &self,
        tx: TransactionId,
        queue: &str,
        id: MessageId,
        requeue: bool,
    ) -> QueueResult<()> {
        self.buffer(tx, BufferedOperation::Nack {
            queue: queue.to_owned(),
            id,
            requeue,
        })
    }

    fn buffer(&self, tx: TransactionId, op: BufferedOperation) -> QueueResult<()> {
        let mut transactions = self.transactions.lock();
        let record = transactions
            .get_mut(&tx)
            .ok_or_else(|| QueueError::TransactionNotFound(tx.to_string()))?;
        match record.state {
            TransactionState::Active => {
                record.ops.push(op);
                Ok(())
            }
            TransactionState::TimedOut => Err(QueueError::TransactionTimeout(tx.to_string())),
            state => Err(QueueError::TransactionConflict(format!(
                "transaction {tx} is {state:?}"
            ))),
        }
    }

    /// Applies the buffered operations atomically.
    pub fn commit(&self, tx: TransactionId) -> QueueResult<()> {
        let ops = {
            let mut transactions = self.transactions.lock();
            let record = transactions
                .get_mut(&tx)
                .ok_or_else(|| QueueError::TransactionNotFound(tx.to_string()))?;
            match record.state {
                TransactionState::Active => {
                    record.state = TransactionState::Committing;
                    std::mem::take(&mut record.ops)
                }
                TransactionState::TimedOut => {
                    transactions.remove(&tx);
                    return Err(QueueError::TransactionTimeout(tx.to_string()));
                }
                state => {
                    return Err(QueueError::TransactionConflict(format!(
                        "transaction {tx} is {state:?}"
                    )))
                }
            }
        };
        let started = Instant::now();

        // Phase one: stage every send with the uncommitted marker.
        let mut staged: Vec<(String, MessageId)> = Vec::new();
        for op in &ops {
            if let BufferedOperation::Send { queue, message } = op {
                let mut message = message.clone();
                message.set_property(properties::TRANSACTION_ID, tx.to_string());
                message.set_property(properties::TRANSACTION_COMMITTED, "false");
                match self.queues.send_staged(queue, message) {
                    Ok(id) => staged.push((queue.clone(), id)),
                    Err(err) => {
                        warn!(tx = %tx, queue = %queue, error = %err,
                              "commit phase one failed; rolling back");
                        self.discard_staged(&staged);
                        self.finish(tx, TransactionState::RolledBack);
                        return Err(err);
                    }
                }
            }
        }

        // Phase two: apply acks and nacks in insertion order, then make
        // the staged sends visible.
        for op in &ops {
            let result = match op {
                BufferedOperation::Send { .. } => Ok(()),
                BufferedOperation::Ack { queue, id } => self.queues.acknowledge(queue, *id),
                BufferedOperation::Nack { queue, id, requeue } => {
                    self.queues.negative_acknowledge(queue, *id, *requeue)
                }
            };
            if let Err(err) = result {
                warn!(tx = %tx, error = %err, "commit phase two failed; rolling back");
                self.discard_staged(&staged);
                self.finish(tx, TransactionState::RolledBack);
                return Err(err);
            }
        }
        for (queue, id) in &staged {
            if let Err(err) = self.queues.release_staged(queue, *id) {
                // The message is already durable; a marker-flip write
                // failure degrades to an extra recovery check, not a lost
                // message.
                warn!(tx = %tx, queue = %queue, id, error = %err,
                      "failed to rewrite commit marker");
            }
        }

        self.finish(tx, TransactionState::Committed);
        self.total_commit_ms.fetch_add(
            u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
        info!(tx = %tx, sends = staged.len(), "transaction committed");
        Ok(())
    }

    /// Discards the buffered operations without touching queue state.
    pub fn rollback(&self, tx: TransactionId, reason: &str) -> QueueResult<()> {
        let mut transactions = self.transactions.lock();
        let record = transactions
            .get_mut(&tx)
            .ok_or_else(|| QueueError::TransactionNotFound(tx.to_string()))?;
        match record.state {
            TransactionState::Active => {
                debug!(tx = %tx, reason, description = %record.description,
                       "transaction rolled back");
                transactions.remove(&tx);
                self.rolled_back.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            // The timer already rolled it back; acknowledging that is fine.
            TransactionState::TimedOut => {
                transactions.remove(&tx);
                Ok(())
            }
            state => Err(QueueError::TransactionConflict(format!(
                "transaction {tx} is {state:?}"
            ))),
        }
    }

    /// Aggregate counters.
    #[must_use]
    pub fn stats(&self) -> TransactionStatsSnapshot {
        TransactionStatsSnapshot {
            begun: self.begun.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            rolled_back: self.rolled_back.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            total_commit_ms: self.total_commit_ms.load(Ordering::Relaxed),
        }
    }

    /// Transactions currently open (active or committing).
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.transactions.lock().len()
    }

    /// Expires overdue active transactions. Called by the timer thread;
    /// `now_ms` is injectable for tests.
    pub fn expire_overdue(&self, now_ms: u64) {
        let mut transactions = self.transactions.lock();
        for (id, record) in transactions.iter_mut() {
            if record.state == TransactionState::Active
                && now_ms.saturating_sub(record.created_ms) > record.timeout_ms
            {
                record.state = TransactionState::TimedOut;
                record.ops.clear();
                self.timed_out.fetch_add(1, Ordering::Relaxed);
                warn!(tx = %id, timeout_ms = record.timeout_ms,
                      description = %record.description, "transaction timed out");
            }
        }
    }

    fn discard_staged(&self, staged: &[(String, MessageId)]) {
        for (queue, id) in staged {
            if let Err(err) = self.queues.discard_staged(queue, *id) {
                warn!(queue = %queue, id, error = %err, "failed to discard staged message");
            }
        }
    }

    fn finish(&self, tx: TransactionId, state: TransactionState) {
        self.transactions.lock().remove(&tx);
        match state {
            TransactionState::Committed => {
                self.committed.fetch_add(1, Ordering::Relaxed);
            }
            TransactionState::RolledBack => {
                self.rolled_back.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }
}

impl Drop for TransactionCoordinator {
    fn drop(&mut self) {
        self.stop();
    }
}
