//! Per-queue runtime state: the pending sequence, the inflight set, retry
//! scheduling, and the message state machine.
//!
//! One mutex guards all of a queue's mutable state; a condition variable
//! wakes blocked receivers on enqueue, retry promotion, and close. Message
//! transitions (PENDING -> INFLIGHT -> removed / retry-scheduled / dead)
//! happen only under that mutex, which is what makes every message live in
//! exactly one state at a time.
//!
//! Dead-letter routing crosses queues, so it never happens under this
//! queue's lock: operations that kill messages return [`DeadLetter`] work
//! items for the registry to route after the lock is released.

use std::cmp::Reverse;
use std::collections::{BTreeSet, VecDeque};
use std::time::Instant;

use ahash::{AHashMap, AHashSet};
use hdrhistogram::Histogram;
use parking_lot::{Condvar, Mutex};
use quiver_core::types::{now_millis, MessageId, MessagePriority, MessageStatus};
use quiver_core::{Message, QueueConfig, QueueError, QueueResult, QueueStats, QueueType};

use super::retry::retry_delay_ms;

/// Why a message left its queue for the dead-letter path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterReason {
    /// The message's expiry time passed before delivery.
    Expired,
    /// The retry budget was exhausted.
    MaxRetries,
    /// The queue was at capacity when the message arrived.
    Overflow,
}

impl DeadLetterReason {
    /// Property value stamped onto the dead-letter copy.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Expired => "EXPIRED",
            Self::MaxRetries => "MAX_RETRIES",
            Self::Overflow => "OVERFLOW",
        }
    }
}

/// Where a dead message should be routed.
#[derive(Debug, Clone)]
pub struct DeadLetterTarget {
    /// Name of the dead-letter queue.
    pub queue: String,
    /// TTL stamped onto the dead-letter copy. 0 = no expiry.
    pub ttl_ms: u64,
}

/// A message that left its queue, plus routing instructions.
///
/// Produced under the source queue's lock; routed by the registry after the
/// lock is released, honoring the engine lock order.
#[derive(Debug)]
pub struct DeadLetter {
    /// The message as it was when it died (origin queue and id intact).
    pub message: Message,
    /// Why it died.
    pub reason: DeadLetterReason,
    /// Routing target, or `None` when the queue has no dead-letter target
    /// (the message is dropped and counted).
    pub target: Option<DeadLetterTarget>,
}

/// Outcome of offering a message to a queue.
#[derive(Debug)]
pub enum AcceptOutcome {
    /// The message was stored (and persisted, for disk queues).
    Accepted,
    /// The queue was full and has a dead-letter target; the caller routes
    /// the message there with reason `OVERFLOW`.
    Overflow(Box<DeadLetter>),
}

/// Outcome of a blocking receive attempt.
#[derive(Debug)]
pub enum AwaitOutcome {
    /// A message was moved to inflight and a copy handed out. Any expired
    /// messages skipped on the way out ride along for routing.
    Delivered {
        /// The delivered message.
        message: Box<Message>,
        /// Expired messages swept aside while selecting the head.
        dead: Vec<DeadLetter>,
    },
    /// Only expired messages were found; route them and call again.
    DeadOnly(Vec<DeadLetter>),
    /// The queue was deleted while waiting.
    Closed,
    /// The deadline passed with nothing deliverable.
    TimedOut,
}

/// Outcome of a negative acknowledgement.
#[derive(Debug)]
pub enum NackOutcome {
    /// The message will become deliverable again at the given time.
    Scheduled {
        /// Wall-clock ms when the message re-enters the pending sequence.
        eligible_at_ms: u64,
    },
    /// The retry budget is exhausted; route the message.
    Dead(Box<DeadLetter>),
}

/// Work produced by a periodic sweep.
#[derive(Debug, Default)]
pub struct SweepOutcome {
    /// Messages to route to dead-letter queues (or drop).
    pub dead: Vec<DeadLetter>,
    /// Retry-scheduled messages promoted back to pending.
    pub promoted: usize,
    /// Inflight messages returned to the retry path by visibility timeout.
    pub visibility_expired: usize,
}

/// Configuration plus live counters and latency quantiles.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueInfo {
    /// The queue's configuration.
    pub config: QueueConfig,
    /// Live statistics.
    pub stats: QueueStats,
    /// Median delivery latency (send to receive), ms.
    pub p50_latency_ms: u64,
    /// 95th percentile delivery latency, ms.
    pub p95_latency_ms: u64,
}

enum PendingOrder {
    Fifo(VecDeque<MessageId>),
    Priority(BTreeSet<(Reverse<u8>, MessageId)>),
}

impl PendingOrder {
    fn for_type(queue_type: QueueType) -> Self {
        match queue_type {
            QueueType::Standard => Self::Fifo(VecDeque::new()),
            QueueType::Priority => Self::Priority(BTreeSet::new()),
        }
    }

    fn push(&mut self, id: MessageId, priority: MessagePriority) {
        match self {
            Self::Fifo(order) => order.push_back(id),
            Self::Priority(order) => {
                order.insert((Reverse(priority.as_u8()), id));
            }
        }
    }

    fn pop(&mut self) -> Option<MessageId> {
        match self {
            Self::Fifo(order) => order.pop_front(),
            Self::Priority(order) => {
                let first = *order.iter().next()?;
                order.remove(&first);
                Some(first.1)
            }
        }
    }

    fn remove(&mut self, id: MessageId, priority: MessagePriority) {
        match self {
            Self::Fifo(order) => order.retain(|&queued| queued != id),
            Self::Priority(order) => {
                order.remove(&(Reverse(priority.as_u8()), id));
            }
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::Fifo(order) => order.len(),
            Self::Priority(order) => order.len(),
        }
    }

    fn ids(&self) -> Vec<MessageId> {
        match self {
            Self::Fifo(order) => order.iter().copied().collect(),
            Self::Priority(order) => order.iter().map(|&(_, id)| id).collect(),
        }
    }

    fn clear(&mut self) {
        match self {
            Self::Fifo(order) => order.clear(),
            Self::Priority(order) => order.clear(),
        }
    }
}

struct InflightEntry {
    consumer: String,
    since_ms: u64,
    deadline_ms: u64,
}

struct QueueInner {
    config: QueueConfig,
    open: bool,
    /// Every message the queue currently owns, in any state.
    messages: AHashMap<MessageId, Message>,
    pending: PendingOrder,
    inflight: AHashMap<MessageId, InflightEntry>,
    /// `(eligible_at_ms, id)`, ordered so the earliest retry is first.
    retry_scheduled: BTreeSet<(u64, MessageId)>,
    /// Transaction phase-one messages: persisted, counted against
    /// capacity, invisible to consumers.
    staged: AHashSet<MessageId>,
    /// Total payload bytes across owned messages.
    owned_bytes: u64,
    stats: QueueStats,
    latency: Option<Histogram<u64>>,
}

impl QueueInner {
    fn owned_count(&self) -> u64 {
        self.messages.len() as u64
    }

    fn fill_counts(&self, stats: &mut QueueStats) {
        stats.pending_count = self.pending.len() as u64;
        stats.inflight_count = self.inflight.len() as u64;
        stats.retry_scheduled_count = self.retry_scheduled.len() as u64;
        stats.pending_bytes = self.owned_bytes;
    }

    fn dead_letter(&mut self, message: Message, reason: DeadLetterReason) -> DeadLetter {
        let target = if self.config.enable_dead_letter && !self.config.dead_letter_queue.is_empty()
        {
            self.stats.total_dead_lettered += 1;
            Some(DeadLetterTarget {
                queue: self.config.dead_letter_queue.clone(),
                ttl_ms: self.config.dead_letter_ttl_ms,
            })
        } else {
            self.stats.total_dropped += 1;
            None
        };
        DeadLetter {
            message,
            reason,
            target,
        }
    }

    /// Removes an owned message entirely, settling byte accounting.
    fn take_message(&mut self, id: MessageId) -> Option<Message> {
        let message = self.messages.remove(&id)?;
        self.owned_bytes = self.owned_bytes.saturating_sub(message.size_bytes());
        Some(message)
    }

    fn effective_max_retries(&self, message: &Message) -> u32 {
        if message.header.max_retries > 0 {
            message.header.max_retries
        } else {
            self.config.max_retries
        }
    }

    /// Moves due retries back into the pending sequence.
    fn promote_due(&mut self, now_ms: u64) -> usize {
        let mut promoted = 0;
        while let Some(&(eligible_at, id)) = self.retry_scheduled.iter().next() {
            if eligible_at > now_ms {
                break;
            }
            self.retry_scheduled.remove(&(eligible_at, id));
            if let Some(message) = self.messages.get_mut(&id) {
                message.status = MessageStatus::Pending;
                let priority = message.header.priority;
                self.pending.push(id, priority);
                promoted += 1;
            }
        }
        promoted
    }

    /// Earliest wall-clock ms at which a scheduled retry becomes due.
    fn next_retry_at(&self) -> Option<u64> {
        self.retry_scheduled.iter().next().map(|&(at, _)| at)
    }
}

/// A single queue: configuration, owned messages, and delivery state.
pub struct Queue {
    name: String,
    inner: Mutex<QueueInner>,
    available: Condvar,
}

impl Queue {
    /// Creates an empty open queue.
    #[must_use]
    pub fn new(config: QueueConfig) -> Self {
        Self::with_stats(config, QueueStats {
            created_ms: now_millis(),
            ..QueueStats::default()
        })
    }

    /// Creates a queue carrying previously persisted totals (recovery).
    #[must_use]
    pub fn with_stats(config: QueueConfig, stats: QueueStats) -> Self {
        let pending = PendingOrder::for_type(config.queue_type);
        Self {
            name: config.name.clone(),
            inner: Mutex::new(QueueInner {
                config,
                open: true,
                messages: AHashMap::new(),
                pending,
                inflight: AHashMap::new(),
                retry_scheduled: BTreeSet::new(),
                staged: AHashSet::new(),
                owned_bytes: 0,
                stats,
                latency: Histogram::new_with_bounds(1, 3_600_000, 2).ok(),
            }),
            available: Condvar::new(),
        }
    }

    /// The queue's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Snapshot of the configuration.
    #[must_use]
    pub fn config(&self) -> QueueConfig {
        self.inner.lock().config.clone()
    }

    /// Whether the queue still accepts work.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.lock().open
    }

    /// Offers a message to the queue.
    ///
    /// The id must already be assigned and the header's queue name stamped.
    /// `persist` runs under the queue lock after admission checks and
    /// before insertion, so the on-disk append order matches the pending
    /// order. When `staged` is true the message is held invisible for a
    /// transaction's phase two.
    pub fn accept(
        &self,
        message: Message,
        staged: bool,
        persist: impl FnOnce(&Message) -> QueueResult<()>,
    ) -> QueueResult<AcceptOutcome> {
        let mut inner = self.inner.lock();
        if !inner.open {
            return Err(QueueError::QueueNotFound(self.name.clone()));
        }

        let over_count =
            inner.config.max_size > 0 && inner.owned_count() >= inner.config.max_size;
        let over_bytes = inner.config.max_size_bytes > 0
            && inner.owned_bytes + message.size_bytes() > inner.config.max_size_bytes;
        if over_count || over_bytes {
            if inner.config.enable_dead_letter && !inner.config.dead_letter_queue.is_empty() {
                let dead = inner.dead_letter(message, DeadLetterReason::Overflow);
                return Ok(AcceptOutcome::Overflow(Box::new(dead)));
            }
            return Err(QueueError::QueueFull(self.name.clone()));
        }

        persist(&message)?;

        let id = message.header.id;
        let priority = message.header.priority;
        inner.owned_bytes += message.size_bytes();
        inner.stats.total_sent += 1;
        inner.stats.last_enqueue_ms = now_millis();
        inner.messages.insert(id, message);
        if staged {
            inner.staged.insert(id);
        } else {
            inner.pending.push(id, priority);
            drop(inner);
            self.available.notify_one();
        }
        Ok(AcceptOutcome::Accepted)
    }

    /// Offers a group of messages atomically (used by batch commit).
    ///
    /// Admission is all-or-nothing against capacity; `persist` sees the
    /// whole group once admission has passed.
    pub fn accept_many(
        &self,
        messages: Vec<Message>,
        persist: impl FnOnce(&[Message]) -> QueueResult<()>,
    ) -> QueueResult<()> {
        let mut inner = self.inner.lock();
        if !inner.open {
            return Err(QueueError::QueueNotFound(self.name.clone()));
        }
        let incoming_bytes: u64 = messages.iter().map(Message::size_bytes).sum();
        let over_count = inner.config.max_size > 0
            && inner.owned_count() + messages.len() as u64 > inner.config.max_size;
        let over_bytes = inner.config.max_size_bytes > 0
            && inner.owned_bytes + incoming_bytes > inner.config.max_size_bytes;
        if over_count || over_bytes {
            return Err(QueueError::QueueFull(self.name.clone()));
        }

        persist(&messages)?;

        inner.owned_bytes += incoming_bytes;
        inner.stats.total_sent += messages.len() as u64;
        inner.stats.last_enqueue_ms = now_millis();
        for message in messages {
            let id = message.header.id;
            let priority = message.header.priority;
            inner.messages.insert(id, message);
            inner.pending.push(id, priority);
        }
        drop(inner);
        self.available.notify_all();
        Ok(())
    }

    /// Blocks until a message is deliverable or `deadline` passes.
    ///
    /// Expired messages encountered while selecting the head are removed
    /// and returned for dead-letter routing; the caller routes them with
    /// the queue lock released.
    pub fn await_message(&self, deadline: Instant, consumer: &str) -> AwaitOutcome {
        let mut inner = self.inner.lock();
        loop {
            if !inner.open {
                return AwaitOutcome::Closed;
            }
            let now = now_millis();
            inner.promote_due(now);

            let mut dead = Vec::new();
            while let Some(id) = inner.pending.pop() {
                let Some(message) = inner.messages.get(&id) else {
                    continue;
                };
                if message.is_expired(now) {
                    if let Some(expired) = inner.take_message(id) {
                        let letter = inner.dead_letter(expired, DeadLetterReason::Expired);
                        dead.push(letter);
                    }
                    continue;
                }

                let visibility = inner.config.effective_visibility_timeout_ms();
                inner.inflight.insert(
                    id,
                    InflightEntry {
                        consumer: consumer.to_owned(),
                        since_ms: now,
                        deadline_ms: now + visibility,
                    },
                );
                let message = inner
                    .messages
                    .get_mut(&id)
                    .map(|m| {
                        m.status = MessageStatus::Inflight;
                        m.clone()
                    })
                    .unwrap_or_default();
                inner.stats.total_delivered += 1;
                inner.stats.last_dequeue_ms = now;
                let elapsed = now.saturating_sub(message.header.created_ms).max(1);
                if let Some(histogram) = inner.latency.as_mut() {
                    let _ = histogram.record(elapsed);
                }
                return AwaitOutcome::Delivered {
                    message: Box::new(message),
                    dead,
                };
            }
            if !dead.is_empty() {
                return AwaitOutcome::DeadOnly(dead);
            }

            if Instant::now() >= deadline {
                return AwaitOutcome::TimedOut;
            }
            // Wake early if a scheduled retry comes due before the caller's
            // deadline.
            let wait_until = match inner.next_retry_at() {
                Some(at) => {
                    let retry_in = std::time::Duration::from_millis(at.saturating_sub(now));
                    deadline.min(Instant::now() + retry_in)
                }
                None => deadline,
            };
            self.available.wait_until(&mut inner, wait_until);
        }
    }

    /// Acknowledges an inflight message, removing it from the queue.
    ///
    /// Returns the removed message so the caller can settle persistence.
    pub fn acknowledge(&self, id: MessageId) -> QueueResult<Message> {
        let mut inner = self.inner.lock();
        if !inner.open {
            return Err(QueueError::QueueNotFound(self.name.clone()));
        }
        if inner.inflight.remove(&id).is_none() {
            return if inner.messages.contains_key(&id) {
                Err(QueueError::NotInflight(id))
            } else {
                Err(QueueError::MessageNotFound(id))
            };
        }
        let mut message = inner
            .take_message(id)
            .ok_or(QueueError::MessageNotFound(id))?;
        message.status = MessageStatus::Acked;
        inner.stats.total_acknowledged += 1;
        Ok(message)
    }

    /// Negatively acknowledges an inflight message.
    ///
    /// With retries remaining (and `requeue` set) the message is scheduled
    /// for redelivery after the configured backoff; otherwise it is handed
    /// back for dead-letter routing.
    pub fn negative_acknowledge(&self, id: MessageId, requeue: bool) -> QueueResult<NackOutcome> {
        let mut inner = self.inner.lock();
        if !inner.open {
            return Err(QueueError::QueueNotFound(self.name.clone()));
        }
        if inner.inflight.remove(&id).is_none() {
            return if inner.messages.contains_key(&id) {
                Err(QueueError::NotInflight(id))
            } else {
                Err(QueueError::MessageNotFound(id))
            };
        }
        Ok(Self::requeue_or_kill(&mut inner, id, requeue))
    }

    /// Shared nack path for explicit nacks and visibility timeouts.
    ///
    /// The caller has already removed the inflight entry.
    fn requeue_or_kill(inner: &mut QueueInner, id: MessageId, requeue: bool) -> NackOutcome {
        let now = now_millis();
        let Some(message) = inner.messages.get_mut(&id) else {
            // The map and the inflight set disagree; surface as dead with
            // no payload rather than panic. Should be unreachable.
            return NackOutcome::Dead(Box::new(DeadLetter {
                message: Message::default(),
                reason: DeadLetterReason::MaxRetries,
                target: None,
            }));
        };
        let max_retries = if message.header.max_retries > 0 {
            message.header.max_retries
        } else {
            inner.config.max_retries
        };

        if requeue && message.header.retry_count < max_retries {
            message.header.retry_count += 1;
            message.status = MessageStatus::Failed;
            let delay = retry_delay_ms(&inner.config, message.header.retry_count - 1);
            let eligible_at = now + delay;
            inner.retry_scheduled.insert((eligible_at, id));
            inner.stats.total_retried += 1;
            NackOutcome::Scheduled {
                eligible_at_ms: eligible_at,
            }
        } else {
            let message = inner.take_message(id).unwrap_or_default();
            let letter = inner.dead_letter(message, DeadLetterReason::MaxRetries);
            NackOutcome::Dead(Box::new(letter))
        }
    }

    /// Periodic maintenance: visibility timeouts, retry promotion, and
    /// expiry of pending messages.
    ///
    /// `now_ms` is injectable so tests can advance time.
    pub fn sweep(&self, now_ms: u64) -> SweepOutcome {
        let mut inner = self.inner.lock();
        if !inner.open {
            return SweepOutcome::default();
        }
        let mut outcome = SweepOutcome::default();

        // Inflight past its visibility deadline is an implicit nack with
        // requeue.
        let timed_out: Vec<MessageId> = inner
            .inflight
            .iter()
            .filter(|(_, entry)| entry.deadline_ms <= now_ms)
            .map(|(&id, _)| id)
            .collect();
        for id in timed_out {
            inner.inflight.remove(&id);
            outcome.visibility_expired += 1;
            match Self::requeue_or_kill(&mut inner, id, true) {
                NackOutcome::Scheduled { .. } => {}
                NackOutcome::Dead(letter) => outcome.dead.push(*letter),
            }
        }

        // Expired pending messages die without waiting for a consumer.
        let expired: Vec<(MessageId, MessagePriority)> = inner
            .pending
            .ids()
            .into_iter()
            .filter_map(|id| {
                inner.messages.get(&id).and_then(|m| {
                    m.is_expired(now_ms).then_some((id, m.header.priority))
                })
            })
            .collect();
        for (id, priority) in expired {
            inner.pending.remove(id, priority);
            if let Some(message) = inner.take_message(id) {
                let letter = inner.dead_letter(message, DeadLetterReason::Expired);
                outcome.dead.push(letter);
            }
        }

        outcome.promoted = inner.promote_due(now_ms);
        let wake = outcome.promoted > 0;
        drop(inner);
        if wake {
            self.available.notify_all();
        }
        outcome
    }

    /// Removes everything; returns the removed ids for persistence cleanup.
    pub fn purge(&self) -> Vec<MessageId> {
        let mut inner = self.inner.lock();
        let removed: Vec<MessageId> = inner.messages.keys().copied().collect();
        inner.messages.clear();
        inner.pending.clear();
        inner.inflight.clear();
        inner.retry_scheduled.clear();
        inner.staged.clear();
        inner.owned_bytes = 0;
        drop(inner);
        self.available.notify_all();
        removed
    }

    /// Marks the queue closed, waking all waiters. Returns the owned ids
    /// for persistence cleanup.
    pub fn close(&self) -> Vec<MessageId> {
        let mut inner = self.inner.lock();
        inner.open = false;
        let removed: Vec<MessageId> = inner.messages.keys().copied().collect();
        inner.messages.clear();
        inner.pending.clear();
        inner.inflight.clear();
        inner.retry_scheduled.clear();
        inner.staged.clear();
        inner.owned_bytes = 0;
        drop(inner);
        self.available.notify_all();
        removed
    }

    /// Restores a recovered message directly into the pending sequence
    /// without counting it as a new send.
    pub fn restore(&self, mut message: Message) {
        let mut inner = self.inner.lock();
        let id = message.header.id;
        let priority = message.header.priority;
        message.status = MessageStatus::Pending;
        inner.owned_bytes += message.size_bytes();
        inner.messages.insert(id, message);
        inner.pending.push(id, priority);
        drop(inner);
        self.available.notify_one();
    }

    /// Makes a staged (transactional) message visible to consumers.
    ///
    /// Returns a copy of the released message so the caller can rewrite
    /// its persisted record with the flipped commit marker.
    pub fn release_staged(&self, id: MessageId) -> QueueResult<Message> {
        let mut inner = self.inner.lock();
        if !inner.staged.remove(&id) {
            return Err(QueueError::MessageNotFound(id));
        }
        let Some(message) = inner.messages.get_mut(&id) else {
            return Err(QueueError::MessageNotFound(id));
        };
        message.status = MessageStatus::Pending;
        message.set_property(
            quiver_core::message::properties::TRANSACTION_COMMITTED,
            "true",
        );
        let copy = message.clone();
        let priority = message.header.priority;
        inner.pending.push(id, priority);
        drop(inner);
        self.available.notify_one();
        Ok(copy)
    }

    /// Throws away a staged message (transaction rollback). Returns the
    /// message for persistence cleanup.
    pub fn discard_staged(&self, id: MessageId) -> QueueResult<Message> {
        let mut inner = self.inner.lock();
        if !inner.staged.remove(&id) {
            return Err(QueueError::MessageNotFound(id));
        }
        inner
            .take_message(id)
            .ok_or(QueueError::MessageNotFound(id))
    }

    /// Configuration, statistics, and latency quantiles.
    #[must_use]
    pub fn info(&self) -> QueueInfo {
        let inner = self.inner.lock();
        let mut stats = inner.stats;
        inner.fill_counts(&mut stats);
        let (p50, p95) = inner.latency.as_ref().map_or((0, 0), |h| {
            if h.is_empty() {
                (0, 0)
            } else {
                (h.value_at_quantile(0.5), h.value_at_quantile(0.95))
            }
        });
        QueueInfo {
            config: inner.config.clone(),
            stats,
            p50_latency_ms: p50,
            p95_latency_ms: p95,
        }
    }

    /// Statistics with live counts filled in.
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        let mut stats = inner.stats;
        inner.fill_counts(&mut stats);
        stats
    }
}
