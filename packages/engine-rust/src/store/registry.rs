//! The queue registry: name-to-queue lookup, send/receive orchestration,
//! dead-letter routing, and startup recovery.
//!
//! Lock order is registry (a `DashMap` shard), then one queue's mutex, then
//! persistence. Cross-queue work -- dead-letter routing -- always happens
//! after the source queue's lock is released, so no thread ever holds two
//! queue locks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use quiver_core::message::properties;
use quiver_core::types::{now_millis, MessageId, MessageStatus};
use quiver_core::{
    Message, MessageHeader, PersistenceMode, QueueConfig, QueueError, QueueResult,
};
use tracing::{debug, info, warn};

use super::queue::{
    AcceptOutcome, AwaitOutcome, DeadLetter, NackOutcome, Queue, QueueInfo, SweepOutcome,
};
use crate::events::{ListenerRegistry, QueueEvent};
use crate::persistence::MessageStore;

/// Summary of one registry-wide sweep pass.
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Messages dead-lettered or dropped across all queues.
    pub dead_lettered: usize,
    /// Retry-scheduled messages promoted to pending.
    pub promoted: usize,
    /// Inflight messages reclaimed by visibility timeout.
    pub visibility_expired: usize,
}

/// All queues of one engine instance.
pub struct QueueStore {
    queues: DashMap<String, Arc<Queue>>,
    store: Option<Arc<dyn MessageStore>>,
    events: Arc<ListenerRegistry>,
    next_id: AtomicU64,
}

impl QueueStore {
    /// Creates an empty registry. `store` is the persistence seam; `None`
    /// runs every queue memory-only regardless of its configured mode.
    #[must_use]
    pub fn new(store: Option<Arc<dyn MessageStore>>, events: Arc<ListenerRegistry>) -> Self {
        Self {
            queues: DashMap::new(),
            store,
            events,
            next_id: AtomicU64::new(1),
        }
    }

    /// Rebuilds queues and their pending sequences from persistence.
    ///
    /// Messages staged by a transaction that never committed are discarded
    /// here, which is what makes commit atomic across a crash.
    pub fn recover(&self) -> QueueResult<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let mut names = store.list_queues();
        names.sort_unstable();
        for name in names {
            let (config, persisted_stats) = match store.load_queue(&name) {
                Ok(loaded) => loaded,
                Err(err) => {
                    warn!(queue = %name, error = %err, "skipping unloadable queue");
                    continue;
                }
            };
            let queue = Arc::new(Queue::with_stats(config, persisted_stats));
            let messages = match store.load_all_messages(&name) {
                Ok(messages) => messages,
                Err(err) => {
                    warn!(queue = %name, error = %err, "queue recovered without messages");
                    Vec::new()
                }
            };
            let mut restored = 0usize;
            for message in messages {
                if message.property(properties::TRANSACTION_COMMITTED) == Some("false") {
                    // Phase-one leftover of a transaction that never
                    // committed; rolling it back completes the crash path.
                    let _ = store.delete_message(&name, message.header.id);
                    continue;
                }
                queue.restore(message);
                restored += 1;
            }
            info!(queue = %name, restored, "queue recovered");
            self.queues.insert(name, queue);
        }
        self.next_id
            .store(store.max_message_id() + 1, Ordering::SeqCst);
        Ok(())
    }

    /// Assigns the next process-wide message id.
    fn next_id(&self) -> MessageId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Pre-assigns an id so callers can run id-dependent transforms
    /// (encryption nonces) before the send. Ids remain unique and
    /// monotonic; sends without a pre-assigned id get one at send time.
    #[must_use]
    pub fn allocate_id(&self) -> MessageId {
        self.next_id()
    }

    fn queue(&self, name: &str) -> QueueResult<Arc<Queue>> {
        self.queues
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| QueueError::QueueNotFound(name.to_owned()))
    }

    fn persists(&self, config: &QueueConfig) -> Option<Arc<dyn MessageStore>> {
        match (&self.store, config.persistence) {
            (Some(store), PersistenceMode::DiskPersistent) => Some(Arc::clone(store)),
            _ => None,
        }
    }

    // --- Admin ---

    /// Creates a queue. The configuration is validated and persisted.
    pub fn create_queue(&self, config: QueueConfig) -> QueueResult<()> {
        config.validate()?;
        let name = config.name.clone();
        match self.queues.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(QueueError::QueueAlreadyExists(name));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let queue = Arc::new(Queue::new(config.clone()));
                if let Some(store) = &self.store {
                    store.save_queue(&config, &queue.stats())?;
                }
                slot.insert(queue);
            }
        }
        info!(queue = %name, "queue created");
        self.events.emit(&QueueEvent::QueueCreated { queue: name });
        Ok(())
    }

    /// Deletes a queue, its in-memory state, and its persisted messages.
    pub fn delete_queue(&self, name: &str) -> QueueResult<()> {
        let Some((_, queue)) = self.queues.remove(name) else {
            return Err(QueueError::QueueNotFound(name.to_owned()));
        };
        let removed = queue.close();
        if let Some(store) = &self.store {
            for id in &removed {
                let _ = store.delete_message(name, *id);
            }
            if let Err(err) = store.delete_queue(name) {
                debug!(queue = %name, error = %err, "no persisted metadata to delete");
            }
        }
        info!(queue = %name, removed = removed.len(), "queue deleted");
        self.events.emit(&QueueEvent::QueueDeleted {
            queue: name.to_owned(),
        });
        Ok(())
    }

    /// Removes all messages from a queue. Returns how many were removed.
    pub fn purge_queue(&self, name: &str) -> QueueResult<usize> {
        let queue = self.queue(name)?;
        let removed = queue.purge();
        if let Some(store) = &self.store {
            for id in &removed {
                let _ = store.delete_message(name, *id);
            }
        }
        self.events.emit(&QueueEvent::QueuePurged {
            queue: name.to_owned(),
            removed: removed.len(),
        });
        Ok(removed.len())
    }

    /// Names of all live queues.
    #[must_use]
    pub fn list_queues(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.iter().map(|e| e.key().clone()).collect();
        names.sort_unstable();
        names
    }

    /// Configuration, statistics, and latency quantiles for one queue.
    pub fn queue_info(&self, name: &str) -> QueueResult<QueueInfo> {
        Ok(self.queue(name)?.info())
    }

    /// Whether the queue exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.queues.contains_key(name)
    }

    // --- Producer ---

    /// Validates, stamps, persists, and enqueues a message.
    ///
    /// On success returns the assigned id. A full queue with a dead-letter
    /// target accepts the message into the target instead.
    pub fn send_message(&self, name: &str, message: Message) -> QueueResult<MessageId> {
        self.send_internal(name, message, false)
    }

    /// Sends a transaction phase-one message: persisted and counted, but
    /// invisible until released.
    pub fn send_staged(&self, name: &str, message: Message) -> QueueResult<MessageId> {
        self.send_internal(name, message, true)
    }

    fn send_internal(&self, name: &str, mut message: Message, staged: bool) -> QueueResult<MessageId> {
        let queue = self.queue(name)?;
        let config = queue.config();
        self.normalize(&mut message, name, &config)?;
        let id = message.header.id;

        let store = self.persists(&config);
        let outcome = queue.accept(message, staged, |m| {
            store.as_ref().map_or(Ok(()), |s| s.save_message(name, m))
        })?;
        match outcome {
            AcceptOutcome::Accepted => {
                if !staged {
                    self.events.emit(&QueueEvent::MessageEnqueued {
                        queue: name.to_owned(),
                        id,
                    });
                }
                Ok(id)
            }
            AcceptOutcome::Overflow(dead) => {
                self.route_dead_letter(*dead);
                Ok(id)
            }
        }
    }

    /// Sends a group of messages under one queue lock with contiguous ids
    /// and a single batch persistence write.
    pub fn send_batch(&self, name: &str, mut messages: Vec<Message>) -> QueueResult<Vec<MessageId>> {
        let queue = self.queue(name)?;
        let config = queue.config();
        let mut ids = Vec::with_capacity(messages.len());
        for message in &mut messages {
            self.normalize(message, name, &config)?;
            ids.push(message.header.id);
        }

        let store = self.persists(&config);
        queue.accept_many(messages, |group| {
            store.as_ref().map_or(Ok(()), |s| s.save_batch(name, group))
        })?;
        for id in &ids {
            self.events.emit(&QueueEvent::MessageEnqueued {
                queue: name.to_owned(),
                id: *id,
            });
        }
        Ok(ids)
    }

    /// Stamps id, queue name, creation time, and expiry; rejects a
    /// caller-supplied expiry that already passed.
    fn normalize(
        &self,
        message: &mut Message,
        queue_name: &str,
        config: &QueueConfig,
    ) -> QueueResult<()> {
        let now = now_millis();
        if message.header.created_ms == 0 {
            message.header.created_ms = now;
        }
        if message.header.expire_ms != 0 && message.header.expire_ms < now {
            return Err(QueueError::InvalidParameter(format!(
                "expiry {} is in the past",
                message.header.expire_ms
            )));
        }
        if message.header.expire_ms == 0 && config.message_ttl_ms > 0 {
            message.header.expire_ms = now + config.message_ttl_ms;
        }
        if message.header.id == 0 {
            message.header.id = self.next_id();
        }
        message.header.queue = queue_name.to_owned();
        message.status = MessageStatus::Pending;
        Ok(())
    }

    // --- Consumer ---

    /// Blocks up to `timeout` for the next deliverable message.
    pub fn receive_message(
        &self,
        name: &str,
        timeout: Duration,
        consumer: &str,
    ) -> QueueResult<Message> {
        let deadline = Instant::now() + timeout;
        loop {
            let queue = self.queue(name)?;
            match queue.await_message(deadline, consumer) {
                AwaitOutcome::Delivered { message, dead } => {
                    for letter in dead {
                        self.route_dead_letter(letter);
                    }
                    self.events.emit(&QueueEvent::MessageDelivered {
                        queue: name.to_owned(),
                        id: message.header.id,
                        consumer: consumer.to_owned(),
                    });
                    return Ok(*message);
                }
                AwaitOutcome::DeadOnly(dead) => {
                    for letter in dead {
                        self.route_dead_letter(letter);
                    }
                    // Lock released while routing; try again within the
                    // same deadline.
                }
                AwaitOutcome::Closed => {
                    return Err(QueueError::QueueNotFound(name.to_owned()))
                }
                AwaitOutcome::TimedOut => return Err(QueueError::Timeout),
            }
        }
    }

    /// Acknowledges an inflight message and deletes it from persistence.
    pub fn acknowledge(&self, name: &str, id: MessageId) -> QueueResult<()> {
        let queue = self.queue(name)?;
        let message = queue.acknowledge(id)?;
        if let Some(store) = self.persists(&queue.config()) {
            if let Err(err) = store.delete_message(name, message.header.id) {
                warn!(queue = %name, id, error = %err, "failed to delete acked message");
            }
        }
        self.events.emit(&QueueEvent::MessageAcknowledged {
            queue: name.to_owned(),
            id,
        });
        Ok(())
    }

    /// Negatively acknowledges an inflight message.
    pub fn negative_acknowledge(
        &self,
        name: &str,
        id: MessageId,
        requeue: bool,
    ) -> QueueResult<()> {
        let queue = self.queue(name)?;
        match queue.negative_acknowledge(id, requeue)? {
            NackOutcome::Scheduled { eligible_at_ms } => {
                debug!(queue = %name, id, eligible_at_ms, "retry scheduled");
                Ok(())
            }
            NackOutcome::Dead(letter) => {
                self.route_dead_letter(*letter);
                Ok(())
            }
        }
    }

    // --- Staged (transaction) support ---

    /// Makes a staged message visible and rewrites its persisted record
    /// with the flipped commit marker.
    pub fn release_staged(&self, name: &str, id: MessageId) -> QueueResult<()> {
        let queue = self.queue(name)?;
        let released = queue.release_staged(id)?;
        if let Some(store) = self.persists(&queue.config()) {
            store.save_message(name, &released)?;
        }
        self.events.emit(&QueueEvent::MessageEnqueued {
            queue: name.to_owned(),
            id,
        });
        Ok(())
    }

    /// Discards a staged message and its persisted record.
    pub fn discard_staged(&self, name: &str, id: MessageId) -> QueueResult<()> {
        let queue = self.queue(name)?;
        let discarded = queue.discard_staged(id)?;
        if let Some(store) = self.persists(&queue.config()) {
            let _ = store.delete_message(name, discarded.header.id);
        }
        Ok(())
    }

    // --- Dead-letter routing ---

    /// Routes one dead message to its target queue, or finishes dropping
    /// it. Runs with no queue locks held.
    pub fn route_dead_letter(&self, letter: DeadLetter) {
        let origin_queue = letter.message.header.queue.clone();
        let origin_id = letter.message.header.id;

        // The original record, whatever its state, is done.
        if let Some(store) = &self.store {
            let _ = store.delete_message(&origin_queue, origin_id);
        }

        let routed = letter.target.as_ref().is_some_and(|t| self.contains(&t.queue));
        self.events.emit(&QueueEvent::MessageDeadLettered {
            queue: origin_queue.clone(),
            id: origin_id,
            reason: letter.reason.as_str(),
            routed,
        });

        let Some(target) = letter.target else {
            debug!(queue = %origin_queue, id = origin_id, reason = letter.reason.as_str(),
                   "message dropped (no dead-letter target)");
            return;
        };
        let Ok(dlq) = self.queue(&target.queue) else {
            warn!(queue = %origin_queue, target = %target.queue,
                  "dead-letter target does not exist; message dropped");
            return;
        };

        let now = now_millis();
        let original = letter.message;
        let mut props = original.header.properties.clone();
        props.insert(
            properties::DEAD_LETTER_REASON.into(),
            letter.reason.as_str().into(),
        );
        props.insert(
            properties::DEAD_LETTER_ORIGIN_QUEUE.into(),
            origin_queue.clone(),
        );
        props.insert(
            properties::DEAD_LETTER_ORIGIN_ID.into(),
            origin_id.to_string(),
        );
        props.insert(
            properties::DEAD_LETTER_ORIGIN_TIMESTAMP.into(),
            original.header.created_ms.to_string(),
        );
        let copy = Message {
            header: MessageHeader {
                id: self.next_id(),
                queue: target.queue.clone(),
                message_type: original.header.message_type,
                priority: original.header.priority,
                delivery: original.header.delivery,
                flags: original.header.flags,
                created_ms: now,
                expire_ms: if target.ttl_ms > 0 { now + target.ttl_ms } else { 0 },
                retry_count: 0,
                max_retries: original.header.max_retries,
                properties: props,
            },
            status: MessageStatus::Pending,
            payload: original.payload.clone(),
        };
        let dlq_config = dlq.config();
        let store = self.persists(&dlq_config);
        let result = dlq.accept(copy, false, |m| {
            store
                .as_ref()
                .map_or(Ok(()), |s| s.save_message(&target.queue, m))
        });
        match result {
            Ok(AcceptOutcome::Accepted) => {
                debug!(from = %origin_queue, to = %target.queue, id = origin_id,
                       reason = letter.reason.as_str(), "message dead-lettered");
            }
            Ok(AcceptOutcome::Overflow(_)) | Err(_) => {
                warn!(from = %origin_queue, to = %target.queue, id = origin_id,
                      "dead-letter target rejected the message; dropped");
            }
        }
    }

    // --- Maintenance ---

    /// One pass over all queues: visibility timeouts, retry promotion,
    /// pending expiry. Dead messages are routed after each queue's lock is
    /// released.
    pub fn sweep(&self, now_ms: u64) -> SweepReport {
        let queues: Vec<Arc<Queue>> = self.queues.iter().map(|e| Arc::clone(e.value())).collect();
        let mut report = SweepReport::default();
        for queue in queues {
            let SweepOutcome {
                dead,
                promoted,
                visibility_expired,
            } = queue.sweep(now_ms);
            report.promoted += promoted;
            report.visibility_expired += visibility_expired;
            report.dead_lettered += dead.len();
            for letter in dead {
                self.route_dead_letter(letter);
            }
        }
        report
    }

    /// Persists every queue's configuration and current totals.
    pub fn flush_metadata(&self) {
        let Some(store) = &self.store else { return };
        for entry in &self.queues {
            let queue = entry.value();
            if let Err(err) = store.save_queue(&queue.config(), &queue.stats()) {
                warn!(queue = %queue.name(), error = %err, "failed to flush queue metadata");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use quiver_core::QueueStats;

    use super::*;
    use crate::persistence::MemoryStore;

    fn harness() -> QueueStore {
        let store: Arc<dyn MessageStore> = Arc::new(MemoryStore::new());
        store.initialize().unwrap();
        QueueStore::new(Some(store), Arc::new(ListenerRegistry::new()))
    }

    fn disk_config(name: &str) -> QueueConfig {
        QueueConfig {
            persistence: PersistenceMode::DiskPersistent,
            ..QueueConfig::named(name)
        }
    }

    #[test]
    fn create_list_delete() {
        let queues = harness();
        queues.create_queue(QueueConfig::named("a")).unwrap();
        queues.create_queue(QueueConfig::named("b")).unwrap();
        assert!(matches!(
            queues.create_queue(QueueConfig::named("a")),
            Err(QueueError::QueueAlreadyExists(_))
        ));
        assert_eq!(queues.list_queues(), vec!["a".to_string(), "b".to_string()]);

        queues.delete_queue("a").unwrap();
        assert!(matches!(
            queues.delete_queue("a"),
            Err(QueueError::QueueNotFound(_))
        ));
        assert_eq!(queues.list_queues(), vec!["b".to_string()]);
    }

    #[test]
    fn empty_name_is_invalid() {
        let queues = harness();
        assert!(matches!(
            queues.create_queue(QueueConfig::default()),
            Err(QueueError::InvalidParameter(_))
        ));
    }

    #[test]
    fn send_receive_ack_round_trip() {
        let queues = harness();
        queues.create_queue(disk_config("q")).unwrap();
        let id = queues.send_message("q", Message::text("hello")).unwrap();
        assert!(id > 0);

        let msg = queues
            .receive_message("q", Duration::from_millis(200), "c1")
            .unwrap();
        assert_eq!(msg.header.id, id);
        assert_eq!(msg.payload.as_ref(), b"hello");

        queues.acknowledge("q", id).unwrap();
        assert_eq!(queues.queue_info("q").unwrap().stats.current_count(), 0);
    }

    #[test]
    fn message_ids_are_unique_and_increasing() {
        let queues = harness();
        queues.create_queue(QueueConfig::named("q")).unwrap();
        let mut last = 0;
        for _ in 0..100 {
            let id = queues.send_message("q", Message::text("m")).unwrap();
            assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn past_expiry_is_rejected() {
        let queues = harness();
        queues.create_queue(QueueConfig::named("q")).unwrap();
        let msg = Message::text("old").with_expiry(now_millis().saturating_sub(5_000));
        assert!(matches!(
            queues.send_message("q", msg),
            Err(QueueError::InvalidParameter(_))
        ));
    }

    #[test]
    fn receive_from_missing_queue_fails_fast() {
        let queues = harness();
        assert!(matches!(
            queues.receive_message("ghost", Duration::from_millis(10), "c"),
            Err(QueueError::QueueNotFound(_))
        ));
    }

    #[test]
    fn nack_exhaustion_lands_in_dead_letter_queue() {
        let queues = harness();
        queues.create_queue(QueueConfig::named("q.dead")).unwrap();
        let config = QueueConfig {
            max_retries: 1,
            retry_delay_ms: 0,
            enable_dead_letter: true,
            dead_letter_queue: "q.dead".into(),
            ..QueueConfig::named("q")
        };
        queues.create_queue(config).unwrap();

        let id = queues.send_message("q", Message::text("x")).unwrap();
        let msg = queues
            .receive_message("q", Duration::from_millis(200), "c")
            .unwrap();
        queues.negative_acknowledge("q", msg.header.id, true).unwrap();

        // Wait for the zero-delay retry to become deliverable.
        let msg = queues
            .receive_message("q", Duration::from_millis(500), "c")
            .unwrap();
        queues.negative_acknowledge("q", msg.header.id, true).unwrap();

        let dead = queues
            .receive_message("q.dead", Duration::from_millis(200), "c")
            .unwrap();
        assert_eq!(dead.payload.as_ref(), b"x");
        assert_eq!(dead.property(properties::DEAD_LETTER_REASON), Some("MAX_RETRIES"));
        assert_eq!(
            dead.property(properties::DEAD_LETTER_ORIGIN_QUEUE),
            Some("q")
        );
        assert_eq!(
            dead.property(properties::DEAD_LETTER_ORIGIN_ID).unwrap(),
            id.to_string()
        );
    }

    #[test]
    fn overflow_with_dead_letter_goes_to_target() {
        let queues = harness();
        queues.create_queue(QueueConfig::named("spill")).unwrap();
        let config = QueueConfig {
            max_size: 1,
            enable_dead_letter: true,
            dead_letter_queue: "spill".into(),
            ..QueueConfig::named("q")
        };
        queues.create_queue(config).unwrap();

        queues.send_message("q", Message::text("first")).unwrap();
        queues.send_message("q", Message::text("second")).unwrap();

        let spilled = queues
            .receive_message("spill", Duration::from_millis(200), "c")
            .unwrap();
        assert_eq!(spilled.payload.as_ref(), b"second");
        assert_eq!(spilled.property(properties::DEAD_LETTER_REASON), Some("OVERFLOW"));
    }

    #[test]
    fn batch_send_assigns_contiguous_ids() {
        let queues = harness();
        queues.create_queue(disk_config("q")).unwrap();
        let ids = queues
            .send_batch("q", (0..5).map(|i| Message::text(format!("b{i}"))).collect())
            .unwrap();
        for window in ids.windows(2) {
            assert_eq!(window[1], window[0] + 1);
        }
        for i in 0..5 {
            let msg = queues
                .receive_message("q", Duration::from_millis(200), "c")
                .unwrap();
            assert_eq!(msg.payload.as_ref(), format!("b{i}").as_bytes());
        }
    }

    #[test]
    fn recovery_rebuilds_pending_in_order() {
        let store: Arc<dyn MessageStore> = Arc::new(MemoryStore::new());
        store.initialize().unwrap();
        {
            let queues = QueueStore::new(Some(Arc::clone(&store)), Arc::new(ListenerRegistry::new()));
            queues.create_queue(disk_config("q")).unwrap();
            for i in 0..10 {
                queues.send_message("q", Message::text(format!("m{i}"))).unwrap();
            }
        }

        let queues = QueueStore::new(Some(Arc::clone(&store)), Arc::new(ListenerRegistry::new()));
        queues.recover().unwrap();
        assert_eq!(queues.list_queues(), vec!["q".to_string()]);
        for i in 0..10 {
            let msg = queues
                .receive_message("q", Duration::from_millis(200), "c")
                .unwrap();
            assert_eq!(msg.payload.as_ref(), format!("m{i}").as_bytes());
        }
    }

    #[test]
    fn recovery_discards_uncommitted_staged_messages() {
        let store: Arc<dyn MessageStore> = Arc::new(MemoryStore::new());
        store.initialize().unwrap();
        {
            let queues = QueueStore::new(Some(Arc::clone(&store)), Arc::new(ListenerRegistry::new()));
            queues.create_queue(disk_config("q")).unwrap();
            let mut staged = Message::text("phantom");
            staged.set_property(properties::TRANSACTION_COMMITTED, "false");
            queues.send_staged("q", staged).unwrap();
            queues.send_message("q", Message::text("real")).unwrap();
        }

        let queues = QueueStore::new(Some(Arc::clone(&store)), Arc::new(ListenerRegistry::new()));
        queues.recover().unwrap();
        let msg = queues
            .receive_message("q", Duration::from_millis(200), "c")
            .unwrap();
        assert_eq!(msg.payload.as_ref(), b"real");
        assert!(matches!(
            queues.receive_message("q", Duration::from_millis(50), "c"),
            Err(QueueError::Timeout)
        ));
    }

    #[test]
    fn recovered_ids_never_reuse() {
        let store: Arc<dyn MessageStore> = Arc::new(MemoryStore::new());
        store.initialize().unwrap();
        let highest = {
            let queues = QueueStore::new(Some(Arc::clone(&store)), Arc::new(ListenerRegistry::new()));
            queues.create_queue(disk_config("q")).unwrap();
            let mut highest = 0;
            for _ in 0..5 {
                highest = queues.send_message("q", Message::text("m")).unwrap();
            }
            highest
        };

        let queues = QueueStore::new(Some(Arc::clone(&store)), Arc::new(ListenerRegistry::new()));
        queues.recover().unwrap();
        let next = queues.send_message("q", Message::text("new")).unwrap();
        assert!(next > highest);
    }

    #[test]
    fn purge_reports_count_and_empties_persistence() {
        let queues = harness();
        queues.create_queue(disk_config("q")).unwrap();
        for _ in 0..4 {
            queues.send_message("q", Message::text("m")).unwrap();
        }
        assert_eq!(queues.purge_queue("q").unwrap(), 4);
        assert!(matches!(
            queues.receive_message("q", Duration::from_millis(30), "c"),
            Err(QueueError::Timeout)
        ));
    }

    #[test]
    fn stats_survive_via_flush_metadata() {
        let store: Arc<dyn MessageStore> = Arc::new(MemoryStore::new());
        store.initialize().unwrap();
        {
            let queues = QueueStore::new(Some(Arc::clone(&store)), Arc::new(ListenerRegistry::new()));
            queues.create_queue(disk_config("q")).unwrap();
            queues.send_message("q", Message::text("m")).unwrap();
            queues.flush_metadata();
        }
        let (_, stats): (QueueConfig, QueueStats) = store.load_queue("q").unwrap();
        assert_eq!(stats.total_sent, 1);
    }
}
