//! In-memory [`MessageStore`] implementation.
//!
//! Backs memory-only deployments and tests. Nothing survives a restart,
//! but the full trait surface behaves like the file store: tombstoned
//! messages stay invisible, batch saves are all-or-nothing, and the timing
//! counters tick.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use ahash::AHashMap;
use parking_lot::RwLock;
use quiver_core::types::MessageId;
use quiver_core::{Message, QueueConfig, QueueError, QueueResult, QueueStats};

use super::stats::{PersistenceStats, PersistenceStatsSnapshot};
use super::MessageStore;

#[derive(Clone)]
struct StoredMessage {
    message: Message,
    tombstone: bool,
}

struct QueueRecord {
    config: QueueConfig,
    stats: QueueStats,
}

/// Map-backed message store.
pub struct MemoryStore {
    initialized: AtomicBool,
    queues: RwLock<AHashMap<String, QueueRecord>>,
    messages: RwLock<AHashMap<String, AHashMap<MessageId, StoredMessage>>>,
    metrics: PersistenceStats,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            initialized: AtomicBool::new(false),
            queues: RwLock::new(AHashMap::new()),
            messages: RwLock::new(AHashMap::new()),
            metrics: PersistenceStats::new(),
        }
    }

    fn ensure_initialized(&self) -> QueueResult<()> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(QueueError::InvalidState("store not initialized".into()))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageStore for MemoryStore {
    fn initialize(&self) -> QueueResult<()> {
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    fn shutdown(&self) {
        self.initialized.store(false, Ordering::Release);
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn save_queue(&self, config: &QueueConfig, stats: &QueueStats) -> QueueResult<()> {
        self.ensure_initialized()?;
        self.queues.write().insert(
            config.name.clone(),
            QueueRecord {
                config: config.clone(),
                stats: *stats,
            },
        );
        Ok(())
    }

    fn load_queue(&self, name: &str) -> QueueResult<(QueueConfig, QueueStats)> {
        self.ensure_initialized()?;
        self.queues
            .read()
            .get(name)
            .map(|record| (record.config.clone(), record.stats))
            .ok_or_else(|| QueueError::QueueNotFound(name.into()))
    }

    fn delete_queue(&self, name: &str) -> QueueResult<()> {
        self.ensure_initialized()?;
        let removed = self.queues.write().remove(name).is_some();
        self.messages.write().remove(name);
        if removed {
            Ok(())
        } else {
            Err(QueueError::QueueNotFound(name.into()))
        }
    }

    fn list_queues(&self) -> Vec<String> {
        self.queues.read().keys().cloned().collect()
    }

    fn save_message(&self, queue: &str, message: &Message) -> QueueResult<()> {
        self.ensure_initialized()?;
        self.messages
            .write()
            .entry(queue.to_owned())
            .or_default()
            .insert(
                message.header.id,
                StoredMessage {
                    message: message.clone(),
                    tombstone: false,
                },
            );
        self.metrics.record_write(0);
        Ok(())
    }

    fn load_message(&self, queue: &str, id: MessageId) -> QueueResult<Message> {
        self.ensure_initialized()?;
        let messages = self.messages.read();
        let stored = messages
            .get(queue)
            .and_then(|entries| entries.get(&id))
            .filter(|stored| !stored.tombstone)
            .ok_or(QueueError::MessageNotFound(id))?;
        self.metrics.record_read(0);
        Ok(stored.message.clone())
    }

    fn delete_message(&self, queue: &str, id: MessageId) -> QueueResult<()> {
        self.ensure_initialized()?;
        let mut messages = self.messages.write();
        let stored = messages
            .get_mut(queue)
            .and_then(|entries| entries.get_mut(&id))
            .filter(|stored| !stored.tombstone)
            .ok_or(QueueError::MessageNotFound(id))?;
        stored.tombstone = true;
        Ok(())
    }

    fn save_batch(&self, queue: &str, messages: &[Message]) -> QueueResult<()> {
        self.ensure_initialized()?;
        let mut table = self.messages.write();
        let entries = table.entry(queue.to_owned()).or_default();
        for message in messages {
            entries.insert(
                message.header.id,
                StoredMessage {
                    message: message.clone(),
                    tombstone: false,
                },
            );
        }
        self.metrics.record_write(0);
        Ok(())
    }

    fn load_all_messages(&self, queue: &str) -> QueueResult<Vec<Message>> {
        self.ensure_initialized()?;
        let table = self.messages.read();
        let mut live: Vec<Message> = table
            .get(queue)
            .map(|entries| {
                entries
                    .values()
                    .filter(|stored| !stored.tombstone)
                    .map(|stored| stored.message.clone())
                    .collect()
            })
            .unwrap_or_default();
        live.sort_unstable_by_key(|m| m.header.id);
        self.metrics.record_read(0);
        Ok(live)
    }

    fn rebuild_index(&self) -> QueueResult<()> {
        self.ensure_initialized()
    }

    fn compact(&self) -> QueueResult<()> {
        self.ensure_initialized()?;
        let mut table = self.messages.write();
        for entries in table.values_mut() {
            entries.retain(|_, stored| !stored.tombstone);
        }
        Ok(())
    }

    fn backup(&self, _path: &Path) -> QueueResult<()> {
        Err(QueueError::NotSupported(
            "memory store has nothing durable to back up".into(),
        ))
    }

    fn restore(&self, _path: &Path) -> QueueResult<()> {
        Err(QueueError::NotSupported(
            "memory store has nothing durable to restore".into(),
        ))
    }

    fn max_message_id(&self) -> MessageId {
        self.messages
            .read()
            .values()
            .flat_map(|m| m.keys())
            .copied()
            .max()
            .unwrap_or(0)
    }

    fn persisted_message_count(&self, queue: &str) -> usize {
        self.messages
            .read()
            .get(queue)
            .map_or(0, |entries| entries.values().filter(|s| !s.tombstone).count())
    }

    fn total_persisted_size(&self) -> u64 {
        self.messages
            .read()
            .values()
            .flat_map(|m| m.values())
            .filter(|s| !s.tombstone)
            .map(|s| s.message.size_bytes())
            .sum()
    }

    fn diagnostics(&self) -> Vec<String> {
        let queues = self.queues.read().len();
        let messages: usize = self
            .messages
            .read()
            .values()
            .map(|entries| entries.values().filter(|s| !s.tombstone).count())
            .sum();
        vec![
            "store: memory".into(),
            format!("queues: {queues}"),
            format!("live messages: {messages}"),
        ]
    }

    fn stats(&self) -> PersistenceStatsSnapshot {
        self.metrics.snapshot()
    }

    fn reset_stats(&self) {
        self.metrics.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        let store = MemoryStore::new();
        store.initialize().unwrap();
        store
    }

    fn message(queue: &str, id: MessageId, payload: &str) -> Message {
        let mut msg = Message::text(payload);
        msg.header.id = id;
        msg.header.queue = queue.into();
        msg
    }

    #[test]
    fn save_load_round_trip() {
        let store = store();
        let msg = message("q", 1, "hello");
        store.save_message("q", &msg).unwrap();
        assert_eq!(store.load_message("q", 1).unwrap(), msg);
    }

    #[test]
    fn deleted_messages_become_invisible() {
        let store = store();
        store.save_message("q", &message("q", 1, "x")).unwrap();
        store.delete_message("q", 1).unwrap();
        assert!(matches!(
            store.load_message("q", 1),
            Err(QueueError::MessageNotFound(1))
        ));
        assert!(matches!(
            store.delete_message("q", 1),
            Err(QueueError::MessageNotFound(1))
        ));
        assert_eq!(store.persisted_message_count("q"), 0);
    }

    #[test]
    fn load_all_is_sorted_by_id() {
        let store = store();
        for id in [3u64, 1, 2] {
            store.save_message("q", &message("q", id, "p")).unwrap();
        }
        let ids: Vec<MessageId> = store
            .load_all_messages("q")
            .unwrap()
            .iter()
            .map(|m| m.header.id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn queue_metadata_crud() {
        let store = store();
        let config = QueueConfig::named("orders");
        store.save_queue(&config, &QueueStats::default()).unwrap();
        assert_eq!(store.list_queues(), vec!["orders".to_string()]);
        let (loaded, _) = store.load_queue("orders").unwrap();
        assert_eq!(loaded, config);

        store.delete_queue("orders").unwrap();
        assert!(matches!(
            store.load_queue("orders"),
            Err(QueueError::QueueNotFound(_))
        ));
    }

    #[test]
    fn uninitialized_store_rejects_operations() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.save_message("q", &message("q", 1, "x")),
            Err(QueueError::InvalidState(_))
        ));
    }

    #[test]
    fn compact_drops_tombstones() {
        let store = store();
        store.save_message("q", &message("q", 1, "x")).unwrap();
        store.save_message("q", &message("q", 2, "y")).unwrap();
        store.delete_message("q", 1).unwrap();
        store.compact().unwrap();
        assert_eq!(store.persisted_message_count("q"), 1);
    }
}
