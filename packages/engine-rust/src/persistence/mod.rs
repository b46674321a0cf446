//! Durable storage of queue metadata and messages.
//!
//! [`MessageStore`] is the persistence seam the rest of the engine talks
//! to. [`FileStore`] is the production implementation: an append-only
//! message log with an in-memory index and a queue metadata file.
//! [`MemoryStore`] backs tests and memory-only deployments.

mod file_store;
mod index;
mod memory;
mod stats;

pub use file_store::FileStore;
pub use index::{IndexEntry, IndexLoad, MessageIndex, INDEX_VERSION};
pub use memory::MemoryStore;
pub use stats::{PersistenceStats, PersistenceStatsSnapshot};

use std::path::{Path, PathBuf};

use quiver_core::types::MessageId;
use quiver_core::{Message, QueueConfig, QueueResult, QueueStats};

/// Engine-level persistence configuration.
#[derive(Debug, Clone)]
pub struct PersistenceSettings {
    /// Directory holding the three data files. Created if absent.
    pub data_dir: PathBuf,
    /// Queue metadata file name.
    pub queue_data_file: String,
    /// Append-only message log file name.
    pub message_data_file: String,
    /// Index file name.
    pub index_file: String,
    /// Delay before the single retry of a transiently failed file operation.
    pub retry_delay_ms: u64,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./quiver-data"),
            queue_data_file: "queue_data.bin".into(),
            message_data_file: "messages.bin".into(),
            index_file: "index.bin".into(),
            retry_delay_ms: 20,
        }
    }
}

impl PersistenceSettings {
    /// Settings rooted at the given directory, defaults otherwise.
    #[must_use]
    pub fn at(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }
}

/// The persistence seam: durable queue metadata and message records with
/// fast lookup by `(queue, id)`.
///
/// Implementations are internally synchronized; all methods take `&self`
/// and are safe for concurrent callers. Used as `Arc<dyn MessageStore>`.
pub trait MessageStore: Send + Sync {
    /// Opens files and loads the index. Idempotent; returns success even if
    /// the index is empty or missing.
    fn initialize(&self) -> QueueResult<()>;

    /// Flushes the index and queue metadata, closes files. Idempotent.
    fn shutdown(&self);

    /// Whether [`initialize`](MessageStore::initialize) has completed.
    fn is_initialized(&self) -> bool;

    // --- Queue metadata ---

    /// Saves (or replaces) a queue's configuration and statistics.
    fn save_queue(&self, config: &QueueConfig, stats: &QueueStats) -> QueueResult<()>;

    /// Loads a queue's configuration and statistics.
    fn load_queue(&self, name: &str) -> QueueResult<(QueueConfig, QueueStats)>;

    /// Deletes a queue's metadata and tombstones all of its messages.
    fn delete_queue(&self, name: &str) -> QueueResult<()>;

    /// Names of all persisted queues.
    fn list_queues(&self) -> Vec<String>;

    // --- Messages ---

    /// Appends one message record and indexes it.
    fn save_message(&self, queue: &str, message: &Message) -> QueueResult<()>;

    /// Reads a live message record back.
    fn load_message(&self, queue: &str, id: MessageId) -> QueueResult<Message>;

    /// Tombstones a message record. Physical reclaim is deferred to
    /// [`compact`](MessageStore::compact).
    fn delete_message(&self, queue: &str, id: MessageId) -> QueueResult<()>;

    /// Appends a group of records under one lock; the index is updated
    /// all-or-nothing.
    fn save_batch(&self, queue: &str, messages: &[Message]) -> QueueResult<()>;

    /// All live messages of a queue, ascending by id. Used at startup.
    fn load_all_messages(&self, queue: &str) -> QueueResult<Vec<Message>>;

    // --- Maintenance ---

    /// Rebuilds the index by scanning the message log. For use when the
    /// index file is corrupt; bounded by the log size.
    fn rebuild_index(&self) -> QueueResult<()>;

    /// Rewrites the message log keeping only live records, swaps it in
    /// atomically, and repoints the index.
    fn compact(&self) -> QueueResult<()>;

    /// Copies the data files to `path`.
    fn backup(&self, path: &Path) -> QueueResult<()>;

    /// Copies data files back from `path`. Only legal before
    /// [`initialize`](MessageStore::initialize).
    fn restore(&self, path: &Path) -> QueueResult<()>;

    // --- Introspection ---

    /// Highest message id ever persisted, tombstoned records included.
    ///
    /// Recovery seeds the id generator above this so ids are never reused.
    fn max_message_id(&self) -> MessageId;

    /// Live persisted records for a queue.
    fn persisted_message_count(&self, queue: &str) -> usize;

    /// Total bytes of live persisted records.
    fn total_persisted_size(&self) -> u64;

    /// Human-readable diagnostic lines for health checks and operators.
    fn diagnostics(&self) -> Vec<String>;

    /// Timing counters snapshot.
    fn stats(&self) -> PersistenceStatsSnapshot;

    /// Zeroes the timing counters.
    fn reset_stats(&self);
}
