//! File-backed [`MessageStore`]: append-only message log, write-through
//! queue metadata file, and an in-memory index snapshotted to disk.
//!
//! Layout under the data directory:
//!
//! - `queue_data.bin` -- concatenated queue-metadata records, rewritten on
//!   every queue save so configurations survive an abrupt kill
//! - `messages.bin` -- append-only `{u32 len, record}` stream
//! - `index.bin` -- index snapshot, written at shutdown and after
//!   compaction
//!
//! Recovery loads the index snapshot, then scans any log tail the snapshot
//! does not cover. A crash between append and index write therefore loses
//! nothing; a crash after a delete may resurrect the deleted record, which
//! at-least-once delivery permits.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use ahash::AHashMap;
use parking_lot::{Mutex, MutexGuard, RwLock};
use quiver_core::codec::{self, MAX_PAYLOAD_LEN};
use quiver_core::types::{now_millis, MessageId, MessageStatus};
use quiver_core::{Message, QueueConfig, QueueError, QueueResult, QueueStats};
use tracing::{debug, info, warn};

use super::index::{IndexEntry, MessageIndex};
use super::stats::{PersistenceStats, PersistenceStatsSnapshot};
use super::{MessageStore, PersistenceSettings};
use crate::substrate::MemoryPool;

/// Upper bound on a single log record body, length prefix excluded.
const MAX_RECORD_LEN: usize = MAX_PAYLOAD_LEN + (4 << 20);

struct QueueMetaRecord {
    config: QueueConfig,
    stats: QueueStats,
    dirty: bool,
}

struct LogFile {
    file: File,
    len: u64,
}

/// File-backed message store.
///
/// Lock order within the store: index before log file, matching the
/// engine-wide order (registry, queue, persistence index, persistence
/// file). Queue metadata has its own lock and is never held across the
/// other two.
pub struct FileStore {
    settings: PersistenceSettings,
    initialized: AtomicBool,
    index: RwLock<MessageIndex>,
    queues: RwLock<AHashMap<String, QueueMetaRecord>>,
    log: Mutex<Option<LogFile>>,
    metrics: PersistenceStats,
    pool: Option<Arc<MemoryPool>>,
}

impl FileStore {
    /// Creates a store over the given settings. Nothing touches the disk
    /// until [`initialize`](MessageStore::initialize).
    #[must_use]
    pub fn new(settings: PersistenceSettings) -> Self {
        Self {
            settings,
            initialized: AtomicBool::new(false),
            index: RwLock::new(MessageIndex::new()),
            queues: RwLock::new(AHashMap::new()),
            log: Mutex::new(None),
            metrics: PersistenceStats::new(),
            pool: None,
        }
    }

    /// Same, with read buffers leased from the given pool.
    #[must_use]
    pub fn with_pool(settings: PersistenceSettings, pool: Arc<MemoryPool>) -> Self {
        Self {
            pool: Some(pool),
            ..Self::new(settings)
        }
    }

    fn queue_data_path(&self) -> PathBuf {
        self.settings.data_dir.join(&self.settings.queue_data_file)
    }

    fn message_data_path(&self) -> PathBuf {
        self.settings.data_dir.join(&self.settings.message_data_file)
    }

    fn index_path(&self) -> PathBuf {
        self.settings.data_dir.join(&self.settings.index_file)
    }

    fn ensure_initialized(&self) -> QueueResult<()> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(QueueError::InvalidState("store not initialized".into()))
        }
    }

    /// Runs a file operation, retrying once after a short delay.
    ///
    /// Transient filesystem hiccups get a second chance; a second failure
    /// surfaces as `PERSISTENCE_FAILED`.
    fn with_retry<T>(
        &self,
        what: &str,
        mut op: impl FnMut() -> io::Result<T>,
    ) -> QueueResult<T> {
        match op() {
            Ok(value) => Ok(value),
            Err(first) => {
                warn!(what, error = %first, "file operation failed, retrying once");
                std::thread::sleep(std::time::Duration::from_millis(
                    self.settings.retry_delay_ms,
                ));
                op().map_err(|second| {
                    QueueError::PersistenceFailed(format!("{what}: {second}"))
                })
            }
        }
    }

    fn locked_log<'a>(
        guard: &'a mut MutexGuard<'_, Option<LogFile>>,
    ) -> QueueResult<&'a mut LogFile> {
        guard
            .as_mut()
            .ok_or_else(|| QueueError::InvalidState("message log is closed".into()))
    }

    /// Appends one length-prefixed record, returning its start offset.
    ///
    /// On failure the file is truncated back so a partial record never
    /// survives into the next append.
    fn append_record(log: &mut LogFile, data: &[u8]) -> io::Result<u64> {
        let offset = log.len;
        let result = (|| {
            log.file.seek(SeekFrom::Start(offset))?;
            let len = u32::try_from(data.len())
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "record too large"))?;
            log.file.write_all(&len.to_le_bytes())?;
            log.file.write_all(data)?;
            log.file.flush()
        })();
        match result {
            Ok(()) => {
                log.len = offset + 4 + data.len() as u64;
                Ok(offset)
            }
            Err(err) => {
                // Drop any partial tail so the log stays well-formed.
                let _ = log.file.set_len(offset);
                log.len = offset;
                Err(err)
            }
        }
    }

    /// Reads the record at `offset`, verifying its length against `size`.
    fn read_record(&self, log: &mut LogFile, offset: u64, size: u64) -> QueueResult<Message> {
        let body = self.with_retry("read message record", || {
            log.file.seek(SeekFrom::Start(offset))?;
            let mut prefix = [0u8; 4];
            log.file.read_exact(&mut prefix)?;
            let len = u32::from_le_bytes(prefix) as usize;
            if len as u64 != size || len > MAX_RECORD_LEN {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("record length {len} does not match index size {size}"),
                ));
            }
            if let Some(pool) = &self.pool {
                let mut buf = pool
                    .allocate(len)
                    .map_err(|e| io::Error::new(io::ErrorKind::OutOfMemory, e.to_string()))?;
                let result = log.file.read_exact(buf.as_mut_slice());
                match result {
                    Ok(()) => {
                        let data = buf.as_slice().to_vec();
                        pool.deallocate(buf);
                        Ok(data)
                    }
                    Err(err) => {
                        pool.deallocate(buf);
                        Err(err)
                    }
                }
            } else {
                let mut data = vec![0u8; len];
                log.file.read_exact(&mut data)?;
                Ok(data)
            }
        })?;
        codec::decode_message(&body).map_err(QueueError::from)
    }

    /// Scans the log from `start`, indexing every well-formed record.
    ///
    /// Returns the number of records indexed. Stops quietly at a clean end
    /// of file and with a warning at a torn or corrupt record; either way
    /// the index keeps what was scanned.
    fn scan_log_from(index: &mut MessageIndex, log: &mut LogFile, start: u64) -> u64 {
        let mut offset = start;
        let mut indexed = 0u64;
        while offset < log.len {
            if log.file.seek(SeekFrom::Start(offset)).is_err() {
                warn!(offset, "log scan: seek failed, stopping");
                break;
            }
            let mut prefix = [0u8; 4];
            if log.file.read_exact(&mut prefix).is_err() {
                warn!(offset, "log scan: torn length prefix, stopping");
                break;
            }
            let len = u32::from_le_bytes(prefix) as usize;
            if len > MAX_RECORD_LEN || offset + 4 + len as u64 > log.len {
                warn!(offset, len, "log scan: implausible record length, stopping");
                break;
            }
            let mut body = vec![0u8; len];
            if log.file.read_exact(&mut body).is_err() {
                warn!(offset, "log scan: torn record body, stopping");
                break;
            }
            match codec::decode_message(&body) {
                Ok(message) => {
                    let tombstone = matches!(
                        message.status,
                        MessageStatus::Acked | MessageStatus::Dead
                    );
                    index.insert(
                        &message.header.queue,
                        message.header.id,
                        IndexEntry {
                            offset,
                            size: len as u64,
                            timestamp_ms: message.header.created_ms,
                            tombstone,
                        },
                    );
                    indexed += 1;
                }
                Err(err) => {
                    warn!(offset, error = %err, "log scan: corrupt record, stopping");
                    break;
                }
            }
            offset += 4 + len as u64;
        }
        indexed
    }

    /// Highest byte of the log covered by the index.
    fn indexed_extent(index: &MessageIndex) -> u64 {
        let mut extent = 0u64;
        index.for_each(|_, _, entry| {
            extent = extent.max(entry.offset + 4 + entry.size);
        });
        extent
    }

    fn write_index_file(&self, index: &MessageIndex) -> QueueResult<()> {
        let encoded = index.encode();
        self.with_retry("write index file", || fs::write(self.index_path(), &encoded))
    }

    /// Rewrites the queue metadata file from the in-memory table and clears
    /// dirty flags.
    fn flush_queue_metadata(&self) -> QueueResult<()> {
        let mut queues = self.queues.write();
        let mut data = Vec::with_capacity(queues.len() * 192);
        for record in queues.values() {
            data.extend_from_slice(&codec::encode_queue_record(
                &record.config,
                &record.stats,
                record.dirty,
            ));
        }
        self.with_retry("write queue metadata", || {
            fs::write(self.queue_data_path(), &data)
        })?;
        for record in queues.values_mut() {
            record.dirty = false;
        }
        Ok(())
    }

    fn copy_file_if_exists(from: &Path, to: &Path) -> io::Result<()> {
        if from.exists() {
            fs::copy(from, to)?;
        }
        Ok(())
    }
}

impl MessageStore for FileStore {
    fn initialize(&self) -> QueueResult<()> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        info!(dir = %self.settings.data_dir.display(), "initializing file store");

        self.with_retry("create data directory", || {
            fs::create_dir_all(&self.settings.data_dir)
        })?;

        let file = self.with_retry("open message log", || {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(self.message_data_path())
        })?;
        let len = self
            .with_retry("stat message log", || file.metadata())?
            .len();

        // Queue metadata: concatenated records, partial tails tolerated.
        if let Ok(data) = fs::read(self.queue_data_path()) {
            let (records, err) = codec::decode_queue_records(&data);
            if let Some(err) = err {
                warn!(error = %err, "queue metadata file partially unreadable");
            }
            let mut queues = self.queues.write();
            for (config, stats, dirty) in records {
                queues.insert(
                    config.name.clone(),
                    QueueMetaRecord {
                        config,
                        stats,
                        dirty,
                    },
                );
            }
        }

        // Index snapshot plus a tail scan for records appended after the
        // snapshot was written.
        let load = MessageIndex::decode(&fs::read(self.index_path()).unwrap_or_default());
        if let Some(warning) = &load.warning {
            warn!(warning, "index file incomplete, keeping partial index");
        }
        let mut index = load.index;
        {
            let mut log = LogFile { file, len };
            let extent = Self::indexed_extent(&index);
            if extent < log.len {
                let recovered = Self::scan_log_from(&mut index, &mut log, extent);
                if recovered > 0 {
                    info!(recovered, from = extent, "recovered unindexed log tail");
                }
            }
            *self.log.lock() = Some(log);
        }
        *self.index.write() = index;

        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    fn shutdown(&self) {
        if !self.initialized.swap(false, Ordering::AcqRel) {
            return;
        }
        debug!("shutting down file store");
        if let Err(err) = self.write_index_file(&self.index.read()) {
            warn!(error = %err, "failed to write index at shutdown");
        }
        if let Err(err) = self.flush_queue_metadata() {
            warn!(error = %err, "failed to flush queue metadata at shutdown");
        }
        if let Some(log) = self.log.lock().take() {
            let _ = log.file.sync_all();
        }
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn save_queue(&self, config: &QueueConfig, stats: &QueueStats) -> QueueResult<()> {
        self.ensure_initialized()?;
        self.queues.write().insert(
            config.name.clone(),
            QueueMetaRecord {
                config: config.clone(),
                stats: *stats,
                dirty: true,
            },
        );
        // Write-through: queue configurations must survive an abrupt kill.
        self.flush_queue_metadata()
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
        if !removed {
            return Err(QueueError::QueueNotFound(name.into()));
        }
        self.index.write().remove_queue(name);
        self.flush_queue_metadata()
    }

    fn list_queues(&self) -> Vec<String> {
        self.queues.read().keys().cloned().collect()
    }

    fn save_message(&self, queue: &str, message: &Message) -> QueueResult<()> {
        self.ensure_initialized()?;
        let started = Instant::now();
        let data = codec::encode_message(message);

        let mut index = self.index.write();
        let mut log_guard = self.log.lock();
        let log = Self::locked_log(&mut log_guard)?;
        let offset =
            self.with_retry("append message record", || Self::append_record(log, &data))?;
        index.insert(
            queue,
            message.header.id,
            IndexEntry {
                offset,
                size: data.len() as u64,
                timestamp_ms: now_millis(),
                tombstone: false,
            },
        );
        drop(log_guard);
        drop(index);

        self.metrics
            .record_write(u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX));
        Ok(())
    }

    fn load_message(&self, queue: &str, id: MessageId) -> QueueResult<Message> {
        self.ensure_initialized()?;
        let started = Instant::now();
        let entry = self
            .index
            .read()
            .get(queue, id)
            .filter(|entry| !entry.tombstone)
            .ok_or(QueueError::MessageNotFound(id))?;

        let mut log_guard = self.log.lock();
        let log = Self::locked_log(&mut log_guard)?;
        let message = self.read_record(log, entry.offset, entry.size)?;
        drop(log_guard);

        self.metrics
            .record_read(u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX));
        Ok(message)
    }

    fn delete_message(&self, queue: &str, id: MessageId) -> QueueResult<()> {
        self.ensure_initialized()?;
        if self.index.write().tombstone(queue, id) {
            Ok(())
        } else {
            Err(QueueError::MessageNotFound(id))
        }
    }

    fn save_batch(&self, queue: &str, messages: &[Message]) -> QueueResult<()> {
        self.ensure_initialized()?;
        if messages.is_empty() {
            return Ok(());
        }
        let started = Instant::now();
        let encoded: Vec<_> = messages.iter().map(codec::encode_message).collect();

        let mut index = self.index.write();
        let mut log_guard = self.log.lock();
        let log = Self::locked_log(&mut log_guard)?;
        let start_len = log.len;

        let mut entries = Vec::with_capacity(encoded.len());
        for (message, data) in messages.iter().zip(&encoded) {
            match Self::append_record(log, data) {
                Ok(offset) => entries.push((message.header.id, offset, data.len() as u64)),
                Err(err) => {
                    // All-or-nothing: wind the log back and index nothing.
                    let _ = log.file.set_len(start_len);
                    log.len = start_len;
                    return Err(QueueError::PersistenceFailed(format!(
                        "batch append: {err}"
                    )));
                }
            }
        }
        let timestamp_ms = now_millis();
        for (id, offset, size) in entries {
            index.insert(
                queue,
                id,
                IndexEntry {
                    offset,
                    size,
                    timestamp_ms,
                    tombstone: false,
                },
            );
        }
        drop(log_guard);
        drop(index);

        self.metrics
            .record_write(u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX));
        Ok(())
    }

    fn load_all_messages(&self, queue: &str) -> QueueResult<Vec<Message>> {
        self.ensure_initialized()?;
        let started = Instant::now();
        let entries = self.index.read().live_entries_sorted(queue);

        let mut log_guard = self.log.lock();
        let log = Self::locked_log(&mut log_guard)?;
        let mut messages = Vec::with_capacity(entries.len());
        for (id, entry) in entries {
            match self.read_record(log, entry.offset, entry.size) {
                Ok(message) => messages.push(message),
                Err(err) => {
                    // Skip the corrupt record; everything else stays usable.
                    warn!(queue, id, error = %err, "skipping unreadable message record");
                }
            }
        }
        drop(log_guard);

        self.metrics
            .record_read(u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX));
        Ok(messages)
    }

    fn rebuild_index(&self) -> QueueResult<()> {
        self.ensure_initialized()?;
        let mut index = self.index.write();
        let mut log_guard = self.log.lock();
        let log = Self::locked_log(&mut log_guard)?;
        index.clear();
        let indexed = Self::scan_log_from(&mut index, log, 0);
        info!(indexed, "index rebuilt from message log");
        drop(log_guard);
        self.write_index_file(&index)
    }

    fn compact(&self) -> QueueResult<()> {
        self.ensure_initialized()?;
        let mut index = self.index.write();
        let mut log_guard = self.log.lock();
        let log = Self::locked_log(&mut log_guard)?;

        // Collect live entries ordered by file position so the new log
        // preserves append order.
        let mut live: Vec<(String, MessageId, IndexEntry)> = Vec::new();
        index.for_each(|queue, id, entry| {
            if !entry.tombstone {
                live.push((queue.to_owned(), id, *entry));
            }
        });
        live.sort_unstable_by_key(|(_, _, entry)| entry.offset);

        let compact_path = self.message_data_path().with_extension("bin.compact");
        let reclaimed = {
            let file = self.with_retry("create compact file", || {
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&compact_path)
            })?;
            let mut new_log = LogFile { file, len: 0 };

            let mut moved = Vec::with_capacity(live.len());
            for (queue, id, entry) in &live {
                let message = self.read_record(log, entry.offset, entry.size)?;
                let data = codec::encode_message(&message);
                let offset = self.with_retry("append compacted record", || {
                    Self::append_record(&mut new_log, &data)
                })?;
                moved.push((queue.clone(), *id, offset, data.len() as u64, entry.timestamp_ms));
            }
            self.with_retry("sync compact file", || new_log.file.sync_all())?;

            let old_len = log.len;
            // Atomic swap: rename over the live log, then reopen.
            self.with_retry("swap compacted log", || {
                fs::rename(&compact_path, self.message_data_path())
            })?;
            let file = self.with_retry("reopen message log", || {
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(self.message_data_path())
            })?;
            log.len = new_log.len;
            log.file = file;

            index.clear();
            for (queue, id, offset, size, timestamp_ms) in moved {
                index.insert(
                    &queue,
                    id,
                    IndexEntry {
                        offset,
                        size,
                        timestamp_ms,
                        tombstone: false,
                    },
                );
            }
            old_len.saturating_sub(log.len)
        };
        drop(log_guard);

        info!(reclaimed, "message log compacted");
        self.write_index_file(&index)
    }

    fn backup(&self, path: &Path) -> QueueResult<()> {
        self.ensure_initialized()?;
        self.write_index_file(&self.index.read())?;
        self.flush_queue_metadata()?;
        self.with_retry("create backup directory", || fs::create_dir_all(path))?;
        self.with_retry("copy data files to backup", || {
            for file in [
                &self.settings.queue_data_file,
                &self.settings.message_data_file,
                &self.settings.index_file,
            ] {
                Self::copy_file_if_exists(&self.settings.data_dir.join(file), &path.join(file))?;
            }
            Ok(())
        })
    }

    fn restore(&self, path: &Path) -> QueueResult<()> {
        if self.initialized.load(Ordering::Acquire) {
            return Err(QueueError::InvalidState(
                "restore requires the store to be offline".into(),
            ));
        }
        if !path.is_dir() {
            return Err(QueueError::InvalidParameter(format!(
                "backup path {} is not a directory",
                path.display()
            )));
        }
        self.with_retry("create data directory", || {
            fs::create_dir_all(&self.settings.data_dir)
        })?;
        self.with_retry("copy data files from backup", || {
            for file in [
                &self.settings.queue_data_file,
                &self.settings.message_data_file,
                &self.settings.index_file,
            ] {
                Self::copy_file_if_exists(&path.join(file), &self.settings.data_dir.join(file))?;
            }
            Ok(())
        })
    }

    fn max_message_id(&self) -> MessageId {
        self.index.read().max_id()
    }

    fn persisted_message_count(&self, queue: &str) -> usize {
        self.index.read().live_count(queue)
    }

    fn total_persisted_size(&self) -> u64 {
        self.index.read().total_live_size()
    }

    fn diagnostics(&self) -> Vec<String> {
        let mut lines = vec![
            "store: file".into(),
            format!("data dir: {}", self.settings.data_dir.display()),
        ];
        let log_len = self.log.lock().as_ref().map_or(0, |log| log.len);
        lines.push(format!("message log bytes: {log_len}"));
        let index = self.index.read();
        let mut names = index.queue_names();
        names.sort_unstable();
        for name in names {
            lines.push(format!("queue {name}: {} live records", index.live_count(&name)));
        }
        let snap = self.metrics.snapshot();
        lines.push(format!(
            "writes: {} (avg {:.2} ms), reads: {} (avg {:.2} ms)",
            snap.write_count,
            snap.average_write_ms(),
            snap.read_count,
            snap.average_read_ms()
        ));
        lines
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
    use tempfile::TempDir;

    use super::*;

    fn open_store(dir: &TempDir) -> FileStore {
        let store = FileStore::new(PersistenceSettings::at(dir.path()));
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
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let msg = message("q", 1, "hello");
        store.save_message("q", &msg).unwrap();
        assert_eq!(store.load_message("q", 1).unwrap(), msg);
        assert_eq!(store.persisted_message_count("q"), 1);
    }

    #[test]
    fn initialize_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.initialize().unwrap();
        assert!(store.is_initialized());
    }

    #[test]
    fn tombstoned_message_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
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
    }

    #[test]
    fn recovery_after_clean_shutdown() {
        let dir = TempDir::new().unwrap();
        {
            let store = open_store(&dir);
            store
                .save_queue(&QueueConfig::named("q"), &QueueStats::default())
                .unwrap();
            for id in 1..=3u64 {
                store.save_message("q", &message("q", id, "p")).unwrap();
            }
            store.delete_message("q", 2).unwrap();
            store.shutdown();
        }

        let store = open_store(&dir);
        assert_eq!(store.list_queues(), vec!["q".to_string()]);
        let ids: Vec<MessageId> = store
            .load_all_messages("q")
            .unwrap()
            .iter()
            .map(|m| m.header.id)
            .collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn recovery_after_abrupt_kill_scans_log_tail() {
        let dir = TempDir::new().unwrap();
        {
            let store = open_store(&dir);
            store
                .save_queue(&QueueConfig::named("q"), &QueueStats::default())
                .unwrap();
            for id in 1..=100u64 {
                store
                    .save_message("q", &message("q", id, &format!("m{id}")))
                    .unwrap();
            }
            // No shutdown: the index snapshot is never written, simulating
            // a crash. The queue metadata was written through at save time.
        }

        let store = open_store(&dir);
        assert_eq!(store.list_queues(), vec!["q".to_string()]);
        let messages = store.load_all_messages("q").unwrap();
        assert_eq!(messages.len(), 100);
        for (i, msg) in messages.iter().enumerate() {
            assert_eq!(msg.header.id, i as u64 + 1);
            assert_eq!(msg.payload.as_ref(), format!("m{}", i + 1).as_bytes());
        }
    }

    #[test]
    fn batch_save_indexes_everything() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let batch: Vec<Message> = (1..=5u64).map(|id| message("q", id, "b")).collect();
        store.save_batch("q", &batch).unwrap();
        assert_eq!(store.persisted_message_count("q"), 5);
        assert_eq!(store.load_all_messages("q").unwrap().len(), 5);
    }

    #[test]
    fn compact_reclaims_dead_space_and_preserves_live_records() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        for id in 1..=10u64 {
            store
                .save_message("q", &message("q", id, &"x".repeat(500)))
                .unwrap();
        }
        for id in 1..=9u64 {
            store.delete_message("q", id).unwrap();
        }
        let before = fs::metadata(dir.path().join("messages.bin")).unwrap().len();
        store.compact().unwrap();
        let after = fs::metadata(dir.path().join("messages.bin")).unwrap().len();
        assert!(after < before / 2, "expected compaction to shrink the log");

        let survivors = store.load_all_messages("q").unwrap();
        assert_eq!(survivors.len(), 1);
        assert_eq!(survivors[0].header.id, 10);

        // The store keeps working after the swap.
        store.save_message("q", &message("q", 11, "new")).unwrap();
        assert_eq!(store.load_message("q", 11).unwrap().header.id, 11);
    }

    #[test]
    fn rebuild_index_recovers_from_corrupt_index_file() {
        let dir = TempDir::new().unwrap();
        {
            let store = open_store(&dir);
            for id in 1..=4u64 {
                store.save_message("q", &message("q", id, "p")).unwrap();
            }
            store.shutdown();
        }
        fs::write(dir.path().join("index.bin"), b"garbage").unwrap();

        let store = open_store(&dir);
        store.rebuild_index().unwrap();
        assert_eq!(store.persisted_message_count("q"), 4);
    }

    #[test]
    fn backup_and_restore_round_trip() {
        let data_dir = TempDir::new().unwrap();
        let backup_dir = TempDir::new().unwrap();
        {
            let store = open_store(&data_dir);
            store
                .save_queue(&QueueConfig::named("q"), &QueueStats::default())
                .unwrap();
            store.save_message("q", &message("q", 1, "precious")).unwrap();
            store.backup(backup_dir.path()).unwrap();
            store.shutdown();
        }

        let restored_dir = TempDir::new().unwrap();
        let store = FileStore::new(PersistenceSettings::at(restored_dir.path()));
        store.restore(backup_dir.path()).unwrap();
        store.initialize().unwrap();
        assert_eq!(store.list_queues(), vec!["q".to_string()]);
        assert_eq!(
            store.load_message("q", 1).unwrap().payload.as_ref(),
            b"precious"
        );
    }

    #[test]
    fn restore_refuses_while_online() {
        let dir = TempDir::new().unwrap();
        let backup = TempDir::new().unwrap();
        let store = open_store(&dir);
        assert!(matches!(
            store.restore(backup.path()),
            Err(QueueError::InvalidState(_))
        ));
    }

    #[test]
    fn stats_tick_and_reset() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.save_message("q", &message("q", 1, "x")).unwrap();
        store.load_message("q", 1).unwrap();
        let snap = store.stats();
        assert_eq!(snap.write_count, 1);
        assert_eq!(snap.read_count, 1);
        store.reset_stats();
        assert_eq!(store.stats().write_count, 0);
    }

    #[test]
    fn corrupt_log_tail_is_skipped_on_recovery() {
        let dir = TempDir::new().unwrap();
        {
            let store = open_store(&dir);
            store.save_message("q", &message("q", 1, "good")).unwrap();
            // No shutdown, then a torn append lands in the log.
        }
        {
            let mut file = OpenOptions::new()
                .append(true)
                .open(dir.path().join("messages.bin"))
                .unwrap();
            file.write_all(&[200, 0, 0, 0, 1, 2, 3]).unwrap();
        }

        let store = open_store(&dir);
        let messages = store.load_all_messages("q").unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload.as_ref(), b"good");
    }
}
