//! In-memory message index: `(queue, id) -> (offset, size, timestamp,
//! tombstone)` plus its on-disk encoding.
//!
//! The index file is `{u32 version, u32 queueCount}` followed by, per queue,
//! `{u32 nameLen, name, u32 messageCount, entries...}` where each entry is
//! `{u64 id, u64 offset, u64 size, u64 timestamp, u8 tombstone}`. Loading
//! applies bounded validation and stops at the first short read, keeping
//! whatever parsed before it.

use ahash::AHashMap;
use bytes::{BufMut, Bytes, BytesMut};
use quiver_core::types::MessageId;

/// Current index file format version.
pub const INDEX_VERSION: u32 = 1;
/// Most queues an index file may describe.
pub const MAX_QUEUE_COUNT: u32 = 10_000;
/// Most entries a single queue may carry in the index file.
pub const MAX_MESSAGES_PER_QUEUE: u32 = 100_000;
/// Longest queue name in the index file, bytes.
pub const MAX_QUEUE_NAME_LEN: u32 = 1024;

/// Location and liveness of one persisted message record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// Byte offset of the record's length prefix in the message data file.
    pub offset: u64,
    /// Length of the record body (excluding the length prefix).
    pub size: u64,
    /// Wall-clock ms when the entry was recorded.
    pub timestamp_ms: u64,
    /// Whether the record has been logically deleted.
    pub tombstone: bool,
}

/// Outcome of loading an index file.
#[derive(Debug)]
pub struct IndexLoad {
    /// The parsed index (possibly partial).
    pub index: MessageIndex,
    /// Why the scan stopped early, if it did.
    pub warning: Option<String>,
}

/// The in-memory index over the append-only message data file.
#[derive(Debug, Default)]
pub struct MessageIndex {
    queues: AHashMap<String, AHashMap<MessageId, IndexEntry>>,
}

impl MessageIndex {
    /// An empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the entry for `(queue, id)`.
    pub fn insert(&mut self, queue: &str, id: MessageId, entry: IndexEntry) {
        self.queues.entry(queue.to_owned()).or_default().insert(id, entry);
    }

    /// Looks up the entry for `(queue, id)`.
    #[must_use]
    pub fn get(&self, queue: &str, id: MessageId) -> Option<IndexEntry> {
        self.queues.get(queue).and_then(|entries| entries.get(&id)).copied()
    }

    /// Marks `(queue, id)` tombstoned. Returns `false` if the entry is
    /// missing or already tombstoned.
    pub fn tombstone(&mut self, queue: &str, id: MessageId) -> bool {
        if let Some(entry) = self.queues.get_mut(queue).and_then(|e| e.get_mut(&id)) {
            if !entry.tombstone {
                entry.tombstone = true;
                return true;
            }
        }
        false
    }

    /// Removes every entry for `queue`.
    pub fn remove_queue(&mut self, queue: &str) {
        self.queues.remove(queue);
    }

    /// Drops all entries.
    pub fn clear(&mut self) {
        self.queues.clear();
    }

    /// Live (non-tombstoned) entries for `queue`, ascending by id.
    #[must_use]
    pub fn live_entries_sorted(&self, queue: &str) -> Vec<(MessageId, IndexEntry)> {
        let mut entries: Vec<(MessageId, IndexEntry)> = self
            .queues
            .get(queue)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|(_, e)| !e.tombstone)
                    .map(|(&id, &e)| (id, e))
                    .collect()
            })
            .unwrap_or_default();
        entries.sort_unstable_by_key(|&(id, _)| id);
        entries
    }

    /// Live entry count for `queue`.
    #[must_use]
    pub fn live_count(&self, queue: &str) -> usize {
        self.queues
            .get(queue)
            .map_or(0, |entries| entries.values().filter(|e| !e.tombstone).count())
    }

    /// Sum of live record sizes across all queues.
    #[must_use]
    pub fn total_live_size(&self) -> u64 {
        self.queues
            .values()
            .flat_map(|m| m.values())
            .filter(|e| !e.tombstone)
            .map(|e| e.size)
            .sum()
    }

    /// Largest message id present anywhere in the index.
    #[must_use]
    pub fn max_id(&self) -> MessageId {
        self.queues
            .values()
            .flat_map(|m| m.keys())
            .copied()
            .max()
            .unwrap_or(0)
    }

    /// Queue names present in the index.
    #[must_use]
    pub fn queue_names(&self) -> Vec<String> {
        self.queues.keys().cloned().collect()
    }

    /// Iterates every `(queue, id, entry)` triple.
    pub fn for_each(&self, mut f: impl FnMut(&str, MessageId, &IndexEntry)) {
        for (queue, entries) in &self.queues {
            for (&id, entry) in entries {
                f(queue, id, entry);
            }
        }
    }

    /// Serializes the index into its file form.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8 + self.queues.len() * 64);
        buf.put_u32_le(INDEX_VERSION);
        buf.put_u32_le(u32::try_from(self.queues.len()).unwrap_or(u32::MAX));
        for (queue, entries) in &self.queues {
            buf.put_u32_le(u32::try_from(queue.len()).unwrap_or(u32::MAX));
            buf.put_slice(queue.as_bytes());
            buf.put_u32_le(u32::try_from(entries.len()).unwrap_or(u32::MAX));
            for (&id, entry) in entries {
                buf.put_u64_le(id);
                buf.put_u64_le(entry.offset);
                buf.put_u64_le(entry.size);
                buf.put_u64_le(entry.timestamp_ms);
                buf.put_u8(u8::from(entry.tombstone));
            }
        }
        buf.freeze()
    }

    /// Parses an index file with bounded validation.
    ///
    /// Never fails outright: a short read or an out-of-bounds count stops
    /// the scan and the partial index parsed so far is returned, with a
    /// warning describing where the scan stopped. An empty or missing file
    /// parses as an empty index.
    #[must_use]
    pub fn decode(data: &[u8]) -> IndexLoad {
        let mut index = Self::new();
        let mut cursor = Cursor { data, pos: 0 };

        if data.is_empty() {
            return IndexLoad { index, warning: None };
        }
        let Some(version) = cursor.u32() else {
            return IndexLoad {
                index,
                warning: Some("index file shorter than its header".into()),
            };
        };
        if version != INDEX_VERSION {
            return IndexLoad {
                index,
                warning: Some(format!("unsupported index version {version}")),
            };
        }
        let Some(queue_count) = cursor.u32() else {
            return IndexLoad {
                index,
                warning: Some("index file truncated at queue count".into()),
            };
        };
        if queue_count > MAX_QUEUE_COUNT {
            return IndexLoad {
                index,
                warning: Some(format!(
                    "queue count {queue_count} exceeds limit {MAX_QUEUE_COUNT}"
                )),
            };
        }

        for queue_no in 0..queue_count {
            let Some(name_len) = cursor.u32() else {
                return IndexLoad {
                    index,
                    warning: Some(format!("truncated at queue {queue_no} name length")),
                };
            };
            if name_len > MAX_QUEUE_NAME_LEN {
                return IndexLoad {
                    index,
                    warning: Some(format!(
                        "queue {queue_no} name length {name_len} exceeds limit"
                    )),
                };
            }
            let Some(name_bytes) = cursor.take(name_len as usize) else {
                return IndexLoad {
                    index,
                    warning: Some(format!("truncated at queue {queue_no} name")),
                };
            };
            let Ok(name) = String::from_utf8(name_bytes.to_vec()) else {
                return IndexLoad {
                    index,
                    warning: Some(format!("queue {queue_no} name is not UTF-8")),
                };
            };
            let Some(message_count) = cursor.u32() else {
                return IndexLoad {
                    index,
                    warning: Some(format!("truncated at queue {name} message count")),
                };
            };
            if message_count > MAX_MESSAGES_PER_QUEUE {
                return IndexLoad {
                    index,
                    warning: Some(format!(
                        "queue {name} message count {message_count} exceeds limit"
                    )),
                };
            }
            for _ in 0..message_count {
                let entry = cursor.u64().and_then(|id| {
                    let offset = cursor.u64()?;
                    let size = cursor.u64()?;
                    let timestamp_ms = cursor.u64()?;
                    let tombstone = cursor.u8()? != 0;
                    Some((
                        id,
                        IndexEntry {
                            offset,
                            size,
                            timestamp_ms,
                            tombstone,
                        },
                    ))
                });
                let Some((id, entry)) = entry else {
                    return IndexLoad {
                        index,
                        warning: Some(format!("truncated inside queue {name} entries")),
                    };
                };
                index.insert(&name, id, entry);
            }
        }

        IndexLoad { index, warning: None }
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn take(&mut self, n: usize) -> Option<&[u8]> {
        let end = self.pos.checked_add(n)?;
        if end > self.data.len() {
            return None;
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Some(slice)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u32(&mut self) -> Option<u32> {
        self.take(4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Option<u64> {
        self.take(8).map(|b| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(b);
            u64::from_le_bytes(raw)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(offset: u64) -> IndexEntry {
        IndexEntry {
            offset,
            size: 100,
            timestamp_ms: 1_700_000_000_000,
            tombstone: false,
        }
    }

    #[test]
    fn insert_get_tombstone() {
        let mut index = MessageIndex::new();
        index.insert("q", 1, entry(0));
        assert_eq!(index.get("q", 1), Some(entry(0)));
        assert!(index.tombstone("q", 1));
        assert!(!index.tombstone("q", 1));
        assert!(index.get("q", 1).unwrap().tombstone);
        assert!(!index.tombstone("q", 2));
    }

    #[test]
    fn live_entries_sorted_by_id_excludes_tombstones() {
        let mut index = MessageIndex::new();
        index.insert("q", 3, entry(30));
        index.insert("q", 1, entry(10));
        index.insert("q", 2, entry(20));
        index.tombstone("q", 2);

        let live: Vec<MessageId> = index
            .live_entries_sorted("q")
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(live, vec![1, 3]);
        assert_eq!(index.live_count("q"), 2);
    }

    #[test]
    fn totals_and_max_id() {
        let mut index = MessageIndex::new();
        index.insert("a", 5, entry(0));
        index.insert("b", 9, entry(104));
        index.tombstone("a", 5);
        assert_eq!(index.total_live_size(), 100);
        assert_eq!(index.max_id(), 9);
    }

    #[test]
    fn encode_decode_round_trip() {
        let mut index = MessageIndex::new();
        index.insert("orders", 1, entry(0));
        index.insert("orders", 2, entry(104));
        index.insert("billing", 7, entry(250));
        index.tombstone("orders", 1);

        let load = MessageIndex::decode(&index.encode());
        assert!(load.warning.is_none());
        assert!(load.index.get("orders", 1).unwrap().tombstone);
        assert_eq!(load.index.get("orders", 2), Some(entry(104)));
        assert_eq!(load.index.get("billing", 7), Some(entry(250)));
    }

    #[test]
    fn empty_file_is_an_empty_index() {
        let load = MessageIndex::decode(&[]);
        assert!(load.warning.is_none());
        assert_eq!(load.index.max_id(), 0);
    }

    #[test]
    fn truncated_file_keeps_parsed_prefix() {
        let mut index = MessageIndex::new();
        index.insert("orders", 1, entry(0));
        index.insert("orders", 2, entry(104));
        let encoded = index.encode();

        // Cut in the middle of the second entry.
        let cut = encoded.len() - 10;
        let load = MessageIndex::decode(&encoded[..cut]);
        assert!(load.warning.is_some());
        assert_eq!(load.index.live_count("orders"), 1);
    }

    #[test]
    fn oversized_queue_count_rejected() {
        let mut data = Vec::new();
        data.extend_from_slice(&INDEX_VERSION.to_le_bytes());
        data.extend_from_slice(&(MAX_QUEUE_COUNT + 1).to_le_bytes());
        let load = MessageIndex::decode(&data);
        assert!(load.warning.unwrap().contains("exceeds limit"));
    }

    #[test]
    fn wrong_version_rejected() {
        let mut data = Vec::new();
        data.extend_from_slice(&99u32.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        let load = MessageIndex::decode(&data);
        assert!(load.warning.unwrap().contains("version"));
    }
}
