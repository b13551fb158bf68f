//! Redb-backed durable store.
//!
//! Uses redb's ACID transactions with copy-on-write for crash safety. All
//! protocol state survives restarts. Stored records are CBOR; every key is
//! laid out so that lexicographic order matches the query order we need —
//! message ids are lowercase hex (prefix lookups are range scans) and the
//! timeline index key is `[timestamp BE | id]`.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};

use rfmp_core::bloom::BloomWindow;
use rfmp_core::message::{ChannelInfo, Message, MessageFilter, NodeInfo};
use rfmp_core::store::{
    Fragment, InsertOutcome, LeasedTx, Store, StoreError, TX_LEASE_MS, TxEntry,
};
use rfmp_proto::{Callsign, MessageId};

/// Table: messages
/// Key: 12-char lowercase hex id
/// Value: CBOR-encoded Message
const MESSAGES: TableDefinition<&str, &[u8]> = TableDefinition::new("messages");

/// Table: timeline index
/// Key: [timestamp: 4 bytes BE][id: 6 bytes]
/// Value: ()
const TIMELINE: TableDefinition<&[u8], ()> = TableDefinition::new("timeline");

/// Table: fragments
/// Key: [id: 6 bytes][seq: 1 byte]
/// Value: CBOR-encoded Fragment
const FRAGMENTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("fragments");

/// Table: transmission queue
/// Key: entry id (monotonic u64)
/// Value: CBOR-encoded QueueRecord
const TX_QUEUE: TableDefinition<u64, &[u8]> = TableDefinition::new("tx_queue");

/// Table: seen ids
/// Key: id (6 bytes)
/// Value: last_seen_at (UTC seconds)
const SEEN: TableDefinition<&[u8], u32> = TableDefinition::new("seen");

/// Table: bloom windows
/// Key: window index (0-2)
/// Value: CBOR-encoded BloomWindow
const BLOOMS: TableDefinition<u8, &[u8]> = TableDefinition::new("blooms");

/// Table: nodes
/// Key: canonical callsign
/// Value: CBOR-encoded NodeInfo
const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

/// Table: channels
/// Key: channel name
/// Value: CBOR-encoded ChannelInfo
const CHANNELS: TableDefinition<&str, &[u8]> = TableDefinition::new("channels");

/// Table: metadata (schema version)
const META: TableDefinition<&str, u32> = TableDefinition::new("meta");

const SCHEMA_VERSION: u32 = 1;

/// Queue entry plus its lease state.
#[derive(serde::Serialize, serde::Deserialize)]
struct QueueRecord {
    entry: TxEntry,
    leased_until: Option<u64>,
}

/// Durable store backed by redb.
///
/// Thread-safe through redb's internal locking. Clone is cheap (`Arc`).
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open or create the database, creating tables and recording the
    /// schema version on first open.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Io` if the file cannot be opened or the
    /// recorded schema version is from a future release.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = Database::create(path.as_ref()).map_err(io_err)?;

        let txn = db.begin_write().map_err(io_err)?;
        {
            let _ = txn.open_table(MESSAGES).map_err(io_err)?;
            let _ = txn.open_table(TIMELINE).map_err(io_err)?;
            let _ = txn.open_table(FRAGMENTS).map_err(io_err)?;
            let _ = txn.open_table(TX_QUEUE).map_err(io_err)?;
            let _ = txn.open_table(SEEN).map_err(io_err)?;
            let _ = txn.open_table(BLOOMS).map_err(io_err)?;
            let _ = txn.open_table(NODES).map_err(io_err)?;
            let _ = txn.open_table(CHANNELS).map_err(io_err)?;

            let mut meta = txn.open_table(META).map_err(io_err)?;
            let recorded = meta.get("schema_version").map_err(io_err)?.map(|v| v.value());
            match recorded {
                Some(version) if version > SCHEMA_VERSION => {
                    return Err(StoreError::Io(format!(
                        "database schema v{version} is newer than this build (v{SCHEMA_VERSION})"
                    )));
                },
                Some(_) => {
                    // Current or older: older versions would migrate here.
                },
                None => {
                    meta.insert("schema_version", SCHEMA_VERSION).map_err(io_err)?;
                },
            }
        }
        txn.commit().map_err(io_err)?;

        Ok(Self { db: Arc::new(db) })
    }
}

impl RedbStore {
    /// Release a lease and reschedule the entry; `bump` updates whichever
    /// counter the caller is tracking and returns its new value.
    fn requeue(
        &self,
        id: u64,
        eligible_at_ms: u64,
        bump: impl FnOnce(&mut QueueRecord) -> u8,
    ) -> Result<u8, StoreError> {
        let txn = self.db.begin_write().map_err(io_err)?;
        let count = {
            let mut queue = txn.open_table(TX_QUEUE).map_err(io_err)?;
            let mut record: QueueRecord = match queue.get(id).map_err(io_err)? {
                Some(value) => from_cbor(value.value())?,
                None => return Err(StoreError::UnknownLease(id)),
            };
            record.leased_until = None;
            record.entry.next_eligible_at = eligible_at_ms;
            let count = bump(&mut record);
            let bytes = to_cbor(&record)?;
            queue.insert(id, bytes.as_slice()).map_err(io_err)?;
            count
        };
        txn.commit().map_err(io_err)?;
        Ok(count)
    }
}

fn io_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Io(e.to_string())
}

fn ser_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Serialization(e.to_string())
}

fn to_cbor<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes).map_err(ser_err)?;
    Ok(bytes)
}

fn from_cbor<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    ciborium::from_reader(bytes).map_err(ser_err)
}

/// Timeline key: `[timestamp BE | id]` so lexicographic order is time order.
fn timeline_key(timestamp: u32, id: &MessageId) -> [u8; 10] {
    let mut key = [0u8; 10];
    key[..4].copy_from_slice(&timestamp.to_be_bytes());
    key[4..].copy_from_slice(id.as_bytes());
    key
}

/// Fragment key: `[id | seq]` groups one message's pieces contiguously.
fn fragment_key(id: &MessageId, seq: u8) -> [u8; 7] {
    let mut key = [0u8; 7];
    key[..6].copy_from_slice(id.as_bytes());
    key[6] = seq;
    key
}

fn id_from_timeline_key(key: &[u8]) -> Option<MessageId> {
    let raw: [u8; 6] = key.get(4..10)?.try_into().ok()?;
    Some(MessageId::from_bytes(raw))
}

impl Store for RedbStore {
    fn insert_message(&self, m: &Message) -> Result<InsertOutcome, StoreError> {
        if !m.verify_id() {
            return Err(StoreError::IdMismatch {
                claimed: m.id,
                fingerprint: MessageId::fingerprint(&m.from_node, m.timestamp, m.body.as_bytes()),
            });
        }
        let txn = self.db.begin_write().map_err(io_err)?;
        let outcome = {
            let mut messages = txn.open_table(MESSAGES).map_err(io_err)?;
            let key = m.id.to_hex();
            if messages.get(key.as_str()).map_err(io_err)?.is_some() {
                InsertOutcome::Duplicate
            } else {
                let bytes = to_cbor(m)?;
                messages.insert(key.as_str(), bytes.as_slice()).map_err(io_err)?;
                let mut timeline = txn.open_table(TIMELINE).map_err(io_err)?;
                timeline
                    .insert(timeline_key(m.timestamp, &m.id).as_slice(), ())
                    .map_err(io_err)?;
                InsertOutcome::Inserted
            }
        };
        txn.commit().map_err(io_err)?;
        Ok(outcome)
    }

    fn get_message(&self, id: &MessageId) -> Result<Option<Message>, StoreError> {
        let txn = self.db.begin_read().map_err(io_err)?;
        let messages = txn.open_table(MESSAGES).map_err(io_err)?;
        match messages.get(id.to_hex().as_str()).map_err(io_err)? {
            Some(value) => Ok(Some(from_cbor(value.value())?)),
            None => Ok(None),
        }
    }

    fn get_message_by_prefix(&self, prefix: &str) -> Result<Option<Message>, StoreError> {
        let prefix = prefix.to_ascii_lowercase();
        let txn = self.db.begin_read().map_err(io_err)?;
        let messages = txn.open_table(MESSAGES).map_err(io_err)?;
        let mut hits = messages.range(prefix.as_str()..).map_err(io_err)?;

        let first = match hits.next() {
            Some(entry) => {
                let (key, value) = entry.map_err(io_err)?;
                if !key.value().starts_with(&prefix) {
                    return Ok(None);
                }
                from_cbor::<Message>(value.value())?
            },
            None => return Ok(None),
        };
        if let Some(entry) = hits.next() {
            let (key, _) = entry.map_err(io_err)?;
            if key.value().starts_with(&prefix) {
                // Ambiguous prefix.
                return Ok(None);
            }
        }
        Ok(Some(first))
    }

    fn set_transmitted_at(&self, id: &MessageId, at: u32) -> Result<(), StoreError> {
        let txn = self.db.begin_write().map_err(io_err)?;
        {
            let mut messages = txn.open_table(MESSAGES).map_err(io_err)?;
            let key = id.to_hex();
            let updated = match messages.get(key.as_str()).map_err(io_err)? {
                Some(value) => {
                    let mut m: Message = from_cbor(value.value())?;
                    m.transmitted_at = Some(at);
                    Some(to_cbor(&m)?)
                },
                None => None,
            };
            if let Some(bytes) = updated {
                messages.insert(key.as_str(), bytes.as_slice()).map_err(io_err)?;
            }
        }
        txn.commit().map_err(io_err)?;
        Ok(())
    }

    fn list_messages(&self, filter: &MessageFilter) -> Result<Vec<Message>, StoreError> {
        let txn = self.db.begin_read().map_err(io_err)?;
        let timeline = txn.open_table(TIMELINE).map_err(io_err)?;
        let messages = txn.open_table(MESSAGES).map_err(io_err)?;

        let start = timeline_key(filter.since.unwrap_or(0), &MessageId::from_bytes([0; 6]));
        let mut rows = Vec::new();
        // Newest first: walk the timeline index backwards.
        for entry in timeline.range(start.as_slice()..).map_err(io_err)?.rev() {
            let (key, _) = entry.map_err(io_err)?;
            let Some(id) = id_from_timeline_key(key.value()) else { continue };
            let Some(value) = messages.get(id.to_hex().as_str()).map_err(io_err)? else {
                continue;
            };
            let message: Message = from_cbor(value.value())?;
            if filter.channel.as_ref().is_some_and(|c| &message.channel != c) {
                continue;
            }
            rows.push(message);
            if filter.limit > 0 && rows.len() >= filter.limit {
                break;
            }
        }
        Ok(rows)
    }

    fn message_count(&self) -> Result<u64, StoreError> {
        let txn = self.db.begin_read().map_err(io_err)?;
        let messages = txn.open_table(MESSAGES).map_err(io_err)?;
        messages.len().map_err(io_err)
    }

    fn insert_fragment(&self, f: &Fragment) -> Result<(), StoreError> {
        let txn = self.db.begin_write().map_err(io_err)?;
        {
            let mut fragments = txn.open_table(FRAGMENTS).map_err(io_err)?;
            let key = fragment_key(&f.id, f.seq);
            if fragments.get(key.as_slice()).map_err(io_err)?.is_none() {
                let bytes = to_cbor(f)?;
                fragments.insert(key.as_slice(), bytes.as_slice()).map_err(io_err)?;
            }
        }
        txn.commit().map_err(io_err)?;
        Ok(())
    }

    fn list_fragments(&self, id: &MessageId) -> Result<Vec<Fragment>, StoreError> {
        let txn = self.db.begin_read().map_err(io_err)?;
        let fragments = txn.open_table(FRAGMENTS).map_err(io_err)?;
        let start = fragment_key(id, 0);
        let end = fragment_key(id, u8::MAX);
        let mut out = Vec::new();
        for entry in fragments.range(start.as_slice()..=end.as_slice()).map_err(io_err)? {
            let (_, value) = entry.map_err(io_err)?;
            out.push(from_cbor(value.value())?);
        }
        Ok(out)
    }

    fn list_all_fragments(&self) -> Result<Vec<Fragment>, StoreError> {
        let txn = self.db.begin_read().map_err(io_err)?;
        let fragments = txn.open_table(FRAGMENTS).map_err(io_err)?;
        let mut out = Vec::new();
        for entry in fragments.iter().map_err(io_err)? {
            let (_, value) = entry.map_err(io_err)?;
            out.push(from_cbor(value.value())?);
        }
        Ok(out)
    }

    fn delete_fragments(&self, id: &MessageId) -> Result<(), StoreError> {
        let txn = self.db.begin_write().map_err(io_err)?;
        {
            let mut fragments = txn.open_table(FRAGMENTS).map_err(io_err)?;
            let start = fragment_key(id, 0);
            let end = fragment_key(id, u8::MAX);
            let keys: Vec<Vec<u8>> = fragments
                .range(start.as_slice()..=end.as_slice())
                .map_err(io_err)?
                .map(|entry| entry.map(|(k, _)| k.value().to_vec()).map_err(io_err))
                .collect::<Result<_, _>>()?;
            for key in keys {
                fragments.remove(key.as_slice()).map_err(io_err)?;
            }
        }
        txn.commit().map_err(io_err)?;
        Ok(())
    }

    fn enqueue_tx(&self, entry: &TxEntry) -> Result<u64, StoreError> {
        let txn = self.db.begin_write().map_err(io_err)?;
        let id = {
            let mut queue = txn.open_table(TX_QUEUE).map_err(io_err)?;
            let id = match queue.last().map_err(io_err)? {
                Some((key, _)) => key.value() + 1,
                None => 0,
            };
            let record = QueueRecord { entry: entry.clone(), leased_until: None };
            let bytes = to_cbor(&record)?;
            queue.insert(id, bytes.as_slice()).map_err(io_err)?;
            id
        };
        txn.commit().map_err(io_err)?;
        Ok(id)
    }

    fn lease_next_tx(&self, now_ms: u64) -> Result<Option<LeasedTx>, StoreError> {
        let txn = self.db.begin_write().map_err(io_err)?;
        let leased = {
            let mut queue = txn.open_table(TX_QUEUE).map_err(io_err)?;

            let mut best: Option<(u64, QueueRecord)> = None;
            for entry in queue.iter().map_err(io_err)? {
                let (key, value) = entry.map_err(io_err)?;
                let record: QueueRecord = from_cbor(value.value())?;
                if record.entry.next_eligible_at > now_ms {
                    continue;
                }
                if record.leased_until.is_some_and(|until| until > now_ms) {
                    continue;
                }
                let better = match &best {
                    Some((best_id, best_record)) => {
                        (record.entry.priority, record.entry.enqueued_at, key.value())
                            < (best_record.entry.priority, best_record.entry.enqueued_at, *best_id)
                    },
                    None => true,
                };
                if better {
                    best = Some((key.value(), record));
                }
            }

            match best {
                Some((id, mut record)) => {
                    record.leased_until = Some(now_ms + TX_LEASE_MS);
                    let bytes = to_cbor(&record)?;
                    queue.insert(id, bytes.as_slice()).map_err(io_err)?;
                    Some(LeasedTx { id, entry: record.entry })
                },
                None => None,
            }
        };
        txn.commit().map_err(io_err)?;
        Ok(leased)
    }

    fn ack_tx(&self, id: u64) -> Result<TxEntry, StoreError> {
        let txn = self.db.begin_write().map_err(io_err)?;
        let entry = {
            let mut queue = txn.open_table(TX_QUEUE).map_err(io_err)?;
            let record: QueueRecord = match queue.remove(id).map_err(io_err)? {
                Some(value) => from_cbor(value.value())?,
                None => return Err(StoreError::UnknownLease(id)),
            };
            record.entry
        };
        txn.commit().map_err(io_err)?;
        Ok(entry)
    }

    fn nack_tx(&self, id: u64, eligible_at_ms: u64) -> Result<u8, StoreError> {
        self.requeue(id, eligible_at_ms, |record| {
            record.entry.attempts = record.entry.attempts.saturating_add(1);
            record.entry.attempts
        })
    }

    fn defer_tx(&self, id: u64, eligible_at_ms: u64) -> Result<u8, StoreError> {
        self.requeue(id, eligible_at_ms, |record| {
            record.entry.csma_defers = record.entry.csma_defers.saturating_add(1);
            record.entry.csma_defers
        })
    }

    fn drop_tx(&self, id: u64) -> Result<TxEntry, StoreError> {
        self.ack_tx(id)
    }

    fn queue_depth(&self) -> Result<u64, StoreError> {
        let txn = self.db.begin_read().map_err(io_err)?;
        let queue = txn.open_table(TX_QUEUE).map_err(io_err)?;
        queue.len().map_err(io_err)
    }

    fn seen_touch(&self, id: &MessageId, now_secs: u32) -> Result<(), StoreError> {
        let txn = self.db.begin_write().map_err(io_err)?;
        {
            let mut seen = txn.open_table(SEEN).map_err(io_err)?;
            seen.insert(id.as_bytes().as_slice(), now_secs).map_err(io_err)?;
        }
        txn.commit().map_err(io_err)?;
        Ok(())
    }

    fn seen_contains(
        &self,
        id: &MessageId,
        now_secs: u32,
        ttl_secs: u32,
    ) -> Result<bool, StoreError> {
        let txn = self.db.begin_read().map_err(io_err)?;
        let seen = txn.open_table(SEEN).map_err(io_err)?;
        Ok(seen
            .get(id.as_bytes().as_slice())
            .map_err(io_err)?
            .is_some_and(|at| now_secs.saturating_sub(at.value()) <= ttl_secs))
    }

    fn save_bloom_window(&self, w: &BloomWindow) -> Result<(), StoreError> {
        let txn = self.db.begin_write().map_err(io_err)?;
        {
            let mut blooms = txn.open_table(BLOOMS).map_err(io_err)?;
            let bytes = to_cbor(w)?;
            blooms.insert(w.index, bytes.as_slice()).map_err(io_err)?;
        }
        txn.commit().map_err(io_err)?;
        Ok(())
    }

    fn load_bloom_windows(&self) -> Result<Vec<BloomWindow>, StoreError> {
        let txn = self.db.begin_read().map_err(io_err)?;
        let blooms = txn.open_table(BLOOMS).map_err(io_err)?;
        let mut windows = Vec::new();
        for entry in blooms.iter().map_err(io_err)? {
            let (_, value) = entry.map_err(io_err)?;
            windows.push(from_cbor(value.value())?);
        }
        Ok(windows)
    }

    fn upsert_node(&self, callsign: &Callsign, now_secs: u32) -> Result<(), StoreError> {
        let txn = self.db.begin_write().map_err(io_err)?;
        {
            let mut nodes = txn.open_table(NODES).map_err(io_err)?;
            let key = callsign.to_string();
            let mut info = match nodes.get(key.as_str()).map_err(io_err)? {
                Some(value) => from_cbor::<NodeInfo>(value.value())?,
                None => NodeInfo {
                    callsign: *callsign,
                    first_seen: now_secs,
                    last_seen: now_secs,
                    packet_count: 0,
                },
            };
            info.last_seen = info.last_seen.max(now_secs);
            info.packet_count += 1;
            let bytes = to_cbor(&info)?;
            nodes.insert(key.as_str(), bytes.as_slice()).map_err(io_err)?;
        }
        txn.commit().map_err(io_err)?;
        Ok(())
    }

    fn list_nodes(&self) -> Result<Vec<NodeInfo>, StoreError> {
        let txn = self.db.begin_read().map_err(io_err)?;
        let nodes = txn.open_table(NODES).map_err(io_err)?;
        let mut out = Vec::new();
        for entry in nodes.iter().map_err(io_err)? {
            let (_, value) = entry.map_err(io_err)?;
            out.push(from_cbor(value.value())?);
        }
        out.sort_by_key(|n: &NodeInfo| std::cmp::Reverse(n.last_seen));
        Ok(out)
    }

    fn upsert_channel(&self, name: &str, now_secs: u32) -> Result<(), StoreError> {
        let txn = self.db.begin_write().map_err(io_err)?;
        {
            let mut channels = txn.open_table(CHANNELS).map_err(io_err)?;
            let mut info = match channels.get(name).map_err(io_err)? {
                Some(value) => from_cbor::<ChannelInfo>(value.value())?,
                None => ChannelInfo {
                    name: name.to_string(),
                    message_count: 0,
                    last_activity: now_secs,
                },
            };
            info.message_count += 1;
            info.last_activity = info.last_activity.max(now_secs);
            let bytes = to_cbor(&info)?;
            channels.insert(name, bytes.as_slice()).map_err(io_err)?;
        }
        txn.commit().map_err(io_err)?;
        Ok(())
    }

    fn list_channels(&self) -> Result<Vec<ChannelInfo>, StoreError> {
        let txn = self.db.begin_read().map_err(io_err)?;
        let channels = txn.open_table(CHANNELS).map_err(io_err)?;
        let mut out = Vec::new();
        for entry in channels.iter().map_err(io_err)? {
            let (_, value) = entry.map_err(io_err)?;
            out.push(from_cbor(value.value())?);
        }
        Ok(out)
    }
}
