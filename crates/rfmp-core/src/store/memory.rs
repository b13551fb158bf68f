//! In-memory store implementation for tests and simulation.

#![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic in test code")]

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use rfmp_proto::{Callsign, MessageId};

use crate::bloom::BloomWindow;
use crate::message::{ChannelInfo, Message, MessageFilter, NodeInfo};

use super::{
    Fragment, InsertOutcome, LeasedTx, Store, StoreError, TX_LEASE_MS, TxEntry,
};

/// In-memory [`Store`] backed by hash maps.
///
/// Shares state via `Arc<Mutex<_>>`; clones see the same data. Uses
/// `lock().expect()`, which panics on poisoning — acceptable for the test
/// and simulation paths this type serves.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    messages: BTreeMap<String, Message>,
    fragments: BTreeMap<(MessageId, u8), Fragment>,
    queue: BTreeMap<u64, QueueSlot>,
    next_queue_id: u64,
    seen: HashMap<MessageId, u32>,
    blooms: HashMap<u8, BloomWindow>,
    nodes: HashMap<Callsign, NodeInfo>,
    channels: HashMap<String, ChannelInfo>,
}

struct QueueSlot {
    entry: TxEntry,
    leased_until: Option<u64>,
}

impl MemoryStore {
    /// New empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn insert_message(&self, m: &Message) -> Result<InsertOutcome, StoreError> {
        if !m.verify_id() {
            return Err(StoreError::IdMismatch {
                claimed: m.id,
                fingerprint: MessageId::fingerprint(&m.from_node, m.timestamp, m.body.as_bytes()),
            });
        }
        let mut inner = self.inner.lock().expect("store mutex");
        let key = m.id.to_hex();
        if inner.messages.contains_key(&key) {
            return Ok(InsertOutcome::Duplicate);
        }
        inner.messages.insert(key, m.clone());
        Ok(InsertOutcome::Inserted)
    }

    fn get_message(&self, id: &MessageId) -> Result<Option<Message>, StoreError> {
        let inner = self.inner.lock().expect("store mutex");
        Ok(inner.messages.get(&id.to_hex()).cloned())
    }

    fn get_message_by_prefix(&self, prefix: &str) -> Result<Option<Message>, StoreError> {
        let prefix = prefix.to_ascii_lowercase();
        let inner = self.inner.lock().expect("store mutex");
        let mut hits = inner
            .messages
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix));
        match (hits.next(), hits.next()) {
            (Some((_, m)), None) => Ok(Some(m.clone())),
            _ => Ok(None),
        }
    }

    fn set_transmitted_at(&self, id: &MessageId, at: u32) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store mutex");
        if let Some(m) = inner.messages.get_mut(&id.to_hex()) {
            m.transmitted_at = Some(at);
        }
        Ok(())
    }

    fn list_messages(&self, filter: &MessageFilter) -> Result<Vec<Message>, StoreError> {
        let inner = self.inner.lock().expect("store mutex");
        let mut rows: Vec<Message> = inner
            .messages
            .values()
            .filter(|m| filter.channel.as_ref().is_none_or(|c| &m.channel == c))
            .filter(|m| filter.since.is_none_or(|s| m.timestamp >= s))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(a.id.cmp(&b.id)));
        if filter.limit > 0 {
            rows.truncate(filter.limit);
        }
        Ok(rows)
    }

    fn message_count(&self) -> Result<u64, StoreError> {
        let inner = self.inner.lock().expect("store mutex");
        Ok(inner.messages.len() as u64)
    }

    fn insert_fragment(&self, f: &Fragment) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store mutex");
        inner.fragments.entry((f.id, f.seq)).or_insert_with(|| f.clone());
        Ok(())
    }

    fn list_fragments(&self, id: &MessageId) -> Result<Vec<Fragment>, StoreError> {
        let inner = self.inner.lock().expect("store mutex");
        Ok(inner
            .fragments
            .range((*id, 0)..=(*id, u8::MAX))
            .map(|(_, f)| f.clone())
            .collect())
    }

    fn list_all_fragments(&self) -> Result<Vec<Fragment>, StoreError> {
        let inner = self.inner.lock().expect("store mutex");
        Ok(inner.fragments.values().cloned().collect())
    }

    fn delete_fragments(&self, id: &MessageId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store mutex");
        let keys: Vec<(MessageId, u8)> = inner
            .fragments
            .range((*id, 0)..=(*id, u8::MAX))
            .map(|(k, _)| *k)
            .collect();
        for k in keys {
            inner.fragments.remove(&k);
        }
        Ok(())
    }

    fn enqueue_tx(&self, entry: &TxEntry) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().expect("store mutex");
        let id = inner.next_queue_id;
        inner.next_queue_id += 1;
        inner.queue.insert(id, QueueSlot { entry: entry.clone(), leased_until: None });
        Ok(id)
    }

    fn lease_next_tx(&self, now_ms: u64) -> Result<Option<LeasedTx>, StoreError> {
        let mut inner = self.inner.lock().expect("store mutex");
        let best = inner
            .queue
            .iter()
            .filter(|(_, slot)| slot.entry.next_eligible_at <= now_ms)
            .filter(|(_, slot)| slot.leased_until.is_none_or(|until| until <= now_ms))
            .min_by_key(|(id, slot)| (slot.entry.priority, slot.entry.enqueued_at, **id))
            .map(|(id, _)| *id);
        match best {
            Some(id) => {
                let slot = inner.queue.get_mut(&id).ok_or(StoreError::UnknownLease(id))?;
                slot.leased_until = Some(now_ms + TX_LEASE_MS);
                Ok(Some(LeasedTx { id, entry: slot.entry.clone() }))
            },
            None => Ok(None),
        }
    }

    fn ack_tx(&self, id: u64) -> Result<TxEntry, StoreError> {
        let mut inner = self.inner.lock().expect("store mutex");
        inner
            .queue
            .remove(&id)
            .map(|slot| slot.entry)
            .ok_or(StoreError::UnknownLease(id))
    }

    fn nack_tx(&self, id: u64, eligible_at_ms: u64) -> Result<u8, StoreError> {
        let mut inner = self.inner.lock().expect("store mutex");
        let slot = inner.queue.get_mut(&id).ok_or(StoreError::UnknownLease(id))?;
        slot.leased_until = None;
        slot.entry.attempts = slot.entry.attempts.saturating_add(1);
        slot.entry.next_eligible_at = eligible_at_ms;
        Ok(slot.entry.attempts)
    }

    fn defer_tx(&self, id: u64, eligible_at_ms: u64) -> Result<u8, StoreError> {
        let mut inner = self.inner.lock().expect("store mutex");
        let slot = inner.queue.get_mut(&id).ok_or(StoreError::UnknownLease(id))?;
        slot.leased_until = None;
        slot.entry.csma_defers = slot.entry.csma_defers.saturating_add(1);
        slot.entry.next_eligible_at = eligible_at_ms;
        Ok(slot.entry.csma_defers)
    }

    fn drop_tx(&self, id: u64) -> Result<TxEntry, StoreError> {
        let mut inner = self.inner.lock().expect("store mutex");
        inner
            .queue
            .remove(&id)
            .map(|slot| slot.entry)
            .ok_or(StoreError::UnknownLease(id))
    }

    fn queue_depth(&self) -> Result<u64, StoreError> {
        let inner = self.inner.lock().expect("store mutex");
        Ok(inner.queue.len() as u64)
    }

    fn seen_touch(&self, id: &MessageId, now_secs: u32) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store mutex");
        inner.seen.insert(*id, now_secs);
        Ok(())
    }

    fn seen_contains(
        &self,
        id: &MessageId,
        now_secs: u32,
        ttl_secs: u32,
    ) -> Result<bool, StoreError> {
        let inner = self.inner.lock().expect("store mutex");
        Ok(inner
            .seen
            .get(id)
            .is_some_and(|&at| now_secs.saturating_sub(at) <= ttl_secs))
    }

    fn save_bloom_window(&self, w: &BloomWindow) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store mutex");
        inner.blooms.insert(w.index, w.clone());
        Ok(())
    }

    fn load_bloom_windows(&self) -> Result<Vec<BloomWindow>, StoreError> {
        let inner = self.inner.lock().expect("store mutex");
        let mut windows: Vec<BloomWindow> = inner.blooms.values().cloned().collect();
        windows.sort_by_key(|w| w.index);
        Ok(windows)
    }

    fn upsert_node(&self, callsign: &Callsign, now_secs: u32) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store mutex");
        inner
            .nodes
            .entry(*callsign)
            .and_modify(|n| {
                n.last_seen = n.last_seen.max(now_secs);
                n.packet_count += 1;
            })
            .or_insert_with(|| NodeInfo {
                callsign: *callsign,
                first_seen: now_secs,
                last_seen: now_secs,
                packet_count: 1,
            });
        Ok(())
    }

    fn list_nodes(&self) -> Result<Vec<NodeInfo>, StoreError> {
        let inner = self.inner.lock().expect("store mutex");
        let mut nodes: Vec<NodeInfo> = inner.nodes.values().cloned().collect();
        nodes.sort_by_key(|n| std::cmp::Reverse(n.last_seen));
        Ok(nodes)
    }

    fn upsert_channel(&self, name: &str, now_secs: u32) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store mutex");
        inner
            .channels
            .entry(name.to_string())
            .and_modify(|c| {
                c.message_count += 1;
                c.last_activity = c.last_activity.max(now_secs);
            })
            .or_insert_with(|| ChannelInfo {
                name: name.to_string(),
                message_count: 1,
                last_activity: now_secs,
            });
        Ok(())
    }

    fn list_channels(&self) -> Result<Vec<ChannelInfo>, StoreError> {
        let inner = self.inner.lock().expect("store mutex");
        let mut channels: Vec<ChannelInfo> = inner.channels.values().cloned().collect();
        channels.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(channels)
    }
}

#[cfg(test)]
mod tests {
    use rfmp_proto::Priority;

    use super::*;
    use super::super::TxPurpose;

    fn message(call: &str, ts: u32, body: &str) -> Message {
        let from_node = Callsign::parse(call).unwrap();
        Message {
            id: MessageId::fingerprint(&from_node, ts, body.as_bytes()),
            from_node,
            author: String::new(),
            timestamp: ts,
            channel: "general".to_string(),
            priority: Priority::Normal,
            reply_to: None,
            body: body.to_string(),
            transmitted_at: None,
            received_at: None,
        }
    }

    #[test]
    fn insert_is_idempotent() {
        let store = MemoryStore::new();
        let m = message("N0CALL", 100, "hi");
        assert_eq!(store.insert_message(&m).unwrap(), InsertOutcome::Inserted);
        for _ in 0..3 {
            assert_eq!(store.insert_message(&m).unwrap(), InsertOutcome::Duplicate);
        }
        assert_eq!(store.message_count().unwrap(), 1);
    }

    #[test]
    fn insert_verifies_fingerprint() {
        let store = MemoryStore::new();
        let mut m = message("N0CALL", 100, "hi");
        m.body = "tampered".to_string();
        assert!(matches!(
            store.insert_message(&m),
            Err(StoreError::IdMismatch { .. })
        ));
    }

    #[test]
    fn prefix_lookup() {
        let store = MemoryStore::new();
        let m = message("N0CALL", 100, "hi");
        store.insert_message(&m).unwrap();
        let prefix = &m.id.to_hex()[..8];
        assert_eq!(store.get_message_by_prefix(prefix).unwrap(), Some(m));
        assert_eq!(store.get_message_by_prefix("ffffffff").unwrap(), None);
    }

    #[test]
    fn list_orders_newest_first() {
        let store = MemoryStore::new();
        for (ts, body) in [(100, "a"), (300, "b"), (200, "c")] {
            store.insert_message(&message("N0CALL", ts, body)).unwrap();
        }
        let rows = store.list_messages(&MessageFilter::default()).unwrap();
        let stamps: Vec<u32> = rows.iter().map(|m| m.timestamp).collect();
        assert_eq!(stamps, vec![300, 200, 100]);

        let filtered = store
            .list_messages(&MessageFilter { since: Some(200), limit: 1, ..Default::default() })
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].timestamp, 300);
    }

    #[test]
    fn lease_orders_by_priority_then_age() {
        let store = MemoryStore::new();
        let entry = |priority, enqueued_at| TxEntry {
            frame: vec![1],
            priority,
            enqueued_at,
            attempts: 0,
            csma_defers: 0,
            next_eligible_at: 0,
            purpose: TxPurpose::Msg,
            msg_id: None,
        };
        store.enqueue_tx(&entry(Priority::Minimal, 1)).unwrap();
        store.enqueue_tx(&entry(Priority::Urgent, 5)).unwrap();
        store.enqueue_tx(&entry(Priority::Urgent, 2)).unwrap();

        let first = store.lease_next_tx(100).unwrap().unwrap();
        assert_eq!(first.entry.enqueued_at, 2);
        store.ack_tx(first.id).unwrap();

        let second = store.lease_next_tx(100).unwrap().unwrap();
        assert_eq!(second.entry.enqueued_at, 5);
        store.ack_tx(second.id).unwrap();

        let third = store.lease_next_tx(100).unwrap().unwrap();
        assert_eq!(third.entry.priority, Priority::Minimal);
    }

    #[test]
    fn lease_respects_eligibility_and_inflight() {
        let store = MemoryStore::new();
        let e = TxEntry {
            frame: vec![1],
            priority: Priority::Normal,
            enqueued_at: 0,
            attempts: 0,
            csma_defers: 0,
            next_eligible_at: 500,
            purpose: TxPurpose::Msg,
            msg_id: None,
        };
        store.enqueue_tx(&e).unwrap();
        assert!(store.lease_next_tx(100).unwrap().is_none());

        let leased = store.lease_next_tx(500).unwrap().unwrap();
        // In flight: not leased again until the deadline passes.
        assert!(store.lease_next_tx(600).unwrap().is_none());
        assert!(store.lease_next_tx(500 + TX_LEASE_MS).unwrap().is_some());

        // Nack releases the lease with a delay and bumps attempts.
        let attempts = store.nack_tx(leased.id, 2_000).unwrap();
        assert_eq!(attempts, 1);
        assert!(store.lease_next_tx(1_000).unwrap().is_none());
        assert!(store.lease_next_tx(2_000).unwrap().is_some());
    }

    #[test]
    fn seen_ttl() {
        let store = MemoryStore::new();
        let id = MessageId::from_bytes([1; 6]);
        store.seen_touch(&id, 1000).unwrap();
        assert!(store.seen_contains(&id, 1500, 3600).unwrap());
        assert!(!store.seen_contains(&id, 1000 + 3601, 3600).unwrap());
    }

    #[test]
    fn node_and_channel_upserts() {
        let store = MemoryStore::new();
        let cs = Callsign::parse("K7ABC").unwrap();
        store.upsert_node(&cs, 100).unwrap();
        store.upsert_node(&cs, 200).unwrap();
        let nodes = store.list_nodes().unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].first_seen, 100);
        assert_eq!(nodes[0].last_seen, 200);
        assert_eq!(nodes[0].packet_count, 2);

        store.upsert_channel("general", 100).unwrap();
        store.upsert_channel("general", 300).unwrap();
        let channels = store.list_channels().unwrap();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].message_count, 2);
        assert_eq!(channels[0].last_activity, 300);
    }
}
