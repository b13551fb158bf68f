//! Fragmentation and reassembly of MSG frames larger than the air MTU.
//!
//! Outbound: an encoded MSG frame is cut into FRAG payloads of at most
//! `MTU - 12` bytes so every FRAG, including its own header, fits the MTU.
//! Inbound: buffers are keyed by `(from_node, msg_id)`, hold each `seq`
//! once, complete when seqs `0..total` are present, and expire after five
//! minutes of inactivity. At most 64 buffers are held; the oldest is evicted
//! under pressure.

use std::collections::HashMap;

use bytes::Bytes;

use rfmp_proto::frame::FRAG_OVERHEAD;
use rfmp_proto::{Callsign, FragFrame, MessageId};

/// Inactivity timeout for a reassembly buffer, in ms.
pub const REASSEMBLY_TTL_MS: u64 = 300_000;

/// Maximum outstanding reassembly buffers.
pub const MAX_BUFFERS: usize = 64;

/// Cut an encoded MSG frame into FRAG frames.
///
/// Returns `None` when the message would need more than 255 pieces (such a
/// message cannot exist within protocol limits at any sane MTU, but the
/// arithmetic is guarded anyway).
pub fn fragment_frame(id: MessageId, encoded_msg: &[u8], mtu: usize) -> Option<Vec<FragFrame>> {
    debug_assert!(encoded_msg.len() > mtu);
    let chunk = mtu.checked_sub(FRAG_OVERHEAD)?;
    if chunk == 0 {
        return None;
    }
    let total = encoded_msg.len().div_ceil(chunk);
    if total > u8::MAX as usize {
        return None;
    }
    Some(
        encoded_msg
            .chunks(chunk)
            .enumerate()
            .map(|(seq, payload)| FragFrame {
                id,
                seq: seq as u8,
                total: total as u8,
                payload: Bytes::copy_from_slice(payload),
            })
            .collect(),
    )
}

/// Result of feeding one fragment to the reassembler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragIngest {
    /// Stored (or duplicate); more pieces outstanding.
    Incomplete,
    /// All pieces arrived; the concatenated MSG frame bytes.
    Complete(Vec<u8>),
}

#[derive(Debug)]
struct Buffer {
    total: u8,
    parts: Vec<Option<Bytes>>,
    received: u8,
    created_at_ms: u64,
    last_update_ms: u64,
}

impl Buffer {
    fn new(total: u8, now_ms: u64) -> Self {
        Self {
            total,
            parts: vec![None; total as usize],
            received: 0,
            created_at_ms: now_ms,
            last_update_ms: now_ms,
        }
    }
}

/// Inbound reassembly state.
#[derive(Debug, Default)]
pub struct Reassembler {
    buffers: HashMap<(Callsign, MessageId), Buffer>,
}

impl Reassembler {
    /// Empty reassembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fragment.
    ///
    /// Duplicate seqs and fragments whose `total` disagrees with the buffer
    /// are ignored. On completion the buffer is destroyed and the
    /// concatenated MSG frame bytes returned; verifying that they decode to
    /// a MSG with the right id is the caller's job.
    pub fn ingest(&mut self, from: Callsign, frag: &FragFrame, now_ms: u64) -> FragIngest {
        let key = (from, frag.id);
        if !self.buffers.contains_key(&key) {
            self.evict_for_pressure();
            self.buffers.insert(key, Buffer::new(frag.total, now_ms));
        }
        // INVARIANT: inserted above when missing.
        let Some(buffer) = self.buffers.get_mut(&key) else {
            return FragIngest::Incomplete;
        };
        if buffer.total != frag.total || frag.seq >= buffer.total {
            return FragIngest::Incomplete;
        }
        let slot = &mut buffer.parts[frag.seq as usize];
        if slot.is_none() {
            *slot = Some(frag.payload.clone());
            buffer.received += 1;
            buffer.last_update_ms = now_ms;
        }
        if buffer.received < buffer.total {
            return FragIngest::Incomplete;
        }

        // INVARIANT: received == total implies every slot is Some.
        let Some(buffer) = self.buffers.remove(&key) else {
            return FragIngest::Incomplete;
        };
        let mut assembled = Vec::new();
        for part in buffer.parts.into_iter().flatten() {
            assembled.extend_from_slice(&part);
        }
        FragIngest::Complete(assembled)
    }

    /// Drop a buffer explicitly (id-mismatch discard).
    pub fn purge(&mut self, from: &Callsign, id: &MessageId) {
        self.buffers.remove(&(*from, *id));
    }

    /// Expire inactive buffers, returning their keys so the caller can
    /// decide whether each id is still worth a REQ.
    pub fn sweep(&mut self, now_ms: u64) -> Vec<(Callsign, MessageId)> {
        let expired: Vec<(Callsign, MessageId)> = self
            .buffers
            .iter()
            .filter(|(_, b)| now_ms.saturating_sub(b.last_update_ms) >= REASSEMBLY_TTL_MS)
            .map(|(k, _)| *k)
            .collect();
        for key in &expired {
            self.buffers.remove(key);
        }
        expired
    }

    /// Outstanding buffer count.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Whether no buffers are outstanding.
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    fn evict_for_pressure(&mut self) {
        while self.buffers.len() >= MAX_BUFFERS {
            let oldest = self
                .buffers
                .iter()
                .min_by_key(|(_, b)| b.created_at_ms)
                .map(|(k, _)| *k);
            match oldest {
                Some(key) => {
                    self.buffers.remove(&key);
                },
                None => break,
            }
        }
    }
}
