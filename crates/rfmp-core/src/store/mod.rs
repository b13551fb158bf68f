//! Storage abstraction for the RFMP engine.
//!
//! Trait-based abstraction over the single durable database. The trait is
//! synchronous; the engine serializes all writes through its own lock, and
//! implementations may additionally lock internally. Everything the engine
//! keeps in memory (reassembly buffers, seen cache, Bloom windows, recent-id
//! lists) must be reconstructible from this store on cold start.

mod memory;

pub use memory::MemoryStore;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use rfmp_proto::{Callsign, MessageId, Priority};

use crate::bloom::BloomWindow;
use crate::message::{ChannelInfo, Message, MessageFilter, NodeInfo};

/// Outcome of an idempotent message insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new row was written.
    Inserted,
    /// The id already existed; nothing changed.
    Duplicate,
}

/// A stored fragment awaiting reassembly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    /// Transmitting station (reassembly key together with `id`).
    pub from_node: Callsign,
    /// Id of the message being carried.
    pub id: MessageId,
    /// Zero-based piece index.
    pub seq: u8,
    /// Total pieces.
    pub total: u8,
    /// Slice of the encoded MSG frame.
    pub payload: Vec<u8>,
}

/// What a queued frame is for; REQ-served and sync traffic is distinguishable
/// from fresh sends in logs and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxPurpose {
    /// A whole MSG frame.
    Msg,
    /// One FRAG of an oversized MSG.
    Frag,
    /// A SYNC advertisement.
    Sync,
    /// A REQ pull request.
    Req,
}

/// One entry in the durable transmission queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxEntry {
    /// Encoded RFMP payload (the AX.25 information field).
    pub frame: Vec<u8>,
    /// Queue priority, urgent first.
    pub priority: Priority,
    /// Wall-clock ms when enqueued; FIFO tie-breaker within a priority.
    pub enqueued_at: u64,
    /// Transmission attempts so far.
    pub attempts: u8,
    /// CSMA deferrals so far.
    pub csma_defers: u8,
    /// Wall-clock ms before which this entry must not be leased.
    pub next_eligible_at: u64,
    /// What the frame is.
    pub purpose: TxPurpose,
    /// For MSG entries: the message to stamp `transmitted_at` on.
    pub msg_id: Option<MessageId>,
}

/// A queue entry leased to the TX loop.
///
/// The lease marks the entry in-flight until `ack`/`nack`/`defer`; a crash
/// between lease and ack re-exposes the entry after the lease deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeasedTx {
    /// Stable queue entry id; also the handle for ack/nack.
    pub id: u64,
    /// The leased entry.
    pub entry: TxEntry,
}

/// Errors raised by store implementations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Underlying database failure.
    #[error("storage I/O error: {0}")]
    Io(String),

    /// A record failed to (de)serialize.
    #[error("storage serialization error: {0}")]
    Serialization(String),

    /// Candidate row violates the fingerprint invariant.
    #[error("id mismatch: row claims {claimed}, fingerprint is {fingerprint}")]
    IdMismatch {
        /// Id carried by the candidate row.
        claimed: MessageId,
        /// Recomputed fingerprint.
        fingerprint: MessageId,
    },

    /// ack/nack/defer named a queue entry that is not leased.
    #[error("unknown or expired tx lease {0}")]
    UnknownLease(u64),
}

/// The persistent store contract (spec'd entity tables, idempotent on id).
///
/// Implementations must be cheap to clone (share state via `Arc`) and
/// thread-safe. Reads may see pre- or post-state of any concurrent single
/// write, never a torn one.
pub trait Store: Clone + Send + Sync + 'static {
    /// Insert a message, verifying the fingerprint invariant.
    ///
    /// Idempotent on `m.id`: a second insert returns
    /// [`InsertOutcome::Duplicate`] and leaves the original row untouched.
    fn insert_message(&self, m: &Message) -> Result<InsertOutcome, StoreError>;

    /// Fetch by exact id.
    fn get_message(&self, id: &MessageId) -> Result<Option<Message>, StoreError>;

    /// Fetch by hex prefix (≥ 8 chars). Returns `None` when the prefix is
    /// absent or ambiguous.
    fn get_message_by_prefix(&self, prefix: &str) -> Result<Option<Message>, StoreError>;

    /// Record the moment a message went out over the air.
    fn set_transmitted_at(&self, id: &MessageId, at: u32) -> Result<(), StoreError>;

    /// List messages, newest first.
    fn list_messages(&self, filter: &MessageFilter) -> Result<Vec<Message>, StoreError>;

    /// Total stored messages.
    fn message_count(&self) -> Result<u64, StoreError>;

    /// Persist one fragment (idempotent on `(id, seq)`).
    fn insert_fragment(&self, f: &Fragment) -> Result<(), StoreError>;

    /// All stored fragments of one message, in `seq` order.
    fn list_fragments(&self, id: &MessageId) -> Result<Vec<Fragment>, StoreError>;

    /// Every stored fragment (cold-start buffer reconstruction).
    fn list_all_fragments(&self) -> Result<Vec<Fragment>, StoreError>;

    /// Drop all fragments of one message.
    fn delete_fragments(&self, id: &MessageId) -> Result<(), StoreError>;

    /// Append to the transmission queue; returns the entry id.
    fn enqueue_tx(&self, entry: &TxEntry) -> Result<u64, StoreError>;

    /// Lease the next eligible entry: lowest priority value first, then
    /// oldest `enqueued_at`, among entries with `next_eligible_at <= now_ms`
    /// and no live lease. Marks the entry in-flight until `lease deadline`.
    fn lease_next_tx(&self, now_ms: u64) -> Result<Option<LeasedTx>, StoreError>;

    /// Transmission succeeded; remove the entry.
    fn ack_tx(&self, id: u64) -> Result<TxEntry, StoreError>;

    /// Transmission failed; release the lease, bump `attempts`, and hold
    /// the entry back until the absolute wall-clock moment `eligible_at_ms`.
    /// Returns the new attempt count.
    fn nack_tx(&self, id: u64, eligible_at_ms: u64) -> Result<u8, StoreError>;

    /// CSMA deferral; like `nack_tx` but bumps `csma_defers` instead of
    /// `attempts`. Returns the new defer count.
    fn defer_tx(&self, id: u64, eligible_at_ms: u64) -> Result<u8, StoreError>;

    /// Drop an entry permanently (CSMA or retry exhaustion).
    fn drop_tx(&self, id: u64) -> Result<TxEntry, StoreError>;

    /// Entries currently queued or in flight.
    fn queue_depth(&self) -> Result<u64, StoreError>;

    /// Record that an id was seen at `now_secs` (authoritative seen set).
    fn seen_touch(&self, id: &MessageId, now_secs: u32) -> Result<(), StoreError>;

    /// Whether an id was seen within `ttl_secs` of `now_secs`.
    fn seen_contains(
        &self,
        id: &MessageId,
        now_secs: u32,
        ttl_secs: u32,
    ) -> Result<bool, StoreError>;

    /// Persist one Bloom window (keyed by window index).
    fn save_bloom_window(&self, w: &BloomWindow) -> Result<(), StoreError>;

    /// Load all persisted Bloom windows.
    fn load_bloom_windows(&self) -> Result<Vec<BloomWindow>, StoreError>;

    /// Record activity from a station.
    fn upsert_node(&self, callsign: &Callsign, now_secs: u32) -> Result<(), StoreError>;

    /// All known stations.
    fn list_nodes(&self) -> Result<Vec<NodeInfo>, StoreError>;

    /// Record activity on a channel.
    fn upsert_channel(&self, name: &str, now_secs: u32) -> Result<(), StoreError>;

    /// All known channels.
    fn list_channels(&self) -> Result<Vec<ChannelInfo>, StoreError>;
}

/// How long a TX lease protects an entry from re-lease, in wall-clock ms.
pub const TX_LEASE_MS: u64 = 10_000;
