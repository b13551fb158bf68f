//! Protocol counters surfaced through `status()`.

use serde::{Deserialize, Serialize};

/// Monotonic event counters.
///
/// Dropped frames never abort the receive loop; they land here instead.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct Counters {
    pub frames_rx: u64,
    pub frames_tx: u64,
    pub kiss_truncated: u64,
    pub ax25_malformed: u64,
    pub bad_magic: u64,
    pub bad_version: u64,
    pub unknown_type: u64,
    pub malformed_frames: u64,
    pub id_mismatch: u64,
    pub reassembly_id_mismatch: u64,
    pub duplicates: u64,
    pub messages_ingested: u64,
    pub messages_submitted: u64,
    pub fragments_rx: u64,
    pub syncs_rx: u64,
    pub syncs_tx: u64,
    pub reqs_rx: u64,
    pub reqs_tx: u64,
    pub pushes_enqueued: u64,
    pub csma_drops: u64,
    pub tx_permanent_failures: u64,
    pub backpressure_dropped: u64,
    pub store_retries: u64,
}
