//! Anti-entropy synchronization over rotating Bloom windows.
//!
//! Periodically advertises the local window set in a SYNC frame and ingests
//! peers' advertisements. Comparing sides yields two directions of repair:
//!
//! - **Push**: recent local ids absent from a peer's matching window are
//!   candidates to retransmit toward that peer.
//! - **Pull**: ids we *want* (incomplete fragment buffers that timed out,
//!   unresolved `reply_to` references) and that a peer's windows claim to
//!   hold become REQ candidates. A Bloom filter cannot be enumerated, so
//!   pulls are limited to ids we can name; unknown-unknowns converge through
//!   the peer's own push direction.
//!
//! REQ emission is debounced by a token bucket (default 6/min). When the
//! bucket runs dry, the starved peer backs off exponentially from 30 s up to
//! 600 s; hearing any frame from that peer resets its backoff.

use std::collections::{HashMap, HashSet, VecDeque};

use rfmp_proto::{Callsign, MessageId, ReqFrame, SyncFrame};

use crate::bloom::{BloomWindow, WindowSet};
use crate::env::Environment;

/// Maximum ids per REQ frame.
pub const REQ_CHUNK: usize = 32;

/// Suppress SYNC emission for this long after hearing a peer's SYNC.
pub const SYNC_SUPPRESSION_MS: u64 = 5_000;

/// Initial per-peer REQ backoff.
pub const REQ_BACKOFF_MIN_MS: u64 = 30_000;

/// Per-peer REQ backoff cap.
pub const REQ_BACKOFF_MAX_MS: u64 = 600_000;

/// Sync engine tuning, resolved from the node configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Width of one Bloom window in seconds.
    pub window_secs: u32,
    /// Mean interval between SYNC emissions, ms.
    pub sync_interval_ms: u64,
    /// Bloom hash count.
    pub k: u8,
    /// log2 of the in-memory Bloom bit count.
    pub m_log2: u8,
    /// log2 of the on-air bit count; folded down so a three-window SYNC
    /// fits the MTU.
    pub emit_m_log2: u8,
    /// REQ token bucket size and per-minute refill.
    pub req_per_minute: u32,
}

/// Frames the sync engine wants on the air.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    /// Advertise our windows.
    Sync(SyncFrame),
    /// Pull specific ids.
    Req(ReqFrame),
}

/// Output of one housekeeping tick.
#[derive(Debug, Default)]
pub struct TickOutput {
    /// Frames to enqueue.
    pub actions: Vec<SyncAction>,
    /// Whether the window set rotated (persist it if so).
    pub rotated: bool,
}

#[derive(Debug, Default)]
struct PeerState {
    pending_pull: VecDeque<MessageId>,
    backoff_ms: u64,
    next_req_at_ms: u64,
}

/// Rotating-window synchronizer state.
pub struct SyncEngine {
    windows: WindowSet,
    /// Ids accepted within the sync horizon, with their timestamps.
    recent: VecDeque<(MessageId, u32)>,
    /// Ids we can name but do not hold.
    wanted: HashSet<MessageId>,
    peers: HashMap<Callsign, PeerState>,
    tokens: f64,
    last_refill_ms: u64,
    last_sync_rx_ms: Option<u64>,
    next_sync_at_ms: u64,
    config: SyncConfig,
}

impl SyncEngine {
    /// Build from persisted windows (possibly empty) and the recent-id list
    /// reconstructed from the store.
    pub fn new<E: Environment>(
        env: &E,
        config: SyncConfig,
        persisted: Vec<BloomWindow>,
        recent: Vec<(MessageId, u32)>,
        now_ms: u64,
        now_secs: u32,
    ) -> Self {
        let salts = [env.random_u32(), env.random_u32(), env.random_u32()];
        let windows = WindowSet::restore(
            persisted,
            now_secs,
            config.window_secs,
            config.k,
            config.m_log2,
            salts,
        );
        let next_sync_at_ms = now_ms + jittered(env, config.sync_interval_ms);
        Self {
            windows,
            recent: recent.into_iter().collect(),
            wanted: HashSet::new(),
            peers: HashMap::new(),
            // The bucket starts empty so a cold engine cannot burst past the
            // per-minute budget on top of a full refill.
            tokens: 0.0,
            last_refill_ms: now_ms,
            last_sync_rx_ms: None,
            next_sync_at_ms,
            config,
        }
    }

    /// Record a locally accepted message (ingest or own send).
    pub fn on_message_accepted(&mut self, id: MessageId, timestamp: u32, now_secs: u32) {
        self.windows.insert(&id);
        self.recent.push_back((id, timestamp));
        self.prune_recent(now_secs);
        self.resolve_wanted(&id);
    }

    /// Any frame from a peer resets its REQ backoff.
    pub fn note_peer(&mut self, from: Callsign) {
        if let Some(peer) = self.peers.get_mut(&from) {
            peer.backoff_ms = 0;
            peer.next_req_at_ms = 0;
        }
    }

    /// Start wanting an id (fragment gap, dangling reply reference).
    pub fn add_wanted(&mut self, id: MessageId) {
        self.wanted.insert(id);
    }

    /// Stop wanting an id (it arrived or was stored).
    pub fn resolve_wanted(&mut self, id: &MessageId) {
        self.wanted.remove(id);
    }

    /// Whether an id is currently wanted.
    pub fn is_wanted(&self, id: &MessageId) -> bool {
        self.wanted.contains(id)
    }

    /// Ingest a peer's SYNC frame.
    ///
    /// Returns push candidates: recent local ids the peer's matching window
    /// does not contain. Pull candidates are queued internally and drained
    /// by [`SyncEngine::tick`] under the rate limit.
    pub fn on_sync(&mut self, from: Callsign, frame: &SyncFrame, now_ms: u64) -> Vec<MessageId> {
        self.last_sync_rx_ms = Some(now_ms);

        let mut push = Vec::new();
        let mut pushed = HashSet::new();
        for digest in &frame.windows {
            let Some(local) = self.windows.find_matching(digest.opened_at) else {
                // Disjoint sync horizons; nothing to compare.
                continue;
            };
            let span_start = local.opened_at;
            let span_end = span_start.saturating_add(self.windows.window_secs());
            for (id, ts) in &self.recent {
                if *ts < span_start || *ts >= span_end {
                    continue;
                }
                if !digest.contains(id) && pushed.insert(*id) {
                    push.push(*id);
                }
            }
        }

        let peer = self.peers.entry(from).or_default();
        for id in &self.wanted {
            let claimed = frame.windows.iter().any(|digest| digest.contains(id));
            if claimed && !peer.pending_pull.contains(id) {
                peer.pending_pull.push_back(*id);
            }
        }

        push
    }

    /// Periodic housekeeping: window rotation, SYNC emission, REQ draining.
    ///
    /// `backpressure` suppresses SYNC emission (queue past high water).
    pub fn tick<E: Environment>(
        &mut self,
        env: &E,
        now_ms: u64,
        now_secs: u32,
        backpressure: bool,
    ) -> TickOutput {
        let mut out = TickOutput::default();

        // Catch up on missed ticks after a long sleep.
        while self.windows.maybe_rotate(now_secs, env.random_u32()) {
            out.rotated = true;
        }
        if out.rotated {
            self.prune_recent(now_secs);
        }

        self.refill_tokens(now_ms);

        if now_ms >= self.next_sync_at_ms {
            self.next_sync_at_ms = now_ms + jittered(env, self.config.sync_interval_ms);
            let suppressed = self
                .last_sync_rx_ms
                .is_some_and(|at| now_ms.saturating_sub(at) < SYNC_SUPPRESSION_MS);
            if !suppressed && !backpressure {
                out.actions.push(SyncAction::Sync(SyncFrame {
                    windows: self.windows.digests_folded(self.config.emit_m_log2),
                }));
            }
        }

        self.drain_reqs(now_ms, &mut out.actions);
        out
    }

    /// Current window set, for persistence after rotation.
    pub fn windows(&self) -> [&BloomWindow; 3] {
        self.windows.windows()
    }

    /// Ids inserted across the rotation.
    pub fn population(&self) -> u64 {
        self.windows.population()
    }

    fn refill_tokens(&mut self, now_ms: u64) {
        let elapsed = now_ms.saturating_sub(self.last_refill_ms);
        self.last_refill_ms = now_ms;
        let rate_per_ms = f64::from(self.config.req_per_minute) / 60_000.0;
        self.tokens =
            (self.tokens + elapsed as f64 * rate_per_ms).min(f64::from(self.config.req_per_minute));
    }

    /// Drain pull candidates round-robin across peers, one REQ chunk per
    /// token. Peers starved by an empty bucket back off exponentially.
    fn drain_reqs(&mut self, now_ms: u64, actions: &mut Vec<SyncAction>) {
        // Deterministic peer order keeps the round-robin fair across ticks.
        let mut order: Vec<Callsign> = self.peers.keys().copied().collect();
        order.sort();

        let mut progressed = true;
        while progressed {
            progressed = false;
            for callsign in &order {
                let Some(peer) = self.peers.get_mut(callsign) else { continue };
                peer.pending_pull.retain(|id| self.wanted.contains(id));
                if peer.pending_pull.is_empty() || peer.next_req_at_ms > now_ms {
                    continue;
                }
                if self.tokens < 1.0 {
                    // Bucket dry: back this peer off; candidates stay queued.
                    peer.backoff_ms = match peer.backoff_ms {
                        0 => REQ_BACKOFF_MIN_MS,
                        b => (b * 2).min(REQ_BACKOFF_MAX_MS),
                    };
                    peer.next_req_at_ms = now_ms + peer.backoff_ms;
                    continue;
                }

                let take = peer.pending_pull.len().min(REQ_CHUNK);
                let ids: Vec<MessageId> = peer.pending_pull.drain(..take).collect();
                self.tokens -= 1.0;
                tracing::debug!(peer = %callsign, ids = ids.len(), "requesting missing messages");
                actions.push(SyncAction::Req(ReqFrame { ids }));
                progressed = true;
            }
        }
    }

    fn prune_recent(&mut self, now_secs: u32) {
        let horizon = now_secs.saturating_sub(self.config.window_secs * 3);
        self.recent.retain(|(_, ts)| *ts >= horizon);
    }
}

fn jittered<E: Environment>(env: &E, interval_ms: u64) -> u64 {
    // ±20% around the configured interval.
    let factor = 0.8 + env.random_unit() * 0.4;
    (interval_ms as f64 * factor) as u64
}
