//! The protocol engine: everything between decoded UI frames and the store.
//!
//! The engine is a synchronous state machine in the style of an
//! action-returning driver: the runtime feeds it events (a decoded UI frame,
//! an API submission, a housekeeping tick, a TX poll) and executes whatever
//! it hands back (events to publish, frames to put on the air). All protocol
//! state lives behind one logical serial order — the runtime wraps the
//! engine in a single mutex and never suspends inside a call.
//!
//! Dispatch per frame type:
//!
//! - MSG: fingerprint check, seen-cache, store insert, bloom insert,
//!   node/channel upserts, publish.
//! - FRAG: persist + buffer; a completed buffer re-enters as MSG.
//! - SYNC: window diff; push candidates enqueue, pull candidates queue REQs.
//! - REQ: serve stored messages back at priority Normal.

use std::collections::HashMap;

use rfmp_proto::frame::{MAX_APP_BODY_LEN, MAX_AUTHOR_LEN, validate_channel};
use rfmp_proto::{
    Callsign, Frame, FragFrame, MessageId, MsgFrame, Priority, ProtocolError, ReqFrame, SyncFrame,
    UiFrame, kiss,
};

use crate::config::Config;
use crate::env::Environment;
use crate::error::EngineError;
use crate::fragment::{FragIngest, Reassembler, fragment_frame};
use crate::message::{ChannelInfo, Message, MessageFilter, NodeEvent, NodeInfo, Status};
use crate::metrics::Counters;
use crate::seen::SeenCache;
use crate::store::{InsertOutcome, Store, StoreError, TxEntry, TxPurpose};
use crate::sync::{SyncAction, SyncConfig, SyncEngine};
use crate::txsched::{MAX_TX_ATTEMPTS, TxDecision, TxScheduler};

/// Seen-entry TTL mirrored into the store-side authoritative check.
const SEEN_TTL_SECS: u32 = crate::seen::DEFAULT_TTL_SECS;

/// How long the TX loop should idle when the queue has nothing eligible.
const TX_IDLE_POLL_MS: u64 = 100;

/// A message submission from the host API.
#[derive(Debug, Clone, Default)]
pub struct Submission {
    /// Target channel.
    pub channel: String,
    /// Body text, at most 500 bytes.
    pub body: String,
    /// Transmit priority.
    pub priority: u8,
    /// Full id or ≥8-char prefix of the message being replied to.
    pub reply_to: Option<String>,
    /// Operator nickname override.
    pub author: Option<String>,
}

/// What the TX loop should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxPoll {
    /// Nothing to send (or channel busy); poll again after this long.
    Idle {
        /// Suggested sleep, ms.
        retry_in_ms: u64,
    },
    /// A frame is cleared for the wire.
    Frame {
        /// Queue entry id; report back via `tx_sent` / `tx_failed`.
        id: u64,
        /// Complete KISS-framed bytes for the TNC socket.
        kiss_frame: Vec<u8>,
    },
}

/// The protocol engine.
pub struct Engine<E: Environment, S: Store> {
    env: E,
    store: S,
    local: Callsign,
    dest: Callsign,
    mtu: usize,
    queue_high_water: u64,
    sync: SyncEngine,
    seen: SeenCache,
    reassembler: Reassembler,
    txsched: TxScheduler,
    in_flight: HashMap<u64, TxEntry>,
    counters: Counters,
    connected: bool,
}

impl<E: Environment, S: Store> Engine<E, S> {
    /// Build an engine, restoring sync and reassembly state from the store.
    pub fn new(config: &Config, env: E, store: S) -> Result<Self, EngineError> {
        config.validate()?;
        let local = config.local_callsign()?;
        let dest = config.destination_callsign()?;
        let mtu = usize::from(config.protocol.mtu);

        let now_ms = env.monotonic_millis();
        let now_secs = env.wall_clock_secs() as u32;
        let window_secs = config.protocol.bloom_window_s;

        let persisted = store.load_bloom_windows()?;
        let recent = store
            .list_messages(&MessageFilter {
                channel: None,
                since: Some(now_secs.saturating_sub(window_secs * 3)),
                limit: 0,
            })?
            .into_iter()
            .map(|m| (m.id, m.timestamp))
            .collect();

        let sync_config = SyncConfig {
            window_secs,
            sync_interval_ms: u64::from(config.protocol.sync_interval_s) * 1000,
            k: config.protocol.bloom_k,
            m_log2: config.protocol.bloom_m_log2,
            emit_m_log2: emit_m_log2_for(mtu, config.protocol.bloom_m_log2),
            req_per_minute: config.protocol.req_per_minute,
        };
        let sync = SyncEngine::new(&env, sync_config, persisted, recent, now_ms, now_secs);

        let mut engine = Self {
            env,
            store,
            local,
            dest,
            mtu,
            queue_high_water: u64::from(config.protocol.queue_high_water),
            sync,
            seen: SeenCache::new(),
            reassembler: Reassembler::new(),
            txsched: TxScheduler::new(),
            in_flight: HashMap::new(),
            counters: Counters::default(),
            connected: false,
        };
        engine.restore_fragments(now_ms)?;
        Ok(engine)
    }

    /// The node's own callsign.
    pub fn local_callsign(&self) -> &Callsign {
        &self.local
    }

    /// Submit a message from the host API.
    ///
    /// Builds the MSG, stores it, inserts it into the current Bloom window,
    /// fragments if needed, and enqueues for transmission. Returns the
    /// stored message synchronously.
    pub fn submit(&mut self, submission: Submission) -> Result<(Message, Vec<NodeEvent>), EngineError> {
        validate_channel(&submission.channel)?;
        if submission.body.len() > MAX_APP_BODY_LEN {
            return Err(EngineError::BodyTooLong {
                len: submission.body.len(),
                max: MAX_APP_BODY_LEN,
            });
        }
        let author = submission.author.unwrap_or_default();
        if author.len() > MAX_AUTHOR_LEN {
            return Err(EngineError::Encode(ProtocolError::FieldTooLong {
                field: "author",
                len: author.len(),
                max: MAX_AUTHOR_LEN,
            }));
        }
        let depth = self.with_retry(|s| s.queue_depth())?;
        if depth >= self.queue_high_water {
            self.counters.backpressure_dropped += 1;
            return Err(EngineError::Backpressure { depth });
        }
        let reply_to = self.resolve_reply_to(submission.reply_to.as_deref())?;

        let now_secs = self.env.wall_clock_secs() as u32;
        let priority = Priority::from_u8(submission.priority);
        let id = MessageId::fingerprint(&self.local, now_secs, submission.body.as_bytes());
        let message = Message {
            id,
            from_node: self.local,
            author,
            timestamp: now_secs,
            channel: submission.channel,
            priority,
            reply_to,
            body: submission.body,
            transmitted_at: None,
            received_at: None,
        };

        match self.with_retry(|s| s.insert_message(&message))? {
            InsertOutcome::Inserted => {},
            InsertOutcome::Duplicate => {
                // Same body in the same second; the earlier row stands.
                let existing = self.with_retry(|s| s.get_message(&id))?;
                return Ok((existing.unwrap_or(message), Vec::new()));
            },
        }
        self.counters.messages_submitted += 1;

        self.seen.touch(id, now_secs);
        self.with_retry(|s| s.seen_touch(&id, now_secs))?;
        self.sync.on_message_accepted(id, message.timestamp, now_secs);
        self.with_retry(|s| s.upsert_channel(&message.channel, now_secs))?;
        if let Some(wanted) = reply_to {
            if self.with_retry(|s| s.get_message(&wanted))?.is_none() {
                self.sync.add_wanted(wanted);
            }
        }

        self.enqueue_frame(&Frame::Msg(message.to_frame()), priority, TxPurpose::Msg, Some(id))?;
        tracing::info!(%id, channel = %message.channel, "message submitted");
        Ok((message.clone(), vec![NodeEvent::NewMessage(message)]))
    }

    /// Process one received UI frame.
    ///
    /// Framing errors inside never fail the call; they are counted and the
    /// frame dropped. Store errors surface so the RX loop can pause briefly.
    pub fn handle_ui_frame(&mut self, ui: &UiFrame) -> Result<Vec<NodeEvent>, EngineError> {
        self.counters.frames_rx += 1;
        self.carrier_activity();
        if ui.dest.base() != self.dest.base() {
            // Not our traffic (APRS beacons and friends share the channel).
            return Ok(Vec::new());
        }

        let frame = match Frame::decode(&ui.info) {
            Ok(frame) => frame,
            Err(err) => {
                self.note_framing_error(&err);
                return Ok(Vec::new());
            },
        };

        let now_secs = self.env.wall_clock_secs() as u32;
        self.sync.note_peer(ui.source);
        self.with_retry(|s| s.upsert_node(&ui.source, now_secs))?;
        let mut events = vec![NodeEvent::NodeSeen { callsign: ui.source, at: now_secs }];

        match frame {
            Frame::Msg(msg) => events.extend(self.handle_msg(ui.source, &msg)?),
            Frame::Frag(frag) => events.extend(self.handle_frag(ui.source, &frag)?),
            Frame::Sync(sync) => self.handle_sync(ui.source, &sync)?,
            Frame::Req(req) => self.handle_req(&req)?,
        }
        Ok(events)
    }

    /// Count a framing-layer error reported by the runtime (KISS or AX.25
    /// failures happen before a `UiFrame` exists).
    pub fn note_framing_error(&mut self, err: &ProtocolError) {
        match err {
            ProtocolError::KissTruncated { .. } => self.counters.kiss_truncated += 1,
            ProtocolError::Ax25Malformed { .. } => self.counters.ax25_malformed += 1,
            ProtocolError::BadMagic { .. } => self.counters.bad_magic += 1,
            ProtocolError::BadVersion { .. } => self.counters.bad_version += 1,
            ProtocolError::UnknownFrameType { .. } => self.counters.unknown_type += 1,
            _ => self.counters.malformed_frames += 1,
        }
    }

    /// The RX side heard channel activity (for CSMA).
    pub fn carrier_activity(&mut self) {
        self.txsched.carrier_activity(self.env.monotonic_millis());
    }

    /// Housekeeping: bloom rotation, sweeps, SYNC emission, REQ draining.
    pub fn tick(&mut self) -> Result<Vec<NodeEvent>, EngineError> {
        let now_ms = self.env.monotonic_millis();
        let now_secs = self.env.wall_clock_secs() as u32;

        self.seen.sweep(now_secs);

        for (_, id) in self.reassembler.sweep(now_ms) {
            self.with_retry(|s| s.delete_fragments(&id))?;
            if self.with_retry(|s| s.get_message(&id))?.is_none() {
                // Still a gap; pull it when a peer's SYNC claims the id.
                self.sync.add_wanted(id);
            }
        }

        let depth = self.with_retry(|s| s.queue_depth())?;
        let backpressure = depth >= self.queue_high_water;
        let out = self.sync.tick(&self.env, now_ms, now_secs, backpressure);
        if out.rotated {
            self.persist_windows()?;
        }
        for action in out.actions {
            match action {
                SyncAction::Sync(frame) => {
                    self.counters.syncs_tx += 1;
                    self.enqueue_frame(&Frame::Sync(frame), Priority::Normal, TxPurpose::Sync, None)?;
                },
                SyncAction::Req(frame) => {
                    self.counters.reqs_tx += 1;
                    self.enqueue_frame(&Frame::Req(frame), Priority::Normal, TxPurpose::Req, None)?;
                },
            }
        }
        Ok(Vec::new())
    }

    /// TX loop entry: lease the next eligible frame and run the CSMA policy.
    pub fn poll_tx(&mut self) -> Result<TxPoll, EngineError> {
        let now_mono = self.env.monotonic_millis();
        let gap = self.txsched.gap_remaining_ms(now_mono);
        if gap > 0 {
            return Ok(TxPoll::Idle { retry_in_ms: gap });
        }

        let now_wall_ms = self.env.wall_clock_millis();
        let Some(leased) = self.with_retry(|s| s.lease_next_tx(now_wall_ms))? else {
            return Ok(TxPoll::Idle { retry_in_ms: TX_IDLE_POLL_MS });
        };

        match self.txsched.decide(&self.env, now_mono, leased.entry.csma_defers) {
            TxDecision::Send => {
                let ui = UiFrame::new(self.dest, self.local, leased.entry.frame.clone());
                let kiss_frame = kiss::encode_frame(0, &ui.encode()?);
                self.in_flight.insert(leased.id, leased.entry);
                Ok(TxPoll::Frame { id: leased.id, kiss_frame })
            },
            TxDecision::Defer { wait_ms } => {
                self.with_retry(|s| s.defer_tx(leased.id, now_wall_ms + wait_ms))?;
                Ok(TxPoll::Idle { retry_in_ms: wait_ms })
            },
            TxDecision::DropCsma => {
                self.counters.csma_drops += 1;
                tracing::warn!(entry = leased.id, "dropping frame after repeated CSMA deferrals");
                self.with_retry(|s| s.drop_tx(leased.id))?;
                Ok(TxPoll::Idle { retry_in_ms: 0 })
            },
        }
    }

    /// The frame handed out by [`Engine::poll_tx`] made it onto the wire.
    pub fn tx_sent(&mut self, id: u64) -> Result<Vec<NodeEvent>, EngineError> {
        let entry = self.with_retry(|s| s.ack_tx(id))?;
        self.in_flight.remove(&id);
        self.txsched.on_sent(self.env.monotonic_millis());
        self.counters.frames_tx += 1;
        if let (TxPurpose::Msg, Some(msg_id)) = (entry.purpose, entry.msg_id) {
            let now_secs = self.env.wall_clock_secs() as u32;
            self.with_retry(|s| s.set_transmitted_at(&msg_id, now_secs))?;
        }
        Ok(Vec::new())
    }

    /// The frame handed out by [`Engine::poll_tx`] failed at the wire.
    pub fn tx_failed(&mut self, id: u64) -> Result<Vec<NodeEvent>, EngineError> {
        self.txsched.on_tx_failure();
        let attempts = match self.in_flight.remove(&id) {
            Some(entry) => entry.attempts.saturating_add(1),
            None => 1,
        };
        if attempts >= MAX_TX_ATTEMPTS {
            self.counters.tx_permanent_failures += 1;
            tracing::warn!(entry = id, attempts, "permanent transmit failure, dropping frame");
            self.with_retry(|s| s.drop_tx(id))?;
            let status = self.status()?;
            return Ok(vec![NodeEvent::StatusChange(status)]);
        }
        let delay = TxScheduler::nack_delay_ms(attempts);
        let eligible = self.env.wall_clock_millis() + delay;
        self.with_retry(|s| s.nack_tx(id, eligible))?;
        Ok(Vec::new())
    }

    /// Record TNC connectivity; returns a status event on change.
    pub fn set_connected(&mut self, connected: bool) -> Result<Option<NodeEvent>, EngineError> {
        if self.connected == connected {
            return Ok(None);
        }
        self.connected = connected;
        Ok(Some(NodeEvent::StatusChange(self.status()?)))
    }

    /// Engine status snapshot.
    pub fn status(&self) -> Result<Status, EngineError> {
        Ok(Status {
            connected: self.connected,
            queue_depth: self.store.queue_depth()?,
            bloom_population: self.sync.population(),
            counters: self.counters.clone(),
        })
    }

    /// Query stored messages.
    pub fn query_messages(&self, filter: &MessageFilter) -> Result<Vec<Message>, EngineError> {
        Ok(self.store.list_messages(filter)?)
    }

    /// Fetch one message by full id or ≥8-char prefix.
    pub fn query_message(&self, id_or_prefix: &str) -> Result<Option<Message>, EngineError> {
        if let Ok(id) = MessageId::parse_hex(id_or_prefix) {
            return Ok(self.store.get_message(&id)?);
        }
        if id_or_prefix.len() < rfmp_proto::ident::MIN_PREFIX_LEN {
            return Ok(None);
        }
        Ok(self.store.get_message_by_prefix(id_or_prefix)?)
    }

    /// All known channels.
    pub fn query_channels(&self) -> Result<Vec<ChannelInfo>, EngineError> {
        Ok(self.store.list_channels()?)
    }

    /// Known stations, optionally restricted to recent activity.
    pub fn query_nodes(&self, active_within_secs: Option<u32>) -> Result<Vec<NodeInfo>, EngineError> {
        let now_secs = self.env.wall_clock_secs() as u32;
        let mut nodes = self.store.list_nodes()?;
        if let Some(window) = active_within_secs {
            nodes.retain(|n| now_secs.saturating_sub(n.last_seen) <= window);
        }
        Ok(nodes)
    }

    /// Flush state that must survive a restart (Bloom windows).
    pub fn shutdown(&mut self) -> Result<(), EngineError> {
        self.persist_windows()?;
        tracing::info!("engine state flushed");
        Ok(())
    }

    fn handle_msg(&mut self, from: Callsign, frame: &MsgFrame) -> Result<Vec<NodeEvent>, EngineError> {
        let now_secs = self.env.wall_clock_secs() as u32;
        let message = match Message::from_frame(frame, from, now_secs) {
            Ok(message) => message,
            Err(EngineError::IdMismatch { .. }) => {
                self.counters.id_mismatch += 1;
                return Ok(Vec::new());
            },
            Err(EngineError::BodyNotUtf8) => {
                self.counters.malformed_frames += 1;
                return Ok(Vec::new());
            },
            Err(other) => return Err(other),
        };

        // Cheap duplicate checks before touching the store's write path.
        if self.seen.contains(&frame.id, now_secs)
            || self.with_retry(|s| s.seen_contains(&frame.id, now_secs, SEEN_TTL_SECS))?
        {
            self.counters.duplicates += 1;
            self.seen.touch(frame.id, now_secs);
            return Ok(Vec::new());
        }

        let outcome = self.with_retry(|s| s.insert_message(&message));
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(StoreError::IdMismatch { .. }) => {
                self.counters.id_mismatch += 1;
                return Ok(Vec::new());
            },
            Err(other) => return Err(other.into()),
        };
        self.seen.touch(frame.id, now_secs);
        self.with_retry(|s| s.seen_touch(&frame.id, now_secs))?;
        if outcome == InsertOutcome::Duplicate {
            self.counters.duplicates += 1;
            return Ok(Vec::new());
        }

        self.counters.messages_ingested += 1;
        self.sync.on_message_accepted(frame.id, frame.timestamp, now_secs);
        self.with_retry(|s| s.upsert_channel(&message.channel, now_secs))?;
        if let Some(reply_to) = message.reply_to {
            if self.with_retry(|s| s.get_message(&reply_to))?.is_none() {
                self.sync.add_wanted(reply_to);
            }
        }
        tracing::debug!(id = %frame.id, from = %from, "message ingested");
        Ok(vec![NodeEvent::NewMessage(message)])
    }

    fn handle_frag(&mut self, from: Callsign, frag: &FragFrame) -> Result<Vec<NodeEvent>, EngineError> {
        self.counters.fragments_rx += 1;
        let now_ms = self.env.monotonic_millis();
        let now_secs = self.env.wall_clock_secs() as u32;

        if self.seen.contains(&frag.id, now_secs) {
            // Already have the whole message; nothing to collect.
            return Ok(Vec::new());
        }

        self.with_retry(|s| {
            s.insert_fragment(&crate::store::Fragment {
                from_node: from,
                id: frag.id,
                seq: frag.seq,
                total: frag.total,
                payload: frag.payload.to_vec(),
            })
        })?;

        match self.reassembler.ingest(from, frag, now_ms) {
            FragIngest::Incomplete => Ok(Vec::new()),
            FragIngest::Complete(bytes) => {
                self.with_retry(|s| s.delete_fragments(&frag.id))?;
                match Frame::decode(&bytes) {
                    Ok(Frame::Msg(msg)) if msg.id == frag.id => {
                        self.sync.resolve_wanted(&frag.id);
                        self.handle_msg(from, &msg)
                    },
                    Ok(Frame::Msg(_)) => {
                        self.counters.reassembly_id_mismatch += 1;
                        tracing::warn!(id = %frag.id, "reassembled message id mismatch, discarding");
                        Ok(Vec::new())
                    },
                    _ => {
                        self.counters.malformed_frames += 1;
                        Ok(Vec::new())
                    },
                }
            },
        }
    }

    fn handle_sync(&mut self, from: Callsign, frame: &SyncFrame) -> Result<(), EngineError> {
        self.counters.syncs_rx += 1;
        let now_ms = self.env.monotonic_millis();
        let push = self.sync.on_sync(from, frame, now_ms);
        if push.is_empty() {
            return Ok(());
        }

        for id in push {
            let depth = self.with_retry(|s| s.queue_depth())?;
            if depth >= self.queue_high_water {
                self.counters.backpressure_dropped += 1;
                break;
            }
            let Some(message) = self.with_retry(|s| s.get_message(&id))? else { continue };
            let priority = message.priority.bumped();
            self.enqueue_frame(&Frame::Msg(message.to_frame()), priority, TxPurpose::Msg, Some(id))?;
            self.counters.pushes_enqueued += 1;
            tracing::debug!(%id, peer = %from, "pushing message the peer likely lacks");
        }
        Ok(())
    }

    fn handle_req(&mut self, frame: &ReqFrame) -> Result<(), EngineError> {
        self.counters.reqs_rx += 1;
        for id in &frame.ids {
            let depth = self.with_retry(|s| s.queue_depth())?;
            if depth >= self.queue_high_water {
                self.counters.backpressure_dropped += 1;
                break;
            }
            let Some(message) = self.with_retry(|s| s.get_message(id))? else { continue };
            self.enqueue_frame(&Frame::Msg(message.to_frame()), Priority::Normal, TxPurpose::Msg, Some(*id))?;
        }
        Ok(())
    }

    /// Encode, fragment if over the MTU, and enqueue with the adaptive delay.
    fn enqueue_frame(
        &mut self,
        frame: &Frame,
        priority: Priority,
        purpose: TxPurpose,
        msg_id: Option<MessageId>,
    ) -> Result<(), EngineError> {
        let encoded = frame.encode()?;
        let now_wall_ms = self.env.wall_clock_millis();
        let delay = self.txsched.enqueue_delay_ms(&self.env, priority.to_u8());

        if encoded.len() <= self.mtu {
            self.with_retry(|s| {
                s.enqueue_tx(&TxEntry {
                    frame: encoded.clone(),
                    priority,
                    enqueued_at: now_wall_ms,
                    attempts: 0,
                    csma_defers: 0,
                    next_eligible_at: now_wall_ms + delay,
                    purpose,
                    msg_id,
                })
            })?;
            return Ok(());
        }

        // Only MSG frames may exceed the MTU; SYNC folds itself down and
        // REQ chunks stay under 32 ids.
        let id = msg_id.ok_or(EngineError::Encode(ProtocolError::FieldTooLong {
            field: "frame",
            len: encoded.len(),
            max: self.mtu,
        }))?;
        let frags = fragment_frame(id, &encoded, self.mtu).ok_or(EngineError::Encode(
            ProtocolError::FieldTooLong { field: "frame", len: encoded.len(), max: self.mtu },
        ))?;
        for frag in frags {
            let encoded_frag = Frame::Frag(frag).encode()?;
            self.with_retry(|s| {
                s.enqueue_tx(&TxEntry {
                    frame: encoded_frag.clone(),
                    priority,
                    enqueued_at: now_wall_ms,
                    attempts: 0,
                    csma_defers: 0,
                    next_eligible_at: now_wall_ms + delay,
                    purpose: TxPurpose::Frag,
                    msg_id: Some(id),
                })
            })?;
        }
        Ok(())
    }

    fn resolve_reply_to(&mut self, reply_to: Option<&str>) -> Result<Option<MessageId>, EngineError> {
        let Some(text) = reply_to else { return Ok(None) };
        if let Ok(id) = MessageId::parse_hex(text) {
            return Ok(Some(id));
        }
        if text.len() >= rfmp_proto::ident::MIN_PREFIX_LEN {
            if let Some(message) = self.with_retry(|s| s.get_message_by_prefix(text))? {
                return Ok(Some(message.id));
            }
        }
        Err(EngineError::BadReplyTo { text: text.to_string() })
    }

    fn restore_fragments(&mut self, now_ms: u64) -> Result<(), EngineError> {
        let fragments = self.store.list_all_fragments()?;
        for fragment in fragments {
            let frag = FragFrame {
                id: fragment.id,
                seq: fragment.seq,
                total: fragment.total,
                payload: bytes::Bytes::from(fragment.payload),
            };
            if let FragIngest::Complete(assembled) =
                self.reassembler.ingest(fragment.from_node, &frag, now_ms)
            {
                // Crashed between completion and ingest; finish the job now.
                self.with_retry(|s| s.delete_fragments(&fragment.id))?;
                if let Ok(Frame::Msg(msg)) = Frame::decode(&assembled) {
                    if msg.id == fragment.id {
                        let _ = self.handle_msg(fragment.from_node, &msg)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn persist_windows(&mut self) -> Result<(), EngineError> {
        let windows: Vec<crate::bloom::BloomWindow> =
            self.sync.windows().into_iter().cloned().collect();
        for window in &windows {
            self.with_retry(|s| s.save_bloom_window(window))?;
        }
        Ok(())
    }

    /// Run a store operation, retrying once on failure (§ error policy:
    /// one retry inside the same write attempt, then surface).
    fn with_retry<T>(&mut self, op: impl Fn(&S) -> Result<T, StoreError>) -> Result<T, StoreError> {
        match op(&self.store) {
            Ok(value) => Ok(value),
            Err(StoreError::IdMismatch { claimed, fingerprint }) => {
                Err(StoreError::IdMismatch { claimed, fingerprint })
            },
            Err(first) => {
                self.counters.store_retries += 1;
                tracing::warn!(error = %first, "store operation failed, retrying once");
                op(&self.store)
            },
        }
    }
}

/// Largest on-air `m_log2` that lets a three-window SYNC fit the MTU.
fn emit_m_log2_for(mtu: usize, m_log2: u8) -> u8 {
    let mut emit = m_log2;
    while emit > 6 {
        // hdr(2) + count(1) + 3 x (opened_at(4) + salt(4) + k(1) + m_log2(1) + bits)
        let size = 3 + 3 * (10 + (1usize << emit) / 8);
        if size <= mtu {
            break;
        }
        emit -= 1;
    }
    emit
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;
    use crate::store::MemoryStore;

    /// Deterministic test environment with a manually driven clock.
    #[derive(Clone, Default)]
    pub(crate) struct TestEnv {
        inner: Arc<Mutex<TestEnvInner>>,
    }

    #[derive(Default)]
    struct TestEnvInner {
        now_ms: u64,
        rng_state: u64,
    }

    impl TestEnv {
        pub(crate) fn at(wall_secs: u64) -> Self {
            let env = Self::default();
            env.advance_to(wall_secs * 1000);
            env
        }

        pub(crate) fn advance(&self, ms: u64) {
            #[allow(clippy::expect_used)]
            let mut inner = self.inner.lock().expect("env mutex");
            inner.now_ms += ms;
        }

        pub(crate) fn advance_to(&self, ms: u64) {
            #[allow(clippy::expect_used)]
            let mut inner = self.inner.lock().expect("env mutex");
            inner.now_ms = inner.now_ms.max(ms);
        }
    }

    impl Environment for TestEnv {
        fn monotonic_millis(&self) -> u64 {
            #[allow(clippy::expect_used)]
            let inner = self.inner.lock().expect("env mutex");
            inner.now_ms
        }

        fn wall_clock_secs(&self) -> u64 {
            self.monotonic_millis() / 1000
        }

        fn wall_clock_millis(&self) -> u64 {
            self.monotonic_millis()
        }

        fn sleep(&self, _: Duration) -> impl std::future::Future<Output = ()> + Send {
            std::future::ready(())
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            #[allow(clippy::expect_used)]
            let mut inner = self.inner.lock().expect("env mutex");
            for b in buffer {
                // xorshift64; plenty for salts and jitter in tests.
                inner.rng_state = inner.rng_state.wrapping_mul(6364136223846793005).wrapping_add(1);
                *b = (inner.rng_state >> 33) as u8;
            }
        }
    }

    fn config(callsign: &str) -> Config {
        let mut config = Config::default();
        let (base, ssid) = callsign.split_once('-').unwrap_or((callsign, "0"));
        config.node.callsign = base.to_string();
        config.node.ssid = ssid.parse().unwrap();
        config
    }

    fn engine(callsign: &str) -> (Engine<TestEnv, MemoryStore>, TestEnv, MemoryStore) {
        let env = TestEnv::at(1_700_000_000);
        let store = MemoryStore::new();
        let engine = Engine::new(&config(callsign), env.clone(), store.clone()).unwrap();
        (engine, env, store)
    }

    fn drain_one_frame(engine: &mut Engine<TestEnv, MemoryStore>, env: &TestEnv) -> Vec<u8> {
        loop {
            match engine.poll_tx().unwrap() {
                TxPoll::Idle { retry_in_ms } => env.advance(retry_in_ms.max(1)),
                TxPoll::Frame { id, kiss_frame } => {
                    engine.tx_sent(id).unwrap();
                    return kiss_frame;
                },
            }
        }
    }

    fn submission(body: &str) -> Submission {
        Submission {
            channel: "general".to_string(),
            body: body.to_string(),
            priority: 1,
            reply_to: None,
            author: None,
        }
    }

    #[test]
    fn local_echo_emits_one_wellformed_frame() {
        let (mut engine, env, store) = engine("N0CALL-1");
        let (message, events) = engine.submit(submission("hello")).unwrap();

        // Fixed vector: fingerprint("N0CALL-1", 1_700_000_000, "hello").
        assert_eq!(message.id.to_hex(), "816e692578e8");
        assert_eq!(events.len(), 1);
        assert_eq!(store.message_count().unwrap(), 1);

        let wire = drain_one_frame(&mut engine, &env);
        let frames = kiss::decode_stream(&wire).unwrap();
        assert_eq!(frames.len(), 1);
        let ui = UiFrame::decode(&frames[0].1).unwrap();
        assert_eq!(ui.source.to_string(), "N0CALL-1");
        assert_eq!(ui.dest.to_string(), "RFMP");
        match Frame::decode(&ui.info).unwrap() {
            Frame::Msg(msg) => assert_eq!(msg.id, message.id),
            other => panic!("expected MSG, got {other:?}"),
        }

        // transmitted_at stamped on ack.
        let stored = store.get_message(&message.id).unwrap().unwrap();
        assert!(stored.transmitted_at.is_some());
        assert_eq!(store.queue_depth().unwrap(), 0);
    }

    #[test]
    fn duplicate_ingest_dropped_with_single_event() {
        let (mut engine, _env, store) = engine("N0CALL-1");
        let from = Callsign::parse("K7ABC").unwrap();
        let body = bytes::Bytes::from_static(b"cq cq");
        let msg = MsgFrame {
            id: MessageId::fingerprint(&from, 1_700_000_000, &body),
            timestamp: 1_700_000_000,
            priority: Priority::Normal,
            channel: "general".to_string(),
            author: String::new(),
            reply_to: None,
            body,
        };
        let ui = UiFrame::new(
            Callsign::parse("RFMP").unwrap(),
            from,
            Frame::Msg(msg).encode().unwrap(),
        );

        let first = engine.handle_ui_frame(&ui).unwrap();
        let new_messages = |events: &[NodeEvent]| {
            events.iter().filter(|e| matches!(e, NodeEvent::NewMessage(_))).count()
        };
        assert_eq!(new_messages(&first), 1);

        let second = engine.handle_ui_frame(&ui).unwrap();
        assert_eq!(new_messages(&second), 0);
        assert_eq!(store.message_count().unwrap(), 1);
        assert_eq!(engine.counters.duplicates, 1);
    }

    #[test]
    fn forged_id_rejected() {
        let (mut engine, _env, store) = engine("N0CALL-1");
        let from = Callsign::parse("K7ABC").unwrap();
        let msg = MsgFrame {
            id: MessageId::from_bytes([0xAB; 6]),
            timestamp: 1_700_000_000,
            priority: Priority::Normal,
            channel: "general".to_string(),
            author: String::new(),
            reply_to: None,
            body: bytes::Bytes::from_static(b"hi"),
        };
        let ui = UiFrame::new(
            Callsign::parse("RFMP").unwrap(),
            from,
            Frame::Msg(msg).encode().unwrap(),
        );
        let events = engine.handle_ui_frame(&ui).unwrap();
        assert!(events.iter().all(|e| !matches!(e, NodeEvent::NewMessage(_))));
        assert_eq!(store.message_count().unwrap(), 0);
        assert_eq!(engine.counters.id_mismatch, 1);
    }

    #[test]
    fn oversized_submission_fragments_and_reassembles() {
        let (mut sender, sender_env, _) = engine("N0CALL-1");
        let (mut receiver, _renv, receiver_store) = engine("K7ABC");

        let body = "A".repeat(500);
        let (message, _) = sender.submit(submission(&body)).unwrap();

        let mut frag_frames = 0;
        let mut total = 0;
        for _ in 0..16 {
            if sender.store.queue_depth().unwrap() == 0 {
                break;
            }
            let wire = drain_one_frame(&mut sender, &sender_env);
            let frames = kiss::decode_stream(&wire).unwrap();
            let ui = UiFrame::decode(&frames[0].1).unwrap();
            if let Frame::Frag(frag) = Frame::decode(&ui.info).unwrap() {
                frag_frames += 1;
                total = frag.total;
            }
            let events = receiver.handle_ui_frame(&ui).unwrap();
            for event in events {
                if let NodeEvent::NewMessage(received) = event {
                    assert_eq!(received.id, message.id);
                    assert_eq!(received.body, body);
                }
            }
        }
        assert!(frag_frames > 1, "body of 500 must fragment at MTU 200");
        assert_eq!(u8::try_from(frag_frames).unwrap(), total);
        assert_eq!(receiver_store.message_count().unwrap(), 1);
        let stored = receiver_store.get_message(&message.id).unwrap().unwrap();
        assert_eq!(stored.id, message.id);
    }

    #[test]
    fn backpressure_rejects_submissions() {
        let (mut engine, _env, store) = engine("N0CALL-1");
        engine.queue_high_water = 2;
        engine.submit(submission("one")).unwrap();
        engine.submit(submission("two")).unwrap();
        assert_eq!(store.queue_depth().unwrap(), 2);
        let err = engine.submit(submission("three")).unwrap_err();
        assert!(matches!(err, EngineError::Backpressure { depth: 2 }));
        assert_eq!(engine.counters.backpressure_dropped, 1);
    }

    #[test]
    fn req_served_from_store_at_normal_priority() {
        let (mut engine, env, store) = engine("N0CALL-1");
        let (message, _) = engine.submit(submission("keep this")).unwrap();
        let _ = drain_one_frame(&mut engine, &env);
        assert_eq!(store.queue_depth().unwrap(), 0);

        let from = Callsign::parse("K7ABC").unwrap();
        let req = Frame::Req(ReqFrame { ids: vec![message.id, MessageId::from_bytes([9; 6])] });
        let ui = UiFrame::new(Callsign::parse("RFMP").unwrap(), from, req.encode().unwrap());
        engine.handle_ui_frame(&ui).unwrap();

        assert_eq!(store.queue_depth().unwrap(), 1);
        let wire = drain_one_frame(&mut engine, &env);
        let frames = kiss::decode_stream(&wire).unwrap();
        let ui_out = UiFrame::decode(&frames[0].1).unwrap();
        match Frame::decode(&ui_out.info).unwrap() {
            Frame::Msg(msg) => assert_eq!(msg.id, message.id),
            other => panic!("expected MSG reply, got {other:?}"),
        }
    }

    #[test]
    fn restart_restores_bloom_and_emits_no_duplicate_tx() {
        let env = TestEnv::at(1_700_000_000);
        let store = MemoryStore::new();
        let cfg = config("N0CALL-1");

        let message_id = {
            let mut engine = Engine::new(&cfg, env.clone(), store.clone()).unwrap();
            let (message, _) = engine.submit(submission("hello")).unwrap();
            let _ = drain_one_frame(&mut engine, &env);
            engine.shutdown().unwrap();
            message.id
        };

        let mut restarted = Engine::new(&cfg, env.clone(), store.clone()).unwrap();
        assert!(store.get_message(&message_id).unwrap().is_some());
        assert!(restarted.sync.windows().iter().any(|w| w.contains(&message_id)));
        assert_eq!(store.queue_depth().unwrap(), 0);
        assert!(matches!(restarted.poll_tx().unwrap(), TxPoll::Idle { .. }));
    }

    #[test]
    fn sync_mtu_folding_keeps_frames_small() {
        assert_eq!(emit_m_log2_for(200, 10), 8);
        assert_eq!(emit_m_log2_for(416, 10), 9);
        assert_eq!(emit_m_log2_for(64, 10), 6);
        assert_eq!(emit_m_log2_for(1024, 10), 10);
    }

    #[test]
    fn tx_failure_backs_off_then_drops_permanently() {
        let (mut engine, env, store) = engine("N0CALL-1");
        engine.submit(submission("doomed")).unwrap();

        let mut failures = 0;
        for _ in 0..256 {
            match engine.poll_tx().unwrap() {
                TxPoll::Idle { retry_in_ms } => env.advance(retry_in_ms.max(1)),
                TxPoll::Frame { id, .. } => {
                    let events = engine.tx_failed(id).unwrap();
                    failures += 1;
                    if failures == MAX_TX_ATTEMPTS {
                        assert!(matches!(events[..], [NodeEvent::StatusChange(_)]));
                        break;
                    }
                    assert!(events.is_empty());
                },
            }
        }
        assert_eq!(failures, MAX_TX_ATTEMPTS);
        assert_eq!(engine.counters.tx_permanent_failures, 1);
        // The message row outlives the queue entry.
        assert_eq!(store.queue_depth().unwrap(), 0);
        assert_eq!(store.message_count().unwrap(), 1);
    }
}
