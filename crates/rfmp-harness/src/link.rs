//! Lossless in-memory radio net connecting simulated engines.
//!
//! Radio is a broadcast medium: every frame one station transmits is heard
//! by every other station. The net pumps each engine's TX queue through the
//! real KISS and AX.25 codecs so the full wire stack is exercised, then
//! hands the decoded UI frames to every other engine.

#![allow(clippy::expect_used, reason = "test harness; failures should panic loudly")]

use rfmp_core::engine::{Engine, TxPoll};
use rfmp_core::store::MemoryStore;
use rfmp_core::{Config, NodeEvent, Store};
use rfmp_proto::{UiFrame, kiss};

use crate::SimEnv;

/// One simulated station.
pub struct SimNode {
    /// The engine under test.
    pub engine: Engine<SimEnv, MemoryStore>,
    /// Its store, for end-state assertions.
    pub store: MemoryStore,
    /// Events published so far.
    pub events: Vec<NodeEvent>,
}

/// A broadcast net of simulated stations on one virtual clock.
pub struct SimNet {
    /// The shared environment; advance time through this.
    pub env: SimEnv,
    nodes: Vec<SimNode>,
    round: usize,
}

impl SimNet {
    /// Empty net on a fresh seeded environment.
    pub fn new(seed: u64, start_secs: u64) -> Self {
        Self { env: SimEnv::with_seed(seed, start_secs), nodes: Vec::new(), round: 0 }
    }

    /// Add a station; returns its index.
    pub fn add_node(&mut self, callsign: &str) -> usize {
        let mut config = Config::default();
        let (base, ssid) = callsign.split_once('-').unwrap_or((callsign, "0"));
        config.node.callsign = base.to_string();
        config.node.ssid = ssid.parse().expect("numeric SSID");

        let store = MemoryStore::new();
        let engine = Engine::new(&config, self.env.clone(), store.clone())
            .expect("engine construction");
        self.nodes.push(SimNode { engine, store, events: Vec::new() });
        self.nodes.len() - 1
    }

    /// Access a station.
    pub fn node(&mut self, index: usize) -> &mut SimNode {
        &mut self.nodes[index]
    }

    /// All stations.
    pub fn nodes(&self) -> &[SimNode] {
        &self.nodes
    }

    /// Advance time and run one scheduling round on every station.
    ///
    /// Returns the wire frames transmitted this step (already delivered).
    pub fn step(&mut self, ms: u64) -> Vec<Vec<u8>> {
        self.env.advance(ms);

        for node in &mut self.nodes {
            let events = node.engine.tick().expect("tick");
            node.events.extend(events);
        }

        // Rotate which station gets the channel first so one chatty
        // transmitter cannot CSMA-starve the rest of the net forever.
        let count = self.nodes.len();
        self.round = self.round.wrapping_add(1);
        let mut transmitted = Vec::new();
        for offset in 0..count {
            let index = (self.round + offset) % count;
            while let Some(wire) = self.pump_one(index) {
                self.broadcast(index, &wire);
                transmitted.push(wire);
            }
        }
        transmitted
    }

    /// Run until `done` or the step budget is exhausted; returns steps used.
    pub fn run_until(
        &mut self,
        step_ms: u64,
        max_steps: usize,
        mut done: impl FnMut(&Self) -> bool,
    ) -> usize {
        for step in 0..max_steps {
            if done(self) {
                return step;
            }
            self.step(step_ms);
        }
        max_steps
    }

    /// Drain a station's TX queue into the ether without delivering
    /// anything — the station is out of range of everyone. Used to seed
    /// disjoint stores before anti-entropy is allowed to repair them.
    pub fn drain_isolated(&mut self, index: usize) {
        loop {
            if self.pump_one(index).is_none() {
                let depth = self.nodes[index].store.queue_depth().expect("queue depth");
                if depth == 0 {
                    return;
                }
                self.env.advance(100);
            }
        }
    }

    /// Drain at most one frame from a station's TX queue.
    fn pump_one(&mut self, index: usize) -> Option<Vec<u8>> {
        let node = &mut self.nodes[index];
        match node.engine.poll_tx().expect("poll_tx") {
            TxPoll::Idle { .. } => None,
            TxPoll::Frame { id, kiss_frame } => {
                let events = node.engine.tx_sent(id).expect("tx_sent");
                node.events.extend(events);
                Some(kiss_frame)
            },
        }
    }

    /// Deliver a wire frame to every station except the transmitter.
    fn broadcast(&mut self, from: usize, wire: &[u8]) {
        let frames = kiss::decode_stream(wire).expect("clean kiss stream");
        for (receiver_index, node) in self.nodes.iter_mut().enumerate() {
            if receiver_index == from {
                continue;
            }
            for (_, payload) in &frames {
                let ui = UiFrame::decode(payload).expect("well-formed AX.25");
                let events = node.engine.handle_ui_frame(&ui).expect("ingest");
                node.events.extend(events);
            }
        }
    }
}
