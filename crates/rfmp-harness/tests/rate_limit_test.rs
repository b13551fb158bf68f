//! REQ rate limiting under a SYNC flood.
//!
//! An engine with dozens of known gaps is fed a hundred SYNCs claiming all
//! of them. Over the first minute it may emit at most six REQ frames, the
//! starved candidates stay queued, and the engine keeps accepting work.

use rfmp_core::bloom::BloomWindow;
use rfmp_core::engine::Engine;
use rfmp_core::store::MemoryStore;
use rfmp_core::{Config, Store, Submission};
use rfmp_harness::SimEnv;
use rfmp_proto::{Callsign, Frame, MessageId, SyncFrame, UiFrame};

const START_SECS: u64 = 1_700_000;

fn config() -> Config {
    let mut config = Config::default();
    config.node.callsign = "N0CALL".to_string();
    config.node.ssid = 1;
    config
}

fn fake_id(n: u16) -> MessageId {
    let mut bytes = [0xE0u8; 6];
    bytes[4..].copy_from_slice(&n.to_be_bytes());
    MessageId::from_bytes(bytes)
}

/// A peer SYNC whose current window claims every given id.
fn claiming_sync(ids: &[MessageId], opened_at: u32) -> SyncFrame {
    let mut current = BloomWindow::open(0, opened_at, 9_999, 4, 10);
    for id in ids {
        current.insert(id);
    }
    let previous = BloomWindow::open(1, opened_at.saturating_sub(600), 9_998, 4, 10);
    let oldest = BloomWindow::open(2, opened_at.saturating_sub(1_200), 9_997, 4, 10);
    SyncFrame {
        windows: vec![current.to_digest(), previous.to_digest(), oldest.to_digest()],
    }
}

#[test]
fn sync_flood_emits_at_most_six_reqs_per_minute() {
    let env = SimEnv::with_seed(11, START_SECS);
    let store = MemoryStore::new();
    let mut engine = Engine::new(&config(), env.clone(), store.clone()).expect("engine");

    // Fifty known gaps: replies referencing ids we have never stored.
    let wanted: Vec<MessageId> = (0..50).map(fake_id).collect();
    for (i, id) in wanted.iter().enumerate() {
        engine
            .submit(Submission {
                channel: "general".to_string(),
                body: format!("re {i}"),
                priority: 1,
                reply_to: Some(id.to_hex()),
                author: None,
            })
            .expect("submit");
    }

    let peer = Callsign::parse("K7ABC").expect("callsign");
    let dest = Callsign::parse("RFMP").expect("callsign");
    let sync = claiming_sync(&wanted, START_SECS as u32);
    let payload = Frame::Sync(sync).encode().expect("encode");

    // One hundred SYNCs spread across sixty seconds, ticking as we go.
    for i in 0..100u64 {
        let ui = UiFrame::new(dest, peer, payload.clone());
        engine.handle_ui_frame(&ui).expect("ingest sync");
        if i % 5 == 0 {
            engine.tick().expect("tick");
        }
        env.advance(600);
    }

    let status = engine.status().expect("status");
    let reqs = status.counters.reqs_tx;
    assert!(reqs <= 6, "emitted {reqs} REQ frames in one minute");
    assert!(reqs >= 1, "rate limiter starved REQs entirely");

    // No deadlock: the engine still accepts queries and the queue is bounded
    // work, not wedged state.
    assert!(status.counters.syncs_rx == 100);
    assert!(store.queue_depth().expect("depth") > 0);

    // Over the next ten minutes the deferred candidates drain (backoff is
    // deferral, not loss). One more peer SYNC re-advertises the gaps.
    let ui = UiFrame::new(dest, peer, payload.clone());
    engine.handle_ui_frame(&ui).expect("ingest sync");
    for _ in 0..600 {
        env.advance(1_000);
        engine.tick().expect("tick");
    }
    let later = engine.status().expect("status");
    assert!(later.counters.reqs_tx > reqs, "deferred REQ candidates were dropped");
}
