//! Property tests across the three framing layers.

use bytes::Bytes;
use proptest::prelude::*;
use rfmp_proto::{
    Callsign, Frame, FragFrame, MessageId, MsgFrame, Priority, ReqFrame, SyncFrame, UiFrame,
    WindowDigest, kiss,
};

fn arb_callsign() -> impl Strategy<Value = Callsign> {
    ("[A-Z0-9]{1,6}", 0u8..=15).prop_map(|(base, ssid)| {
        Callsign::with_ssid(&base, ssid).expect("generated callsign is valid")
    })
}

fn arb_message_id() -> impl Strategy<Value = MessageId> {
    any::<[u8; 6]>().prop_map(MessageId::from_bytes)
}

fn arb_msg() -> impl Strategy<Value = MsgFrame> {
    (
        arb_message_id(),
        any::<u32>(),
        0u8..=3,
        "[a-z0-9_-]{1,32}",
        "[a-zA-Z ]{0,32}",
        proptest::option::of(arb_message_id()),
        proptest::collection::vec(any::<u8>(), 0..600),
    )
        .prop_map(|(id, timestamp, prio, channel, author, reply_to, body)| MsgFrame {
            id,
            timestamp,
            priority: Priority::from_u8(prio),
            channel,
            author,
            reply_to,
            body: Bytes::from(body),
        })
}

fn arb_frame() -> impl Strategy<Value = Frame> {
    prop_oneof![
        arb_msg().prop_map(Frame::Msg),
        (arb_message_id(), 0u8..8, proptest::collection::vec(any::<u8>(), 0..200)).prop_map(
            |(id, seq, payload)| {
                Frame::Frag(FragFrame { id, seq, total: 8, payload: Bytes::from(payload) })
            }
        ),
        proptest::collection::vec((any::<u32>(), any::<u32>(), 1u8..=6, 6u8..=10), 3..=3)
            .prop_map(|params| {
                let windows = params
                    .into_iter()
                    .map(|(opened_at, salt, k, m_log2)| WindowDigest {
                        opened_at,
                        salt,
                        k,
                        m_log2,
                        bits: Bytes::from(vec![0u8; (1usize << m_log2) / 8]),
                    })
                    .collect();
                Frame::Sync(SyncFrame { windows })
            }),
        proptest::collection::vec(arb_message_id(), 0..40)
            .prop_map(|ids| Frame::Req(ReqFrame { ids })),
    ]
}

proptest! {
    // decode(encode(p, x)) == [(p, x)] for any payload bytes.
    #[test]
    fn kiss_round_trip(port in 0u8..16, payload in proptest::collection::vec(any::<u8>(), 0..1024)) {
        let encoded = kiss::encode_frame(port, &payload);
        let frames = kiss::decode_stream(&encoded).expect("clean stream");
        prop_assert_eq!(frames.len(), 1);
        prop_assert_eq!(frames[0].0, port);
        prop_assert_eq!(frames[0].1.as_ref(), payload.as_slice());
    }

    #[test]
    fn kiss_stream_of_many(frames in proptest::collection::vec(
        proptest::collection::vec(any::<u8>(), 1..64), 1..8))
    {
        let mut stream = Vec::new();
        for f in &frames {
            stream.extend_from_slice(&kiss::encode_frame(0, f));
        }
        let decoded = kiss::decode_stream(&stream).expect("clean stream");
        prop_assert_eq!(decoded.len(), frames.len());
        for (got, want) in decoded.iter().zip(&frames) {
            prop_assert_eq!(got.1.as_ref(), want.as_slice());
        }
    }

    #[test]
    fn ax25_round_trip(dest in arb_callsign(), source in arb_callsign(),
                       digis in proptest::collection::vec(arb_callsign(), 0..=8),
                       info in proptest::collection::vec(any::<u8>(), 0..256))
    {
        let mut frame = UiFrame::new(dest, source, Bytes::from(info));
        frame.digipeaters = digis;
        let decoded = UiFrame::decode(&frame.encode().expect("encodes")).expect("decodes");
        prop_assert_eq!(decoded, frame);
    }

    #[test]
    fn rfmp_frame_round_trip(frame in arb_frame()) {
        let encoded = frame.encode().expect("encodes");
        let decoded = Frame::decode(&encoded).expect("decodes");
        prop_assert_eq!(decoded, frame);
    }

    // Fingerprints are deterministic and stable across the stack.
    #[test]
    fn fingerprint_matches_reference(call in arb_callsign(), ts in any::<u32>(),
                                     body in proptest::collection::vec(any::<u8>(), 0..128))
    {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(call.to_string().as_bytes());
        hasher.update([0x1F]);
        hasher.update(ts.to_be_bytes());
        hasher.update([0x1F]);
        hasher.update(&body);
        let digest = hasher.finalize();

        let id = MessageId::fingerprint(&call, ts, &body);
        prop_assert_eq!(id.as_bytes().as_slice(), &digest[..6]);
        prop_assert_eq!(id.to_hex(), hex::encode(&digest[..6]));
    }

    // A full stack pass: RFMP -> AX.25 -> KISS -> AX.25 -> RFMP.
    #[test]
    fn full_stack_round_trip(msg in arb_msg(), source in arb_callsign()) {
        let dest = Callsign::parse("RFMP").expect("fixed dest");
        let rfmp = Frame::Msg(msg);
        let ui = UiFrame::new(dest, source, rfmp.encode().expect("rfmp encodes"));
        let wire = kiss::encode_frame(0, &ui.encode().expect("ax25 encodes"));

        let frames = kiss::decode_stream(&wire).expect("kiss decodes");
        prop_assert_eq!(frames.len(), 1);
        let ui_back = UiFrame::decode(&frames[0].1).expect("ax25 decodes");
        prop_assert_eq!(&ui_back.source, &source);
        let rfmp_back = Frame::decode(&ui_back.info).expect("rfmp decodes");
        prop_assert_eq!(rfmp_back, rfmp);
    }
}
