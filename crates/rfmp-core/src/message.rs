//! Domain records: messages, directory entries, events, status.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use rfmp_proto::{Callsign, MessageId, MsgFrame, Priority};

use crate::error::EngineError;
use crate::metrics::Counters;

/// A stored microblog post.
///
/// The identity invariant is `id == fingerprint(from_node, timestamp, body)`;
/// rows violating it are rejected on ingest and on insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Content fingerprint.
    pub id: MessageId,
    /// Radio node that transmitted the message.
    pub from_node: Callsign,
    /// Operator nickname; may differ from `from_node`, may be empty.
    pub author: String,
    /// UTC seconds since epoch.
    pub timestamp: u32,
    /// Topic label, `[a-z0-9_-]{1,32}`.
    pub channel: String,
    /// Transmit priority.
    pub priority: Priority,
    /// Message this replies to, if any.
    pub reply_to: Option<MessageId>,
    /// UTF-8 body, at most 500 bytes from the application.
    pub body: String,
    /// When our TX loop put it on the air.
    pub transmitted_at: Option<u32>,
    /// When it arrived over the air.
    pub received_at: Option<u32>,
}

impl Message {
    /// Whether the identity invariant holds.
    pub fn verify_id(&self) -> bool {
        MessageId::fingerprint(&self.from_node, self.timestamp, self.body.as_bytes()) == self.id
    }

    /// Build a stored message from a received MSG frame.
    ///
    /// `from_node` is the AX.25 source that transmitted the frame. The
    /// fingerprint is recomputed here; a frame whose id disagrees is a
    /// relay or a forgery and is rejected with [`EngineError::IdMismatch`].
    pub fn from_frame(
        frame: &MsgFrame,
        from_node: Callsign,
        received_at: u32,
    ) -> Result<Self, EngineError> {
        let expected = MessageId::fingerprint(&from_node, frame.timestamp, &frame.body);
        if expected != frame.id {
            return Err(EngineError::IdMismatch { expected, actual: frame.id });
        }
        let body = std::str::from_utf8(&frame.body)
            .map_err(|_| EngineError::BodyNotUtf8)?
            .to_string();
        Ok(Self {
            id: frame.id,
            from_node,
            author: frame.author.clone(),
            timestamp: frame.timestamp,
            channel: frame.channel.clone(),
            priority: frame.priority,
            reply_to: frame.reply_to,
            body,
            transmitted_at: None,
            received_at: Some(received_at),
        })
    }

    /// Re-encode as a MSG frame for (re)transmission.
    pub fn to_frame(&self) -> MsgFrame {
        MsgFrame {
            id: self.id,
            timestamp: self.timestamp,
            priority: self.priority,
            channel: self.channel.clone(),
            author: self.author.clone(),
            reply_to: self.reply_to,
            body: Bytes::copy_from_slice(self.body.as_bytes()),
        }
    }
}

/// A station heard on the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Station callsign.
    pub callsign: Callsign,
    /// First time we heard it, UTC seconds.
    pub first_seen: u32,
    /// Most recent time we heard it, UTC seconds.
    pub last_seen: u32,
    /// Frames ingested from it.
    pub packet_count: u64,
}

/// A topic channel with activity counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    /// Channel name.
    pub name: String,
    /// Messages stored for it.
    pub message_count: u64,
    /// Last message timestamp, UTC seconds.
    pub last_activity: u32,
}

/// Query filter for [`crate::store::Store::list_messages`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageFilter {
    /// Restrict to one channel.
    pub channel: Option<String>,
    /// Only messages with `timestamp >= since`.
    pub since: Option<u32>,
    /// Maximum rows returned (0 means no limit).
    pub limit: usize,
}

/// Engine status snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    /// Whether the TNC link is up.
    pub connected: bool,
    /// Entries waiting in the transmission queue.
    pub queue_depth: u64,
    /// Ids held across the three Bloom windows.
    pub bloom_population: u64,
    /// Protocol counters.
    pub counters: Counters,
}

/// Events published to external subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeEvent {
    /// A message was accepted (local submit or over-the-air ingest).
    NewMessage(Message),
    /// A station was heard.
    NodeSeen {
        /// Station callsign.
        callsign: Callsign,
        /// When, UTC seconds.
        at: u32,
    },
    /// Connectivity or counter state changed.
    StatusChange(Status),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cs(text: &str) -> Callsign {
        Callsign::parse(text).unwrap()
    }

    fn frame_from(from: &Callsign, ts: u32, body: &'static [u8]) -> MsgFrame {
        MsgFrame {
            id: MessageId::fingerprint(from, ts, body),
            timestamp: ts,
            priority: Priority::Normal,
            channel: "general".to_string(),
            author: String::new(),
            reply_to: None,
            body: Bytes::from_static(body),
        }
    }

    #[test]
    fn from_frame_accepts_matching_fingerprint() {
        let from = cs("N0CALL-1");
        let frame = frame_from(&from, 1_700_000_000, b"hello");
        let msg = Message::from_frame(&frame, from, 1_700_000_005).unwrap();
        assert!(msg.verify_id());
        assert_eq!(msg.received_at, Some(1_700_000_005));
        assert_eq!(msg.body, "hello");
    }

    #[test]
    fn from_frame_rejects_forged_source() {
        let from = cs("N0CALL-1");
        let frame = frame_from(&from, 1_700_000_000, b"hello");
        let err = Message::from_frame(&frame, cs("K7ABC"), 0).unwrap_err();
        assert!(matches!(err, EngineError::IdMismatch { .. }));
    }

    #[test]
    fn round_trip_through_frame() {
        let from = cs("N0CALL-1");
        let frame = frame_from(&from, 1_700_000_000, b"hello");
        let msg = Message::from_frame(&frame, from, 1).unwrap();
        assert_eq!(msg.to_frame(), frame);
    }
}
