//! RFMP frame codec.
//!
//! Every RFMP payload starts with a two-octet header: the magic byte `0x52`
//! ('R') and `(version << 4) | type`. Four frame types exist — MSG, FRAG,
//! SYNC, REQ — expressed as one tagged [`Frame`] enum so dispatch is
//! exhaustive. All multi-byte integers are big-endian.
//!
//! Layouts (after the header):
//!
//! ```text
//! MSG   id(6) ts(4) prio(1) chan_len(1) chan author_len(1) author
//!       reply_flag(1) [reply_id(6)] body_len(2) body
//! FRAG  id(6) seq(1) total(1) payload_len(2) payload
//! SYNC  window_count(1) x { opened_at(4) salt(4) k(1) m_log2(1) bits(m/8) }
//! REQ   count(1) x id(6)
//! ```

use bytes::Bytes;

use crate::error::{ProtocolError, Result};
use crate::ident::{ID_LEN, MessageId};

/// RFMP magic byte, ASCII 'R'.
pub const MAGIC: u8 = 0x52;

/// Protocol version spoken by this implementation.
pub const VERSION: u8 = 0x3;

/// Fixed wire overhead of a FRAG frame (header + id + seq + total + len).
pub const FRAG_OVERHEAD: usize = 12;

/// Protocol limit on a MSG body.
pub const MAX_BODY_LEN: usize = 65_535;

/// Application limit on a MSG body.
pub const MAX_APP_BODY_LEN: usize = 500;

/// Limit on the author nickname, in bytes.
pub const MAX_AUTHOR_LEN: usize = 32;

/// Limit on a channel name, in bytes.
pub const MAX_CHANNEL_LEN: usize = 32;

/// Maximum ids carried by one REQ frame.
pub const MAX_REQ_IDS: usize = 255;

/// Bloom windows carried by a SYNC frame.
pub const SYNC_WINDOW_COUNT: usize = 3;

/// Accepted range of the Bloom `m_log2` parameter on receive.
pub const M_LOG2_RANGE: std::ops::RangeInclusive<u8> = 6..=14;

/// Message priority, urgent first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub enum Priority {
    /// Emergency and coordination traffic.
    Urgent = 0,
    /// Time-sensitive traffic.
    High = 1,
    /// Everyday traffic.
    Normal = 2,
    /// Background traffic (sync pushes, bulk).
    Minimal = 3,
}

impl Priority {
    /// Decode a wire priority octet. Out-of-range values clamp to
    /// [`Priority::Minimal`] rather than dropping the frame.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Urgent,
            1 => Self::High,
            2 => Self::Normal,
            _ => Self::Minimal,
        }
    }

    /// Wire octet.
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// One step lower priority, saturating at [`Priority::Minimal`].
    ///
    /// Sync pushes ride one level below the message's own priority so fresh
    /// sends always win the queue.
    pub fn bumped(self) -> Self {
        Self::from_u8(self.to_u8().saturating_add(1))
    }
}

/// Validate a channel name against `[a-z0-9_-]{1,32}`.
pub fn validate_channel(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= MAX_CHANNEL_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-');
    if ok { Ok(()) } else { Err(ProtocolError::BadChannel { text: name.to_string() }) }
}

/// A complete microblog post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgFrame {
    /// Content fingerprint (see [`MessageId::fingerprint`]).
    pub id: MessageId,
    /// UTC seconds since epoch.
    pub timestamp: u32,
    /// Transmit priority.
    pub priority: Priority,
    /// Topic label.
    pub channel: String,
    /// Operator nickname; empty for legacy senders.
    pub author: String,
    /// Id of the message this replies to.
    pub reply_to: Option<MessageId>,
    /// UTF-8 body bytes.
    pub body: Bytes,
}

/// One piece of a MSG larger than the air MTU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragFrame {
    /// Id of the message being carried.
    pub id: MessageId,
    /// Zero-based piece index.
    pub seq: u8,
    /// Total pieces, 1-255.
    pub total: u8,
    /// Slice of the encoded MSG frame.
    pub payload: Bytes,
}

/// One Bloom window as carried on the air.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowDigest {
    /// UTC second the window opened.
    pub opened_at: u32,
    /// Per-window hash salt.
    pub salt: u32,
    /// Number of hash functions.
    pub k: u8,
    /// log2 of the bit count; bits field is `2^m_log2 / 8` bytes.
    pub m_log2: u8,
    /// The bit field.
    pub bits: Bytes,
}

impl WindowDigest {
    /// Whether `id` is (probably) a member of this window.
    ///
    /// Uses the window's own salt/k/m so membership tests work against
    /// remote windows with parameters different from ours.
    pub fn contains(&self, id: &MessageId) -> bool {
        let m = 1usize << self.m_log2;
        (0..self.k).all(|i| {
            let bit = sip_bucket(self.salt, i, id) % m;
            self.bits.get(bit / 8).is_some_and(|byte| byte & (1 << (bit % 8)) != 0)
        })
    }
}

/// Bucket hash for Bloom membership: SipHash-2-4 keyed by `(salt, i)`.
pub fn sip_bucket(salt: u32, i: u8, id: &MessageId) -> usize {
    use std::hash::Hasher;
    let mut hasher = siphasher::sip::SipHasher24::new_with_keys(u64::from(salt), u64::from(i));
    hasher.write(id.as_bytes());
    hasher.finish() as usize
}

/// Anti-entropy advertisement of recently seen message ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncFrame {
    /// The advertised windows, newest first.
    pub windows: Vec<WindowDigest>,
}

/// Request for specific messages by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReqFrame {
    /// Requested ids, up to 255.
    pub ids: Vec<MessageId>,
}

/// The four RFMP frame types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A microblog post.
    Msg(MsgFrame),
    /// A fragment of an oversized post.
    Frag(FragFrame),
    /// A Bloom-window advertisement.
    Sync(SyncFrame),
    /// A pull request for specific ids.
    Req(ReqFrame),
}

impl Frame {
    /// Wire type nibble.
    pub fn type_nibble(&self) -> u8 {
        match self {
            Self::Msg(_) => 0,
            Self::Frag(_) => 1,
            Self::Sync(_) => 2,
            Self::Req(_) => 3,
        }
    }

    /// Encode to payload bytes (the AX.25 information field).
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::FieldTooLong`] / [`ProtocolError::BadChannel`]
    /// when a field exceeds its wire limit.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(64);
        out.push(MAGIC);
        out.push((VERSION << 4) | self.type_nibble());
        match self {
            Self::Msg(msg) => encode_msg(msg, &mut out)?,
            Self::Frag(frag) => encode_frag(frag, &mut out)?,
            Self::Sync(sync) => encode_sync(sync, &mut out)?,
            Self::Req(req) => encode_req(req, &mut out)?,
        }
        Ok(out)
    }

    /// Decode payload bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::BadMagic`] / [`ProtocolError::BadVersion`] /
    /// [`ProtocolError::UnknownFrameType`] for foreign traffic and
    /// [`ProtocolError::Truncated`] (among others) for mangled frames.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        let magic = r.u8()?;
        if magic != MAGIC {
            return Err(ProtocolError::BadMagic { found: magic });
        }
        let vt = r.u8()?;
        let version = vt >> 4;
        if version != VERSION {
            return Err(ProtocolError::BadVersion { found: version });
        }
        match vt & 0x0F {
            0 => decode_msg(&mut r).map(Self::Msg),
            1 => decode_frag(&mut r).map(Self::Frag),
            2 => decode_sync(&mut r).map(Self::Sync),
            3 => decode_req(&mut r).map(Self::Req),
            other => Err(ProtocolError::UnknownFrameType { found: other }),
        }
    }
}

fn encode_msg(msg: &MsgFrame, out: &mut Vec<u8>) -> Result<()> {
    validate_channel(&msg.channel)?;
    if msg.author.len() > MAX_AUTHOR_LEN {
        return Err(ProtocolError::FieldTooLong {
            field: "author",
            len: msg.author.len(),
            max: MAX_AUTHOR_LEN,
        });
    }
    if msg.body.len() > MAX_BODY_LEN {
        return Err(ProtocolError::FieldTooLong {
            field: "body",
            len: msg.body.len(),
            max: MAX_BODY_LEN,
        });
    }

    out.extend_from_slice(msg.id.as_bytes());
    out.extend_from_slice(&msg.timestamp.to_be_bytes());
    out.push(msg.priority.to_u8());
    out.push(msg.channel.len() as u8);
    out.extend_from_slice(msg.channel.as_bytes());
    out.push(msg.author.len() as u8);
    out.extend_from_slice(msg.author.as_bytes());
    match msg.reply_to {
        Some(reply_id) => {
            out.push(1);
            out.extend_from_slice(reply_id.as_bytes());
        },
        None => out.push(0),
    }
    out.extend_from_slice(&(msg.body.len() as u16).to_be_bytes());
    out.extend_from_slice(&msg.body);
    Ok(())
}

fn decode_msg(r: &mut Reader<'_>) -> Result<MsgFrame> {
    let id = r.message_id()?;
    let timestamp = r.u32()?;
    let priority = Priority::from_u8(r.u8()?);

    let chan_len = r.u8()? as usize;
    let channel = r.utf8("channel", chan_len)?;
    validate_channel(&channel)?;

    let author_len = r.u8()? as usize;
    let author = r.utf8("author", author_len)?;

    let reply_to = match r.u8()? {
        0 => None,
        _ => Some(r.message_id()?),
    };

    let body_len = r.u16()? as usize;
    let body = r.bytes(body_len)?;
    Ok(MsgFrame { id, timestamp, priority, channel, author, reply_to, body })
}

fn encode_frag(frag: &FragFrame, out: &mut Vec<u8>) -> Result<()> {
    if frag.total == 0 || frag.seq >= frag.total {
        return Err(ProtocolError::InvalidFragment { seq: frag.seq, total: frag.total });
    }
    if frag.payload.len() > u16::MAX as usize {
        return Err(ProtocolError::FieldTooLong {
            field: "fragment payload",
            len: frag.payload.len(),
            max: u16::MAX as usize,
        });
    }
    out.extend_from_slice(frag.id.as_bytes());
    out.push(frag.seq);
    out.push(frag.total);
    out.extend_from_slice(&(frag.payload.len() as u16).to_be_bytes());
    out.extend_from_slice(&frag.payload);
    Ok(())
}

fn decode_frag(r: &mut Reader<'_>) -> Result<FragFrame> {
    let id = r.message_id()?;
    let seq = r.u8()?;
    let total = r.u8()?;
    if total == 0 || seq >= total {
        return Err(ProtocolError::InvalidFragment { seq, total });
    }
    let payload_len = r.u16()? as usize;
    let payload = r.bytes(payload_len)?;
    Ok(FragFrame { id, seq, total, payload })
}

fn encode_sync(sync: &SyncFrame, out: &mut Vec<u8>) -> Result<()> {
    if sync.windows.len() != SYNC_WINDOW_COUNT {
        return Err(ProtocolError::FieldTooLong {
            field: "sync windows",
            len: sync.windows.len(),
            max: SYNC_WINDOW_COUNT,
        });
    }
    out.push(sync.windows.len() as u8);
    for w in &sync.windows {
        if !M_LOG2_RANGE.contains(&w.m_log2) {
            return Err(ProtocolError::BadWindowSize { found: w.m_log2 });
        }
        out.extend_from_slice(&w.opened_at.to_be_bytes());
        out.extend_from_slice(&w.salt.to_be_bytes());
        out.push(w.k);
        out.push(w.m_log2);
        out.extend_from_slice(&w.bits);
    }
    Ok(())
}

fn decode_sync(r: &mut Reader<'_>) -> Result<SyncFrame> {
    let count = r.u8()? as usize;
    if count > SYNC_WINDOW_COUNT {
        return Err(ProtocolError::FieldTooLong {
            field: "sync windows",
            len: count,
            max: SYNC_WINDOW_COUNT,
        });
    }
    let mut windows = Vec::with_capacity(count);
    for _ in 0..count {
        let opened_at = r.u32()?;
        let salt = r.u32()?;
        let k = r.u8()?;
        let m_log2 = r.u8()?;
        if !M_LOG2_RANGE.contains(&m_log2) {
            return Err(ProtocolError::BadWindowSize { found: m_log2 });
        }
        let bits = r.bytes((1usize << m_log2) / 8)?;
        windows.push(WindowDigest { opened_at, salt, k, m_log2, bits });
    }
    Ok(SyncFrame { windows })
}

fn encode_req(req: &ReqFrame, out: &mut Vec<u8>) -> Result<()> {
    if req.ids.len() > MAX_REQ_IDS {
        return Err(ProtocolError::FieldTooLong {
            field: "req ids",
            len: req.ids.len(),
            max: MAX_REQ_IDS,
        });
    }
    out.push(req.ids.len() as u8);
    for id in &req.ids {
        out.extend_from_slice(id.as_bytes());
    }
    Ok(())
}

fn decode_req(r: &mut Reader<'_>) -> Result<ReqFrame> {
    let count = r.u8()? as usize;
    let mut ids = Vec::with_capacity(count);
    for _ in 0..count {
        ids.push(r.message_id()?);
    }
    Ok(ReqFrame { ids })
}

/// Bounds-checked big-endian field reader.
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let remaining = self.bytes.len() - self.pos;
        if remaining < n {
            return Err(ProtocolError::Truncated { needed: n - remaining, remaining });
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let s = self.take(2)?;
        Ok(u16::from_be_bytes([s[0], s[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let s = self.take(4)?;
        Ok(u32::from_be_bytes([s[0], s[1], s[2], s[3]]))
    }

    fn bytes(&mut self, n: usize) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(self.take(n)?))
    }

    fn utf8(&mut self, field: &'static str, n: usize) -> Result<String> {
        let raw = self.take(n)?;
        String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::BadUtf8 { field })
    }

    fn message_id(&mut self) -> Result<MessageId> {
        let s = self.take(ID_LEN)?;
        let mut id = [0u8; ID_LEN];
        id.copy_from_slice(s);
        Ok(MessageId::from_bytes(id))
    }
}
