//! KISS framing over a TNC byte stream.
//!
//! Frames are delimited by `FEND`. Within a frame, `FEND` is transposed to
//! `FESC TFEND` and `FESC` to `FESC TFESC`. The first octet inside a frame is
//! `(port << 4) | command`; RFMP only exchanges command 0 (data) frames and
//! the decoder silently drops everything else.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::error::{ProtocolError, Result};

const FEND: u8 = 0xC0;
const FESC: u8 = 0xDB;
const TFEND: u8 = 0xDC;
const TFESC: u8 = 0xDD;

/// KISS command nibble for data frames.
pub const CMD_DATA: u8 = 0x00;

/// Encode one data frame for the given TNC port.
///
/// Produces `FEND`, the port/command octet, the stuffed payload, and a
/// trailing `FEND`. Emitting two frames back to back yields a double `FEND`
/// at the boundary, which decoders treat as an empty frame and skip.
pub fn encode_frame(port: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.push(FEND);
    out.push((port << 4) | CMD_DATA);
    for &b in payload {
        match b {
            FEND => out.extend_from_slice(&[FESC, TFEND]),
            FESC => out.extend_from_slice(&[FESC, TFESC]),
            _ => out.push(b),
        }
    }
    out.push(FEND);
    out
}

/// Incremental KISS decoder.
///
/// Feed raw TNC bytes with [`Deframer::extend`] and drain decoded
/// `(port, payload)` data frames with [`Deframer::next_frame`]. Bytes that
/// arrive before the first `FEND` (stale output from a TNC we just connected
/// to) are discarded while scanning for the frame boundary.
#[derive(Debug, Default)]
pub struct Deframer {
    buf: Vec<u8>,
    in_frame: bool,
    escaped: bool,
    ready: VecDeque<(u8, Bytes)>,
}

impl Deframer {
    /// New decoder in the draining state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a chunk of the byte stream.
    pub fn extend(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.push_byte(b);
        }
    }

    /// Next decoded data frame, if one has completed.
    pub fn next_frame(&mut self) -> Option<(u8, Bytes)> {
        self.ready.pop_front()
    }

    /// Assert the stream ended cleanly.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::KissTruncated`] when EOF arrives inside an
    /// unterminated frame.
    pub fn finish(&self) -> Result<()> {
        if self.in_frame && !self.buf.is_empty() {
            return Err(ProtocolError::KissTruncated { buffered: self.buf.len() });
        }
        Ok(())
    }

    fn push_byte(&mut self, b: u8) {
        if !self.in_frame {
            if b == FEND {
                self.in_frame = true;
            }
            return;
        }

        if b == FEND {
            // Consecutive FENDs produce empty buffers; those are not frames.
            if !self.buf.is_empty() {
                self.complete_frame();
            }
            self.escaped = false;
            return;
        }

        if self.escaped {
            self.escaped = false;
            match b {
                TFEND => self.buf.push(FEND),
                TFESC => self.buf.push(FESC),
                // Invalid escape: drop both octets and keep scanning.
                _ => {},
            }
            return;
        }

        if b == FESC {
            self.escaped = true;
        } else {
            self.buf.push(b);
        }
    }

    fn complete_frame(&mut self) {
        let frame = std::mem::take(&mut self.buf);
        let header = frame[0];
        let cmd = header & 0x0F;
        let port = header >> 4;
        if cmd == CMD_DATA {
            self.ready.push_back((port, Bytes::copy_from_slice(&frame[1..])));
        }
    }
}

/// Decode a complete byte stream into its data frames.
///
/// # Errors
///
/// Returns [`ProtocolError::KissTruncated`] when the stream ends mid-frame.
pub fn decode_stream(bytes: &[u8]) -> Result<Vec<(u8, Bytes)>> {
    let mut deframer = Deframer::new();
    deframer.extend(bytes);
    deframer.finish()?;
    let mut out = Vec::new();
    while let Some(frame) = deframer.next_frame() {
        out.push(frame);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_plain() {
        let encoded = encode_frame(0, &[1, 2, 3]);
        assert_eq!(encoded, vec![FEND, 0x00, 1, 2, 3, FEND]);
        let frames = decode_stream(&encoded).unwrap();
        assert_eq!(frames, vec![(0, Bytes::from_static(&[1, 2, 3]))]);
    }

    #[test]
    fn round_trip_special_octets() {
        let payload = [0, FEND, 1, FESC, TFEND, TFESC, FEND];
        let encoded = encode_frame(3, &payload);
        let frames = decode_stream(&encoded).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0, 3);
        assert_eq!(frames[0].1.as_ref(), &payload);
    }

    #[test]
    fn double_fend_between_frames() {
        let mut stream = encode_frame(0, b"one");
        stream.push(FEND);
        stream.extend_from_slice(&encode_frame(0, b"two"));
        let frames = decode_stream(&stream).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].1.as_ref(), b"one");
        assert_eq!(frames[1].1.as_ref(), b"two");
    }

    #[test]
    fn non_data_commands_dropped() {
        // Command 1 is a TxDelay configuration frame; not ours.
        let stream = [FEND, 0x01, 0x42, FEND, FEND, 0x00, 0x07, FEND];
        let frames = decode_stream(&stream).unwrap();
        assert_eq!(frames, vec![(0, Bytes::from_static(&[0x07]))]);
    }

    #[test]
    fn leading_garbage_drained() {
        let mut stream = vec![0xAA, 0xBB, 0xCC];
        stream.extend_from_slice(&encode_frame(0, b"ok"));
        let frames = decode_stream(&stream).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].1.as_ref(), b"ok");
    }

    #[test]
    fn truncated_stream_rejected() {
        let stream = [FEND, 0x00, 1, 2, 3];
        assert_eq!(
            decode_stream(&stream),
            Err(ProtocolError::KissTruncated { buffered: 4 })
        );
    }

    #[test]
    fn split_feeds_reassemble() {
        let encoded = encode_frame(0, &[FEND, 9, 8, FESC]);
        let mut deframer = Deframer::new();
        for chunk in encoded.chunks(1) {
            deframer.extend(chunk);
        }
        deframer.finish().unwrap();
        let (port, payload) = deframer.next_frame().unwrap();
        assert_eq!(port, 0);
        assert_eq!(payload.as_ref(), &[FEND, 9, 8, FESC]);
        assert!(deframer.next_frame().is_none());
    }
}
