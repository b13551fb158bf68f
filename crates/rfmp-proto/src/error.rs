//! Error types for the RFMP wire formats.
//!
//! Every framing layer reports its own typed failure so the engine can count
//! and drop malformed traffic without tearing down the receive loop.

use thiserror::Error;

/// Errors raised while parsing or emitting wire formats.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// KISS byte stream ended inside an unterminated frame.
    #[error("KISS stream truncated mid-frame ({buffered} bytes buffered)")]
    KissTruncated {
        /// Bytes accumulated for the incomplete frame.
        buffered: usize,
    },

    /// AX.25 frame failed structural validation.
    #[error("malformed AX.25 frame: {detail}")]
    Ax25Malformed {
        /// What the validator tripped over.
        detail: &'static str,
    },

    /// First payload octet is not the RFMP magic byte.
    #[error("bad RFMP magic byte {found:#04x}")]
    BadMagic {
        /// The octet that was found instead of `0x52`.
        found: u8,
    },

    /// Version nibble does not match the protocol version we speak.
    #[error("unsupported RFMP version {found:#x}")]
    BadVersion {
        /// Version nibble carried by the frame.
        found: u8,
    },

    /// Type nibble names a frame type this implementation does not know.
    #[error("unknown RFMP frame type {found:#x}")]
    UnknownFrameType {
        /// Type nibble carried by the frame.
        found: u8,
    },

    /// Frame body is shorter than its layout requires.
    #[error("frame truncated: needed {needed} more bytes, {remaining} available")]
    Truncated {
        /// Bytes the current field still needs.
        needed: usize,
        /// Bytes left in the buffer.
        remaining: usize,
    },

    /// A text field is not valid UTF-8.
    #[error("{field} is not valid UTF-8")]
    BadUtf8 {
        /// Field name.
        field: &'static str,
    },

    /// A variable-length field exceeds its protocol limit.
    #[error("{field} too long: {len} bytes (max {max})")]
    FieldTooLong {
        /// Field name.
        field: &'static str,
        /// Actual length.
        len: usize,
        /// Protocol limit.
        max: usize,
    },

    /// Callsign text does not satisfy `CALL` / `CALL-N` rules.
    #[error("invalid callsign {text:?}: {detail}")]
    BadCallsign {
        /// Offending input.
        text: String,
        /// What rule it broke.
        detail: &'static str,
    },

    /// Channel name violates `[a-z0-9_-]{1,32}`.
    #[error("invalid channel name {text:?}")]
    BadChannel {
        /// Offending input.
        text: String,
    },

    /// Message id text is not valid hex of the accepted length.
    #[error("invalid message id {text:?}")]
    BadMessageId {
        /// Offending input.
        text: String,
    },

    /// FRAG header carried an impossible `seq`/`total` pair.
    #[error("invalid fragment header: seq {seq} of total {total}")]
    InvalidFragment {
        /// Fragment sequence number.
        seq: u8,
        /// Claimed fragment count.
        total: u8,
    },

    /// SYNC window advertises a bit-field size outside the accepted range.
    #[error("bloom m_log2 {found} outside supported range 6..=14")]
    BadWindowSize {
        /// Advertised `m_log2`.
        found: u8,
    },
}

/// Convenience alias used throughout the codec modules.
pub type Result<T> = std::result::Result<T, ProtocolError>;
