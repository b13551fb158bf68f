//! Engine error types.
//!
//! Framing failures are counted and dropped inside the engine; the errors
//! here are the ones that cross the engine boundary to the host process.

use thiserror::Error;

use rfmp_proto::{MessageId, ProtocolError};

use crate::store::StoreError;

/// Errors surfaced by the protocol engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Configuration failed validation.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// TX queue is past the high-water mark; the caller may retry later.
    #[error("transmission queue full ({depth} entries)")]
    Backpressure {
        /// Queue depth at rejection time.
        depth: u64,
    },

    /// Persistent store failure (already retried once).
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Outbound frame could not be encoded.
    #[error("encode error: {0}")]
    Encode(#[from] ProtocolError),

    /// Carried id disagrees with the recomputed fingerprint.
    #[error("message id mismatch: expected {expected}, frame carried {actual}")]
    IdMismatch {
        /// Fingerprint recomputed from source, timestamp, and body.
        expected: MessageId,
        /// Id the frame carried.
        actual: MessageId,
    },

    /// MSG body is not valid UTF-8.
    #[error("message body is not valid UTF-8")]
    BodyNotUtf8,

    /// Submitted body exceeds the application limit.
    #[error("body too long: {len} bytes (max {max})")]
    BodyTooLong {
        /// Submitted length.
        len: usize,
        /// Application limit.
        max: usize,
    },

    /// Submitted `reply_to` is not a valid id or unique prefix.
    #[error("unresolvable reply_to reference {text:?}")]
    BadReplyTo {
        /// Offending input.
        text: String,
    },
}
