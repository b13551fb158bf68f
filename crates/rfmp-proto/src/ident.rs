//! Content-addressed message identifiers.
//!
//! A message id is the first six bytes of
//! `SHA-256(callsign ‖ 0x1F ‖ be32(timestamp) ‖ 0x1F ‖ body)` over the
//! canonical callsign text. Displayed as 12 lowercase hex characters; lookups
//! accept a prefix of eight or more hex characters.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::callsign::Callsign;
use crate::error::{ProtocolError, Result};

/// Field separator inside the fingerprint preimage.
const SEP: u8 = 0x1F;

/// Raw length of a message id.
pub const ID_LEN: usize = 6;

/// Shortest accepted hex prefix for id lookups.
pub const MIN_PREFIX_LEN: usize = 8;

/// Six-byte content fingerprint identifying a message.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MessageId([u8; ID_LEN]);

impl MessageId {
    /// Compute the fingerprint of `(from_node, timestamp, body)`.
    ///
    /// This binds a message's identity to its originating node, its wall
    /// clock second, and its exact body bytes; changing any of the three
    /// yields a different id.
    pub fn fingerprint(from_node: &Callsign, timestamp: u32, body: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(from_node.to_string().as_bytes());
        hasher.update([SEP]);
        hasher.update(timestamp.to_be_bytes());
        hasher.update([SEP]);
        hasher.update(body);
        let digest = hasher.finalize();
        let mut id = [0u8; ID_LEN];
        id.copy_from_slice(&digest[..ID_LEN]);
        Self(id)
    }

    /// Wrap raw id bytes.
    pub fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    /// The raw id bytes.
    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// Full 12-character lowercase hex form.
    pub fn to_hex(&self) -> String {
        self.to_string()
    }

    /// Parse the full 12-character hex form.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::BadMessageId`] unless the input is exactly
    /// twelve hex characters.
    pub fn parse_hex(text: &str) -> Result<Self> {
        if text.len() != ID_LEN * 2 {
            return Err(ProtocolError::BadMessageId { text: text.to_string() });
        }
        let mut bytes = [0u8; ID_LEN];
        for (i, byte) in bytes.iter_mut().enumerate() {
            let pair = &text[i * 2..i * 2 + 2];
            *byte = u8::from_str_radix(pair, 16)
                .map_err(|_| ProtocolError::BadMessageId { text: text.to_string() })?;
        }
        Ok(Self(bytes))
    }

    /// Whether `prefix` (≥ 8 hex chars, case-insensitive) matches this id.
    pub fn matches_prefix(&self, prefix: &str) -> bool {
        if prefix.len() < MIN_PREFIX_LEN || prefix.len() > ID_LEN * 2 {
            return false;
        }
        let full = self.to_hex();
        prefix.chars().zip(full.chars()).all(|(p, f)| p.to_ascii_lowercase() == f)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({self})")
    }
}

impl TryFrom<String> for MessageId {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse_hex(&value)
    }
}

impl From<MessageId> for String {
    fn from(value: MessageId) -> Self {
        value.to_hex()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cs(text: &str) -> Callsign {
        Callsign::parse(text).unwrap()
    }

    // Fixed vectors: first 6 bytes of
    // SHA-256(callsign ++ 0x1F ++ be32(ts) ++ 0x1F ++ body), hex-encoded.
    #[test]
    fn fingerprint_vectors() {
        let cases = [
            ("N0CALL-1", 1_700_000_000u32, &b"hello"[..], "816e692578e8"),
            ("K7ABC", 1_700_000_123, &b"anybody on tonight?"[..], "7e849d49f3b7"),
            ("N0CALL-1", 1_700_000_000, &b"hello!"[..], "beb075ce034a"),
            ("N0CALL", 0, &b""[..], "2f4157add8a1"),
        ];
        for (call, ts, body, expected) in cases {
            let id = MessageId::fingerprint(&cs(call), ts, body);
            assert_eq!(id.to_hex(), expected, "vector for {call}/{ts}");
        }
    }

    #[test]
    fn fingerprint_sensitivity() {
        let base = MessageId::fingerprint(&cs("N0CALL-1"), 100, b"hi");
        assert_ne!(base, MessageId::fingerprint(&cs("N0CALL-2"), 100, b"hi"));
        assert_ne!(base, MessageId::fingerprint(&cs("N0CALL-1"), 101, b"hi"));
        assert_ne!(base, MessageId::fingerprint(&cs("N0CALL-1"), 100, b"ho"));
    }

    #[test]
    fn hex_round_trip() {
        let id = MessageId::fingerprint(&cs("N0CALL"), 42, b"body");
        let parsed = MessageId::parse_hex(&id.to_hex()).unwrap();
        assert_eq!(parsed, id);
        assert!(MessageId::parse_hex("816e692578e").is_err());
        assert!(MessageId::parse_hex("zz6e692578e8").is_err());
    }

    #[test]
    fn prefix_matching() {
        let id = MessageId::parse_hex("816e692578e8").unwrap();
        assert!(id.matches_prefix("816e6925"));
        assert!(id.matches_prefix("816E6925"));
        assert!(id.matches_prefix("816e692578e8"));
        // Too short to be unambiguous.
        assert!(!id.matches_prefix("816e692"));
        assert!(!id.matches_prefix("826e6925"));
        assert!(!id.matches_prefix("816e692578e8ff"));
    }
}
