//! Amateur radio callsigns and their AX.25 address encoding.
//!
//! A callsign is 1-6 uppercase ASCII letters/digits plus an optional SSID
//! 0-15. The canonical text form is `CALL` for SSID 0 and `CALL-N` otherwise.
//! On the air each address occupies seven octets: six characters left-shifted
//! by one bit (space-padded) followed by the SSID octet, whose low bit marks
//! the end of the address field.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Octets of one encoded AX.25 address.
pub const AX25_ADDR_LEN: usize = 7;

/// A validated callsign with SSID.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Callsign {
    call: [u8; 6],
    len: u8,
    ssid: u8,
}

impl Callsign {
    /// Parse the canonical `CALL` / `CALL-N` text form.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::BadCallsign`] when the base is empty, longer
    /// than six characters, contains anything but uppercase ASCII letters and
    /// digits, or the SSID is outside 0..=15.
    pub fn parse(text: &str) -> Result<Self> {
        let (base, ssid) = match text.split_once('-') {
            Some((base, ssid_text)) => {
                let ssid = ssid_text.parse::<u8>().map_err(|_| ProtocolError::BadCallsign {
                    text: text.to_string(),
                    detail: "SSID is not a number",
                })?;
                (base, ssid)
            },
            None => (text, 0),
        };

        if base.is_empty() || base.len() > 6 {
            return Err(ProtocolError::BadCallsign {
                text: text.to_string(),
                detail: "base must be 1-6 characters",
            });
        }
        if !base.bytes().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit()) {
            return Err(ProtocolError::BadCallsign {
                text: text.to_string(),
                detail: "base must be uppercase ASCII letters or digits",
            });
        }
        if ssid > 15 {
            return Err(ProtocolError::BadCallsign {
                text: text.to_string(),
                detail: "SSID must be 0-15",
            });
        }

        let mut call = [b' '; 6];
        call[..base.len()].copy_from_slice(base.as_bytes());
        Ok(Self { call, len: base.len() as u8, ssid })
    }

    /// Build a callsign from a base and an explicit SSID.
    pub fn with_ssid(base: &str, ssid: u8) -> Result<Self> {
        let mut cs = Self::parse(base)?;
        if cs.ssid != 0 {
            return Err(ProtocolError::BadCallsign {
                text: base.to_string(),
                detail: "base may not itself carry an SSID",
            });
        }
        if ssid > 15 {
            return Err(ProtocolError::BadCallsign {
                text: base.to_string(),
                detail: "SSID must be 0-15",
            });
        }
        cs.ssid = ssid;
        Ok(cs)
    }

    /// Base portion without the SSID.
    pub fn base(&self) -> &str {
        // INVARIANT: `call` was copied from a validated ASCII &str.
        std::str::from_utf8(&self.call[..self.len as usize]).unwrap_or("")
    }

    /// The SSID, 0-15.
    pub fn ssid(&self) -> u8 {
        self.ssid
    }

    /// Encode as a 7-octet AX.25 address.
    ///
    /// `last` sets the end-of-address bit, which belongs on the final address
    /// of the header.
    pub fn encode_ax25(&self, last: bool) -> [u8; AX25_ADDR_LEN] {
        let mut out = [b' ' << 1; AX25_ADDR_LEN];
        for (i, b) in self.call.iter().enumerate() {
            out[i] = b << 1;
        }
        out[6] = 0x60 | (self.ssid << 1) | u8::from(last);
        out
    }

    /// Decode a 7-octet AX.25 address.
    ///
    /// Returns the callsign and whether the end-of-address bit was set.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Ax25Malformed`] when the unshifted characters
    /// are not uppercase ASCII letters, digits, or padding spaces.
    pub fn decode_ax25(bytes: &[u8; AX25_ADDR_LEN]) -> Result<(Self, bool)> {
        let mut call = [b' '; 6];
        let mut len = 0u8;
        let mut in_pad = false;
        for (i, raw) in bytes[..6].iter().enumerate() {
            let ch = raw >> 1;
            if ch == b' ' {
                in_pad = true;
                continue;
            }
            if in_pad || !(ch.is_ascii_uppercase() || ch.is_ascii_digit()) {
                return Err(ProtocolError::Ax25Malformed { detail: "invalid callsign characters" });
            }
            call[i] = ch;
            len = (i + 1) as u8;
        }
        if len == 0 {
            return Err(ProtocolError::Ax25Malformed { detail: "empty callsign" });
        }
        let ssid = (bytes[6] >> 1) & 0x0F;
        let last = bytes[6] & 0x01 == 0x01;
        Ok((Self { call, len, ssid }, last))
    }
}

impl fmt::Display for Callsign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ssid == 0 {
            write!(f, "{}", self.base())
        } else {
            write!(f, "{}-{}", self.base(), self.ssid)
        }
    }
}

impl fmt::Debug for Callsign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callsign({self})")
    }
}

impl std::str::FromStr for Callsign {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Callsign {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Callsign> for String {
    fn from(value: Callsign) -> Self {
        value.to_string()
    }
}
