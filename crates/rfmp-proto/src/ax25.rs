//! AX.25 Unnumbered-Information frame codec.
//!
//! Only the UI subset is implemented: an address field of destination,
//! source, and up to eight digipeaters (seven octets each, end-of-address
//! marked by the low bit of the final SSID octet), control byte `0x03`,
//! PID `0xF0` (no layer 3), then the information field.
//!
//! The digipeater path is carried through on receive but never interpreted.

use bytes::Bytes;

use crate::callsign::{AX25_ADDR_LEN, Callsign};
use crate::error::{ProtocolError, Result};

/// Control byte for UI frames.
pub const CONTROL_UI: u8 = 0x03;

/// PID byte marking "no layer 3 protocol".
pub const PID_NO_L3: u8 = 0xF0;

/// Maximum number of digipeaters in the address field.
pub const MAX_DIGIPEATERS: usize = 8;

/// A decoded (or to-be-encoded) AX.25 UI frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UiFrame {
    /// Destination address (RFMP uses a fixed group callsign).
    pub dest: Callsign,
    /// Transmitting station.
    pub source: Callsign,
    /// Digipeater path, copied through untouched.
    pub digipeaters: Vec<Callsign>,
    /// Information field.
    pub info: Bytes,
}

impl UiFrame {
    /// Build a UI frame with an empty digipeater path.
    pub fn new(dest: Callsign, source: Callsign, info: impl Into<Bytes>) -> Self {
        Self { dest, source, digipeaters: Vec::new(), info: info.into() }
    }

    /// Encode to link-layer bytes (without KISS framing).
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::FieldTooLong`] when more than eight
    /// digipeaters are present.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.digipeaters.len() > MAX_DIGIPEATERS {
            return Err(ProtocolError::FieldTooLong {
                field: "digipeater path",
                len: self.digipeaters.len(),
                max: MAX_DIGIPEATERS,
            });
        }

        let addr_count = 2 + self.digipeaters.len();
        let mut out = Vec::with_capacity(addr_count * AX25_ADDR_LEN + 2 + self.info.len());
        out.extend_from_slice(&self.dest.encode_ax25(false));
        let source_last = self.digipeaters.is_empty();
        out.extend_from_slice(&self.source.encode_ax25(source_last));
        for (i, digi) in self.digipeaters.iter().enumerate() {
            let last = i + 1 == self.digipeaters.len();
            out.extend_from_slice(&digi.encode_ax25(last));
        }
        out.push(CONTROL_UI);
        out.push(PID_NO_L3);
        out.extend_from_slice(&self.info);
        Ok(out)
    }

    /// Decode link-layer bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Ax25Malformed`] when the end-of-address bit
    /// is never set, the address field is not a multiple of seven octets,
    /// the path exceeds eight digipeaters, or the control/PID bytes do not
    /// identify a UI frame.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut addresses = Vec::with_capacity(2);
        let mut offset = 0usize;
        loop {
            if addresses.len() > 2 + MAX_DIGIPEATERS {
                return Err(ProtocolError::Ax25Malformed { detail: "too many addresses" });
            }
            let block: &[u8; AX25_ADDR_LEN] = bytes
                .get(offset..offset + AX25_ADDR_LEN)
                .and_then(|s| s.try_into().ok())
                .ok_or(ProtocolError::Ax25Malformed {
                    detail: "end-of-address bit never set",
                })?;
            let (callsign, last) = Callsign::decode_ax25(block)?;
            addresses.push(callsign);
            offset += AX25_ADDR_LEN;
            if last {
                break;
            }
        }

        if addresses.len() < 2 {
            return Err(ProtocolError::Ax25Malformed { detail: "missing source address" });
        }

        let control = *bytes
            .get(offset)
            .ok_or(ProtocolError::Ax25Malformed { detail: "missing control byte" })?;
        let pid = *bytes
            .get(offset + 1)
            .ok_or(ProtocolError::Ax25Malformed { detail: "missing PID byte" })?;
        if control != CONTROL_UI || pid != PID_NO_L3 {
            return Err(ProtocolError::Ax25Malformed { detail: "control/PID mismatch" });
        }

        let info = Bytes::copy_from_slice(&bytes[offset + 2..]);
        let mut iter = addresses.into_iter();
        // INVARIANT: length checked above.
        let dest = iter.next().ok_or(ProtocolError::Ax25Malformed { detail: "missing dest" })?;
        let source =
            iter.next().ok_or(ProtocolError::Ax25Malformed { detail: "missing source" })?;
        Ok(Self { dest, source, digipeaters: iter.collect(), info })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cs(text: &str) -> Callsign {
        Callsign::parse(text).unwrap()
    }

    #[test]
    fn round_trip_no_digis() {
        let frame = UiFrame::new(cs("RFMP"), cs("N0CALL-1"), Bytes::from_static(b"payload"));
        let encoded = frame.encode().unwrap();
        assert_eq!(encoded[14], CONTROL_UI);
        assert_eq!(encoded[15], PID_NO_L3);
        let decoded = UiFrame::decode(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn round_trip_with_digis() {
        let mut frame = UiFrame::new(cs("RFMP"), cs("N0CALL-1"), Bytes::from_static(b"x"));
        frame.digipeaters = vec![cs("WIDE1-1"), cs("WIDE2-2")];
        let decoded = UiFrame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn rejects_missing_end_bit() {
        let frame = UiFrame::new(cs("RFMP"), cs("N0CALL"), Bytes::new());
        let mut encoded = frame.encode().unwrap();
        encoded[13] &= !0x01;
        assert_eq!(
            UiFrame::decode(&encoded),
            Err(ProtocolError::Ax25Malformed { detail: "end-of-address bit never set" })
        );
    }

    #[test]
    fn rejects_non_ui_control() {
        let frame = UiFrame::new(cs("RFMP"), cs("N0CALL"), Bytes::new());
        let mut encoded = frame.encode().unwrap();
        encoded[14] = 0x3F;
        assert_eq!(
            UiFrame::decode(&encoded),
            Err(ProtocolError::Ax25Malformed { detail: "control/PID mismatch" })
        );
    }

    #[test]
    fn rejects_ragged_address_field() {
        let frame = UiFrame::new(cs("RFMP"), cs("N0CALL"), Bytes::new());
        let encoded = frame.encode().unwrap();
        // Chop mid-address: decoder runs out of bytes before the end bit.
        assert!(UiFrame::decode(&encoded[..10]).is_err());
    }
}
