//! RFMP wire formats.
//!
//! This crate holds the three framing layers between a TNC byte stream and
//! the protocol engine, bottom up:
//!
//! - [`kiss`]: KISS byte stuffing and frame delimiting on the TNC link.
//! - [`ax25`]: AX.25 UI frames — addresses, control/PID, information field.
//! - [`frame`]: the RFMP frame codec (MSG, FRAG, SYNC, REQ) plus the
//!   content-addressed [`MessageId`] scheme.
//!
//! Everything here is a pure codec: no I/O, no clocks, no storage. Wire
//! layouts are normative and bit-exact; all multi-byte integers are
//! big-endian.

pub mod ax25;
pub mod callsign;
mod error;
pub mod frame;
pub mod ident;
pub mod kiss;

pub use ax25::UiFrame;
pub use callsign::Callsign;
pub use error::{ProtocolError, Result};
pub use frame::{Frame, FragFrame, MsgFrame, Priority, ReqFrame, SyncFrame, WindowDigest};
pub use ident::MessageId;
