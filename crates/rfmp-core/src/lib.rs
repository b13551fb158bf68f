//! RFMP protocol engine.
//!
//! Sits between decoded AX.25 UI frames (see `rfmp-proto`) and a persistent
//! message store. The engine itself is Sans-IO: a synchronous state machine
//! that the runtime drives with events and polls for work. Production glue
//! (Tokio loops, the TNC socket, the redb store) lives in `rfmp-node`; a
//! deterministic simulation driver lives in `rfmp-harness`.
//!
//! Modules, leaves first:
//!
//! - [`env`]: injected clock and randomness.
//! - [`config`]: the typed configuration surface.
//! - [`message`] / [`metrics`]: domain records, events, counters.
//! - [`store`]: the persistence contract and an in-memory implementation.
//! - [`bloom`] / [`seen`] / [`fragment`]: rotating sync windows, dedup
//!   cache, fragmentation.
//! - [`sync`] / [`txsched`]: anti-entropy and air-access policy.
//! - [`engine`]: the orchestrator tying it all together.

pub mod bloom;
pub mod config;
pub mod engine;
pub mod env;
mod error;
pub mod fragment;
pub mod message;
pub mod metrics;
pub mod seen;
pub mod store;
pub mod sync;
pub mod txsched;

pub use config::{Config, ConfigError};
pub use engine::{Engine, Submission, TxPoll};
pub use env::Environment;
pub use error::EngineError;
pub use message::{ChannelInfo, Message, MessageFilter, NodeEvent, NodeInfo, Status};
pub use metrics::Counters;
pub use store::{InsertOutcome, MemoryStore, Store, StoreError};
