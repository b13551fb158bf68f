//! Durable storage backends for the node runtime.
//!
//! The [`rfmp_core::Store`] contract is implemented here on top of redb;
//! the in-memory implementation used by tests and simulation ships with
//! `rfmp-core` itself.

mod redb;

pub use redb::RedbStore;
