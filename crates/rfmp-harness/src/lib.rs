//! Deterministic simulation harness for the RFMP engine.
//!
//! Provides a virtual-clock, seeded-RNG [`SimEnv`] and a lossless broadcast
//! [`SimNet`] that pumps engines through the real KISS/AX.25/RFMP codecs.
//! Scenario tests (sync convergence, rate limiting, priority drainage,
//! restart recovery) live in this crate's `tests/` directory.

mod link;
mod sim_env;

pub use link::{SimNet, SimNode};
pub use sim_env::SimEnv;
