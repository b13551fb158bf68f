//! Simulated environment: virtual clock plus seeded RNG.
//!
//! All engines in one simulation share the same clock handle, so time
//! advances for everyone at once and a test drives it explicitly. The RNG
//! is ChaCha8 from a fixed seed; a failing run replays exactly.

#![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic in test code")]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

use rfmp_core::Environment;

struct SimInner {
    now_ms: u64,
    rng: ChaCha8Rng,
}

/// Deterministic [`Environment`] for simulation.
///
/// Cloning shares the clock and RNG, which is exactly what a multi-engine
/// simulation wants: one timeline, one replayable randomness stream.
#[derive(Clone)]
pub struct SimEnv {
    inner: Arc<Mutex<SimInner>>,
}

impl SimEnv {
    /// Environment starting at the given wall-clock second.
    pub fn with_seed(seed: u64, start_secs: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimInner {
                now_ms: start_secs * 1000,
                rng: ChaCha8Rng::seed_from_u64(seed),
            })),
        }
    }

    /// Advance virtual time.
    pub fn advance(&self, ms: u64) {
        let mut inner = self.inner.lock().expect("sim clock mutex");
        inner.now_ms += ms;
    }
}

impl Environment for SimEnv {
    fn monotonic_millis(&self) -> u64 {
        self.inner.lock().expect("sim clock mutex").now_ms
    }

    fn wall_clock_secs(&self) -> u64 {
        self.monotonic_millis() / 1000
    }

    fn wall_clock_millis(&self) -> u64 {
        self.monotonic_millis()
    }

    /// Virtual sleep: simulation time only moves via [`SimEnv::advance`],
    /// so this resolves immediately.
    fn sleep(&self, _duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        std::future::ready(())
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        let mut inner = self.inner.lock().expect("sim clock mutex");
        inner.rng.fill_bytes(buffer);
    }
}
