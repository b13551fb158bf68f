//! Production `Environment` implementation using system clocks and OS RNG.

use std::time::Duration;

use rfmp_core::Environment;

/// Production environment.
///
/// Monotonic time comes from a process-start `Instant` baseline, wall time
/// from `SystemTime`, randomness from getrandom, and async sleep from Tokio.
///
/// # Panics
///
/// Panics if the OS RNG fails or the system clock reads before the Unix
/// epoch; neither is a state worth limping along in.
#[derive(Clone)]
pub struct SystemEnv {
    started: std::time::Instant,
}

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    #[allow(clippy::disallowed_methods)]
    pub fn new() -> Self {
        Self { started: std::time::Instant::now() }
    }
}

impl Default for SystemEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment for SystemEnv {
    #[allow(clippy::disallowed_methods)]
    fn monotonic_millis(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    #[allow(clippy::disallowed_methods)]
    #[allow(clippy::expect_used)]
    fn wall_clock_secs(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("invariant: system clock is after Unix epoch (1970-01-01)")
            .as_secs()
    }

    #[allow(clippy::disallowed_methods)]
    #[allow(clippy::expect_used)]
    fn wall_clock_millis(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("invariant: system clock is after Unix epoch (1970-01-01)")
            .as_millis() as u64
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer).expect("invariant: OS RNG failure is unrecoverable");
    }
}
