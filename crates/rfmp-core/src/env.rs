//! Environment abstraction for deterministic testing.
//!
//! Decouples protocol logic from system resources (time, randomness). The
//! engine never touches the system clock directly; production wires in a
//! real-time implementation while the simulation harness drives a virtual
//! clock and a seeded RNG.

use std::time::Duration;

/// Abstract environment providing time, randomness, and async sleep.
///
/// Implementations MUST guarantee:
///
/// - `monotonic_millis()` never decreases within one execution context.
/// - `wall_clock_millis() / 1000 == wall_clock_secs()` at every instant.
/// - `random_bytes()` is uniform; it need not be cryptographic (nothing here
///   is secret — salts and jitter only need to decorrelate nodes).
pub trait Environment: Clone + Send + Sync + 'static {
    /// Milliseconds on a monotonic clock. Used for scheduling intervals
    /// (CSMA windows, sync suppression, token refill).
    fn monotonic_millis(&self) -> u64;

    /// Wall-clock seconds since the Unix epoch. Used for protocol
    /// timestamps and everything that must survive a restart.
    fn wall_clock_secs(&self) -> u64;

    /// Wall-clock milliseconds since the Unix epoch. Used for durable
    /// scheduling state (the transmission queue).
    fn wall_clock_millis(&self) -> u64;

    /// Sleeps for the specified duration.
    ///
    /// This is the only async method in the trait, and only driver code
    /// (not protocol logic) may call it.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fills the provided buffer with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generates a random `u32` (window salts).
    fn random_u32(&self) -> u32 {
        let mut bytes = [0u8; 4];
        self.random_bytes(&mut bytes);
        u32::from_be_bytes(bytes)
    }

    /// Generates a random `u64`.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    /// Uniform value in `[0, 1)` for jitter and congestion spreading.
    fn random_unit(&self) -> f64 {
        // 53 significant bits, the full precision of an f64 mantissa.
        (self.random_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Uniform value in `[lo, hi)` milliseconds.
    fn random_millis_in(&self, lo: u64, hi: u64) -> u64 {
        debug_assert!(lo < hi);
        lo + (self.random_unit() * (hi - lo) as f64) as u64
    }
}
