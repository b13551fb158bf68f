//! Transmit scheduling policy: CSMA deferral, adaptive delays, backoff.
//!
//! The durable queue and its priority ordering live in the store; this type
//! holds the transient air-access policy. Before a leased frame goes to the
//! wire we listen: carrier heard within the last 500 ms means defer by a
//! random 100-400 ms, up to five times, then the frame is dropped. Enqueue
//! delays spread transmissions by priority and by a congestion factor that
//! grows with consecutive deferrals and retries.

use crate::env::Environment;

/// Base slot for the adaptive enqueue delay.
pub const BASE_SLOT_MS: u64 = 500;

/// Carrier-detect window for the CSMA listen.
pub const CARRIER_WINDOW_MS: u64 = 500;

/// Minimum enforced gap between our own transmissions.
pub const MIN_TX_GAP_MS: u64 = 250;

/// CSMA deferrals before a frame is dropped.
pub const MAX_CSMA_DEFERS: u8 = 5;

/// Transmission attempts before a frame is dropped permanently.
pub const MAX_TX_ATTEMPTS: u8 = 5;

/// Retry backoff cap.
pub const MAX_NACK_DELAY_MS: u64 = 30_000;

/// What to do with a leased frame right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxDecision {
    /// Channel looks clear; hand the frame to the wire.
    Send,
    /// Carrier heard recently; hold the frame back this long.
    Defer {
        /// Backoff, ms.
        wait_ms: u64,
    },
    /// Too many deferrals; drop the frame.
    DropCsma,
}

/// Air-access policy state.
#[derive(Debug, Default)]
pub struct TxScheduler {
    last_carrier_ms: Option<u64>,
    last_tx_ms: Option<u64>,
    /// Consecutive deferral/retry events; cleared by a clean transmission.
    congestion: u32,
}

impl TxScheduler {
    /// Fresh scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// The receive side heard energy on the channel.
    pub fn carrier_activity(&mut self, now_ms: u64) {
        self.last_carrier_ms = Some(now_ms);
    }

    /// Delay to apply when enqueuing a frame:
    /// `base_slot x (1 + priority) x (1 + U(0,1) x congestion)`.
    pub fn enqueue_delay_ms<E: Environment>(&self, env: &E, priority: u8) -> u64 {
        let spread = 1.0 + env.random_unit() * f64::from(self.congestion);
        (BASE_SLOT_MS as f64 * f64::from(1 + priority) * spread) as u64
    }

    /// Milliseconds until the minimum inter-frame gap allows another send.
    pub fn gap_remaining_ms(&self, now_ms: u64) -> u64 {
        match self.last_tx_ms {
            Some(at) => (at + MIN_TX_GAP_MS).saturating_sub(now_ms),
            None => 0,
        }
    }

    /// CSMA listen for a leased frame that has deferred `defers` times.
    pub fn decide<E: Environment>(&mut self, env: &E, now_ms: u64, defers: u8) -> TxDecision {
        let carrier = self
            .last_carrier_ms
            .is_some_and(|at| now_ms.saturating_sub(at) < CARRIER_WINDOW_MS);
        if !carrier {
            return TxDecision::Send;
        }
        if defers >= MAX_CSMA_DEFERS {
            self.congestion += 1;
            return TxDecision::DropCsma;
        }
        self.congestion += 1;
        TxDecision::Defer { wait_ms: env.random_millis_in(100, 400) }
    }

    /// A frame made it to the wire cleanly.
    pub fn on_sent(&mut self, now_ms: u64) {
        self.last_tx_ms = Some(now_ms);
        self.congestion = 0;
    }

    /// A lower-level transmit failure; feeds the congestion estimate.
    pub fn on_tx_failure(&mut self) {
        self.congestion += 1;
    }

    /// Retry delay after the `attempts`-th failure: `2^attempts x 250 ms`,
    /// capped at 30 s.
    pub fn nack_delay_ms(attempts: u8) -> u64 {
        let shifted = 250u64.checked_shl(u32::from(attempts)).unwrap_or(MAX_NACK_DELAY_MS);
        shifted.min(MAX_NACK_DELAY_MS)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[derive(Clone)]
    struct FakeEnv;

    impl Environment for FakeEnv {
        fn monotonic_millis(&self) -> u64 {
            0
        }

        fn wall_clock_secs(&self) -> u64 {
            0
        }

        fn wall_clock_millis(&self) -> u64 {
            0
        }

        fn sleep(&self, _: Duration) -> impl std::future::Future<Output = ()> + Send {
            std::future::ready(())
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            buffer.fill(0x80);
        }
    }

    #[test]
    fn clear_channel_sends() {
        let mut sched = TxScheduler::new();
        assert_eq!(sched.decide(&FakeEnv, 1_000, 0), TxDecision::Send);
    }

    #[test]
    fn carrier_defers_then_drops() {
        let mut sched = TxScheduler::new();
        sched.carrier_activity(1_000);
        match sched.decide(&FakeEnv, 1_100, 0) {
            TxDecision::Defer { wait_ms } => assert!((100..400).contains(&wait_ms)),
            other => panic!("expected defer, got {other:?}"),
        }
        assert_eq!(sched.decide(&FakeEnv, 1_100, MAX_CSMA_DEFERS), TxDecision::DropCsma);
    }

    #[test]
    fn carrier_window_expires() {
        let mut sched = TxScheduler::new();
        sched.carrier_activity(1_000);
        assert_eq!(sched.decide(&FakeEnv, 1_000 + CARRIER_WINDOW_MS, 0), TxDecision::Send);
    }

    #[test]
    fn min_gap_enforced() {
        let mut sched = TxScheduler::new();
        assert_eq!(sched.gap_remaining_ms(0), 0);
        sched.on_sent(1_000);
        assert_eq!(sched.gap_remaining_ms(1_100), 150);
        assert_eq!(sched.gap_remaining_ms(1_250), 0);
    }

    #[test]
    fn enqueue_delay_scales_with_priority_and_congestion() {
        let mut sched = TxScheduler::new();
        // No congestion: delay is exactly base x (1 + priority).
        assert_eq!(sched.enqueue_delay_ms(&FakeEnv, 0), 500);
        assert_eq!(sched.enqueue_delay_ms(&FakeEnv, 3), 2_000);

        sched.carrier_activity(0);
        let _ = sched.decide(&FakeEnv, 100, 0);
        let congested = sched.enqueue_delay_ms(&FakeEnv, 0);
        assert!(congested > 500, "congestion should stretch the delay");

        sched.on_sent(200);
        assert_eq!(sched.enqueue_delay_ms(&FakeEnv, 0), 500);
    }

    #[test]
    fn nack_delay_doubles_to_cap() {
        assert_eq!(TxScheduler::nack_delay_ms(0), 250);
        assert_eq!(TxScheduler::nack_delay_ms(1), 500);
        assert_eq!(TxScheduler::nack_delay_ms(4), 4_000);
        assert_eq!(TxScheduler::nack_delay_ms(10), MAX_NACK_DELAY_MS);
        assert_eq!(TxScheduler::nack_delay_ms(255), MAX_NACK_DELAY_MS);
    }
}
