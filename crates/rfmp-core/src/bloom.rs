//! Rotating Bloom windows for anti-entropy sync.
//!
//! Three windows each cover `W` seconds; together they summarize every
//! message id accepted in the last `3W` seconds. A window is characterized
//! by `(opened_at, salt, k, m)`; the salt is fresh-random on open so two
//! cooperating nodes never collide on hash positions across windows. Bit
//! positions come from SipHash-2-4 keyed by `(salt, i)` for `i in 0..k`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use rfmp_proto::frame::sip_bucket;
use rfmp_proto::{MessageId, WindowDigest};

/// One Bloom window, persisted across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BloomWindow {
    /// Slot 0-2 in the rotation.
    pub index: u8,
    /// UTC second the window opened.
    pub opened_at: u32,
    /// Per-window hash salt.
    pub salt: u32,
    /// Number of hash functions.
    pub k: u8,
    /// log2 of the bit count.
    pub m_log2: u8,
    /// The bit field, `2^m_log2 / 8` bytes.
    pub bits: Vec<u8>,
    /// Ids inserted since the window opened.
    pub count: u64,
}

impl BloomWindow {
    /// Open a fresh, empty window.
    pub fn open(index: u8, opened_at: u32, salt: u32, k: u8, m_log2: u8) -> Self {
        Self { index, opened_at, salt, k, m_log2, bits: vec![0u8; (1usize << m_log2) / 8], count: 0 }
    }

    /// Insert an id.
    pub fn insert(&mut self, id: &MessageId) {
        let m = 1usize << self.m_log2;
        for i in 0..self.k {
            let bit = sip_bucket(self.salt, i, id) % m;
            self.bits[bit / 8] |= 1 << (bit % 8);
        }
        self.count += 1;
    }

    /// Probable membership test.
    pub fn contains(&self, id: &MessageId) -> bool {
        let m = 1usize << self.m_log2;
        (0..self.k).all(|i| {
            let bit = sip_bucket(self.salt, i, id) % m;
            self.bits[bit / 8] & (1 << (bit % 8)) != 0
        })
    }

    /// Wire form for a SYNC frame.
    pub fn to_digest(&self) -> WindowDigest {
        WindowDigest {
            opened_at: self.opened_at,
            salt: self.salt,
            k: self.k,
            m_log2: self.m_log2,
            bits: Bytes::from(self.bits.clone()),
        }
    }

    /// Wire form folded down to `target_m_log2` bits.
    ///
    /// Bit positions are the low `m_log2` bits of the hash, so halving the
    /// filter is an OR of its halves; membership is preserved (only the
    /// false-positive rate rises). Lets a SYNC fit a small air MTU while
    /// the full-resolution window stays in memory.
    pub fn to_digest_folded(&self, target_m_log2: u8) -> WindowDigest {
        if target_m_log2 >= self.m_log2 {
            return self.to_digest();
        }
        let target_bytes = (1usize << target_m_log2) / 8;
        let mut bits = vec![0u8; target_bytes];
        for (i, b) in self.bits.iter().enumerate() {
            bits[i % target_bytes] |= b;
        }
        WindowDigest {
            opened_at: self.opened_at,
            salt: self.salt,
            k: self.k,
            m_log2: target_m_log2,
            bits: Bytes::from(bits),
        }
    }
}

/// The three-window rotation.
///
/// `current` always points at the window accepting inserts. Rotation
/// replaces the oldest window in place, so at any instant exactly three
/// windows exist and no insert can land in a discarded one.
#[derive(Debug, Clone)]
pub struct WindowSet {
    windows: [BloomWindow; 3],
    current: usize,
    window_secs: u32,
    k: u8,
    m_log2: u8,
}

impl WindowSet {
    /// Fresh rotation: the current window opens now, the other two are
    /// empty back-fills so a SYNC always carries three windows.
    pub fn fresh(now_secs: u32, window_secs: u32, k: u8, m_log2: u8, salts: [u32; 3]) -> Self {
        // Slot 2 is "previous" and slot 1 "oldest" relative to current = 0,
        // matching the rotation order (next slot replaced is current + 1).
        let windows = [
            BloomWindow::open(0, now_secs, salts[0], k, m_log2),
            BloomWindow::open(1, now_secs.saturating_sub(window_secs * 2), salts[1], k, m_log2),
            BloomWindow::open(2, now_secs.saturating_sub(window_secs), salts[2], k, m_log2),
        ];
        Self { windows, current: 0, window_secs, k, m_log2 }
    }

    /// Restore a persisted rotation if it is still within the sync horizon;
    /// otherwise start fresh.
    pub fn restore(
        persisted: Vec<BloomWindow>,
        now_secs: u32,
        window_secs: u32,
        k: u8,
        m_log2: u8,
        salts: [u32; 3],
    ) -> Self {
        let newest = persisted.iter().map(|w| w.opened_at).max();
        match newest {
            Some(opened) if persisted.len() == 3 && now_secs.saturating_sub(opened) < window_secs => {
                let mut windows = [
                    BloomWindow::open(0, 0, salts[0], k, m_log2),
                    BloomWindow::open(1, 0, salts[1], k, m_log2),
                    BloomWindow::open(2, 0, salts[2], k, m_log2),
                ];
                let mut current = 0;
                for w in persisted {
                    let index = (w.index % 3) as usize;
                    if w.opened_at == opened {
                        current = index;
                    }
                    windows[index] = w;
                }
                Self { windows, current, window_secs, k, m_log2 }
            },
            _ => Self::fresh(now_secs, window_secs, k, m_log2, salts),
        }
    }

    /// Insert an id into the current window.
    pub fn insert(&mut self, id: &MessageId) {
        self.windows[self.current].insert(id);
    }

    /// Rotate if the current window has aged past `W`.
    ///
    /// Replaces the oldest window with a fresh one and makes it current.
    /// Returns `true` if a rotation happened; `salt` is consumed only then.
    pub fn maybe_rotate(&mut self, now_secs: u32, salt: u32) -> bool {
        let current_opened = self.windows[self.current].opened_at;
        if now_secs.saturating_sub(current_opened) < self.window_secs {
            return false;
        }
        let next = (self.current + 1) % 3;
        self.windows[next] = BloomWindow::open(
            next as u8,
            // Align the new window on the tick boundary, not the sweep time.
            current_opened.saturating_add(self.window_secs),
            salt,
            self.k,
            self.m_log2,
        );
        self.current = next;
        true
    }

    /// The window accepting inserts.
    pub fn current(&self) -> &BloomWindow {
        &self.windows[self.current]
    }

    /// All three windows, newest first.
    pub fn windows(&self) -> [&BloomWindow; 3] {
        let a = self.current;
        let b = (self.current + 2) % 3;
        let c = (self.current + 1) % 3;
        [&self.windows[a], &self.windows[b], &self.windows[c]]
    }

    /// Wire digests for a SYNC frame, newest first.
    pub fn digests(&self) -> Vec<WindowDigest> {
        self.windows().iter().map(|w| w.to_digest()).collect()
    }

    /// Wire digests folded to `emit_m_log2` bits per window.
    pub fn digests_folded(&self, emit_m_log2: u8) -> Vec<WindowDigest> {
        self.windows().iter().map(|w| w.to_digest_folded(emit_m_log2)).collect()
    }

    /// Total ids inserted across the rotation.
    pub fn population(&self) -> u64 {
        self.windows.iter().map(|w| w.count).sum()
    }

    /// Locate the local window matching a remote `opened_at`, rounded to
    /// the nearest window width. `None` means disjoint sync horizons.
    pub fn find_matching(&self, remote_opened_at: u32) -> Option<&BloomWindow> {
        let half = self.window_secs / 2;
        self.windows
            .iter()
            .find(|w| w.opened_at.abs_diff(remote_opened_at) <= half)
    }

    /// Width of one window in seconds.
    pub fn window_secs(&self) -> u32 {
        self.window_secs
    }
}
