//! # Audio Ingress Throttle
//!
//! Rate-limits inbound binary audio frames per client connection to bound
//! upstream call volume and protect the provider quota. Upstream STT providers
//! bill and rate-limit per audio chunk, so frames beyond the per-minute cap
//! are dropped outright — never queued or delayed, which would only add
//! end-to-end latency without improving throughput.

use std::time::{Duration, Instant};

/// Per-connection sliding counter of audio frames admitted in the current
/// window. Owned by the connection's relay actor, so no locking is needed.
#[derive(Debug)]
pub struct ThrottleWindow {
    /// Maximum number of frames admitted per window
    cap: u32,

    /// Window length (60 seconds in production, shorter in tests)
    window: Duration,

    /// Frames admitted since the current window started
    count: u32,

    /// When the current window started
    window_start: Instant,
}

impl ThrottleWindow {
    pub fn new(cap: u32, window: Duration) -> Self {
        Self {
            cap,
            window,
            count: 0,
            window_start: Instant::now(),
        }
    }

    /// Throttle with the standard 60-second window.
    pub fn per_minute(cap: u32) -> Self {
        Self::new(cap, Duration::from_secs(60))
    }

    /// Decide whether a frame may be forwarded upstream.
    ///
    /// Returns `true` and increments the counter while the cap has not been
    /// reached in the current window; `false` once it has (the caller drops
    /// the frame). Empty frames are rejected unconditionally before counting.
    pub fn admit(&mut self, frame_len: usize) -> bool {
        self.admit_at(frame_len, Instant::now())
    }

    /// Clock-injected variant of [`admit`](Self::admit) so tests can step
    /// time deterministically.
    pub fn admit_at(&mut self, frame_len: usize, now: Instant) -> bool {
        if frame_len == 0 {
            return false;
        }

        if now.duration_since(self.window_start) >= self.window {
            self.window_start = now;
            self.count = 0;
        }

        if self.count >= self.cap {
            return false;
        }

        self.count += 1;
        true
    }

    /// Frames admitted in the current window (for metrics snapshots).
    pub fn admitted_in_window(&self) -> u32 {
        self.count
    }

    /// Explicitly reset the window (used when a session is torn down and the
    /// connection object is reused for accounting).
    pub fn reset(&mut self) {
        self.count = 0;
        self.window_start = Instant::now();
    }
}
