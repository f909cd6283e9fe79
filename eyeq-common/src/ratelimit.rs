use std::{
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        OnceLock,
    },
    time::Instant,
};

/// Gate for log statements that may fire once per packet.
///
/// Allows at most `burst` messages per `interval_us` window, across all threads. Modeled after the
/// kernel's `net_ratelimit` (10 messages every 5 seconds by default).
///
/// ```
/// use eyeq_common::RateLimitedLog;
///
/// static SEGMENT_FAILED: RateLimitedLog = RateLimitedLog::new(5_000_000, 10);
///
/// if SEGMENT_FAILED.allow() {
///     // tracing::warn!(...)
/// }
/// ```
#[derive(Debug)]
pub struct RateLimitedLog {
    interval_us: u64,
    burst: u32,
    window_start: AtomicU64,
    emitted: AtomicU32,
}

impl Default for RateLimitedLog {
    fn default() -> Self {
        Self::new(5_000_000, 10)
    }
}

impl RateLimitedLog {
    pub const fn new(interval_us: u64, burst: u32) -> Self {
        Self {
            interval_us,
            burst,
            window_start: AtomicU64::new(0),
            emitted: AtomicU32::new(0),
        }
    }

    /// Returns `true` if a message may be logged now.
    pub fn allow(&self) -> bool {
        self.allow_at(process_micros())
    }

    /// Returns `true` if a message may be logged at time `now` (µs).
    pub fn allow_at(&self, now: u64) -> bool {
        let start = self.window_start.load(Ordering::Relaxed);
        if now.saturating_sub(start) >= self.interval_us
            && self
                .window_start
                .compare_exchange(start, now, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            self.emitted.store(0, Ordering::Relaxed);
        }

        self.emitted.fetch_add(1, Ordering::Relaxed) < self.burst
    }
}

/// Microseconds since the first call in this process. Only used for log rate limiting, which does
/// not need to agree with any engine clock.
fn process_micros() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_micros() as u64
}
